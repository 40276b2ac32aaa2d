//! Conversation context handed to providers, and fitting it into a model window.

use serde::{Deserialize, Serialize};

/// Rough characters-per-token ratio used for budget estimates.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message in provider wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The context window cannot hold even the pinned parts of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOverflow {
    pub needed: usize,
    pub window: usize,
}

/// System instructions plus the running history of a task.
///
/// The system message and the newest turn are pinned; older turns are dropped
/// first when the context does not fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    system: String,
    turns: Vec<ChatMessage>,
}

impl PromptContext {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            turns: Vec::new(),
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(ChatMessage::new(Role::User, content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(ChatMessage::new(Role::Assistant, content));
    }

    /// Messages that fit in `window` tokens while reserving `reserve` for the reply.
    pub fn fit(&self, window: usize, reserve: usize) -> Result<Vec<ChatMessage>, ContextOverflow> {
        let budget = window.saturating_sub(reserve);
        let system_cost = estimate_tokens(&self.system);
        let costs: Vec<usize> = self
            .turns
            .iter()
            .map(|turn| estimate_tokens(&turn.content))
            .collect();

        let mut total = system_cost + costs.iter().sum::<usize>();
        let mut first_kept = 0;
        // Keep the newest turn no matter what.
        while total > budget && first_kept + 1 < self.turns.len() {
            total -= costs[first_kept];
            first_kept += 1;
        }
        if total > budget {
            return Err(ContextOverflow {
                needed: total + reserve,
                window,
            });
        }

        let mut messages = Vec::with_capacity(self.turns.len() - first_kept + 1);
        messages.push(ChatMessage::new(Role::System, self.system.clone()));
        messages.extend(self.turns[first_kept..].iter().cloned());
        Ok(messages)
    }
}

/// Estimate tokens as ceil(chars / 4).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with_turns(turns: &[&str]) -> PromptContext {
        let mut context = PromptContext::new("s".repeat(40));
        for (idx, turn) in turns.iter().enumerate() {
            if idx % 2 == 0 {
                context.push_user(*turn);
            } else {
                context.push_assistant(*turn);
            }
        }
        context
    }

    #[test]
    fn everything_fits_in_a_large_window() {
        let context = context_with_turns(&["first", "second", "third"]);
        let messages = context.fit(10_000, 100).expect("fits");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
    }

    #[test]
    fn oldest_turns_are_dropped_first() {
        let old = "o".repeat(400);
        let context = context_with_turns(&[&old, "middle", "newest"]);
        // system = 10 tokens, old = 100, middle = 2, newest = 2
        let messages = context.fit(50, 20).expect("fits after dropping");
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1], "middle");
        assert_eq!(contents[2], "newest");
    }

    #[test]
    fn newest_turn_is_never_dropped() {
        let newest = "n".repeat(400);
        let context = context_with_turns(&["a", "b", &newest]);
        let err = context.fit(50, 10).unwrap_err();
        assert_eq!(err.window, 50);
        assert!(err.needed > 50);
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
