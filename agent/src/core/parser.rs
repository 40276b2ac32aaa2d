//! Response parser: raw model text to an ordered [`Plan`].
//!
//! The reply must carry exactly one JSON action document, either bare or in a
//! single fenced block tagged `json`. Prose around the fence becomes notes.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::types::{Action, Plan};

const ACTION_DOCUMENT_SCHEMA: &str = include_str!("../../schemas/action_document.schema.json");

static ACTION_DOCUMENT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(ACTION_DOCUMENT_SCHEMA).expect("bundled action schema is valid JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("bundled action schema compiles")
});

/// The reply could not be turned into a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActionDocument {
    actions: Vec<Action>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug)]
struct Fence {
    tag: String,
    /// Line index of the opening fence.
    open: usize,
    /// Line index of the closing fence.
    close: usize,
}

/// Parse a model reply into a plan.
pub fn parse(raw: &str) -> Result<Plan, ParseError> {
    let lines: Vec<&str> = raw.lines().collect();
    let fences = find_fences(&lines)?;
    let json_fences: Vec<&Fence> = fences
        .iter()
        .filter(|fence| fence.tag.eq_ignore_ascii_case("json"))
        .collect();

    match json_fences.as_slice() {
        [] => {
            let trimmed = raw.trim();
            if trimmed.starts_with('{') {
                parse_document(trimmed)
            } else {
                Err(ParseError::new("no action document found in reply"))
            }
        }
        [fence] => {
            let body = lines[fence.open + 1..fence.close].join("\n");
            let document = parse_document(&body)?;
            let before = lines[..fence.open].join("\n");
            let after = lines[fence.close + 1..].join("\n");

            let mut actions = Vec::with_capacity(document.actions.len() + 2);
            push_note(&mut actions, &before);
            actions.extend(document.actions);
            push_note(&mut actions, &after);
            Ok(Plan {
                actions,
                done: document.done,
            })
        }
        many => Err(ParseError::new(format!(
            "ambiguous reply: {} json blocks, expected exactly one",
            many.len()
        ))),
    }
}

fn find_fences(lines: &[&str]) -> Result<Vec<Fence>, ParseError> {
    let mut fences = Vec::new();
    let mut open: Option<(usize, String)> = None;
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("```") else {
            continue;
        };
        match open.take() {
            None => open = Some((idx, rest.trim().to_string())),
            Some((start, tag)) if rest.trim().is_empty() => fences.push(Fence {
                tag,
                open: start,
                close: idx,
            }),
            // An info-string line inside an open block is body text.
            Some(still_open) => open = Some(still_open),
        }
    }
    if let Some((start, tag)) = open {
        let label = if tag.is_empty() { "untagged" } else { tag.as_str() };
        return Err(ParseError::new(format!(
            "unterminated {label} block opened on line {}",
            start + 1
        )));
    }
    Ok(fences)
}

fn parse_document(text: &str) -> Result<Plan, ParseError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| ParseError::new(format!("invalid JSON in action document: {err}")))?;
    let violations: Vec<String> = ACTION_DOCUMENT_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !violations.is_empty() {
        return Err(ParseError::new(format!(
            "action document violates schema: {}",
            violations.join("; ")
        )));
    }
    let document: ActionDocument = serde_json::from_value(value)
        .map_err(|err| ParseError::new(format!("action document shape: {err}")))?;
    Ok(Plan {
        actions: document.actions,
        done: document.done,
    })
}

fn push_note(actions: &mut Vec<Action>, prose: &str) {
    let text = prose.trim();
    if !text.is_empty() {
        actions.push(Action::Note {
            text: text.to_string(),
        });
    }
}
