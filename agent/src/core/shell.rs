//! Small POSIX-style command-line lexer used for command screening.
//!
//! This does not execute or expand anything. It splits a command line into
//! pipeline segments, words and redirect targets, and records the shell
//! features that matter to the validator (substitution, background jobs).

use std::iter::Peekable;
use std::mem;
use std::str::Chars;

use thiserror::Error;

/// Commands that run another command given as their arguments.
const WRAPPERS: &[&str] = &[
    "env", "nohup", "nice", "time", "timeout", "xargs", "exec", "command", "builtin", "stdbuf",
];

/// Shells whose `-c` argument is itself a command line.
const SCRIPT_SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unbalanced {0} quote")]
    UnbalancedQuote(char),
    #[error("redirect without a target")]
    MissingRedirectTarget,
}

/// One shell word after quote removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub text: String,
    /// A `$` appeared outside single quotes, so the shell may expand it.
    pub expands: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Pipe,
    Or,
    And,
    Sequence,
    Background,
}

/// A simple command between control operators.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Segment {
    /// Operator joining this segment to the previous one.
    pub joined_by: Option<Operator>,
    pub words: Vec<Word>,
    /// File targets of `>`, `>>`, `<`, `&>` redirects.
    pub redirects: Vec<Word>,
}

impl Segment {
    fn is_empty(&self) -> bool {
        self.words.is_empty() && self.redirects.is_empty()
    }

    /// Index of the word that names the program actually run, looking through
    /// leading assignments and wrapper commands.
    fn executable_index(&self) -> Option<usize> {
        let mut behind_wrapper = false;
        for (idx, word) in self.words.iter().enumerate() {
            let text = word.text.as_str();
            if is_assignment(text) {
                continue;
            }
            if behind_wrapper
                && (text.starts_with('-') || text.starts_with(|c: char| c.is_ascii_digit()))
            {
                continue;
            }
            if WRAPPERS.contains(&basename(text)) {
                behind_wrapper = true;
                continue;
            }
            return Some(idx);
        }
        None
    }

    /// The word naming the program this segment runs.
    pub fn executable(&self) -> Option<&Word> {
        self.executable_index().map(|idx| &self.words[idx])
    }

    /// Basename of the program this segment runs.
    pub fn executable_name(&self) -> Option<&str> {
        self.executable().map(|word| basename(&word.text))
    }

    /// Script passed to `sh -c` (or another shell's `-c`), if any.
    pub fn inner_script(&self) -> Option<&str> {
        let idx = self.executable_index()?;
        if !SCRIPT_SHELLS.contains(&basename(&self.words[idx].text)) {
            return None;
        }
        let rest = &self.words[idx + 1..];
        let flag = rest.iter().position(|word| {
            let text = word.text.as_str();
            text.starts_with('-') && !text.starts_with("--") && text.contains('c')
        })?;
        rest.get(flag + 1).map(|word| word.text.as_str())
    }
}

/// A lexed command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandLine {
    pub segments: Vec<Segment>,
    /// `$(...)`, backticks, or `<(...)`/`>(...)` process substitution,
    /// including inside unquoted heredoc bodies.
    pub has_substitution: bool,
    /// A lone `&` control operator.
    pub has_background: bool,
}

/// Split `command` into segments.
pub fn split(command: &str) -> Result<CommandLine, LexError> {
    let mut lexer = Lexer {
        chars: command.chars().peekable(),
        line: CommandLine::default(),
        current: Segment::default(),
        word: String::new(),
        word_started: false,
        expands: false,
        quoted: false,
        pending: Pending::Word,
        heredocs: Vec::new(),
    };
    lexer.run()?;
    lexer.finish()
}

fn basename(text: &str) -> &str {
    text.rsplit('/').next().unwrap_or(text)
}

fn is_assignment(text: &str) -> bool {
    match text.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Word,
    RedirectTarget,
    HereDocDelimiter,
    HereString,
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: CommandLine,
    current: Segment,
    word: String,
    word_started: bool,
    expands: bool,
    /// The current word used quotes or a backslash escape.
    quoted: bool,
    pending: Pending,
    heredocs: Vec<HereDoc>,
}

/// A heredoc whose body starts after the current line.
struct HereDoc {
    delimiter: String,
    /// A quoted delimiter turns off expansion in the body.
    quoted: bool,
}

impl Lexer<'_> {
    fn run(&mut self) -> Result<(), LexError> {
        while let Some(ch) = self.chars.next() {
            match ch {
                '\n' => {
                    self.end_segment(Operator::Sequence)?;
                    self.consume_heredoc_bodies();
                }
                c if c.is_whitespace() => self.end_word(),
                ';' => self.end_segment(Operator::Sequence)?,
                '\'' => self.single_quoted()?,
                '"' => self.double_quoted()?,
                '\\' => {
                    self.quoted = true;
                    if let Some(next) = self.chars.next()
                        && next != '\n'
                    {
                        self.push(next);
                    }
                }
                '`' => {
                    self.line.has_substitution = true;
                    self.push(ch);
                }
                '$' => {
                    self.expands = true;
                    if self.chars.peek() == Some(&'(') {
                        self.line.has_substitution = true;
                    }
                    self.push(ch);
                }
                '#' if !self.word_started => {
                    while self.chars.next_if(|c| *c != '\n').is_some() {}
                }
                '(' | ')' => self.end_word(),
                '|' => {
                    if self.chars.next_if_eq(&'|').is_some() {
                        self.end_segment(Operator::Or)?;
                    } else {
                        self.chars.next_if_eq(&'&');
                        self.end_segment(Operator::Pipe)?;
                    }
                }
                '&' => {
                    if self.chars.next_if_eq(&'&').is_some() {
                        self.end_segment(Operator::And)?;
                    } else if self.chars.next_if_eq(&'>').is_some() {
                        self.end_word();
                        self.chars.next_if_eq(&'>');
                        self.pending = Pending::RedirectTarget;
                    } else {
                        self.line.has_background = true;
                        self.end_segment(Operator::Background)?;
                    }
                }
                '<' | '>' => {
                    if self.chars.peek() == Some(&'(') {
                        self.line.has_substitution = true;
                        self.end_word();
                        continue;
                    }
                    let fd_prefix = !self.word.is_empty()
                        && self.word.chars().all(|c| c.is_ascii_digit());
                    if fd_prefix {
                        self.word.clear();
                        self.word_started = false;
                    } else {
                        self.end_word();
                    }
                    self.redirect(ch);
                }
                _ => self.push(ch),
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<CommandLine, LexError> {
        self.end_word();
        if self.pending != Pending::Word {
            return Err(LexError::MissingRedirectTarget);
        }
        if !self.current.is_empty() {
            self.line.segments.push(self.current);
        }
        Ok(self.line)
    }

    fn push(&mut self, ch: char) {
        self.word.push(ch);
        self.word_started = true;
    }

    fn redirect(&mut self, op: char) {
        if op == '<' {
            if self.chars.next_if_eq(&'<').is_some() {
                if self.chars.next_if_eq(&'<').is_some() {
                    self.pending = Pending::HereString;
                } else {
                    self.chars.next_if_eq(&'-');
                    self.pending = Pending::HereDocDelimiter;
                }
                return;
            }
            self.chars.next_if_eq(&'>');
        } else if self.chars.next_if_eq(&'>').is_none() {
            self.chars.next_if_eq(&'|');
        }

        if self.chars.next_if_eq(&'&').is_some() {
            // `2>&1`, `>&-`: descriptor duplication, no file involved.
            let mut consumed = false;
            while self
                .chars
                .next_if(|c| c.is_ascii_digit() || *c == '-')
                .is_some()
            {
                consumed = true;
            }
            if consumed {
                return;
            }
        }
        self.pending = Pending::RedirectTarget;
    }

    fn single_quoted(&mut self) -> Result<(), LexError> {
        self.word_started = true;
        self.quoted = true;
        loop {
            match self.chars.next() {
                None => return Err(LexError::UnbalancedQuote('\'')),
                Some('\'') => return Ok(()),
                Some(c) => self.word.push(c),
            }
        }
    }

    fn double_quoted(&mut self) -> Result<(), LexError> {
        self.word_started = true;
        self.quoted = true;
        loop {
            match self.chars.next() {
                None => return Err(LexError::UnbalancedQuote('"')),
                Some('"') => return Ok(()),
                Some('\\') => match self.chars.next() {
                    Some(c @ ('$' | '`' | '"' | '\\')) => self.word.push(c),
                    Some('\n') => {}
                    Some(c) => {
                        self.word.push('\\');
                        self.word.push(c);
                    }
                    None => return Err(LexError::UnbalancedQuote('"')),
                },
                Some('$') => {
                    self.expands = true;
                    if self.chars.peek() == Some(&'(') {
                        self.line.has_substitution = true;
                    }
                    self.word.push('$');
                }
                Some('`') => {
                    self.line.has_substitution = true;
                    self.word.push('`');
                }
                Some(c) => self.word.push(c),
            }
        }
    }

    fn end_word(&mut self) {
        if !self.word_started {
            return;
        }
        let word = Word {
            text: mem::take(&mut self.word),
            expands: mem::take(&mut self.expands),
        };
        let quoted = mem::take(&mut self.quoted);
        self.word_started = false;
        match mem::replace(&mut self.pending, Pending::Word) {
            Pending::Word => self.current.words.push(word),
            Pending::RedirectTarget => self.current.redirects.push(word),
            Pending::HereDocDelimiter => self.heredocs.push(HereDoc {
                delimiter: word.text,
                quoted,
            }),
            Pending::HereString => {}
        }
    }

    fn end_segment(&mut self, op: Operator) -> Result<(), LexError> {
        self.end_word();
        if self.pending != Pending::Word {
            return Err(LexError::MissingRedirectTarget);
        }
        let finished = mem::replace(
            &mut self.current,
            Segment {
                joined_by: Some(op),
                ..Segment::default()
            },
        );
        if !finished.is_empty() {
            self.line.segments.push(finished);
        }
        Ok(())
    }

    /// Heredoc bodies are data, not commands. Unquoted bodies still run
    /// command substitutions, so those are recorded.
    fn consume_heredoc_bodies(&mut self) {
        for heredoc in mem::take(&mut self.heredocs) {
            loop {
                let mut line = String::new();
                let mut saw_any = false;
                for c in self.chars.by_ref() {
                    saw_any = true;
                    if c == '\n' {
                        break;
                    }
                    line.push(c);
                }
                if !saw_any || line.trim() == heredoc.delimiter {
                    break;
                }
                if !heredoc.quoted && has_substitution(&line) {
                    self.line.has_substitution = true;
                }
            }
        }
    }
}

/// `$(` or a backtick not escaped by a backslash.
fn has_substitution(text: &str) -> bool {
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '`' => return true,
            '$' if chars.peek() == Some(&'(') => return true,
            _ => {}
        }
    }
    false
}
