// ABOUTME: Parsed command vector: tokens, resolved command, options and positional args
// ABOUTME: Quote-aware whitespace tokenizer shared by resolution and shortcuts

use crate::command::Command;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// One whitespace-separated word of a command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub content: String,
    /// Came from a quoted span; never treated as an option
    pub quoted: bool,
}

impl Token {
    pub fn plain(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            quoted: false,
        }
    }
}

/// Split on whitespace, respecting single and double quotes
pub fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut quote_char = '"';

    for c in input.chars() {
        match c {
            '"' | '\'' if !in_quotes && current.is_empty() => {
                in_quotes = true;
                quoted = true;
                quote_char = c;
            }
            c if in_quotes && c == quote_char => {
                in_quotes = false;
                tokens.push(Token {
                    content: std::mem::take(&mut current),
                    quoted: true,
                });
                quoted = false;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(Token {
                        content: std::mem::take(&mut current),
                        quoted,
                    });
                }
                quoted = false;
            }
            _ => current.push(c),
        }
    }

    // An unterminated quote keeps what it collected
    if !current.is_empty() {
        tokens.push(Token {
            content: current,
            quoted,
        });
    }

    tokens
}

/// Value given to a command option
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl OptionValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OptionValue::Number(n) => Some(*n),
            OptionValue::Text(s) => s.parse().ok(),
            OptionValue::Flag(_) => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            OptionValue::Flag(b) => *b,
            OptionValue::Number(n) => *n != 0.0,
            OptionValue::Text(s) => !s.is_empty(),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Flag(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Number(value)
    }
}

/// A parsed command vector.
///
/// Built during resolution and read-only afterwards. `root` marks vectors
/// that came straight from an inbound message rather than from
/// `Dispatcher::execute`.
#[derive(Clone, Default)]
pub struct Argv {
    pub root: bool,
    pub tokens: Vec<Token>,
    pub command: Option<Arc<Command>>,
    pub options: BTreeMap<String, OptionValue>,
    pub args: Vec<String>,
    /// Owning session
    pub session: Option<Uuid>,
}

impl Argv {
    pub fn parse(text: &str) -> Self {
        Self {
            tokens: tokenize(text),
            ..Self::default()
        }
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    pub fn command_name(&self) -> Option<&str> {
        self.command.as_ref().map(|c| c.name.as_str())
    }
}

impl fmt::Debug for Argv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Argv")
            .field("root", &self.root)
            .field("tokens", &self.tokens)
            .field("command", &self.command_name())
            .field("options", &self.options)
            .field("args", &self.args)
            .field("session", &self.session)
            .finish()
    }
}
