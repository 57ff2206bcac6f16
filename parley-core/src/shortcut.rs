// ABOUTME: Pattern-triggered aliases that map free text straight to a command invocation
// ABOUTME: Literal shortcuts with fuzzy/prefix/greedy modifiers and regex shortcuts with $N captures

use crate::argv::{tokenize, Argv, OptionValue};
use crate::command::CommandRegistry;
use crate::error::DispatchError;
use regex::Regex;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub enum ShortcutPattern {
    Literal(String),
    Regex(Regex),
}

/// Session facts a shortcut may require
#[derive(Debug, Clone, Copy, Default)]
pub struct ShortcutContext {
    /// Mention or nickname addressed the bot
    pub appel: bool,
    /// A command prefix was stripped
    pub prefixed: bool,
    /// The message quoted another message
    pub has_reply: bool,
}

#[derive(Debug, Clone)]
pub struct Shortcut {
    pub pattern: ShortcutPattern,
    /// Target command name
    pub command: String,
    /// Literal patterns may be followed by more text
    pub fuzzy: bool,
    /// Only applies when the bot was addressed by mention, nickname or prefix
    pub prefix: bool,
    /// Only applies when the message quotes another message
    pub reply: bool,
    /// Remaining text becomes a single positional argument
    pub greedy: bool,
    pub args: Vec<String>,
    pub options: BTreeMap<String, OptionValue>,
}

impl Shortcut {
    pub fn literal(text: &str, command: &str) -> Self {
        Self::with_pattern(ShortcutPattern::Literal(text.to_string()), command)
    }

    pub fn regex(pattern: &str, command: &str) -> Result<Self, DispatchError> {
        Ok(Self::with_pattern(
            ShortcutPattern::Regex(Regex::new(pattern)?),
            command,
        ))
    }

    fn with_pattern(pattern: ShortcutPattern, command: &str) -> Self {
        Self {
            pattern,
            command: command.to_lowercase(),
            fuzzy: false,
            prefix: false,
            reply: false,
            greedy: false,
            args: Vec::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn fuzzy(mut self) -> Self {
        self.fuzzy = true;
        self
    }

    pub fn prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn reply(mut self) -> Self {
        self.reply = true;
        self
    }

    pub fn greedy(mut self) -> Self {
        self.greedy = true;
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn option(mut self, name: &str, value: impl Into<OptionValue>) -> Self {
        self.options.insert(name.to_string(), value.into());
        self
    }

    pub fn describe(&self) -> String {
        match &self.pattern {
            ShortcutPattern::Literal(text) => text.clone(),
            ShortcutPattern::Regex(re) => format!("/{}/", re.as_str()),
        }
    }

    /// Try this shortcut against `content`. On a match the returned vector
    /// has its command, args and options filled.
    pub fn try_match(
        &self,
        content: &str,
        ctx: ShortcutContext,
        commands: &CommandRegistry,
    ) -> Option<Argv> {
        if self.prefix && !(ctx.appel || ctx.prefixed) {
            return None;
        }
        if self.reply && !ctx.has_reply {
            return None;
        }
        let command = commands.get(&self.command)?;

        match &self.pattern {
            ShortcutPattern::Literal(text) => {
                let remainder = if self.fuzzy {
                    content.strip_prefix(text.as_str())?
                } else if content == text {
                    ""
                } else {
                    return None;
                };
                if self.fuzzy
                    && !ctx.appel
                    && remainder.chars().next().is_some_and(|c| !c.is_whitespace())
                {
                    return None;
                }

                let remainder = remainder.trim();
                let (parsed_options, parsed_args) = if self.greedy {
                    let args = if remainder.is_empty() {
                        Vec::new()
                    } else {
                        vec![remainder.to_string()]
                    };
                    (BTreeMap::new(), args)
                } else {
                    command.parse(&tokenize(remainder))
                };

                let mut options = self.options.clone();
                options.extend(parsed_options);
                let mut args = self.args.clone();
                args.extend(parsed_args);

                Some(Argv {
                    tokens: tokenize(content),
                    command: Some(command),
                    options,
                    args,
                    ..Argv::default()
                })
            }
            ShortcutPattern::Regex(re) => {
                let caps = re.captures(content)?;
                let groups: Vec<Option<&str>> =
                    caps.iter().map(|m| m.map(|m| m.as_str())).collect();

                let args = self
                    .args
                    .iter()
                    .map(|arg| substitute_captures(arg, &groups))
                    .collect();
                let options = self
                    .options
                    .iter()
                    .map(|(name, value)| {
                        let value = match value {
                            OptionValue::Text(text) => {
                                OptionValue::Text(substitute_captures(text, &groups))
                            }
                            other => other.clone(),
                        };
                        (name.clone(), value)
                    })
                    .collect();

                Some(Argv {
                    tokens: tokenize(content),
                    command: Some(command),
                    options,
                    args,
                    ..Argv::default()
                })
            }
        }
    }
}

/// Replace `$1`..`$9` in `source` with capture groups.
///
/// `groups[0]` is the whole match. `$$` produces a literal `$`. `$0` and
/// groups the pattern does not have are left as written; a group that did
/// not participate in the match becomes empty. Inserted text is never
/// scanned again.
pub fn substitute_captures(source: &str, groups: &[Option<&str>]) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some(d @ '1'..='9') => {
                let index = d as usize - '0' as usize;
                if index < groups.len() {
                    chars.next();
                    out.push_str(groups[index].unwrap_or_default());
                } else {
                    out.push('$');
                }
            }
            _ => out.push('$'),
        }
    }

    out
}
