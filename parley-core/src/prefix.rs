// ABOUTME: Addressing detection: self-mention, nickname and command-prefix stripping
// ABOUTME: Produces the appel flag, the matched prefix and the remaining parsed text

use crate::error::DispatchError;
use regex::Regex;

/// How a message addressed the bot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addressing {
    /// The message explicitly targeted the bot (mention or nickname)
    pub appel: bool,
    /// The message started with the platform's self-mention markup
    pub mentioned: bool,
    /// The command prefix literal that was stripped
    pub prefix: Option<String>,
    /// Text left after stripping
    pub parsed: String,
}

/// Compiled nickname and prefix patterns.
///
/// Rules apply in order and are mutually exclusive: self-mention, then
/// nickname, then prefix. No configured prefixes means the prefix rule never
/// matches.
#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    nickname: Option<Regex>,
    prefix: Option<Regex>,
}

impl PrefixMatcher {
    pub fn new(nicknames: &[String], prefixes: &[String]) -> Result<Self, DispatchError> {
        Ok(Self {
            nickname: leading_pattern(nicknames, "@?", r"([,，]\s*|\s+)")?,
            prefix: leading_pattern(prefixes, "", "")?,
        })
    }

    /// Strip addressing from `text`.
    ///
    /// `mention` is the platform markup for mentioning the bot; it only counts
    /// outside private conversations.
    pub fn strip(&self, text: &str, mention: &str, is_private: bool) -> Addressing {
        if !is_private && !mention.is_empty() {
            if let Some(rest) = text.strip_prefix(mention) {
                return Addressing {
                    appel: true,
                    mentioned: true,
                    prefix: None,
                    parsed: rest.trim_start().to_string(),
                };
            }
        }

        if let Some(found) = self.nickname.as_ref().and_then(|re| re.find(text)) {
            return Addressing {
                appel: true,
                mentioned: false,
                prefix: None,
                parsed: text[found.end()..].to_string(),
            };
        }

        if let Some(caps) = self.prefix.as_ref().and_then(|re| re.captures(text)) {
            if let Some(matched) = caps.get(1) {
                return Addressing {
                    appel: false,
                    mentioned: false,
                    prefix: Some(matched.as_str().to_string()),
                    parsed: text[matched.end()..].to_string(),
                };
            }
        }

        Addressing {
            parsed: text.to_string(),
            ..Addressing::default()
        }
    }
}

/// Anchored alternation of the escaped literals, longest first so that
/// "!!" wins over "!". Returns `None` when there is nothing to match.
fn leading_pattern(
    literals: &[String],
    before: &str,
    after: &str,
) -> Result<Option<Regex>, DispatchError> {
    let mut literals: Vec<&String> = literals.iter().filter(|s| !s.is_empty()).collect();
    if literals.is_empty() {
        return Ok(None);
    }
    literals.sort_by_key(|s| std::cmp::Reverse(s.chars().count()));
    let alternation = literals
        .iter()
        .map(|s| regex::escape(s))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!("^{before}({alternation}){after}");
    Ok(Some(Regex::new(&pattern)?))
}
