// ABOUTME: Dispatcher configuration: addressing patterns, cache bounds and behaviour toggles
// ABOUTME: Deserialisable from the [dispatcher] table of the application config

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A config value that may be written as one string or a list of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    One(String),
    Many(Vec<String>),
}

impl Default for StringList {
    fn default() -> Self {
        StringList::Many(Vec::new())
    }
}

impl StringList {
    /// Non-empty entries. An empty string means "nothing configured".
    pub fn to_vec(&self) -> Vec<String> {
        let items: Vec<&String> = match self {
            StringList::One(item) => vec![item],
            StringList::Many(items) => items.iter().collect(),
        };
        items
            .into_iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect()
    }
}

impl From<&str> for StringList {
    fn from(value: &str) -> Self {
        StringList::One(value.to_string())
    }
}

impl From<Vec<&str>> for StringList {
    fn from(values: Vec<&str>) -> Self {
        StringList::Many(values.into_iter().map(String::from).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Command prefixes such as "!" or "/"
    pub prefix: StringList,
    /// Names the bot answers to at the start of a message
    pub nickname: StringList,
    /// Apply the default text normalisation before matching
    pub normalize: bool,
    /// Seconds a cached user stays fresh
    pub user_cache_age: u64,
    /// Seconds a cached channel stays fresh
    pub channel_cache_age: u64,
    pub user_cache_length: usize,
    pub channel_cache_length: usize,
    /// Minimum similarity (0..1) for "did you mean" suggestions
    pub similarity_coefficient: f64,
    /// Append the middleware call chain to logged handler failures
    pub pretty_errors: bool,
    /// Assign unclaimed channels to the receiving bot
    pub auto_assign: bool,
    /// Authority given to users seen for the first time
    pub auto_authorize: u32,
    /// Coalescing window for registry change broadcasts
    pub broadcast_debounce_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            prefix: StringList::default(),
            nickname: StringList::default(),
            normalize: true,
            user_cache_age: 60,
            channel_cache_age: 300,
            user_cache_length: 1000,
            channel_cache_length: 1000,
            similarity_coefficient: 0.4,
            pretty_errors: true,
            auto_assign: false,
            auto_authorize: 0,
            broadcast_debounce_ms: 250,
        }
    }
}

impl DispatcherConfig {
    pub fn prefixes(&self) -> Vec<String> {
        self.prefix.to_vec()
    }

    pub fn nicknames(&self) -> Vec<String> {
        self.nickname.to_vec()
    }

    pub fn user_cache_max_age(&self) -> Duration {
        Duration::from_secs(self.user_cache_age)
    }

    pub fn channel_cache_max_age(&self) -> Duration {
        Duration::from_secs(self.channel_cache_age)
    }

    pub fn broadcast_debounce(&self) -> Duration {
        Duration::from_millis(self.broadcast_debounce_ms)
    }
}
