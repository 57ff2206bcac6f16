// ABOUTME: Collaborator traits at the dispatcher's boundary
// ABOUTME: Inbound platform adapters and the structured-query storage backend

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use tokio_stream::Stream;

// =============================================================================
// Inbound Messages
// =============================================================================

/// Where a message was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSubtype {
    /// One-to-one conversation with the bot
    Private,
    /// Shared channel with other participants
    Group,
}

/// Normalized message delivered by an adapter. Immutable once received.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Which platform this message came from (e.g., "console", "discord")
    pub platform_id: String,
    /// The channel this message was sent in
    pub channel_id: String,
    /// The sender
    pub user_id: String,
    /// The bot account that received it
    pub self_id: String,
    pub subtype: MessageSubtype,
    /// Raw message text
    pub content: String,
    /// Platform-specific message id
    pub message_id: String,
    /// Timestamp in seconds since Unix epoch
    pub timestamp: i64,
}

impl IncomingMessage {
    pub fn new(
        platform_id: impl Into<String>,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        subtype: MessageSubtype,
        content: impl Into<String>,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            self_id: String::new(),
            subtype,
            content: content.into(),
            message_id: String::new(),
            timestamp: 0,
        }
    }

    pub fn with_self_id(mut self, self_id: impl Into<String>) -> Self {
        self.self_id = self_id.into();
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn is_private(&self) -> bool {
        self.subtype == MessageSubtype::Private
    }
}

/// A previously sent message, fetched when a new message quotes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotedMessage {
    pub message_id: String,
    pub user_id: String,
    pub content: String,
}

/// Stream of incoming messages from a platform
pub type EventStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

// =============================================================================
// Platform Adapter
// =============================================================================

/// Inbound adapter interface.
///
/// Every chat platform implements this. The dispatcher only ever sends text
/// back and fetches quoted messages; everything else stays in the adapter.
#[async_trait]
pub trait MessagingPlatform: Send + Sync {
    /// Stream of incoming messages
    async fn event_stream(&self) -> Result<EventStream>;

    /// Send text to a channel
    async fn send(&self, channel_id: &str, content: &str) -> Result<()>;

    /// Fetch a message referenced by a quote marker
    async fn get_message(&self, channel_id: &str, message_id: &str) -> Result<QuotedMessage>;

    /// The bot's own user id on this platform
    fn bot_user_id(&self) -> &str;

    /// Platform identifier (e.g., "console", "discord")
    fn platform_id(&self) -> &str;

    /// Check if a user id is the bot itself
    fn is_self(&self, user_id: &str) -> bool {
        user_id == self.bot_user_id()
    }

    /// Markup that mentions `user_id` at the start of a message
    fn mention(&self, user_id: &str) -> String {
        format!("<at:{user_id}>")
    }

    /// Split a leading quote marker off `text`, returning the quoted message id
    /// and the remaining text.
    fn split_quote<'a>(&self, text: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = text.strip_prefix("<quote:")?;
        let end = rest.find('>')?;
        let id = &rest[..end];
        if id.is_empty() {
            return None;
        }
        Some((id, rest[end + 1..].trim_start()))
    }

    /// Gracefully shut down the platform connection
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Tables the dispatcher reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    User,
    Channel,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::User => "user",
            Table::Channel => "channel",
        }
    }
}

/// A row as exchanged with storage
pub type Row = serde_json::Map<String, Value>;

/// Structured query: a conjunction of field equality predicates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    predicates: Vec<(String, Value)>,
}

impl Query {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().and(field, value)
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push((field.into(), value.into()));
        self
    }

    pub fn predicates(&self) -> &[(String, Value)] {
        &self.predicates
    }

    /// Value a predicate requires for `field`, if any
    pub fn value_of(&self, field: &str) -> Option<&Value> {
        self.predicates
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.predicates
            .iter()
            .all(|(field, value)| row.get(field) == Some(value))
    }
}

/// Storage interface. The concrete engine lives outside the core.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch rows matching `query`, projected to `fields` (an empty list means all)
    async fn get(&self, table: Table, query: &Query, fields: &[String]) -> Result<Vec<Row>>;

    /// Apply `patch` to every row matching `query`
    async fn set(&self, table: Table, query: &Query, patch: &Row) -> Result<()>;

    /// Insert a new row and return it as stored
    async fn create(&self, table: Table, row: Row) -> Result<Row>;
}

/// Keep only the requested fields of a row
pub fn project(row: &Row, fields: &[String]) -> Row {
    if fields.is_empty() {
        return row.clone();
    }
    row.iter()
        .filter(|(key, _)| fields.iter().any(|f| f == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct QuotingPlatform;

    #[async_trait]
    impl MessagingPlatform for QuotingPlatform {
        async fn event_stream(&self) -> Result<EventStream> {
            Ok(Box::pin(tokio_stream::empty()))
        }

        async fn send(&self, _channel_id: &str, _content: &str) -> Result<()> {
            Ok(())
        }

        async fn get_message(&self, _channel_id: &str, _message_id: &str) -> Result<QuotedMessage> {
            anyhow::bail!("no history")
        }

        fn bot_user_id(&self) -> &str {
            "bot"
        }

        fn platform_id(&self) -> &str {
            "test"
        }
    }

    #[test]
    fn test_split_quote_extracts_id_and_rest() {
        let platform = QuotingPlatform;
        assert_eq!(
            platform.split_quote("<quote:42>  <at:alice> hi"),
            Some(("42", "<at:alice> hi"))
        );
    }

    #[test]
    fn test_split_quote_ignores_plain_text() {
        let platform = QuotingPlatform;
        assert_eq!(platform.split_quote("hello <quote:1>"), None);
        assert_eq!(platform.split_quote("<quote:>x"), None);
        assert_eq!(platform.split_quote("<quote:7"), None);
    }

    #[test]
    fn test_default_mention_and_is_self() {
        let platform = QuotingPlatform;
        assert_eq!(platform.mention("bot"), "<at:bot>");
        assert!(platform.is_self("bot"));
        assert!(!platform.is_self("alice"));
    }

    #[test]
    fn test_query_matches_all_predicates() {
        let query = Query::eq("platform", "console").and("id", "alice");
        let mut row = Row::new();
        row.insert("platform".into(), json!("console"));
        row.insert("id".into(), json!("alice"));
        row.insert("authority".into(), json!(1));
        assert!(query.matches(&row));

        row.insert("id".into(), json!("bob"));
        assert!(!query.matches(&row));
        assert_eq!(query.value_of("platform"), Some(&json!("console")));
    }

    #[test]
    fn test_project_keeps_requested_fields() {
        let mut row = Row::new();
        row.insert("flag".into(), json!(0));
        row.insert("authority".into(), json!(2));
        let projected = project(&row, &["authority".to_string()]);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get("authority"), Some(&json!(2)));
        assert_eq!(project(&row, &[]).len(), 2);
    }
}
