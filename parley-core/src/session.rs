// ABOUTME: Per-message dispatch state: addressing, resolved argv, observed entities
// ABOUTME: Sessions are created by the dispatcher and tracked by the session registry

use crate::argv::Argv;
use crate::dispatcher::Dispatcher;
use crate::entity::{flags, EntityKey, EntityKind, Observed};
use crate::error::DispatchError;
use crate::prefix::Addressing;
use crate::suggest::SuggestionKey;
use crate::sync::lock;
use crate::traits::{IncomingMessage, MessagingPlatform, QuotedMessage};
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Where a message is in its dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchState {
    #[default]
    Admitted,
    Preprocessing,
    Resolved,
    Executing,
    Unresolved,
    MiddlewareChain,
    Completed,
    Flushed,
}

#[derive(Default)]
struct State {
    addressing: Addressing,
    reply: Option<QuotedMessage>,
    argv: Option<Argv>,
    // Strong so changes made after the cache evicts an entity still reach
    // the end-of-dispatch flush
    user: Option<Arc<Observed>>,
    channel: Option<Arc<Observed>>,
    phase: DispatchState,
}

/// One inbound message on its way through the middleware chain
pub struct Session {
    pub id: Uuid,
    pub message: IncomingMessage,
    platform: Arc<dyn MessagingPlatform>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<State>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("platform", &self.message.platform_id)
            .field("channel", &self.message.channel_id)
            .field("user", &self.message.user_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        mut message: IncomingMessage,
        platform: Arc<dyn MessagingPlatform>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        if message.self_id.is_empty() {
            message.self_id = platform.bot_user_id().to_string();
        }
        Self {
            id: Uuid::new_v4(),
            message,
            platform,
            dispatcher,
            state: Mutex::new(State::default()),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn platform(&self) -> &Arc<dyn MessagingPlatform> {
        &self.platform
    }

    pub fn is_private(&self) -> bool {
        self.message.is_private()
    }

    pub fn self_id(&self) -> &str {
        &self.message.self_id
    }

    pub fn state(&self) -> DispatchState {
        lock(&self.state).phase
    }

    pub(crate) fn set_state(&self, phase: DispatchState) {
        lock(&self.state).phase = phase;
    }

    /// Command prefix that was stripped, if any
    pub fn prefix(&self) -> Option<String> {
        lock(&self.state).addressing.prefix.clone()
    }

    /// Mention or nickname addressed the bot
    pub fn appel(&self) -> bool {
        lock(&self.state).addressing.appel
    }

    /// Platform self-mention markup addressed the bot
    pub fn mentioned(&self) -> bool {
        lock(&self.state).addressing.mentioned
    }

    /// Text after addressing was stripped
    pub fn parsed(&self) -> String {
        lock(&self.state).addressing.parsed.clone()
    }

    pub(crate) fn set_addressing(&self, addressing: Addressing) {
        lock(&self.state).addressing = addressing;
    }

    /// The message this one quotes
    pub fn reply(&self) -> Option<QuotedMessage> {
        lock(&self.state).reply.clone()
    }

    pub(crate) fn set_reply(&self, reply: Option<QuotedMessage>) {
        lock(&self.state).reply = reply;
    }

    pub fn argv(&self) -> Option<Argv> {
        lock(&self.state).argv.clone()
    }

    pub(crate) fn set_argv(&self, argv: Argv) {
        lock(&self.state).argv = Some(argv);
    }

    pub fn user(&self) -> Option<Arc<Observed>> {
        lock(&self.state).user.clone()
    }

    pub fn channel(&self) -> Option<Arc<Observed>> {
        lock(&self.state).channel.clone()
    }

    /// Load the sender's record with at least `fields` (plus `flag` and
    /// `authority`). The record is flushed when the dispatch completes.
    pub async fn observe_user(&self, fields: &[String]) -> Result<Arc<Observed>, DispatchError> {
        let user = self
            .observe(EntityKind::User, &self.message.user_id, fields)
            .await?;
        lock(&self.state).user = Some(user.clone());
        Ok(user)
    }

    /// Load the channel's record with at least `fields` (plus `flag` and
    /// `assignee`). Only meaningful for group messages.
    pub async fn observe_channel(
        &self,
        fields: &[String],
    ) -> Result<Arc<Observed>, DispatchError> {
        let channel = self
            .observe(EntityKind::Channel, &self.message.channel_id, fields)
            .await?;
        lock(&self.state).channel = Some(channel.clone());
        Ok(channel)
    }

    async fn observe(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &[String],
    ) -> Result<Arc<Observed>, DispatchError> {
        let cache = self.dispatcher.cache().ok_or(DispatchError::NoStorage)?;
        let mut wanted: Vec<String> = kind.base_fields().iter().map(|f| f.to_string()).collect();
        for field in fields {
            if !wanted.contains(field) {
                wanted.push(field.clone());
            }
        }
        let key = EntityKey::new(kind, self.message.platform_id.as_str(), id);
        cache.observe(key, &wanted).await
    }

    /// Send text to the session's channel.
    ///
    /// Channels flagged silent swallow the message.
    pub async fn send(&self, text: &str) -> Result<(), DispatchError> {
        if self.channel().is_some_and(|c| c.has_flag(flags::SILENT)) {
            tracing::debug!(session = %self.id, "Channel is silent, dropping reply");
            return Ok(());
        }
        self.platform
            .send(&self.message.channel_id, text)
            .await
            .map_err(|e| DispatchError::Adapter(format!("{e:#}")))
    }

    /// Send text, logging instead of failing when the adapter errors
    pub async fn respond(&self, text: &str) {
        if let Err(err) = self.send(text).await {
            tracing::warn!(
                session = %self.id,
                channel = %self.message.channel_id,
                error = %err,
                "Failed to send reply"
            );
        }
    }

    pub fn suggestion_key(&self) -> SuggestionKey {
        SuggestionKey {
            platform: self.message.platform_id.clone(),
            channel: self.message.channel_id.clone(),
            user: self.message.user_id.clone(),
        }
    }
}
