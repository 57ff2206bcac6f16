// ABOUTME: Platform registry and the serve loop feeding inbound messages to the dispatcher
// ABOUTME: Merges adapter streams, drops duplicates and echoes, spawns one task per message

use crate::dispatcher::Dispatcher;
use crate::traits::{EventStream, IncomingMessage, MessagingPlatform};
use anyhow::Result;
use futures_util::stream::SelectAll;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Seen message ids kept for duplicate detection before the set is reset
pub const DEDUP_CAP: usize = 10_000;

/// How long `serve` waits for in-flight sessions once the streams end
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry of connected platforms.
/// Holds adapter instances, merges their event streams, and coordinates shutdown.
#[derive(Default)]
pub struct PlatformRegistry {
    platforms: HashMap<String, Arc<dyn MessagingPlatform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a platform under its `platform_id()`
    pub fn register(&mut self, platform: Arc<dyn MessagingPlatform>) {
        let id = platform.platform_id().to_string();
        self.platforms.insert(id, platform);
    }

    pub fn get(&self, platform_id: &str) -> Option<Arc<dyn MessagingPlatform>> {
        self.platforms.get(platform_id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn platform_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.platforms.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// One stream carrying the messages of every registered platform
    pub async fn merged_event_stream(&self) -> Result<EventStream> {
        let mut select_all = SelectAll::<EventStream>::new();
        for platform in self.platforms.values() {
            select_all.push(platform.event_stream().await?);
        }
        Ok(Box::pin(select_all))
    }

    /// Shut every platform down, giving up after ten seconds
    pub async fn shutdown(&self) {
        let futures: Vec<_> = self.platforms.values().map(|p| p.shutdown()).collect();
        let results = tokio::time::timeout(
            Duration::from_secs(10),
            futures_util::future::join_all(futures),
        )
        .await;
        match results {
            Ok(results) => {
                for err in results.into_iter().filter_map(Result::err) {
                    tracing::warn!(error = %err, "Platform shutdown failed");
                }
            }
            Err(_) => tracing::warn!("Timed out shutting down platforms"),
        }
    }
}

/// Counts reported when `serve` returns
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    pub dispatched: usize,
    pub duplicates: usize,
    pub own_messages: usize,
}

/// Recently seen (platform, message id) pairs
struct SeenMessages {
    ids: HashSet<(String, String)>,
}

impl SeenMessages {
    fn new() -> Self {
        Self { ids: HashSet::new() }
    }

    /// False if the message was seen before. Messages without an id are
    /// always new.
    fn insert(&mut self, message: &IncomingMessage) -> bool {
        if message.message_id.is_empty() {
            return true;
        }
        let key = (message.platform_id.clone(), message.message_id.clone());
        if self.ids.contains(&key) {
            return false;
        }
        if self.ids.len() >= DEDUP_CAP {
            self.ids.clear();
        }
        self.ids.insert(key);
        true
    }
}

/// Dispatch messages from every platform until all their streams end.
///
/// Each message runs on its own task so sessions never block each other.
/// When the streams end, in-flight sessions get `DRAIN_TIMEOUT` to finish
/// before the platforms are shut down.
pub async fn serve(dispatcher: Arc<Dispatcher>, platforms: &PlatformRegistry) -> Result<ServeSummary> {
    let mut stream = platforms.merged_event_stream().await?;
    let mut seen = SeenMessages::new();
    let mut tasks = JoinSet::new();
    let mut summary = ServeSummary::default();
    tracing::info!(platforms = ?platforms.platform_ids(), "Serving messages");

    while let Some(message) = stream.next().await {
        while tasks.try_join_next().is_some() {}

        let Some(platform) = platforms.get(&message.platform_id) else {
            tracing::warn!(platform = %message.platform_id, "Message from unregistered platform");
            continue;
        };
        if platform.is_self(&message.user_id) {
            summary.own_messages += 1;
            continue;
        }
        if !seen.insert(&message) {
            tracing::debug!(msg_id = %message.message_id, "Skipping duplicate message");
            summary.duplicates += 1;
            continue;
        }

        summary.dispatched += 1;
        let dispatcher = dispatcher.clone();
        tasks.spawn(async move {
            dispatcher.dispatch(message, platform).await;
        });
    }

    tracing::info!(in_flight = tasks.len(), "Event streams ended, draining sessions");
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "Dispatch task failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = tasks.len(), "Gave up waiting for in-flight sessions");
        tasks.abort_all();
    }

    platforms.shutdown().await;
    Ok(summary)
}
