// ABOUTME: Debounced push of registry snapshots to an outside observer
// ABOUTME: Bursts of command/middleware changes collapse into one snapshot per quiet window

use crate::dispatcher::Dispatcher;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a dispatcher currently has registered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub commands: Vec<String>,
    pub shortcuts: Vec<String>,
    pub middlewares: usize,
}

/// Receiver of registry snapshots (a dashboard, a log, a test)
#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn push(&self, snapshot: RegistrySnapshot) -> Result<()>;
}

/// Background task that coalesces registry changes.
///
/// The dispatcher signals every change on an unbounded queue. The task
/// waits for the first signal, keeps draining until the queue has been
/// quiet for the debounce window, then pushes a single snapshot.
pub struct RegistryBroadcaster {
    handle: JoinHandle<()>,
}

impl RegistryBroadcaster {
    pub fn spawn(dispatcher: &Arc<Dispatcher>, sink: Arc<dyn BroadcastSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.attach_broadcaster(tx);
        let debounce = dispatcher.config().broadcast_debounce();
        let handle = tokio::spawn(run(Arc::downgrade(dispatcher), rx, sink, debounce));
        tracing::debug!(debounce_ms = debounce.as_millis() as u64, "Registry broadcaster started");
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn run(
    dispatcher: Weak<Dispatcher>,
    mut rx: mpsc::UnboundedReceiver<()>,
    sink: Arc<dyn BroadcastSink>,
    debounce: Duration,
) {
    while rx.recv().await.is_some() {
        let mut closed = false;
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        let Some(snapshot) = dispatcher.upgrade().map(|d| d.snapshot()) else {
            break;
        };
        tracing::debug!(
            commands = snapshot.commands.len(),
            middlewares = snapshot.middlewares,
            "Broadcasting registry snapshot"
        );
        if let Err(err) = sink.push(snapshot).await {
            tracing::warn!(error = %err, "Failed to push registry snapshot");
        }
        if closed {
            break;
        }
    }
    tracing::debug!("Registry broadcaster stopped");
}
