// ABOUTME: Console platform adapter reading lines from stdin and printing replies
// ABOUTME: Slash directives switch between private and group chat, sender identity, and quoting

use crate::config::ConsoleConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parley_core::{EventStream, IncomingMessage, MessageSubtype, MessagingPlatform, QuotedMessage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Messages remembered for quoting
const HISTORY_LEN: usize = 200;

type LineSource = Box<dyn AsyncBufRead + Send + Unpin>;

#[derive(Debug, Clone)]
struct Mode {
    user_id: String,
    group: bool,
}

/// Shared between the reader task and the platform handle
struct Shared {
    self_id: String,
    channel_id: String,
    mode: Mutex<Mode>,
    history: Mutex<VecDeque<(String, QuotedMessage)>>,
    transcript: Mutex<Vec<String>>,
    next_id: AtomicU64,
    echo: bool,
}

impl Shared {
    fn next_message_id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn remember(&self, channel_id: &str, message: QuotedMessage) {
        if let Ok(mut history) = self.history.lock() {
            if history.len() >= HISTORY_LEN {
                history.pop_front();
            }
            history.push_back((channel_id.to_string(), message));
        }
    }

    fn print(&self, line: String) {
        if self.echo {
            println!("{line}");
        }
        if let Ok(mut transcript) = self.transcript.lock() {
            transcript.push(line);
        }
    }

    fn mode(&self) -> Mode {
        self.mode
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_mode(&self, update: impl FnOnce(&mut Mode)) {
        let mut mode = self.mode.lock().unwrap_or_else(|p| p.into_inner());
        update(&mut mode);
    }

    /// Turn one input line into a message, or handle it as a directive
    fn handle_line(&self, line: &str) -> Option<IncomingMessage> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        let mut content = line.to_string();
        if let Some(directive) = line.strip_prefix('/') {
            let (name, rest) = directive
                .split_once(char::is_whitespace)
                .map(|(n, r)| (n, r.trim()))
                .unwrap_or((directive, ""));
            match name {
                "group" => {
                    self.set_mode(|m| m.group = true);
                    self.print(format!("* now talking in #{}", self.channel_id));
                    return None;
                }
                "private" => {
                    self.set_mode(|m| m.group = false);
                    self.print("* now talking privately".to_string());
                    return None;
                }
                "as" if !rest.is_empty() => {
                    self.set_mode(|m| m.user_id = rest.to_string());
                    self.print(format!("* speaking as {rest}"));
                    return None;
                }
                "quote" => {
                    let (id, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                    content = format!("<quote:{}> {}", id, text.trim());
                }
                _ => {}
            }
        }

        let mode = self.mode();
        let (subtype, channel_id) = if mode.group {
            (MessageSubtype::Group, self.channel_id.clone())
        } else {
            (MessageSubtype::Private, format!("dm-{}", mode.user_id))
        };
        let message_id = self.next_message_id();
        self.remember(
            &channel_id,
            QuotedMessage {
                message_id: message_id.clone(),
                user_id: mode.user_id.clone(),
                content: content.clone(),
            },
        );

        let mut message =
            IncomingMessage::new("console", channel_id, mode.user_id, subtype, content)
                .with_self_id(self.self_id.clone())
                .with_message_id(message_id);
        message.timestamp = chrono::Utc::now().timestamp();
        Some(message)
    }
}

/// Interactive platform for local use and end-to-end tests
pub struct ConsolePlatform {
    shared: Arc<Shared>,
    input: Mutex<Option<LineSource>>,
}

impl ConsolePlatform {
    /// Read from stdin and print replies to stdout
    pub fn new(config: &ConsoleConfig) -> Self {
        Self::build(config, Box::new(BufReader::new(tokio::io::stdin())), true)
    }

    /// Read lines from `input` and only record replies
    pub fn with_input(config: &ConsoleConfig, input: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        Self::build(config, Box::new(input), false)
    }

    fn build(config: &ConsoleConfig, input: LineSource, echo: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                self_id: config.self_id.clone(),
                channel_id: config.channel_id.clone(),
                mode: Mutex::new(Mode {
                    user_id: config.user_id.clone(),
                    group: config.group,
                }),
                history: Mutex::new(VecDeque::new()),
                transcript: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                echo,
            }),
            input: Mutex::new(Some(input)),
        }
    }

    /// Everything printed so far, including directive acknowledgements
    pub fn transcript(&self) -> Vec<String> {
        self.shared
            .transcript
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessagingPlatform for ConsolePlatform {
    async fn event_stream(&self) -> Result<EventStream> {
        let input = self
            .input
            .lock()
            .map_err(|e| anyhow::anyhow!("Console input mutex poisoned: {}", e))?
            .take()
            .context("Console event stream already taken")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut lines = input.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(message) = shared.handle_line(&line) {
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(platform = "console", error = %e, "Failed to read input");
                        break;
                    }
                }
            }
            tracing::debug!(platform = "console", "Input closed");
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send(&self, channel_id: &str, content: &str) -> Result<()> {
        let message_id = self.shared.next_message_id();
        self.shared.remember(
            channel_id,
            QuotedMessage {
                message_id: message_id.clone(),
                user_id: self.shared.self_id.clone(),
                content: content.to_string(),
            },
        );
        self.shared
            .print(format!("[{channel_id} #{message_id}] {}: {content}", self.shared.self_id));
        Ok(())
    }

    async fn get_message(&self, channel_id: &str, message_id: &str) -> Result<QuotedMessage> {
        let history = self
            .shared
            .history
            .lock()
            .map_err(|e| anyhow::anyhow!("Console history mutex poisoned: {}", e))?;
        history
            .iter()
            .find(|(channel, message)| channel == channel_id && message.message_id == message_id)
            .map(|(_, message)| message.clone())
            .with_context(|| format!("No message {message_id} in {channel_id}"))
    }

    fn bot_user_id(&self) -> &str {
        &self.shared.self_id
    }

    fn platform_id(&self) -> &str {
        "console"
    }
}
