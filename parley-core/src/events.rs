// ABOUTME: Dispatcher hook seams: attach hooks, field collectors and event listeners
// ABOUTME: Attach hooks run serially and may stop the chain; listeners only observe

use crate::entity::EntityKind;
use crate::middleware::MiddlewareId;
use crate::session::Session;
use crate::sync::{read, write};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Which notification a listener subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A middleware chain finished, successfully or not
    Middleware,
    CommandExecuted,
    PluginChanged,
}

/// A change to the commands, shortcuts or middlewares of a dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    CommandAdded(String),
    CommandRemoved(String),
    ShortcutAdded(String),
    ShortcutRemoved(String),
    MiddlewareAdded(MiddlewareId),
    MiddlewareRemoved(MiddlewareId),
}

impl fmt::Display for RegistryChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandAdded(name) => write!(f, "command added: {name}"),
            Self::CommandRemoved(name) => write!(f, "command removed: {name}"),
            Self::ShortcutAdded(pattern) => write!(f, "shortcut added: {pattern}"),
            Self::ShortcutRemoved(pattern) => write!(f, "shortcut removed: {pattern}"),
            Self::MiddlewareAdded(id) => write!(f, "{id} added"),
            Self::MiddlewareRemoved(id) => write!(f, "{id} removed"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Middleware { session: Uuid },
    CommandExecuted { session: Uuid, command: String },
    PluginChanged { change: RegistryChange },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Middleware { .. } => EventKind::Middleware,
            Self::CommandExecuted { .. } => EventKind::CommandExecuted,
            Self::PluginChanged { .. } => EventKind::PluginChanged,
        }
    }
}

/// Outcome of an attach hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookFlow {
    #[default]
    Continue,
    /// Drop the message without running any middleware
    Stop,
}

/// Runs after the user or channel of a message has been observed
#[async_trait]
pub trait AttachHook: Send + Sync {
    async fn attach(&self, session: Arc<Session>) -> Result<HookFlow>;
}

#[async_trait]
impl<F, Fut> AttachHook for F
where
    F: Fn(Arc<Session>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HookFlow>> + Send + 'static,
{
    async fn attach(&self, session: Arc<Session>) -> Result<HookFlow> {
        (self)(session).await
    }
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;
pub type FieldCollector = Arc<dyn Fn(&Session, &mut BTreeSet<String>) + Send + Sync>;

/// Hook tables owned by one dispatcher
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(EventKind, Listener)>>,
    collectors: RwLock<Vec<(EntityKind, FieldCollector)>>,
    attach: RwLock<Vec<(EntityKind, Arc<dyn AttachHook>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: EventKind, listener: Listener) {
        write(&self.listeners).push((kind, listener));
    }

    pub fn on_collect(&self, kind: EntityKind, collector: FieldCollector) {
        write(&self.collectors).push((kind, collector));
    }

    pub fn on_attach(&self, kind: EntityKind, hook: Arc<dyn AttachHook>) {
        write(&self.attach).push((kind, hook));
    }

    /// Notify every listener of `event.kind()`, in registration order
    pub fn emit(&self, event: &Event) {
        let kind = event.kind();
        let listeners: Vec<Listener> = read(&self.listeners)
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Let collectors add the fields they need before `kind` is observed
    pub fn collect_fields(&self, kind: EntityKind, session: &Session, fields: &mut BTreeSet<String>) {
        let collectors: Vec<FieldCollector> = read(&self.collectors)
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, c)| c.clone())
            .collect();
        for collector in collectors {
            collector(session, fields);
        }
    }

    /// Run attach hooks for `kind` one after another until one stops
    pub async fn run_attach(&self, kind: EntityKind, session: &Arc<Session>) -> Result<HookFlow> {
        let hooks: Vec<Arc<dyn AttachHook>> = read(&self.attach)
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, h)| h.clone())
            .collect();
        for hook in hooks {
            if hook.attach(session.clone()).await? == HookFlow::Stop {
                tracing::debug!(session = %session.id, entity = %kind, "Attach hook stopped the message");
                return Ok(HookFlow::Stop);
            }
        }
        Ok(HookFlow::Continue)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        read(&self.listeners).iter().filter(|(k, _)| *k == kind).count()
    }
}
