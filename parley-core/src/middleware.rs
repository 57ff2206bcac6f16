// ABOUTME: Middleware trait, context selectors and the per-session continuation chain
// ABOUTME: `Next` advances the chain, appends fallbacks and guards against stale use

use crate::error::DispatchError;
use crate::metrics;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::sync::lock;
use crate::traits::{IncomingMessage, MessageSubtype};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A handler in the per-message chain.
///
/// Call `next.proceed().await` to hand the message on; returning without
/// calling it ends the chain for this message.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, session: Arc<Session>, next: Next) -> Result<()>;
}

#[async_trait]
impl<F, Fut> Middleware for F
where
    F: Fn(Arc<Session>, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, session: Arc<Session>, next: Next) -> Result<()> {
        (self)(session, next).await
    }
}

// =============================================================================
// Selectors
// =============================================================================

/// Context filter deciding which messages a middleware sees.
///
/// Each restriction narrows the scope; an unrestricted selector matches
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    platforms: Option<Vec<String>>,
    subtypes: Option<Vec<MessageSubtype>>,
    users: Option<Vec<String>>,
    channels: Option<Vec<String>>,
}

fn narrow<T: PartialEq + Clone>(current: &mut Option<Vec<T>>, value: T) {
    match current {
        Some(values) => values.retain(|v| *v == value),
        None => *current = Some(vec![value]),
    }
}

fn allows<T: PartialEq>(scope: &Option<Vec<T>>, value: &T) -> bool {
    scope.as_ref().map_or(true, |values| values.contains(value))
}

impl Selector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn platform(mut self, platform: &str) -> Self {
        narrow(&mut self.platforms, platform.to_string());
        self
    }

    pub fn private(mut self) -> Self {
        narrow(&mut self.subtypes, MessageSubtype::Private);
        self
    }

    pub fn group(mut self) -> Self {
        narrow(&mut self.subtypes, MessageSubtype::Group);
        self
    }

    pub fn user(mut self, user_id: &str) -> Self {
        narrow(&mut self.users, user_id.to_string());
        self
    }

    pub fn channel(mut self, channel_id: &str) -> Self {
        narrow(&mut self.channels, channel_id.to_string());
        self
    }

    pub fn matches(&self, message: &IncomingMessage) -> bool {
        allows(&self.platforms, &message.platform_id)
            && allows(&self.subtypes, &message.subtype)
            && allows(&self.users, &message.user_id)
            && allows(&self.channels, &message.channel_id)
    }
}

// =============================================================================
// Registration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiddlewareId(pub(crate) u64);

impl fmt::Display for MiddlewareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "middleware#{}", self.0)
    }
}

#[derive(Clone)]
pub(crate) struct MiddlewareEntry {
    pub id: MiddlewareId,
    pub selector: Selector,
    pub handler: Arc<dyn Middleware>,
}

// =============================================================================
// Chain
// =============================================================================

type Fallback = Box<dyn FnOnce(Next) -> BoxFuture<'static, Result<()>> + Send>;

enum Link {
    Handler(Arc<dyn Middleware>),
    Fallback(Option<Fallback>),
}

enum Step {
    End,
    Handler(Arc<dyn Middleware>),
    Fallback(Fallback),
}

struct Chain {
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    links: Mutex<Vec<Link>>,
    cursor: AtomicUsize,
    trace: Option<Mutex<Vec<&'static Location<'static>>>>,
}

/// Continuation handed to each middleware
#[derive(Clone)]
pub struct Next {
    chain: Arc<Chain>,
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("session", &self.chain.session.id)
            .field("cursor", &self.chain.cursor.load(Ordering::SeqCst))
            .finish()
    }
}

impl Next {
    /// Build the chain for one session from a filtered handler snapshot
    pub(crate) fn start(
        session: Arc<Session>,
        registry: Arc<SessionRegistry>,
        handlers: Vec<Arc<dyn Middleware>>,
        trace_calls: bool,
    ) -> Self {
        Self {
            chain: Arc::new(Chain {
                session,
                registry,
                links: Mutex::new(handlers.into_iter().map(Link::Handler).collect()),
                cursor: AtomicUsize::new(0),
                trace: trace_calls.then(|| Mutex::new(Vec::new())),
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.chain.session.id
    }

    /// Run the next matching handler
    #[track_caller]
    pub fn proceed(&self) -> BoxFuture<'static, Result<()>> {
        self.advance(None, Location::caller())
    }

    /// Append `fallback` to the end of this session's chain, then run the
    /// next handler. The fallback only runs if every later handler proceeds.
    #[track_caller]
    pub fn proceed_with<F, Fut>(&self, fallback: F) -> BoxFuture<'static, Result<()>>
    where
        F: FnOnce(Next) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let fallback: Fallback =
            Box::new(move |next: Next| -> BoxFuture<'static, Result<()>> { Box::pin(fallback(next)) });
        self.advance(Some(fallback), Location::caller())
    }

    /// Call sites of `next` seen so far, oldest first
    pub(crate) fn trace(&self) -> Vec<&'static Location<'static>> {
        self.chain
            .trace
            .as_ref()
            .map(|trace| lock(trace).clone())
            .unwrap_or_default()
    }

    fn advance(
        &self,
        fallback: Option<Fallback>,
        caller: &'static Location<'static>,
    ) -> BoxFuture<'static, Result<()>> {
        let chain = self.chain.clone();
        Box::pin(async move {
            let session_id = chain.session.id;
            if !chain.registry.is_active(session_id) {
                tracing::error!(
                    session = %session_id,
                    content = %chain.session.message.content,
                    location = %caller,
                    "Isolated next function detected"
                );
                metrics::record_handler_failure("isolated_next");
                return Err(DispatchError::IsolatedNext {
                    session: session_id,
                }
                .into());
            }

            let step = {
                let mut links = lock(&chain.links);
                if let Some(fallback) = fallback {
                    links.push(Link::Fallback(Some(fallback)));
                }
                let index = chain.cursor.fetch_add(1, Ordering::SeqCst);
                if index > 0 {
                    if let Some(trace) = &chain.trace {
                        lock(trace).push(caller);
                    }
                }
                match links.get_mut(index) {
                    None => Step::End,
                    Some(Link::Handler(handler)) => Step::Handler(handler.clone()),
                    Some(Link::Fallback(slot)) => slot.take().map_or(Step::End, Step::Fallback),
                }
            };

            let next = Next {
                chain: chain.clone(),
            };
            match step {
                Step::End => Ok(()),
                Step::Handler(handler) => handler.handle(chain.session.clone(), next).await,
                Step::Fallback(fallback) => fallback(next).await,
            }
        })
    }
}

/// Module path of this file, where the printed backtrace is cut
const PIPELINE_FRAME: &str = "parley_core::middleware";

/// Render a chain failure for the log.
///
/// The raw report is cut at the first frame inside the pipeline and the
/// recorded `next` call sites are appended, newest first.
pub(crate) fn format_failure(err: &anyhow::Error, trace: &[&'static Location<'static>]) -> String {
    let mut text = format!("{err:?}");
    if let Some(pos) = text.find(PIPELINE_FRAME) {
        let line_start = text[..pos].rfind('\n').unwrap_or(0);
        text.truncate(line_start);
    }
    let text = text.trim_end().to_string();
    if trace.is_empty() {
        return text;
    }
    let mut out = text;
    out.push_str("\nMiddleware stack:");
    for location in trace.iter().rev() {
        out.push_str(&format!("\n  - {location}"));
    }
    out
}
