// ABOUTME: The Dispatcher owns commands, shortcuts, middlewares, hooks and the entity cache
// ABOUTME: dispatch() runs one message through the chain and always completes its flush phase

use crate::argv::{tokenize, Argv};
use crate::broadcast::RegistrySnapshot;
use crate::builtin::{help_command, Preprocess, Suggest};
use crate::cache::{CacheLimits, EntityCache};
use crate::capability::Capabilities;
use crate::command::{Command, CommandContext, CommandRegistry};
use crate::config::DispatcherConfig;
use crate::entity::{EntityKind, Observed};
use crate::error::DispatchError;
use crate::events::{AttachHook, Event, EventBus, EventKind, RegistryChange};
use crate::metrics;
use crate::middleware::{format_failure, Middleware, MiddlewareEntry, MiddlewareId, Next, Selector};
use crate::normalize::normalize_message;
use crate::prefix::PrefixMatcher;
use crate::registry::SessionRegistry;
use crate::session::{DispatchState, Session};
use crate::shortcut::{Shortcut, ShortcutContext};
use crate::suggest::SuggestionBook;
use crate::sync::{lock, read, write};
use crate::traits::{IncomingMessage, MessagingPlatform, Storage};
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Replaces the default normalisation of inbound text
pub type MessageProcessor = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Custom resolution step tried after shortcuts and before command lookup
pub trait TokenizeHook: Send + Sync {
    fn tokenize(&self, content: &str, ctx: ShortcutContext, commands: &CommandRegistry) -> Option<Argv>;
}

impl<F> TokenizeHook for F
where
    F: Fn(&str, ShortcutContext, &CommandRegistry) -> Option<Argv> + Send + Sync,
{
    fn tokenize(&self, content: &str, ctx: ShortcutContext, commands: &CommandRegistry) -> Option<Argv> {
        (self)(content, ctx, commands)
    }
}

/// Outcome of one dispatch, for callers and tests
#[derive(Debug)]
pub struct DispatchReport {
    pub session: Uuid,
    /// Command the message resolved to, if any
    pub command: Option<String>,
    /// Failure caught at the pipeline boundary
    pub error: Option<DispatchError>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    matcher: PrefixMatcher,
    processor: RwLock<Option<MessageProcessor>>,
    commands: RwLock<CommandRegistry>,
    shortcuts: RwLock<Vec<Arc<Shortcut>>>,
    tokenizers: RwLock<Vec<Arc<dyn TokenizeHook>>>,
    middlewares: RwLock<Vec<MiddlewareEntry>>,
    next_middleware_id: AtomicU64,
    sessions: Arc<SessionRegistry>,
    cache: Option<EntityCache>,
    events: EventBus,
    capabilities: Capabilities,
    suggestions: SuggestionBook,
    broadcast_tx: Mutex<Option<UnboundedSender<()>>>,
}

impl Dispatcher {
    /// Build a dispatcher. Without storage no entities are observed and
    /// every caller has authority 0.
    pub fn new(
        config: DispatcherConfig,
        storage: Option<Arc<dyn Storage>>,
    ) -> Result<Arc<Self>, DispatchError> {
        let matcher = PrefixMatcher::new(&config.nicknames(), &config.prefixes())?;
        let cache = storage.map(|storage| {
            EntityCache::new(
                storage,
                CacheLimits {
                    max_age: config.user_cache_max_age(),
                    max_len: config.user_cache_length,
                },
                CacheLimits {
                    max_age: config.channel_cache_max_age(),
                    max_len: config.channel_cache_length,
                },
                config.auto_authorize,
            )
        });

        let dispatcher = Arc::new(Self {
            config,
            matcher,
            processor: RwLock::new(None),
            commands: RwLock::new(CommandRegistry::new()),
            shortcuts: RwLock::new(Vec::new()),
            tokenizers: RwLock::new(Vec::new()),
            middlewares: RwLock::new(Vec::new()),
            next_middleware_id: AtomicU64::new(0),
            sessions: Arc::new(SessionRegistry::new()),
            cache,
            events: EventBus::new(),
            capabilities: Capabilities::new(),
            suggestions: SuggestionBook::new(),
            broadcast_tx: Mutex::new(None),
        });

        dispatcher.register_middleware(Selector::any(), Preprocess);
        dispatcher.register_middleware(Selector::any(), Suggest);
        dispatcher.register_command(help_command()?)?;
        Ok(dispatcher)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn matcher(&self) -> &PrefixMatcher {
        &self.matcher
    }

    pub fn cache(&self) -> Option<&EntityCache> {
        self.cache.as_ref()
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn suggestions(&self) -> &SuggestionBook {
        &self.suggestions
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // =========================================================================
    // Text processing
    // =========================================================================

    pub fn set_message_processor(&self, processor: MessageProcessor) {
        *write(&self.processor) = Some(processor);
    }

    /// Apply the custom processor, or the default normalisation
    pub fn process_message(&self, text: &str) -> String {
        if let Some(processor) = read(&self.processor).clone() {
            return processor(text);
        }
        if self.config.normalize {
            normalize_message(text)
        } else {
            text.to_string()
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register_command(&self, command: Command) -> Result<Arc<Command>, DispatchError> {
        let command = write(&self.commands).register(command)?;
        tracing::debug!(command = %command.name, "Command registered");
        self.notify(RegistryChange::CommandAdded(command.name.clone()));
        Ok(command)
    }

    /// Remove a command, its aliases and every shortcut pointing at it
    pub fn unregister_command(&self, name: &str) -> Option<Arc<Command>> {
        let command = write(&self.commands).unregister(name)?;
        write(&self.shortcuts).retain(|s| {
            s.command != command.name && !command.aliases.contains(&s.command)
        });
        tracing::debug!(command = %command.name, "Command unregistered");
        self.notify(RegistryChange::CommandRemoved(command.name.clone()));
        Some(command)
    }

    pub fn command(&self, name: &str) -> Option<Arc<Command>> {
        read(&self.commands).get(name)
    }

    pub fn commands(&self) -> Vec<Arc<Command>> {
        read(&self.commands).iter().cloned().collect()
    }

    pub fn visible_command_names(&self) -> Vec<String> {
        read(&self.commands).visible_names()
    }

    /// Add a shortcut after the existing ones. Its target must be registered.
    pub fn register_shortcut(&self, shortcut: Shortcut) -> Result<(), DispatchError> {
        if self.command(&shortcut.command).is_none() {
            return Err(DispatchError::UnknownCommand(shortcut.command));
        }
        let pattern = shortcut.describe();
        write(&self.shortcuts).push(Arc::new(shortcut));
        tracing::debug!(shortcut = %pattern, "Shortcut registered");
        self.notify(RegistryChange::ShortcutAdded(pattern));
        Ok(())
    }

    /// Drop every shortcut whose pattern reads `pattern`: the literal text,
    /// or `/regex/` for regex shortcuts.
    pub fn unregister_shortcut(&self, pattern: &str) -> bool {
        let removed = {
            let mut shortcuts = write(&self.shortcuts);
            let before = shortcuts.len();
            shortcuts.retain(|s| s.describe() != pattern);
            shortcuts.len() != before
        };
        if removed {
            tracing::debug!(shortcut = %pattern, "Shortcut unregistered");
            self.notify(RegistryChange::ShortcutRemoved(pattern.to_string()));
        }
        removed
    }

    pub fn register_tokenizer(&self, hook: impl TokenizeHook + 'static) {
        write(&self.tokenizers).push(Arc::new(hook));
    }

    /// Append a middleware. It sees only messages `selector` matches.
    pub fn register_middleware(
        &self,
        selector: Selector,
        handler: impl Middleware + 'static,
    ) -> MiddlewareId {
        let id = MiddlewareId(self.next_middleware_id.fetch_add(1, Ordering::SeqCst));
        write(&self.middlewares).push(MiddlewareEntry {
            id,
            selector,
            handler: Arc::new(handler),
        });
        self.notify(RegistryChange::MiddlewareAdded(id));
        id
    }

    pub fn unregister_middleware(&self, id: MiddlewareId) -> bool {
        let removed = {
            let mut middlewares = write(&self.middlewares);
            let before = middlewares.len();
            middlewares.retain(|m| m.id != id);
            middlewares.len() != before
        };
        if removed {
            self.notify(RegistryChange::MiddlewareRemoved(id));
        }
        removed
    }

    pub fn on_event(&self, kind: EventKind, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.events.on(kind, Arc::new(listener));
    }

    pub fn on_attach(&self, kind: EntityKind, hook: impl AttachHook + 'static) {
        self.events.on_attach(kind, Arc::new(hook));
    }

    pub fn on_collect(
        &self,
        kind: EntityKind,
        collector: impl Fn(&Session, &mut BTreeSet<String>) + Send + Sync + 'static,
    ) {
        self.events.on_collect(kind, Arc::new(collector));
    }

    pub(crate) fn attach_broadcaster(&self, tx: UnboundedSender<()>) {
        *lock(&self.broadcast_tx) = Some(tx);
    }

    /// Announce a registry change to listeners and the broadcaster
    pub fn notify(&self, change: RegistryChange) {
        self.events.emit(&Event::PluginChanged { change });
        let mut tx = lock(&self.broadcast_tx);
        if tx.as_ref().is_some_and(|tx| tx.send(()).is_err()) {
            *tx = None;
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let commands = read(&self.commands).iter().map(|c| c.name.clone()).collect();
        let shortcuts = read(&self.shortcuts).iter().map(|s| s.describe()).collect();
        let middlewares = read(&self.middlewares).len();
        RegistrySnapshot {
            commands,
            shortcuts,
            middlewares,
        }
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Turn `content` into a command vector.
    ///
    /// Shortcuts are tried in registration order, then tokenizer hooks, then
    /// the first word is looked up as a command name. A `root` vector from a
    /// group message only resolves by name when the bot was addressed.
    pub fn resolve(&self, content: &str, ctx: ShortcutContext, root: bool, private: bool) -> Argv {
        let commands = read(&self.commands);

        let shortcuts: Vec<Arc<Shortcut>> = read(&self.shortcuts).clone();
        for shortcut in shortcuts {
            if let Some(mut argv) = shortcut.try_match(content, ctx, &commands) {
                argv.root = root;
                return argv;
            }
        }

        let tokenizers: Vec<Arc<dyn TokenizeHook>> = read(&self.tokenizers).clone();
        for hook in tokenizers {
            if let Some(mut argv) = hook.tokenize(content, ctx, &commands) {
                argv.root = root;
                return argv;
            }
        }

        let mut tokens = tokenize(content);
        let mut argv = Argv {
            root,
            ..Argv::default()
        };
        if root && !private && !(ctx.prefixed || ctx.appel) {
            argv.tokens = tokens;
            return argv;
        }
        let command = tokens
            .first()
            .filter(|token| !token.quoted)
            .and_then(|token| commands.get(&token.content));
        if let Some(command) = command {
            tokens.remove(0);
            let (options, args) = command.parse(&tokens);
            argv.options = options;
            argv.args = args;
            argv.command = Some(command);
        }
        argv.tokens = tokens;
        argv
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Run one inbound message through the middleware chain.
    ///
    /// Handler failures are caught here and logged; the session is always
    /// released and its observed entities flushed.
    pub async fn dispatch(
        self: &Arc<Self>,
        message: IncomingMessage,
        platform: Arc<dyn MessagingPlatform>,
    ) -> DispatchReport {
        let started = Instant::now();
        let session = Arc::new(Session::new(message, platform, self.clone()));
        self.sessions.admit(&session);
        metrics::record_message_dispatched(&session.message.platform_id);
        tracing::debug!(
            session = %session.id,
            platform = %session.message.platform_id,
            channel = %session.message.channel_id,
            user = %session.message.user_id,
            "Session admitted"
        );

        let handlers: Vec<Arc<dyn Middleware>> = read(&self.middlewares)
            .iter()
            .filter(|entry| entry.selector.matches(&session.message))
            .map(|entry| entry.handler.clone())
            .collect();
        let next = Next::start(
            session.clone(),
            self.sessions.clone(),
            handlers,
            self.config.pretty_errors,
        );

        let error = match AssertUnwindSafe(next.proceed()).catch_unwind().await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                let rendered = if self.config.pretty_errors {
                    format_failure(&err, &next.trace())
                } else {
                    format!("{err:#}")
                };
                tracing::warn!(
                    session = %session.id,
                    content = %session.message.content,
                    error = %rendered,
                    "Middleware chain failed"
                );
                let err = DispatchError::from_handler(err);
                if !err.is_isolated_next() {
                    metrics::record_handler_failure("handler");
                }
                Some(err)
            }
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                tracing::error!(
                    session = %session.id,
                    content = %session.message.content,
                    reason = %reason,
                    "Middleware panicked"
                );
                metrics::record_handler_failure("handler");
                Some(DispatchError::Handler(format!("handler panicked: {reason}")))
            }
        };

        session.set_state(DispatchState::Completed);
        self.sessions.release(session.id);
        self.events.emit(&Event::Middleware {
            session: session.id,
        });

        self.flush_session(&session).await;
        session.set_state(DispatchState::Flushed);
        metrics::record_dispatch_duration(started.elapsed());

        DispatchReport {
            session: session.id,
            command: session
                .argv()
                .and_then(|argv| argv.command_name().map(String::from)),
            error,
        }
    }

    async fn flush_session(&self, session: &Session) {
        let Some(cache) = &self.cache else {
            return;
        };
        let entities: Vec<Arc<Observed>> = [session.user(), session.channel()]
            .into_iter()
            .flatten()
            .collect();
        for entity in entities {
            if let Err(err) = cache.flush(&entity).await {
                tracing::warn!(
                    session = %session.id,
                    entity = %entity.key(),
                    error = %err,
                    "Failed to flush entity"
                );
            }
        }
    }

    /// Run `text` as a command line inside an existing session.
    ///
    /// The text is resolved without the addressing requirement of inbound
    /// messages. Text that names no command is an `UnknownCommand` error.
    pub async fn execute(&self, session: Arc<Session>, text: &str, next: Next) -> anyhow::Result<()> {
        let content = self.process_message(text);
        let ctx = ShortcutContext {
            appel: true,
            prefixed: false,
            has_reply: session.reply().is_some(),
        };
        let mut argv = self.resolve(&content, ctx, false, session.is_private());
        if argv.command.is_none() {
            return Err(DispatchError::UnknownCommand(content).into());
        }
        argv.session = Some(session.id);
        session.set_argv(argv.clone());
        self.run_command(session, argv, next).await
    }

    /// Validate and run the command of `argv`.
    ///
    /// Authority and required arguments are checked first; a failed check
    /// answers the user and ends the chain.
    pub async fn run_command(
        &self,
        session: Arc<Session>,
        argv: Argv,
        next: Next,
    ) -> anyhow::Result<()> {
        let Some(command) = argv.command.clone() else {
            return next.proceed().await;
        };
        session.set_state(DispatchState::Executing);

        if self.cache.is_some() {
            session.observe_user(&command.user_fields).await?;
            if !session.is_private() && !command.channel_fields.is_empty() {
                session.observe_channel(&command.channel_fields).await?;
            }
        }

        let authority = session.user().map_or(0, |user| user.authority());
        if authority < command.authority {
            tracing::debug!(
                session = %session.id,
                command = %command.name,
                authority,
                required = command.authority,
                "Insufficient authority"
            );
            session.respond("Insufficient authority.").await;
            return Ok(());
        }
        if let Some(arg) = command.missing_argument(&argv.args) {
            session.respond(&format!("Missing argument: {}.", arg.name)).await;
            return Ok(());
        }

        let mut argv = argv;
        command.apply_defaults(&mut argv.options);
        metrics::record_command_executed(&command.name);
        tracing::info!(
            session = %session.id,
            command = %command.name,
            user = %session.message.user_id,
            args = ?argv.args,
            "Executing command"
        );

        let ctx = CommandContext {
            session: session.clone(),
            argv,
            next,
        };
        if let Some(reply) = command.action().run(ctx).await? {
            session.respond(&reply).await;
        }
        self.events.emit(&Event::CommandExecuted {
            session: session.id,
            command: command.name.clone(),
        });
        Ok(())
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shortcut::Shortcut;

    fn dispatcher(config: DispatcherConfig) -> Arc<Dispatcher> {
        let dispatcher = Dispatcher::new(config, None).unwrap();
        for name in ["foo", "foobar", "screenshot"] {
            dispatcher
                .register_command(
                    Command::builder(&format!("{name} [arg]"))
                        .action(|_| async { Ok(None) })
                        .build()
                        .unwrap(),
                )
                .unwrap();
        }
        dispatcher
    }

    #[test]
    fn test_group_messages_need_addressing() {
        let d = dispatcher(DispatcherConfig::default());
        let ctx = ShortcutContext::default();
        assert!(d.resolve("help", ctx, true, false).command.is_none());
        assert_eq!(d.resolve("help", ctx, true, true).command_name(), Some("help"));

        let addressed = ShortcutContext {
            appel: true,
            ..ShortcutContext::default()
        };
        assert_eq!(d.resolve("help", addressed, true, false).command_name(), Some("help"));
        assert_eq!(d.resolve("help", ctx, false, false).command_name(), Some("help"));
    }

    #[test]
    fn test_generic_lookup_strips_command_token() {
        let d = dispatcher(DispatcherConfig::default());
        let argv = d.resolve("screenshot http://example.com", ShortcutContext::default(), true, true);
        assert_eq!(argv.command_name(), Some("screenshot"));
        assert_eq!(argv.args, vec!["http://example.com"]);
        assert!(argv.root);
    }

    #[test]
    fn test_shortcut_precedence_over_longer_command() {
        let d = dispatcher(DispatcherConfig::default());
        d.register_shortcut(Shortcut::literal("foo", "foo").fuzzy()).unwrap();
        d.register_shortcut(Shortcut::literal("foobar", "foobar")).unwrap();
        let private = ShortcutContext::default();

        // Not followed by whitespace: the fuzzy shortcut declines, the literal one matches
        let argv = d.resolve("foobar", private, true, true);
        assert_eq!(argv.command_name(), Some("foobar"));

        let argv = d.resolve("foo bar", private, true, true);
        assert_eq!(argv.command_name(), Some("foo"));
        assert_eq!(argv.args, vec!["bar"]);

        let appel = ShortcutContext {
            appel: true,
            ..ShortcutContext::default()
        };
        assert_eq!(d.resolve("foobar", appel, true, false).command_name(), Some("foo"));
    }

    #[test]
    fn test_register_shortcut_requires_target() {
        let d = dispatcher(DispatcherConfig::default());
        assert!(matches!(
            d.register_shortcut(Shortcut::literal("hi", "missing")),
            Err(DispatchError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_unregister_removes_shortcuts() {
        let d = dispatcher(DispatcherConfig::default());
        d.register_shortcut(Shortcut::literal("shot", "screenshot").fuzzy()).unwrap();
        assert_eq!(d.snapshot().shortcuts, vec!["shot".to_string()]);
        assert!(d.unregister_command("screenshot").is_some());
        assert!(d.snapshot().shortcuts.is_empty());
        assert!(d.command("screenshot").is_none());
    }

    #[test]
    fn test_unregister_shortcut_by_pattern() {
        let d = dispatcher(DispatcherConfig::default());
        let changes = Arc::new(Mutex::new(Vec::new()));
        let seen = changes.clone();
        d.on_event(EventKind::PluginChanged, move |event: &Event| {
            if let Event::PluginChanged { change } = event {
                seen.lock().unwrap().push(change.to_string());
            }
        });
        d.register_shortcut(Shortcut::literal("shot", "screenshot")).unwrap();
        d.register_shortcut(Shortcut::regex(r"^(\d+)$", "foo").unwrap()).unwrap();

        assert!(d.unregister_shortcut("shot"));
        assert!(!d.unregister_shortcut("shot"));
        assert_eq!(d.snapshot().shortcuts, vec![r"/^(\d+)$/".to_string()]);
        assert!(d.unregister_shortcut(r"/^(\d+)$/"));
        assert!(d.snapshot().shortcuts.is_empty());
        assert!(d.command("screenshot").is_some());

        let changes = changes.lock().unwrap();
        assert_eq!(changes.last().map(String::as_str), Some(r"shortcut removed: /^(\d+)$/"));
        assert_eq!(
            changes.iter().filter(|c| c.starts_with("shortcut removed")).count(),
            2
        );
    }

    #[test]
    fn test_tokenizer_hook_runs_after_shortcuts() {
        let d = dispatcher(DispatcherConfig::default());
        d.register_tokenizer(|content: &str, _ctx: ShortcutContext, commands: &CommandRegistry| {
            let rest = content.strip_prefix("!")?;
            Some(Argv {
                command: commands.get("foo"),
                args: vec![rest.to_string()],
                ..Argv::default()
            })
        });
        let argv = d.resolve("!x", ShortcutContext::default(), true, false);
        assert_eq!(argv.command_name(), Some("foo"));
        assert_eq!(argv.args, vec!["x"]);
    }

    #[test]
    fn test_message_processor_replaces_normalisation() {
        let d = dispatcher(DispatcherConfig::default());
        assert_eq!(d.process_message("  ＨＥＬＰ "), "HELP");
        d.set_message_processor(Arc::new(|text: &str| text.to_uppercase()));
        assert_eq!(d.process_message("help"), "HELP");
    }

    #[test]
    fn test_middleware_ids_and_removal() {
        let d = dispatcher(DispatcherConfig::default());
        let before = d.snapshot().middlewares;
        let id = d.register_middleware(Selector::any(), |_s: Arc<Session>, next: Next| async move {
            next.proceed().await
        });
        assert_eq!(d.snapshot().middlewares, before + 1);
        assert!(d.unregister_middleware(id));
        assert!(!d.unregister_middleware(id));
        assert_eq!(d.snapshot().middlewares, before);
    }
}
