// ABOUTME: End-to-end dispatch tests against a recording mock platform
// ABOUTME: Covers addressing, resolution, middleware order, failures, re-entrancy and entity gating

use anyhow::{bail, Result};
use async_trait::async_trait;
use parley_core::{
    flags, Command, CommandContext, DispatchError, DispatchState, Dispatcher, DispatcherConfig,
    EntityKind, EventStream, HookFlow, IncomingMessage, MemoryStorage, MessageSubtype,
    MessagingPlatform, Next, Query, QuotedMessage, Selector, Session, Shortcut, Storage, Table,
};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default)]
struct MockPlatform {
    sent: Mutex<Vec<(String, String)>>,
    quotes: HashMap<String, QuotedMessage>,
}

impl MockPlatform {
    fn with_quote(id: &str, user: &str, content: &str) -> Self {
        let mut quotes = HashMap::new();
        quotes.insert(
            id.to_string(),
            QuotedMessage {
                message_id: id.to_string(),
                user_id: user.to_string(),
                content: content.to_string(),
            },
        );
        Self {
            sent: Mutex::new(Vec::new()),
            quotes,
        }
    }

    fn replies(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, text)| text.clone()).collect()
    }
}

#[async_trait]
impl MessagingPlatform for MockPlatform {
    async fn event_stream(&self) -> Result<EventStream> {
        Ok(Box::pin(tokio_stream::empty()))
    }

    async fn send(&self, channel_id: &str, content: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn get_message(&self, _channel_id: &str, message_id: &str) -> Result<QuotedMessage> {
        match self.quotes.get(message_id) {
            Some(quoted) => Ok(quoted.clone()),
            None => bail!("message {message_id} not found"),
        }
    }

    fn bot_user_id(&self) -> &str {
        "bot"
    }

    fn platform_id(&self) -> &str {
        "mock"
    }
}

fn group(content: &str) -> IncomingMessage {
    IncomingMessage::new("mock", "room", "alice", MessageSubtype::Group, content)
}

fn private(content: &str) -> IncomingMessage {
    IncomingMessage::new("mock", "dm-alice", "alice", MessageSubtype::Private, content)
}

fn config(nicknames: Vec<&str>, prefixes: Vec<&str>) -> DispatcherConfig {
    DispatcherConfig {
        nickname: nicknames.into(),
        prefix: prefixes.into(),
        ..DispatcherConfig::default()
    }
}

type Calls = Arc<Mutex<Vec<Vec<String>>>>;

/// `screenshot <url>` that records its arguments
fn screenshot(calls: Calls) -> Command {
    Command::builder("screenshot <url>")
        .alias("shot")
        .description("Capture a page")
        .action(move |ctx: CommandContext| {
            let calls = calls.clone();
            async move {
                calls.lock().unwrap().push(ctx.argv.args.clone());
                Ok(Some(format!("captured {}", ctx.arg(0).unwrap_or_default())))
            }
        })
        .build()
        .unwrap()
}

fn echo() -> Command {
    Command::builder("echo <text...>")
        .action(|ctx: CommandContext| async move { Ok(Some(ctx.argv.args.join(" "))) })
        .build()
        .unwrap()
}

// =============================================================================
// Addressing and resolution
// =============================================================================

#[tokio::test]
async fn test_nickname_addressed_group_message_runs_command() {
    let dispatcher = Dispatcher::new(config(vec!["bot"], vec![]), None).unwrap();
    let calls: Calls = Arc::default();
    dispatcher.register_command(screenshot(calls.clone())).unwrap();

    let seen = Arc::new(Mutex::new(None));
    let recorder = seen.clone();
    dispatcher.register_middleware(Selector::any(), move |session: Arc<Session>, next: Next| {
        let recorder = recorder.clone();
        async move {
            *recorder.lock().unwrap() = Some((session.appel(), session.parsed(), session.prefix()));
            next.proceed().await
        }
    });

    let platform = Arc::new(MockPlatform::default());
    let report = dispatcher
        .dispatch(group("@bot screenshot http://example.com"), platform.clone())
        .await;

    assert!(report.error.is_none());
    assert_eq!(report.command.as_deref(), Some("screenshot"));
    assert_eq!(
        seen.lock().unwrap().clone(),
        Some((true, "screenshot http://example.com".to_string(), None))
    );
    assert_eq!(*calls.lock().unwrap(), vec![vec!["http://example.com".to_string()]]);
    assert_eq!(platform.replies(), vec!["captured http://example.com"]);
}

#[tokio::test]
async fn test_private_help_needs_no_addressing() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    let platform = Arc::new(MockPlatform::default());

    let report = dispatcher.dispatch(private("help"), platform.clone()).await;

    assert_eq!(report.command.as_deref(), Some("help"));
    let replies = platform.replies();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].starts_with("Available commands:"));
    assert!(replies[0].contains("help"));
}

#[tokio::test]
async fn test_unaddressed_group_help_falls_through() {
    let dispatcher = Dispatcher::new(config(vec![], vec![""]), None).unwrap();
    let platform = Arc::new(MockPlatform::default());

    let report = dispatcher.dispatch(group("help"), platform.clone()).await;

    assert!(report.command.is_none());
    assert!(report.error.is_none());
    assert!(platform.replies().is_empty());
}

#[tokio::test]
async fn test_prefixed_group_message_and_alias() {
    let dispatcher = Dispatcher::new(config(vec![], vec!["!", "!!"]), None).unwrap();
    let calls: Calls = Arc::default();
    dispatcher.register_command(screenshot(calls.clone())).unwrap();
    let platform = Arc::new(MockPlatform::default());

    let report = dispatcher.dispatch(group("!!shot a.com"), platform.clone()).await;

    assert_eq!(report.command.as_deref(), Some("screenshot"));
    assert_eq!(platform.replies(), vec!["captured a.com"]);
}

#[tokio::test]
async fn test_self_mention_ignored_in_private() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    dispatcher.register_command(echo()).unwrap();
    let platform = Arc::new(MockPlatform::default());

    let report = dispatcher
        .dispatch(group("<at:bot> echo hello"), platform.clone())
        .await;
    assert_eq!(report.command.as_deref(), Some("echo"));

    // In a private chat the markup stays in the text and names no command
    let report = dispatcher
        .dispatch(private("<at:bot> echo hello"), platform.clone())
        .await;
    assert!(report.command.is_none());
}

#[tokio::test]
async fn test_quote_is_resolved_and_author_mention_stripped() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    let quoted = Arc::new(Mutex::new(None));
    let recorder = quoted.clone();
    dispatcher
        .register_command(
            Command::builder("quote")
                .action(move |ctx: CommandContext| {
                    let recorder = recorder.clone();
                    async move {
                        *recorder.lock().unwrap() = ctx.session.reply();
                        Ok(None)
                    }
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    let platform = Arc::new(MockPlatform::with_quote("42", "carol", "original text"));

    let report = dispatcher
        .dispatch(private("<quote:42> <at:carol> quote"), platform.clone())
        .await;

    assert_eq!(report.command.as_deref(), Some("quote"));
    let reply = quoted.lock().unwrap().clone().unwrap();
    assert_eq!(reply.user_id, "carol");
    assert_eq!(reply.content, "original text");
}

#[tokio::test]
async fn test_confirmed_suggestion_carries_quoted_text() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    dispatcher.register_command(echo()).unwrap();
    let platform = Arc::new(MockPlatform::with_quote("7", "carol", "original text"));

    dispatcher.dispatch(private("<quote:7> ecoh"), platform.clone()).await;
    assert_eq!(
        platform.replies(),
        vec!["Did you mean \"echo\"? Reply with a period to confirm."]
    );

    let report = dispatcher.dispatch(private("."), platform.clone()).await;
    assert_eq!(report.command.as_deref(), Some("echo"));
    assert_eq!(platform.replies()[1], "original text");
}

#[tokio::test]
async fn test_unavailable_quote_is_not_an_error() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    dispatcher.register_command(echo()).unwrap();
    let platform = Arc::new(MockPlatform::default());

    let report = dispatcher
        .dispatch(private("<quote:404> echo still here"), platform.clone())
        .await;

    assert!(report.error.is_none());
    assert_eq!(platform.replies(), vec!["still here"]);
}

#[tokio::test]
async fn test_greedy_and_regex_shortcuts() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    dispatcher.register_command(echo()).unwrap();
    dispatcher
        .register_shortcut(Shortcut::literal("say", "echo").fuzzy().greedy())
        .unwrap();
    dispatcher
        .register_shortcut(
            Shortcut::regex(r"^repeat (\w+) twice$", "echo")
                .unwrap()
                .args(["$1", "$1"]),
        )
        .unwrap();
    let platform = Arc::new(MockPlatform::default());

    // Shortcuts apply to unaddressed group messages too
    dispatcher.dispatch(group("say  hello   world"), platform.clone()).await;
    dispatcher.dispatch(group("repeat hi twice"), platform.clone()).await;

    assert_eq!(platform.replies(), vec!["hello   world", "hi hi"]);
}

// =============================================================================
// Middleware chain
// =============================================================================

#[tokio::test]
async fn test_middlewares_run_in_order_and_respect_selectors() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (label, selector) in [
        ("first", Selector::any()),
        ("private-only", Selector::any().private()),
        ("group-only", Selector::any().group()),
        ("last", Selector::any()),
    ] {
        let order = order.clone();
        dispatcher.register_middleware(selector, move |_session: Arc<Session>, next: Next| {
            let order = order.clone();
            async move {
                order.lock().unwrap().push(label);
                next.proceed().await
            }
        });
    }
    let platform = Arc::new(MockPlatform::default());

    dispatcher.dispatch(group("chatter"), platform.clone()).await;
    assert_eq!(*order.lock().unwrap(), vec!["first", "group-only", "last"]);

    order.lock().unwrap().clear();
    dispatcher.dispatch(private("chatter"), platform).await;
    assert_eq!(*order.lock().unwrap(), vec!["first", "private-only", "last"]);
}

#[tokio::test]
async fn test_middleware_that_answers_suppresses_command() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    dispatcher.register_command(echo()).unwrap();
    dispatcher.register_middleware(Selector::any(), |session: Arc<Session>, _next: Next| async move {
        session.respond("intercepted").await;
        Ok::<(), anyhow::Error>(())
    });
    let platform = Arc::new(MockPlatform::default());

    let report = dispatcher.dispatch(private("echo hi"), platform.clone()).await;

    assert_eq!(report.command.as_deref(), Some("echo"));
    assert_eq!(platform.replies(), vec!["intercepted"]);
}

#[tokio::test]
async fn test_handler_failure_is_isolated() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    dispatcher.register_command(echo()).unwrap();
    dispatcher.register_middleware(
        Selector::any().user("mallory"),
        |_s: Arc<Session>, _n: Next| async move {
            Err::<(), _>(anyhow::anyhow!("middleware exploded"))
        },
    );
    let platform = Arc::new(MockPlatform::default());

    let failing = IncomingMessage::new("mock", "dm", "mallory", MessageSubtype::Private, "echo hi");
    let (bad, good) = tokio::join!(
        dispatcher.dispatch(failing, platform.clone()),
        dispatcher.dispatch(private("echo fine"), platform.clone()),
    );

    match bad.error {
        Some(DispatchError::Handler(text)) => assert!(text.contains("middleware exploded")),
        other => panic!("expected handler failure, got {other:?}"),
    }
    assert!(good.error.is_none());
    assert_eq!(platform.replies(), vec!["fine"]);
    assert!(dispatcher.sessions().is_empty());
}

#[tokio::test]
async fn test_panicking_handler_is_caught() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    dispatcher.register_middleware(Selector::any(), |_s: Arc<Session>, _n: Next| async move {
        if true {
            panic!("handler bug");
        }
        Ok::<(), anyhow::Error>(())
    });

    let report = dispatcher
        .dispatch(private("anything"), Arc::new(MockPlatform::default()))
        .await;

    assert!(matches!(report.error, Some(DispatchError::Handler(ref text)) if text.contains("handler bug")));
    assert!(dispatcher.sessions().is_empty());
}

#[tokio::test]
async fn test_stale_next_is_detected() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    let stash: Arc<Mutex<Option<(Arc<Session>, Next)>>> = Arc::default();
    let keep = stash.clone();
    dispatcher.register_middleware(Selector::any(), move |session: Arc<Session>, next: Next| {
        let keep = keep.clone();
        async move {
            *keep.lock().unwrap() = Some((session, next));
            Ok::<(), anyhow::Error>(())
        }
    });
    let counter = Arc::new(Mutex::new(0));
    let after = counter.clone();
    dispatcher.register_middleware(Selector::any(), move |_s: Arc<Session>, next: Next| {
        let after = after.clone();
        async move {
            *after.lock().unwrap() += 1;
            next.proceed().await
        }
    });

    let report = dispatcher
        .dispatch(private("hello"), Arc::new(MockPlatform::default()))
        .await;
    assert!(report.error.is_none());

    let (session, next) = stash.lock().unwrap().take().unwrap();
    assert_eq!(session.state(), DispatchState::Flushed);
    assert!(!dispatcher.sessions().is_active(session.id));

    let err = next.proceed().await.unwrap_err();
    let err = DispatchError::from_handler(err);
    assert!(err.is_isolated_next());
    assert_eq!(*counter.lock().unwrap(), 0);
}

// =============================================================================
// Validation and suggestions
// =============================================================================

#[tokio::test]
async fn test_missing_argument_reply() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    dispatcher.register_command(screenshot(Arc::default())).unwrap();
    let platform = Arc::new(MockPlatform::default());

    dispatcher.dispatch(private("screenshot"), platform.clone()).await;

    assert_eq!(platform.replies(), vec!["Missing argument: url."]);
}

#[tokio::test]
async fn test_suggestion_offer_and_confirm() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    let platform = Arc::new(MockPlatform::default());

    let report = dispatcher.dispatch(private("hlep"), platform.clone()).await;
    assert!(report.command.is_none());
    assert_eq!(
        platform.replies(),
        vec!["Did you mean \"help\"? Reply with a period to confirm."]
    );

    let report = dispatcher.dispatch(private("."), platform.clone()).await;
    assert!(report.error.is_none());
    let replies = platform.replies();
    assert_eq!(replies.len(), 2);
    assert!(replies[1].starts_with("Available commands:"));

    // The offer is one-shot
    dispatcher.dispatch(private("."), platform.clone()).await;
    assert_eq!(platform.replies().len(), 2);
}

#[tokio::test]
async fn test_suggestion_discarded_by_any_other_message() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    let platform = Arc::new(MockPlatform::default());

    dispatcher.dispatch(private("hlep"), platform.clone()).await;
    let report = dispatcher.dispatch(private("help help"), platform.clone()).await;
    assert_eq!(report.command.as_deref(), Some("help"));
    assert_eq!(platform.replies().len(), 2);

    let report = dispatcher.dispatch(private("."), platform.clone()).await;
    assert!(report.command.is_none());
    assert_eq!(platform.replies().len(), 2);
}

#[tokio::test]
async fn test_no_suggestion_for_unaddressed_group_message() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), None).unwrap();
    let platform = Arc::new(MockPlatform::default());

    dispatcher.dispatch(group("hlep"), platform.clone()).await;

    assert!(platform.replies().is_empty());
}

// =============================================================================
// Entity attach and gating
// =============================================================================

async fn seed_user(storage: &MemoryStorage, id: &str, authority: u64, flag: u64) {
    let mut row = parley_core::Row::new();
    row.insert("platform".into(), json!("mock"));
    row.insert("id".into(), json!(id));
    row.insert("authority".into(), json!(authority));
    row.insert("flag".into(), json!(flag));
    storage.create(Table::User, row).await.unwrap();
}

fn counter_command() -> Command {
    Command::builder("count")
        .authority(1)
        .user_fields(["count"])
        .action(|ctx: CommandContext| async move {
            let user = ctx.session.user().expect("user observed");
            let total = user.increment("count", 1);
            Ok(Some(format!("count = {total}")))
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_command_mutation_is_flushed() {
    let storage = Arc::new(MemoryStorage::new());
    seed_user(&storage, "alice", 1, 0).await;
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), Some(storage.clone())).unwrap();
    dispatcher.register_command(counter_command()).unwrap();
    let platform = Arc::new(MockPlatform::default());

    dispatcher.dispatch(private("count"), platform.clone()).await;
    dispatcher.dispatch(private("count"), platform.clone()).await;

    assert_eq!(platform.replies(), vec!["count = 1", "count = 2"]);
    let rows = storage
        .get(Table::User, &Query::eq("id", "alice"), &["count".to_string()])
        .await
        .unwrap();
    assert_eq!(rows[0]["count"], json!(2));
}

#[tokio::test]
async fn test_flush_runs_after_failed_action() {
    let storage = Arc::new(MemoryStorage::new());
    seed_user(&storage, "alice", 1, 0).await;
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), Some(storage.clone())).unwrap();
    dispatcher
        .register_command(
            Command::builder("boom")
                .action(|ctx: CommandContext| async move {
                    if let Some(user) = ctx.session.user() {
                        user.set("note", "written before failing");
                    }
                    bail!("action failed")
                })
                .build()
                .unwrap(),
        )
        .unwrap();

    let report = dispatcher
        .dispatch(private("boom"), Arc::new(MockPlatform::default()))
        .await;

    assert!(report.error.is_some());
    let rows = storage
        .get(Table::User, &Query::eq("id", "alice"), &[])
        .await
        .unwrap();
    assert_eq!(rows[0]["note"], json!("written before failing"));
}

#[tokio::test]
async fn test_insufficient_authority() {
    let storage = Arc::new(MemoryStorage::new());
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), Some(storage.clone())).unwrap();
    dispatcher.register_command(counter_command()).unwrap();
    let platform = Arc::new(MockPlatform::default());

    dispatcher.dispatch(private("count"), platform.clone()).await;

    assert_eq!(platform.replies(), vec!["Insufficient authority."]);
    // The unknown user was created with the default authority
    assert_eq!(storage.len(Table::User).await, 1);
}

#[tokio::test]
async fn test_ignored_user_is_dropped() {
    let storage = Arc::new(MemoryStorage::new());
    seed_user(&storage, "alice", 5, flags::IGNORE).await;
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), Some(storage)).unwrap();
    dispatcher.register_command(echo()).unwrap();
    let platform = Arc::new(MockPlatform::default());

    dispatcher.dispatch(private("echo hi"), platform.clone()).await;

    assert!(platform.replies().is_empty());
}

#[tokio::test]
async fn test_unassigned_channel_needs_mention() {
    let storage = Arc::new(MemoryStorage::new());
    let dispatcher = Dispatcher::new(config(vec!["bot"], vec![]), Some(storage.clone())).unwrap();
    dispatcher.register_command(echo()).unwrap();
    let platform = Arc::new(MockPlatform::default());

    // Nickname addressing is not a mention
    dispatcher.dispatch(group("bot, echo one"), platform.clone()).await;
    assert!(platform.replies().is_empty());

    dispatcher.dispatch(group("<at:bot> echo two"), platform.clone()).await;
    assert_eq!(platform.replies(), vec!["two"]);
}

#[tokio::test]
async fn test_auto_assign_claims_channel() {
    let storage = Arc::new(MemoryStorage::new());
    let mut cfg = config(vec!["bot"], vec![]);
    cfg.auto_assign = true;
    let dispatcher = Dispatcher::new(cfg, Some(storage.clone())).unwrap();
    dispatcher.register_command(echo()).unwrap();
    let platform = Arc::new(MockPlatform::default());

    dispatcher.dispatch(group("bot, echo one"), platform.clone()).await;

    assert_eq!(platform.replies(), vec!["one"]);
    let rows = storage
        .get(Table::Channel, &Query::eq("id", "room"), &["assignee".to_string()])
        .await
        .unwrap();
    assert_eq!(rows[0]["assignee"], json!("bot"));
}

#[tokio::test]
async fn test_silent_channel_swallows_replies() {
    let storage = Arc::new(MemoryStorage::new());
    let mut row = parley_core::Row::new();
    row.insert("platform".into(), json!("mock"));
    row.insert("id".into(), json!("room"));
    row.insert("flag".into(), json!(flags::SILENT));
    row.insert("assignee".into(), json!("bot"));
    storage.create(Table::Channel, row).await.unwrap();
    let dispatcher = Dispatcher::new(config(vec!["bot"], vec![]), Some(storage)).unwrap();
    dispatcher.register_command(echo()).unwrap();
    let platform = Arc::new(MockPlatform::default());

    let report = dispatcher.dispatch(group("bot echo quiet"), platform.clone()).await;

    assert_eq!(report.command.as_deref(), Some("echo"));
    assert!(platform.replies().is_empty());
}

#[tokio::test]
async fn test_attach_hook_can_stop_and_collect_fields() {
    let storage = Arc::new(MemoryStorage::new());
    seed_user(&storage, "alice", 1, 0).await;
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), Some(storage)).unwrap();
    dispatcher.register_command(echo()).unwrap();
    dispatcher.on_collect(EntityKind::User, |_session: &Session, fields: &mut BTreeSet<String>| {
        fields.insert("muted".to_string());
    });
    let collected = Arc::new(Mutex::new(Vec::new()));
    let recorder = collected.clone();
    dispatcher.on_attach(EntityKind::User, move |session: Arc<Session>| {
        let recorder = recorder.clone();
        async move {
            let user = session.user().expect("user attached before hooks");
            recorder
                .lock()
                .unwrap()
                .push(user.missing_fields(&["muted".to_string()]).is_empty());
            if session.message.content.contains("stop") {
                return Ok(HookFlow::Stop);
            }
            Ok::<HookFlow, anyhow::Error>(HookFlow::Continue)
        }
    });
    let platform = Arc::new(MockPlatform::default());

    dispatcher.dispatch(private("echo go"), platform.clone()).await;
    dispatcher.dispatch(private("echo stop"), platform.clone()).await;

    assert_eq!(platform.replies(), vec!["go"]);
    assert_eq!(*collected.lock().unwrap(), vec![true, true]);
}
