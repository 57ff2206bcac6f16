// ABOUTME: Built-in command set the parley binary ships with
// ABOUTME: Registers commands, shortcuts, a logging middleware and a snapshot log sink

use anyhow::Result;
use async_trait::async_trait;
use parley_core::{
    BroadcastSink, Command, CommandContext, Dispatcher, Event, EventKind, Next,
    RegistrySnapshot, Selector, Session, Shortcut,
};
use std::sync::Arc;
use std::time::Instant;

/// Capability holding the `Instant` the plugins were installed
pub const STARTED_AT: &str = "started_at";

/// Register everything on `dispatcher`
pub fn install(dispatcher: &Arc<Dispatcher>) -> Result<()> {
    dispatcher
        .capabilities()
        .provide(STARTED_AT, Arc::new(Instant::now()));

    dispatcher.register_command(echo()?)?;
    dispatcher.register_command(ping()?)?;
    dispatcher.register_command(whoami()?)?;
    dispatcher.register_command(count()?)?;
    dispatcher.register_command(assign()?)?;
    dispatcher.register_command(add()?)?;
    dispatcher.register_command(uptime()?)?;

    dispatcher.register_shortcut(Shortcut::literal("say", "echo").fuzzy().greedy())?;
    dispatcher.register_shortcut(
        Shortcut::regex(r"^(\d+)\s*\+\s*(\d+)$", "add")?.args(["$1", "$2"]),
    )?;

    dispatcher.register_middleware(Selector::any(), log_message);
    dispatcher.on_event(EventKind::CommandExecuted, |event: &Event| {
        tracing::debug!(?event, "Command executed");
    });

    tracing::info!(commands = dispatcher.commands().len(), "Plugins installed");
    Ok(())
}

async fn log_message(session: Arc<Session>, next: Next) -> Result<()> {
    tracing::debug!(
        session = %session.id,
        platform = %session.message.platform_id,
        channel = %session.message.channel_id,
        user = %session.message.user_id,
        content = %session.message.content,
        "Message received"
    );
    next.proceed().await
}

fn echo() -> Result<Command> {
    Ok(Command::builder("echo <text...>")
        .description("Repeat the text back")
        .action(|ctx: CommandContext| async move { Ok(Some(ctx.argv.args.join(" "))) })
        .build()?)
}

fn ping() -> Result<Command> {
    Ok(Command::builder("ping")
        .description("Check the bot is alive")
        .action(|_ctx: CommandContext| async move { Ok(Some("pong".to_string())) })
        .build()?)
}

fn whoami() -> Result<Command> {
    Ok(Command::builder("whoami")
        .description("Show your id and authority")
        .action(|ctx: CommandContext| async move {
            let message = &ctx.session.message;
            let authority = ctx.session.user().map_or(0, |u| u.authority());
            Ok(Some(format!(
                "You are {} on {} (authority {}).",
                message.user_id, message.platform_id, authority
            )))
        })
        .build()?)
}

fn count() -> Result<Command> {
    Ok(Command::builder("count")
        .description("Count how often you have asked")
        .user_fields(["count"])
        .action(|ctx: CommandContext| async move {
            let Some(user) = ctx.session.user() else {
                return Ok(Some("Nothing to count without storage.".to_string()));
            };
            let total = user.increment("count", 1);
            Ok(Some(format!("You have counted {total} times.")))
        })
        .build()?)
}

fn assign() -> Result<Command> {
    Ok(Command::builder("assign")
        .description("Make this bot answer everything in the channel")
        .authority(1)
        .channel_fields(["assignee"])
        .action(|ctx: CommandContext| async move {
            let Some(channel) = ctx.session.channel() else {
                return Ok(Some("Only group channels can be assigned.".to_string()));
            };
            let self_id = ctx.session.self_id().to_string();
            if channel.assignee().as_deref() == Some(self_id.as_str()) {
                return Ok(Some("This channel is already assigned to me.".to_string()));
            }
            channel.set("assignee", self_id);
            Ok(Some("Channel assigned.".to_string()))
        })
        .build()?)
}

fn add() -> Result<Command> {
    Ok(Command::builder("add <a> <b>")
        .description("Add two numbers")
        .action(|ctx: CommandContext| async move {
            let mut sum = 0.0;
            for index in 0..2 {
                let raw = ctx.arg(index).unwrap_or_default();
                match raw.parse::<f64>() {
                    Ok(value) => sum += value,
                    Err(_) => return Ok(Some(format!("Not a number: {raw}"))),
                }
            }
            Ok(Some(format_number(sum)))
        })
        .build()?)
}

fn uptime() -> Result<Command> {
    Ok(Command::builder("uptime")
        .description("How long the bot has been running")
        .action(|ctx: CommandContext| async move {
            let capabilities = ctx.session.dispatcher().capabilities();
            let reply = match capabilities.get::<Instant>(STARTED_AT) {
                Some(started) => format!("Up for {}s.", started.elapsed().as_secs()),
                None => "Uptime unknown.".to_string(),
            };
            Ok(Some(reply))
        })
        .build()?)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Writes registry snapshots to the log
pub struct LogSink;

#[async_trait]
impl BroadcastSink for LogSink {
    async fn push(&self, snapshot: RegistrySnapshot) -> Result<()> {
        tracing::info!(
            snapshot = %serde_json::to_string(&snapshot)?,
            "Registry changed"
        );
        Ok(())
    }
}
