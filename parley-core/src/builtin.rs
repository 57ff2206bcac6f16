// ABOUTME: Middlewares and commands every dispatcher starts with
// ABOUTME: Preprocessing (addressing, resolution, entity attach), suggestions and `help`

use crate::command::{Command, CommandContext};
use crate::entity::{flags, EntityKind};
use crate::error::DispatchError;
use crate::events::HookFlow;
use crate::middleware::{Middleware, Next};
use crate::session::{DispatchState, Session};
use crate::shortcut::ShortcutContext;
use crate::suggest::{best_match, CONFIRMATIONS};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

fn field_set(base: &[&str], extra: &[String]) -> BTreeSet<String> {
    base.iter()
        .map(|f| f.to_string())
        .chain(extra.iter().cloned())
        .collect()
}

/// First handler of every chain.
///
/// Resolves quotes and addressing, turns the text into a command vector,
/// attaches the channel and user records and drops ignored messages. A
/// resolved command is installed as the chain's fallback.
pub(crate) struct Preprocess;

#[async_trait]
impl Middleware for Preprocess {
    async fn handle(&self, session: Arc<Session>, next: Next) -> Result<()> {
        let dispatcher = session.dispatcher().clone();
        session.set_state(DispatchState::Preprocessing);

        let mut content = dispatcher.process_message(&session.message.content);
        let quote = session
            .platform()
            .split_quote(&content)
            .map(|(id, rest)| (id.to_string(), rest.to_string()));
        if let Some((quote_id, rest)) = quote {
            match session
                .platform()
                .get_message(&session.message.channel_id, &quote_id)
                .await
            {
                Ok(quoted) => {
                    let author = session.platform().mention(&quoted.user_id);
                    content = match rest.strip_prefix(author.as_str()) {
                        Some(after) => after.trim_start().to_string(),
                        None => rest,
                    };
                    session.set_reply(Some(quoted));
                }
                Err(err) => {
                    tracing::debug!(
                        session = %session.id,
                        quote = %quote_id,
                        error = %err,
                        "Quoted message unavailable"
                    );
                    content = rest;
                }
            }
        }

        let mention = session.platform().mention(session.self_id());
        let addressing = dispatcher
            .matcher()
            .strip(&content, &mention, session.is_private());
        let ctx = ShortcutContext {
            appel: addressing.appel,
            prefixed: addressing.prefix.is_some(),
            has_reply: session.reply().is_some(),
        };
        let mut argv = dispatcher.resolve(&addressing.parsed, ctx, true, session.is_private());
        argv.session = Some(session.id);
        session.set_addressing(addressing);
        session.set_argv(argv.clone());

        if dispatcher.cache().is_some() {
            let events = dispatcher.events();

            if !session.is_private() {
                let declared = argv
                    .command
                    .as_ref()
                    .map(|c| c.channel_fields.clone())
                    .unwrap_or_default();
                let mut fields = field_set(EntityKind::Channel.base_fields(), &declared);
                events.collect_fields(EntityKind::Channel, &session, &mut fields);
                let fields: Vec<String> = fields.into_iter().collect();
                let channel = session.observe_channel(&fields).await?;

                if dispatcher.config().auto_assign && channel.assignee().is_none() {
                    tracing::info!(
                        channel = %channel.key(),
                        assignee = %session.self_id(),
                        "Assigning channel"
                    );
                    channel.set("assignee", session.self_id());
                }
                if events.run_attach(EntityKind::Channel, &session).await? == HookFlow::Stop {
                    return Ok(());
                }
                let assigned_here = channel.assignee().as_deref() == Some(session.self_id());
                if channel.has_flag(flags::IGNORE) || (!assigned_here && !session.mentioned()) {
                    tracing::debug!(session = %session.id, channel = %channel.key(), "Channel not handled here");
                    return Ok(());
                }
            }

            let declared = argv
                .command
                .as_ref()
                .map(|c| c.user_fields.clone())
                .unwrap_or_default();
            let mut fields = field_set(EntityKind::User.base_fields(), &declared);
            events.collect_fields(EntityKind::User, &session, &mut fields);
            let fields: Vec<String> = fields.into_iter().collect();
            let user = session.observe_user(&fields).await?;

            if events.run_attach(EntityKind::User, &session).await? == HookFlow::Stop {
                return Ok(());
            }
            if user.has_flag(flags::IGNORE) {
                tracing::debug!(session = %session.id, user = %user.key(), "Ignoring user");
                return Ok(());
            }
        }

        if argv.command.is_some() {
            session.set_state(DispatchState::Resolved);
            let runner = session.clone();
            next.proceed_with(move |next| async move {
                let dispatcher = runner.dispatcher().clone();
                dispatcher.run_command(runner, argv, next).await
            })
            .await
        } else {
            session.set_state(DispatchState::Unresolved);
            session.set_state(DispatchState::MiddlewareChain);
            next.proceed().await
        }
    }
}

/// "Did you mean" for addressed messages that named no command.
///
/// The offer is made from the chain's fallback, so any middleware that
/// answers the message first suppresses it. Only the sender's very next
/// message can confirm it: a period runs the corrected command line, and
/// anything else discards the offer.
pub(crate) struct Suggest;

#[async_trait]
impl Middleware for Suggest {
    async fn handle(&self, session: Arc<Session>, next: Next) -> Result<()> {
        let dispatcher = session.dispatcher().clone();
        let parsed = session.parsed();
        let text = parsed.trim();

        let pending = dispatcher.suggestions().accept(&session.suggestion_key());
        if let Some(corrected) = pending {
            if CONFIRMATIONS.contains(&text) {
                tracing::debug!(session = %session.id, command = %corrected, "Suggestion accepted");
                return dispatcher.execute(session, &corrected, next).await;
            }
            tracing::debug!(session = %session.id, "Suggestion discarded");
        }

        let addressed = session.is_private() || session.prefix().is_some() || session.appel();
        let unresolved = session.argv().map_or(true, |argv| argv.command.is_none());
        if !addressed || !unresolved {
            return next.proceed().await;
        }

        let Some(word) = text.split_whitespace().next() else {
            return next.proceed().await;
        };
        let target = word.to_lowercase();
        let names = dispatcher.visible_command_names();
        let Some(best) = best_match(
            &target,
            names.iter().map(String::as_str),
            dispatcher.config().similarity_coefficient,
        )
        .map(str::to_string) else {
            return next.proceed().await;
        };
        let mut corrected = format!("{best}{}", &text[word.len()..]);
        if let Some(quoted) = session.reply() {
            corrected.push(' ');
            corrected.push_str(&quoted.content);
        }

        let offered_to = session.clone();
        next.proceed_with(move |_| async move {
            offered_to
                .dispatcher()
                .suggestions()
                .offer(offered_to.suggestion_key(), corrected);
            offered_to
                .respond(&format!(
                    "Did you mean \"{best}\"? Reply with a period to confirm."
                ))
                .await;
            Ok(())
        })
        .await
    }
}

pub(crate) fn help_command() -> Result<Command, DispatchError> {
    Command::builder("help [command]")
        .description("List commands, or show how to use one")
        .action(|ctx: CommandContext| async move {
            let dispatcher = ctx.session.dispatcher();
            if let Some(name) = ctx.arg(0) {
                return Ok(Some(match dispatcher.command(name) {
                    Some(command) => command.help_text(),
                    None => format!("Unknown command: {name}."),
                }));
            }

            let mut lines = vec!["Available commands:".to_string()];
            for command in dispatcher.commands().iter().filter(|c| !c.hidden) {
                if command.description.is_empty() {
                    lines.push(format!("  {}", command.name));
                } else {
                    lines.push(format!("  {}  {}", command.name, command.description));
                }
            }
            Ok(Some(lines.join("\n")))
        })
        .build()
}
