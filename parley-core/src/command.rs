// ABOUTME: Command declarations, option/argument grammar and the name registry
// ABOUTME: Commands are built from a usage line and looked up by name or alias

use crate::argv::{Argv, OptionValue, Token};
use crate::error::DispatchError;
use crate::middleware::Next;
use crate::session::Session;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

// =============================================================================
// Declarations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Boolean,
    String,
    Number,
}

impl OptionKind {
    fn convert(self, raw: &str) -> OptionValue {
        match self {
            OptionKind::Boolean => {
                OptionValue::Flag(!matches!(raw, "false" | "0" | "no" | "off"))
            }
            OptionKind::Number => raw
                .parse::<f64>()
                .map(OptionValue::Number)
                .unwrap_or_else(|_| OptionValue::Text(raw.to_string())),
            OptionKind::String => OptionValue::Text(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionDecl {
    pub name: String,
    pub short: Option<char>,
    pub kind: OptionKind,
    pub description: String,
    pub default: Option<OptionValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDecl {
    pub name: String,
    pub required: bool,
    /// Swallows the remaining text
    pub rest: bool,
}

fn parse_arg_decl(word: &str) -> Result<ArgDecl, DispatchError> {
    let (required, inner) = if let Some(inner) = word.strip_prefix('<').and_then(|w| w.strip_suffix('>')) {
        (true, inner)
    } else if let Some(inner) = word.strip_prefix('[').and_then(|w| w.strip_suffix(']')) {
        (false, inner)
    } else {
        return Err(DispatchError::InvalidArgument(format!(
            "argument \"{word}\" must be written as <name> or [name]"
        )));
    };
    let (inner, rest) = match inner.strip_suffix("...") {
        Some(stripped) => (stripped, true),
        None => (inner, false),
    };
    let name = inner.split(':').next().unwrap_or(inner).trim();
    if name.is_empty() {
        return Err(DispatchError::InvalidArgument(format!(
            "argument \"{word}\" has no name"
        )));
    }
    Ok(ArgDecl {
        name: name.to_string(),
        required,
        rest,
    })
}

/// Parse `-w, --width <px:number>` style option declarations
fn parse_option_decl(decl: &str, description: &str) -> Result<OptionDecl, DispatchError> {
    let mut short = None;
    let mut long = None;
    let mut kind = OptionKind::Boolean;

    for part in decl.split(|c: char| c == ',' || c.is_whitespace()).filter(|p| !p.is_empty()) {
        if let Some(name) = part.strip_prefix("--") {
            long = Some(name.to_string());
        } else if let Some(name) = part.strip_prefix('-') {
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => short = Some(c),
                _ => {
                    return Err(DispatchError::InvalidArgument(format!(
                        "short option \"{part}\" must be a single character"
                    )))
                }
            }
        } else if part.starts_with('<') || part.starts_with('[') {
            kind = if part.contains(":number") {
                OptionKind::Number
            } else {
                OptionKind::String
            };
        } else {
            return Err(DispatchError::InvalidArgument(format!(
                "unexpected \"{part}\" in option \"{decl}\""
            )));
        }
    }

    let name = match (long, short) {
        (Some(long), _) if !long.is_empty() => long,
        (_, Some(short)) => short.to_string(),
        _ => {
            return Err(DispatchError::InvalidArgument(format!(
                "option \"{decl}\" has no name"
            )))
        }
    };

    Ok(OptionDecl {
        name,
        short,
        kind,
        description: description.to_string(),
        default: None,
    })
}

// =============================================================================
// Actions
// =============================================================================

/// Everything a command action gets to work with
pub struct CommandContext {
    pub session: Arc<Session>,
    pub argv: Argv,
    /// Continues the middleware chain when the action declines to answer
    pub next: Next,
}

impl CommandContext {
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.argv.arg(index)
    }

    pub fn option(&self, name: &str) -> Option<&OptionValue> {
        self.argv.option(name)
    }
}

/// The body of a command. Returning `Some(text)` sends it as the reply.
#[async_trait]
pub trait CommandAction: Send + Sync {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>>;
}

#[async_trait]
impl<F, Fut> CommandAction for F
where
    F: Fn(CommandContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<String>>> + Send + 'static,
{
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        (self)(ctx).await
    }
}

// =============================================================================
// Command
// =============================================================================

pub struct Command {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
    pub args: Vec<ArgDecl>,
    pub options: Vec<OptionDecl>,
    /// Minimum user authority needed to run it
    pub authority: u32,
    /// Extra user fields the action reads
    pub user_fields: Vec<String>,
    /// Extra channel fields the action reads
    pub channel_fields: Vec<String>,
    /// Left out of help listings and suggestions
    pub hidden: bool,
    action: Arc<dyn CommandAction>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("args", &self.args)
            .field("options", &self.options)
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

impl Command {
    /// Start a command from its usage line, e.g. `"screenshot <url> [delay]"`
    pub fn builder(declaration: &str) -> CommandBuilder {
        CommandBuilder::new(declaration)
    }

    pub fn action(&self) -> Arc<dyn CommandAction> {
        self.action.clone()
    }

    fn find_long(&self, name: &str) -> Option<&OptionDecl> {
        self.options.iter().find(|o| o.name == name)
    }

    fn find_short(&self, c: char) -> Option<&OptionDecl> {
        self.options.iter().find(|o| o.short == Some(c))
    }

    /// Parse tokens following the command name into options and positional args
    pub fn parse(&self, tokens: &[Token]) -> (BTreeMap<String, OptionValue>, Vec<String>) {
        let mut options = BTreeMap::new();
        let mut args = Vec::new();
        let rest_index = self.args.iter().position(|a| a.rest);
        let mut i = 0;

        while i < tokens.len() {
            if rest_index == Some(args.len()) {
                let rest: Vec<&str> = tokens[i..].iter().map(|t| t.content.as_str()).collect();
                args.push(rest.join(" "));
                break;
            }

            let token = &tokens[i];
            i += 1;

            if !token.quoted {
                if let Some(long) = token.content.strip_prefix("--") {
                    if !long.is_empty() {
                        i = self.parse_long(long, tokens, i, &mut options);
                        continue;
                    }
                } else if let Some(shorts) = token.content.strip_prefix('-') {
                    if !shorts.is_empty() && token.content.parse::<f64>().is_err() {
                        i = self.parse_short(shorts, tokens, i, &mut options);
                        continue;
                    }
                }
            }

            args.push(token.content.clone());
        }

        (options, args)
    }

    fn parse_long(
        &self,
        long: &str,
        tokens: &[Token],
        mut i: usize,
        options: &mut BTreeMap<String, OptionValue>,
    ) -> usize {
        let (name, inline) = match long.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (long, None),
        };

        if let Some(decl) = self.find_long(name) {
            let value = match (decl.kind, inline) {
                (_, Some(raw)) => decl.kind.convert(raw),
                (OptionKind::Boolean, None) => OptionValue::Flag(true),
                (kind, None) => match tokens.get(i) {
                    Some(next) => {
                        i += 1;
                        kind.convert(&next.content)
                    }
                    None => OptionValue::Text(String::new()),
                },
            };
            options.insert(decl.name.clone(), value);
        } else if let (Some(negated), None) = (name.strip_prefix("no-"), inline) {
            options.insert(negated.to_string(), OptionValue::Flag(false));
        } else {
            let value = inline
                .map(|v| OptionValue::Text(v.to_string()))
                .unwrap_or(OptionValue::Flag(true));
            options.insert(name.to_string(), value);
        }
        i
    }

    fn parse_short(
        &self,
        shorts: &str,
        tokens: &[Token],
        mut i: usize,
        options: &mut BTreeMap<String, OptionValue>,
    ) -> usize {
        let chars: Vec<char> = shorts.chars().collect();
        for (idx, c) in chars.iter().enumerate() {
            let Some(decl) = self.find_short(*c) else {
                options.insert(c.to_string(), OptionValue::Flag(true));
                continue;
            };
            if decl.kind == OptionKind::Boolean {
                options.insert(decl.name.clone(), OptionValue::Flag(true));
                continue;
            }
            // A valued short option takes the rest of the cluster or the next token
            let value = if idx + 1 < chars.len() {
                chars[idx + 1..].iter().collect::<String>()
            } else if let Some(next) = tokens.get(i) {
                i += 1;
                next.content.clone()
            } else {
                String::new()
            };
            options.insert(decl.name.clone(), decl.kind.convert(&value));
            break;
        }
        i
    }

    /// Fill declared defaults for options the caller left out
    pub fn apply_defaults(&self, options: &mut BTreeMap<String, OptionValue>) {
        for decl in &self.options {
            if let Some(default) = &decl.default {
                options
                    .entry(decl.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }

    /// First required positional argument that is missing
    pub fn missing_argument(&self, args: &[String]) -> Option<&ArgDecl> {
        self.args
            .iter()
            .enumerate()
            .find(|(index, decl)| decl.required && *index >= args.len())
            .map(|(_, decl)| decl)
    }

    pub fn usage(&self) -> String {
        let mut usage = self.name.clone();
        for arg in &self.args {
            let dots = if arg.rest { "..." } else { "" };
            if arg.required {
                usage.push_str(&format!(" <{}{dots}>", arg.name));
            } else {
                usage.push_str(&format!(" [{}{dots}]", arg.name));
            }
        }
        usage
    }

    pub fn help_text(&self) -> String {
        let mut lines = vec![self.usage()];
        if !self.description.is_empty() {
            lines.push(self.description.clone());
        }
        if !self.aliases.is_empty() {
            lines.push(format!("Aliases: {}", self.aliases.join(", ")));
        }
        if !self.options.is_empty() {
            lines.push("Options:".to_string());
            for option in &self.options {
                let short = option.short.map(|c| format!("-{c}, ")).unwrap_or_default();
                let value = match option.kind {
                    OptionKind::Boolean => "",
                    OptionKind::String => " <value>",
                    OptionKind::Number => " <number>",
                };
                lines.push(format!(
                    "  {short}--{}{value}  {}",
                    option.name, option.description
                ));
            }
        }
        lines.join("\n")
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct CommandBuilder {
    name: String,
    aliases: Vec<String>,
    description: String,
    args: Vec<ArgDecl>,
    options: Vec<OptionDecl>,
    authority: u32,
    user_fields: Vec<String>,
    channel_fields: Vec<String>,
    hidden: bool,
    action: Option<Arc<dyn CommandAction>>,
    error: Option<DispatchError>,
}

impl CommandBuilder {
    fn new(declaration: &str) -> Self {
        let mut words = declaration.split_whitespace();
        let name = words.next().unwrap_or_default().to_lowercase();
        let mut builder = Self {
            name,
            aliases: Vec::new(),
            description: String::new(),
            args: Vec::new(),
            options: Vec::new(),
            authority: 0,
            user_fields: Vec::new(),
            channel_fields: Vec::new(),
            hidden: false,
            action: None,
            error: None,
        };

        if builder.name.is_empty() || builder.name.starts_with(|c: char| matches!(c, '<' | '[' | '-')) {
            builder.error = Some(DispatchError::InvalidArgument(format!(
                "\"{declaration}\" does not start with a command name"
            )));
            return builder;
        }

        for word in words {
            match parse_arg_decl(word) {
                Ok(arg) => builder.args.push(arg),
                Err(err) => {
                    builder.error.get_or_insert(err);
                }
            }
        }
        if builder.args.iter().rev().skip(1).any(|a| a.rest) {
            builder.error.get_or_insert(DispatchError::InvalidArgument(format!(
                "only the last argument of \"{declaration}\" may be a rest argument"
            )));
        }
        builder
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_lowercase());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Declare an option such as `"-w, --width <px:number>"` or `"--dry-run"`
    pub fn option(mut self, declaration: &str, description: &str) -> Self {
        match parse_option_decl(declaration, description) {
            Ok(decl) => self.options.push(decl),
            Err(err) => {
                self.error.get_or_insert(err);
            }
        }
        self
    }

    /// Default value for a previously declared option
    pub fn default_option(mut self, name: &str, value: impl Into<OptionValue>) -> Self {
        match self.options.iter_mut().find(|o| o.name == name) {
            Some(decl) => decl.default = Some(value.into()),
            None => {
                self.error.get_or_insert(DispatchError::InvalidArgument(format!(
                    "default given for undeclared option \"{name}\""
                )));
            }
        }
        self
    }

    pub fn authority(mut self, authority: u32) -> Self {
        self.authority = authority;
        self
    }

    pub fn user_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn channel_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channel_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn action<F, Fut>(self, action: F) -> Self
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>>> + Send + 'static,
    {
        self.handler(action)
    }

    /// Use a type implementing `CommandAction` as the body
    pub fn handler(mut self, action: impl CommandAction + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    pub fn build(self) -> Result<Command, DispatchError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let action = self.action.ok_or_else(|| {
            DispatchError::InvalidArgument(format!("command \"{}\" has no action", self.name))
        })?;
        Ok(Command {
            name: self.name,
            aliases: self.aliases,
            description: self.description,
            args: self.args,
            options: self.options,
            authority: self.authority,
            user_fields: self.user_fields,
            channel_fields: self.channel_fields,
            hidden: self.hidden,
            action,
        })
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Commands in registration order, indexed by name and alias
#[derive(Default)]
pub struct CommandRegistry {
    commands: Vec<Arc<Command>>,
    names: HashMap<String, Arc<Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command. Names and aliases share one namespace.
    pub fn register(&mut self, command: Command) -> Result<Arc<Command>, DispatchError> {
        let mut claimed: Vec<&String> = Vec::new();
        for name in std::iter::once(&command.name).chain(command.aliases.iter()) {
            if self.names.contains_key(name) || claimed.contains(&name) {
                return Err(DispatchError::DuplicateCommand(name.clone()));
            }
            claimed.push(name);
        }

        let command = Arc::new(command);
        for name in std::iter::once(&command.name).chain(command.aliases.iter()) {
            self.names.insert(name.clone(), command.clone());
        }
        self.commands.push(command.clone());
        Ok(command)
    }

    /// Remove a command (looked up by name or alias) with all of its aliases
    pub fn unregister(&mut self, name: &str) -> Option<Arc<Command>> {
        let command = self.get(name)?;
        self.names.retain(|_, c| !Arc::ptr_eq(c, &command));
        self.commands.retain(|c| !Arc::ptr_eq(c, &command));
        Some(command)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Command>> {
        self.names.get(&name.to_lowercase()).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Command>> {
        self.commands.iter()
    }

    /// Visible names and aliases in registration order
    pub fn visible_names(&self) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| !c.hidden)
            .flat_map(|c| std::iter::once(c.name.clone()).chain(c.aliases.iter().cloned()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
