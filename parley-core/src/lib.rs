// ABOUTME: Platform-agnostic message dispatch core for chat bots
// ABOUTME: Addressing, command resolution, entity caching and the middleware pipeline

pub mod argv;
pub mod broadcast;
mod builtin;
pub mod cache;
pub mod capability;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod events;
pub mod metrics;
pub mod middleware;
pub mod normalize;
pub mod prefix;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod shortcut;
pub mod storage;
pub mod suggest;
mod sync;
pub mod traits;

pub use argv::{Argv, OptionValue, Token};
pub use broadcast::{BroadcastSink, RegistryBroadcaster, RegistrySnapshot};
pub use cache::{CacheLimits, EntityCache};
pub use capability::Capabilities;
pub use command::{Command, CommandAction, CommandContext, CommandRegistry};
pub use config::{DispatcherConfig, StringList};
pub use dispatcher::{DispatchReport, Dispatcher, MessageProcessor, TokenizeHook};
pub use entity::{flags, EntityKey, EntityKind, Observed};
pub use error::DispatchError;
pub use events::{AttachHook, Event, EventKind, HookFlow, RegistryChange};
pub use middleware::{Middleware, MiddlewareId, Next, Selector};
pub use runtime::{serve, PlatformRegistry, ServeSummary};
pub use session::{DispatchState, Session};
pub use shortcut::{Shortcut, ShortcutContext};
pub use storage::MemoryStorage;

// Re-export the adapter and storage seams
pub use traits::{
    project, EventStream, IncomingMessage, MessageSubtype, MessagingPlatform, Query,
    QuotedMessage, Row, Storage, Table,
};
