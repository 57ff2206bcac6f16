// ABOUTME: Error taxonomy for the dispatch core
// ABOUTME: Adapter, handler, re-entrancy, storage and registration failures

use uuid::Uuid;

/// Errors surfaced by the dispatcher and its registries.
///
/// Handler bodies and collaborators return `anyhow::Result`; these variants
/// mark the boundaries where the dispatcher itself decides what went wrong.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A platform call (send, quoted message fetch) failed
    #[error("adapter call failed: {0}")]
    Adapter(String),

    /// A middleware or command action returned an error or panicked
    #[error("handler failed: {0}")]
    Handler(String),

    /// A continuation was invoked after its session left the registry
    #[error("isolated next function detected (session {session})")]
    IsolatedNext { session: Uuid },

    #[error("storage {operation} failed: {message}")]
    Storage { operation: &'static str, message: String },

    #[error("no storage backend configured")]
    NoStorage,

    #[error("command name \"{0}\" is already registered")]
    DuplicateCommand(String),

    #[error("unknown command \"{0}\"")]
    UnknownCommand(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("invalid declaration: {0}")]
    InvalidArgument(String),
}

impl DispatchError {
    pub(crate) fn storage(operation: &'static str, err: anyhow::Error) -> Self {
        Self::Storage {
            operation,
            message: format!("{err:#}"),
        }
    }

    /// Recover a dispatcher error from a handler's `anyhow` chain, or wrap it.
    pub fn from_handler(err: anyhow::Error) -> Self {
        match err.downcast::<DispatchError>() {
            Ok(dispatch) => dispatch,
            Err(other) => Self::Handler(format!("{other:#}")),
        }
    }

    pub fn is_isolated_next(&self) -> bool {
        matches!(self, Self::IsolatedNext { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_handler_keeps_dispatch_errors() {
        let id = Uuid::new_v4();
        let err = anyhow::Error::new(DispatchError::IsolatedNext { session: id });
        let recovered = DispatchError::from_handler(err);
        assert!(recovered.is_isolated_next());
    }

    #[test]
    fn test_from_handler_wraps_other_errors() {
        let err = anyhow::anyhow!("page pool exhausted");
        match DispatchError::from_handler(err.context("screenshot")) {
            DispatchError::Handler(msg) => {
                assert!(msg.contains("screenshot"));
                assert!(msg.contains("page pool exhausted"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_command_display() {
        let err = DispatchError::DuplicateCommand("help".to_string());
        assert_eq!(err.to_string(), "command name \"help\" is already registered");
    }
}
