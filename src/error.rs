// ============================================================================
// Error Types
// ============================================================================

use thiserror::Error;

use crate::hook::HookKind;

#[derive(Error, Debug)]
pub enum TxnError {
    #[error("context already entered: enter calls cannot be nested on the same transaction")]
    Reentry,

    #[error("asymmetric use of scope: exit called without a matching enter")]
    AsymmetricExit,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no ambient logging context was available; falling back to the crate-level span")]
    MissingContext,

    #[error("could not retrieve value for unknown key: {0}")]
    UnknownKey(String),

    #[error("failed to serialize staged value for transaction {key:?}: {source}")]
    Serialization {
        key: Option<String>,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} hook {hook_name:?} failed: {message}")]
    Hook {
        kind: HookKind,
        hook_name: String,
        message: String,
    },

    #[error("result store operation failed: {0}")]
    Store(String),

    #[error("lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, TxnError>;

impl<T> From<std::sync::PoisonError<T>> for TxnError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}
