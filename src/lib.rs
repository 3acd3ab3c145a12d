//! Nested transaction coordinator for workflow orchestration runtimes.
//!
//! A scope (`with_transaction` / `with_transaction_async`) stages a result,
//! persists it through a pluggable [`ResultStore`] on success, and rolls
//! back user-registered hooks and child scopes on failure. Scopes nest:
//! a transaction opened while another is ambient becomes its child, and
//! its own commit/rollback responsibility can be deferred to the parent
//! depending on [`CommitMode`].
//!
//! Two façades share the same state machine semantics: [`Transaction`] for
//! synchronous call sites, [`AsyncTransaction`] for cooperative ones. Pick
//! the one matching the surrounding code; the two are never mixed within a
//! single nesting chain (see the crate's design notes for why).

mod async_transaction;
mod bridge;
mod context;
mod error;
mod hook;
mod scope;
mod state;
mod store;
mod transaction;
mod values;

pub use async_transaction::AsyncTransaction;
pub use error::{Result, TxnError};
pub use hook::{AsyncHook, Hook, HookKind};
pub use scope::{
    clear_default_store, set_default_store, with_transaction, with_transaction_async,
    ScopeOptions,
};
pub use state::{CommitMode, Holder, IsolationLevel, TransactionState};
pub use store::{
    InMemoryResultStore, MetadataStorageKind, NullMetadataStore, ResultRecord, ResultStore,
    StagedValue,
};
pub use transaction::Transaction;
pub use values::StoredValues;
