// ============================================================================
// Commit / Rollback Hooks
// ============================================================================
//
// A hook is a callable taking the transaction, registered at `stage` time and
// run in registration order (commit hooks) or reverse order (rollback hooks).
// The blocking facade's hooks are plain synchronous closures; the cooperative
// facade distinguishes hooks that are themselves async ("cooperative", simply
// awaited) from hooks that are blocking code a caller wants to run without
// starving the scheduler ("blocking", offloaded to `spawn_blocking`).
//
// ============================================================================

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::async_transaction::AsyncTransaction;
use crate::error::Result;
use crate::transaction::Transaction;

/// Distinguishes a commit hook from a rollback hook, for error messages and
/// log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Commit,
    Rollback,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A commit or rollback hook registered on a blocking [`Transaction`].
#[derive(Clone)]
pub struct Hook {
    pub(crate) name: String,
    pub(crate) log_on_run: bool,
    pub(crate) run: Arc<dyn Fn(&Transaction) -> Result<()>>,
}

impl Hook {
    /// Wraps a synchronous callback as a hook. `name` is used in log lines
    /// and in [`crate::error::TxnError::Hook`] when the hook fails.
    pub fn new(name: impl Into<String>, f: impl Fn(&Transaction) -> Result<()> + 'static) -> Self {
        Self {
            name: name.into(),
            log_on_run: true,
            run: Arc::new(f),
        }
    }

    /// Suppresses the run/success/failure log lines around this hook.
    /// Undocumented on the source this crate is modeled on; kept for parity.
    pub fn silent(mut self) -> Self {
        self.log_on_run = false;
        self
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("log_on_run", &self.log_on_run)
            .finish_non_exhaustive()
    }
}

pub(crate) enum AsyncHookBody {
    /// An async callback, awaited in place.
    Cooperative(Arc<dyn Fn(AsyncTransaction) -> BoxFuture<'static, Result<()>> + Send + Sync>),
    /// A blocking callback, offloaded to `spawn_blocking` so the scheduler
    /// is not starved.
    Blocking(Arc<dyn Fn(AsyncTransaction) -> Result<()> + Send + Sync>),
}

/// A commit or rollback hook registered on an [`AsyncTransaction`].
pub struct AsyncHook {
    pub(crate) name: String,
    pub(crate) log_on_run: bool,
    pub(crate) body: AsyncHookBody,
}

impl AsyncHook {
    /// Wraps an async callback, awaited directly by the commit/rollback path.
    pub fn cooperative<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(AsyncTransaction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            log_on_run: true,
            body: AsyncHookBody::Cooperative(Arc::new(move |txn| Box::pin(f(txn)))),
        }
    }

    /// Wraps a blocking callback, run on a worker thread via `spawn_blocking`.
    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(AsyncTransaction) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            log_on_run: true,
            body: AsyncHookBody::Blocking(Arc::new(f)),
        }
    }

    pub fn silent(mut self) -> Self {
        self.log_on_run = false;
        self
    }
}

impl Clone for AsyncHook {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            log_on_run: self.log_on_run,
            body: match &self.body {
                AsyncHookBody::Cooperative(f) => AsyncHookBody::Cooperative(Arc::clone(f)),
                AsyncHookBody::Blocking(f) => AsyncHookBody::Blocking(Arc::clone(f)),
            },
        }
    }
}

impl fmt::Debug for AsyncHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.body {
            AsyncHookBody::Cooperative(_) => "cooperative",
            AsyncHookBody::Blocking(_) => "blocking",
        };
        f.debug_struct("AsyncHook")
            .field("name", &self.name)
            .field("log_on_run", &self.log_on_run)
            .field("kind", &kind)
            .finish()
    }
}
