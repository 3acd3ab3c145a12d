// ============================================================================
// Scope Entry Points
// ============================================================================
//
// Two facades construct, enter, and exit a transaction around user code:
// `with_transaction` (blocking) and `with_transaction_async` (cooperative).
// Both resolve a default store when `key` is set but `store` is not, clear
// a null metadata sink, enter the transaction onto the ambient stack, run
// the caller's closure, and apply the scope-exit decision table before
// popping back off the stack.
//
// ============================================================================

use std::cell::Cell;
use std::sync::Arc;

use tracing::Span;

use crate::async_transaction::AsyncTransaction;
use crate::context;
use crate::error::Result;
use crate::state::{CommitMode, IsolationLevel};
use crate::store::{self, ResultStore};
use crate::transaction::Transaction;

pub use crate::store::{clear_default_store, set_default_store};

/// Builder for the options a scope is opened with.
///
/// Fields left unset are resolved at scope entry: `commit_mode` and
/// `isolation_level` inherit from the ambient parent (falling back to
/// `Lazy`/`ReadCommitted`), `store` is resolved from the process-wide
/// default store if `key` is set, and `span` falls back to the current
/// tracing span, then to a crate-level span.
#[derive(Default, Clone)]
pub struct ScopeOptions {
    key: Option<String>,
    store: Option<Arc<dyn ResultStore>>,
    commit_mode: Option<CommitMode>,
    isolation_level: Option<IsolationLevel>,
    overwrite: bool,
    write_on_commit: bool,
    span: Option<Span>,
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self {
            overwrite: false,
            write_on_commit: true,
            ..Default::default()
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = Some(mode);
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn write_on_commit(mut self, write_on_commit: bool) -> Self {
        self.write_on_commit = write_on_commit;
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    fn resolve_store(&self) -> Result<Option<Arc<dyn ResultStore>>> {
        let store = match &self.store {
            Some(store) => Some(Arc::clone(store)),
            None if self.key.is_some() => Some(store::resolve_default_store()?),
            None => None,
        };
        Ok(store.map(store::clear_null_metadata))
    }

    fn resolve_span(&self) -> Span {
        self.span
            .clone()
            .unwrap_or_else(|| {
                let current = Span::current();
                if current.is_disabled() {
                    tracing::info_span!("transaction")
                } else {
                    current
                }
            })
    }
}

/// Runs `f` with a freshly entered blocking transaction, applying the
/// scope-exit decision table once `f` returns (or, via the guard's `Drop`,
/// if `f` panics).
pub fn with_transaction<T>(
    opts: ScopeOptions,
    f: impl FnOnce(&Transaction) -> Result<T>,
) -> Result<T> {
    let store = opts.resolve_store()?;
    let span = opts.resolve_span();
    let _entered = span.enter();

    let txn = Transaction::new(
        opts.key.clone(),
        store,
        opts.commit_mode,
        opts.isolation_level,
        opts.overwrite,
        opts.write_on_commit,
    );

    txn.prepare()?;
    txn.begin()?;
    txn.enter();

    let guard = ScopeGuard::new(txn.clone());
    let body_result = f(&txn);
    let exit_result = guard.finish(body_result.is_ok());

    match body_result {
        Ok(value) => exit_result.map(|_| value),
        Err(err) => Err(err),
    }
}

struct ScopeGuard {
    txn: Transaction,
    finished: Cell<bool>,
}

impl ScopeGuard {
    fn new(txn: Transaction) -> Self {
        Self {
            txn,
            finished: Cell::new(false),
        }
    }

    fn finish(&self, success: bool) -> Result<()> {
        if self.finished.replace(true) {
            return Ok(());
        }
        let result = apply_exit_decision(&self.txn, success);
        let _ = self.txn.reset();
        result
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.finished.get() {
            // f panicked before calling finish(); treat as the "exception" row.
            let _ = self.finish(false);
        }
    }
}

/// Applies the scope-exit decision table. When the body already failed, a
/// secondary rollback-hook failure during cleanup is only logged — the
/// body's own error is what the caller sees. When the body succeeded and
/// the exit decision's own rollback (the `CommitMode::Off`, no-parent row)
/// hits a hook failure, that error has nothing to compete with and becomes
/// the scope's own result.
fn apply_exit_decision(txn: &Transaction, success: bool) -> Result<()> {
    if !success {
        if let Err(err) = txn.rollback() {
            tracing::error!(error = %err, "rollback triggered by scope exit failed");
        }
        return Ok(());
    }
    match txn.commit_mode() {
        CommitMode::Eager => {
            txn.commit();
            Ok(())
        }
        _ if txn.has_parent() => {
            // Parent inherits commit responsibility.
            Ok(())
        }
        CommitMode::Off => txn.rollback().map(|_| ()),
        CommitMode::Lazy => {
            txn.commit();
            Ok(())
        }
    }
}

/// Runs `f` with a freshly entered cooperative transaction, applying the
/// scope-exit decision table after `f`'s future resolves (including when it
/// returns `Err`), before popping the transaction off the ambient stack.
///
/// See the crate's cancellation notes: if the returned future is dropped
/// before completion (e.g. under `tokio::select!` or `JoinHandle::abort`),
/// this function cannot run its cleanup — wrap the *whole* call, not the
/// body alone, in anything that might cancel it.
pub async fn with_transaction_async<T, F, Fut>(opts: ScopeOptions, f: F) -> Result<T>
where
    F: FnOnce(AsyncTransaction) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    context::with_async_stack(|| async move {
        let store = opts.resolve_store()?;
        let span = opts.resolve_span();
        let _entered = span.enter();

        let txn = AsyncTransaction::new(
            opts.key.clone(),
            store,
            opts.commit_mode,
            opts.isolation_level,
            opts.overwrite,
            opts.write_on_commit,
        );

        txn.prepare().await?;
        txn.begin().await?;
        txn.enter().await;

        let body_result = f(txn.clone()).await;
        let exit_result = apply_exit_decision_async(&txn, body_result.is_ok()).await;
        let _ = txn.reset().await;

        match body_result {
            Ok(value) => exit_result.map(|_| value),
            Err(err) => Err(err),
        }
    })
    .await
}

async fn apply_exit_decision_async(txn: &AsyncTransaction, success: bool) -> Result<()> {
    if !success {
        if let Err(err) = txn.rollback().await {
            tracing::error!(error = %err, "rollback triggered by scope exit failed");
        }
        return Ok(());
    }
    match txn.commit_mode().await {
        CommitMode::Eager => {
            txn.commit().await;
            Ok(())
        }
        _ if txn.has_parent().await => Ok(()),
        CommitMode::Off => txn.rollback().await.map(|_| ()),
        CommitMode::Lazy => {
            txn.commit().await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryResultStore;
    use serde_json::json;

    #[test]
    fn lazy_no_key_commits_on_clean_exit() {
        let result = with_transaction(ScopeOptions::new(), |txn| {
            txn.stage(json!(42), vec![], vec![]);
            Ok(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn body_error_rolls_back() {
        let outcome: Result<()> = with_transaction(ScopeOptions::new(), |txn| {
            txn.stage(json!("x"), vec![], vec![]);
            Err(crate::error::TxnError::UnknownKey("boom".into()))
        });
        assert!(outcome.is_err());
    }

    #[test]
    fn eager_inner_commits_before_outer() {
        let concrete = InMemoryResultStore::new();
        let store: Arc<dyn ResultStore> = Arc::new(concrete.clone());
        with_transaction(
            ScopeOptions::new().commit_mode(CommitMode::Lazy),
            move |_outer| {
                with_transaction(
                    ScopeOptions::new()
                        .key("k1")
                        .store(Arc::clone(&store))
                        .commit_mode(CommitMode::Eager),
                    |inner| {
                        inner.stage(json!("x"), vec![], vec![]);
                        Ok(())
                    },
                )
            },
        )
        .unwrap();

        assert!(concrete.contains("k1"));
    }

    #[tokio::test]
    async fn async_happy_path_commits() {
        let result = with_transaction_async(ScopeOptions::new(), |txn| async move {
            txn.stage(json!(1), vec![], vec![]).await;
            Ok(())
        })
        .await;
        assert!(result.is_ok());
    }
}
