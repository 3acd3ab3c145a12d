// ============================================================================
// Cooperative Transaction
// ============================================================================
//
// The async twin of `Transaction`. Mutable state lives behind
// `Arc<Mutex<Inner>>` so a handle is `Send`/`Sync` and can cross `.await`
// points and worker threads; store calls are real `.await`s instead of
// going through the local-runtime bridge.
//
// ============================================================================

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context;
use crate::error::{Result, TxnError};
use crate::hook::{AsyncHook, AsyncHookBody, HookKind};
use crate::state::{CommitMode, Holder, IsolationLevel, TransactionState};
use crate::store::{ResultStore, StagedValue};
use crate::values::StoredValues;

struct Inner {
    key: Option<String>,
    store: Option<Arc<dyn ResultStore>>,
    commit_mode: Option<CommitMode>,
    isolation_level: Option<IsolationLevel>,
    state: TransactionState,
    staged_value: Option<StagedValue>,
    children: Vec<AsyncTransaction>,
    on_commit_hooks: Vec<AsyncHook>,
    on_rollback_hooks: Vec<AsyncHook>,
    overwrite: bool,
    write_on_commit: bool,
    stored_values: StoredValues,
    holder: Holder,
    parent: Option<AsyncTransaction>,
    entered: bool,
    /// Set once on_commit_hooks have run, on either the normal commit path
    /// or the overwrite=false short-circuit path, so a transaction that was
    /// already COMMITTED at `begin` still runs its hooks exactly once.
    hooks_ran: bool,
}

/// A transaction entered and exited across `.await` points, possibly on
/// different worker threads between them.
///
/// Cloning an `AsyncTransaction` clones the handle (an `Arc`) — all clones
/// observe and mutate the same transaction.
#[derive(Clone)]
pub struct AsyncTransaction(Arc<Mutex<Inner>>);

impl AsyncTransaction {
    pub(crate) fn new(
        key: Option<String>,
        store: Option<Arc<dyn ResultStore>>,
        commit_mode: Option<CommitMode>,
        isolation_level: Option<IsolationLevel>,
        overwrite: bool,
        write_on_commit: bool,
    ) -> Self {
        Self(Arc::new(Mutex::new(Inner {
            key,
            store,
            commit_mode,
            isolation_level,
            state: TransactionState::Pending,
            staged_value: None,
            children: Vec::new(),
            on_commit_hooks: Vec::new(),
            on_rollback_hooks: Vec::new(),
            overwrite,
            write_on_commit,
            stored_values: StoredValues::new(),
            holder: Holder::new(),
            parent: None,
            entered: false,
            hooks_ran: false,
        })))
    }

    pub async fn state(&self) -> TransactionState {
        self.0.lock().await.state
    }

    pub async fn key(&self) -> Option<String> {
        self.0.lock().await.key.clone()
    }

    pub async fn holder(&self) -> Holder {
        self.0.lock().await.holder
    }

    pub async fn is_committed(&self) -> bool {
        self.state().await.is_committed()
    }

    pub async fn is_rolled_back(&self) -> bool {
        self.state().await.is_rolled_back()
    }

    pub async fn set(&self, name: impl Into<String>, value: Value) {
        self.0.lock().await.stored_values.set(name, value);
    }

    pub async fn get(&self, name: &str, default: Option<Value>) -> Result<Value> {
        let (local, parent) = {
            let inner = self.0.lock().await;
            (inner.stored_values.get_local(name), inner.parent.clone())
        };
        if let Some(value) = local {
            return Ok(value);
        }
        if let Some(parent) = parent {
            return Box::pin(parent.get(name, default)).await;
        }
        default.ok_or_else(|| TxnError::UnknownKey(name.to_string()))
    }

    pub(crate) async fn prepare(&self) -> Result<()> {
        {
            let inner = self.0.lock().await;
            if inner.entered {
                return Err(TxnError::Reentry);
            }
        }

        let parent = context::current_async();

        let mut inner = self.0.lock().await;
        if inner.commit_mode.is_none() {
            let parent_mode = match &parent {
                Some(p) => Some(p.0.lock().await.commit_mode.unwrap_or(CommitMode::Lazy)),
                None => None,
            };
            inner.commit_mode = Some(parent_mode.unwrap_or(CommitMode::Lazy));
        }
        if inner.isolation_level.is_none() {
            let parent_level = match &parent {
                Some(p) => Some(
                    p.0.lock()
                        .await
                        .isolation_level
                        .unwrap_or(IsolationLevel::ReadCommitted),
                ),
                None => None,
            };
            inner.isolation_level = Some(parent_level.unwrap_or(IsolationLevel::ReadCommitted));
        }

        let isolation_level = inner.isolation_level.expect("set above");
        if let (Some(store), Some(_key)) = (&inner.store, &inner.key) {
            if !store.supports_isolation_level(isolation_level) {
                return Err(TxnError::Configuration(format!(
                    "isolation level {isolation_level:?} is not supported by the configured store"
                )));
            }
        }

        inner.parent = parent;
        inner.state = TransactionState::Active;
        Ok(())
    }

    pub(crate) async fn begin(&self) -> Result<()> {
        let (store, key, isolation_level, overwrite, holder) = {
            let inner = self.0.lock().await;
            (
                inner.store.clone(),
                inner.key.clone(),
                inner.isolation_level,
                inner.overwrite,
                inner.holder,
            )
        };

        if let (Some(store), Some(key)) = (&store, &key) {
            if isolation_level == Some(IsolationLevel::Serializable) {
                debug!(%key, %holder, "acquiring lock for transaction");
                store.acquire_lock(key, holder).await?;
            }
            if !overwrite && store.exists(key).await? {
                self.0.lock().await.state = TransactionState::Committed;
            }
        }
        Ok(())
    }

    pub async fn read(&self) -> Result<Option<crate::store::ResultRecord>> {
        let (store, key, holder) = {
            let inner = self.0.lock().await;
            (inner.store.clone(), inner.key.clone(), inner.holder)
        };
        match (store, key) {
            (Some(store), Some(key)) => store.read(&key, holder).await,
            _ => Ok(None),
        }
    }

    /// Stages a value to be committed later. Hooks are always registered,
    /// even once the transaction has already reached `Committed` (the
    /// `overwrite=false` short-circuit) so they still run once at `commit`;
    /// the staged value and state transition are skipped in that case.
    pub async fn stage(
        &self,
        value: impl Into<StagedValue>,
        on_commit_hooks: Vec<AsyncHook>,
        on_rollback_hooks: Vec<AsyncHook>,
    ) {
        let mut inner = self.0.lock().await;
        inner.on_commit_hooks.extend(on_commit_hooks);
        inner.on_rollback_hooks.extend(on_rollback_hooks);
        if inner.state.is_committed() {
            return;
        }
        inner.staged_value = Some(value.into());
        inner.state = TransactionState::Staged;
    }

    pub async fn commit(&self) -> bool {
        let key = self.0.lock().await.key.clone();

        if self.0.lock().await.state.is_terminal() {
            let (is_committed, hooks_ran) = {
                let inner = self.0.lock().await;
                (inner.state.is_committed(), inner.hooks_ran)
            };
            if is_committed && !hooks_ran {
                self.run_commit_hooks_once().await;
            }
            self.release_lock_if_serializable().await;
            return false;
        }

        match Box::pin(self.try_commit()).await {
            Ok(()) => {
                self.0.lock().await.state = TransactionState::Committed;
                self.release_lock_if_serializable().await;
                true
            }
            Err(TxnError::Serialization { source, .. }) => {
                warn!(
                    key = ?key,
                    error = %source,
                    "encountered an error while serializing result for transaction; \
                     execution will continue, but the transaction will not be committed"
                );
                if let Err(err) = self.rollback().await {
                    tracing::error!(error = %err, "rollback triggered by a serialization failure also failed");
                }
                false
            }
            Err(err) => {
                tracing::error!(key = ?key, error = %err, "an error was encountered while committing transaction");
                if let Err(err) = self.rollback().await {
                    tracing::error!(error = %err, "rollback triggered by a commit failure also failed");
                }
                false
            }
        }
    }

    async fn try_commit(&self) -> Result<()> {
        let children = self.0.lock().await.children.clone();
        for child in &children {
            Box::pin(child.commit()).await;
        }

        let commit_hooks = self.0.lock().await.on_commit_hooks.clone();
        for hook in &commit_hooks {
            self.run_hook(hook, HookKind::Commit).await?;
        }
        self.0.lock().await.hooks_ran = true;

        let (store, key, write_on_commit, staged_value, holder) = {
            let inner = self.0.lock().await;
            (
                inner.store.clone(),
                inner.key.clone(),
                inner.write_on_commit,
                inner.staged_value.clone(),
                inner.holder,
            )
        };

        if let (Some(store), Some(key), true) = (&store, &key, write_on_commit) {
            if let Some(staged) = staged_value {
                match staged {
                    StagedValue::Record(record) => {
                        store.persist_result_record(record, holder).await?;
                    }
                    StagedValue::Value(value) => {
                        store.write(key, value, holder).await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Runs commit hooks once for a transaction that reached COMMITTED via
    /// the `overwrite=false` short-circuit in `begin`. Hook failures here
    /// are logged, not propagated: the transaction is already terminal.
    async fn run_commit_hooks_once(&self) {
        let commit_hooks = self.0.lock().await.on_commit_hooks.clone();
        for hook in &commit_hooks {
            if let Err(err) = self.run_hook(hook, HookKind::Commit).await {
                tracing::error!(error = %err, "commit hook failed for an already-committed transaction");
            }
        }
        self.0.lock().await.hooks_ran = true;
    }

    async fn run_hook(&self, hook: &AsyncHook, kind: HookKind) -> Result<()> {
        if hook.log_on_run {
            info!(hook = %hook.name, %kind, "running hook");
        }
        let result = match &hook.body {
            AsyncHookBody::Cooperative(f) => {
                let fut = f(self.clone());
                fut.await
            }
            AsyncHookBody::Blocking(f) => {
                let f = Arc::clone(f);
                let txn = self.clone();
                tokio::task::spawn_blocking(move || f(txn))
                    .await
                    .map_err(|err| TxnError::Hook {
                        kind,
                        hook_name: hook.name.clone(),
                        message: format!("hook task panicked: {err}"),
                    })?
            }
        };
        match result {
            Ok(()) => {
                if hook.log_on_run {
                    info!(hook = %hook.name, %kind, "hook finished successfully");
                }
                Ok(())
            }
            Err(err) => {
                if hook.log_on_run {
                    tracing::error!(hook = %hook.name, %kind, error = %err, "hook failed");
                }
                Err(TxnError::Hook {
                    kind,
                    hook_name: hook.name.clone(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Idempotent. Runs rollback hooks in reverse, then rolls back children
    /// in reverse insertion order. The serializable lock is always released,
    /// even if a rollback hook fails. Returns `Ok(false)` if the transaction
    /// was already terminal; `Ok(true)` on a clean rollback; `Err` if a
    /// rollback hook failed — the state has already reached `RolledBack`,
    /// children have already been rolled back, and the lock has already been
    /// released by the time the error is returned.
    pub async fn rollback(&self) -> Result<bool> {
        if self.0.lock().await.state.is_terminal() {
            return Ok(false);
        }

        let result = Box::pin(self.try_rollback()).await;
        self.release_lock_if_serializable().await;

        if let Err(err) = &result {
            tracing::error!(error = %err, "an error was encountered while rolling back transaction");
        }
        result.map(|()| true)
    }

    async fn try_rollback(&self) -> Result<()> {
        let rollback_hooks = self.0.lock().await.on_rollback_hooks.clone();
        let mut hook_err = None;
        for hook in rollback_hooks.iter().rev() {
            if let Err(err) = self.run_hook(hook, HookKind::Rollback).await {
                hook_err = Some(err);
                break;
            }
        }

        // State transitions to RolledBack and children still roll back even
        // if a hook failed; the failure is only surfaced after this point.
        self.0.lock().await.state = TransactionState::RolledBack;

        let children = self.0.lock().await.children.clone();
        for child in children.iter().rev() {
            if let Err(err) = Box::pin(child.rollback()).await {
                tracing::error!(error = %err, "child transaction failed to roll back");
            }
        }

        match hook_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn release_lock_if_serializable(&self) {
        let (store, key, isolation_level, holder) = {
            let inner = self.0.lock().await;
            (
                inner.store.clone(),
                inner.key.clone(),
                inner.isolation_level,
                inner.holder,
            )
        };
        if let (Some(store), Some(key)) = (&store, &key) {
            if isolation_level == Some(IsolationLevel::Serializable) {
                debug!(%key, %holder, "releasing lock for transaction");
                let _ = store.release_lock(key, holder).await;
            }
        }
    }

    pub(crate) async fn reset(&self) -> Result<()> {
        if !self.0.lock().await.entered {
            return Err(TxnError::AsymmetricExit);
        }

        let parent = self.0.lock().await.parent.clone();
        if let Some(parent) = &parent {
            parent.0.lock().await.children.push(self.clone());
        }

        context::pop_async();
        self.0.lock().await.entered = false;

        if let Some(parent) = parent {
            if self.0.lock().await.state.is_rolled_back() {
                if let Err(err) = Box::pin(parent.rollback()).await {
                    tracing::error!(error = %err, "parent transaction failed to roll back during propagation");
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn enter(&self) {
        context::push_async(self.clone());
        self.0.lock().await.entered = true;
    }

    pub(crate) async fn commit_mode(&self) -> CommitMode {
        self.0.lock().await.commit_mode.unwrap_or(CommitMode::Lazy)
    }

    pub(crate) async fn has_parent(&self) -> bool {
        self.0.lock().await.parent.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fresh() -> AsyncTransaction {
        AsyncTransaction::new(None, None, None, None, false, true)
    }

    #[tokio::test]
    async fn prepare_then_begin_moves_to_active() {
        let txn = fresh();
        txn.prepare().await.unwrap();
        txn.begin().await.unwrap();
        assert_eq!(txn.state().await, TransactionState::Active);
    }

    #[tokio::test]
    async fn reentry_is_rejected() {
        let txn = fresh();
        txn.prepare().await.unwrap();
        txn.enter().await;
        assert!(matches!(txn.prepare().await, Err(TxnError::Reentry)));
    }

    #[tokio::test]
    async fn exit_without_enter_is_asymmetric() {
        let txn = fresh();
        assert!(matches!(txn.reset().await, Err(TxnError::AsymmetricExit)));
    }

    #[tokio::test]
    async fn stage_then_commit_runs_cooperative_hook_once() {
        let txn = fresh();
        txn.prepare().await.unwrap();
        txn.begin().await.unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        txn.stage(
            json!(42),
            vec![AsyncHook::cooperative("count", move |_| {
                let ran3 = Arc::clone(&ran2);
                async move {
                    ran3.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })],
            vec![],
        )
        .await;
        assert!(txn.commit().await);
        assert!(!txn.commit().await);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blocking_hook_runs_on_a_worker_thread() {
        let txn = fresh();
        txn.prepare().await.unwrap();
        txn.begin().await.unwrap();
        txn.stage(
            json!("x"),
            vec![AsyncHook::blocking("noop", |_| Ok(()))],
            vec![],
        )
        .await;
        assert!(txn.commit().await);
    }

    #[tokio::test]
    async fn child_rollback_propagates_to_parent() {
        let parent = fresh();
        parent.prepare().await.unwrap();
        parent.begin().await.unwrap();
        parent.enter().await;

        let child = fresh();
        child.prepare().await.unwrap();
        child.begin().await.unwrap();
        child.enter().await;
        child.rollback().await.unwrap();
        child.reset().await.unwrap();

        assert!(parent.state().await.is_rolled_back());
        parent.reset().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_hook_failure_is_propagated_after_state_transitions() {
        let txn = fresh();
        txn.prepare().await.unwrap();
        txn.begin().await.unwrap();
        txn.stage(
            json!("x"),
            vec![],
            vec![AsyncHook::cooperative("boom", |_| async {
                Err(TxnError::Configuration("rollback hook exploded".into()))
            })],
        )
        .await;
        // The hook failure reaches the caller of rollback()...
        let err = txn.rollback().await.unwrap_err();
        assert!(matches!(err, TxnError::Hook { .. }));
        // ...but only after the transaction has already reached its
        // terminal state, rather than getting stuck Staged.
        assert_eq!(txn.state().await, TransactionState::RolledBack);
    }
}
