// ============================================================================
// Blocking Transaction
// ============================================================================
//
// The blocking facade's state machine: prepare -> begin -> [stage] ->
// commit|rollback -> reset. Mutable state lives behind `Rc<RefCell<Inner>>`
// so a transaction handle can be cheaply cloned into hooks and into the
// ambient context stack while the scope that owns it still holds a usable
// reference; this is a single-thread type (not `Send`), matching "a single
// transaction object is not shared across tasks".
//
// ============================================================================

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bridge;
use crate::context;
use crate::error::{Result, TxnError};
use crate::hook::{Hook, HookKind};
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
    children: Vec<Transaction>,
    on_commit_hooks: Vec<Hook>,
    on_rollback_hooks: Vec<Hook>,
    overwrite: bool,
    write_on_commit: bool,
    stored_values: StoredValues,
    holder: Holder,
    /// Parent captured at `prepare` time; not re-read from the context
    /// stack later, since by `reset` time this transaction has already
    /// popped itself off.
    parent: Option<Transaction>,
    /// Whether this transaction currently occupies a context-stack frame
    /// (the Rust analogue of the source's `_token`).
    entered: bool,
    /// Set once on_commit_hooks have run, on either the normal commit path
    /// or the overwrite=false short-circuit path, so a transaction that was
    /// already COMMITTED at `begin` still runs its hooks exactly once.
    hooks_ran: bool,
}

/// A transaction entered and exited synchronously on the current thread.
///
/// Cloning a `Transaction` clones the handle (an `Rc`), not the underlying
/// state — all clones observe and mutate the same transaction.
#[derive(Clone)]
pub struct Transaction(Rc<RefCell<Inner>>);

impl Transaction {
    pub(crate) fn new(
        key: Option<String>,
        store: Option<Arc<dyn ResultStore>>,
        commit_mode: Option<CommitMode>,
        isolation_level: Option<IsolationLevel>,
        overwrite: bool,
        write_on_commit: bool,
    ) -> Self {
        Self(Rc::new(RefCell::new(Inner {
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

    pub fn state(&self) -> TransactionState {
        self.0.borrow().state
    }

    pub fn key(&self) -> Option<String> {
        self.0.borrow().key.clone()
    }

    pub fn holder(&self) -> Holder {
        self.0.borrow().holder
    }

    pub fn is_committed(&self) -> bool {
        self.state().is_committed()
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state().is_rolled_back()
    }

    /// Sets a stored value scoped to this transaction.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.0.borrow_mut().stored_values.set(name, value);
    }

    /// Gets a stored value, delegating to the parent chain and finally to
    /// `default` if not found locally.
    pub fn get(&self, name: &str, default: Option<Value>) -> Result<Value> {
        if let Some(value) = self.0.borrow().stored_values.get_local(name) {
            return Ok(value);
        }
        let parent = self.0.borrow().parent.clone();
        if let Some(parent) = parent {
            return parent.get(name, default);
        }
        default.ok_or_else(|| TxnError::UnknownKey(name.to_string()))
    }

    /// Registers the active ambient transaction (if any) as this
    /// transaction's parent and moves it to `Active`, inheriting
    /// `commit_mode`/`isolation_level` from the parent when unset.
    pub(crate) fn prepare(&self) -> Result<()> {
        {
            let inner = self.0.borrow();
            if inner.entered {
                return Err(TxnError::Reentry);
            }
        }

        let parent = context::current_blocking();

        {
            let mut inner = self.0.borrow_mut();
            if inner.commit_mode.is_none() {
                inner.commit_mode = Some(
                    parent
                        .as_ref()
                        .and_then(|p| p.0.borrow().commit_mode)
                        .unwrap_or(CommitMode::Lazy),
                );
            }
            if inner.isolation_level.is_none() {
                inner.isolation_level = Some(
                    parent
                        .as_ref()
                        .and_then(|p| p.0.borrow().isolation_level)
                        .unwrap_or(IsolationLevel::ReadCommitted),
                );
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
        }
        Ok(())
    }

    /// Acquires the serializable lock (if applicable) and short-circuits to
    /// `Committed` if a record already exists at `key` and `overwrite` is
    /// false.
    pub(crate) fn begin(&self) -> Result<()> {
        let (store, key, isolation_level, overwrite, holder) = {
            let inner = self.0.borrow();
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
                bridge::block_on(store.acquire_lock(key, holder))?;
            }
            if !overwrite && bridge::block_on(store.exists(key))? {
                self.0.borrow_mut().state = TransactionState::Committed;
            }
        }
        Ok(())
    }

    /// Returns the record stored under `key`, if `store` and `key` are set.
    pub fn read(&self) -> Result<Option<crate::store::ResultRecord>> {
        let (store, key, holder) = {
            let inner = self.0.borrow();
            (inner.store.clone(), inner.key.clone(), inner.holder)
        };
        match (store, key) {
            (Some(store), Some(key)) => bridge::block_on(store.read(&key, holder)),
            _ => Ok(None),
        }
    }

    /// Stages a value to be committed later. Hooks are always registered,
    /// even once the transaction has already reached `Committed` (the
    /// `overwrite=false` short-circuit) so they still run once at `commit`;
    /// the staged value and state transition are skipped in that case.
    pub fn stage(
        &self,
        value: impl Into<StagedValue>,
        on_commit_hooks: Vec<Hook>,
        on_rollback_hooks: Vec<Hook>,
    ) {
        let mut inner = self.0.borrow_mut();
        inner.on_commit_hooks.extend(on_commit_hooks);
        inner.on_rollback_hooks.extend(on_rollback_hooks);
        if inner.state.is_committed() {
            return;
        }
        inner.staged_value = Some(value.into());
        inner.state = TransactionState::Staged;
    }

    /// Idempotent. Commits children, runs commit hooks, writes the staged
    /// value if configured, and releases the serializable lock. Returns
    /// `false` if the transaction was already terminal, or if commit failed
    /// and fell back to rollback.
    pub fn commit(&self) -> bool {
        let key = self.0.borrow().key.clone();

        if self.0.borrow().state.is_terminal() {
            if self.0.borrow().state.is_committed() && !self.0.borrow().hooks_ran {
                self.run_commit_hooks_once();
            }
            self.release_lock_if_serializable();
            return false;
        }

        match self.try_commit() {
            Ok(()) => {
                self.0.borrow_mut().state = TransactionState::Committed;
                self.release_lock_if_serializable();
                true
            }
            Err(TxnError::Serialization { source, .. }) => {
                warn!(
                    key = ?key,
                    error = %source,
                    "encountered an error while serializing result for transaction; \
                     execution will continue, but the transaction will not be committed"
                );
                if let Err(err) = self.rollback() {
                    tracing::error!(error = %err, "rollback triggered by a serialization failure also failed");
                }
                false
            }
            Err(err) => {
                tracing::error!(key = ?key, error = %err, "an error was encountered while committing transaction");
                if let Err(err) = self.rollback() {
                    tracing::error!(error = %err, "rollback triggered by a commit failure also failed");
                }
                false
            }
        }
    }

    fn try_commit(&self) -> Result<()> {
        let children = self.0.borrow().children.clone();
        for child in &children {
            child.commit();
        }

        let commit_hooks = self.0.borrow().on_commit_hooks.clone();
        for hook in &commit_hooks {
            self.run_hook(hook, HookKind::Commit)?;
        }
        self.0.borrow_mut().hooks_ran = true;

        let (store, key, write_on_commit, staged_value, holder) = {
            let inner = self.0.borrow();
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
                        bridge::block_on(store.persist_result_record(record, holder))?;
                    }
                    StagedValue::Value(value) => {
                        bridge::block_on(store.write(key, value, holder))?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Runs commit hooks once for a transaction that reached COMMITTED via
    /// the `overwrite=false` short-circuit in `begin` (so `try_commit`'s
    /// normal path, which also writes the staged value, never ran).
    /// Hook failures here are logged, not propagated: the transaction is
    /// already terminal and there is nothing left to roll back.
    fn run_commit_hooks_once(&self) {
        let commit_hooks = self.0.borrow().on_commit_hooks.clone();
        for hook in &commit_hooks {
            if let Err(err) = self.run_hook(hook, HookKind::Commit) {
                tracing::error!(error = %err, "commit hook failed for an already-committed transaction");
            }
        }
        self.0.borrow_mut().hooks_ran = true;
    }

    fn run_hook(&self, hook: &Hook, kind: HookKind) -> Result<()> {
        if hook.log_on_run {
            info!(hook = %hook.name, %kind, "running hook");
        }
        match (hook.run)(self) {
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
    pub fn rollback(&self) -> Result<bool> {
        if self.0.borrow().state.is_terminal() {
            return Ok(false);
        }

        let result = self.try_rollback();
        self.release_lock_if_serializable();

        if let Err(err) = &result {
            tracing::error!(error = %err, "an error was encountered while rolling back transaction");
        }
        result.map(|()| true)
    }

    fn try_rollback(&self) -> Result<()> {
        let rollback_hooks = self.0.borrow().on_rollback_hooks.clone();
        let mut hook_err = None;
        for hook in rollback_hooks.iter().rev() {
            if let Err(err) = self.run_hook(hook, HookKind::Rollback) {
                hook_err = Some(err);
                break;
            }
        }

        // State transitions to RolledBack and children still roll back even
        // if a hook failed; the failure is only surfaced after this point.
        self.0.borrow_mut().state = TransactionState::RolledBack;

        let children = self.0.borrow().children.clone();
        for child in children.iter().rev() {
            if let Err(err) = child.rollback() {
                tracing::error!(error = %err, "child transaction failed to roll back");
            }
        }

        match hook_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn release_lock_if_serializable(&self) {
        let (store, key, isolation_level, holder) = {
            let inner = self.0.borrow();
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
                let _ = bridge::block_on(store.release_lock(key, holder));
            }
        }
    }

    /// Pops this transaction from the ambient context stack. If a parent
    /// exists, it adopts this transaction as a child; if this transaction
    /// ended rolled back, the parent is then told to roll back too.
    pub(crate) fn reset(&self) -> Result<()> {
        if !self.0.borrow().entered {
            return Err(TxnError::AsymmetricExit);
        }

        let parent = self.0.borrow().parent.clone();
        if let Some(parent) = &parent {
            parent.0.borrow_mut().children.push(self.clone());
        }

        context::pop_blocking();
        self.0.borrow_mut().entered = false;

        if let Some(parent) = parent {
            if self.0.borrow().state.is_rolled_back() {
                if let Err(err) = parent.rollback() {
                    tracing::error!(error = %err, "parent transaction failed to roll back during propagation");
                }
            }
        }
        Ok(())
    }

    pub(crate) fn enter(&self) {
        context::push_blocking(self.clone());
        self.0.borrow_mut().entered = true;
    }

    pub(crate) fn commit_mode(&self) -> CommitMode {
        self.0
            .borrow()
            .commit_mode
            .unwrap_or(CommitMode::Lazy)
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.0.borrow().parent.is_some()
    }
}
