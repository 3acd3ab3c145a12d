// ============================================================================
// Ambient Context Stacks
// ============================================================================
//
// A single ambient slot per flow of control holds the innermost active
// transaction, so nested scopes and hook callbacks can discover "the current
// transaction" without threading it through every call. The blocking facade
// uses one stack per OS thread; the cooperative facade uses one stack per
// cooperative task, since a task can migrate between worker threads between
// await points and a thread-local would silently observe the wrong frame.
//
// Parent lookup during rollback propagation does *not* re-read this stack:
// by the time a transaction's `reset` runs, it has already popped itself, so
// the parent reference is captured once at `prepare` time and held directly
// by the transaction (see `Transaction::parent` / `AsyncTransaction::parent`).
// This module only backs the initial "what is currently active" discovery.
//
// ============================================================================

use std::cell::RefCell;
use std::future::Future;

use crate::async_transaction::AsyncTransaction;
use crate::transaction::Transaction;

thread_local! {
    static BLOCKING_STACK: RefCell<Vec<Transaction>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn current_blocking() -> Option<Transaction> {
    BLOCKING_STACK.with(|stack| stack.borrow().last().cloned())
}

pub(crate) fn push_blocking(txn: Transaction) {
    BLOCKING_STACK.with(|stack| stack.borrow_mut().push(txn));
}

pub(crate) fn pop_blocking() {
    BLOCKING_STACK.with(|stack| {
        stack.borrow_mut().pop();
    });
}

tokio::task_local! {
    static ASYNC_STACK: RefCell<Vec<AsyncTransaction>>;
}

/// Ensures the task-local stack is initialized for the current task, then
/// runs `f`. The outermost call in a task pays for the `scope` setup; nested
/// calls within the same task reuse the already-initialized stack.
pub(crate) async fn with_async_stack<F, Fut, T>(f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    if ASYNC_STACK.try_with(|_| ()).is_ok() {
        f().await
    } else {
        ASYNC_STACK.scope(RefCell::new(Vec::new()), f()).await
    }
}

pub(crate) fn current_async() -> Option<AsyncTransaction> {
    ASYNC_STACK
        .try_with(|stack| stack.borrow().last().cloned())
        .unwrap_or(None)
}

pub(crate) fn push_async(txn: AsyncTransaction) {
    let _ = ASYNC_STACK.try_with(|stack| stack.borrow_mut().push(txn));
}

pub(crate) fn pop_async() {
    let _ = ASYNC_STACK.try_with(|stack| {
        stack.borrow_mut().pop();
    });
}
