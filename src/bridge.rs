// ============================================================================
// Local Runtime Bridge
// ============================================================================
//
// The result store adapter contract (§ store.rs) is a single async trait
// shared by both facades. The blocking transaction drives it to completion
// through a single-threaded Tokio runtime, built lazily the first time a
// thread needs one and cached in a thread-local for reuse by later calls on
// that same thread. `Runtime::block_on` panics if called from a thread
// already running inside a Tokio runtime, so that case is detected up front
// and surfaced as a typed `TxnError::Configuration` instead.
//
// ============================================================================

use std::cell::RefCell;

use tokio::runtime::{Handle, Runtime};

use crate::error::{Result, TxnError};

thread_local! {
    static LOCAL_RUNTIME: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

/// Drives `fut` to completion on this thread's cached local runtime.
///
/// Returns `Err(TxnError::Configuration(..))` instead of panicking if this
/// thread is already running inside an active Tokio runtime.
pub(crate) fn block_on<T, F>(fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    if Handle::try_current().is_ok() {
        return Err(TxnError::Configuration(
            "a blocking transaction scope cannot be entered from a thread already running \
             inside an active Tokio runtime; use the cooperative (async) scope instead"
                .to_string(),
        ));
    }

    LOCAL_RUNTIME.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            let runtime = Runtime::new().map_err(|err| {
                TxnError::Configuration(format!("failed to start local runtime: {err}"))
            })?;
            *slot = Some(runtime);
        }
        Ok(slot.as_ref().expect("just initialized above").block_on(fut)?)
    })
}
