use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use flowtxn::{
    with_transaction, CommitMode, Hook, InMemoryResultStore, IsolationLevel, ResultRecord,
    ResultStore, ScopeOptions, TransactionState, TxnError,
};
use serde_json::{json, Value};

/// A store whose generic `write` always reports a serialization failure,
/// exercising the commit-time downgrade-to-rollback path without needing a
/// real codec that can actually fail to encode a `serde_json::Value`.
struct RejectingStore;

#[async_trait]
impl ResultStore for RejectingStore {
    async fn exists(&self, _key: &str) -> flowtxn::Result<bool> {
        Ok(false)
    }

    async fn read(
        &self,
        _key: &str,
        _holder: flowtxn::Holder,
    ) -> flowtxn::Result<Option<ResultRecord>> {
        Ok(None)
    }

    async fn write(&self, key: &str, _value: Value, _holder: flowtxn::Holder) -> flowtxn::Result<()> {
        Err(TxnError::Serialization {
            key: Some(key.to_string()),
            source: serde_json::from_str::<Value>("not json").unwrap_err(),
        })
    }

    async fn persist_result_record(
        &self,
        record: ResultRecord,
        _holder: flowtxn::Holder,
    ) -> flowtxn::Result<()> {
        Err(TxnError::Serialization {
            key: Some(record.key),
            source: serde_json::from_str::<Value>("not json").unwrap_err(),
        })
    }

    async fn acquire_lock(&self, _key: &str, _holder: flowtxn::Holder) -> flowtxn::Result<()> {
        Ok(())
    }

    async fn release_lock(&self, _key: &str, _holder: flowtxn::Holder) -> flowtxn::Result<()> {
        Ok(())
    }

    fn supports_isolation_level(&self, _level: IsolationLevel) -> bool {
        true
    }
}

#[test]
fn lazy_without_parent_commits_at_exit() {
    let state = with_transaction(ScopeOptions::new().commit_mode(CommitMode::Lazy), |txn| {
        txn.stage(json!("x"), vec![], vec![]);
        Ok(txn.clone())
    })
    .unwrap()
    .state();
    assert_eq!(state, TransactionState::Committed);
}

#[test]
fn off_without_parent_rolls_back_at_exit() {
    let state = with_transaction(ScopeOptions::new().commit_mode(CommitMode::Off), |txn| {
        txn.stage(json!("x"), vec![], vec![]);
        Ok(txn.clone())
    })
    .unwrap()
    .state();
    assert_eq!(state, TransactionState::RolledBack);
}

#[test]
fn rollback_hooks_run_in_reverse_registration_order() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let o1 = order.clone();
    let o2 = order.clone();

    let outcome: Result<(), TxnError> = with_transaction(
        ScopeOptions::new().commit_mode(CommitMode::Off),
        move |txn| {
            txn.stage(
                json!("x"),
                vec![],
                vec![
                    Hook::new("first", move |_| {
                        o1.borrow_mut().push("first");
                        Ok(())
                    }),
                    Hook::new("second", move |_| {
                        o2.borrow_mut().push("second");
                        Ok(())
                    }),
                ],
            );
            Ok(())
        },
    );

    outcome.unwrap();
    assert_eq!(*order.borrow(), vec!["second", "first"]);
}

#[test]
fn serializable_lock_is_released_even_when_rollback_hook_fails() {
    let store = InMemoryResultStore::new();
    let shared: Arc<dyn ResultStore> = Arc::new(store.clone());

    let outcome: Result<(), TxnError> = with_transaction(
        ScopeOptions::new()
            .key("locked-key")
            .store(Arc::clone(&shared))
            .isolation_level(IsolationLevel::Serializable)
            .commit_mode(CommitMode::Off),
        |txn| {
            txn.stage(
                json!("x"),
                vec![],
                vec![Hook::new("failing", |_| {
                    Err(TxnError::Configuration("rollback hook exploded".into()))
                })],
            );
            Ok(())
        },
    );

    // the body itself succeeded, so the exit decision's own CommitMode::Off
    // rollback runs and its failing hook becomes the scope's own error.
    assert!(matches!(outcome, Err(TxnError::Hook { .. })));

    // regardless, a second transaction can immediately acquire the same
    // key's lock, proving the first transaction's lock was released.
    with_transaction(
        ScopeOptions::new()
            .key("locked-key")
            .store(Arc::clone(&shared))
            .isolation_level(IsolationLevel::Serializable)
            .commit_mode(CommitMode::Eager),
        |txn| {
            txn.stage(json!("y"), vec![], vec![]);
            Ok(())
        },
    )
    .unwrap();

    assert!(store.contains("locked-key"));
}

#[test]
fn unsupported_isolation_level_is_a_configuration_error() {
    let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::without_serializable());

    let outcome: Result<(), TxnError> = with_transaction(
        ScopeOptions::new()
            .key("k")
            .store(store)
            .isolation_level(IsolationLevel::Serializable),
        |txn| {
            txn.stage(json!("x"), vec![], vec![]);
            Ok(())
        },
    );

    assert!(matches!(outcome, Err(TxnError::Configuration(_))));
}

#[test]
fn serialization_failure_downgrades_to_rollback_without_propagating() {
    let rolled_back = Rc::new(RefCell::new(false));
    let rolled_back2 = rolled_back.clone();
    let store: Arc<dyn ResultStore> = Arc::new(RejectingStore);

    let outcome: Result<bool, TxnError> = with_transaction(
        ScopeOptions::new()
            .key("k")
            .store(store)
            .commit_mode(CommitMode::Eager),
        move |txn| {
            txn.stage(
                json!("unserializable"),
                vec![],
                vec![Hook::new("mark", move |_| {
                    *rolled_back2.borrow_mut() = true;
                    Ok(())
                })],
            );
            Ok(txn.commit())
        },
    );

    // commit() itself returns false (no panic, no propagated error) and the
    // rollback hooks still ran.
    assert_eq!(outcome.unwrap(), false);
    assert!(*rolled_back.borrow());
}

#[test]
fn commit_and_rollback_are_idempotent() {
    let committed_twice = with_transaction(ScopeOptions::new(), |txn| {
        txn.stage(json!(1), vec![], vec![]);
        assert!(txn.commit());
        assert!(!txn.commit());
        Ok(())
    });
    assert!(committed_twice.is_ok());
}
