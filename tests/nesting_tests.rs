use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use flowtxn::{
    with_transaction, with_transaction_async, CommitMode, Hook, InMemoryResultStore,
    ResultStore, ScopeOptions, TransactionState,
};
use serde_json::json;

#[test]
fn happy_path_lazy_no_key_commits_with_one_hook_run() {
    let runs = Rc::new(RefCell::new(0));
    let runs2 = runs.clone();

    let state = with_transaction(ScopeOptions::new(), move |txn| {
        txn.stage(
            json!(42),
            vec![Hook::new("count", move |_| {
                *runs2.borrow_mut() += 1;
                Ok(())
            })],
            vec![],
        );
        Ok(txn.state())
    })
    .unwrap();

    assert_eq!(state, TransactionState::Staged);
    assert_eq!(*runs.borrow(), 1);
}

#[test]
fn eager_inner_commits_before_outer_exits() {
    let store = InMemoryResultStore::new();
    let shared: Arc<dyn ResultStore> = Arc::new(store.clone());

    with_transaction(
        ScopeOptions::new().commit_mode(CommitMode::Lazy),
        move |_outer| {
            with_transaction(
                ScopeOptions::new()
                    .key("k1")
                    .store(Arc::clone(&shared))
                    .commit_mode(CommitMode::Eager),
                |inner| {
                    inner.stage(json!("x"), vec![], vec![]);
                    Ok(())
                },
            )?;
            // the inner transaction has already committed and written,
            // independent of whatever the outer scope does next.
            assert!(store.contains("k1"));
            Ok(())
        },
    )
    .unwrap();

    assert!(store.contains("k1"));
}

#[test]
fn error_in_body_rolls_back_nested_transactions() {
    let rolled_back = Rc::new(RefCell::new(false));
    let rolled_back2 = rolled_back.clone();

    let outcome: Result<(), flowtxn::TxnError> = with_transaction(ScopeOptions::new(), move |_outer| {
        with_transaction(ScopeOptions::new(), move |inner| {
            inner.stage(
                json!("x"),
                vec![],
                vec![Hook::new("mark", move |_| {
                    *rolled_back2.borrow_mut() = true;
                    Ok(())
                })],
            );
            Err(flowtxn::TxnError::UnknownKey("simulated failure".into()))
        })
    });

    assert!(outcome.is_err());
    assert!(*rolled_back.borrow());
}

#[test]
fn overwrite_false_short_circuits_to_committed() {
    let store = InMemoryResultStore::new();
    let shared: Arc<dyn ResultStore> = Arc::new(store.clone());

    // Pre-populate the key outside of any transaction.
    let pre_store = Arc::clone(&shared);
    with_transaction(
        ScopeOptions::new()
            .key("k")
            .store(Arc::clone(&pre_store))
            .commit_mode(CommitMode::Eager),
        |txn| {
            txn.stage(json!("first"), vec![], vec![]);
            Ok(())
        },
    )
    .unwrap();
    assert!(store.contains("k"));

    let hook_runs = Rc::new(RefCell::new(0));
    let hook_runs2 = hook_runs.clone();

    let final_state = with_transaction(
        ScopeOptions::new()
            .key("k")
            .store(Arc::clone(&shared))
            .overwrite(false)
            .commit_mode(CommitMode::Eager),
        move |txn| {
            assert_eq!(txn.state(), TransactionState::Committed);
            txn.stage(
                json!("second"),
                vec![Hook::new("count", move |_| {
                    *hook_runs2.borrow_mut() += 1;
                    Ok(())
                })],
                vec![],
            );
            Ok(txn.state())
        },
    )
    .unwrap();

    assert_eq!(final_state, TransactionState::Committed);
    assert_eq!(*hook_runs.borrow(), 1);
}

#[tokio::test]
async fn async_nested_scopes_defer_commit_to_parent() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let order2 = Arc::clone(&order);
    let order3 = Arc::clone(&order);

    with_transaction_async(ScopeOptions::new(), move |outer| async move {
        with_transaction_async(ScopeOptions::new(), move |inner| async move {
            inner
                .stage(
                    json!(1),
                    vec![flowtxn::AsyncHook::cooperative("inner", move |_| {
                        let order4 = Arc::clone(&order2);
                        async move {
                            order4.lock().unwrap().push("inner");
                            Ok(())
                        }
                    })],
                    vec![],
                )
                .await;
            Ok(())
        })
        .await?;
        outer
            .stage(
                json!(2),
                vec![flowtxn::AsyncHook::cooperative("outer", move |_| {
                    let order5 = Arc::clone(&order3);
                    async move {
                        order5.lock().unwrap().push("outer");
                        Ok(())
                    }
                })],
                vec![],
            )
            .await;
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["inner", "outer"]);
}
