mod common;

use common::setup_pooled;
use std::collections::HashSet;
use std::sync::Arc;
use sqlsession::{CallerId, ConnectParams, ExecMode, Value};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callers_never_share_a_physical_connection() {
    let test = setup_pooled(2, 10, 0, false).await;
    let ctx = Arc::new(test.context);

    let mut handles = Vec::new();
    for i in 0..10 {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let caller = CallerId::new(format!("agent-{i}"));
            ctx.connect(&caller, ConnectParams::Pooled).await.unwrap();
            ctx.connection_id(&caller).await.unwrap()
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        assert!(ids.insert(handle.await.unwrap()), "connection handed out twice");
    }
    assert_eq!(ids.len(), 10);
    assert_eq!(ctx.pool_status().map(|s| s.in_use), Some(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_callers_share_a_small_pool() {
    let test = setup_pooled(1, 5, 0, true).await;
    let ctx = Arc::new(test.context);

    let mut handles = Vec::new();
    for i in 0..20 {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let caller = CallerId::new(format!("agent-{i}"));
            for j in 0..5 {
                ctx.execute(
                    &caller,
                    "INSERT INTO items (name, price) VALUES (?, ?)",
                    vec![Value::from(format!("item-{i}-{j}")), Value::from(j)],
                    ExecMode::Update,
                )
                .await
                .unwrap();
                // Autodisconnect handed the connection back after each insert
                assert_eq!(ctx.connection_id(&caller).await, None);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(ctx.session_count(), 20);
    let stats = ctx.pool_status().unwrap();
    assert_eq!(stats.in_use, 0);
    assert!(stats.idle <= 5);

    let checker = CallerId::from("checker");
    ctx.execute(&checker, "SELECT COUNT(*) FROM items", vec![], ExecMode::Direct)
        .await
        .unwrap();
    assert_eq!(ctx.fetch_row(&checker).await.unwrap(), vec![Value::Number(103.0)]);
}
