//! End-to-end tests over loopback TCP.
//!
//! Each test starts its own controller and engines on free ports:
//! 1. Direct and load-balanced calls
//! 2. Remote errors and dependency failures
//! 3. Namespace operations
//! 4. Registration, unregistration and controller bookkeeping

use std::collections::BTreeMap;
use std::time::Duration;

use parallax_client::ApplyOptions;
use parallax_common::{Dependency, FunctionRef, Object, ParallelError, PurgeTarget, RemoteError};
use parallax_engine::{Engine, EngineConfig};

mod common;
use common::{registry, Cluster, HEARTBEAT, WAIT};

fn double() -> FunctionRef {
    FunctionRef::new("demo", "double")
}

fn divide() -> FunctionRef {
    FunctionRef::new("demo", "divide")
}

fn no_kwargs() -> BTreeMap<String, Object> {
    BTreeMap::new()
}

fn expect_remote(err: ParallelError) -> RemoteError {
    match err {
        ParallelError::Remote(remote) => remote,
        other => panic!("expected a remote error, got {:?}", other),
    }
}

// ============================================================================
// Calls
// ============================================================================

#[tokio::test]
async fn test_direct_apply() {
    let (_cluster, client) = Cluster::with_engines(1).await;
    let target = client.ids()[0];

    let result = client
        .apply(&double(), vec![Object::Int(2)], no_kwargs(), ApplyOptions::on(vec![target]))
        .await
        .unwrap();

    assert_eq!(result.get_one(Some(WAIT)).await.unwrap(), Object::Int(4));
    assert!(result.successful());
}

#[tokio::test]
async fn test_load_balanced_apply() {
    let (_cluster, client) = Cluster::with_engines(2).await;

    let result = client
        .apply(&double(), vec![Object::Int(21)], no_kwargs(), ApplyOptions::blocking())
        .await
        .unwrap();

    assert!(result.ready());
    assert_eq!(result.get_one(None).await.unwrap(), Object::Int(42));
}

#[tokio::test]
async fn test_apply_to_every_engine() {
    let (_cluster, client) = Cluster::with_engines(3).await;

    let result = client
        .apply(&double(), vec![Object::Int(5)], no_kwargs(), ApplyOptions::on(client.ids()))
        .await
        .unwrap();

    assert_eq!(result.msg_ids().len(), 3);
    assert_eq!(result.get(Some(WAIT)).await.unwrap(), vec![Object::Int(10); 3]);
}

#[tokio::test]
async fn test_unknown_target_is_rejected() {
    let (_cluster, client) = Cluster::with_engines(1).await;

    let err = client
        .apply(&double(), vec![Object::Int(1)], no_kwargs(), ApplyOptions::on(vec![99]))
        .await
        .unwrap_err();
    assert!(matches!(err, ParallelError::NoSuchEngine(99)));
}

#[tokio::test]
async fn test_barrier() {
    let (_cluster, client) = Cluster::with_engines(2).await;

    let mut msg_ids = Vec::new();
    for n in 0..6 {
        let result = client
            .apply(&double(), vec![Object::Int(n)], no_kwargs(), ApplyOptions::default())
            .await
            .unwrap();
        msg_ids.extend(result.msg_ids().to_vec());
    }

    assert!(client.barrier(&msg_ids, Some(WAIT)).await);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_remote_error_is_reraised() {
    let (_cluster, client) = Cluster::with_engines(1).await;

    let result = client
        .apply(
            &divide(),
            vec![Object::Int(1), Object::Int(0)],
            no_kwargs(),
            ApplyOptions::default(),
        )
        .await
        .unwrap();

    let remote = expect_remote(result.get_one(Some(WAIT)).await.unwrap_err());
    assert_eq!(remote.ename, "ZeroDivisionError");
    assert_eq!(remote.evalue, "division by zero");
    assert!(remote.engine_info.is_some());
    assert!(!result.successful());
}

#[tokio::test]
async fn test_failed_dependency_is_unmet() {
    let (_cluster, client) = Cluster::with_engines(1).await;

    let failing = client
        .apply(
            &divide(),
            vec![Object::Int(1), Object::Int(0)],
            no_kwargs(),
            ApplyOptions::default(),
        )
        .await
        .unwrap();
    assert!(failing.wait(Some(WAIT)).await);

    let dependent = client
        .apply(
            &double(),
            vec![Object::Int(1)],
            no_kwargs(),
            ApplyOptions {
                after: Some(Dependency::all(failing.msg_ids().to_vec())),
                ..ApplyOptions::default()
            },
        )
        .await
        .unwrap();

    let remote = expect_remote(dependent.get_one(Some(WAIT)).await.unwrap_err());
    assert!(remote.is_unmet_dependency(), "got {}", remote);
}

#[tokio::test]
async fn test_dependency_waits_for_success() {
    let (_cluster, client) = Cluster::with_engines(2).await;

    let first = client
        .apply(
            &FunctionRef::new("demo", "sleep"),
            vec![Object::Int(200)],
            no_kwargs(),
            ApplyOptions::default(),
        )
        .await
        .unwrap();
    let second = client
        .apply(
            &double(),
            vec![Object::Int(8)],
            no_kwargs(),
            ApplyOptions {
                after: Some(Dependency::all(first.msg_ids().to_vec())),
                ..ApplyOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(second.get_one(Some(WAIT)).await.unwrap(), Object::Int(16));
    assert!(first.ready());
}

#[tokio::test]
async fn test_abort_queued_request() {
    let (_cluster, client) = Cluster::with_engines(1).await;
    let target = client.ids()[0];

    let busy = client
        .apply(
            &FunctionRef::new("demo", "sleep"),
            vec![Object::Int(500)],
            no_kwargs(),
            ApplyOptions::on(vec![target]),
        )
        .await
        .unwrap();
    let queued = client
        .apply(&double(), vec![Object::Int(1)], no_kwargs(), ApplyOptions::on(vec![target]))
        .await
        .unwrap();
    client.abort(queued.msg_ids(), Some(vec![target])).await.unwrap();

    assert!(busy.get_one(Some(WAIT)).await.is_ok());
    let remote = expect_remote(queued.get_one(Some(WAIT)).await.unwrap_err());
    assert_eq!(remote.ename, RemoteError::ABORTED);
}

// ============================================================================
// Namespace
// ============================================================================

#[tokio::test]
async fn test_push_pull_clear() {
    let (_cluster, client) = Cluster::with_engines(2).await;

    let mut values = BTreeMap::new();
    values.insert("a".to_string(), Object::Int(7));
    values.insert("b".to_string(), Object::Str("seven".to_string()));
    let pushed = client.push(values, None, true).await.unwrap();
    assert!(pushed.successful());

    let pulled = client.pull(&["a"], None, true).await.unwrap();
    assert_eq!(pulled.get(None).await.unwrap(), vec![Object::Int(7); 2]);

    let both = client.pull(&["a", "b"], Some(vec![client.ids()[0]]), true).await.unwrap();
    assert_eq!(
        both.get_one(None).await.unwrap(),
        Object::List(vec![Object::Int(7), Object::Str("seven".to_string())])
    );

    client.clear(None).await.unwrap();
    let missing = client.pull(&["a"], None, true).await.unwrap();
    let remote = expect_remote(missing.get(None).await.unwrap_err());
    assert_eq!(remote.ename, RemoteError::KEY_ERROR);
}

// ============================================================================
// Registration and bookkeeping
// ============================================================================

#[tokio::test]
async fn test_duplicate_queue_identity_rejected() {
    let cluster = Cluster::start().await;
    let config = EngineConfig {
        ident: Some("engine-a".to_string()),
        ..cluster.engine_config()
    };

    let _first = Engine::start(config.clone(), registry()).await.unwrap();
    let err = Engine::start(config, registry()).await.err().expect("second registration should fail");
    match err {
        ParallelError::Registration(reason) => assert!(reason.contains("in use"), "got {}", reason),
        other => panic!("expected a registration error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_engine_shutdown_unregisters() {
    let (cluster, client) = Cluster::with_engines(1).await;
    let engine = cluster.add_engine().await;
    let id = engine.id();
    engine.spawn();
    assert!(client.wait_for_engines(2, WAIT).await);

    client.shutdown(Some(vec![id]), false).await.unwrap();

    let mut gone = false;
    for _ in 0..100 {
        if !client.ids().contains(&id) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "engine {} should be unregistered", id);
    assert_eq!(client.ids().len(), 1);
}

#[tokio::test]
async fn test_pending_request_fails_when_engine_leaves() {
    let (cluster, client) = Cluster::with_engines(0).await;
    let engine = cluster.add_engine().await;
    let id = engine.id();
    engine.spawn();
    assert!(client.wait_for_engines(1, WAIT).await);

    let running = client
        .apply(
            &FunctionRef::new("demo", "sleep"),
            vec![Object::Int(1000)],
            no_kwargs(),
            ApplyOptions::on(vec![id]),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.shutdown(Some(vec![id]), false).await.unwrap();

    let remote = expect_remote(running.get_one(Some(WAIT)).await.unwrap_err());
    assert!(remote.is_engine_error(), "got {}", remote);
}

#[tokio::test]
async fn test_silent_engine_is_evicted() {
    let (cluster, client) = Cluster::with_engines(0).await;
    let engine = cluster.add_engine().await;
    let id = engine.id();
    let serving = engine.spawn();
    assert!(client.wait_for_engines(1, WAIT).await);

    let direct = client
        .apply(
            &FunctionRef::new("demo", "sleep"),
            vec![Object::Int(1000)],
            no_kwargs(),
            ApplyOptions::on(vec![id]),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let balanced = client
        .apply(&double(), vec![Object::Int(1)], no_kwargs(), ApplyOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Dropping the engine stops its heart without unregistering.
    serving.abort();
    assert!(serving.await.unwrap_err().is_cancelled());

    let mut gone = false;
    let deadline = tokio::time::Instant::now() + HEARTBEAT * 6;
    while tokio::time::Instant::now() < deadline {
        if !client.ids().contains(&id) {
            gone = true;
            break;
        }
        tokio::time::sleep(HEARTBEAT / 5).await;
    }
    assert!(gone, "engine {} should be evicted after missing beats", id);

    let remote = expect_remote(direct.get_one(Some(WAIT)).await.unwrap_err());
    assert!(remote.is_engine_error(), "direct request got {}", remote);
    let remote = expect_remote(balanced.get_one(Some(WAIT)).await.unwrap_err());
    assert!(remote.is_engine_error(), "balanced request got {}", remote);
}

#[tokio::test]
async fn test_controller_bookkeeping() {
    let (_cluster, client) = Cluster::with_engines(1).await;
    let target = client.ids()[0];

    let result = client
        .apply(&double(), vec![Object::Int(3)], no_kwargs(), ApplyOptions::on(vec![target]))
        .await
        .unwrap();
    assert!(result.wait(Some(WAIT)).await);
    let msg_ids = result.msg_ids().to_vec();

    // The controller may see the reply a moment after the client does.
    let mut status = serde_json::Value::Null;
    for _ in 0..100 {
        status = client.result_status(&msg_ids, false).await.unwrap();
        if status["completed"].as_array().map(|c| c.len()) == Some(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status["completed"][0], msg_ids[0].as_str());
    assert_eq!(status[&msg_ids[0]]["content"]["status"], "ok");

    let queues = client.queue_status(None, false).await.unwrap();
    assert_eq!(queues[target.to_string()]["completed"], 1);
    assert_eq!(queues[target.to_string()]["queue"], 0);

    client.purge_results(PurgeTarget::all(), vec![]).await.unwrap();
    let err = client.result_status(&msg_ids, true).await.unwrap_err();
    assert_eq!(expect_remote(err).ename, RemoteError::KEY_ERROR);
}

#[tokio::test]
async fn test_controller_shutdown() {
    let (cluster, client) = Cluster::with_engines(0).await;

    client.shutdown(Some(vec![]), true).await.unwrap();
    tokio::time::timeout(WAIT, cluster.controller.wait())
        .await
        .expect("controller should stop after a shutdown request");
}
