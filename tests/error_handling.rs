//! Error handling and edge case tests.

use std::fs;
use std::sync::Arc;
use std::time::Duration;
use subscription_broker::{
    AuthUser, Broker, BrokerConfig, BrokerError, CoreOp, GatewayConfig, InMemoryCore,
    StoreConfig, SubscriptionId,
};
use tempfile::TempDir;

fn config(dir: &TempDir) -> BrokerConfig {
    BrokerConfig {
        store: StoreConfig {
            path: dir.path().join("broker"),
            create_if_missing: true,
        },
        ..Default::default()
    }
}

fn broker() -> (Broker, Arc<InMemoryCore>) {
    let core = Arc::new(InMemoryCore::new());
    core.add_entity("e1");
    (Broker::in_memory(BrokerConfig::default(), core.clone()), core)
}

fn alice() -> AuthUser {
    AuthUser::new("alice", "tenant-1")
}

// --- Store Errors ---

#[test]
fn test_second_broker_on_same_store_is_locked() {
    let dir = TempDir::new().unwrap();
    let core = Arc::new(InMemoryCore::new());

    let _first = Broker::open(config(&dir), core.clone()).unwrap();
    let second = Broker::open(config(&dir), core);
    assert!(matches!(second, Err(BrokerError::Locked)));
}

#[test]
fn test_foreign_manifest_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broker");
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join("MANIFEST"), b"RST\0\x01").unwrap();

    let result = Broker::open(config(&dir), Arc::new(InMemoryCore::new()));
    assert!(matches!(result, Err(BrokerError::InvalidFormat(_))));
}

#[test]
fn test_truncated_index_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let core = Arc::new(InMemoryCore::new());
    {
        let broker = Broker::open(config(&dir), core.clone()).unwrap();
        broker
            .engine()
            .create_subscription(&alice(), "Home", "")
            .unwrap();
    }

    let index = dir.path().join("broker").join("subscriptions.bin");
    fs::write(&index, b"SBI\0").unwrap();

    let result = Broker::open(config(&dir), core);
    assert!(matches!(result, Err(BrokerError::Io(_))));
}

#[test]
fn test_missing_store_without_create() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.store.create_if_missing = false;

    let result = Broker::open(config, Arc::new(InMemoryCore::new()));
    assert!(matches!(result, Err(BrokerError::NotInitialized)));
}

// --- Config Errors ---

#[test]
fn test_missing_config_file() {
    let dir = TempDir::new().unwrap();
    let result = BrokerConfig::from_json_file(dir.path().join("nope.json"));
    assert!(matches!(result, Err(BrokerError::Io(_))));
}

#[test]
fn test_config_with_wrong_types() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broker.json");
    fs::write(&path, r#"{"gateway": {"call_timeout_ms": "soon"}}"#).unwrap();

    let result = BrokerConfig::from_json_file(&path);
    assert!(matches!(result, Err(BrokerError::Deserialization(_))));
}

// --- Caller Errors ---

#[test]
fn test_missing_user_is_unauthenticated() {
    let (broker, _) = broker();
    let anonymous = AuthUser::new("", "tenant-1");

    assert!(matches!(
        broker.engine().list_subscriptions(&anonymous),
        Err(BrokerError::Unauthenticated(_))
    ));
    assert!(matches!(
        broker.engine().create_subscription(&anonymous, "Home", ""),
        Err(BrokerError::Unauthenticated(_))
    ));
}

#[test]
fn test_other_users_subscription() {
    let (broker, core) = broker();
    let sub = broker
        .engine()
        .create_subscription(&alice(), "Home", "")
        .unwrap();
    let bob = AuthUser::new("bob", "tenant-1");

    assert!(matches!(
        broker.engine().get_subscription(&bob, sub.id),
        Err(BrokerError::Unauthorized(_))
    ));
    assert!(matches!(
        broker.engine().rename_subscription(&bob, sub.id, "Mine"),
        Err(BrokerError::Unauthorized(_))
    ));
    assert!(matches!(
        broker.engine().subscribe_entities(&bob, sub.id, &["e1"]),
        Err(BrokerError::Unauthorized(_))
    ));
    assert_eq!(core.call_count(CoreOp::Subscribe), 0);
}

#[test]
fn test_unknown_subscription() {
    let (broker, _) = broker();
    assert!(matches!(
        broker.engine().create_binding(&alice(), SubscriptionId(42), "e1"),
        Err(BrokerError::NotFound(_))
    ));
    assert!(matches!(
        broker.engine().delete_subscription(&alice(), SubscriptionId(42)),
        Err(BrokerError::NotFound(_))
    ));
}

#[test]
fn test_invalid_input() {
    let (broker, _) = broker();
    let sub = broker
        .engine()
        .create_subscription(&alice(), "Home", "")
        .unwrap();

    assert!(matches!(
        broker.engine().create_binding(&alice(), sub.id, ""),
        Err(BrokerError::Validation(_))
    ));
    assert!(matches!(
        broker.engine().rename_subscription(&alice(), sub.id, "a@b"),
        Err(BrokerError::Validation(_))
    ));
    assert!(matches!(
        broker.engine().create_subscription(&alice(), "   ", ""),
        Err(BrokerError::Validation(_))
    ));
    assert!(matches!(
        broker.engine().update_tenant(&alice(), ""),
        Err(BrokerError::Validation(_))
    ));

    // A rejected rename leaves the title alone
    let detail = broker.engine().get_subscription(&alice(), sub.id).unwrap();
    assert_eq!(detail.subscription.title, "Home");
}

// --- Gateway Errors ---

#[test]
fn test_slow_gateway_times_out() {
    let core = Arc::new(InMemoryCore::new());
    core.add_entity("e1");
    let config = BrokerConfig {
        gateway: GatewayConfig {
            call_timeout_ms: 20,
            ..Default::default()
        },
        ..Default::default()
    };
    let broker = Broker::in_memory(config, core.clone());
    let sub = broker
        .engine()
        .create_subscription(&alice(), "Home", "")
        .unwrap();

    core.set_latency(Duration::from_millis(200));
    let result = broker.engine().create_binding(&alice(), sub.id, "e1");
    match result {
        Err(e) => assert!(e.is_gateway(), "unexpected error: {e}"),
        Ok(_) => panic!("binding should have timed out"),
    }

    assert!(broker
        .engine()
        .list_bound_entities(&alice(), sub.id)
        .unwrap()
        .is_empty());
}

#[test]
fn test_partial_failure_message() {
    let err = BrokerError::PartialFailure {
        succeeded: vec!["a".into(), "b".into()],
        failed: vec![("c".into(), "Already exists: c".into())],
    };
    assert_eq!(err.to_string(), "Partial failure: 2 succeeded, 1 failed");
    assert!(!err.is_gateway());
}
