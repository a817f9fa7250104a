//! Realtime fanout tests driven end to end: upstream publish, dispatcher,
//! router and client sessions over in-process channels.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use subscription_broker::gateway::realtime_handle;
use subscription_broker::{
    Broker, BrokerConfig, ChannelReader, ChannelWriter, ClientId, ClientSession, InMemoryCore,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Client {
    requests: Sender<Vec<u8>>,
    updates: Receiver<Vec<u8>>,
    session: ClientSession,
}

impl Client {
    fn connect(broker: &Broker) -> Self {
        let (requests, inbound) = unbounded();
        let (outbound, updates) = unbounded();
        let session = broker
            .connect(ChannelReader(inbound), ChannelWriter(outbound))
            .unwrap();
        Self {
            requests,
            updates,
            session,
        }
    }

    fn id(&self) -> ClientId {
        self.session.id()
    }

    fn watch(&self, broker: &Broker, entity_id: &str) {
        self.requests
            .send(format!(r#"{{"id":"{entity_id}"}}"#).into_bytes())
            .unwrap();
        let id = self.id();
        wait_until(|| broker.router().entity_of(id).as_deref() == Some(entity_id));
    }

    fn next(&self) -> serde_json::Value {
        let bytes = self.updates.recv_timeout(RECV_TIMEOUT).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Close the connection and wait for the session to wind down.
    fn disconnect(self) {
        drop(self.requests);
        self.session.join().unwrap();
    }
}

fn setup() -> (Broker, Arc<InMemoryCore>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let core = Arc::new(InMemoryCore::new());
    let broker = Broker::in_memory(BrokerConfig::default(), core.clone());
    (broker, core)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn handle(entity_id: &str) -> String {
    realtime_handle(entity_id, "realtime")
}

#[test]
fn test_shared_route_delivers_in_order() {
    let (broker, core) = setup();
    let dispatcher = broker.start_dispatcher(core.connect_updates(64)).unwrap();

    let a = Client::connect(&broker);
    let b = Client::connect(&broker);
    a.watch(&broker, "e1");
    b.watch(&broker, "e1");
    assert_eq!(core.subscribe_count(&handle("e1")), 1);

    for seq in 1..=3 {
        assert_eq!(core.publish("e1", json!({ "seq": seq })), 1);
    }
    for client in [&a, &b] {
        for seq in 1..=3 {
            assert_eq!(client.next(), json!({ "seq": seq }));
        }
    }

    a.disconnect();
    b.disconnect();
    assert_eq!(core.unsubscribe_count(&handle("e1")), 1);
    assert!(!core.is_active(&handle("e1")));

    core.disconnect_updates();
    assert_eq!(dispatcher.join().unwrap(), 3);
}

#[test]
fn test_rebind_switches_stream() {
    let (broker, core) = setup();
    let _dispatcher = broker.start_dispatcher(core.connect_updates(64)).unwrap();

    let a = Client::connect(&broker);
    let b = Client::connect(&broker);
    a.watch(&broker, "e1");
    b.watch(&broker, "e1");

    a.watch(&broker, "e2");
    assert!(core.is_active(&handle("e1")));
    assert!(core.is_active(&handle("e2")));

    core.publish("e1", json!({ "for": "b" }));
    core.publish("e2", json!({ "for": "a" }));

    assert_eq!(b.next(), json!({ "for": "b" }));
    assert_eq!(a.next(), json!({ "for": "a" }));
    assert!(a.updates.try_recv().is_err());

    // The last client leaving e1 tears its route down
    b.watch(&broker, "e2");
    assert!(!core.is_active(&handle("e1")));
    assert_eq!(broker.router().clients_of("e2"), {
        let mut ids = vec![a.id(), b.id()];
        ids.sort();
        ids
    });
}

#[test]
fn test_disconnect_and_reattach() {
    let (broker, core) = setup();

    let a = Client::connect(&broker);
    a.watch(&broker, "e3");
    a.disconnect();

    // Disconnect detaches synchronously
    assert_eq!(core.unsubscribe_count(&handle("e3")), 1);
    assert!(!broker.router().is_routed("e3"));

    let b = Client::connect(&broker);
    b.watch(&broker, "e3");
    assert_eq!(core.subscribe_count(&handle("e3")), 2);
    assert!(core.is_active(&handle("e3")));
}

#[test]
fn test_idle_client_ends_cleanly() {
    let (broker, core) = setup();

    let idle = Client::connect(&broker);
    idle.disconnect();

    assert_eq!(broker.router().stats().clients, 0);
    assert!(core.active_handles().is_empty());
}

#[test]
fn test_malformed_requests_are_ignored() {
    let (broker, core) = setup();
    let _dispatcher = broker.start_dispatcher(core.connect_updates(64)).unwrap();

    let a = Client::connect(&broker);
    a.requests.send(b"not json".to_vec()).unwrap();
    a.requests.send(br#"{"id":""}"#.to_vec()).unwrap();
    a.watch(&broker, "e1");

    core.publish("e1", json!({ "ok": true }));
    assert_eq!(a.next(), json!({ "ok": true }));
    assert_eq!(broker.router().stats().routes, 1);
}

#[test]
fn test_stalled_client_does_not_block_others() {
    let (broker, core) = setup();
    let _dispatcher = broker.start_dispatcher(core.connect_updates(64)).unwrap();

    // Attached straight to the router with a buffer nobody drains
    let (stalled_tx, _stalled_rx) = bounded(1);
    let stalled = broker.router().next_client_id();
    broker.router().attach(stalled, "e1", stalled_tx).unwrap();

    let fast = Client::connect(&broker);
    fast.watch(&broker, "e1");

    for seq in 0..5 {
        core.publish("e1", json!({ "seq": seq }));
    }
    for seq in 0..5 {
        assert_eq!(fast.next(), json!({ "seq": seq }));
    }

    wait_until(|| broker.router().stats().dropped == 4);
}
