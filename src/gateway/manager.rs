//! Deterministic-handle wrapper over a [`CoreClient`].

use super::client::{CoreClient, PatchOperation};
use crate::config::GatewayConfig;
use crate::descriptor::{self, MEMBERSHIP_PATH};
use crate::error::{BrokerError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Prefix of binding handles.
pub const HANDLE_PREFIX: &str = "cb-";

/// Handle for a binding's upstream subscription.
///
/// Pure function of entity and endpoint, so creating and deleting by handle
/// is idempotent and needs no lookup table.
pub fn binding_handle(entity_id: &str, endpoint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_id.as_bytes());
    hasher.update(endpoint.as_bytes());
    let digest = hasher.finalize();
    format!("{HANDLE_PREFIX}{}", hex::encode(&digest[..16]))
}

/// Handle for a realtime route's upstream subscription.
///
/// Inbound envelopes carry this as their id; the entity is the part before
/// the first `@`.
pub fn realtime_handle(entity_id: &str, topic: &str) -> String {
    format!("{entity_id}{}{topic}", descriptor::FIELD_SEPARATOR)
}

/// Direction of a membership patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipChange {
    Add,
    Remove,
}

/// Upstream call queued for a gateway worker.
type Job = Box<dyn FnOnce(&dyn CoreClient) + Send>;

/// Gateway to the external pub/sub and entity property services.
///
/// With a call timeout configured, upstream calls run on a fixed pool of
/// worker threads fed through a bounded queue. A hung upstream ties up at
/// most the pool; further calls fail fast once the queue is full.
pub struct SubscriptionGateway {
    client: Arc<dyn CoreClient>,
    config: GatewayConfig,
    jobs: Option<Sender<Job>>,
}

impl SubscriptionGateway {
    pub fn new(client: Arc<dyn CoreClient>, config: GatewayConfig) -> Self {
        let jobs = match config.call_timeout() {
            Some(_) => spawn_workers(&client, &config),
            None => None,
        };
        Self {
            client,
            config,
            jobs,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Subscribe the binding (entity, endpoint) upstream. Idempotent.
    pub fn ensure_subscribed(&self, entity_id: &str, endpoint: &str, user_id: &str) -> Result<()> {
        let handle = binding_handle(entity_id, endpoint);
        debug!(%handle, entity_id, endpoint, "ensure subscribed");

        let (entity_id, endpoint, user_id) =
            (entity_id.to_string(), endpoint.to_string(), user_id.to_string());
        self.call("subscribe", move |client| {
            client.subscribe(&handle, &entity_id, &endpoint, &user_id)
        })
    }

    /// Remove the binding's upstream subscription. Safe if it never existed.
    pub fn ensure_unsubscribed(&self, entity_id: &str, endpoint: &str, user_id: &str) -> Result<()> {
        let handle = binding_handle(entity_id, endpoint);
        debug!(%handle, entity_id, endpoint, "ensure unsubscribed");

        let user_id = user_id.to_string();
        self.call("unsubscribe", move |client| client.unsubscribe(&handle, &user_id))
    }

    /// Subscribe the realtime topic for an entity as the service user.
    pub fn activate_route(&self, entity_id: &str) -> Result<()> {
        let topic = self.config.realtime_topic.clone();
        let user = self.config.service_user.clone();
        let handle = realtime_handle(entity_id, &topic);
        debug!(%handle, "activate realtime route");

        let entity_id = entity_id.to_string();
        self.call("subscribe", move |client| {
            client.subscribe(&handle, &entity_id, &topic, &user)
        })
    }

    /// Drop the realtime topic subscription for an entity.
    pub fn deactivate_route(&self, entity_id: &str) -> Result<()> {
        let user = self.config.service_user.clone();
        let handle = realtime_handle(entity_id, &self.config.realtime_topic);
        debug!(%handle, "deactivate realtime route");

        self.call("unsubscribe", move |client| client.unsubscribe(&handle, &user))
    }

    /// Read an entity's membership list.
    pub fn membership(&self, entity_id: &str) -> Result<String> {
        let entity_id = entity_id.to_string();
        self.call("get property", move |client| {
            client.get_entity_property(&entity_id, MEMBERSHIP_PATH)
        })
    }

    /// Add or remove one descriptor in an entity's membership list.
    ///
    /// Read-modify-write with no cross-process lock: concurrent patches of
    /// the same entity can lose updates.
    pub fn patch_membership(
        &self,
        entity_id: &str,
        descriptor: &str,
        change: MembershipChange,
    ) -> Result<()> {
        let current = self.membership(entity_id)?;
        let next = match change {
            MembershipChange::Add => descriptor::add(&current, descriptor),
            MembershipChange::Remove => descriptor::remove(&current, descriptor),
        };
        if next == current {
            debug!(entity_id, ?change, "membership already up to date");
            return Ok(());
        }

        debug!(entity_id, ?change, %next, "patch membership");
        let entity_id = entity_id.to_string();
        let patch = vec![PatchOperation::replace(MEMBERSHIP_PATH, next)];
        self.call("patch", move |client| client.patch_entity(&entity_id, &patch))
    }

    /// Run an upstream call under the configured timeout.
    ///
    /// A call that outlives the timeout keeps its worker busy until it
    /// returns; its result is discarded.
    fn call<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CoreClient) -> Result<T> + Send + 'static,
    {
        let (Some(timeout), Some(jobs)) = (self.config.call_timeout(), self.jobs.as_ref()) else {
            return f(self.client.as_ref());
        };

        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move |client: &dyn CoreClient| {
            let _ = tx.send(f(client));
        });
        jobs.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!(op, "gateway saturated, rejecting call");
                BrokerError::GatewayUnavailable(format!("{op}: gateway saturated"))
            }
            TrySendError::Disconnected(_) => {
                BrokerError::GatewayUnavailable(format!("{op}: gateway workers stopped"))
            }
        })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(op, ?timeout, "gateway call timed out");
                Err(BrokerError::GatewayUnavailable(format!(
                    "{op} timed out after {timeout:?}"
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(BrokerError::GatewayUnavailable(format!(
                "{op} worker exited without a result"
            ))),
        }
    }
}

/// Start the worker pool. Returns `None` if no worker could be started, in
/// which case calls run inline without a timeout.
fn spawn_workers(client: &Arc<dyn CoreClient>, config: &GatewayConfig) -> Option<Sender<Job>> {
    let (tx, rx) = bounded::<Job>(config.queue_capacity);

    let mut started = 0;
    for i in 0..config.workers.max(1) {
        let client = Arc::clone(client);
        let rx: Receiver<Job> = rx.clone();
        let spawned = thread::Builder::new()
            .name(format!("gateway-worker-{i}"))
            .spawn(move || {
                // Exits once the gateway, and with it the queue sender, is dropped.
                for job in rx.iter() {
                    job(client.as_ref());
                }
            });
        match spawned {
            Ok(_) => started += 1,
            Err(e) => warn!(worker = i, error = %e, "failed to start gateway worker"),
        }
    }

    if started == 0 {
        warn!("no gateway workers running, upstream calls will not time out");
        return None;
    }
    debug!(workers = started, queue = config.queue_capacity, "gateway workers started");
    Some(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::{CoreOp, InMemoryCore};
    use std::time::Duration;

    fn gateway(core: &Arc<InMemoryCore>) -> SubscriptionGateway {
        SubscriptionGateway::new(core.clone(), GatewayConfig::default())
    }

    #[test]
    fn test_binding_handle_is_deterministic() {
        let a = binding_handle("device-1", "ep-1");
        assert_eq!(a, binding_handle("device-1", "ep-1"));
        assert_ne!(a, binding_handle("device-1", "ep-2"));
        assert!(a.starts_with(HANDLE_PREFIX));
        assert_eq!(a.len(), HANDLE_PREFIX.len() + 32);
    }

    #[test]
    fn test_ensure_subscribed_is_idempotent() {
        let core = Arc::new(InMemoryCore::new());
        let gateway = gateway(&core);
        let handle = binding_handle("device-1", "ep-1");

        gateway.ensure_subscribed("device-1", "ep-1", "alice").unwrap();
        let once = core.active_handles();
        gateway.ensure_subscribed("device-1", "ep-1", "alice").unwrap();

        assert_eq!(core.active_handles(), once);
        assert!(core.is_active(&handle));
    }

    #[test]
    fn test_ensure_unsubscribed_is_idempotent() {
        let core = Arc::new(InMemoryCore::new());
        let gateway = gateway(&core);

        // Never created: still fine
        gateway.ensure_unsubscribed("device-1", "ep-1", "alice").unwrap();

        gateway.ensure_subscribed("device-1", "ep-1", "alice").unwrap();
        gateway.ensure_unsubscribed("device-1", "ep-1", "alice").unwrap();
        gateway.ensure_unsubscribed("device-1", "ep-1", "alice").unwrap();
        assert!(core.active_handles().is_empty());
    }

    #[test]
    fn test_patch_membership() {
        let core = Arc::new(InMemoryCore::new());
        core.add_entity("device-1");
        let gateway = gateway(&core);

        gateway
            .patch_membership("device-1", "a@1@amqp://mq/x", MembershipChange::Add)
            .unwrap();
        gateway
            .patch_membership("device-1", "b@2@amqp://mq/y", MembershipChange::Add)
            .unwrap();
        assert_eq!(core.membership("device-1"), "a@1@amqp://mq/x,b@2@amqp://mq/y");

        gateway
            .patch_membership("device-1", "a@1@amqp://mq/x", MembershipChange::Remove)
            .unwrap();
        gateway
            .patch_membership("device-1", "b@2@amqp://mq/y", MembershipChange::Remove)
            .unwrap();
        assert_eq!(core.membership("device-1"), "");
    }

    #[test]
    fn test_patch_skips_unchanged_list() {
        let core = Arc::new(InMemoryCore::new());
        core.add_entity("device-1");
        let gateway = gateway(&core);

        gateway
            .patch_membership("device-1", "a@1@amqp://mq/x", MembershipChange::Remove)
            .unwrap();
        assert_eq!(core.call_count(CoreOp::Patch), 0);
    }

    #[test]
    fn test_patch_missing_entity() {
        let core = Arc::new(InMemoryCore::new());
        let gateway = gateway(&core);

        let result = gateway.patch_membership("ghost", "a@1@x", MembershipChange::Add);
        assert!(matches!(result, Err(BrokerError::NotFound(_))));
    }

    #[test]
    fn test_timeout_maps_to_unavailable() {
        let core = Arc::new(InMemoryCore::new());
        core.set_latency(Duration::from_millis(300));
        let gateway = SubscriptionGateway::new(
            core.clone(),
            GatewayConfig {
                call_timeout_ms: 20,
                ..Default::default()
            },
        );

        let result = gateway.ensure_subscribed("device-1", "ep-1", "alice");
        assert!(matches!(result, Err(BrokerError::GatewayUnavailable(_))));
    }

    #[test]
    fn test_saturated_pool_fails_fast() {
        let core = Arc::new(InMemoryCore::new());
        core.set_latency(Duration::from_millis(300));
        let gateway = SubscriptionGateway::new(
            core.clone(),
            GatewayConfig {
                call_timeout_ms: 20,
                workers: 1,
                queue_capacity: 1,
                ..Default::default()
            },
        );

        // First call occupies the only worker, second sits in the queue
        assert!(gateway.ensure_subscribed("d1", "ep", "alice").is_err());
        assert!(gateway.ensure_subscribed("d2", "ep", "alice").is_err());

        match gateway.ensure_subscribed("d3", "ep", "alice") {
            Err(BrokerError::GatewayUnavailable(msg)) => assert!(msg.contains("saturated"), "{msg}"),
            other => panic!("Expected saturation error, got {:?}", other),
        }
    }

    #[test]
    fn test_realtime_handles() {
        let core = Arc::new(InMemoryCore::new());
        let gateway = gateway(&core);

        gateway.activate_route("device-9").unwrap();
        assert!(core.is_active("device-9@realtime"));
        gateway.deactivate_route("device-9").unwrap();
        assert!(!core.is_active("device-9@realtime"));
    }
}
