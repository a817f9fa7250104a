//! In-process [`CoreClient`] for tests and standalone runs.

use super::client::{CoreClient, PatchOperation};
use crate::error::{BrokerError, Result};
use crate::fanout::UpdateEnvelope;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Upstream operations, for failure injection and call counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoreOp {
    Subscribe,
    Unsubscribe,
    GetProperty,
    Patch,
}

/// A registered upstream subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveHandle {
    pub entity_id: String,
    pub topic: String,
    pub user_id: String,
}

#[derive(Default)]
struct CoreState {
    /// Entity properties by entity ID.
    entities: HashMap<String, Value>,
    /// Active subscriptions by handle.
    handles: BTreeMap<String, ActiveHandle>,
    subscribe_calls: HashMap<String, usize>,
    unsubscribe_calls: HashMap<String, usize>,
    op_calls: HashMap<CoreOp, usize>,
}

/// In-memory stand-in for the external core service.
pub struct InMemoryCore {
    state: RwLock<CoreState>,
    failing: Mutex<HashSet<CoreOp>>,
    latency: Mutex<Option<Duration>>,
    updates: Mutex<Option<Sender<UpdateEnvelope>>>,
}

impl InMemoryCore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CoreState::default()),
            failing: Mutex::new(HashSet::new()),
            latency: Mutex::new(None),
            updates: Mutex::new(None),
        }
    }

    /// Register an entity with an empty property object.
    pub fn add_entity(&self, entity_id: &str) {
        self.state
            .write()
            .entities
            .entry(entity_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    /// Make an operation fail with `GatewayUnavailable` until cleared.
    pub fn set_failing(&self, op: CoreOp, failing: bool) {
        let mut ops = self.failing.lock();
        if failing {
            ops.insert(op);
        } else {
            ops.remove(&op);
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Open the delivery stream. Replaces any previous stream.
    pub fn connect_updates(&self, capacity: usize) -> Receiver<UpdateEnvelope> {
        let (tx, rx) = bounded(capacity);
        *self.updates.lock() = Some(tx);
        rx
    }

    /// Close the delivery stream.
    pub fn disconnect_updates(&self) {
        self.updates.lock().take();
    }

    /// Emit an update for `entity_id` on every handle subscribed to it.
    /// Returns how many envelopes were queued.
    pub fn publish(&self, entity_id: &str, properties: Value) -> usize {
        let handles: Vec<String> = self
            .state
            .read()
            .handles
            .iter()
            .filter(|(_, active)| active.entity_id == entity_id)
            .map(|(handle, _)| handle.clone())
            .collect();

        let updates = self.updates.lock();
        let Some(tx) = updates.as_ref() else {
            return 0;
        };

        let mut sent = 0;
        for handle in handles {
            match tx.try_send(UpdateEnvelope::new(handle, properties.clone())) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => warn!(entity_id, "update stream full"),
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        sent
    }

    pub fn is_active(&self, handle: &str) -> bool {
        self.state.read().handles.contains_key(handle)
    }

    /// Active handles in sorted order.
    pub fn active_handles(&self) -> Vec<String> {
        self.state.read().handles.keys().cloned().collect()
    }

    pub fn subscribe_count(&self, handle: &str) -> usize {
        self.state
            .read()
            .subscribe_calls
            .get(handle)
            .copied()
            .unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, handle: &str) -> usize {
        self.state
            .read()
            .unsubscribe_calls
            .get(handle)
            .copied()
            .unwrap_or(0)
    }

    /// Successful calls of an operation.
    pub fn call_count(&self, op: CoreOp) -> usize {
        self.state.read().op_calls.get(&op).copied().unwrap_or(0)
    }

    /// Current membership list of an entity ("" if unset or unknown).
    pub fn membership(&self, entity_id: &str) -> String {
        self.state
            .read()
            .entities
            .get(entity_id)
            .and_then(|props| lookup(props, crate::descriptor::MEMBERSHIP_PATH))
            .unwrap_or_default()
    }

    fn enter(&self, op: CoreOp) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            thread::sleep(latency);
        }
        if self.failing.lock().contains(&op) {
            return Err(BrokerError::GatewayUnavailable(format!(
                "injected {op:?} failure"
            )));
        }
        Ok(())
    }
}

impl Default for InMemoryCore {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreClient for InMemoryCore {
    fn subscribe(&self, handle: &str, entity_id: &str, topic: &str, user_id: &str) -> Result<()> {
        self.enter(CoreOp::Subscribe)?;
        let mut state = self.state.write();
        *state.subscribe_calls.entry(handle.to_string()).or_default() += 1;
        *state.op_calls.entry(CoreOp::Subscribe).or_default() += 1;
        state.handles.insert(
            handle.to_string(),
            ActiveHandle {
                entity_id: entity_id.to_string(),
                topic: topic.to_string(),
                user_id: user_id.to_string(),
            },
        );
        debug!(handle, entity_id, "core subscribe");
        Ok(())
    }

    fn unsubscribe(&self, handle: &str, _user_id: &str) -> Result<()> {
        self.enter(CoreOp::Unsubscribe)?;
        let mut state = self.state.write();
        *state.unsubscribe_calls.entry(handle.to_string()).or_default() += 1;
        *state.op_calls.entry(CoreOp::Unsubscribe).or_default() += 1;
        state.handles.remove(handle);
        debug!(handle, "core unsubscribe");
        Ok(())
    }

    fn get_entity_property(&self, entity_id: &str, path: &str) -> Result<String> {
        self.enter(CoreOp::GetProperty)?;
        let mut state = self.state.write();
        *state.op_calls.entry(CoreOp::GetProperty).or_default() += 1;
        let props = state
            .entities
            .get(entity_id)
            .ok_or_else(|| BrokerError::NotFound(format!("entity {entity_id}")))?;
        Ok(lookup(props, path).unwrap_or_default())
    }

    fn patch_entity(&self, entity_id: &str, patch: &[PatchOperation]) -> Result<()> {
        self.enter(CoreOp::Patch)?;
        let mut state = self.state.write();
        let props = state
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| BrokerError::NotFound(format!("entity {entity_id}")))?;
        for op in patch {
            if op.operator != "replace" {
                return Err(BrokerError::Validation(format!(
                    "unsupported patch operator {:?}",
                    op.operator
                )));
            }
            replace(props, &op.path, op.value.clone());
        }
        *state.op_calls.entry(CoreOp::Patch).or_default() += 1;
        Ok(())
    }
}

/// Read a string at a dotted path.
fn lookup(root: &Value, path: &str) -> Option<String> {
    path.split('.')
        .try_fold(root, |node, key| node.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Set the value at a dotted path, creating intermediate objects.
fn replace(node: &mut Value, path: &str, value: Value) {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Some(map) = node.as_object_mut() else {
        return;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((key, rest)) => {
            let child = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            replace(child, rest, value);
        }
    }
}
