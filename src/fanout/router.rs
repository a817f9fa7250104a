//! Route table deduplicating upstream subscriptions across clients.

use super::types::{ClientId, FanoutStats, Payload, UpdateEnvelope};
use crate::config::FanoutConfig;
use crate::error::{BrokerError, Result};
use crate::gateway::SubscriptionGateway;
use crossbeam_channel::{SendTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Clients attached to one entity.
type Route = HashMap<ClientId, Sender<Payload>>;

#[derive(Default)]
struct RouteTable {
    /// Attached clients by entity ID. A route exists only while non-empty.
    routes: HashMap<String, Route>,
    /// Current entity of each attached client.
    clients: HashMap<ClientId, String>,
}

impl RouteTable {
    /// Remove a client. Returns true if its route became empty and was dropped.
    fn remove(&mut self, client: ClientId, entity_id: &str) -> bool {
        self.clients.remove(&client);
        let Some(route) = self.routes.get_mut(entity_id) else {
            return false;
        };
        route.remove(&client);
        if route.is_empty() {
            self.routes.remove(entity_id);
            return true;
        }
        false
    }
}

/// Routes upstream updates to attached clients.
///
/// The upstream subscription for an entity is active exactly while its
/// route has clients. The table lock only covers in-memory changes, so a
/// slow activation never holds up delivery. Activation and deactivation
/// calls run under a striped transition lock instead; entities that hash
/// to the same stripe wait on each other's transitions.
///
/// When an activation or deactivation fails, or times out with its outcome
/// unknown, the entity is marked unsettled. [`FanoutRouter::settle`]
/// brings upstream back in line with the route table.
pub struct FanoutRouter {
    table: RwLock<RouteTable>,
    /// Striped locks serializing route transitions.
    transitions: Vec<Mutex<()>>,
    /// Entities whose upstream state may disagree with the route table.
    unsettled: Mutex<HashSet<String>>,
    gateway: Arc<SubscriptionGateway>,
    config: FanoutConfig,
    next_client: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl FanoutRouter {
    pub fn new(gateway: Arc<SubscriptionGateway>, config: FanoutConfig) -> Self {
        let stripes = config.transition_stripes.max(1);
        Self {
            table: RwLock::new(RouteTable::default()),
            transitions: (0..stripes).map(|_| Mutex::new(())).collect(),
            unsettled: Mutex::new(HashSet::new()),
            gateway,
            config,
            next_client: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Allocate an ID for a new client.
    pub fn next_client_id(&self) -> ClientId {
        ClientId(self.next_client.fetch_add(1, Ordering::SeqCst))
    }

    /// Attach a client to an entity, activating the upstream subscription
    /// if it is the route's first client.
    ///
    /// A client attached elsewhere is detached from its old entity first.
    /// If activation fails the attach is undone and the error returned.
    pub fn attach(&self, client: ClientId, entity_id: &str, channel: Sender<Payload>) -> Result<()> {
        if entity_id.is_empty() {
            return Err(BrokerError::Validation("entity id is empty".into()));
        }

        let current = self.table.read().clients.get(&client).cloned();
        match current {
            Some(ref current) if current == entity_id => {
                self.table
                    .write()
                    .routes
                    .entry(entity_id.to_string())
                    .or_default()
                    .insert(client, channel);
                return Ok(());
            }
            Some(_) => {
                if let Err(e) = self.detach(client) {
                    warn!(%client, error = %e, "detach during rebind failed");
                }
            }
            None => {}
        }

        let _transition = self.transition_lock(entity_id).lock();

        let activate = {
            let mut table = self.table.write();
            let route = table.routes.entry(entity_id.to_string()).or_default();
            let fresh = route.is_empty();
            route.insert(client, channel);
            table.clients.insert(client, entity_id.to_string());
            fresh
        };
        debug!(%client, entity_id, activate, "client attached");

        if activate {
            if let Err(e) = self.gateway.activate_route(entity_id) {
                warn!(%client, entity_id, error = %e, "route activation failed, undoing attach");
                let emptied = self.table.write().remove(client, entity_id);
                // A timed-out subscribe may still land upstream.
                self.mark_unsettled(entity_id);
                if emptied {
                    if let Err(undo) = self.gateway.deactivate_route(entity_id) {
                        debug!(entity_id, error = %undo, "undo of failed activation failed");
                    }
                }
                return Err(e);
            }
            self.unsettled.lock().remove(entity_id);
            info!(entity_id, "route activated");
        }
        Ok(())
    }

    /// Detach a client from its entity, deactivating the upstream
    /// subscription if it was the route's last client. Unknown clients are
    /// a no-op.
    pub fn detach(&self, client: ClientId) -> Result<()> {
        let Some(entity_id) = self.table.read().clients.get(&client).cloned() else {
            return Ok(());
        };

        let _transition = self.transition_lock(&entity_id).lock();

        let deactivate = {
            let mut table = self.table.write();
            if table.clients.get(&client) != Some(&entity_id) {
                return Ok(());
            }
            table.remove(client, &entity_id)
        };
        debug!(%client, %entity_id, deactivate, "client detached");

        if deactivate {
            if let Err(e) = self.gateway.deactivate_route(&entity_id) {
                warn!(%entity_id, error = %e, "route deactivation failed");
                self.mark_unsettled(&entity_id);
                return Err(e);
            }
            self.unsettled.lock().remove(&entity_id);
            info!(%entity_id, "route deactivated");
        }
        Ok(())
    }

    /// Entities whose upstream state still needs settling, sorted.
    pub fn unsettled(&self) -> Vec<String> {
        let mut entities: Vec<_> = self.unsettled.lock().iter().cloned().collect();
        entities.sort();
        entities
    }

    /// Re-issue activation or deactivation for every unsettled entity so
    /// that upstream matches the route table. Returns how many were
    /// settled; the rest stay queued.
    pub fn settle(&self) -> usize {
        let mut settled = 0;
        for entity_id in self.unsettled() {
            let _transition = self.transition_lock(&entity_id).lock();

            let routed = self.is_routed(&entity_id);
            let result = if routed {
                self.gateway.activate_route(&entity_id)
            } else {
                self.gateway.deactivate_route(&entity_id)
            };
            match result {
                Ok(()) => {
                    self.unsettled.lock().remove(&entity_id);
                    settled += 1;
                    debug!(%entity_id, routed, "route settled");
                }
                Err(e) => warn!(%entity_id, routed, error = %e, "route still unsettled"),
            }
        }
        settled
    }

    pub fn has_unsettled(&self) -> bool {
        !self.unsettled.lock().is_empty()
    }

    fn mark_unsettled(&self, entity_id: &str) {
        self.unsettled.lock().insert(entity_id.to_string());
    }

    /// Forward an update to every client attached to its entity.
    /// Returns the number of clients it was handed to.
    pub fn dispatch(&self, envelope: &UpdateEnvelope) -> Result<usize> {
        let entity_id = envelope.entity_id();

        let recipients: Vec<(ClientId, Sender<Payload>)> = {
            let table = self.table.read();
            match table.routes.get(entity_id) {
                Some(route) => route.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                None => Vec::new(),
            }
        };
        if recipients.is_empty() {
            debug!(entity_id, "no route for update, dropping");
            return Ok(0);
        }

        let payload = envelope.payload()?;
        let mut delivered = 0;
        for (client, tx) in recipients {
            if self.deliver(&tx, payload.clone()) {
                delivered += 1;
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%client, entity_id, "client channel full or closed, update dropped");
            }
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Whether an entity currently has attached clients.
    pub fn is_routed(&self, entity_id: &str) -> bool {
        self.table.read().routes.contains_key(entity_id)
    }

    /// Clients attached to an entity.
    pub fn clients_of(&self, entity_id: &str) -> Vec<ClientId> {
        let mut clients: Vec<_> = self
            .table
            .read()
            .routes
            .get(entity_id)
            .map(|route| route.keys().copied().collect())
            .unwrap_or_default();
        clients.sort();
        clients
    }

    /// Entity a client is attached to.
    pub fn entity_of(&self, client: ClientId) -> Option<String> {
        self.table.read().clients.get(&client).cloned()
    }

    /// Entities with attached clients.
    pub fn routed_entities(&self) -> Vec<String> {
        let mut entities: Vec<_> = self.table.read().routes.keys().cloned().collect();
        entities.sort();
        entities
    }

    pub fn stats(&self) -> FanoutStats {
        let table = self.table.read();
        FanoutStats {
            routes: table.routes.len(),
            clients: table.clients.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Hand a payload to one client without blocking past the send timeout.
    fn deliver(&self, tx: &Sender<Payload>, payload: Payload) -> bool {
        let timeout = self.config.send_timeout();
        if timeout.is_zero() {
            return match tx.try_send(payload) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
            };
        }
        match tx.send_timeout(payload, timeout) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) | Err(SendTimeoutError::Disconnected(_)) => false,
        }
    }

    fn transition_lock(&self, entity_id: &str) -> &Mutex<()> {
        let stripe = crc32fast::hash(entity_id.as_bytes()) as usize % self.transitions.len();
        &self.transitions[stripe]
    }
}
