//! Core types for the subscription broker.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a subscription (assigned by the store).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    /// Whole seconds since Unix epoch.
    pub fn as_secs(&self) -> i64 {
        self.0 / 1_000_000
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// An already-authenticated caller, handed in by the API layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub tenant_id: String,
}

impl AuthUser {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

/// A user-owned subscription.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier (assigned by store).
    pub id: SubscriptionId,

    /// Owning user.
    pub user_id: String,

    /// Tenant of the owning user.
    pub tenant_id: String,

    /// Display title. Embedded in endpoint descriptors, so it never
    /// contains `@` or `,`.
    pub title: String,

    pub description: String,

    /// Unique wire endpoint that updates for bound entities are routed to.
    pub endpoint: String,

    /// The user's default subscription. Cannot be deleted.
    pub is_default: bool,

    pub created: Timestamp,
    pub updated: Timestamp,
}

/// Storage-level uniqueness key for a binding.
///
/// Derived from the (subscription, entity) pair, so it doubles as an
/// idempotency key for binding requests.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueKey(pub String);

impl UniqueKey {
    pub fn new(subscription_id: SubscriptionId, entity_id: &str) -> Self {
        UniqueKey(format!("sub-{}/{}", subscription_id.0, entity_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueKey({})", self.0)
    }
}

impl fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Association between a subscription and one external entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionBinding {
    pub unique_key: UniqueKey,
    pub subscription_id: SubscriptionId,
    pub entity_id: String,
    pub created: Timestamp,
}

impl SubscriptionBinding {
    pub fn new(subscription_id: SubscriptionId, entity_id: impl Into<String>) -> Self {
        let entity_id = entity_id.into();
        Self {
            unique_key: UniqueKey::new(subscription_id, &entity_id),
            subscription_id,
            entity_id,
            created: Timestamp::now(),
        }
    }
}

/// Derive a fresh endpoint name for a subscription.
///
/// The store retries with a new `salt` on collision.
pub fn generate_endpoint(user_id: &str, salt: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(salt.to_le_bytes());
    hasher.update(Timestamp::now().0.to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Per-tenant counts of subscriptions and bindings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub subscriptions_by_tenant: BTreeMap<String, u64>,
    pub bindings_by_tenant: BTreeMap<String, u64>,
}

impl BrokerStats {
    pub fn total_subscriptions(&self) -> u64 {
        self.subscriptions_by_tenant.values().sum()
    }

    pub fn total_bindings(&self) -> u64 {
        self.bindings_by_tenant.values().sum()
    }
}
