//! Durable storage for subscriptions and their bindings.
//!
//! The whole index is one MessagePack document, rewritten on every mutation.
//! Mutations are applied to a copy of the index and only swapped in after
//! the file write succeeds, so a failed persist leaves memory and disk
//! agreeing.

use crate::error::{BrokerError, Result};
use crate::types::{
    generate_endpoint, AuthUser, BrokerStats, Subscription, SubscriptionBinding, SubscriptionId,
    Timestamp, UniqueKey,
};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Store configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base directory for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./subscriptions"),
            create_if_missing: true,
        }
    }
}

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"SBS\0";

/// Magic bytes for the index file.
const INDEX_MAGIC: &[u8; 4] = b"SBI\0";

/// Current on-disk format version.
const STORE_VERSION: u8 = 1;

/// Attempts at finding an unused endpoint before giving up.
const ENDPOINT_ATTEMPTS: u64 = 16;

/// Everything the store persists.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,

    /// Bindings by unique key.
    bindings: HashMap<UniqueKey, SubscriptionBinding>,

    /// Next subscription ID to assign.
    next_id: u64,
}

impl StoreIndex {
    fn endpoint_taken(&self, endpoint: &str) -> bool {
        self.subscriptions.values().any(|s| s.endpoint == endpoint)
    }

    fn has_default(&self, user_id: &str) -> bool {
        self.subscriptions
            .values()
            .any(|s| s.user_id == user_id && s.is_default)
    }

    fn owns_any(&self, user_id: &str) -> bool {
        self.subscriptions.values().any(|s| s.user_id == user_id)
    }

    fn insert_subscription(
        &mut self,
        owner: &AuthUser,
        title: &str,
        description: &str,
        endpoint: Option<&str>,
    ) -> Result<Subscription> {
        let endpoint = match endpoint {
            Some(endpoint) if self.endpoint_taken(endpoint) => {
                return Err(BrokerError::Duplicate(format!("endpoint {endpoint}")));
            }
            Some(endpoint) => endpoint.to_string(),
            None => (0..ENDPOINT_ATTEMPTS)
                .map(|salt| generate_endpoint(&owner.id, self.next_id + salt))
                .find(|candidate| !self.endpoint_taken(candidate))
                .ok_or_else(|| BrokerError::Duplicate("could not allocate a free endpoint".into()))?,
        };

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let now = Timestamp::now();
        let subscription = Subscription {
            id,
            user_id: owner.id.clone(),
            tenant_id: owner.tenant_id.clone(),
            title: title.to_string(),
            description: description.to_string(),
            endpoint,
            is_default: !self.has_default(&owner.id),
            created: now,
            updated: now,
        };
        self.subscriptions.insert(id, subscription.clone());
        Ok(subscription)
    }
}

/// Subscription and binding records.
pub struct SubscriptionStore {
    /// Index file, `None` for an in-memory store.
    index_path: Option<PathBuf>,

    /// Lock file for exclusive access.
    _lock_file: Option<File>,

    index: RwLock<StoreIndex>,
}

impl SubscriptionStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: &StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(BrokerError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: &StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let store = Self {
            index_path: Some(config.path.join("subscriptions.bin")),
            _lock_file: Some(lock_file),
            index: RwLock::new(StoreIndex {
                next_id: 1,
                ..Default::default()
            }),
        };
        store.save()?;
        Ok(store)
    }

    /// Open an existing store.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let index_path = config.path.join("subscriptions.bin");
        let index = Self::load_index(&index_path)?;
        debug!(
            subscriptions = index.subscriptions.len(),
            bindings = index.bindings.len(),
            "opened subscription store"
        );

        Ok(Self {
            index_path: Some(index_path),
            _lock_file: Some(lock_file),
            index: RwLock::new(index),
        })
    }

    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            index_path: None,
            _lock_file: None,
            index: RwLock::new(StoreIndex {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    // --- Subscriptions ---

    /// Create a subscription. The user's first subscription becomes their
    /// default. An endpoint is generated when none is given.
    pub fn create_subscription(
        &self,
        owner: &AuthUser,
        title: &str,
        description: &str,
        endpoint: Option<&str>,
    ) -> Result<Subscription> {
        self.mutate(|index| index.insert_subscription(owner, title, description, endpoint))
    }

    /// Create the user's default subscription unless they already own one.
    /// Check and insert happen under one write lock, so concurrent callers
    /// provision at most once. Returns the new subscription, if any.
    pub fn ensure_default(
        &self,
        owner: &AuthUser,
        title: &str,
        description: &str,
    ) -> Result<Option<Subscription>> {
        if self.index.read().owns_any(&owner.id) {
            return Ok(None);
        }
        self.mutate(|index| {
            if index.owns_any(&owner.id) {
                return Ok(None);
            }
            index
                .insert_subscription(owner, title, description, None)
                .map(Some)
        })
    }

    /// Get a subscription by ID.
    pub fn get_subscription(&self, id: SubscriptionId) -> Option<Subscription> {
        self.index.read().subscriptions.get(&id).cloned()
    }

    /// All subscriptions owned by a user, in creation order.
    pub fn list_subscriptions(&self, user_id: &str) -> Vec<Subscription> {
        self.index
            .read()
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Find a user's subscription by its endpoint.
    pub fn find_by_endpoint(&self, user_id: &str, endpoint: &str) -> Option<Subscription> {
        self.index
            .read()
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.endpoint == endpoint)
            .cloned()
    }

    /// Replace title and description. Returns the updated subscription.
    pub fn update_subscription(
        &self,
        id: SubscriptionId,
        title: &str,
        description: &str,
    ) -> Result<Subscription> {
        self.mutate(|index| {
            let subscription = index
                .subscriptions
                .get_mut(&id)
                .ok_or_else(|| BrokerError::NotFound(format!("subscription {id}")))?;
            subscription.title = title.to_string();
            subscription.description = description.to_string();
            subscription.updated = Timestamp::now();
            Ok(subscription.clone())
        })
    }

    /// Move all of a user's subscriptions to a tenant. Returns how many changed.
    pub fn update_tenant(&self, user_id: &str, tenant_id: &str) -> Result<usize> {
        self.mutate(|index| {
            let mut changed = 0;
            for subscription in index.subscriptions.values_mut() {
                if subscription.user_id == user_id && subscription.tenant_id != tenant_id {
                    subscription.tenant_id = tenant_id.to_string();
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    /// Delete a subscription row and any bindings still attached to it.
    pub fn delete_subscription(&self, id: SubscriptionId) -> Result<Subscription> {
        self.mutate(|index| {
            let subscription = index
                .subscriptions
                .get(&id)
                .ok_or_else(|| BrokerError::NotFound(format!("subscription {id}")))?;
            if subscription.is_default {
                return Err(BrokerError::Undeleteable(
                    "this is the default subscription".into(),
                ));
            }
            index.bindings.retain(|_, b| b.subscription_id != id);
            index
                .subscriptions
                .remove(&id)
                .ok_or_else(|| BrokerError::NotFound(format!("subscription {id}")))
        })
    }

    // --- Bindings ---

    /// Insert a binding. Fails with `Duplicate` if the unique key exists.
    pub fn insert_binding(
        &self,
        subscription_id: SubscriptionId,
        entity_id: &str,
    ) -> Result<SubscriptionBinding> {
        self.mutate(|index| {
            if !index.subscriptions.contains_key(&subscription_id) {
                return Err(BrokerError::NotFound(format!(
                    "subscription {subscription_id}"
                )));
            }
            let binding = SubscriptionBinding::new(subscription_id, entity_id);
            if index.bindings.contains_key(&binding.unique_key) {
                return Err(BrokerError::Duplicate(format!(
                    "entity {entity_id} already bound to subscription {subscription_id}"
                )));
            }
            index
                .bindings
                .insert(binding.unique_key.clone(), binding.clone());
            Ok(binding)
        })
    }

    /// Remove a binding, returning it if it existed.
    pub fn remove_binding(&self, key: &UniqueKey) -> Result<Option<SubscriptionBinding>> {
        if !self.index.read().bindings.contains_key(key) {
            return Ok(None);
        }
        self.mutate(|index| Ok(index.bindings.remove(key)))
    }

    /// Get a binding by key.
    pub fn get_binding(&self, key: &UniqueKey) -> Option<SubscriptionBinding> {
        self.index.read().bindings.get(key).cloned()
    }

    /// All bindings of a subscription, ordered by entity ID.
    pub fn bindings_for(&self, subscription_id: SubscriptionId) -> Vec<SubscriptionBinding> {
        let mut bindings: Vec<_> = self
            .index
            .read()
            .bindings
            .values()
            .filter(|b| b.subscription_id == subscription_id)
            .cloned()
            .collect();
        bindings.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        bindings
    }

    /// Number of bindings of a subscription.
    pub fn binding_count(&self, subscription_id: SubscriptionId) -> usize {
        self.index
            .read()
            .bindings
            .values()
            .filter(|b| b.subscription_id == subscription_id)
            .count()
    }

    // --- Stats & Persistence ---

    /// Per-tenant subscription and binding counts.
    pub fn stats(&self) -> BrokerStats {
        let index = self.index.read();
        let mut stats = BrokerStats::default();

        for subscription in index.subscriptions.values() {
            *stats
                .subscriptions_by_tenant
                .entry(subscription.tenant_id.clone())
                .or_default() += 1;
        }
        for binding in index.bindings.values() {
            if let Some(subscription) = index.subscriptions.get(&binding.subscription_id) {
                *stats
                    .bindings_by_tenant
                    .entry(subscription.tenant_id.clone())
                    .or_default() += 1;
            }
        }
        stats
    }

    /// Write the index to disk. No-op for in-memory stores.
    pub fn save(&self) -> Result<()> {
        let index = self.index.read();
        self.persist(&index)
    }

    /// Get the index file path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.index_path.as_deref()
    }

    /// Apply `f` to a copy of the index, persist it, then publish it.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreIndex) -> Result<T>) -> Result<T> {
        let mut index = self.index.write();
        let mut next = index.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *index = next;
        Ok(out)
    }

    fn persist(&self, index: &StoreIndex) -> Result<()> {
        let Some(path) = &self.index_path else {
            return Ok(());
        };

        let encoded = rmp_serde::to_vec(index)?;
        let checksum = crc32fast::hash(&encoded);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(INDEX_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn load_index(path: &Path) -> Result<StoreIndex> {
        if !path.exists() {
            return Ok(StoreIndex {
                next_id: 1,
                ..Default::default()
            });
        }

        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(BrokerError::InvalidFormat("Invalid index magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(BrokerError::InvalidFormat(format!(
                "Unsupported index version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(BrokerError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(BrokerError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(BrokerError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| BrokerError::Locked)?;
        Ok(lock_file)
    }
}
