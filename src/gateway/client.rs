//! Interface to the external pub/sub broker and entity property store.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// A single JSON-patch style operation against an entity's properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub operator: String,
    pub path: String,
    pub value: serde_json::Value,
}

impl PatchOperation {
    pub fn replace(path: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            operator: "replace".to_string(),
            path: path.into(),
            value: value.into(),
        }
    }
}

/// Client for the external core service.
///
/// Implementations are expected to tolerate double-subscribe and
/// double-unsubscribe of the same handle. Unreachable or failing upstreams
/// should surface as `BrokerError::GatewayUnavailable`, missing entities as
/// `BrokerError::NotFound`.
pub trait CoreClient: Send + Sync {
    /// Register `handle` so that updates for `entity_id` are published on `topic`.
    fn subscribe(&self, handle: &str, entity_id: &str, topic: &str, user_id: &str) -> Result<()>;

    /// Drop the registration named `handle`.
    fn unsubscribe(&self, handle: &str, user_id: &str) -> Result<()>;

    /// Read a string property at a dotted `path`. Absent properties read as "".
    fn get_entity_property(&self, entity_id: &str, path: &str) -> Result<String>;

    /// Apply patch operations to an entity.
    fn patch_entity(&self, entity_id: &str, patch: &[PatchOperation]) -> Result<()>;
}
