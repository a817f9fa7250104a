//! Types for realtime fanout.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Serialized update as delivered to clients. Shared between all clients of
/// a route, so one encode serves every recipient.
pub type Payload = Arc<[u8]>;

/// Process-local identifier of a connected realtime client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An update delivered by the upstream broker.
///
/// `id` is the upstream subscription handle, `entityID@...`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateEnvelope {
    pub id: String,
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl UpdateEnvelope {
    pub fn new(id: impl Into<String>, properties: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            properties,
        }
    }

    /// Decode an envelope from its JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::Deserialization(e.to_string()))
    }

    /// Entity this update is for.
    pub fn entity_id(&self) -> &str {
        match self.id.split_once('@') {
            Some((entity, _)) => entity,
            None => &self.id,
        }
    }

    /// Serialize the payload for delivery.
    pub fn payload(&self) -> Result<Payload> {
        Ok(serde_json::to_vec(&self.properties)?.into())
    }
}

/// A message sent by a realtime client, naming the entity it wants.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub id: String,
}

impl ClientRequest {
    /// Parse a client message into the requested entity ID.
    pub fn entity_id(bytes: &[u8]) -> Result<String> {
        let request: ClientRequest = serde_json::from_slice(bytes)
            .map_err(|e| BrokerError::Validation(format!("bad client request: {e}")))?;
        if request.id.is_empty() {
            return Err(BrokerError::Validation("client request has no id".into()));
        }
        Ok(request.id)
    }
}

/// Counters describing the fanout table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanoutStats {
    /// Entities with at least one attached client.
    pub routes: usize,
    /// Attached clients.
    pub clients: usize,
    /// Payloads handed to client channels.
    pub delivered: u64,
    /// Payloads dropped because a client channel was full or closed.
    pub dropped: u64,
}
