//! Ledger of external sync steps that failed and still need doing.
//!
//! Deleting a binding and propagating a rename touch the external services
//! on a best-effort basis. When such a step fails it is recorded here, and a
//! later reconcile pass retries it.

use crate::types::SubscriptionId;
use parking_lot::Mutex;

/// One outstanding external sync step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Repair {
    /// Drop a stale descriptor from an entity's membership list.
    RemoveDescriptor {
        entity_id: String,
        descriptor: String,
    },
    /// Make sure a bound subscription's current descriptor is listed.
    AddDescriptor {
        entity_id: String,
        subscription_id: SubscriptionId,
    },
    /// Tear down the upstream subscription of a removed binding.
    Unsubscribe {
        entity_id: String,
        subscription_id: SubscriptionId,
        endpoint: String,
        user_id: String,
    },
}

impl Repair {
    pub fn entity_id(&self) -> &str {
        match self {
            Repair::RemoveDescriptor { entity_id, .. }
            | Repair::AddDescriptor { entity_id, .. }
            | Repair::Unsubscribe { entity_id, .. } => entity_id,
        }
    }
}

/// Result of a reconcile pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Repairs applied successfully.
    pub repaired: usize,
    /// Repairs no longer needed (the binding changed since).
    pub obsolete: usize,
    /// Repairs that failed again and remain queued.
    pub pending: Vec<Repair>,
}

/// Queue of outstanding repairs, deduplicated, in insertion order.
#[derive(Default)]
pub struct RepairLedger {
    pending: Mutex<Vec<Repair>>,
}

impl RepairLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, repair: Repair) {
        let mut pending = self.pending.lock();
        if !pending.contains(&repair) {
            tracing::debug!(?repair, "repair recorded");
            pending.push(repair);
        }
    }

    /// Take every queued repair, leaving the ledger empty.
    pub fn drain(&self) -> Vec<Repair> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn snapshot(&self) -> Vec<Repair> {
        self.pending.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_deduplicates() {
        let ledger = RepairLedger::new();
        let repair = Repair::RemoveDescriptor {
            entity_id: "e1".into(),
            descriptor: "t@1@amqp://mq/x".into(),
        };
        ledger.record(repair.clone());
        ledger.record(repair.clone());
        assert_eq!(ledger.len(), 1);

        assert_eq!(ledger.drain(), vec![repair]);
        assert!(ledger.is_empty());
    }
}
