//! Types for the consistency engine.

use crate::error::{BrokerError, Result};
use crate::types::Subscription;

/// Default subscription provisioned for users that have none.
pub const DEFAULT_TITLE: &str = "My subscription";
pub const DEFAULT_DESCRIPTION: &str =
    "This is my default subscription. It cannot be deleted, but it can be modified.";

/// Resolves entity groups and templates to entity IDs.
pub trait EntityDirectory: Send + Sync {
    fn entities_in_group(&self, group_id: &str) -> Result<Vec<String>>;
    fn entities_of_template(&self, template_id: &str) -> Result<Vec<String>>;
}

/// A subscription together with how many entities it is bound to.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionDetail {
    pub subscription: Subscription,
    pub binding_count: usize,
}

/// Overall result of a bulk operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BulkStatus {
    Success,
    PartialFailure,
}

/// Per-target outcome of a bulk operation.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, BrokerError)>,
}

impl BulkOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one target's result.
    pub fn record(&mut self, target: impl Into<String>, result: Result<()>) {
        let target = target.into();
        match result {
            Ok(()) => self.succeeded.push(target),
            Err(e) => self.failed.push((target, e)),
        }
    }

    pub fn status(&self) -> BulkStatus {
        if self.failed.is_empty() {
            BulkStatus::Success
        } else {
            BulkStatus::PartialFailure
        }
    }

    /// Turn a total failure into its first error. Anything that succeeded
    /// at least once comes back as `Ok`, to be inspected via `status()`.
    pub fn finish(mut self) -> Result<Self> {
        if self.succeeded.is_empty() && !self.failed.is_empty() {
            let (target, error) = self.failed.remove(0);
            tracing::debug!(%target, others = self.failed.len(), "bulk operation failed for every target");
            return Err(error);
        }
        Ok(self)
    }

    /// Collapse a partial failure into `BrokerError::PartialFailure`.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.failed.is_empty() {
            return Ok(self.succeeded);
        }
        Err(BrokerError::PartialFailure {
            succeeded: self.succeeded,
            failed: self
                .failed
                .into_iter()
                .map(|(target, e)| (target, e.to_string()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_success() {
        let mut outcome = BulkOutcome::new();
        outcome.record("a", Ok(()));
        outcome.record("b", Ok(()));
        let outcome = outcome.finish().unwrap();
        assert_eq!(outcome.status(), BulkStatus::Success);
        assert_eq!(outcome.into_result().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_partial_failure() {
        let mut outcome = BulkOutcome::new();
        outcome.record("a", Ok(()));
        outcome.record("b", Err(BrokerError::Duplicate("b".into())));
        let outcome = outcome.finish().unwrap();
        assert_eq!(outcome.status(), BulkStatus::PartialFailure);
        match outcome.into_result() {
            Err(BrokerError::PartialFailure { succeeded, failed }) => {
                assert_eq!(succeeded, vec!["a"]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, "b");
            }
            other => panic!("Expected PartialFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_total_failure_returns_first_error() {
        let mut outcome = BulkOutcome::new();
        outcome.record("a", Err(BrokerError::Duplicate("a".into())));
        outcome.record("b", Err(BrokerError::NotFound("b".into())));
        assert!(matches!(outcome.finish(), Err(BrokerError::Duplicate(_))));
    }
}
