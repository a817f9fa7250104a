//! Consistency engine for subscriptions and their bindings.
//!
//! A binding touches three places: the local store, the upstream
//! subscription keyed by a deterministic handle, and the bound entity's
//! membership list. The engine orders those steps so that:
//! - a created binding exists everywhere or nowhere
//! - a deleted binding is always gone locally, with any external leftovers
//!   queued for [`SubscriptionEngine::reconcile`]
//! - renames rewrite the membership list of every bound entity

mod manager;
mod repair;
mod types;

pub use manager::SubscriptionEngine;
pub use repair::{ReconcileReport, Repair, RepairLedger};
pub use types::{
    BulkOutcome, BulkStatus, EntityDirectory, SubscriptionDetail, DEFAULT_DESCRIPTION,
    DEFAULT_TITLE,
};
