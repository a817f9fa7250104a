//! Gateway to the external pub/sub broker and entity property store.
//!
//! Every upstream subscription is named by a handle derived purely from its
//! inputs:
//! - bindings use `cb-` + hash(entity ‖ endpoint)
//! - realtime routes use `entity@topic`
//!
//! so creates and deletes converge without any local bookkeeping.

mod client;
mod manager;
pub mod memory;

pub use self::client::{CoreClient, PatchOperation};
pub use self::manager::{
    binding_handle, realtime_handle, MembershipChange, SubscriptionGateway, HANDLE_PREFIX,
};
pub use self::memory::{ActiveHandle, CoreOp, InMemoryCore};
