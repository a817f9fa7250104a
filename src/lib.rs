//! # Subscription Broker
//!
//! Durable, user-owned subscriptions to external entities, kept consistent
//! with an external pub/sub service, plus a realtime fanout of entity
//! updates to connected clients.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: User-owned named endpoints that updates are routed to
//! - **Bindings**: Subscription-to-entity links, mirrored upstream and in
//!   each entity's membership list
//! - **Engine**: Orders store and upstream steps so they stay consistent
//! - **Fanout**: One upstream route per watched entity, shared by every
//!   connected client watching it
//!
//! ## Example
//!
//! ```ignore
//! use subscription_broker::{AuthUser, Broker, BrokerConfig};
//!
//! let broker = Broker::open(BrokerConfig::from_json_file("broker.json")?, core)?;
//! let user = AuthUser::new("alice", "tenant-1");
//!
//! // Create a subscription and bind an entity to it
//! let sub = broker.engine().create_subscription(&user, "Kitchen", "")?;
//! broker.engine().create_binding(&user, sub.id, "device-42")?;
//!
//! // Fan out realtime updates
//! let dispatcher = broker.start_dispatcher(updates)?;
//! let session = broker.connect(reader, writer)?;
//! ```

pub mod broker;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod store;
pub mod types;

// Re-exports
pub use broker::Broker;
pub use config::{BrokerConfig, FanoutConfig, GatewayConfig};
pub use descriptor::EndpointDescriptor;
pub use engine::{
    BulkOutcome, BulkStatus, EntityDirectory, ReconcileReport, Repair, SubscriptionDetail,
    SubscriptionEngine,
};
pub use error::{BrokerError, Result};
pub use fanout::{
    ChannelReader, ChannelWriter, ClientId, ClientReader, ClientSession, ClientWriter, Dispatcher,
    FanoutRouter, FanoutStats, UpdateEnvelope,
};
pub use gateway::{CoreClient, CoreOp, InMemoryCore, MembershipChange, SubscriptionGateway};
pub use store::{StoreConfig, SubscriptionStore};
pub use types::*;
