//! Realtime fanout of entity updates to connected clients.
//!
//! Many clients may watch the same entity; the router keeps one upstream
//! subscription per watched entity and fans each update out to every
//! attached client:
//! - routes are created on first attach and dropped on last detach
//! - a client may rebind to another entity mid-session
//! - client buffers are bounded; a stalled client loses updates rather
//!   than holding up the others
//!
//! # Example
//!
//! ```ignore
//! let router = Arc::new(FanoutRouter::new(gateway, FanoutConfig::default()));
//! let dispatcher = Dispatcher::spawn(Arc::clone(&router), updates)?;
//!
//! // One session per accepted connection
//! let session = ClientSession::start(Arc::clone(&router), reader, writer)?;
//! // The client sends {"id": "device-1"} and starts receiving its updates.
//! ```

mod dispatcher;
mod router;
mod session;
mod types;

pub use dispatcher::Dispatcher;
pub use router::FanoutRouter;
pub use session::{ChannelReader, ChannelWriter, ClientReader, ClientSession, ClientWriter};
pub use types::{ClientId, ClientRequest, FanoutStats, Payload, UpdateEnvelope};
