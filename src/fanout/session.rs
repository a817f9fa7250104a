//! Per-client reader and writer threads.

use super::router::FanoutRouter;
use super::types::{ClientId, ClientRequest, Payload};
use crate::error::{BrokerError, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Inbound half of a client transport.
pub trait ClientReader: Send + 'static {
    /// Block for the next client message. `Ok(None)` means the client
    /// closed the connection.
    fn read_message(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Outbound half of a client transport.
pub trait ClientWriter: Send + 'static {
    fn write_message(&mut self, payload: &[u8]) -> Result<()>;
}

/// Reader over an in-process channel. The connection closes when every
/// sender is dropped.
pub struct ChannelReader(pub Receiver<Vec<u8>>);

impl ClientReader for ChannelReader {
    fn read_message(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.0.recv().ok())
    }
}

/// Writer over an in-process channel.
pub struct ChannelWriter(pub Sender<Vec<u8>>);

impl ClientWriter for ChannelWriter {
    fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        self.0
            .send(payload.to_vec())
            .map_err(|_| BrokerError::Io(std::io::ErrorKind::BrokenPipe.into()))
    }
}

/// A connected realtime client.
///
/// The reader thread turns client messages into attach/rebind calls; the
/// writer thread forwards routed payloads to the transport. When the reader
/// ends, the client is detached before the writer is told to stop.
pub struct ClientSession {
    id: ClientId,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientSession {
    /// Start the reader and writer threads for a new client.
    pub fn start<R, W>(router: Arc<FanoutRouter>, reader: R, writer: W) -> Result<Self>
    where
        R: ClientReader,
        W: ClientWriter,
    {
        let id = router.next_client_id();
        let (delivery_tx, delivery_rx) = bounded(router.config().channel_capacity);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let writer = thread::Builder::new()
            .name(format!("client-{id}-writer"))
            .spawn(move || write_loop(id, writer, delivery_rx, stop_rx))?;

        let reader = thread::Builder::new()
            .name(format!("client-{id}-reader"))
            .spawn(move || read_loop(id, &router, reader, delivery_tx, stop_tx))?;

        info!(client = %id, "session started");
        Ok(Self { id, reader, writer })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Whether both threads have exited.
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }

    /// Wait for both threads to exit.
    pub fn join(self) -> thread::Result<()> {
        self.reader.join()?;
        self.writer.join()
    }
}

fn read_loop<R: ClientReader>(
    id: ClientId,
    router: &FanoutRouter,
    mut reader: R,
    delivery: Sender<Payload>,
    stop: Sender<()>,
) {
    let mut current: Option<String> = None;

    loop {
        let message = match reader.read_message() {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(client = %id, "client closed connection");
                break;
            }
            Err(e) => {
                debug!(client = %id, error = %e, "client read failed");
                break;
            }
        };

        let entity_id = match ClientRequest::entity_id(&message) {
            Ok(entity_id) => entity_id,
            Err(e) => {
                debug!(client = %id, error = %e, "ignoring client message");
                continue;
            }
        };
        if current.as_deref() == Some(entity_id.as_str()) {
            continue;
        }

        match router.attach(id, &entity_id, delivery.clone()) {
            Ok(()) => current = Some(entity_id),
            Err(e) => {
                // A failed rebind has already left the old entity.
                warn!(client = %id, %entity_id, error = %e, "attach failed");
                current = None;
            }
        }
    }

    if let Err(e) = router.detach(id) {
        warn!(client = %id, error = %e, "detach on disconnect failed");
    }
    drop(stop);
    info!(client = %id, "session ended");
}

fn write_loop<W: ClientWriter>(
    id: ClientId,
    mut writer: W,
    delivery: Receiver<Payload>,
    stop: Receiver<()>,
) {
    loop {
        select! {
            recv(delivery) -> payload => match payload {
                Ok(payload) => {
                    if let Err(e) = writer.write_message(&payload) {
                        debug!(client = %id, error = %e, "client write failed");
                        break;
                    }
                }
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
    debug!(client = %id, "writer stopped");
}
