//! Single consumer of the upstream update stream.

use super::router::FanoutRouter;
use super::types::UpdateEnvelope;
use crate::error::Result;
use crossbeam_channel::{never, select, tick, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Thread draining upstream updates into the router.
///
/// Being the only consumer, it fixes the per-entity delivery order. Between
/// envelopes it periodically settles routes whose upstream state is in
/// doubt. It exits once every sender of the update stream is dropped.
pub struct Dispatcher {
    handle: JoinHandle<u64>,
}

impl Dispatcher {
    pub fn spawn(router: Arc<FanoutRouter>, updates: Receiver<UpdateEnvelope>) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("fanout-dispatch".to_string())
            .spawn(move || run(&router, &updates))?;
        Ok(Self { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the stream to close. Returns how many envelopes were handled.
    pub fn join(self) -> thread::Result<u64> {
        self.handle.join()
    }
}

/// Dispatch every envelope until the stream closes.
pub fn run(router: &FanoutRouter, updates: &Receiver<UpdateEnvelope>) -> u64 {
    let ticker = match router.config().repair_interval() {
        Some(interval) => tick(interval),
        None => never(),
    };

    let mut handled = 0;
    loop {
        select! {
            recv(updates) -> msg => {
                let Ok(envelope) = msg else { break };
                handled += 1;
                match router.dispatch(&envelope) {
                    Ok(delivered) => {
                        debug!(entity_id = envelope.entity_id(), delivered, "update dispatched")
                    }
                    Err(e) => warn!(id = %envelope.id, error = %e, "update dispatch failed"),
                }
            }
            recv(ticker) -> _ => {
                if router.has_unsettled() {
                    let settled = router.settle();
                    debug!(settled, "routes settled");
                }
            }
        }
    }
    info!(handled, "update stream closed");
    handled
}
