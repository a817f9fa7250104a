//! Main Broker struct tying all components together.

use crate::config::BrokerConfig;
use crate::engine::{EntityDirectory, SubscriptionEngine};
use crate::error::Result;
use crate::fanout::{ClientReader, ClientSession, ClientWriter, Dispatcher, FanoutRouter, UpdateEnvelope};
use crate::gateway::{CoreClient, SubscriptionGateway};
use crate::store::SubscriptionStore;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use tracing::info;

/// The subscription broker.
///
/// Owns the store, one gateway shared by the consistency engine and the
/// fanout router, and both of those.
pub struct Broker {
    config: BrokerConfig,
    engine: SubscriptionEngine,
    router: Arc<FanoutRouter>,
}

impl Broker {
    /// Open (or create) the store on disk and wire up the components.
    pub fn open(config: BrokerConfig, core: Arc<dyn CoreClient>) -> Result<Self> {
        let store = Arc::new(SubscriptionStore::open_or_create(&config.store)?);
        info!(path = %config.store.path.display(), "broker store opened");
        Ok(Self::with_store(config, store, core))
    }

    /// Run against a store that only lives in memory.
    pub fn in_memory(config: BrokerConfig, core: Arc<dyn CoreClient>) -> Self {
        Self::with_store(config, Arc::new(SubscriptionStore::in_memory()), core)
    }

    fn with_store(
        config: BrokerConfig,
        store: Arc<SubscriptionStore>,
        core: Arc<dyn CoreClient>,
    ) -> Self {
        let gateway = Arc::new(SubscriptionGateway::new(core, config.gateway.clone()));
        let engine = SubscriptionEngine::new(store, Arc::clone(&gateway));
        let router = Arc::new(FanoutRouter::new(gateway, config.fanout.clone()));
        Self {
            config,
            engine,
            router,
        }
    }

    /// Resolve groups and templates through `directory`.
    pub fn with_directory(mut self, directory: Arc<dyn EntityDirectory>) -> Self {
        self.engine = self.engine.with_directory(directory);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn engine(&self) -> &SubscriptionEngine {
        &self.engine
    }

    pub fn router(&self) -> &Arc<FanoutRouter> {
        &self.router
    }

    /// Start draining the upstream update stream into the router.
    pub fn start_dispatcher(&self, updates: Receiver<UpdateEnvelope>) -> Result<Dispatcher> {
        Dispatcher::spawn(Arc::clone(&self.router), updates)
    }

    /// Start a session for a newly connected realtime client.
    pub fn connect<R, W>(&self, reader: R, writer: W) -> Result<ClientSession>
    where
        R: ClientReader,
        W: ClientWriter,
    {
        ClientSession::start(Arc::clone(&self.router), reader, writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryCore;
    use crate::store::StoreConfig;
    use crate::types::AuthUser;
    use tempfile::TempDir;

    #[test]
    fn test_open_persists_subscriptions() {
        let dir = TempDir::new().unwrap();
        let config = BrokerConfig {
            store: StoreConfig {
                path: dir.path().join("broker"),
                ..Default::default()
            },
            ..Default::default()
        };
        let core = Arc::new(InMemoryCore::new());
        let user = AuthUser::new("alice", "t1");

        let id = {
            let broker = Broker::open(config.clone(), core.clone()).unwrap();
            broker
                .engine()
                .create_subscription(&user, "Home", "")
                .unwrap()
                .id
        };

        let broker = Broker::open(config, core).unwrap();
        let detail = broker.engine().get_subscription(&user, id).unwrap();
        assert_eq!(detail.subscription.title, "Home");
        assert!(detail.subscription.is_default);
    }
}
