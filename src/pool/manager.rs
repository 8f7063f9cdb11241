//! Process-wide registry mapping credential tuples to their pools.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::Pool;
use crate::config::{ConnectConfig, PoolConfig, PoolKey, Protocol};
use crate::error::Error;
use crate::session::smtp::SmtpSessionFactory;
use crate::session::SessionFactory;

/// Builds the protocol-specific session factory out of the shared connect
/// config. One builder is registered per protocol.
pub type FactoryBuilder =
    Arc<dyn Fn(&ConnectConfig) -> Result<Arc<dyn SessionFactory>, Error> + Send + Sync>;

pub struct PoolManager {
    pool_config: PoolConfig,
    pools: Mutex<HashMap<PoolKey, Pool>>,
    factories: HashMap<Protocol, FactoryBuilder>,
}

impl PoolManager {
    pub fn new(pool_config: PoolConfig) -> Result<Self, Error> {
        pool_config.validate()?;
        let mut manager = PoolManager {
            pool_config,
            pools: Mutex::new(HashMap::new()),
            factories: HashMap::new(),
        };
        let smtp: FactoryBuilder = Arc::new(|config: &ConnectConfig| {
            let factory = SmtpSessionFactory::from_config(config)?;
            Ok(Arc::new(factory) as Arc<dyn SessionFactory>)
        });
        manager.register(Protocol::Smtp, smtp);
        Ok(manager)
    }

    /// Registers the factory builder for a protocol. Supporting another
    /// protocol means implementing [`crate::session::Session`] and
    /// [`SessionFactory`] for it and registering the builder here.
    pub fn register(&mut self, protocol: Protocol, builder: FactoryBuilder) {
        self.factories.insert(protocol, builder);
    }

    /// The pool for this credential tuple, created and warmed on first use.
    pub async fn get_pool(&self, connect: &ConnectConfig) -> Result<Pool, Error> {
        let key = connect.pool_key();
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }

        let builder = self
            .factories
            .get(&connect.protocol)
            .ok_or_else(|| Error::UnknownProtocol(connect.protocol.to_string()))?;
        let factory = builder(connect)?;

        debug!(host = %connect.host, username = %connect.username, "warming a new pool");
        let pool = Pool::new(self.pool_config.clone(), factory);
        // Registered only once warm-up succeeds, so a failed tuple is
        // retried from scratch on the next call instead of handing out a
        // dead pool.
        pool.init().await?;
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Closes every pool and empties the registry. Safe to call more than
    /// once at process shutdown.
    pub async fn close_all(&self) {
        let mut pools = self.pools.lock().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }
}
