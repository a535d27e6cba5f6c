//! Assignment of device identities to shared AMQP connections
//!
//! SAS identities are bucketed (one bucket for individual keys, one per hub
//! policy name) and each bucket holds at most `max_pool_size` holders. While a
//! bucket has room every new identity gets a fresh holder; after that the
//! pool's [`AssignmentPolicy`] picks an existing one. X.509 identities and
//! unpooled settings always get a dedicated holder.

use super::connection::AmqpConnector;
use super::holder::{AmqpUnit, ConnectionHolder, IdlePolicy};
use crate::config::ConfigError;
use crate::error::{TransportError, TransportResult};
use crate::identity::{AuthenticationModel, DeviceIdentity};
use crate::transport::settings::AmqpConnectionPoolSettings;
use crate::transport::InboundHandler;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// How a full bucket picks the holder for a new identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentPolicy {
    /// `hash(identity) mod bucket size`; sticky per identity
    #[default]
    ConsistentHash,
    /// Fewest active units, taking the first empty holder immediately
    LeastLoaded,
}

/// Group of holders eligible to serve an identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolBucket {
    Individual,
    /// Keyed by shared access policy name
    Scoped(String),
}

impl PoolBucket {
    pub fn resolve(identity: &DeviceIdentity) -> TransportResult<Self> {
        match identity.auth_model() {
            AuthenticationModel::SasIndividual => Ok(Self::Individual),
            _ => identity
                .shared_access_key_name()
                .map(|scope| Self::Scoped(scope.to_string()))
                .ok_or_else(|| {
                    ConfigError::MissingScope {
                        device_id: identity.device_id().to_string(),
                    }
                    .into()
                }),
        }
    }
}

#[derive(Default)]
struct PoolIndex {
    individual: Vec<ConnectionHolder>,
    grouped: HashMap<String, Vec<ConnectionHolder>>,
}

impl PoolIndex {
    fn bucket_mut(&mut self, bucket: &PoolBucket) -> &mut Vec<ConnectionHolder> {
        match bucket {
            PoolBucket::Individual => &mut self.individual,
            PoolBucket::Scoped(scope) => self.grouped.entry(scope.clone()).or_default(),
        }
    }

    fn bucket(&self, bucket: &PoolBucket) -> &[ConnectionHolder] {
        match bucket {
            PoolBucket::Individual => &self.individual,
            PoolBucket::Scoped(scope) => self.grouped.get(scope).map(Vec::as_slice).unwrap_or(&[]),
        }
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn AmqpConnector>,
    settings: AmqpConnectionPoolSettings,
    policy: AssignmentPolicy,
    /// Held only for bookkeeping, never across I/O
    index: Mutex<PoolIndex>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn AmqpConnector>, settings: AmqpConnectionPoolSettings) -> Self {
        Self {
            connector,
            settings,
            policy: AssignmentPolicy::default(),
            index: Mutex::new(PoolIndex::default()),
        }
    }

    /// Fix the assignment policy; one pool never mixes policies
    pub fn with_policy(mut self, policy: AssignmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> AssignmentPolicy {
        self.policy
    }

    pub fn settings(&self) -> &AmqpConnectionPoolSettings {
        &self.settings
    }

    /// Snapshot of the holders in `bucket`
    pub fn holders(&self, bucket: &PoolBucket) -> Vec<ConnectionHolder> {
        locked(&self.index).bucket(bucket).to_vec()
    }

    /// Resolve the holder for `identity` and register a unit on it.
    ///
    /// The connection itself is opened lazily by [`AmqpUnit::open`].
    pub fn get_connection(
        &self,
        identity: DeviceIdentity,
        handler: Arc<dyn InboundHandler>,
    ) -> TransportResult<AmqpUnit> {
        let pooled = identity.auth_model() != AuthenticationModel::X509Certificate
            && identity.settings().is_pooling_enabled();
        if !pooled {
            let holder =
                ConnectionHolder::new(identity.clone(), self.connector.clone(), IdlePolicy::Immediate);
            debug!(
                identity = %identity.key(),
                holder_id = holder.id(),
                "Dedicated connection for unpooled identity"
            );
            return Ok(holder.create_unit(identity, handler));
        }

        let bucket = PoolBucket::resolve(&identity)?;
        let max_pool_size = self.settings.max_pool_size() as usize;

        let mut index = locked(&self.index);
        let holders = index.bucket_mut(&bucket);
        let holder = if holders.len() < max_pool_size {
            let holder = ConnectionHolder::new(
                identity.clone(),
                self.connector.clone(),
                IdlePolicy::IdleTimeout(self.settings.connection_idle_timeout()),
            );
            holders.push(holder.clone());
            info!(
                bucket = ?bucket,
                holder_id = holder.id(),
                holders = holders.len(),
                "Added connection holder to pool"
            );
            holder
        } else {
            let holder = self.assign(holders, &identity);
            debug!(
                bucket = ?bucket,
                holder_id = holder.id(),
                policy = ?self.policy,
                "Assigned identity to existing holder"
            );
            holder
        };

        // Registered under the pool lock so concurrent least-loaded picks see it
        Ok(holder.create_unit(identity, handler))
    }

    fn assign(&self, holders: &[ConnectionHolder], identity: &DeviceIdentity) -> ConnectionHolder {
        match self.policy {
            AssignmentPolicy::ConsistentHash => {
                let index = (identity_hash(identity) % holders.len() as u64) as usize;
                holders[index].clone()
            }
            AssignmentPolicy::LeastLoaded => least_loaded(holders).clone(),
        }
    }
}

/// CRC-32 of the identity key, stable across processes and toolchains
pub fn identity_hash(identity: &DeviceIdentity) -> u64 {
    u64::from(crc32fast::hash(identity.key().to_string().as_bytes()))
}

fn least_loaded(holders: &[ConnectionHolder]) -> &ConnectionHolder {
    let mut best = &holders[0];
    let mut best_count = usize::MAX;
    for holder in holders {
        let count = holder.unit_count();
        if count == 0 {
            return holder;
        }
        if count < best_count {
            best = holder;
            best_count = count;
        }
    }
    best
}

/// Pools per hub host, created on first use
pub struct PoolRegistry {
    connector: Arc<dyn AmqpConnector>,
    policy: AssignmentPolicy,
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl PoolRegistry {
    pub fn new(connector: Arc<dyn AmqpConnector>) -> Self {
        Self {
            connector,
            policy: AssignmentPolicy::default(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: AssignmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn pool_count(&self) -> usize {
        locked(&self.pools).len()
    }

    /// The pool for the identity's hub; its settings come from the first identity seen
    pub fn pool_for(&self, identity: &DeviceIdentity) -> TransportResult<Arc<ConnectionPool>> {
        let settings = identity.settings().amqp().ok_or_else(|| {
            TransportError::from(ConfigError::InvalidConfig(
                "identity is not configured for an AMQP transport".to_string(),
            ))
        })?;

        let mut pools = locked(&self.pools);
        let pool = pools
            .entry(identity.host_name().to_string())
            .or_insert_with(|| {
                info!(host = %identity.host_name(), policy = ?self.policy, "Creating connection pool");
                Arc::new(
                    ConnectionPool::new(self.connector.clone(), settings.pool).with_policy(self.policy),
                )
            });
        Ok(pool.clone())
    }

    pub fn get_connection(
        &self,
        identity: DeviceIdentity,
        handler: Arc<dyn InboundHandler>,
    ) -> TransportResult<AmqpUnit> {
        let span = crate::pool_span!(host = %identity.host_name(), device_id = %identity.device_id());
        let _enter = span.enter();
        self.pool_for(&identity)?.get_connection(identity, handler)
    }
}
