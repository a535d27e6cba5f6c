//! One physical AMQP connection and the logical units multiplexed over it
//!
//! Units are keyed by identity. When the last unit leaves, the holder either
//! tears the connection down at once or keeps it for an idle period so a
//! returning identity does not pay the reconnect cost.

use super::connection::{amqp_endpoint, AmqpConnection, AmqpConnector};
use crate::error::{TransportError, TransportResult};
use crate::identity::{DeviceIdentity, IdentityKey};
use crate::transport::{ConnectionStatus, ConnectionStatusChangeReason, InboundHandler};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_HOLDER_ID: AtomicU64 = AtomicU64::new(1);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// What happens to the physical connection once no units remain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePolicy {
    Immediate,
    IdleTimeout(Duration),
}

struct UnitEntry {
    unit_id: u64,
    handler: Arc<dyn InboundHandler>,
}

struct HolderInner {
    id: u64,
    /// Identity the physical connection is opened with
    identity: DeviceIdentity,
    connector: Arc<dyn AmqpConnector>,
    idle_policy: IdlePolicy,
    units: Mutex<HashMap<IdentityKey, UnitEntry>>,
    connection: tokio::sync::Mutex<Option<Arc<dyn AmqpConnection>>>,
    idle_timer: Mutex<Option<CancellationToken>>,
    next_unit_id: AtomicU64,
}

/// Shared handle to one physical connection
#[derive(Clone)]
pub struct ConnectionHolder {
    inner: Arc<HolderInner>,
}

impl fmt::Debug for ConnectionHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHolder")
            .field("id", &self.inner.id)
            .field("units", &self.unit_count())
            .field("idle_policy", &self.inner.idle_policy)
            .finish()
    }
}

impl ConnectionHolder {
    pub fn new(
        identity: DeviceIdentity,
        connector: Arc<dyn AmqpConnector>,
        idle_policy: IdlePolicy,
    ) -> Self {
        let id = NEXT_HOLDER_ID.fetch_add(1, Ordering::Relaxed);
        debug!(holder_id = id, policy = ?idle_policy, "Creating connection holder");
        Self {
            inner: Arc::new(HolderInner {
                id,
                identity,
                connector,
                idle_policy,
                units: Mutex::new(HashMap::new()),
                connection: tokio::sync::Mutex::new(None),
                idle_timer: Mutex::new(None),
                next_unit_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn idle_policy(&self) -> IdlePolicy {
        self.inner.idle_policy
    }

    pub fn unit_count(&self) -> usize {
        locked(&self.inner.units).len()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.connection.lock().await.is_some()
    }

    /// Register a logical unit. A unit already registered for the same
    /// identity is replaced.
    pub fn create_unit(&self, identity: DeviceIdentity, handler: Arc<dyn InboundHandler>) -> AmqpUnit {
        self.cancel_idle_timer();

        let unit_id = self.inner.next_unit_id.fetch_add(1, Ordering::Relaxed);
        let key = identity.key();
        let replaced = locked(&self.inner.units)
            .insert(key.clone(), UnitEntry { unit_id, handler })
            .is_some();
        if replaced {
            debug!(holder_id = self.inner.id, identity = %key, "Replaced existing unit");
        }

        AmqpUnit {
            holder: self.clone(),
            identity,
            unit_id,
            closed: AtomicBool::new(false),
        }
    }

    /// Open the physical connection if needed and return it
    pub async fn ensure_connection(&self, timeout: Duration) -> TransportResult<Arc<dyn AmqpConnection>> {
        let mut connection = tokio::time::timeout(timeout, self.inner.connection.lock())
            .await
            .map_err(|_| TransportError::timeout("waiting for the AMQP connection lock"))?;

        match connection.as_ref() {
            Some(existing) if existing.is_closing() => {
                Err(TransportError::transient("AMQP connection is closing"))
            }
            Some(existing) => Ok(existing.clone()),
            None => {
                let endpoint = amqp_endpoint(&self.inner.identity);
                let opened = self
                    .inner
                    .connector
                    .open_connection(&self.inner.identity, &endpoint, timeout)
                    .await?;
                info!(
                    holder_id = self.inner.id,
                    host = %endpoint.host,
                    port = endpoint.port,
                    "AMQP connection opened"
                );
                *connection = Some(opened.clone());
                Ok(opened)
            }
        }
    }

    /// The physical connection dropped: every unit is told and the table cleared
    pub async fn on_connection_lost(&self) {
        let orphaned: Vec<Arc<dyn InboundHandler>> = locked(&self.inner.units)
            .drain()
            .map(|(_, entry)| entry.handler)
            .collect();
        warn!(
            holder_id = self.inner.id,
            units = orphaned.len(),
            "AMQP connection lost"
        );
        notify_disconnected(&orphaned);
        self.teardown().await;
    }

    async fn release(&self, key: &IdentityKey, unit_id: u64, graceful: bool) {
        let orphaned = {
            let mut units = locked(&self.inner.units);
            // Replaced by a newer unit or already cleared
            if !units.get(key).is_some_and(|entry| entry.unit_id == unit_id) {
                return;
            }
            units.remove(key);
            if graceful {
                if !units.is_empty() {
                    return;
                }
                Vec::new()
            } else {
                units.drain().map(|(_, entry)| entry.handler).collect()
            }
        };

        if !graceful {
            warn!(
                holder_id = self.inner.id,
                identity = %key,
                siblings = orphaned.len(),
                "Unit disconnected ungracefully, dropping shared connection"
            );
            notify_disconnected(&orphaned);
            self.teardown().await;
            return;
        }

        debug!(holder_id = self.inner.id, "Last unit released");
        match self.inner.idle_policy {
            IdlePolicy::Immediate => self.shutdown_if_idle().await,
            IdlePolicy::IdleTimeout(idle) => self.start_idle_timer(idle),
        }
    }

    fn start_idle_timer(&self, idle: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = locked(&self.inner.idle_timer).replace(token.clone()) {
            previous.cancel();
        }

        let holder = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(holder_id = holder.inner.id, "Idle teardown canceled");
                }
                _ = tokio::time::sleep(idle) => holder.shutdown_if_idle().await,
            }
        });
    }

    fn cancel_idle_timer(&self) {
        if let Some(timer) = locked(&self.inner.idle_timer).take() {
            timer.cancel();
        }
    }

    async fn shutdown_if_idle(&self) {
        let mut connection = self.inner.connection.lock().await;
        if self.unit_count() > 0 {
            debug!(holder_id = self.inner.id, "Holder reused before teardown");
            return;
        }
        if let Some(existing) = connection.take() {
            close_connection(self.inner.id, existing).await;
            info!(holder_id = self.inner.id, "Idle AMQP connection closed");
        }
    }

    async fn teardown(&self) {
        self.cancel_idle_timer();
        let existing = self.inner.connection.lock().await.take();
        if let Some(existing) = existing {
            close_connection(self.inner.id, existing).await;
        }
    }

    async fn close_session(&self, identity: &DeviceIdentity) {
        let connection = self.inner.connection.lock().await.clone();
        if let Some(connection) = connection {
            if !connection.is_closing() {
                if let Err(e) = connection.close_session(identity).await {
                    warn!(holder_id = self.inner.id, "Failed to close session: {}", e);
                }
            }
        }
    }
}

async fn close_connection(holder_id: u64, connection: Arc<dyn AmqpConnection>) {
    if let Err(e) = connection.close().await {
        warn!(holder_id, "Failed to close AMQP connection: {}", e);
    }
}

fn notify_disconnected(handlers: &[Arc<dyn InboundHandler>]) {
    for handler in handlers {
        handler.on_connection_status_changed(
            ConnectionStatus::Disconnected,
            ConnectionStatusChangeReason::CommunicationError,
        );
    }
}

/// A logical session for one identity on a shared connection
pub struct AmqpUnit {
    holder: ConnectionHolder,
    identity: DeviceIdentity,
    unit_id: u64,
    closed: AtomicBool,
}

impl fmt::Debug for AmqpUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpUnit")
            .field("identity", &self.identity.key())
            .field("holder_id", &self.holder.id())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl AmqpUnit {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn holder_id(&self) -> u64 {
        self.holder.id()
    }

    pub fn holder(&self) -> &ConnectionHolder {
        &self.holder
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ensure the shared connection and open this identity's session
    pub async fn open(&self, timeout: Duration) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::AlreadyClosed);
        }
        let connection = self.holder.ensure_connection(timeout).await?;
        connection.open_session(&self.identity, timeout).await?;
        debug!(
            holder_id = self.holder.id(),
            identity = %self.identity.key(),
            "AMQP unit opened"
        );
        Ok(())
    }

    /// Graceful close; further calls are no-ops
    pub async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.holder.close_session(&self.identity).await;
        self.holder
            .release(&self.identity.key(), self.unit_id, true)
            .await;
        Ok(())
    }

    /// Report that this unit's link went away
    pub async fn report_disconnected(&self, graceful: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.holder
            .release(&self.identity.key(), self.unit_id, graceful)
            .await;
    }
}
