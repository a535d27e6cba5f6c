//! [`Channel`] backed by a rumqttc client and event loop
//!
//! The event loop runs on its own task and forwards CONNACK, PUBLISH and
//! terminal errors to the transport. SUBSCRIBE and UNSUBSCRIBE writes resolve
//! only when the broker acknowledges them.

use super::connection::{configure_mqtt_options, from_rumqttc_qos, to_rumqttc_qos};
use crate::auth::resolve_password;
use crate::error::{TransportError, TransportResult};
use crate::identity::DeviceIdentity;
use crate::transport::channel::{
    Channel, ChannelEndpoint, ChannelEvent, ChannelFactory, InboundPublish, OutboundFrame,
};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing,
    Packet, Publish, QoS, SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the client-to-event-loop request queue
const DEFAULT_REQUEST_CAPACITY: usize = 10;

/// How long close waits for a requested DISCONNECT to be flushed
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// SUBACK failure code reported as the rejection status
const SUBACK_FAILURE: u16 = 0x80;

type AckWaiter = oneshot::Sender<TransportResult<()>>;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn client_error(error: ClientError) -> TransportError {
    TransportError::fatal(format!("MQTT event loop is gone: {error}"))
}

/// Creates [`RumqttChannel`]s
#[derive(Debug, Clone)]
pub struct RumqttChannelFactory {
    request_capacity: usize,
}

impl Default for RumqttChannelFactory {
    fn default() -> Self {
        Self {
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }
}

impl RumqttChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }
}

#[async_trait]
impl ChannelFactory for RumqttChannelFactory {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        endpoint: &ChannelEndpoint,
        events: mpsc::Sender<ChannelEvent>,
    ) -> TransportResult<Arc<dyn Channel>> {
        let password = resolve_password(identity).await?;
        let options = configure_mqtt_options(identity, endpoint, password)?;
        let (client, event_loop) = AsyncClient::new(options, self.request_capacity);

        info!(
            client_id = %identity.client_id(),
            host = %endpoint.host,
            port = endpoint.port,
            "Starting MQTT event loop"
        );

        let shared = Arc::new(Shared::default());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_event_loop(
            event_loop,
            shared.clone(),
            events,
            shutdown.clone(),
        ));

        Ok(Arc::new(RumqttChannel {
            client,
            shared,
            request_order: tokio::sync::Mutex::new(()),
            shutdown,
            event_loop_handle: Mutex::new(Some(handle)),
        }))
    }
}

/// State shared between the channel and its event-loop task
#[derive(Default)]
struct Shared {
    active: AtomicBool,
    closed: AtomicBool,
    disconnect_requested: AtomicBool,
    /// Waiters whose SUBSCRIBE/UNSUBSCRIBE has not been assigned a packet id yet
    unassigned: Mutex<VecDeque<AckWaiter>>,
    in_flight: Mutex<HashMap<u16, AckWaiter>>,
    /// QoS 1 publishes awaiting a manual PUBACK, by packet id
    unacked: Mutex<HashMap<u16, Publish>>,
}

impl Shared {
    fn assign(&self, packet_id: u16) {
        match locked(&self.unassigned).pop_front() {
            Some(waiter) => {
                locked(&self.in_flight).insert(packet_id, waiter);
            }
            None => warn!(packet_id, "Outgoing subscription request without a waiter"),
        }
    }

    fn resolve(&self, packet_id: u16, result: TransportResult<()>) {
        match locked(&self.in_flight).remove(&packet_id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!(packet_id, "Acknowledgment without a waiter"),
        }
    }

    /// Drop every waiter; their writes observe `AlreadyClosed`
    fn release_waiters(&self) {
        locked(&self.unassigned).clear();
        locked(&self.in_flight).clear();
        locked(&self.unacked).clear();
    }
}

/// A live rumqttc connection
pub struct RumqttChannel {
    client: AsyncClient,
    shared: Arc<Shared>,
    /// Keeps waiter registration and request submission in the same order
    request_order: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttChannel {
    async fn write_acknowledged<F, Fut>(&self, submit: F) -> TransportResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), ClientError>>,
    {
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.request_order.lock().await;
            locked(&self.shared.unassigned).push_back(tx);
            if let Err(e) = submit().await {
                locked(&self.shared.unassigned).pop_back();
                return Err(client_error(e));
            }
        }
        rx.await.map_err(|_| TransportError::AlreadyClosed)?
    }
}

#[async_trait]
impl Channel for RumqttChannel {
    async fn write_and_flush(&self, frame: OutboundFrame) -> TransportResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::AlreadyClosed);
        }

        match frame {
            OutboundFrame::Publish {
                topic,
                payload,
                qos,
            } => self
                .client
                .publish_bytes(topic, to_rumqttc_qos(qos), false, payload)
                .await
                .map_err(client_error),
            OutboundFrame::PubAck { packet_id } => {
                let publish = locked(&self.shared.unacked).remove(&packet_id);
                let publish = publish.ok_or_else(|| {
                    TransportError::transient(format!(
                        "no unacknowledged publish with packet id {packet_id}"
                    ))
                })?;
                self.client.ack(&publish).await.map_err(client_error)
            }
            OutboundFrame::Subscribe { filter, qos } => {
                debug!(filter = %filter, "Subscribing");
                self.write_acknowledged(|| self.client.subscribe(filter, to_rumqttc_qos(qos)))
                    .await
            }
            OutboundFrame::Unsubscribe { filter } => {
                debug!(filter = %filter, "Unsubscribing");
                self.write_acknowledged(|| self.client.unsubscribe(filter))
                    .await
            }
            OutboundFrame::Disconnect => {
                self.shared.active.store(false, Ordering::Release);
                self.shared.disconnect_requested.store(true, Ordering::Release);
                self.client.disconnect().await.map_err(client_error)
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.active.store(false, Ordering::Release);

        let handle = locked(&self.event_loop_handle).take();
        if let Some(handle) = handle {
            if self.shared.disconnect_requested.load(Ordering::Acquire) {
                // Give the event loop a chance to flush the DISCONNECT
                let abort = handle.abort_handle();
                if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, handle).await.is_err() {
                    abort.abort();
                }
            } else {
                handle.abort();
            }
        }
        self.shutdown.cancel();
        self.shared.release_waiters();
        debug!("MQTT channel closed");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for RumqttChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    shared: Arc<Shared>,
    events: mpsc::Sender<ChannelEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            polled = event_loop.poll() => polled,
        };

        let event = match polled {
            Ok(event) => event,
            Err(error) => {
                shared.active.store(false, Ordering::Release);
                if !shared.disconnect_requested.load(Ordering::Acquire) {
                    error!("MQTT event loop error: {}", error);
                    let _ = events.send(ChannelEvent::Error(connection_error(error))).await;
                }
                break;
            }
        };

        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    shared.active.store(true, Ordering::Release);
                    if events.send(ChannelEvent::Connected).await.is_err() {
                        break;
                    }
                } else {
                    let _ = events
                        .send(ChannelEvent::Error(refused(ack.code)))
                        .await;
                    break;
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!(topic = %publish.topic, pkid = publish.pkid, "PUBLISH received");
                if publish.qos != QoS::AtMostOnce {
                    locked(&shared.unacked).insert(publish.pkid, publish.clone());
                }
                let inbound = InboundPublish {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: from_rumqttc_qos(publish.qos),
                    packet_id: publish.pkid,
                };
                if events.send(ChannelEvent::Message(inbound)).await.is_err() {
                    break;
                }
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let result = if rejected {
                    Err(TransportError::ServiceRejected {
                        status: SUBACK_FAILURE,
                    })
                } else {
                    Ok(())
                };
                shared.resolve(ack.pkid, result);
            }
            Event::Incoming(Packet::UnsubAck(ack)) => shared.resolve(ack.pkid, Ok(())),
            Event::Incoming(Packet::Disconnect) => {
                shared.active.store(false, Ordering::Release);
                warn!("Broker closed the MQTT session");
                let _ = events
                    .send(ChannelEvent::Error(TransportError::transient(
                        "broker sent DISCONNECT",
                    )))
                    .await;
                break;
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) | Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                shared.assign(pkid);
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                debug!("DISCONNECT flushed");
                break;
            }
            other => trace!("MQTT event: {:?}", other),
        }
    }

    shared.active.store(false, Ordering::Release);
    shared.release_waiters();
    debug!("MQTT event loop stopped");
}

fn refused(code: ConnectReturnCode) -> TransportError {
    TransportError::fatal(format!("connection refused: {code:?}"))
}

fn connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => refused(code),
        other => TransportError::transient(format!("connection lost: {other}")),
    }
}
