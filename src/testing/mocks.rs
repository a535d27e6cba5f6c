//! Mock implementations for testing
//!
//! Provides a scriptable MQTT channel and factory, an AMQP connector, a token
//! signer and a recording inbound handler so transports and pools can be
//! exercised without a broker.

use crate::auth::TokenSigner;
use crate::error::{TransportError, TransportResult};
use crate::identity::DeviceIdentity;
use crate::message::{Message, MethodRequest, TwinCollection};
use crate::transport::amqp::{AmqpConnection, AmqpConnector};
use crate::transport::channel::{
    Channel, ChannelEndpoint, ChannelEvent, ChannelFactory, InboundPublish, OutboundFrame,
    QualityOfService,
};
use crate::transport::{ConnectionStatus, ConnectionStatusChangeReason, InboundHandler};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    true
}

/// Channel that records every frame written to it
#[derive(Debug)]
pub struct MockChannel {
    frames: Mutex<Vec<OutboundFrame>>,
    hold: watch::Sender<bool>,
    write_failure: Mutex<Option<TransportError>>,
    close_failures: AtomicUsize,
    active: AtomicBool,
    open: AtomicBool,
    close_calls: AtomicUsize,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannel {
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            frames: Mutex::new(Vec::new()),
            hold,
            write_failure: Mutex::new(None),
            close_failures: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            open: AtomicBool::new(true),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// While held, SUBSCRIBE and UNSUBSCRIBE writes do not complete
    pub fn hold_acknowledgments(&self, hold: bool) {
        self.hold.send_replace(hold);
    }

    /// Fail every subsequent write with `error`
    pub fn fail_writes(&self, error: Option<TransportError>) {
        *locked(&self.write_failure) = error;
    }

    /// Fail the next `count` close attempts with a transient error
    pub fn fail_closes(&self, count: usize) {
        self.close_failures.store(count, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<OutboundFrame> {
        locked(&self.frames).clone()
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Publish { topic, payload, .. } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn published_topics(&self) -> Vec<String> {
        self.published().into_iter().map(|(topic, _)| topic).collect()
    }

    pub fn subscribe_filters(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Subscribe { filter, .. } => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn unsubscribe_filters(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Unsubscribe { filter } => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn acked_packet_ids(&self) -> Vec<u16> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::PubAck { packet_id } => Some(packet_id),
                _ => None,
            })
            .collect()
    }

    pub fn disconnect_count(&self) -> usize {
        self.frames()
            .iter()
            .filter(|frame| matches!(frame, OutboundFrame::Disconnect))
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn write_and_flush(&self, frame: OutboundFrame) -> TransportResult<()> {
        if let Some(error) = locked(&self.write_failure).clone() {
            return Err(error);
        }
        let awaits_ack = matches!(
            frame,
            OutboundFrame::Subscribe { .. } | OutboundFrame::Unsubscribe { .. }
        );
        if matches!(frame, OutboundFrame::Disconnect) {
            self.active.store(false, Ordering::SeqCst);
        }
        locked(&self.frames).push(frame);

        if awaits_ack {
            let mut hold = self.hold.subscribe();
            hold.wait_for(|held| !*held)
                .await
                .map_err(|_| TransportError::AlreadyClosed)?;
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.close_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.close_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::transient("mock close failure"));
        }
        self.active.store(false, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Factory handing out one shared [`MockChannel`] and exposing its event sink
#[derive(Debug)]
pub struct MockChannelFactory {
    channel: Arc<MockChannel>,
    events: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
    connect_failure: Mutex<Option<TransportError>>,
    auto_connect: AtomicBool,
    connect_calls: AtomicUsize,
    last_endpoint: Mutex<Option<ChannelEndpoint>>,
}

impl Default for MockChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannelFactory {
    pub fn new() -> Self {
        Self {
            channel: Arc::new(MockChannel::new()),
            events: Mutex::new(None),
            connect_failure: Mutex::new(None),
            auto_connect: AtomicBool::new(true),
            connect_calls: AtomicUsize::new(0),
            last_endpoint: Mutex::new(None),
        }
    }

    /// When false, the session is only established by [`Self::send_connected`]
    pub fn with_auto_connect(self, auto_connect: bool) -> Self {
        self.auto_connect.store(auto_connect, Ordering::SeqCst);
        self
    }

    pub fn fail_connect(&self, error: Option<TransportError>) {
        *locked(&self.connect_failure) = error;
    }

    pub fn channel(&self) -> Arc<MockChannel> {
        self.channel.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn last_endpoint(&self) -> Option<ChannelEndpoint> {
        locked(&self.last_endpoint).clone()
    }

    /// Push an event as if the channel produced it; false if nobody listens
    pub async fn inject(&self, event: ChannelEvent) -> bool {
        let sender = locked(&self.events).clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn send_connected(&self) -> bool {
        self.inject(ChannelEvent::Connected).await
    }

    pub async fn deliver_publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QualityOfService,
        packet_id: u16,
    ) -> bool {
        self.inject(ChannelEvent::Message(InboundPublish {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            packet_id,
        }))
        .await
    }

    /// Drop the event sink, ending the transport's event stream
    pub fn drop_events(&self) {
        locked(&self.events).take();
    }
}

#[async_trait]
impl ChannelFactory for MockChannelFactory {
    async fn connect(
        &self,
        _identity: &DeviceIdentity,
        endpoint: &ChannelEndpoint,
        events: mpsc::Sender<ChannelEvent>,
    ) -> TransportResult<Arc<dyn Channel>> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *locked(&self.last_endpoint) = Some(endpoint.clone());
        if let Some(error) = locked(&self.connect_failure).clone() {
            return Err(error);
        }

        *locked(&self.events) = Some(events.clone());
        if self.auto_connect.load(Ordering::SeqCst) {
            let _ = events.send(ChannelEvent::Connected).await;
        }
        Ok(self.channel.clone())
    }
}

/// AMQP connection recording the sessions opened on it
#[derive(Debug, Default)]
pub struct MockAmqpConnection {
    sessions: Mutex<Vec<String>>,
    closing: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockAmqpConnection {
    /// Client ids with an open session, in open order
    pub fn sessions(&self) -> Vec<String> {
        locked(&self.sessions).clone()
    }

    pub fn set_closing(&self, closing: bool) {
        self.closing.store(closing, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmqpConnection for MockAmqpConnection {
    async fn open_session(&self, identity: &DeviceIdentity, _timeout: Duration) -> TransportResult<()> {
        if self.is_closing() {
            return Err(TransportError::transient("connection is closing"));
        }
        locked(&self.sessions).push(identity.client_id());
        Ok(())
    }

    async fn close_session(&self, identity: &DeviceIdentity) -> TransportResult<()> {
        let client_id = identity.client_id();
        locked(&self.sessions).retain(|session| *session != client_id);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Connector producing [`MockAmqpConnection`]s
#[derive(Debug, Default)]
pub struct MockAmqpConnector {
    connections: Mutex<Vec<Arc<MockAmqpConnection>>>,
    failure: Mutex<Option<TransportError>>,
}

impl MockAmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connect(&self, error: Option<TransportError>) {
        *locked(&self.failure) = error;
    }

    pub fn open_count(&self) -> usize {
        locked(&self.connections).len()
    }

    pub fn connections(&self) -> Vec<Arc<MockAmqpConnection>> {
        locked(&self.connections).clone()
    }
}

#[async_trait]
impl AmqpConnector for MockAmqpConnector {
    async fn open_connection(
        &self,
        _identity: &DeviceIdentity,
        _endpoint: &ChannelEndpoint,
        _timeout: Duration,
    ) -> TransportResult<Arc<dyn AmqpConnection>> {
        if let Some(error) = locked(&self.failure).clone() {
            return Err(error);
        }
        let connection = Arc::new(MockAmqpConnection::default());
        locked(&self.connections).push(connection.clone());
        Ok(connection)
    }
}

/// Signer returning a fixed signature and recording what it signed
#[derive(Debug)]
pub struct MockTokenSigner {
    signature: String,
    signed: Mutex<Vec<String>>,
}

impl MockTokenSigner {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            signed: Mutex::new(Vec::new()),
        }
    }

    /// Every string-to-sign seen so far
    pub fn signed(&self) -> Vec<String> {
        locked(&self.signed).clone()
    }
}

#[async_trait]
impl TokenSigner for MockTokenSigner {
    async fn sign(
        &self,
        _module_id: Option<&str>,
        _generation_id: &str,
        data: &[u8],
    ) -> TransportResult<String> {
        locked(&self.signed).push(String::from_utf8_lossy(data).into_owned());
        Ok(self.signature.clone())
    }
}

/// Inbound handler recording every callback
#[derive(Debug, Default)]
pub struct RecordingHandler {
    methods: Mutex<Vec<MethodRequest>>,
    patches: Mutex<Vec<TwinCollection>>,
    events: Mutex<Vec<(String, Message)>>,
    statuses: Mutex<Vec<(ConnectionStatus, ConnectionStatusChangeReason)>>,
    fail_callbacks: bool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every async callback returns an error after recording
    pub fn failing() -> Self {
        Self {
            fail_callbacks: true,
            ..Self::default()
        }
    }

    pub fn methods(&self) -> Vec<MethodRequest> {
        locked(&self.methods).clone()
    }

    pub fn patches(&self) -> Vec<TwinCollection> {
        locked(&self.patches).clone()
    }

    pub fn events(&self) -> Vec<(String, Message)> {
        locked(&self.events).clone()
    }

    pub fn statuses(&self) -> Vec<(ConnectionStatus, ConnectionStatusChangeReason)> {
        locked(&self.statuses).clone()
    }

    fn outcome(&self) -> TransportResult<()> {
        if self.fail_callbacks {
            Err(TransportError::CallbackFailed("mock callback failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl InboundHandler for RecordingHandler {
    async fn on_method_call(&self, request: MethodRequest) -> TransportResult<()> {
        locked(&self.methods).push(request);
        self.outcome()
    }

    async fn on_desired_properties(&self, patch: TwinCollection) -> TransportResult<()> {
        locked(&self.patches).push(patch);
        self.outcome()
    }

    async fn on_event_message(&self, input_name: &str, message: Message) -> TransportResult<()> {
        locked(&self.events).push((input_name.to_string(), message));
        self.outcome()
    }

    fn on_connection_status_changed(
        &self,
        status: ConnectionStatus,
        reason: ConnectionStatusChangeReason,
    ) {
        locked(&self.statuses).push((status, reason));
    }
}
