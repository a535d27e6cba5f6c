//! MQTT transport: lifecycle state machine, inbound dispatch and operations
//!
//! One instance owns one channel for its whole life; it cannot be reopened
//! after `close` or a fault. Inbound frames are processed sequentially on a
//! single dispatch task.

use super::ack_tracker::AckTracker;
use super::completion::Completion;
use super::message_handler::{InboundRoute, MessageHandler};
use super::state::{AtomicTransportState, TransportState};
use super::subscription::{SubscriptionKind, SubscriptionStateMachine};
use super::topics::{TopicBuilder, METHOD_POST_FILTER, TWIN_PATCH_FILTER, TWIN_RESPONSE_FILTER};
use super::twin::TwinRequestCorrelator;
use crate::config::ConfigError;
use crate::error::{TransportError, TransportResult};
use crate::identity::DeviceIdentity;
use crate::message::{Message, MethodResponse, Twin, TwinCollection};
use crate::transport::channel::{
    Channel, ChannelEndpoint, ChannelEvent, ChannelFactory, InboundPublish, OutboundFrame,
    QualityOfService,
};
use crate::transport::settings::MqttTransportSettings;
use crate::transport::{
    ConnectionStatus, ConnectionStatusChangeReason, InboundHandler, Transport,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Wrap an application callback failure so it is treated as fatal
fn callback_failure(error: TransportError) -> TransportError {
    match error {
        TransportError::CallbackFailed(_) => error,
        other => TransportError::CallbackFailed(other.to_string()),
    }
}

/// MQTT implementation of [`Transport`]
pub struct MqttTransport {
    inner: Arc<Inner>,
}

struct Inner {
    identity: DeviceIdentity,
    settings: MqttTransportSettings,
    endpoint: ChannelEndpoint,
    module_event_prefix: Option<String>,
    channel_factory: Arc<dyn ChannelFactory>,
    handler: Arc<dyn InboundHandler>,
    state: AtomicTransportState,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    open_completion: Completion,
    subscriptions: SubscriptionStateMachine,
    twin: TwinRequestCorrelator,
    acks: tokio::sync::Mutex<AckTracker>,
    /// Devicebound messages awaiting `receive`, QoS 0 entries bounded by settings
    inbound: Mutex<VecDeque<InboundPublish>>,
    inbound_ready: Semaphore,
    /// Internal teardown signal, distinct from any caller cancellation
    disconnect: CancellationToken,
    fatal_error: Mutex<Option<TransportError>>,
    cleanup: OnceCell<()>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Create a transport for an identity configured with an MQTT variant
    pub fn new(
        identity: DeviceIdentity,
        channel_factory: Arc<dyn ChannelFactory>,
        handler: Arc<dyn InboundHandler>,
    ) -> TransportResult<Self> {
        let settings = identity.settings().mqtt().cloned().ok_or_else(|| {
            ConfigError::InvalidConfig("identity is not configured for an MQTT transport".to_string())
        })?;
        let endpoint = ChannelEndpoint::new(identity.host_name(), identity.settings().default_port());
        let module_event_prefix = identity
            .module_id()
            .map(|module| TopicBuilder::module_event_prefix(identity.device_id(), module));

        Ok(Self {
            inner: Arc::new(Inner {
                subscriptions: SubscriptionStateMachine::new(settings.subscribe_timeout),
                twin: TwinRequestCorrelator::new(settings.twin_timeout),
                identity,
                endpoint,
                module_event_prefix,
                channel_factory,
                handler,
                state: AtomicTransportState::default(),
                channel: Mutex::new(None),
                open_completion: Completion::new(),
                acks: tokio::sync::Mutex::new(AckTracker::new()),
                inbound: Mutex::new(VecDeque::new()),
                inbound_ready: Semaphore::new(0),
                disconnect: CancellationToken::new(),
                fatal_error: Mutex::new(None),
                cleanup: OnceCell::new(),
                dispatch_task: Mutex::new(None),
                settings,
            }),
        })
    }

    pub fn state(&self) -> TransportState {
        self.inner.state.load()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    /// Receive using the configured default timeout
    pub async fn receive_default(&self, cancel: &CancellationToken) -> TransportResult<Option<Message>> {
        let timeout = self.inner.settings.default_receive_timeout;
        self.inner.receive(timeout, cancel).await
    }
}

impl Inner {
    fn fatal(&self) -> TransportError {
        locked(&self.fatal_error)
            .clone()
            .unwrap_or_else(|| TransportError::faulted("transport entered the error state"))
    }

    /// Error reported to callers once the transport is torn down
    fn terminal_error(&self) -> TransportError {
        match self.state.load() {
            TransportState::Error => self.fatal(),
            _ => TransportError::AlreadyClosed,
        }
    }

    fn ensure_open(&self) -> TransportResult<Arc<dyn Channel>> {
        match self.state.load() {
            state if state.is_open_compatible() => locked(&self.channel)
                .clone()
                .ok_or(TransportError::NotConnected { state }),
            TransportState::Error => Err(self.fatal()),
            TransportState::Closed => Err(TransportError::AlreadyClosed),
            state => Err(TransportError::NotConnected { state }),
        }
    }

    /// Surface `result` to the caller, faulting the transport first when fatal
    fn observe<T>(self: &Arc<Self>, result: TransportResult<T>) -> TransportResult<T> {
        if let Err(error) = &result {
            if error.is_fatal() {
                self.on_error(error.clone());
            }
        }
        result
    }

    async fn write(
        self: &Arc<Self>,
        channel: &dyn Channel,
        frame: OutboundFrame,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let result = tokio::select! {
            result = channel.write_and_flush(frame) => result,
            _ = cancel.cancelled() => Err(TransportError::Canceled),
        };
        self.observe(result)
    }

    /// Move to `Error`, release every waiter and schedule cleanup
    fn on_error(self: &Arc<Self>, error: TransportError) {
        let previous = {
            let mut fatal = locked(&self.fatal_error);
            let previous = self.state.move_to_if_possible(
                TransportState::Error,
                &[TransportState::Closed, TransportState::Error],
            );
            if !previous.is_terminal() {
                *fatal = Some(error.clone());
            }
            previous
        };

        match previous {
            TransportState::Closed | TransportState::Error => return,
            TransportState::NotInitialized | TransportState::Opening => {
                self.open_completion.try_fail(error.clone());
                self.subscriptions.fail_pending(error.clone());
            }
            TransportState::Open | TransportState::Subscribing => {
                self.subscriptions.fail_pending(error.clone());
            }
            TransportState::Receiving => {}
        }

        error!(
            device_id = %self.identity.device_id(),
            previous_state = ?previous,
            "MQTT transport faulted: {}", error
        );
        self.disconnect.cancel();
        self.twin.fail_all(error);
        if previous != TransportState::NotInitialized {
            self.handler.on_connection_status_changed(
                ConnectionStatus::Disconnected,
                ConnectionStatusChangeReason::CommunicationError,
            );
        }

        let inner = self.clone();
        tokio::spawn(async move { inner.cleanup().await });
    }

    /// Idempotent teardown: DISCONNECT if writable, then close, under the close retry policy
    async fn cleanup(&self) {
        self.cleanup
            .get_or_init(|| async {
                self.disconnect.cancel();
                let channel = locked(&self.channel).clone();
                if let Some(channel) = channel {
                    let result = self
                        .settings
                        .close_retry
                        .execute("close_channel", || {
                            let channel = channel.clone();
                            async move {
                                if channel.is_active() {
                                    channel.write_and_flush(OutboundFrame::Disconnect).await?;
                                }
                                if channel.is_open() {
                                    channel.close().await?;
                                }
                                Ok(())
                            }
                        })
                        .await;
                    if let Err(e) = result {
                        warn!("Channel teardown failed, giving up: {}", e);
                    }
                }
                locked(&self.inbound).clear();
                debug!(device_id = %self.identity.device_id(), "Transport cleanup complete");
            })
            .await;
    }

    /// Give up on an open whose initiator was canceled
    fn abort_open(self: &Arc<Self>) {
        if self
            .state
            .try_transition(TransportState::Opening, TransportState::Closed)
        {
            info!(device_id = %self.identity.device_id(), "Open canceled, transport closed");
            self.open_completion.try_cancel();
            self.disconnect.cancel();
            let inner = self.clone();
            tokio::spawn(async move { inner.cleanup().await });
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, mut events: mpsc::Receiver<ChannelEvent>) {
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = inner.disconnect.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => inner.handle_event(event).await,
                        None => {
                            inner.on_error(TransportError::faulted("channel event stream ended"));
                            break;
                        }
                    }
                }
            }
            debug!(device_id = %inner.identity.device_id(), "Dispatch loop stopped");
        });
        *locked(&self.dispatch_task) = Some(handle);
    }

    async fn handle_event(self: &Arc<Self>, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                if self
                    .state
                    .try_transition(TransportState::Opening, TransportState::Open)
                {
                    info!(device_id = %self.identity.device_id(), "MQTT transport connected");
                    // The opener completes instead if it has not stored the channel yet
                    if locked(&self.channel).is_some() {
                        self.open_completion.try_complete();
                    }
                    self.handler.on_connection_status_changed(
                        ConnectionStatus::Connected,
                        ConnectionStatusChangeReason::ConnectionOk,
                    );
                }
            }
            ChannelEvent::Error(error) => self.on_error(error),
            ChannelEvent::Message(publish) => {
                if !self.state.load().is_open_compatible() {
                    debug!(topic = %publish.topic, "Dropping frame received outside open state");
                    return;
                }
                if let Err(error) = self.route_inbound(publish).await {
                    self.on_error(error);
                }
            }
        }
    }

    async fn route_inbound(self: &Arc<Self>, publish: InboundPublish) -> TransportResult<()> {
        let route = MessageHandler::classify(&publish.topic, self.module_event_prefix.as_deref());
        match route {
            InboundRoute::TwinResponse => {
                self.twin.dispatch_response(&publish.topic, publish.payload);
            }
            InboundRoute::TwinPatch => match MessageHandler::parse_desired_patch(&publish.payload) {
                Ok(patch) => self
                    .handler
                    .on_desired_properties(patch)
                    .await
                    .map_err(callback_failure)?,
                Err(reason) => warn!(topic = %publish.topic, "Dropping twin patch: {}", reason),
            },
            InboundRoute::MethodCall { name, request_id } => {
                debug!(method = %name, request_id = %request_id, "Method call received");
                let request = MessageHandler::to_method_request(&publish, name, request_id);
                self.handler
                    .on_method_call(request)
                    .await
                    .map_err(callback_failure)?;
            }
            InboundRoute::MalformedMethod => {
                warn!(topic = %publish.topic, "Dropping method call with malformed topic");
            }
            InboundRoute::ModuleEvent { input_name } => {
                self.deliver_module_event(publish, input_name.unwrap_or_default())
                    .await?;
            }
            InboundRoute::Telemetry => self.enqueue_telemetry(publish),
        }
        Ok(())
    }

    /// Queue a devicebound message for `receive`.
    ///
    /// QoS 0 frames beyond `max_pending_inbound_messages` are dropped. QoS 1
    /// frames are always queued; they stay unacknowledged until completed, and
    /// the hub stops delivering once its per-device in-flight window is full.
    fn enqueue_telemetry(&self, publish: InboundPublish) {
        let mut inbound = locked(&self.inbound);
        if publish.qos == QualityOfService::AtMostOnce
            && inbound.len() >= self.settings.max_pending_inbound_messages.max(1)
        {
            warn!(
                topic = %publish.topic,
                pending = inbound.len(),
                "Inbound queue full, dropping QoS 0 message"
            );
            return;
        }
        inbound.push_back(publish);
        drop(inbound);
        self.inbound_ready.add_permits(1);
    }

    async fn deliver_module_event(
        self: &Arc<Self>,
        publish: InboundPublish,
        input_name: String,
    ) -> TransportResult<()> {
        let mut message = MessageHandler::to_message(&publish, Some(input_name.clone()));
        if publish.qos == QualityOfService::AtLeastOnce
            && self.settings.receive_qos == QualityOfService::AtLeastOnce
        {
            message.lock_token = Some(self.acks.lock().await.track(publish.packet_id));
        }
        let lock_token = message.lock_token.clone();

        self.handler
            .on_event_message(&input_name, message)
            .await
            .map_err(callback_failure)?;

        if let Some(token) = lock_token {
            match self.complete(&token, &CancellationToken::new()).await {
                Ok(()) => {}
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => debug!(input = %input_name, "Module event not auto-acknowledged: {}", error),
            }
        }
        Ok(())
    }

    async fn open(self: &Arc<Self>, cancel: &CancellationToken) -> TransportResult<()> {
        let initiator = self
            .state
            .try_transition(TransportState::NotInitialized, TransportState::Opening);

        if initiator {
            info!(
                device_id = %self.identity.device_id(),
                host = %self.endpoint.host,
                port = self.endpoint.port,
                "Opening MQTT transport"
            );
            self.acks.lock().await.regenerate();

            let (events_tx, events_rx) =
                mpsc::channel(self.settings.max_pending_inbound_messages.max(1));
            self.spawn_dispatch(events_rx);

            let connected = tokio::select! {
                result = self.channel_factory.connect(&self.identity, &self.endpoint, events_tx) => result,
                _ = cancel.cancelled() => Err(TransportError::Canceled),
            };
            match connected {
                Ok(channel) => {
                    *locked(&self.channel) = Some(channel.clone());
                    if self.state.load().is_terminal() {
                        // Torn down while connecting; cleanup may have missed this channel
                        let _ = channel.close().await;
                        return Err(self.terminal_error());
                    }
                    if self.state.load().is_open_compatible() {
                        self.open_completion.try_complete();
                    }
                }
                Err(TransportError::Canceled) => {
                    self.abort_open();
                    return Err(TransportError::Canceled);
                }
                Err(error) => {
                    self.on_error(error.clone());
                    return Err(error);
                }
            }
        } else {
            match self.state.load() {
                TransportState::Closed => return Err(TransportError::AlreadyClosed),
                TransportState::Error => return Err(self.fatal()),
                _ => {}
            }
        }

        match self.open_completion.wait(cancel).await {
            Ok(()) => {}
            Err(TransportError::Canceled) => {
                if initiator {
                    self.abort_open();
                }
                return Err(TransportError::Canceled);
            }
            Err(TransportError::AlreadyClosed) => return Err(self.terminal_error()),
            Err(error) => return Err(error),
        }

        self.subscribe_named(
            SubscriptionKind::TwinResponse,
            TWIN_RESPONSE_FILTER,
            QualityOfService::AtMostOnce,
            cancel,
        )
        .await
    }

    async fn close(self: &Arc<Self>, cancel: &CancellationToken) -> TransportResult<()> {
        if cancel.is_cancelled() {
            return Err(TransportError::Canceled);
        }

        let previous = self.state.move_to_if_possible(
            TransportState::Closed,
            &[TransportState::Closed, TransportState::Error],
        );
        match previous {
            TransportState::Error => return Err(self.fatal()),
            TransportState::Closed => {
                // Join a close already in progress
                self.cleanup().await;
                return Ok(());
            }
            TransportState::NotInitialized | TransportState::Receiving => {}
            TransportState::Opening => {
                self.open_completion.try_cancel();
            }
            TransportState::Open | TransportState::Subscribing => {
                self.subscriptions.cancel_pending();
            }
        }

        info!(
            device_id = %self.identity.device_id(),
            previous_state = ?previous,
            "Closing MQTT transport"
        );
        self.disconnect.cancel();
        self.twin.fail_all(TransportError::AlreadyClosed);
        if previous != TransportState::NotInitialized {
            self.handler.on_connection_status_changed(
                ConnectionStatus::Disabled,
                ConnectionStatusChangeReason::ClientClose,
            );
        }
        self.cleanup().await;
        Ok(())
    }

    async fn subscribe_named(
        self: &Arc<Self>,
        kind: SubscriptionKind,
        filter: &str,
        qos: QualityOfService,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let channel = self.ensure_open()?;
        let result = self
            .subscriptions
            .enable(kind, channel.as_ref(), filter, qos, cancel)
            .await;
        self.observe(result)
    }

    async fn unsubscribe_named(
        self: &Arc<Self>,
        kind: SubscriptionKind,
        filter: &str,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let channel = self.ensure_open()?;
        let result = self
            .subscriptions
            .disable(kind, channel.as_ref(), filter, cancel)
            .await;
        self.observe(result)
    }

    async fn receive(
        self: &Arc<Self>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<Option<Message>> {
        let channel = self.ensure_open()?;
        if self.state.load() != TransportState::Receiving {
            let filter = TopicBuilder::devicebound_filter(self.identity.device_id());
            let result = self
                .subscriptions
                .ensure_default(
                    &self.state,
                    channel.as_ref(),
                    &filter,
                    self.settings.receive_qos,
                    cancel,
                )
                .await;
            match self.observe(result) {
                Ok(()) => {}
                Err(TransportError::AlreadyClosed) => return Err(self.terminal_error()),
                Err(error) => return Err(error),
            }
        }

        let permit = tokio::select! {
            biased;
            _ = self.disconnect.cancelled() => return Err(self.terminal_error()),
            _ = cancel.cancelled() => return Err(TransportError::Canceled),
            permit = self.inbound_ready.acquire() => permit,
            _ = tokio::time::sleep(timeout) => return Ok(None),
        };
        match permit {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(self.terminal_error()),
        }

        // Pop and track under the ack lock so lock tokens follow arrival order
        let mut acks = self.acks.lock().await;
        let Some(publish) = locked(&self.inbound).pop_front() else {
            return Ok(None);
        };
        let mut message = MessageHandler::to_message(&publish, None);
        if self.settings.receive_qos == QualityOfService::AtLeastOnce
            && publish.qos == QualityOfService::AtLeastOnce
        {
            message.lock_token = Some(acks.track(publish.packet_id));
        }
        Ok(Some(message))
    }

    async fn complete(self: &Arc<Self>, lock_token: &str, cancel: &CancellationToken) -> TransportResult<()> {
        let channel = self.ensure_open()?;
        if self.settings.receive_qos == QualityOfService::AtMostOnce {
            return Err(TransportError::UnsupportedOperation(
                "complete is not allowed at QoS 0",
            ));
        }

        if cancel.is_cancelled() {
            return Err(TransportError::Canceled);
        }

        // The lock is held across the write so PUBACKs leave in queue order.
        // The head is dequeued only after its PUBACK is written; the write ignores `cancel`.
        let mut acks = self.acks.lock().await;
        let packet_id = acks.head_packet_id(lock_token)?;
        let result = channel
            .write_and_flush(OutboundFrame::PubAck { packet_id })
            .await;
        self.observe(result)?;
        acks.commit_head();
        Ok(())
    }

    async fn publish(
        self: &Arc<Self>,
        topic: String,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let channel = self.ensure_open()?;
        let frame = OutboundFrame::Publish {
            topic,
            payload,
            qos: self.settings.publish_qos,
        };
        self.write(channel.as_ref(), frame, cancel).await
    }

    async fn twin_round_trip(
        self: &Arc<Self>,
        topic_for: fn(&str) -> String,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> TransportResult<Bytes> {
        self.ensure_open()?;
        self.subscribe_named(
            SubscriptionKind::TwinResponse,
            TWIN_RESPONSE_FILTER,
            QualityOfService::AtMostOnce,
            cancel,
        )
        .await?;

        self.twin
            .round_trip(
                |request_id| async move { self.publish(topic_for(&request_id), body, cancel).await },
                cancel,
            )
            .await
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn open(&self, cancel: &CancellationToken) -> TransportResult<()> {
        let span = crate::transport_span!(
            operation = "open",
            device_id = %self.inner.identity.device_id()
        );
        self.inner.open(cancel).instrument(span).await
    }

    async fn close(&self, cancel: &CancellationToken) -> TransportResult<()> {
        let span = crate::transport_span!(
            operation = "close",
            device_id = %self.inner.identity.device_id()
        );
        self.inner.close(cancel).instrument(span).await
    }

    async fn send_event(&self, message: Message, cancel: &CancellationToken) -> TransportResult<()> {
        let topic = TopicBuilder::telemetry_topic_for(&self.inner.identity, &message);
        self.inner.publish(topic, message.payload, cancel).await
    }

    async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<Option<Message>> {
        self.inner.receive(timeout, cancel).await
    }

    async fn complete(&self, lock_token: &str, cancel: &CancellationToken) -> TransportResult<()> {
        self.inner.complete(lock_token, cancel).await
    }

    async fn abandon(&self, _lock_token: &str, _cancel: &CancellationToken) -> TransportResult<()> {
        Err(TransportError::UnsupportedOperation(
            "MQTT cannot abandon a message",
        ))
    }

    async fn reject(&self, _lock_token: &str, _cancel: &CancellationToken) -> TransportResult<()> {
        Err(TransportError::UnsupportedOperation(
            "MQTT cannot reject a message",
        ))
    }

    async fn enable_methods(&self, cancel: &CancellationToken) -> TransportResult<()> {
        self.inner
            .subscribe_named(
                SubscriptionKind::Methods,
                METHOD_POST_FILTER,
                QualityOfService::AtMostOnce,
                cancel,
            )
            .await
    }

    async fn disable_methods(&self, cancel: &CancellationToken) -> TransportResult<()> {
        self.inner
            .unsubscribe_named(SubscriptionKind::Methods, METHOD_POST_FILTER, cancel)
            .await
    }

    async fn send_method_response(
        &self,
        response: MethodResponse,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let topic = TopicBuilder::method_response_topic(response.status, &response.request_id);
        self.inner.publish(topic, response.payload, cancel).await
    }

    async fn enable_twin_patch(&self, cancel: &CancellationToken) -> TransportResult<()> {
        self.inner
            .subscribe_named(
                SubscriptionKind::TwinPatch,
                TWIN_PATCH_FILTER,
                QualityOfService::AtMostOnce,
                cancel,
            )
            .await
    }

    async fn send_twin_get(&self, cancel: &CancellationToken) -> TransportResult<Twin> {
        let body = self
            .inner
            .twin_round_trip(TopicBuilder::twin_get_topic, Bytes::new(), cancel)
            .await?;
        Twin::from_json(&body)
    }

    async fn send_twin_patch(
        &self,
        reported: TwinCollection,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let body = Bytes::from(serde_json::to_vec(&reported)?);
        self.inner
            .twin_round_trip(TopicBuilder::twin_patch_topic, body, cancel)
            .await
            .map(|_| ())
    }

    async fn enable_event_receive(&self, cancel: &CancellationToken) -> TransportResult<()> {
        let identity = &self.inner.identity;
        let Some(module) = identity.module_id() else {
            return Err(TransportError::UnsupportedOperation(
                "event receive requires a module identity",
            ));
        };
        let filter = TopicBuilder::module_event_filter(identity.device_id(), module);
        self.inner
            .subscribe_named(
                SubscriptionKind::ModuleEvents,
                &filter,
                self.inner.settings.receive_qos,
                cancel,
            )
            .await
    }

    async fn disable_event_receive(&self, cancel: &CancellationToken) -> TransportResult<()> {
        let identity = &self.inner.identity;
        let Some(module) = identity.module_id() else {
            return Err(TransportError::UnsupportedOperation(
                "event receive requires a module identity",
            ));
        };
        let filter = TopicBuilder::module_event_filter(identity.device_id(), module);
        self.inner
            .unsubscribe_named(SubscriptionKind::ModuleEvents, &filter, cancel)
            .await
    }

    fn is_usable(&self) -> bool {
        self.inner.state.load().is_open_compatible()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // Stop the dispatch task; graceful teardown requires an explicit close()
        self.inner.disconnect.cancel();
        if let Some(handle) = locked(&self.inner.dispatch_task).take() {
            handle.abort();
        }
    }
}
