//! Transport layer for device-to-cloud communication
//!
//! [`Transport`] is the one operation contract every protocol variant exposes.
//! Inbound method calls, twin patches, module events and connection status
//! changes reach the application through an injected [`InboundHandler`].

use crate::error::TransportResult;
use crate::message::{Message, MethodRequest, MethodResponse, Twin, TwinCollection};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod amqp;
pub mod channel;
pub mod mqtt;
pub mod settings;

pub use channel::{
    Channel, ChannelEndpoint, ChannelEvent, ChannelFactory, InboundPublish, OutboundFrame,
    QualityOfService,
};
pub use settings::{
    AmqpConnectionPoolSettings, AmqpTransportSettings, MqttTransportSettings, TransportSettings,
    WillMessage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    /// Closed by the application
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatusChangeReason {
    ConnectionOk,
    ExpiredSasToken,
    DeviceDisabled,
    BadCredential,
    RetryExpired,
    NoNetwork,
    CommunicationError,
    ClientClose,
}

/// Application callbacks for inbound traffic.
///
/// Callbacks run on the transport's single dispatch task; an `Err` is treated
/// as a fatal transport error.
///
/// Inbound frames, including twin responses, are not routed while a callback
/// is running, and the network loop stops reading once the inbound queue is
/// full. A callback must therefore not await a twin round trip or a
/// subscription change (`enable_*`/`disable_*`, the first `receive`) on the
/// same transport. Spawn a task for such work instead.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_method_call(&self, _request: MethodRequest) -> TransportResult<()> {
        Ok(())
    }

    async fn on_desired_properties(&self, _patch: TwinCollection) -> TransportResult<()> {
        Ok(())
    }

    async fn on_event_message(&self, _input_name: &str, _message: Message) -> TransportResult<()> {
        Ok(())
    }

    fn on_connection_status_changed(
        &self,
        _status: ConnectionStatus,
        _reason: ConnectionStatusChangeReason,
    ) {
    }
}

/// Handler that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl InboundHandler for NoopHandler {}

/// Transport trait for device communication
///
/// Every suspending operation accepts a cancellation token.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, cancel: &CancellationToken) -> TransportResult<()>;

    async fn close(&self, cancel: &CancellationToken) -> TransportResult<()>;

    async fn send_event(&self, message: Message, cancel: &CancellationToken) -> TransportResult<()>;

    /// Send sequentially, stopping at the first failure
    async fn send_events(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        for message in messages {
            self.send_event(message, cancel).await?;
        }
        Ok(())
    }

    /// `Ok(None)` when nothing arrives within `timeout`
    async fn receive(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<Option<Message>>;

    async fn complete(&self, lock_token: &str, cancel: &CancellationToken) -> TransportResult<()>;

    async fn abandon(&self, lock_token: &str, cancel: &CancellationToken) -> TransportResult<()>;

    async fn reject(&self, lock_token: &str, cancel: &CancellationToken) -> TransportResult<()>;

    async fn enable_methods(&self, cancel: &CancellationToken) -> TransportResult<()>;

    async fn disable_methods(&self, cancel: &CancellationToken) -> TransportResult<()>;

    async fn send_method_response(
        &self,
        response: MethodResponse,
        cancel: &CancellationToken,
    ) -> TransportResult<()>;

    async fn enable_twin_patch(&self, cancel: &CancellationToken) -> TransportResult<()>;

    async fn send_twin_get(&self, cancel: &CancellationToken) -> TransportResult<Twin>;

    async fn send_twin_patch(
        &self,
        reported: TwinCollection,
        cancel: &CancellationToken,
    ) -> TransportResult<()>;

    async fn enable_event_receive(&self, cancel: &CancellationToken) -> TransportResult<()>;

    async fn disable_event_receive(&self, cancel: &CancellationToken) -> TransportResult<()>;

    /// Open-compatible and not faulted
    fn is_usable(&self) -> bool;
}
