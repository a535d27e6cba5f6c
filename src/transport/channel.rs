//! Opaque bidirectional channel between a transport and the broker
//!
//! Socket, TLS, WebSocket and MQTT framing live behind [`Channel`]; the
//! transport only writes [`OutboundFrame`]s and consumes [`ChannelEvent`]s.

use crate::error::TransportResult;
use crate::identity::DeviceIdentity;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityOfService {
    AtMostOnce,
    AtLeastOnce,
}

impl QualityOfService {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            _ => None,
        }
    }
}

/// Broker address for one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEndpoint {
    pub host: String,
    pub port: u16,
}

impl ChannelEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// A PUBLISH received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QualityOfService,
    pub packet_id: u16,
}

/// Frames the transport writes to the channel
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QualityOfService,
    },
    PubAck {
        packet_id: u16,
    },
    /// Write resolves once the matching SUBACK arrives
    Subscribe {
        filter: String,
        qos: QualityOfService,
    },
    /// Write resolves once the matching UNSUBACK arrives
    Unsubscribe {
        filter: String,
    },
    Disconnect,
}

/// Events a channel delivers to its owner, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Session established (CONNACK accepted)
    Connected,
    Message(InboundPublish),
    /// Unrecoverable channel failure
    Error(crate::error::TransportError),
}

/// A connected channel. Concurrent writes are serialized by the implementation.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn write_and_flush(&self, frame: OutboundFrame) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;

    /// Writable: connected and not yet disconnected
    fn is_active(&self) -> bool;

    /// Not yet closed
    fn is_open(&self) -> bool;
}

/// Creates channels; injected into each transport instance
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        endpoint: &ChannelEndpoint,
        events: mpsc::Sender<ChannelEvent>,
    ) -> TransportResult<Arc<dyn Channel>>;
}
