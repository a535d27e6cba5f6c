//! MQTT transport for device-to-cloud communication
//!
//! The transport separates pure decisions from I/O, the same way throughout:
//!
//! - [`state`] - Lock-free lifecycle state and guarded transitions
//! - [`ack_tracker`] - Lock tokens and ordered completion of QoS 1 deliveries
//! - [`subscription`] - Default and named subscription lifecycle
//! - [`twin`] - Twin request/response correlation
//! - [`topics`] and [`message_handler`] - Topic construction, parsing and inbound routing
//! - [`connection`] - Pure broker option configuration
//! - [`rumqtt_channel`] - rumqttc-backed channel (network I/O)
//! - [`transport`] - The [`MqttTransport`] tying it all together
//!
//! # Usage
//!
//! ```rust,no_run
//! use iothub_transport::identity::{AuthenticationModel, Credentials, DeviceIdentity};
//! use iothub_transport::transport::mqtt::{MqttTransport, RumqttChannelFactory};
//! use iothub_transport::transport::{NoopHandler, Transport};
//! use iothub_transport::Message;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let identity = DeviceIdentity::new(
//!     "my-hub.azure-devices.net",
//!     "sensor-1",
//!     AuthenticationModel::SasIndividual,
//!     Credentials::SasToken("SharedAccessSignature sr=...".to_string()),
//! );
//! let transport = MqttTransport::new(
//!     identity,
//!     Arc::new(RumqttChannelFactory::new()),
//!     Arc::new(NoopHandler),
//! )?;
//!
//! let cancel = CancellationToken::new();
//! transport.open(&cancel).await?;
//! transport.send_event(Message::new("{\"temp\":21}"), &cancel).await?;
//! transport.close(&cancel).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod ack_tracker;
pub mod completion;
pub mod connection;
pub mod message_handler;
pub mod rumqtt_channel;
pub mod state;
pub mod subscription;
pub mod topics;
pub mod transport;
pub mod twin;

pub use ack_tracker::AckTracker;
pub use completion::Completion;
pub use message_handler::{InboundRoute, MessageHandler};
pub use rumqtt_channel::{RumqttChannel, RumqttChannelFactory};
pub use state::{AtomicTransportState, TransportState};
pub use subscription::{SubscriptionKind, SubscriptionStateMachine};
pub use topics::TopicBuilder;
pub use transport::MqttTransport;
pub use twin::TwinRequestCorrelator;
