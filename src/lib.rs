//! IoT Hub device transport core
//!
//! The protocol layer underneath a device client: it turns application
//! calls (send telemetry, receive and complete messages, get and patch the
//! twin, answer direct methods) into broker traffic, and broker traffic
//! back into application callbacks.
//!
//! # Overview
//!
//! - [`transport::mqtt`]: a per-device MQTT transport driven by a strict
//!   lifecycle state machine, with ordered acknowledgments, subscription
//!   management and request/response twin correlation
//! - [`transport::amqp`]: a pool of shared AMQP connections multiplexing
//!   many device identities with reference counting and idle teardown
//! - [`config`]: TOML configuration with environment variable resolution
//! - [`observability`]: structured logging on top of `tracing`
//!
//! # Quick Start
//!
//! ```rust
//! use iothub_transport::identity::{AuthenticationModel, Credentials, DeviceIdentity};
//! use iothub_transport::transport::{MqttTransportSettings, TransportSettings};
//!
//! let identity = DeviceIdentity::new(
//!     "my-hub.azure-devices.net",
//!     "thermostat-1",
//!     AuthenticationModel::SasIndividual,
//!     Credentials::SasToken("SharedAccessSignature sr=...".to_string()),
//! )
//! .with_module("sensor")
//! .with_settings(TransportSettings::MqttWebSocket(MqttTransportSettings::default()));
//!
//! assert_eq!(identity.client_id(), "thermostat-1/sensor");
//! assert!(identity.settings().is_web_socket());
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod identity;
pub mod message;
pub mod observability;
pub mod retry;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, TransportConfig};
pub use error::{TransportError, TransportResult};
pub use identity::{AuthenticationModel, Credentials, DeviceIdentity, IdentityKey};
pub use message::{MethodRequest, MethodResponse, Message, Twin, TwinCollection, TwinProperties};
pub use retry::{Backoff, RetryPolicy};
pub use transport::amqp::{ConnectionPool, PoolRegistry};
pub use transport::mqtt::{MqttTransport, RumqttChannelFactory};
pub use transport::{ConnectionStatus, ConnectionStatusChangeReason, InboundHandler, Transport};
