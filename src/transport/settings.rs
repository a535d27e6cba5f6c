//! Closed set of transport configurations

use crate::config::ConfigError;
use crate::retry::RetryPolicy;
use crate::transport::channel::QualityOfService;
use bytes::Bytes;
use std::time::Duration;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(300);
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TWIN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_PENDING_INBOUND_MESSAGES: usize = 50;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_POOL_SIZE: u32 = 100;
pub const MAX_POOL_SIZE: u32 = 65535;
pub const DEFAULT_CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const MIN_CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Message the broker publishes on the device's behalf after an ungraceful disconnect
#[derive(Debug, Clone, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QualityOfService,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttTransportSettings {
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub publish_qos: QualityOfService,
    pub receive_qos: QualityOfService,
    pub max_pending_inbound_messages: usize,
    pub default_receive_timeout: Duration,
    pub twin_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub will_message: Option<WillMessage>,
    /// Guards teardown I/O (DISCONNECT write and channel close)
    pub close_retry: RetryPolicy,
}

impl Default for MqttTransportSettings {
    fn default() -> Self {
        Self {
            clean_session: false,
            keep_alive: DEFAULT_KEEP_ALIVE,
            publish_qos: QualityOfService::AtLeastOnce,
            receive_qos: QualityOfService::AtLeastOnce,
            max_pending_inbound_messages: DEFAULT_MAX_PENDING_INBOUND_MESSAGES,
            default_receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            twin_timeout: DEFAULT_TWIN_TIMEOUT,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            will_message: None,
            close_retry: RetryPolicy::close_default(),
        }
    }
}

/// Pool sizing and idle teardown, validated on construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmqpConnectionPoolSettings {
    max_pool_size: u32,
    connection_idle_timeout: Duration,
}

impl Default for AmqpConnectionPoolSettings {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_POOL_SIZE,
            connection_idle_timeout: DEFAULT_CONNECTION_IDLE_TIMEOUT,
        }
    }
}

impl AmqpConnectionPoolSettings {
    pub fn new(max_pool_size: u32, connection_idle_timeout: Duration) -> Result<Self, ConfigError> {
        if max_pool_size == 0 || max_pool_size > MAX_POOL_SIZE {
            return Err(ConfigError::InvalidPoolSize(max_pool_size));
        }
        if connection_idle_timeout < MIN_CONNECTION_IDLE_TIMEOUT {
            return Err(ConfigError::IdleTimeoutTooShort(connection_idle_timeout));
        }
        Ok(Self {
            max_pool_size,
            connection_idle_timeout,
        })
    }

    pub fn with_max_pool_size(max_pool_size: u32) -> Result<Self, ConfigError> {
        Self::new(max_pool_size, DEFAULT_CONNECTION_IDLE_TIMEOUT)
    }

    pub fn max_pool_size(&self) -> u32 {
        self.max_pool_size
    }

    pub fn connection_idle_timeout(&self) -> Duration {
        self.connection_idle_timeout
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmqpTransportSettings {
    pub operation_timeout: Duration,
    pub pool: AmqpConnectionPoolSettings,
}

impl Default for AmqpTransportSettings {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            pool: AmqpConnectionPoolSettings::default(),
        }
    }
}

/// Transport configuration variants consumed by the one transport contract
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSettings {
    MqttTcp(MqttTransportSettings),
    MqttWebSocket(MqttTransportSettings),
    AmqpTcp(AmqpTransportSettings),
    AmqpWebSocket(AmqpTransportSettings),
    AmqpPooled(AmqpTransportSettings),
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::MqttTcp(MqttTransportSettings::default())
    }
}

impl TransportSettings {
    pub fn mqtt(&self) -> Option<&MqttTransportSettings> {
        match self {
            Self::MqttTcp(s) | Self::MqttWebSocket(s) => Some(s),
            _ => None,
        }
    }

    pub fn amqp(&self) -> Option<&AmqpTransportSettings> {
        match self {
            Self::AmqpTcp(s) | Self::AmqpWebSocket(s) | Self::AmqpPooled(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_pooling_enabled(&self) -> bool {
        matches!(self, Self::AmqpPooled(_))
    }

    pub fn is_web_socket(&self) -> bool {
        matches!(self, Self::MqttWebSocket(_) | Self::AmqpWebSocket(_))
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::MqttTcp(_) => 8883,
            Self::AmqpTcp(_) | Self::AmqpPooled(_) => 5671,
            Self::MqttWebSocket(_) | Self::AmqpWebSocket(_) => 443,
        }
    }
}
