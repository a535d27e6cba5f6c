//! Configuration system for the device transport
//!
//! Loads a TOML file describing the device identity and the chosen transport
//! variant, validates it, and produces [`DeviceIdentity`] and
//! [`TransportSettings`] values. Secrets are never stored in the file: the SAS
//! token is read from the environment variable named in `[device]`.

use crate::identity::{AuthenticationModel, Credentials, DeviceIdentity};
use crate::retry::RetryPolicy;
use crate::transport::channel::QualityOfService;
use crate::transport::settings::{
    AmqpConnectionPoolSettings, AmqpTransportSettings, MqttTransportSettings, TransportSettings,
    DEFAULT_POOL_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main transport configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub amqp: AmqpSection,
    #[serde(default)]
    pub retry: RetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub host_name: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub auth: AuthenticationModel,
    /// Required for `sas_hub_policy`
    pub shared_access_key_name: Option<String>,
    /// Environment variable holding a pre-built SAS token
    pub sas_token_env: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    MqttTcp,
    MqttWebSocket,
    AmqpTcp,
    AmqpWebSocket,
    AmqpPooled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TransportSection {
    #[serde(default)]
    pub kind: TransportKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default = "default_qos")]
    pub publish_qos: u8,
    #[serde(default = "default_qos")]
    pub receive_qos: u8,
    #[serde(default = "default_max_pending")]
    pub max_pending_inbound_messages: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_receive_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub twin_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub subscribe_timeout_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive(),
            clean_session: false,
            publish_qos: default_qos(),
            receive_qos: default_qos(),
            max_pending_inbound_messages: default_max_pending(),
            default_receive_timeout_secs: default_timeout_secs(),
            twin_timeout_secs: default_timeout_secs(),
            subscribe_timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AmqpSection {
    #[serde(default = "default_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_pool_size")]
    pub max_pool_size: u32,
    #[serde(default = "default_idle_timeout")]
    pub connection_idle_timeout_secs: u64,
}

impl Default for AmqpSection {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_timeout_secs(),
            max_pool_size: default_pool_size(),
            connection_idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub initial_delay_ms: u64,
    /// 0 selects a fixed backoff
    #[serde(default = "default_retry_delay_ms")]
    pub increment_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_retry_delay_ms(),
            increment_ms: default_retry_delay_ms(),
        }
    }
}

fn default_keep_alive() -> u64 {
    300 // 5 minutes
}

fn default_qos() -> u8 {
    1
}

fn default_max_pending() -> usize {
    50
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_idle_timeout() -> u64 {
    120 // 2 minutes
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

/// Configuration loading and validation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(String),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid pool size {0}: must be between 1 and 65535")]
    InvalidPoolSize(u32),
    #[error("Connection idle timeout {0:?} is below the 5 second minimum")]
    IdleTimeoutTooShort(Duration),
    #[error("Identity '{device_id}' uses a hub policy but has no shared access key name")]
    MissingScope { device_id: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::FileRead(e.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::TomlParse(e.to_string())
    }
}

impl TransportConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TransportConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name("host_name", &self.device.host_name)?;
        validate_name("device_id", &self.device.device_id)?;
        if let Some(module_id) = &self.device.module_id {
            validate_name("module_id", module_id)?;
        }

        if self.device.auth == AuthenticationModel::SasHubPolicy
            && self.device.shared_access_key_name.is_none()
        {
            return Err(ConfigError::MissingScope {
                device_id: self.device.device_id.clone(),
            });
        }

        if self.device.auth == AuthenticationModel::X509Certificate
            && self.transport.kind == TransportKind::AmqpPooled
        {
            return Err(ConfigError::InvalidConfig(
                "X.509 identities cannot use a pooled AMQP connection".to_string(),
            ));
        }

        for (field, level) in [
            ("publish_qos", self.mqtt.publish_qos),
            ("receive_qos", self.mqtt.receive_qos),
        ] {
            if QualityOfService::from_level(level).is_none() {
                return Err(ConfigError::InvalidConfig(format!(
                    "mqtt.{field} must be 0 or 1, got {level}"
                )));
            }
        }

        self.pool_settings()?;
        Ok(())
    }

    fn pool_settings(&self) -> Result<AmqpConnectionPoolSettings, ConfigError> {
        AmqpConnectionPoolSettings::new(
            self.amqp.max_pool_size,
            Duration::from_secs(self.amqp.connection_idle_timeout_secs),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let initial = Duration::from_millis(self.retry.initial_delay_ms);
        if self.retry.increment_ms == 0 {
            RetryPolicy::fixed(self.retry.max_retries, initial)
        } else {
            RetryPolicy::linear(
                self.retry.max_retries,
                initial,
                Duration::from_millis(self.retry.increment_ms),
            )
        }
    }

    fn mqtt_settings(&self) -> MqttTransportSettings {
        MqttTransportSettings {
            clean_session: self.mqtt.clean_session,
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            publish_qos: QualityOfService::from_level(self.mqtt.publish_qos)
                .unwrap_or(QualityOfService::AtLeastOnce),
            receive_qos: QualityOfService::from_level(self.mqtt.receive_qos)
                .unwrap_or(QualityOfService::AtLeastOnce),
            max_pending_inbound_messages: self.mqtt.max_pending_inbound_messages,
            default_receive_timeout: Duration::from_secs(self.mqtt.default_receive_timeout_secs),
            twin_timeout: Duration::from_secs(self.mqtt.twin_timeout_secs),
            subscribe_timeout: Duration::from_secs(self.mqtt.subscribe_timeout_secs),
            will_message: None,
            close_retry: self.retry_policy(),
        }
    }

    /// Build the transport variant selected by `[transport] kind`
    pub fn transport_settings(&self) -> Result<TransportSettings, ConfigError> {
        let amqp = || -> Result<AmqpTransportSettings, ConfigError> {
            Ok(AmqpTransportSettings {
                operation_timeout: Duration::from_secs(self.amqp.operation_timeout_secs),
                pool: self.pool_settings()?,
            })
        };

        Ok(match self.transport.kind {
            TransportKind::MqttTcp => TransportSettings::MqttTcp(self.mqtt_settings()),
            TransportKind::MqttWebSocket => TransportSettings::MqttWebSocket(self.mqtt_settings()),
            TransportKind::AmqpTcp => TransportSettings::AmqpTcp(amqp()?),
            TransportKind::AmqpWebSocket => TransportSettings::AmqpWebSocket(amqp()?),
            TransportKind::AmqpPooled => TransportSettings::AmqpPooled(amqp()?),
        })
    }

    /// Get the SAS token from its environment variable
    pub fn get_sas_token(&self) -> Result<String, ConfigError> {
        let name = self.device.sas_token_env.as_ref().ok_or_else(|| {
            ConfigError::InvalidConfig("device.sas_token_env is not set".to_string())
        })?;
        std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))
    }

    /// Build the identity for a SAS-token device, resolving the token from the environment
    pub fn device_identity(&self) -> Result<DeviceIdentity, ConfigError> {
        if self.device.auth == AuthenticationModel::X509Certificate {
            return Err(ConfigError::InvalidConfig(
                "X.509 credentials must be supplied with device_identity_with".to_string(),
            ));
        }
        let token = self.get_sas_token()?;
        self.device_identity_with(Credentials::SasToken(token))
    }

    /// Build the identity with credentials supplied by the caller
    pub fn device_identity_with(
        &self,
        credentials: Credentials,
    ) -> Result<DeviceIdentity, ConfigError> {
        let mut identity = DeviceIdentity::new(
            self.device.host_name.clone(),
            self.device.device_id.clone(),
            self.device.auth,
            credentials,
        )
        .with_settings(self.transport_settings()?);

        if let Some(module_id) = &self.device.module_id {
            identity = identity.with_module(module_id.clone());
        }
        if let Some(key_name) = &self.device.shared_access_key_name {
            identity = identity.with_shared_access_key_name(key_name.clone());
        }
        Ok(identity)
    }
}

/// Identifiers end up in topics; reject empty values and MQTT wildcards
fn validate_name(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || value.contains(&['#', '+', '/'][..]) {
        return Err(ConfigError::InvalidConfig(format!(
            "device.{field} '{value}' must be non-empty and free of '/', '#' and '+'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[device]
host_name = "hub.azure-devices.net"
device_id = "dev-1"
auth = "sas_individual"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = TransportConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.transport.kind, TransportKind::MqttTcp);
        assert_eq!(config.mqtt.keep_alive_secs, 300);
        assert_eq!(config.amqp.max_pool_size, 100);
        assert_eq!(config.retry.max_retries, 5);

        let settings = config.transport_settings().unwrap();
        assert_eq!(
            settings,
            TransportSettings::MqttTcp(MqttTransportSettings::default())
        );
    }

    #[test]
    fn test_hub_policy_requires_key_name() {
        let toml_content = r#"
[device]
host_name = "hub.azure-devices.net"
device_id = "dev-1"
auth = "sas_hub_policy"
"#;

        let result = TransportConfig::from_toml_str(toml_content);
        assert_eq!(
            result,
            Err(ConfigError::MissingScope {
                device_id: "dev-1".to_string()
            })
        );
    }

    #[test]
    fn test_pool_size_validated_at_load() {
        let toml_content = format!("{MINIMAL}\n[amqp]\nmax_pool_size = 0\n");

        let result = TransportConfig::from_toml_str(&toml_content);
        assert_eq!(result, Err(ConfigError::InvalidPoolSize(0)));
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let toml_content = format!("{MINIMAL}\n[mqtt]\npublish_qos = 2\n");

        let result = TransportConfig::from_toml_str(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_wildcards_in_ids_rejected() {
        assert!(validate_name("device_id", "dev#1").is_err());
        assert!(validate_name("device_id", "dev/1").is_err());
        assert!(validate_name("device_id", "").is_err());
        assert!(validate_name("device_id", "dev-1.a_b").is_ok());
    }

    #[test]
    fn test_fixed_retry_when_increment_zero() {
        let toml_content = format!(
            "{MINIMAL}\n[retry]\nmax_retries = 3\ninitial_delay_ms = 200\nincrement_ms = 0\n"
        );

        let config = TransportConfig::from_toml_str(&toml_content).unwrap();
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::fixed(3, Duration::from_millis(200))
        );
    }

    #[test]
    fn test_x509_cannot_be_pooled() {
        let toml_content = r#"
[device]
host_name = "hub.azure-devices.net"
device_id = "dev-1"
auth = "x509_certificate"

[transport]
kind = "amqp_pooled"
"#;

        let result = TransportConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }
}
