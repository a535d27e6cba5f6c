//! Immutable device identity handed to transports and pools

use crate::auth::TokenSigner;
use crate::transport::settings::TransportSettings;
use std::fmt;
use std::sync::Arc;

/// How the device proves who it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationModel {
    /// Per-device shared access key
    SasIndividual,
    /// Hub-level shared access policy, scoped by key name
    SasHubPolicy,
    X509Certificate,
}

/// Secret material; never printed
#[derive(Clone)]
pub enum Credentials {
    /// Pre-built shared access signature
    SasToken(String),
    /// Token assembled per connection with an external signer
    Signer {
        signer: Arc<dyn TokenSigner>,
        generation_id: String,
    },
    X509 {
        cert_pem: Vec<u8>,
        key_pem: Vec<u8>,
        ca_pem: Option<Vec<u8>>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SasToken(_) => f.write_str("SasToken(***)"),
            Self::Signer { generation_id, .. } => f
                .debug_struct("Signer")
                .field("generation_id", generation_id)
                .finish_non_exhaustive(),
            Self::X509 { .. } => f.write_str("X509(***)"),
        }
    }
}

/// Hash key for identity-keyed tables
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub host_name: String,
    pub device_id: String,
    pub module_id: Option<String>,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module_id {
            Some(module) => write!(f, "{}/{}/{}", self.host_name, self.device_id, module),
            None => write!(f, "{}/{}", self.host_name, self.device_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    host_name: String,
    device_id: String,
    module_id: Option<String>,
    auth_model: AuthenticationModel,
    shared_access_key_name: Option<String>,
    credentials: Credentials,
    settings: TransportSettings,
}

impl DeviceIdentity {
    pub fn new(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        auth_model: AuthenticationModel,
        credentials: Credentials,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            module_id: None,
            auth_model,
            shared_access_key_name: None,
            credentials,
            settings: TransportSettings::default(),
        }
    }

    pub fn with_module(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_shared_access_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.shared_access_key_name = Some(key_name.into());
        self
    }

    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    pub fn auth_model(&self) -> AuthenticationModel {
        self.auth_model
    }

    pub fn shared_access_key_name(&self) -> Option<&str> {
        self.shared_access_key_name.as_deref()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// MQTT client id: `deviceId` or `deviceId/moduleId`
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module) => format!("{}/{}", self.device_id, module),
            None => self.device_id.clone(),
        }
    }

    /// Resource URI the shared access signature is scoped to
    pub fn audience(&self) -> String {
        match &self.module_id {
            Some(module) => format!("{}/devices/{}/modules/{}", self.host_name, self.device_id, module),
            None => format!("{}/devices/{}", self.host_name, self.device_id),
        }
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            host_name: self.host_name.clone(),
            device_id: self.device_id.clone(),
            module_id: self.module_id.clone(),
        }
    }
}
