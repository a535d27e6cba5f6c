//! Application-facing message, method and twin values

use crate::error::TransportResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A telemetry message sent to, or received from, the hub
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub payload: Bytes,
    /// Application properties, carried in the topic as a form-encoded suffix
    pub properties: BTreeMap<String, String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Set on delivery when the message must be completed
    pub lock_token: Option<String>,
    /// Module input the message arrived on
    pub input_name: Option<String>,
    /// Topic the message arrived on
    pub topic: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A direct-method invocation from the service
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    pub name: String,
    pub request_id: String,
    pub payload: Bytes,
}

/// Well-known method response status codes; any other `u16` is also valid
pub struct MethodResponseStatus;

impl MethodResponseStatus {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const USER_CODE_EXCEPTION: u16 = 500;
    pub const METHOD_NOT_IMPLEMENTED: u16 = 501;
}

/// Device reply to a [`MethodRequest`]
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub request_id: String,
    pub status: u16,
    pub payload: Bytes,
}

impl MethodResponse {
    pub fn new(request_id: impl Into<String>, status: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            payload: payload.into(),
        }
    }
}

/// A JSON object of twin properties
pub type TwinCollection = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinProperties {
    #[serde(default)]
    pub desired: TwinCollection,
    #[serde(default)]
    pub reported: TwinCollection,
}

/// Device twin as returned by a GET round trip
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Twin {
    pub properties: TwinProperties,
}

impl Twin {
    pub fn from_json(body: &[u8]) -> TransportResult<Self> {
        let properties: TwinProperties = serde_json::from_slice(body)?;
        Ok(Self { properties })
    }
}
