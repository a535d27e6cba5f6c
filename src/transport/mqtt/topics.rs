//! Topic construction and parsing for the hub's MQTT surface
//!
//! Names must match the service exactly; all builders are pure functions.

use crate::identity::DeviceIdentity;
use crate::message::Message;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use url::form_urlencoded;

pub const METHOD_POST_FILTER: &str = "$iothub/methods/POST/#";
pub const METHOD_POST_PREFIX: &str = "$iothub/methods/POST/";
pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
pub const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
pub const TWIN_PATCH_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
pub const TWIN_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

const REQUEST_ID_KEY: &str = "$rid";
const MESSAGE_ID_KEY: &str = "$.mid";
const CORRELATION_ID_KEY: &str = "$.cid";

static TWIN_RESPONSE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\$iothub/twin/res/(\d+)/(\?.+)$").expect("twin response pattern is valid")
});

/// Topic construction functions
pub struct TopicBuilder;

impl TopicBuilder {
    /// `devices/{deviceId}/messages/events/` or the module variant
    pub fn telemetry_topic(identity: &DeviceIdentity) -> String {
        match identity.module_id() {
            Some(module) => format!(
                "devices/{}/modules/{}/messages/events/",
                identity.device_id(),
                module
            ),
            None => format!("devices/{}/messages/events/", identity.device_id()),
        }
    }

    /// Telemetry topic with system and application properties appended
    pub fn telemetry_topic_for(identity: &DeviceIdentity, message: &Message) -> String {
        let mut topic = Self::telemetry_topic(identity);
        let mut query = form_urlencoded::Serializer::new(String::new());
        let mut has_pairs = false;

        if let Some(id) = &message.message_id {
            query.append_pair(MESSAGE_ID_KEY, id);
            has_pairs = true;
        }
        if let Some(id) = &message.correlation_id {
            query.append_pair(CORRELATION_ID_KEY, id);
            has_pairs = true;
        }
        for (key, value) in &message.properties {
            query.append_pair(key, value);
            has_pairs = true;
        }

        if has_pairs {
            topic.push_str(&query.finish());
        }
        topic
    }

    /// `devices/{deviceId}/messages/devicebound/#`
    pub fn devicebound_filter(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/#")
    }

    /// `$iothub/methods/res/{status}/?$rid={id}`
    pub fn method_response_topic(status: u16, request_id: &str) -> String {
        format!("$iothub/methods/res/{status}/?$rid={request_id}")
    }

    /// `$iothub/twin/GET/?$rid={id}`
    pub fn twin_get_topic(request_id: &str) -> String {
        format!("$iothub/twin/GET/?$rid={request_id}")
    }

    /// `$iothub/twin/PATCH/properties/reported/?$rid={id}`
    pub fn twin_patch_topic(request_id: &str) -> String {
        format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
    }

    /// `devices/{deviceId}/modules/{moduleId}/#`
    pub fn module_event_filter(device_id: &str, module_id: &str) -> String {
        format!("devices/{device_id}/modules/{module_id}/#")
    }

    /// Prefix shared by every inbound module input event
    pub fn module_event_prefix(device_id: &str, module_id: &str) -> String {
        format!("devices/{device_id}/modules/{module_id}/")
    }
}

/// Parsed `$iothub/twin/res/{status}/?$rid={id}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinResponseTopic {
    pub status: u16,
    pub request_id: String,
}

fn request_id_from_query(query: &str) -> Option<String> {
    form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        .find(|(key, _)| key == REQUEST_ID_KEY)
        .map(|(_, value)| value.into_owned())
}

pub fn parse_twin_response(topic: &str) -> Option<TwinResponseTopic> {
    let captures = TWIN_RESPONSE_PATTERN.captures(topic)?;
    let status = captures.get(1)?.as_str().parse().ok()?;
    let request_id = request_id_from_query(captures.get(2)?.as_str())?;
    Some(TwinResponseTopic { status, request_id })
}

/// `$iothub/methods/POST/{name}/?$rid={id}` to `(name, id)`
pub fn parse_method_post(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix(METHOD_POST_PREFIX)?;
    let (name, query) = rest.split_once('/')?;
    if name.is_empty() {
        return None;
    }
    let request_id = request_id_from_query(query)?;
    Some((name.to_string(), request_id))
}

/// Input name from `devices/{d}/modules/{m}/inputs/{input}/...`
pub fn parse_module_input_name(topic: &str) -> Option<String> {
    topic
        .split('/')
        .nth(5)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Properties encoded in the last topic segment of a device-bound message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub properties: BTreeMap<String, String>,
}

pub fn parse_message_properties(topic: &str) -> TopicProperties {
    let mut parsed = TopicProperties::default();
    let last = topic.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    if !last.contains('=') {
        return parsed;
    }

    for (key, value) in form_urlencoded::parse(last.as_bytes()) {
        match key.as_ref() {
            MESSAGE_ID_KEY => parsed.message_id = Some(value.into_owned()),
            CORRELATION_ID_KEY => parsed.correlation_id = Some(value.into_owned()),
            // Remaining system properties are not surfaced
            k if k.starts_with("$.") => {}
            _ => {
                parsed.properties.insert(key.into_owned(), value.into_owned());
            }
        }
    }
    parsed
}
