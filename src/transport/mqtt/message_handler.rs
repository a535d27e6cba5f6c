//! Pure inbound routing decisions for received PUBLISH frames
//!
//! Classification is by topic prefix in fixed priority order: twin response,
//! twin patch, method call, module input event, then default telemetry.

use super::topics::{
    parse_message_properties, parse_method_post, parse_module_input_name, TWIN_PATCH_PREFIX,
    TWIN_RESPONSE_PREFIX, METHOD_POST_PREFIX,
};
use crate::message::{Message, MethodRequest, TwinCollection};
use crate::transport::channel::InboundPublish;
use tracing::debug;

/// Where an inbound frame goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRoute {
    /// Response to a twin GET or PATCH
    TwinResponse,
    /// Desired-property patch pushed by the service
    TwinPatch,
    /// Direct method invocation
    MethodCall { name: String, request_id: String },
    /// Method topic without a parsable name or request id
    MalformedMethod,
    /// Event on a module input
    ModuleEvent { input_name: Option<String> },
    /// Cloud-to-device message for the blocking receive queue
    Telemetry,
}

/// Pure message routing decisions
pub struct MessageHandler;

impl MessageHandler {
    /// Route a topic. `module_event_prefix` is set only for module identities.
    pub fn classify(topic: &str, module_event_prefix: Option<&str>) -> InboundRoute {
        if starts_with_ignore_case(topic, TWIN_RESPONSE_PREFIX) {
            InboundRoute::TwinResponse
        } else if starts_with_ignore_case(topic, TWIN_PATCH_PREFIX) {
            InboundRoute::TwinPatch
        } else if starts_with_ignore_case(topic, METHOD_POST_PREFIX) {
            match parse_method_post(topic) {
                Some((name, request_id)) => InboundRoute::MethodCall { name, request_id },
                None => InboundRoute::MalformedMethod,
            }
        } else if module_event_prefix.is_some_and(|prefix| starts_with_ignore_case(topic, prefix)) {
            InboundRoute::ModuleEvent {
                input_name: parse_module_input_name(topic),
            }
        } else {
            debug!(topic = %topic, "Routing to telemetry queue");
            InboundRoute::Telemetry
        }
    }

    /// Build the application message for a received frame (no lock token yet)
    pub fn to_message(publish: &InboundPublish, input_name: Option<String>) -> Message {
        let parsed = parse_message_properties(&publish.topic);
        Message {
            payload: publish.payload.clone(),
            properties: parsed.properties,
            message_id: parsed.message_id,
            correlation_id: parsed.correlation_id,
            lock_token: None,
            input_name,
            topic: Some(publish.topic.clone()),
        }
    }

    pub fn to_method_request(publish: &InboundPublish, name: String, request_id: String) -> MethodRequest {
        MethodRequest {
            name,
            request_id,
            payload: publish.payload.clone(),
        }
    }

    /// Deserialize a desired-property patch body
    pub fn parse_desired_patch(payload: &[u8]) -> Result<TwinCollection, String> {
        serde_json::from_slice::<TwinCollection>(payload)
            .map_err(|e| format!("Failed to parse desired properties: {e}"))
    }
}

fn starts_with_ignore_case(topic: &str, prefix: &str) -> bool {
    topic
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
