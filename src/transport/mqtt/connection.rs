//! Pure connection configuration for the rumqttc-backed channel
//!
//! Builds broker options (endpoint, TLS or WebSocket transport, credentials,
//! keep-alive, last will) from a device identity without touching the network.

use crate::error::{TransportError, TransportResult};
use crate::identity::{Credentials, DeviceIdentity};
use crate::transport::channel::{ChannelEndpoint, QualityOfService};
use rumqttc::{LastWill, MqttOptions, QoS, TlsConfiguration, Transport as RumqttcTransport};
use url::Url;

/// Service API version presented in the MQTT username
pub const API_VERSION: &str = "2020-09-30";

/// Path of the MQTT-over-WebSocket endpoint
pub const WEB_SOCKET_PATH: &str = "/$iothub/websocket";

/// 256KB matches the service's maximum message size
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// `{host}/{clientId}/?api-version=...`
pub fn username(identity: &DeviceIdentity) -> String {
    format!(
        "{}/{}/?api-version={}",
        identity.host_name(),
        identity.client_id(),
        API_VERSION
    )
}

pub fn to_rumqttc_qos(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
    }
}

/// QoS 2 is never negotiated; treat it like QoS 1 if a broker sends it
pub fn from_rumqttc_qos(qos: QoS) -> QualityOfService {
    match qos {
        QoS::AtMostOnce => QualityOfService::AtMostOnce,
        QoS::AtLeastOnce | QoS::ExactlyOnce => QualityOfService::AtLeastOnce,
    }
}

/// WebSocket URL for `endpoint`, validated
pub fn web_socket_url(endpoint: &ChannelEndpoint) -> TransportResult<String> {
    let raw = format!("wss://{}:{}{}", endpoint.host, endpoint.port, WEB_SOCKET_PATH);
    let url = Url::parse(&raw)
        .map_err(|e| TransportError::fatal(format!("invalid WebSocket endpoint {raw}: {e}")))?;
    Ok(url.to_string())
}

fn tls_transport(identity: &DeviceIdentity, web_socket: bool) -> TransportResult<RumqttcTransport> {
    match identity.credentials() {
        Credentials::X509 {
            cert_pem,
            key_pem,
            ca_pem,
        } => {
            let ca = ca_pem.clone().ok_or_else(|| {
                TransportError::fatal("X.509 authentication requires a CA bundle")
            })?;
            let config = TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((cert_pem.clone(), key_pem.clone())),
            };
            Ok(if web_socket {
                RumqttcTransport::Wss(config)
            } else {
                RumqttcTransport::Tls(config)
            })
        }
        _ if web_socket => Ok(RumqttcTransport::wss_with_default_config()),
        _ => Ok(RumqttcTransport::tls_with_default_config()),
    }
}

/// Configure broker options for one connection attempt
pub fn configure_mqtt_options(
    identity: &DeviceIdentity,
    endpoint: &ChannelEndpoint,
    password: Option<String>,
) -> TransportResult<MqttOptions> {
    let settings = identity
        .settings()
        .mqtt()
        .ok_or_else(|| TransportError::fatal("identity is not configured for an MQTT transport"))?;
    let web_socket = identity.settings().is_web_socket();

    let broker = if web_socket {
        web_socket_url(endpoint)?
    } else {
        endpoint.host.clone()
    };
    let mut options = MqttOptions::new(identity.client_id(), broker, endpoint.port);
    options.set_transport(tls_transport(identity, web_socket)?);

    options.set_credentials(username(identity), password.unwrap_or_default());
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(settings.clean_session);
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    // Acknowledgments are driven by the transport's completion order
    options.set_manual_acks(true);

    if let Some(will) = &settings.will_message {
        options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.to_vec(),
            to_rumqttc_qos(will.qos),
            false,
        ));
    }

    Ok(options)
}
