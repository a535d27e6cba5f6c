//! Physical AMQP connection seams
//!
//! The wire protocol lives behind these traits; the pool and holders only
//! manage which identities share which connection.

use crate::error::TransportResult;
use crate::identity::DeviceIdentity;
use crate::transport::channel::ChannelEndpoint;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// One open AMQP connection carrying sessions for any number of identities
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Open the session (and its links) for `identity`
    async fn open_session(&self, identity: &DeviceIdentity, timeout: Duration) -> TransportResult<()>;

    async fn close_session(&self, identity: &DeviceIdentity) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;

    /// True once the connection has started shutting down
    fn is_closing(&self) -> bool;
}

/// Opens physical connections; injected into every pool and holder
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn open_connection(
        &self,
        identity: &DeviceIdentity,
        endpoint: &ChannelEndpoint,
        timeout: Duration,
    ) -> TransportResult<Arc<dyn AmqpConnection>>;
}

/// Broker address for an identity's AMQP variant
pub fn amqp_endpoint(identity: &DeviceIdentity) -> ChannelEndpoint {
    ChannelEndpoint::new(identity.host_name(), identity.settings().default_port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{AuthenticationModel, Credentials};
    use crate::transport::settings::{AmqpTransportSettings, TransportSettings};

    #[test]
    fn test_endpoint_port_follows_variant() {
        let identity = DeviceIdentity::new(
            "hub.net",
            "dev",
            AuthenticationModel::SasIndividual,
            Credentials::SasToken("t".to_string()),
        );

        let pooled = identity
            .clone()
            .with_settings(TransportSettings::AmqpPooled(AmqpTransportSettings::default()));
        let web_socket = identity
            .with_settings(TransportSettings::AmqpWebSocket(AmqpTransportSettings::default()));

        assert_eq!(amqp_endpoint(&pooled), ChannelEndpoint::new("hub.net", 5671));
        assert_eq!(amqp_endpoint(&web_socket).port, 443);
    }
}
