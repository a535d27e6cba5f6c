//! AMQP connection pool tests
//!
//! Pool sizing, holder assignment, identity scoping and connection
//! lifetime observed through the mock connector.


use iothub_transport::identity::{AuthenticationModel, Credentials, DeviceIdentity};
use iothub_transport::testing::{wait_until, MockAmqpConnector, RecordingHandler};
use iothub_transport::transport::amqp::{
    AmqpUnit, AssignmentPolicy, ConnectionPool, IdlePolicy, PoolBucket, PoolRegistry,
};
use iothub_transport::transport::{
    AmqpConnectionPoolSettings, AmqpTransportSettings, ConnectionStatus,
    ConnectionStatusChangeReason, TransportSettings,
};
use iothub_transport::{ConfigError, TransportError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{pooled_identity, HOST};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

fn settings(max_pool_size: u32, idle: Duration) -> AmqpTransportSettings {
    AmqpTransportSettings {
        pool: AmqpConnectionPoolSettings::new(max_pool_size, idle).unwrap(),
        ..AmqpTransportSettings::default()
    }
}

fn pool_with(
    connector: &Arc<MockAmqpConnector>,
    max_pool_size: u32,
    policy: AssignmentPolicy,
) -> ConnectionPool {
    ConnectionPool::new(
        connector.clone(),
        AmqpConnectionPoolSettings::new(max_pool_size, Duration::from_secs(5)).unwrap(),
    )
    .with_policy(policy)
}

fn device(device_id: &str) -> DeviceIdentity {
    pooled_identity(device_id, settings(10, Duration::from_secs(5)))
}

fn get(pool: &ConnectionPool, identity: DeviceIdentity) -> AmqpUnit {
    pool.get_connection(identity, Arc::new(RecordingHandler::new()))
        .unwrap()
}

#[test]
fn test_pool_size_bounds_rejected() {
    assert_eq!(
        AmqpConnectionPoolSettings::with_max_pool_size(0),
        Err(ConfigError::InvalidPoolSize(0))
    );
    assert_eq!(
        AmqpConnectionPoolSettings::with_max_pool_size(65536),
        Err(ConfigError::InvalidPoolSize(65536))
    );
    assert!(matches!(
        AmqpConnectionPoolSettings::new(10, Duration::from_secs(1)),
        Err(ConfigError::IdleTimeoutTooShort(_))
    ));
}

#[tokio::test]
async fn test_first_n_identities_get_distinct_holders() {
    // Arrange
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 3, AssignmentPolicy::ConsistentHash);

    // Act
    let units: Vec<AmqpUnit> = (0..3)
        .map(|i| get(&pool, device(&format!("dev-{i}"))))
        .collect();
    let extra = get(&pool, device("dev-extra"));

    // Assert
    let distinct: HashSet<u64> = units.iter().map(AmqpUnit::holder_id).collect();
    assert_eq!(distinct.len(), 3);
    assert!(distinct.contains(&extra.holder_id()));
    assert_eq!(pool.holders(&PoolBucket::Individual).len(), 3);
    assert!(pool
        .holders(&PoolBucket::Individual)
        .iter()
        .all(|holder| holder.idle_policy() == IdlePolicy::IdleTimeout(Duration::from_secs(5))));
}

#[tokio::test]
async fn test_consistent_hash_assignment_is_stable() {
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 2, AssignmentPolicy::ConsistentHash);
    get(&pool, device("seed-a"));
    get(&pool, device("seed-b"));

    let first = get(&pool, device("sticky"));
    first.close().await.unwrap();
    let second = get(&pool, device("sticky"));

    assert_eq!(first.holder_id(), second.holder_id());
}

#[tokio::test]
async fn test_least_loaded_fills_lightest_holder() {
    // Arrange
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 2, AssignmentPolicy::LeastLoaded);
    let a = get(&pool, device("a"));
    let b = get(&pool, device("b"));
    let c = get(&pool, device("c"));

    // Act
    let d = get(&pool, device("d"));

    // Assert
    assert_ne!(a.holder_id(), b.holder_id());
    assert_ne!(c.holder_id(), d.holder_id());
    let loads: Vec<usize> = pool
        .holders(&PoolBucket::Individual)
        .iter()
        .map(|holder| holder.unit_count())
        .collect();
    assert_eq!(loads, vec![2, 2]);
}

#[tokio::test]
async fn test_units_share_one_physical_connection() {
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 1, AssignmentPolicy::ConsistentHash);
    let first = get(&pool, device("dev-1"));
    let second = get(&pool, device("dev-2"));

    first.open(OPEN_TIMEOUT).await.unwrap();
    second.open(OPEN_TIMEOUT).await.unwrap();

    assert_eq!(connector.open_count(), 1);
    assert_eq!(connector.connections()[0].sessions(), vec!["dev-1", "dev-2"]);
}

#[tokio::test]
async fn test_hub_policy_identity_requires_scope() {
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 2, AssignmentPolicy::ConsistentHash);
    let identity = DeviceIdentity::new(
        HOST,
        "dev-1",
        AuthenticationModel::SasHubPolicy,
        Credentials::SasToken("token".to_string()),
    )
    .with_settings(TransportSettings::AmqpPooled(AmqpTransportSettings::default()));

    let result = pool.get_connection(identity, Arc::new(RecordingHandler::new()));

    assert_eq!(
        result.unwrap_err(),
        TransportError::Configuration(ConfigError::MissingScope {
            device_id: "dev-1".to_string()
        })
    );
}

#[tokio::test]
async fn test_scoped_identities_use_separate_buckets() {
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 1, AssignmentPolicy::ConsistentHash);
    let scoped = DeviceIdentity::new(
        HOST,
        "dev-2",
        AuthenticationModel::SasHubPolicy,
        Credentials::SasToken("token".to_string()),
    )
    .with_shared_access_key_name("registryReadWrite")
    .with_settings(TransportSettings::AmqpPooled(AmqpTransportSettings::default()));

    let individual = get(&pool, device("dev-1"));
    let grouped = get(&pool, scoped);

    assert_ne!(individual.holder_id(), grouped.holder_id());
    assert_eq!(
        pool.holders(&PoolBucket::Scoped("registryReadWrite".to_string()))
            .len(),
        1
    );
}

#[tokio::test]
async fn test_x509_identity_gets_dedicated_connection() {
    // Arrange
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 1, AssignmentPolicy::ConsistentHash);
    let shared = get(&pool, device("dev-1"));
    let x509 = DeviceIdentity::new(
        HOST,
        "dev-x509",
        AuthenticationModel::X509Certificate,
        Credentials::X509 {
            cert_pem: b"cert".to_vec(),
            key_pem: b"key".to_vec(),
            ca_pem: None,
        },
    )
    .with_settings(TransportSettings::AmqpTcp(AmqpTransportSettings::default()));

    // Act
    let dedicated = get(&pool, x509);
    dedicated.open(OPEN_TIMEOUT).await.unwrap();
    dedicated.close().await.unwrap();

    // Assert
    assert_ne!(shared.holder_id(), dedicated.holder_id());
    assert_eq!(dedicated.holder().idle_policy(), IdlePolicy::Immediate);
    assert_eq!(pool.holders(&PoolBucket::Individual).len(), 1);
    assert_eq!(connector.connections()[0].close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_closed_after_timeout() {
    // Arrange
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 2, AssignmentPolicy::ConsistentHash);
    let unit = get(&pool, device("dev-1"));
    unit.open(OPEN_TIMEOUT).await.unwrap();

    // Act
    unit.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    let still_open = connector.connections()[0].close_count() == 0;

    // Assert
    assert!(still_open);
    assert!(
        wait_until(Duration::from_secs(5), || connector.connections()[0].close_count() == 1)
            .await
    );
    assert!(!unit.holder().is_connected().await);
}

#[tokio::test(start_paused = true)]
async fn test_returning_identity_reuses_idle_connection() {
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 1, AssignmentPolicy::ConsistentHash);
    let unit = get(&pool, device("dev-1"));
    unit.open(OPEN_TIMEOUT).await.unwrap();
    unit.close().await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let returning = get(&pool, device("dev-1"));
    returning.open(OPEN_TIMEOUT).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(connector.open_count(), 1);
    assert_eq!(connector.connections()[0].close_count(), 0);
    assert!(returning.holder().is_connected().await);
}

#[tokio::test]
async fn test_connection_loss_notifies_every_unit() {
    // Arrange
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 1, AssignmentPolicy::ConsistentHash);
    let first_handler = Arc::new(RecordingHandler::new());
    let second_handler = Arc::new(RecordingHandler::new());
    let first = pool
        .get_connection(device("dev-1"), first_handler.clone())
        .unwrap();
    let second = pool
        .get_connection(device("dev-2"), second_handler.clone())
        .unwrap();
    first.open(OPEN_TIMEOUT).await.unwrap();
    second.open(OPEN_TIMEOUT).await.unwrap();

    // Act
    first.holder().on_connection_lost().await;

    // Assert
    let expected = vec![(
        ConnectionStatus::Disconnected,
        ConnectionStatusChangeReason::CommunicationError,
    )];
    assert_eq!(first_handler.statuses(), expected);
    assert_eq!(second_handler.statuses(), expected);
    assert_eq!(first.holder().unit_count(), 0);
    assert_eq!(connector.connections()[0].close_count(), 1);
}

#[tokio::test]
async fn test_ungraceful_unit_drops_siblings() {
    let connector = Arc::new(MockAmqpConnector::new());
    let pool = pool_with(&connector, 1, AssignmentPolicy::ConsistentHash);
    let sibling_handler = Arc::new(RecordingHandler::new());
    let failing = get(&pool, device("dev-1"));
    let sibling = pool
        .get_connection(device("dev-2"), sibling_handler.clone())
        .unwrap();
    failing.open(OPEN_TIMEOUT).await.unwrap();
    sibling.open(OPEN_TIMEOUT).await.unwrap();

    failing.report_disconnected(false).await;

    assert_eq!(sibling_handler.statuses().len(), 1);
    assert!(failing.is_closed());
    assert_eq!(connector.connections()[0].close_count(), 1);
}

#[tokio::test]
async fn test_connect_failure_surfaces_to_unit() {
    let connector = Arc::new(MockAmqpConnector::new());
    connector.fail_connect(Some(TransportError::transient("service busy")));
    let pool = pool_with(&connector, 1, AssignmentPolicy::ConsistentHash);
    let unit = get(&pool, device("dev-1"));

    let result = unit.open(OPEN_TIMEOUT).await;

    assert_eq!(result, Err(TransportError::transient("service busy")));
    assert!(!unit.holder().is_connected().await);
}

#[tokio::test]
async fn test_registry_keeps_one_pool_per_host() {
    let connector = Arc::new(MockAmqpConnector::new());
    let registry = PoolRegistry::new(connector.clone()).with_policy(AssignmentPolicy::LeastLoaded);
    let other_host = DeviceIdentity::new(
        "other-hub.azure-devices.net",
        "dev-1",
        AuthenticationModel::SasIndividual,
        Credentials::SasToken("token".to_string()),
    )
    .with_settings(TransportSettings::AmqpPooled(AmqpTransportSettings::default()));

    registry
        .get_connection(device("dev-1"), Arc::new(RecordingHandler::new()))
        .unwrap();
    registry
        .get_connection(device("dev-2"), Arc::new(RecordingHandler::new()))
        .unwrap();
    registry
        .get_connection(other_host, Arc::new(RecordingHandler::new()))
        .unwrap();

    assert_eq!(registry.pool_count(), 2);
    let pool = registry.pool_for(&device("dev-3")).unwrap();
    assert_eq!(pool.policy(), AssignmentPolicy::LeastLoaded);
    assert_eq!(pool.settings().max_pool_size(), 10);
}
