//! MQTT transport behavior tests
//!
//! Drives the full transport against the mock channel: lifecycle, ordered
//! acknowledgments, twin round trips, method and module event dispatch.


use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use iothub_transport::message::{MethodRequest, MethodResponse, Twin};
use iothub_transport::testing::{wait_until, MockChannelFactory};
use iothub_transport::transport::mqtt::TransportState;
use iothub_transport::transport::{
    ChannelEvent, ConnectionStatus, ConnectionStatusChangeReason, InboundHandler,
    MqttTransportSettings, QualityOfService, Transport, TransportSettings,
};
use iothub_transport::{Message, MqttTransport, TransportError, TransportResult};
use serde_json::json;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use test_helpers::{device_identity, fast_mqtt_settings, module_identity, Harness};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(1);

/// Request id embedded in the most recent twin request topic
fn last_request_id(harness: &Harness, prefix: &str) -> Option<String> {
    harness
        .factory
        .channel()
        .published_topics()
        .into_iter()
        .rev()
        .find_map(|topic| topic.strip_prefix(prefix).map(str::to_string))
}

#[tokio::test]
async fn test_open_reports_connected() {
    // Arrange
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();

    // Act
    harness.transport.open(&cancel).await.unwrap();

    // Assert
    assert_eq!(harness.transport.state(), TransportState::Open);
    assert!(harness.transport.is_usable());
    assert_eq!(
        harness.handler.statuses(),
        vec![(ConnectionStatus::Connected, ConnectionStatusChangeReason::ConnectionOk)]
    );
}

#[tokio::test]
async fn test_concurrent_open_connects_once() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        harness.transport.open(&cancel),
        harness.transport.open(&cancel)
    );

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(harness.factory.connect_count(), 1);
}

#[tokio::test]
async fn test_operations_before_open_fail_not_connected() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();

    let result = harness.transport.enable_methods(&cancel).await;

    assert_eq!(
        result,
        Err(TransportError::NotConnected {
            state: TransportState::NotInitialized
        })
    );
    assert_eq!(harness.factory.connect_count(), 0);
}

#[tokio::test]
async fn test_concurrent_close_tears_down_once() {
    // Arrange
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();

    // Act
    let results = join_all((0..4).map(|_| harness.transport.close(&cancel))).await;

    // Assert
    assert!(results.iter().all(Result::is_ok));
    let channel = harness.factory.channel();
    assert_eq!(channel.disconnect_count(), 1);
    assert_eq!(channel.close_count(), 1);
    assert_eq!(harness.transport.state(), TransportState::Closed);
    assert!(harness
        .handler
        .statuses()
        .contains(&(ConnectionStatus::Disabled, ConnectionStatusChangeReason::ClientClose)));
}

#[tokio::test]
async fn test_closed_transport_cannot_reopen() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    harness.transport.close(&cancel).await.unwrap();

    let reopen = harness.transport.open(&cancel).await;
    let send = harness.transport.send_event(Message::new("late"), &cancel).await;

    assert_eq!(reopen, Err(TransportError::AlreadyClosed));
    assert_eq!(send, Err(TransportError::AlreadyClosed));
    assert_eq!(harness.factory.connect_count(), 1);
}

#[tokio::test]
async fn test_close_retries_channel_teardown() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    harness.factory.channel().fail_closes(1);

    tokio::time::pause();
    let result = harness.transport.close(&cancel).await;

    assert!(result.is_ok());
    assert_eq!(harness.factory.channel().close_count(), 2);
}

#[tokio::test]
async fn test_channel_fault_is_sticky() {
    // Arrange
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();

    // Act
    assert!(
        harness
            .factory
            .inject(ChannelEvent::Error(TransportError::fatal("broker went away")))
            .await
    );
    assert!(wait_until(WAIT, || harness.transport.state() == TransportState::Error).await);

    // Assert
    let fault = TransportError::fatal("broker went away");
    assert_eq!(
        harness.transport.send_event(Message::new("x"), &cancel).await,
        Err(fault.clone())
    );
    assert_eq!(harness.transport.open(&cancel).await, Err(fault.clone()));
    assert_eq!(harness.transport.close(&cancel).await, Err(fault));
    assert!(harness.handler.statuses().contains(&(
        ConnectionStatus::Disconnected,
        ConnectionStatusChangeReason::CommunicationError
    )));
    assert!(wait_until(WAIT, || harness.factory.channel().close_count() == 1).await);
}

#[tokio::test]
async fn test_fatal_write_faults_transport() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    harness
        .factory
        .channel()
        .fail_writes(Some(TransportError::fatal("socket closed")));

    let result = harness.transport.send_event(Message::new("x"), &cancel).await;

    assert_eq!(result, Err(TransportError::fatal("socket closed")));
    assert_eq!(harness.transport.state(), TransportState::Error);
}

#[tokio::test]
async fn test_receive_completes_in_arrival_order() {
    // Arrange
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    for packet_id in [10, 11, 12] {
        harness
            .factory
            .deliver_publish(
                "devices/dev-1/messages/devicebound/%24.mid=m1&color=red",
                format!("payload-{packet_id}"),
                QualityOfService::AtLeastOnce,
                packet_id,
            )
            .await;
    }

    // Act
    let mut tokens = Vec::new();
    for _ in 0..3 {
        let message = harness
            .transport
            .receive(WAIT, &cancel)
            .await
            .unwrap()
            .expect("message queued");
        assert_eq!(message.message_id.as_deref(), Some("m1"));
        assert_eq!(message.properties.get("color").map(String::as_str), Some("red"));
        tokens.push(message.lock_token.expect("QoS 1 delivery carries a lock token"));
    }

    // Assert
    let out_of_order = harness.transport.complete(&tokens[1], &cancel).await;
    assert!(matches!(
        out_of_order,
        Err(TransportError::OutOfOrderCompletion { .. })
    ));
    for token in &tokens {
        harness.transport.complete(token, &cancel).await.unwrap();
    }
    assert_eq!(harness.factory.channel().acked_packet_ids(), vec![10, 11, 12]);
    assert_eq!(
        harness.transport.complete(&tokens[0], &cancel).await,
        Err(TransportError::NoPendingAcks)
    );
    assert_eq!(harness.transport.state(), TransportState::Receiving);
    assert_eq!(
        harness.factory.channel().subscribe_filters(),
        vec!["$iothub/twin/res/#", "devices/dev-1/messages/devicebound/#"]
    );
}

/// Deliver QoS 1 telemetry with `packet_ids` and return their lock tokens
async fn receive_tokens(harness: &Harness, packet_ids: &[u16]) -> Vec<String> {
    let cancel = CancellationToken::new();
    for packet_id in packet_ids {
        harness
            .factory
            .deliver_publish(
                "devices/dev-1/messages/devicebound/",
                format!("payload-{packet_id}"),
                QualityOfService::AtLeastOnce,
                *packet_id,
            )
            .await;
    }
    let mut tokens = Vec::new();
    for _ in packet_ids {
        let message = harness
            .transport
            .receive(WAIT, &cancel)
            .await
            .unwrap()
            .expect("message queued");
        tokens.push(message.lock_token.expect("QoS 1 delivery carries a lock token"));
    }
    tokens
}

#[tokio::test]
async fn test_canceled_complete_keeps_token_for_retry() {
    // Arrange
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    let tokens = receive_tokens(&harness, &[10, 11]).await;
    let canceled = CancellationToken::new();
    canceled.cancel();

    // Act
    let first_attempt = harness.transport.complete(&tokens[0], &canceled).await;

    // Assert
    assert_eq!(first_attempt, Err(TransportError::Canceled));
    assert!(harness.factory.channel().acked_packet_ids().is_empty());
    assert!(matches!(
        harness.transport.complete(&tokens[1], &cancel).await,
        Err(TransportError::OutOfOrderCompletion { .. })
    ));
    harness.transport.complete(&tokens[0], &cancel).await.unwrap();
    harness.transport.complete(&tokens[1], &cancel).await.unwrap();
    assert_eq!(harness.factory.channel().acked_packet_ids(), vec![10, 11]);
}

#[tokio::test]
async fn test_failed_puback_write_keeps_token_for_retry() {
    // Arrange
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    let tokens = receive_tokens(&harness, &[10, 11]).await;
    let channel = harness.factory.channel();
    channel.fail_writes(Some(TransportError::transient("socket busy")));

    // Act
    let failed = harness.transport.complete(&tokens[0], &cancel).await;
    channel.fail_writes(None);

    // Assert
    assert_eq!(failed, Err(TransportError::transient("socket busy")));
    assert_eq!(harness.transport.state(), TransportState::Receiving);
    harness.transport.complete(&tokens[0], &cancel).await.unwrap();
    harness.transport.complete(&tokens[1], &cancel).await.unwrap();
    assert_eq!(channel.acked_packet_ids(), vec![10, 11]);
}

#[tokio::test]
async fn test_full_inbound_queue_drops_qos0_but_keeps_qos1() {
    // Arrange
    let settings = MqttTransportSettings {
        max_pending_inbound_messages: 2,
        ..fast_mqtt_settings()
    };
    let harness = Harness::with_settings(device_identity("dev-1"), settings);
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();

    // Act
    for (packet_id, qos) in [
        (1, QualityOfService::AtMostOnce),
        (2, QualityOfService::AtMostOnce),
        (3, QualityOfService::AtMostOnce),
        (4, QualityOfService::AtLeastOnce),
    ] {
        harness
            .factory
            .deliver_publish(
                "devices/dev-1/messages/devicebound/",
                format!("payload-{packet_id}"),
                qos,
                packet_id,
            )
            .await;
    }

    // Assert
    let mut payloads = Vec::new();
    for _ in 0..3 {
        let message = harness.transport.receive(WAIT, &cancel).await.unwrap();
        payloads.push(message.expect("message queued").payload);
    }
    assert_eq!(
        payloads,
        vec![
            Bytes::from("payload-1"),
            Bytes::from("payload-2"),
            Bytes::from("payload-4")
        ]
    );
    let drained = harness
        .transport
        .receive(Duration::from_millis(50), &cancel)
        .await;
    assert_eq!(drained, Ok(None));
}

#[tokio::test]
async fn test_foreign_lock_token_is_stale() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();

    let result = harness.transport.complete("not-a-token", &cancel).await;

    assert!(matches!(
        result,
        Err(TransportError::StaleOrInvalidToken { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_receive_times_out_with_none() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();

    let result = harness
        .transport
        .receive(Duration::from_secs(30), &cancel)
        .await;

    assert_eq!(result, Ok(None));
}

#[tokio::test]
async fn test_receive_interrupted_by_close() {
    let harness = Arc::new(Harness::new(device_identity("dev-1")));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();

    let receiver = {
        let harness = harness.clone();
        tokio::spawn(async move {
            harness
                .transport
                .receive(Duration::from_secs(60), &CancellationToken::new())
                .await
        })
    };
    assert!(wait_until(WAIT, || harness.transport.state() == TransportState::Receiving).await);
    harness.transport.close(&cancel).await.unwrap();

    assert_eq!(receiver.await.unwrap(), Err(TransportError::AlreadyClosed));
}

#[tokio::test]
async fn test_twin_get_round_trip() {
    // Arrange
    let harness = Arc::new(Harness::new(device_identity("dev-1")));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();

    // Act
    let request = {
        let harness = harness.clone();
        tokio::spawn(async move { harness.transport.send_twin_get(&CancellationToken::new()).await })
    };
    assert!(
        wait_until(WAIT, || last_request_id(&harness, "$iothub/twin/GET/?$rid=").is_some()).await
    );
    let rid = last_request_id(&harness, "$iothub/twin/GET/?$rid=").unwrap();
    let body = json!({"desired": {"interval": 30, "$version": 4}, "reported": {}}).to_string();
    harness
        .factory
        .deliver_publish(
            &format!("$iothub/twin/res/200/?$rid={rid}"),
            body,
            QualityOfService::AtMostOnce,
            0,
        )
        .await;

    // Assert
    let twin = request.await.unwrap().unwrap();
    assert_eq!(twin.properties.desired.get("interval"), Some(&json!(30)));
}

#[tokio::test]
async fn test_twin_patch_rejected_by_service() {
    let harness = Arc::new(Harness::new(device_identity("dev-1")));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    let prefix = "$iothub/twin/PATCH/properties/reported/?$rid=";

    let request = {
        let harness = harness.clone();
        tokio::spawn(async move {
            let mut reported = serde_json::Map::new();
            reported.insert("firmware".to_string(), json!("1.2.0"));
            harness
                .transport
                .send_twin_patch(reported, &CancellationToken::new())
                .await
        })
    };
    assert!(wait_until(WAIT, || last_request_id(&harness, prefix).is_some()).await);
    let rid = last_request_id(&harness, prefix).unwrap();
    harness
        .factory
        .deliver_publish(
            &format!("$iothub/twin/res/404/?$rid={rid}"),
            Bytes::new(),
            QualityOfService::AtMostOnce,
            0,
        )
        .await;

    assert_eq!(
        request.await.unwrap(),
        Err(TransportError::ServiceRejected { status: 404 })
    );
}

#[tokio::test(start_paused = true)]
async fn test_twin_get_times_out_without_response() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();

    let result = harness.transport.send_twin_get(&cancel).await;

    assert!(matches!(result, Err(TransportError::Timeout(_))));
    assert_eq!(harness.transport.state(), TransportState::Open);
}

#[tokio::test]
async fn test_method_call_dispatch_and_response() {
    // Arrange
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    harness.transport.enable_methods(&cancel).await.unwrap();

    // Act
    harness
        .factory
        .deliver_publish(
            "$iothub/methods/POST/reboot/?$rid=42",
            r#"{"delay":5}"#,
            QualityOfService::AtMostOnce,
            0,
        )
        .await;
    assert!(wait_until(WAIT, || !harness.handler.methods().is_empty()).await);
    let request = harness.handler.methods().remove(0);
    harness
        .transport
        .send_method_response(
            MethodResponse::new(request.request_id.clone(), 200, r#"{"ok":true}"#),
            &cancel,
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(request.name, "reboot");
    assert_eq!(request.request_id, "42");
    assert_eq!(request.payload, Bytes::from_static(br#"{"delay":5}"#));
    assert!(harness
        .factory
        .channel()
        .published_topics()
        .contains(&"$iothub/methods/res/200/?$rid=42".to_string()));
}

/// Method handler that fetches the twin from a spawned task
struct TwinOnMethodHandler {
    transport: OnceLock<Arc<MqttTransport>>,
    results: mpsc::UnboundedSender<TransportResult<Twin>>,
}

#[async_trait]
impl InboundHandler for TwinOnMethodHandler {
    async fn on_method_call(&self, _request: MethodRequest) -> TransportResult<()> {
        let transport = self.transport.get().cloned().expect("transport attached");
        let results = self.results.clone();
        tokio::spawn(async move {
            let twin = transport.send_twin_get(&CancellationToken::new()).await;
            let _ = results.send(twin);
        });
        Ok(())
    }
}

#[tokio::test]
async fn test_method_callback_spawns_twin_request() {
    // Arrange
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(TwinOnMethodHandler {
        transport: OnceLock::new(),
        results: results_tx,
    });
    let factory = Arc::new(MockChannelFactory::new());
    let identity = device_identity("dev-1")
        .with_settings(TransportSettings::MqttTcp(fast_mqtt_settings()));
    let transport =
        Arc::new(MqttTransport::new(identity, factory.clone(), handler.clone()).unwrap());
    handler.transport.set(transport.clone()).ok();
    let cancel = CancellationToken::new();
    transport.open(&cancel).await.unwrap();
    transport.enable_methods(&cancel).await.unwrap();

    // Act
    factory
        .deliver_publish(
            "$iothub/methods/POST/refresh/?$rid=7",
            "{}",
            QualityOfService::AtMostOnce,
            0,
        )
        .await;
    let prefix = "$iothub/twin/GET/?$rid=";
    let request_id = || {
        factory
            .channel()
            .published_topics()
            .into_iter()
            .find_map(|topic| topic.strip_prefix(prefix).map(str::to_string))
    };
    assert!(wait_until(WAIT, || request_id().is_some()).await);
    let rid = request_id().unwrap();
    factory
        .deliver_publish(
            &format!("$iothub/twin/res/200/?$rid={rid}"),
            json!({"desired": {"mode": "eco"}, "reported": {}}).to_string(),
            QualityOfService::AtMostOnce,
            0,
        )
        .await;

    // Assert
    let twin = results_rx.recv().await.unwrap().unwrap();
    assert_eq!(twin.properties.desired.get("mode"), Some(&json!("eco")));
    assert_eq!(transport.state(), TransportState::Open);
}

#[tokio::test]
async fn test_enable_methods_is_idempotent_and_disable_unsubscribes() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();

    harness.transport.enable_methods(&cancel).await.unwrap();
    harness.transport.enable_methods(&cancel).await.unwrap();
    harness.transport.disable_methods(&cancel).await.unwrap();

    let channel = harness.factory.channel();
    let method_subscribes = channel
        .subscribe_filters()
        .into_iter()
        .filter(|filter| filter == "$iothub/methods/POST/#")
        .count();
    assert_eq!(method_subscribes, 1);
    assert_eq!(channel.unsubscribe_filters(), vec!["$iothub/methods/POST/#"]);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_subscribe_times_out() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    harness.factory.channel().hold_acknowledgments(true);

    let result = harness.transport.enable_twin_patch(&cancel).await;

    assert!(matches!(result, Err(TransportError::Timeout(_))));
    assert_eq!(harness.transport.state(), TransportState::Open);
}

#[tokio::test]
async fn test_desired_property_patch_reaches_handler() {
    let harness = Harness::new(device_identity("dev-1"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    harness.transport.enable_twin_patch(&cancel).await.unwrap();

    harness
        .factory
        .deliver_publish(
            "$iothub/twin/PATCH/properties/desired/?$version=7",
            r#"{"interval":10,"$version":7}"#,
            QualityOfService::AtMostOnce,
            0,
        )
        .await;
    harness
        .factory
        .deliver_publish(
            "$iothub/twin/PATCH/properties/desired/?$version=8",
            "not json",
            QualityOfService::AtMostOnce,
            0,
        )
        .await;

    assert!(wait_until(WAIT, || harness.handler.patches().len() == 1).await);
    assert_eq!(harness.handler.patches()[0].get("interval"), Some(&json!(10)));
    assert_eq!(harness.transport.state(), TransportState::Open);
}

#[tokio::test]
async fn test_module_event_delivered_and_acknowledged() {
    // Arrange
    let harness = Harness::new(module_identity("dev-1", "filter"));
    let cancel = CancellationToken::new();
    harness.transport.open(&cancel).await.unwrap();
    harness.transport.enable_event_receive(&cancel).await.unwrap();

    // Act
    harness
        .factory
        .deliver_publish(
            "devices/dev-1/modules/filter/inputs/input1/%24.cid=c9",
            "reading",
            QualityOfService::AtLeastOnce,
            77,
        )
        .await;

    // Assert
    assert!(wait_until(WAIT, || harness.factory.channel().acked_packet_ids() == vec![77]).await);
    let events = harness.handler.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "input1");
    assert_eq!(events[0].1.correlation_id.as_deref(), Some("c9"));
    assert_eq!(events[0].1.input_name.as_deref(), Some("input1"));
    assert!(harness
        .factory
        .channel()
        .subscribe_filters()
        .contains(&"devices/dev-1/modules/filter/#".to_string()));
}

#[tokio::test]
async fn test_failing_callback_faults_transport() {
    let factory = Arc::new(MockChannelFactory::new());
    let handler = Arc::new(iothub_transport::testing::RecordingHandler::failing());
    let transport =
        iothub_transport::MqttTransport::new(device_identity("dev-1"), factory.clone(), handler)
            .unwrap();
    let cancel = CancellationToken::new();
    transport.open(&cancel).await.unwrap();

    factory
        .deliver_publish(
            "$iothub/methods/POST/reboot/?$rid=1",
            Bytes::new(),
            QualityOfService::AtMostOnce,
            0,
        )
        .await;

    assert!(wait_until(WAIT, || transport.state() == TransportState::Error).await);
    assert!(matches!(
        transport.send_event(Message::new("x"), &cancel).await,
        Err(TransportError::CallbackFailed(_))
    ));
}

#[tokio::test]
async fn test_cancel_during_open_closes_transport() {
    // Arrange
    let harness = Arc::new(Harness::with_factory(
        device_identity("dev-1"),
        MockChannelFactory::new().with_auto_connect(false),
    ));
    let cancel = CancellationToken::new();

    // Act
    let opener = {
        let harness = harness.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { harness.transport.open(&cancel).await })
    };
    assert!(wait_until(WAIT, || harness.factory.connect_count() == 1).await);
    cancel.cancel();

    // Assert
    assert_eq!(opener.await.unwrap(), Err(TransportError::Canceled));
    assert_eq!(harness.transport.state(), TransportState::Closed);
    assert_eq!(
        harness.transport.open(&CancellationToken::new()).await,
        Err(TransportError::AlreadyClosed)
    );
}

#[tokio::test]
async fn test_connect_failure_faults_transport() {
    let factory = MockChannelFactory::new();
    factory.fail_connect(Some(TransportError::fatal("connection refused")));
    let harness = Harness::with_factory(device_identity("dev-1"), factory);
    let cancel = CancellationToken::new();

    let result = harness.transport.open(&cancel).await;

    assert_eq!(result, Err(TransportError::fatal("connection refused")));
    assert_eq!(harness.transport.state(), TransportState::Error);
    assert!(!harness
        .handler
        .statuses()
        .iter()
        .any(|(status, _)| *status == ConnectionStatus::Connected));
}
