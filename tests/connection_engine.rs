use ble_control::domain::capability::{CapabilityRequirement, RequiredCapabilitySet};
use ble_control::domain::error::{ConnectError, MissingRequirement, OperationError};
use ble_control::domain::models::{
    CharProperties, CharacteristicHandle, ConnectionState, DeviceId, DisconnectReason,
    NotificationEvent, Property, StreamClosed,
};
use ble_control::infrastructure::bluetooth::protocol::{self, CONTROL_RESPONSE_ROLE};
use ble_control::infrastructure::bluetooth::simulated::{
    Phase, SimOp, SimulatedAdapter, SimulatedPeripheral,
};
use ble_control::infrastructure::bluetooth::transaction::OperationTimeouts;
use ble_control::infrastructure::bluetooth::{Connection, ConnectionConfig};
use std::sync::Arc;
use std::time::Duration;

const ADDRESS: &str = "C0:FF:EE:00:00:01";
const CONTROL_HANDLE: CharacteristicHandle = CharacteristicHandle(0x002a);

fn props(list: &[Property]) -> CharProperties {
    list.iter().copied().collect()
}

fn peripheral_with(handle: CharacteristicHandle, properties: CharProperties) -> SimulatedPeripheral {
    SimulatedPeripheral::new(ADDRESS).with_characteristic(
        protocol::service_control_uuid(),
        protocol::control_response_uuid(),
        handle,
        properties,
        vec![0x01],
    )
}

fn setup_with(
    peripheral: SimulatedPeripheral,
    config: ConnectionConfig,
) -> (Arc<SimulatedAdapter>, Connection) {
    let adapter = Arc::new(SimulatedAdapter::new());
    adapter.add_peripheral(peripheral);
    let connection = Connection::new(DeviceId::from(ADDRESS), adapter.clone(), config);
    (adapter, connection)
}

fn setup() -> (Arc<SimulatedAdapter>, Connection) {
    setup_with(
        SimulatedPeripheral::control_device(ADDRESS),
        ConnectionConfig::default(),
    )
}

async fn ready() -> (Arc<SimulatedAdapter>, Connection) {
    let (adapter, connection) = setup();
    connection.connect().await.unwrap();
    (adapter, connection)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn test_connect_reaches_ready() {
    let (adapter, connection) = setup();
    let states = connection.watch_state();

    connection.connect().await.unwrap();

    assert_eq!(connection.current_state(), ConnectionState::Ready);
    assert_eq!(*states.borrow(), ConnectionState::Ready);
    assert_eq!(connection.mtu(), 247);
    assert_eq!(
        connection.resolved_target(CONTROL_RESPONSE_ROLE).unwrap().handle,
        CONTROL_HANDLE
    );
    assert_eq!(adapter.opened_links(), 1);
    assert_eq!(connection.last_failure(), None);
}

#[tokio::test]
async fn test_second_connect_is_rejected() {
    let (_adapter, connection) = ready().await;
    assert_eq!(connection.connect().await, Err(ConnectError::AlreadyConnected));
}

#[tokio::test]
async fn test_unsupported_device_names_role() {
    let config = ConnectionConfig::default().with_capabilities(
        RequiredCapabilitySet::new(vec![CapabilityRequirement::new(
            CONTROL_RESPONSE_ROLE,
            protocol::service_control_uuid(),
            protocol::control_response_uuid(),
            props(&[Property::Notify]),
        )])
        .unwrap(),
    );
    let (adapter, connection) =
        setup_with(peripheral_with(CONTROL_HANDLE, props(&[Property::Read])), config);

    let err = connection.connect().await.unwrap_err();

    match &err {
        ConnectError::UnsupportedDevice(unsupported) => {
            assert_eq!(unsupported.role, CONTROL_RESPONSE_ROLE);
            assert!(matches!(unsupported.missing, MissingRequirement::Properties { .. }));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(connection.current_state(), ConnectionState::Failed);
    assert_eq!(connection.last_failure(), Some(err));
    assert_eq!(adapter.open_link_count(), 0);

    // Failed allows a fresh attempt and disconnect settles it
    assert_eq!(connection.disconnect().await, Ok(()));
    assert_eq!(connection.current_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_write_completes_before_read_starts() {
    let (adapter, connection) = ready().await;
    adapter.set_latency(Duration::from_millis(50));

    let (first, second, read) = tokio::join!(
        connection.write_role(CONTROL_RESPONSE_ROLE, &[0xA1]),
        connection.write_role(CONTROL_RESPONSE_ROLE, &[0xA2]),
        connection.read_role(CONTROL_RESPONSE_ROLE),
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(read.unwrap(), vec![0xA2]);

    let gatt: Vec<(SimOp, Phase)> = adapter
        .op_log()
        .into_iter()
        .filter(|r| matches!(r.op, SimOp::Read | SimOp::Write))
        .map(|r| (r.op, r.phase))
        .collect();
    assert_eq!(
        gatt,
        vec![
            (SimOp::Write, Phase::Begin),
            (SimOp::Write, Phase::End),
            (SimOp::Write, Phase::Begin),
            (SimOp::Write, Phase::End),
            (SimOp::Read, Phase::Begin),
            (SimOp::Read, Phase::End),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_timeout_retries() {
    let config = ConnectionConfig {
        timeouts: OperationTimeouts {
            read: Duration::from_secs(1),
            retries: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let (adapter, connection) = setup_with(SimulatedPeripheral::control_device(ADDRESS), config);
    connection.connect().await.unwrap();
    adapter.set_hanging(SimOp::Read, true);

    let started = tokio::time::Instant::now();
    let result = connection.read_role(CONTROL_RESPONSE_ROLE).await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(OperationError::Timeout { attempts: 3 }));
    assert_eq!(adapter.attempts(SimOp::Read), 3);
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100));
    // A timed-out transaction does not end the link
    assert_eq!(connection.current_state(), ConnectionState::Ready);
    assert_eq!(connection.queue_len(), 0);
}

#[tokio::test]
async fn test_gatt_error_passes_through() {
    let (adapter, connection) = ready().await;
    adapter.set_gatt_error(
        SimOp::Write,
        Some(ble_control::domain::error::GattError::InsufficientAuthentication),
    );

    let result = connection.write_role(CONTROL_RESPONSE_ROLE, &[1]).await;
    assert_eq!(
        result,
        Err(OperationError::Gatt(
            ble_control::domain::error::GattError::InsufficientAuthentication
        ))
    );
    assert_eq!(adapter.attempts(SimOp::Write), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_queued_transactions() {
    let (adapter, connection) = ready().await;
    adapter.set_hanging(SimOp::Read, true);

    let pending: Vec<_> = (0..3)
        .map(|_| {
            let connection = connection.clone();
            tokio::spawn(async move { connection.read_role(CONTROL_RESPONSE_ROLE).await })
        })
        .collect();
    eventually(|| connection.queue_len() == 3).await;

    connection.disconnect().await.unwrap();

    for task in pending {
        assert_eq!(task.await.unwrap(), Err(OperationError::LinkLost));
    }
    assert_eq!(connection.queue_len(), 0);
    assert_eq!(connection.current_state(), ConnectionState::Disconnected);
    assert_eq!(adapter.open_link_count(), 0);

    // Second disconnect is a no-op
    assert_eq!(connection.disconnect().await, Ok(()));
    assert_eq!(connection.current_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_operations_rejected_while_discovering() {
    let (adapter, connection) = setup();
    adapter.set_hanging(SimOp::Discover, true);

    let connecting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.connect().await })
    };
    eventually(|| connection.current_state() == ConnectionState::Discovering).await;

    assert_eq!(
        connection.read_role(CONTROL_RESPONSE_ROLE).await,
        Err(OperationError::NotReady(ConnectionState::Discovering))
    );
    assert_eq!(connection.connect().await, Err(ConnectError::AlreadyConnecting));

    connection.disconnect().await.unwrap();
    assert_eq!(connecting.await.unwrap(), Err(ConnectError::Aborted));
    assert_eq!(connection.current_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_notifications_then_link_loss() {
    let (adapter, connection) = ready().await;
    let device = DeviceId::from(ADDRESS);
    let mut stream = connection.subscribe_role(CONTROL_RESPONSE_ROLE).await.unwrap();

    for n in 0..5u8 {
        assert_eq!(adapter.notify(&device, CONTROL_HANDLE, &[n]), 1);
    }
    for n in 0..5u8 {
        assert_eq!(stream.next_event().await, Some(NotificationEvent::Payload(vec![n])));
    }

    adapter.drop_link(&device, DisconnectReason::SupervisionTimeout);

    assert_eq!(
        stream.next_event().await,
        Some(NotificationEvent::Closed(StreamClosed::LinkLost))
    );
    assert_eq!(stream.next_event().await, None);
    assert_eq!(connection.current_state(), ConnectionState::Disconnected);
    assert_eq!(
        connection.read_role(CONTROL_RESPONSE_ROLE).await,
        Err(OperationError::NotReady(ConnectionState::Disconnected))
    );
}

#[tokio::test]
async fn test_second_stream_joins_subscription() {
    let (adapter, connection) = ready().await;
    let device = DeviceId::from(ADDRESS);

    let mut first = connection.subscribe_role(CONTROL_RESPONSE_ROLE).await.unwrap();
    let mut second = connection.subscribe_role(CONTROL_RESPONSE_ROLE).await.unwrap();
    assert_eq!(adapter.attempts(SimOp::Subscribe), 1);

    adapter.notify(&device, CONTROL_HANDLE, &[9]);
    assert_eq!(first.next_event().await, Some(NotificationEvent::Payload(vec![9])));
    assert_eq!(second.next_event().await, Some(NotificationEvent::Payload(vec![9])));
}

#[tokio::test]
async fn test_unsubscribe_closes_streams() {
    let (adapter, connection) = ready().await;
    let mut stream = connection.subscribe_role(CONTROL_RESPONSE_ROLE).await.unwrap();

    connection.unsubscribe_role(CONTROL_RESPONSE_ROLE).await.unwrap();

    assert_eq!(
        stream.next_event().await,
        Some(NotificationEvent::Closed(StreamClosed::Unsubscribed))
    );
    assert_eq!(stream.next_event().await, None);
    assert_eq!(adapter.notify(&DeviceId::from(ADDRESS), CONTROL_HANDLE, &[1]), 0);
}

#[tokio::test]
async fn test_services_changed_resolves_again() {
    let (adapter, connection) = ready().await;
    let device = DeviceId::from(ADDRESS);
    let mut stream = connection.subscribe_role(CONTROL_RESPONSE_ROLE).await.unwrap();

    let moved = CharacteristicHandle(0x0040);
    adapter.invalidate_services(
        &device,
        peripheral_with(moved, props(&[Property::Read, Property::Notify])),
    );

    assert_eq!(
        stream.next_event().await,
        Some(NotificationEvent::Closed(StreamClosed::ServicesChanged))
    );
    eventually(|| {
        connection.current_state() == ConnectionState::Ready
            && connection.resolved_target(CONTROL_RESPONSE_ROLE).map(|t| t.handle) == Some(moved)
    })
    .await;
    assert_eq!(connection.read_role(CONTROL_RESPONSE_ROLE).await, Ok(vec![0x01]));
}

#[tokio::test(start_paused = true)]
async fn test_services_changed_during_discovery_discovers_again() {
    let (adapter, connection) = setup();
    let device = DeviceId::from(ADDRESS);
    adapter.set_latency(Duration::from_millis(50));

    let connecting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.connect().await })
    };
    // The first discovery reports the table it started with
    eventually(|| adapter.attempts(SimOp::Discover) == 1).await;
    let moved = CharacteristicHandle(0x0040);
    adapter.invalidate_services(
        &device,
        peripheral_with(moved, props(&[Property::Read, Property::Notify])),
    );

    assert_eq!(connecting.await.unwrap(), Ok(()));
    assert_eq!(adapter.attempts(SimOp::Discover), 2);
    assert_eq!(
        connection.resolved_target(CONTROL_RESPONSE_ROLE).map(|t| t.handle),
        Some(moved)
    );
    assert_eq!(connection.read_role(CONTROL_RESPONSE_ROLE).await, Ok(vec![0x01]));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_bounded_when_close_hangs() {
    let (adapter, connection) = ready().await;
    adapter.set_hanging(SimOp::Close, true);

    let started = tokio::time::Instant::now();
    assert_eq!(
        connection.disconnect().await,
        Err(ConnectError::Timeout(Duration::from_secs(5)))
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5100));
    assert_eq!(connection.current_state(), ConnectionState::Disconnected);
    assert_eq!(connection.disconnect().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_failed_opens() {
    let (adapter, connection) = setup();
    let device = DeviceId::from(ADDRESS);

    adapter.fail_next_opens(&device, 2);
    connection.connect().await.unwrap();
    assert_eq!(adapter.opened_links(), 1);
    connection.disconnect().await.unwrap();

    adapter.fail_next_opens(&device, 3);
    let err = connection.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Open(_)));
    assert_eq!(connection.current_state(), ConnectionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out_without_link_up() {
    let config = ConnectionConfig {
        connect_timeout: Duration::from_secs(2),
        connect_retries: 0,
        ..Default::default()
    };
    let (adapter, connection) = setup_with(SimulatedPeripheral::control_device(ADDRESS), config);
    adapter.set_silent_connect(true);

    assert_eq!(
        connection.connect().await,
        Err(ConnectError::Timeout(Duration::from_secs(2)))
    );
    assert_eq!(adapter.open_link_count(), 0);
    assert_eq!(connection.current_state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_role_validation() {
    let (adapter, connection) = setup_with(
        peripheral_with(CONTROL_HANDLE, props(&[Property::Read])),
        ConnectionConfig::default(),
    );
    connection.connect().await.unwrap();

    assert_eq!(
        connection.write_role(CONTROL_RESPONSE_ROLE, &[1]).await,
        Err(OperationError::NotSupported {
            role: CONTROL_RESPONSE_ROLE.to_string(),
            operation: "write",
        })
    );
    assert!(matches!(
        connection.subscribe_role(CONTROL_RESPONSE_ROLE).await,
        Err(OperationError::NotSupported { .. })
    ));
    assert_eq!(
        connection.read_role("battery").await,
        Err(OperationError::UnknownRole("battery".to_string()))
    );
    // Nothing reached the adapter
    assert_eq!(adapter.attempts(SimOp::Write), 0);
    assert_eq!(adapter.attempts(SimOp::Subscribe), 0);
}

#[tokio::test]
async fn test_payload_limited_by_mtu() {
    let (adapter, connection) = setup();
    adapter.set_mtu_limit(23);
    connection.connect().await.unwrap();
    assert_eq!(connection.mtu(), 23);

    assert_eq!(
        connection.write_role(CONTROL_RESPONSE_ROLE, &[0; 21]).await,
        Err(OperationError::PayloadTooLarge { len: 21, max: 20 })
    );
    connection.write_role(CONTROL_RESPONSE_ROLE, &[0; 20]).await.unwrap();
}

#[tokio::test]
async fn test_write_without_response_characteristic() {
    let (adapter, connection) = setup_with(
        peripheral_with(
            CONTROL_HANDLE,
            props(&[Property::Read, Property::WriteWithoutResponse]),
        ),
        ConnectionConfig::default(),
    );
    connection.connect().await.unwrap();

    connection.write_role(CONTROL_RESPONSE_ROLE, &[7, 7]).await.unwrap();
    assert_eq!(
        adapter.value(&DeviceId::from(ADDRESS), CONTROL_HANDLE),
        Some(vec![7, 7])
    );
}
