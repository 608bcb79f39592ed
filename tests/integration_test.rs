//! Integration tests for the full communication flow over the simulated radio.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use ble_duplex::bluetooth::ble_constants::NOTIFY_UUID;
use ble_duplex::bluetooth::sim::{SimAir, SimPermissions};
use ble_duplex::bluetooth::{
    BleError, BleEvent, EngineOptions, Role, RoleCoordinator, TransferTiming,
};
use ble_duplex::storage::MemoryImageSink;

const PERIPHERAL: &str = "00:00:00:00:00:0A";
const CENTRAL: &str = "00:00:00:00:00:0B";
const SECOND_CENTRAL: &str = "00:00:00:00:00:0C";

struct Node {
    coordinator: RoleCoordinator,
    events: UnboundedReceiver<BleEvent>,
    images: Arc<MemoryImageSink>,
}

impl Node {
    fn drain(&mut self) -> Vec<BleEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

fn node(air: &Arc<SimAir>, address: &str, name: &str, identifier: &str) -> Node {
    let options = EngineOptions {
        device_name: name.to_string(),
        local_identifier: identifier.to_string(),
        transfer: TransferTiming {
            start_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            end_delay: Duration::ZERO,
            ..Default::default()
        },
        ..Default::default()
    };
    let platform = air.device(address, Some(name));
    let images = Arc::new(MemoryImageSink::default());
    let (events, rx) = ble_duplex::bluetooth::EventSink::channel();
    Node {
        coordinator: RoleCoordinator::new(
            platform,
            Arc::new(SimPermissions::default()),
            images.clone(),
            events,
            options,
        ),
        events: rx,
        images,
    }
}

/// Peripheral advertising and one central connected to it.
async fn linked_pair(air: &Arc<SimAir>) -> (Node, Node) {
    let peripheral = node(air, PERIPHERAL, "periph", "01055555555");
    let central = node(air, CENTRAL, "central", "01012345678");

    peripheral.coordinator.set_role(Role::Peripheral).await;
    air.run_until_idle();
    assert!(peripheral.coordinator.is_advertising());

    central.coordinator.set_role(Role::Central).await;
    central.coordinator.start_scan(None).unwrap();
    air.run_until_idle();
    assert_eq!(central.coordinator.discovered().len(), 1);

    central.coordinator.connect("01055555555").unwrap();
    air.run_until_idle();
    assert_eq!(peripheral.coordinator.server().clients().len(), 1);
    assert!(central.coordinator.client().peers()[0].ready);

    (peripheral, central)
}

#[tokio::test]
async fn test_message_flow_both_directions() {
    let air = SimAir::new();
    let (mut peripheral, mut central) = linked_pair(&air).await;
    peripheral.drain();
    central.drain();

    let report = central.coordinator.send_message("hello", None, false).unwrap();
    assert_eq!(report.queued, vec!["periph".to_string()]);
    air.run_until_idle();

    assert!(peripheral.drain().iter().any(|e| matches!(
        e,
        BleEvent::InboundMessage { text, sender } if text == "hello" && sender.address == CENTRAL
    )));
    assert!(central
        .drain()
        .iter()
        .any(|e| matches!(e, BleEvent::MessageDelivered { .. })));

    peripheral.coordinator.send_message("pong", None, false).unwrap();
    air.run_until_idle();
    assert!(central.drain().iter().any(|e| matches!(
        e,
        BleEvent::InboundMessage { text, sender } if text == "pong" && sender.address == PERIPHERAL
    )));
}

#[tokio::test]
async fn test_identifier_exchange_reads_back_server_value() {
    let air = SimAir::new();
    let (mut peripheral, mut central) = linked_pair(&air).await;
    peripheral.drain();
    central.drain();

    central.coordinator.send_identifier("01012345678").unwrap();
    air.run_until_idle();

    assert!(peripheral.drain().iter().any(|e| matches!(
        e,
        BleEvent::IdentifierReceived { identifier, .. } if identifier == "01012345678"
    )));
    assert!(central.drain().iter().any(|e| matches!(
        e,
        BleEvent::PeerIdentifier { identifier, .. } if identifier == "01055555555"
    )));
    assert_eq!(
        central.coordinator.client().peers()[0].identifier.as_deref(),
        Some("01055555555")
    );
}

#[tokio::test]
async fn test_image_transfer_reassembles_bytes() {
    let air = SimAir::new();
    let (mut peripheral, central) = linked_pair(&air).await;
    peripheral.drain();

    let image: Vec<u8> = (0..=255u8).collect();
    let chunks = central.coordinator.send_image(&image).await.unwrap();
    assert_eq!(chunks, 2);
    air.run_until_idle();

    assert_eq!(peripheral.images.saved(), vec![image]);
    assert!(peripheral.drain().iter().any(|e| matches!(
        e,
        BleEvent::ImageReceived { size: 256, .. }
    )));
}

#[tokio::test]
async fn test_two_centrals_then_one_leaves() {
    let air = SimAir::new();
    let (peripheral, first) = linked_pair(&air).await;

    let second = node(&air, SECOND_CENTRAL, "second", "01077777777");
    second.coordinator.set_role(Role::Central).await;
    second.coordinator.start_scan(None).unwrap();
    air.run_until_idle();
    second.coordinator.connect(PERIPHERAL).unwrap();
    air.run_until_idle();

    let clients = peripheral.coordinator.server().clients();
    assert_eq!(clients.len(), 2);

    first.coordinator.disconnect_all();
    air.run_until_idle();

    let clients = peripheral.coordinator.server().clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].identity.address, SECOND_CENTRAL);
}

#[tokio::test]
async fn test_role_switch_releases_links() {
    let air = SimAir::new();
    let (peripheral, central) = linked_pair(&air).await;

    central.coordinator.set_role(Role::Peripheral).await;
    air.run_until_idle();

    assert!(!central.coordinator.is_scanning());
    assert!(central.coordinator.discovered().is_empty());
    assert_eq!(central.coordinator.client().connection_count(), 0);
    assert!(peripheral.coordinator.server().clients().is_empty());
    assert_eq!(air.link_count(), 0);
}

#[tokio::test]
async fn test_send_without_clients_leaves_notify_untouched() {
    let air = SimAir::new();
    let peripheral = node(&air, PERIPHERAL, "periph", "01055555555");
    peripheral.coordinator.set_role(Role::Peripheral).await;
    air.run_until_idle();

    assert_eq!(
        peripheral.coordinator.send_message("anyone?", None, false),
        Err(BleError::NoConnectedPeers)
    );
    assert_eq!(air.value_of(PERIPHERAL, NOTIFY_UUID), None);
}

#[tokio::test]
async fn test_image_transfer_peripheral_to_central() {
    let air = SimAir::new();
    let (peripheral, mut central) = linked_pair(&air).await;
    central.drain();

    let image: Vec<u8> = (0..=255u8).rev().collect();
    let chunks = peripheral.coordinator.send_image(&image).await.unwrap();
    assert_eq!(chunks, 2);
    air.run_until_idle();

    assert_eq!(central.images.saved(), vec![image]);
    assert!(central.drain().iter().any(|e| matches!(
        e,
        BleEvent::ImageReceived { size: 256, sender, .. } if sender.address == PERIPHERAL
    )));
}

/// Exactly the resources of `role` are live on the radio.
fn assert_only(air: &SimAir, node: &Node, role: Role) {
    let coordinator = &node.coordinator;
    assert_eq!(coordinator.role(), role);

    let peripheral = role == Role::Peripheral;
    assert_eq!(coordinator.server().is_provisioned(), peripheral, "{role}");
    assert_eq!(air.has_server(PERIPHERAL), peripheral, "{role}");
    assert_eq!(coordinator.is_advertising(), peripheral, "{role}");
    assert_eq!(air.is_advertising(PERIPHERAL), peripheral, "{role}");

    let central = role == Role::Central;
    assert_eq!(coordinator.is_scanning(), central, "{role}");
    assert_eq!(air.is_scanning(PERIPHERAL), central, "{role}");
    if !central {
        assert!(coordinator.discovered().is_empty(), "{role}");
        assert_eq!(coordinator.client().connection_count(), 0, "{role}");
    }
}

#[tokio::test]
async fn test_role_sequence_keeps_one_role_live() {
    let air = SimAir::new();
    let node = node(&air, PERIPHERAL, "periph", "01055555555");
    // Something for the central role to find
    air.advertise_raw(
        "00:00:00:00:00:0D",
        Some("beacon"),
        ble_duplex::bluetooth::ble_constants::SERVICE_UUID,
        None,
    );

    for role in [
        Role::Peripheral,
        Role::Central,
        Role::Idle,
        Role::Peripheral,
        Role::Idle,
        Role::Central,
        Role::Peripheral,
        Role::Central,
        Role::Idle,
    ] {
        node.coordinator.set_role(role).await;
        if role == Role::Central {
            node.coordinator.start_scan(None).unwrap();
        }
        air.run_until_idle();
        if role == Role::Central {
            assert_eq!(node.coordinator.discovered().len(), 1);
        }
        assert_only(&air, &node, role);
    }
}

#[tokio::test]
async fn test_role_switch_during_provisioning_releases_server() {
    let air = SimAir::new();
    let coordinator = Arc::new(node(&air, PERIPHERAL, "periph", "01055555555").coordinator);
    let gate = air
        .platform(PERIPHERAL)
        .map(|platform| platform.hold_add_service())
        .unwrap();

    let switching = coordinator.clone();
    let first = tokio::spawn(async move { switching.set_role(Role::Peripheral).await });
    while coordinator.role() != Role::Peripheral {
        tokio::task::yield_now().await;
    }
    // The peripheral setup is now parked inside add_service
    assert!(!coordinator.server().is_provisioned());

    coordinator.set_role(Role::Central).await;
    gate.notify_one();
    first.await.unwrap();
    air.run_until_idle();

    assert_eq!(coordinator.role(), Role::Central);
    assert!(!coordinator.server().is_provisioned());
    assert!(!air.has_server(PERIPHERAL));
    assert!(!air.is_advertising(PERIPHERAL));
    assert!(!coordinator.is_advertising());

    // Peripheral mode still comes up cleanly afterwards
    coordinator.set_role(Role::Peripheral).await;
    air.run_until_idle();
    assert!(coordinator.server().is_provisioned());
    assert!(air.is_advertising(PERIPHERAL));
    assert!(coordinator.is_advertising());
}
