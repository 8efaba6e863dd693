//! Integration tests for discovery, the listener and the registry working
//! together over loopback.

use serial_test::serial;
use slynet::discovery::{DiscoveryMessage, DiscoveryService, DiscoverySettings, DiscoveryState};
use slynet::config::AddressFamily;
use slynet::keys::KeyInfo;
use slynet::listener::{ConnectionListener, ListenerSettings};
use slynet::progress::{ProgressAggregator, ProgressSample};
use slynet::registry::{ConnectionEvent, PeerRegistry};
use slynet::DeviceId;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

fn test_key() -> KeyInfo {
    static KEY: OnceLock<KeyInfo> = OnceLock::new();
    KEY.get_or_init(|| KeyInfo::generate(1024).unwrap()).clone()
}

struct TestPeer {
    id: DeviceId,
    registry: Arc<PeerRegistry>,
    listener: Arc<ConnectionListener>,
    discovery: DiscoveryService,
}

impl TestPeer {
    async fn start(allow_pairing: bool, known: &[DeviceId], discovery_port: u16) -> Self {
        let id = DeviceId::generate();
        let registry = PeerRegistry::new(allow_pairing, known.iter().copied());
        let listener =
            ConnectionListener::start(ListenerSettings::loopback(), id, test_key(), registry.clone()).await;
        let endpoint = listener.advertised_endpoint().unwrap();
        let discovery = DiscoveryService::start(
            DiscoverySettings {
                address_family: AddressFamily::Ipv4,
                port: discovery_port,
            },
            id,
            endpoint,
            registry.clone(),
            listener.clone(),
        );

        Self {
            id,
            registry,
            listener,
            discovery,
        }
    }

    fn discovery_addr(&self) -> SocketAddr {
        let port = self.discovery.local_addr().unwrap().port();
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Delivers this peer's announcement straight to `other`.
    async fn announce_to(&self, other: &TestPeer) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&self.discovery.message(), other.discovery_addr())
            .await
            .unwrap();
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_announcement_leads_to_mutual_registration() {
    let a = TestPeer::start(false, &[], 0).await;
    let b = TestPeer::start(true, &[], 0).await;

    a.announce_to(&b).await;

    wait_until(|| b.registry.does_connection_exist(&a.id)).await;
    wait_until(|| a.registry.does_connection_exist(&b.id)).await;
    assert_eq!(a.registry.connection_ids(), vec![b.id]);
    assert_eq!(b.registry.connection_ids(), vec![a.id]);
}

#[tokio::test]
async fn test_trusted_device_connects_without_pairing() {
    let a = TestPeer::start(false, &[], 0).await;
    let b = TestPeer::start(false, &[a.id], 0).await;
    let stranger = TestPeer::start(false, &[], 0).await;

    stranger.announce_to(&b).await;
    a.announce_to(&b).await;

    wait_until(|| b.registry.does_connection_exist(&a.id)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!b.registry.does_connection_exist(&stranger.id));
    assert!(stranger.registry.is_empty());
}

#[tokio::test]
async fn test_repeated_announcements_keep_one_connection() {
    let a = TestPeer::start(false, &[], 0).await;
    let b = TestPeer::start(true, &[], 0).await;
    let mut events = b.registry.subscribe();

    for _ in 0..5 {
        a.announce_to(&b).await;
    }
    wait_until(|| b.registry.does_connection_exist(&a.id)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(b.registry.len(), 1);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Added(a.id));
}

#[tokio::test]
async fn test_data_and_progress_flow_over_discovered_connection() {
    let a = TestPeer::start(false, &[], 0).await;
    let b = TestPeer::start(true, &[], 0).await;
    let aggregator = ProgressAggregator::start(b.registry.clone(), Duration::from_secs(3600), 10);

    a.announce_to(&b).await;
    wait_until(|| a.registry.does_connection_exist(&b.id)).await;
    wait_until(|| b.registry.does_connection_exist(&a.id)).await;
    wait_until(|| aggregator.tracked_ids().contains(&a.id)).await;

    let sender = a.registry.try_get_connection(&b.id).unwrap();
    let receiver = b.registry.try_get_connection(&a.id).unwrap();

    let payload: Vec<u8> = (0..4096u32).map(|i| (i * 7) as u8).collect();
    sender.send(&payload).await.unwrap();

    let mut received = vec![0u8; payload.len()];
    let mut filled = 0;
    while filled < received.len() {
        let read = receiver.recv(&mut received[filled..]).await.unwrap();
        assert_ne!(read, 0);
        filled += read;
        receiver.set_progress(ProgressSample::determinate(filled as i64, payload.len() as i64));
        aggregator.tick();
    }
    assert_eq!(received, payload);

    receiver.set_progress(ProgressSample::determinate(payload.len() as i64, payload.len() as i64));
    let update = aggregator.tick();
    let status = update.statuses.iter().find(|s| s.connection_id == a.id).unwrap();
    assert_eq!(status.current, 4096);
    assert_eq!(status.maximum, 4096);
}

#[tokio::test]
async fn test_closing_a_connection_unregisters_both_sides() {
    let a = TestPeer::start(false, &[], 0).await;
    let b = TestPeer::start(true, &[], 0).await;

    a.announce_to(&b).await;
    wait_until(|| a.registry.does_connection_exist(&b.id)).await;
    wait_until(|| b.registry.does_connection_exist(&a.id)).await;

    a.registry.try_get_connection(&b.id).unwrap().close().await;
    assert!(!a.registry.does_connection_exist(&b.id));

    // the other side notices on its next read
    let remote = b.registry.try_get_connection(&a.id).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(remote.recv(&mut buf).await.unwrap(), 0);
    assert!(!b.registry.does_connection_exist(&a.id));
}

#[tokio::test]
#[serial(discovery_port)]
async fn test_discovery_on_fixed_ports() {
    const FIRST_PORT: u16 = 47_931;
    const SECOND_PORT: u16 = 47_932;

    let a = TestPeer::start(false, &[], 0).await;
    let b = TestPeer::start(true, &[], FIRST_PORT).await;
    assert_eq!(b.discovery.local_addr().unwrap().port(), FIRST_PORT);

    b.discovery.refresh_port(SECOND_PORT).await;
    assert_eq!(b.discovery.state(), DiscoveryState::Listening);
    assert_eq!(b.discovery.local_addr().unwrap().port(), SECOND_PORT);

    a.announce_to(&b).await;
    wait_until(|| b.registry.does_connection_exist(&a.id)).await;

    b.discovery.dispose();
    b.listener.stop();
    assert_eq!(b.discovery.state(), DiscoveryState::Disposed);
}

#[tokio::test]
#[serial(discovery_port)]
async fn test_self_announcement_is_ignored() {
    let a = TestPeer::start(true, &[], 47_933).await;

    let own = DiscoveryMessage::decode(&a.discovery.message()).unwrap();
    assert_eq!(own.device_id, a.id);

    a.announce_to(&a).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.registry.is_empty());
    assert!(a.listener.is_active());
}
