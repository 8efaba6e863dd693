//! # LAN Discovery
//!
//! Peers announce their listener endpoint with a UDP broadcast and dial every
//! peer they hear from, subject to the drop rules in [`evaluate`].
//!
//! ## Datagram Layout
//!
//! All integers little-endian, fields in this order:
//!
//! | Field        | Encoding                          |
//! |--------------|-----------------------------------|
//! | net version  | `i64`, always [`NET_VERSION`]     |
//! | sender id    | 16 raw bytes                      |
//! | listener IP  | `i32` length + address bytes      |
//! | listener port| `i32`                             |
//!
//! A datagram is only considered when its length equals the length of the
//! local message, which also filters out peers of the other address family.
//! Announcements from a device that is already being dialed are ignored until
//! that attempt finishes.
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped --start--> Listening --refresh_port--> Rebinding --> Listening
//!                        |                                        |
//!                        +----------------dispose-----------------+--> Disposed
//! ```

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{AddressFamily, Config};
use crate::device::DeviceId;
use crate::error::{NetError, Result};
use crate::registry::PeerRegistry;

/// Protocol generation carried in every datagram.
pub const NET_VERSION: i64 = 2;

/// How long `refresh_port` waits for the previous receive loop.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 512;

/// Dials a discovered peer. Implemented by the connection listener.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Returns `Ok(false)` when the peer turned out to be connected already.
    async fn connect(&self, remote_id: DeviceId, address: SocketAddr) -> Result<bool>;
}

/// Announcement of one peer's listener endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub net_version: i64,
    pub device_id: DeviceId,
    pub endpoint: SocketAddr,
}

impl DiscoveryMessage {
    pub fn new(device_id: DeviceId, endpoint: SocketAddr) -> Self {
        Self {
            net_version: NET_VERSION,
            device_id,
            endpoint,
        }
    }

    pub fn encode(&self) -> Bytes {
        let ip = ip_bytes(&self.endpoint.ip());
        let mut buf = BytesMut::with_capacity(8 + DeviceId::LEN + 4 + ip.len() + 4);

        // the version always comes first so any future layout can be rejected
        buf.put_i64_le(self.net_version);
        buf.put_slice(self.device_id.as_bytes());
        buf.put_i32_le(ip.len() as i32);
        buf.put_slice(&ip);
        buf.put_i32_le(i32::from(self.endpoint.port()));

        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 8 + DeviceId::LEN + 4 {
            return Err(NetError::malformed("discovery datagram too short"));
        }
        let net_version = data.get_i64_le();

        let mut id = [0u8; DeviceId::LEN];
        data.copy_to_slice(&mut id);

        let ip_len = data.get_i32_le();
        let ip = match ip_len {
            4 if data.remaining() >= 4 + 4 => {
                let mut octets = [0u8; 4];
                data.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 if data.remaining() >= 16 + 4 => {
                let mut octets = [0u8; 16];
                data.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(NetError::malformed(format!("invalid listener address length {other}"))),
        };

        let port = u16::try_from(data.get_i32_le())
            .map_err(|_| NetError::malformed("listener port out of range"))?;

        Ok(Self {
            net_version,
            device_id: DeviceId::from_bytes(id),
            endpoint: SocketAddr::new(ip, port),
        })
    }
}

fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// What the receive loop does with one datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    WrongLength { received: usize, expected: usize },
    VersionMismatch(i64),
    Malformed,
    SelfOriginated,
    AlreadyConnected(DeviceId),
    NotPaired(DeviceId),
    Connect { device_id: DeviceId, address: SocketAddr },
}

/// Applies the drop rules in order; only [`Verdict::Connect`] leads to a dial.
pub fn evaluate(datagram: &[u8], expected_len: usize, local_id: DeviceId, registry: &PeerRegistry) -> Verdict {
    if datagram.len() != expected_len {
        return Verdict::WrongLength {
            received: datagram.len(),
            expected: expected_len,
        };
    }

    let mut header = datagram;
    if header.remaining() < 8 {
        return Verdict::Malformed;
    }
    let net_version = header.get_i64_le();
    if net_version != NET_VERSION {
        return Verdict::VersionMismatch(net_version);
    }

    let message = match DiscoveryMessage::decode(datagram) {
        Ok(message) => message,
        Err(_) => return Verdict::Malformed,
    };
    let device_id = message.device_id;

    if device_id == local_id {
        return Verdict::SelfOriginated;
    }
    if registry.does_connection_exist(&device_id) {
        return Verdict::AlreadyConnected(device_id);
    }
    if !registry.allow_pairing() && !registry.is_known(&device_id) {
        return Verdict::NotPaired(device_id);
    }

    Verdict::Connect {
        device_id,
        address: message.endpoint,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryState {
    Stopped,
    Listening,
    Rebinding,
    /// Terminal.
    Disposed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub address_family: AddressFamily,
    pub port: u16,
}

impl From<&Config> for DiscoverySettings {
    fn from(config: &Config) -> Self {
        Self {
            address_family: config.address_family,
            port: config.discovery_port,
        }
    }
}

struct Shared {
    local_id: DeviceId,
    registry: Arc<PeerRegistry>,
    connector: Arc<dyn PeerConnector>,
    endpoint: RwLock<SocketAddr>,
    message: RwLock<Bytes>,
    dialing: Mutex<HashSet<DeviceId>>,
}

impl Shared {
    fn handle_datagram(self: &Arc<Self>, datagram: &[u8], from: SocketAddr) -> Verdict {
        let expected = self.message.read().len();
        let verdict = evaluate(datagram, expected, self.local_id, &self.registry);

        match &verdict {
            Verdict::Connect { device_id, address } => {
                let (device_id, address) = (*device_id, *address);
                if !self.dialing.lock().insert(device_id) {
                    trace!("Already dialing {}", device_id);
                    return verdict;
                }

                info!("Discovered {} at {}", device_id, address);
                let shared = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = shared.connector.connect(device_id, address).await {
                        debug!("Could not connect to discovered peer {}: {}", device_id, e);
                    }
                    shared.dialing.lock().remove(&device_id);
                });
            }
            Verdict::VersionMismatch(_) => {}
            other => trace!("Ignoring discovery datagram from {}: {:?}", from, other),
        }

        verdict
    }
}

struct ReceiveLoop {
    shutdown_tx: mpsc::UnboundedSender<()>,
    handle: JoinHandle<()>,
    active: Arc<AtomicBool>,
}

/// Broadcast announcer and receiver bound to the discovery port.
pub struct DiscoveryService {
    shared: Arc<Shared>,
    family: AddressFamily,
    port: Mutex<u16>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    receiver: Mutex<Option<ReceiveLoop>>,
    state: Mutex<DiscoveryState>,
}

impl DiscoveryService {
    /// Binds the discovery socket and starts the receive loop. A bind failure
    /// is logged and leaves the service inactive.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        settings: DiscoverySettings,
        local_id: DeviceId,
        endpoint: SocketAddr,
        registry: Arc<PeerRegistry>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let message = DiscoveryMessage::new(local_id, endpoint).encode();
        let service = Self {
            shared: Arc::new(Shared {
                local_id,
                registry,
                connector,
                endpoint: RwLock::new(endpoint),
                message: RwLock::new(message),
                dialing: Mutex::new(HashSet::new()),
            }),
            family: settings.address_family,
            port: Mutex::new(settings.port),
            socket: Mutex::new(None),
            receiver: Mutex::new(None),
            state: Mutex::new(DiscoveryState::Stopped),
        };

        service.bind_and_spawn(settings.port);
        service
    }

    fn bind_and_spawn(&self, port: u16) {
        let socket = match create_socket(self.family, port) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!("Discovery unavailable: {}", e);
                *self.socket.lock() = None;
                *self.state.lock() = DiscoveryState::Stopped;
                return;
            }
        };

        let active = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(receive_loop(
            self.shared.clone(),
            socket.clone(),
            active.clone(),
            shutdown_rx,
        ));

        if let Ok(addr) = socket.local_addr() {
            info!("Discovery listening on {}", addr);
        }
        *self.socket.lock() = Some(socket);
        *self.receiver.lock() = Some(ReceiveLoop {
            shutdown_tx,
            handle,
            active,
        });
        *self.state.lock() = DiscoveryState::Listening;
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.receiver
            .lock()
            .as_ref()
            .is_some_and(|receiver| receiver.active.load(Ordering::Acquire))
    }

    /// Address the discovery socket is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|socket| socket.local_addr().ok())
    }

    pub fn message(&self) -> Bytes {
        self.shared.message.read().clone()
    }

    /// Rebuilds the announcement if the advertised endpoint changed.
    pub fn update_message(&self, endpoint: SocketAddr) -> bool {
        let mut current = self.shared.endpoint.write();
        if *current == endpoint {
            return false;
        }
        *current = endpoint;
        *self.shared.message.write() = DiscoveryMessage::new(self.shared.local_id, endpoint).encode();
        debug!("Discovery message now advertises {}", endpoint);
        true
    }

    /// Sends one announcement. Best effort, never retried.
    pub async fn send_discovery_message(&self) -> bool {
        let socket = self.socket.lock().clone();
        let Some(socket) = socket else {
            warn!("Discovery socket is not available");
            return false;
        };

        let target = broadcast_target(self.family, *self.port.lock());
        let message = self.message();
        match socket.send_to(&message, target).await {
            Ok(_) => {
                trace!("Sent discovery message to {}", target);
                true
            }
            Err(e) => {
                error!("Failed to send discovery message to {}: {}", target, e);
                false
            }
        }
    }

    /// Moves discovery to `port`. The previous receive loop gets
    /// [`REFRESH_TIMEOUT`] to exit before the new one starts regardless.
    pub async fn refresh_port(&self, port: u16) {
        {
            let mut state = self.state.lock();
            if *state == DiscoveryState::Disposed {
                return;
            }
            *state = DiscoveryState::Rebinding;
        }
        *self.port.lock() = port;

        let previous = self.receiver.lock().take();
        if let Some(previous) = &previous {
            let _ = previous.shutdown_tx.send(());
        }
        *self.socket.lock() = None;

        if let Some(previous) = previous {
            if tokio::time::timeout(REFRESH_TIMEOUT, previous.handle).await.is_err() {
                error!("Previous discovery loop did not stop within {:?}", REFRESH_TIMEOUT);
            }
        }

        if self.state() == DiscoveryState::Disposed {
            return;
        }
        self.bind_and_spawn(port);
    }

    /// Stops the receive loop and releases the socket. Terminal and safe to
    /// call more than once.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if *state == DiscoveryState::Disposed {
                return;
            }
            *state = DiscoveryState::Disposed;
        }

        if let Some(receiver) = self.receiver.lock().take() {
            let _ = receiver.shutdown_tx.send(());
            receiver.active.store(false, Ordering::Release);
        }
        *self.socket.lock() = None;
        info!("Discovery disposed");
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn broadcast_target(family: AddressFamily, port: u16) -> SocketAddr {
    match family {
        AddressFamily::Ipv4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
        AddressFamily::Ipv6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1)), port),
    }
}

fn create_socket(family: AddressFamily, port: u16) -> Result<UdpSocket> {
    let (domain, ip) = match family {
        AddressFamily::Ipv4 => (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        AddressFamily::Ipv6 => (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
    };
    let addr = SocketAddr::new(ip, port);

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetError::io("creating discovery socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetError::io("setting SO_REUSEADDR", e))?;
    if family == AddressFamily::Ipv4 {
        socket
            .set_broadcast(true)
            .map_err(|e| NetError::io("setting SO_BROADCAST", e))?;
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| NetError::io("setting non-blocking", e))?;
    socket
        .bind(&addr.into())
        .map_err(|source| NetError::Bind { addr, source })?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| NetError::io("registering discovery socket", e))
}

async fn receive_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    active: Arc<AtomicBool>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        shared.handle_datagram(&buf[..len], from);
                    }
                    Err(e) => {
                        warn!("Discovery receive failed, stopping: {}", e);
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    active.store(false, Ordering::Release);
    debug!("Discovery receive loop exited");
}
