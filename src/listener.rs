//! # Connection Listener
//!
//! Accepts inbound TCP connections and dials outbound ones, runs the secure
//! channel handshake and hands every resulting [`Connection`] to the
//! [`PeerRegistry`].
//!
//! The dialing side always writes its 16-byte device id first, in the clear,
//! and then acts as the handshake initiator. The accepting side reads that
//! preamble and responds. Per-connection failures are logged and dropped; the
//! accept loop keeps running until [`ConnectionListener::stop`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{AddressFamily, Config};
use crate::device::DeviceId;
use crate::discovery::PeerConnector;
use crate::error::{NetError, Result};
use crate::handshake;
use crate::keys::KeyInfo;
use crate::registry::{Connection, PeerRegistry};
use crate::wire::{read_device_id, write_device_id};

/// Upper bound for establishing an outbound TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound for the identity preamble plus the key exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where the listener binds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenerSettings {
    pub address_family: AddressFamily,
    /// Bypasses LAN address detection when set.
    pub listener_address: Option<IpAddr>,
}

impl From<&Config> for ListenerSettings {
    fn from(config: &Config) -> Self {
        Self {
            address_family: config.address_family,
            listener_address: config.listener_address,
        }
    }
}

impl ListenerSettings {
    pub fn loopback() -> Self {
        Self {
            address_family: AddressFamily::Ipv4,
            listener_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        }
    }

    /// Explicit override, else the first private LAN address of the family,
    /// else the unspecified address.
    pub fn bind_address(&self) -> IpAddr {
        self.listener_address
            .or_else(|| lan_address(self.address_family))
            .unwrap_or_else(|| unspecified(self.address_family))
    }
}

/// First private (RFC 1918 / unique local) address of `family`.
pub fn lan_address(family: AddressFamily) -> Option<IpAddr> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            debug!("Could not enumerate network interfaces: {}", e);
            return None;
        }
    };

    interfaces
        .into_iter()
        .map(|(_, ip)| ip)
        .find(|ip| is_private(family, ip))
}

fn is_private(family: AddressFamily, ip: &IpAddr) -> bool {
    match (family, ip) {
        (AddressFamily::Ipv4, IpAddr::V4(v4)) => v4.is_private(),
        (AddressFamily::Ipv6, IpAddr::V6(v6)) => (v6.segments()[0] & 0xfe00) == 0xfc00,
        _ => false,
    }
}

fn unspecified(family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// State shared by the accept loop, its per-connection tasks and `connect`.
struct Shared {
    local_id: DeviceId,
    key: KeyInfo,
    registry: Arc<PeerRegistry>,
}

impl Shared {
    async fn accept_inbound(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<bool> {
        handshake::apply_socket_policy(&stream)?;

        let (remote_id, secure) = timeout(HANDSHAKE_TIMEOUT, async {
            let mut stream = stream;
            let remote_id = read_device_id(&mut stream).await?;
            let secure = handshake::respond(stream).await?;
            Ok::<_, NetError>((remote_id, secure))
        })
        .await
        .map_err(|_| NetError::timeout(format!("inbound handshake with {remote_addr}")))??;

        self.register(Connection::new(remote_id, Some(remote_addr), secure)).await
    }

    async fn dial(&self, remote_id: DeviceId, address: SocketAddr) -> Result<bool> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| NetError::timeout(format!("connecting to {address}")))?
            .map_err(|e| NetError::io(format!("connecting to {address}"), e))?;
        handshake::apply_socket_policy(&stream)?;

        let secure = timeout(HANDSHAKE_TIMEOUT, async {
            let mut stream = stream;
            write_device_id(&mut stream, &self.local_id).await?;
            handshake::initiate(stream, &self.key).await
        })
        .await
        .map_err(|_| NetError::timeout(format!("outbound handshake with {address}")))??;

        self.register(Connection::new(remote_id, Some(address), secure)).await
    }

    async fn register(&self, connection: Connection) -> Result<bool> {
        let connection = Arc::new(connection);
        if self.registry.add_connection(connection.clone()) {
            return Ok(true);
        }

        debug!("Already connected to {}, dropping duplicate", connection.id());
        connection.close().await;
        Ok(false)
    }
}

/// TCP endpoint of this peer.
pub struct ConnectionListener {
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    active: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionListener {
    /// Binds on an OS-assigned port and starts accepting. A bind failure is
    /// logged and yields an inactive listener that can still dial out.
    pub async fn start(
        settings: ListenerSettings,
        local_id: DeviceId,
        key: KeyInfo,
        registry: Arc<PeerRegistry>,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            local_id,
            key,
            registry,
        });
        let active = Arc::new(AtomicBool::new(false));

        let bind_addr = SocketAddr::new(settings.bind_address(), 0);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!("{}", NetError::Bind { addr: bind_addr, source });
                return Arc::new(Self {
                    shared,
                    local_addr: None,
                    active,
                    shutdown_tx: Mutex::new(None),
                    handle: Mutex::new(None),
                });
            }
        };

        let local_addr = listener.local_addr().ok();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        active.store(true, Ordering::Release);
        let handle = tokio::spawn(accept_loop(listener, shared.clone(), active.clone(), shutdown_rx));

        if let Some(addr) = local_addr {
            info!("Listening for peers on {}", addr);
        }

        Arc::new(Self {
            shared,
            local_addr,
            active,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The endpoint other peers should dial. A wildcard bind is replaced by
    /// the host's primary address.
    pub fn advertised_endpoint(&self) -> Option<SocketAddr> {
        let addr = self.local_addr?;
        if !addr.ip().is_unspecified() {
            return Some(addr);
        }

        let ip = match addr.ip() {
            IpAddr::V4(_) => local_ip_address::local_ip(),
            IpAddr::V6(_) => local_ip_address::local_ipv6(),
        };
        match ip {
            Ok(ip) => Some(SocketAddr::new(ip, addr.port())),
            Err(e) => {
                warn!("Could not determine an address to advertise: {}", e);
                Some(addr)
            }
        }
    }

    pub fn local_id(&self) -> DeviceId {
        self.shared.local_id
    }

    /// Dials `address`, expecting `remote_id` on the other end. Returns
    /// `Ok(false)` when a live connection to that device already exists.
    pub async fn connect(&self, remote_id: DeviceId, address: SocketAddr) -> Result<bool> {
        match self.shared.dial(remote_id, address).await {
            Ok(registered) => Ok(registered),
            Err(e) => {
                debug!("Failed to connect to {} at {}: {}", remote_id, address, e);
                Err(e)
            }
        }
    }

    /// Stops accepting. Connections already registered stay open.
    pub fn stop(&self) {
        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(());
            info!("Connection listener stopping");
        }
    }

    /// Stops accepting and waits for the accept loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl PeerConnector for ConnectionListener {
    async fn connect(&self, remote_id: DeviceId, address: SocketAddr) -> Result<bool> {
        ConnectionListener::connect(self, remote_id, address).await
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    active: Arc<AtomicBool>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            match shared.accept_inbound(stream, remote_addr).await {
                                Ok(true) => debug!("Accepted connection from {}", remote_addr),
                                Ok(false) => {}
                                Err(e) if e.is_transient() => {
                                    debug!("Dropped inbound connection from {}: {}", remote_addr, e)
                                }
                                Err(e) => warn!("Dropped inbound connection from {}: {}", remote_addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    active.store(false, Ordering::Release);
    debug!("Accept loop exited");
}
