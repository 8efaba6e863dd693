//! # Peer Registry
//!
//! The live connection set shared by the listener, discovery and progress
//! tracking. It holds at most one live [`Connection`] per remote device and
//! broadcasts a [`ConnectionEvent`] whenever membership changes.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info};

use crate::cipher::EncryptedStream;
use crate::device::DeviceId;
use crate::error::{NetError, Result};
use crate::progress::ProgressSample;

const EVENT_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Membership change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Added(DeviceId),
    Removed(DeviceId),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An encrypted, registered link to one remote device.
///
/// The content protocol reads and writes through [`Connection::send`] and
/// [`Connection::recv`] and reports its transfer state with
/// [`Connection::set_progress`]. A stream error closes the connection and
/// removes it from the registry. Closing wakes any `send` or `recv` still
/// waiting on the stream.
pub struct Connection {
    id: DeviceId,
    remote_addr: Option<SocketAddr>,
    reader: tokio::sync::Mutex<BoxedReader>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    progress: Mutex<ProgressSample>,
    closed: AtomicBool,
    closing: Notify,
    registry: OnceLock<Weak<PeerRegistry>>,
}

impl Connection {
    pub fn new<S>(id: DeviceId, remote_addr: Option<SocketAddr>, stream: EncryptedStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer): (ReadHalf<_>, WriteHalf<_>) = tokio::io::split(stream);
        Self {
            id,
            remote_addr,
            reader: tokio::sync::Mutex::new(Box::new(reader)),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            progress: Mutex::new(ProgressSample::default()),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
            registry: OnceLock::new(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current transfer state, as last reported by the content protocol.
    pub fn progress(&self) -> ProgressSample {
        *self.progress.lock()
    }

    pub fn set_progress(&self, sample: ProgressSample) {
        *self.progress.lock() = sample;
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(not_connected("sending"));
        }

        let result = tokio::select! {
            result = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(data).await?;
                writer.flush().await
            } => result,
            _ = self.closed_signal() => return Err(not_connected("sending")),
        };

        result.map_err(|e| {
            self.mark_closed();
            NetError::io(format!("sending to {}", self.id.short()), e)
        })
    }

    /// Reads into `buf`; a zero-length read means the peer hung up.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(not_connected("receiving"));
        }

        let result = tokio::select! {
            result = async { self.reader.lock().await.read(buf).await } => result,
            _ = self.closed_signal() => return Err(not_connected("receiving")),
        };

        match result {
            Ok(0) if !buf.is_empty() => {
                self.mark_closed();
                Ok(0)
            }
            Ok(read) => Ok(read),
            Err(e) => {
                self.mark_closed();
                Err(NetError::io(format!("receiving from {}", self.id.short()), e))
            }
        }
    }

    /// Drops the connection from its registry, wakes pending calls and shuts
    /// the stream down. Repeated calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.notify_waiters();
        self.detach();

        let shutdown = async { self.writer.lock().await.shutdown().await };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shutdown of {} failed: {}", self.id, e),
            Err(_) => debug!("Shutdown of {} timed out", self.id),
        }
    }

    /// Resolves once the connection is closed, including closes that happened
    /// before the call.
    async fn closed_signal(&self) {
        let notified = self.closing.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Connection {} failed, closing", self.id);
            self.closing.notify_waiters();
            self.detach();
        }
    }

    fn detach(&self) {
        if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
            registry.remove_exact(self);
        }
    }
}

fn not_connected(context: &str) -> NetError {
    NetError::io(context, std::io::ErrorKind::NotConnected.into())
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Thread-safe connection set plus the pairing policy used by discovery.
pub struct PeerRegistry {
    connections: RwLock<HashMap<DeviceId, Arc<Connection>>>,
    known_devices: RwLock<HashSet<DeviceId>>,
    allow_pairing: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl PeerRegistry {
    pub fn new(allow_pairing: bool, known_devices: impl IntoIterator<Item = DeviceId>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            known_devices: RwLock::new(known_devices.into_iter().collect()),
            allow_pairing: AtomicBool::new(allow_pairing),
            events,
        })
    }

    /// Registers `connection` unless a live one for the same device exists.
    pub fn add_connection(self: &Arc<Self>, connection: Arc<Connection>) -> bool {
        let id = connection.id();
        if connection.is_closed() {
            return false;
        }

        let replaced = {
            let mut connections = self.connections.write();
            match connections.get(&id) {
                Some(existing) if !existing.is_closed() => return false,
                _ => {}
            }
            let _ = connection.registry.set(Arc::downgrade(self));
            // a close before this point found no registry to detach from
            if connection.is_closed() {
                return false;
            }
            connections.insert(id, connection).is_some()
        };

        if replaced {
            let _ = self.events.send(ConnectionEvent::Removed(id));
        }
        info!("Connection to {} registered", id);
        let _ = self.events.send(ConnectionEvent::Added(id));
        true
    }

    pub fn remove_connection(&self, id: &DeviceId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(id);
        if removed.is_some() {
            info!("Connection to {} removed", id);
            let _ = self.events.send(ConnectionEvent::Removed(*id));
        }
        removed
    }

    /// Removes the entry only if it is this very connection, so a failing old
    /// link never evicts its replacement.
    fn remove_exact(&self, connection: &Connection) {
        let id = connection.id();
        let removed = {
            let mut connections = self.connections.write();
            match connections.get(&id) {
                Some(current) if std::ptr::eq(current.as_ref(), connection) => connections.remove(&id),
                _ => None,
            }
        };
        if removed.is_some() {
            info!("Connection to {} closed", id);
            let _ = self.events.send(ConnectionEvent::Removed(id));
        }
    }

    pub fn try_get_connection(&self, id: &DeviceId) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .get(id)
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    pub fn does_connection_exist(&self, id: &DeviceId) -> bool {
        self.try_get_connection(id).is_some()
    }

    /// Ids of the live connections.
    pub fn connection_ids(&self) -> Vec<DeviceId> {
        self.connections
            .read()
            .iter()
            .filter(|(_, connection)| !connection.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .filter(|connection| !connection.is_closed())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().values().filter(|c| !c.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn allow_pairing(&self) -> bool {
        self.allow_pairing.load(Ordering::Acquire)
    }

    pub fn set_allow_pairing(&self, allow: bool) {
        self.allow_pairing.store(allow, Ordering::Release);
    }

    pub fn is_known(&self, id: &DeviceId) -> bool {
        self.known_devices.read().contains(id)
    }

    pub fn add_known_device(&self, id: DeviceId) -> bool {
        self.known_devices.write().insert(id)
    }

    pub fn known_devices(&self) -> Vec<DeviceId> {
        self.known_devices.read().iter().copied().collect()
    }
}
