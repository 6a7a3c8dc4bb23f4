use std::{
    future::Future,
    io,
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::SinkExt;
use hislip_protocol::{DEFAULT_PORT, FatalErrorCode, Message, codec::MessageCodec};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{
    Subaddress,
    connection::{Connection, ConnectionState},
    registry::{Registry, RegistryError},
    session::{ConnectionId, SessionTable},
};

/// Two ASCII characters identifying the server vendor, sent in `AsyncInitializeResponse`.
pub const DEFAULT_VENDOR_ID: u16 = u16::from_be_bytes(*b"HS");

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port used by [`Server::run`]
    pub port: u16,
    /// Upper bound of concurrently open connections. Each session uses one or two.
    pub connections_max: usize,
    /// Worker threads of the runtime driving the server
    pub worker_threads_max: usize,
    /// Upper bound of the runtime's blocking threads, which run work handed off
    /// with `spawn_blocking`
    pub worker_queue_depth_max: usize,
    /// Largest payload accepted in a single message
    pub payload_size_max: u64,
    /// Timeout of a single read. Expiry is not fatal once the handshake completed.
    pub message_timeout: Duration,
    /// Timeout of a single write. Expiry closes the connection.
    pub write_timeout: Duration,
    /// Time a connection may take to complete its handshake
    pub liveness_timeout: Duration,
    /// Capacity of the session table
    pub max_sessions: usize,
    /// Whether sessions run in overlapped mode
    pub overlap_mode: bool,
    pub vendor_id: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connections_max: 64,
            worker_threads_max: 4,
            worker_queue_depth_max: 20,
            payload_size_max: 5 * 1024 * 1024,
            message_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(10),
            max_sessions: 32,
            overlap_mode: false,
            vendor_id: DEFAULT_VENDOR_ID,
        }
    }
}

/// State shared by the server and all of its connections.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) registry: Registry,
    pub(crate) sessions: SessionTable,
    next_connection: AtomicU64,
}

impl Shared {
    fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }
}

/// A HiSLIP server.
///
/// Sub-addresses must be registered before the server starts serving. Once
/// connections are running, [`Server::register_subaddress`] fails with
/// [`RegistryError::Sealed`].
pub struct Server {
    shared: Arc<Shared>,
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use hislip_server::server::Builder;
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .payload_size_max(1024 * 1024)
///     .message_timeout(Duration::from_secs(3))
///     .build();
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the port used by [`Server::run`]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the maximum number of concurrently open connections
    pub fn connections_max(mut self, max: usize) -> Self {
        self.config.connections_max = max;
        self
    }

    pub fn worker_threads_max(mut self, max: usize) -> Self {
        self.config.worker_threads_max = max;
        self
    }

    pub fn worker_queue_depth_max(mut self, max: usize) -> Self {
        self.config.worker_queue_depth_max = max;
        self
    }

    /// Set the highest payload size that this server is expected to receive.
    pub fn payload_size_max(mut self, size: u64) -> Self {
        self.config.payload_size_max = size;
        self
    }

    /// Set the per-message read timeout
    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.config.message_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Set the time a new connection may take to complete its handshake
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.config.liveness_timeout = timeout;
        self
    }

    /// Set the maximum number of concurrently open sessions
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    pub fn overlap_mode(mut self, overlapped: bool) -> Self {
        self.config.overlap_mode = overlapped;
        self
    }

    pub fn vendor_id(mut self, vendor_id: u16) -> Self {
        self.config.vendor_id = vendor_id;
        self
    }

    /// Build and return the server
    pub fn build(self) -> Server {
        Server::new(self.config)
    }
}

impl Server {
    pub fn new(config: Config) -> Server {
        Server {
            shared: Arc::new(Shared {
                sessions: SessionTable::new(config.max_sessions),
                registry: Registry::new(),
                config,
                next_connection: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.shared.sessions
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Registers `handler` to serve the sessions that request sub-address `name`.
    pub fn register_subaddress(
        &mut self,
        name: impl Into<String>,
        handler: impl Subaddress + 'static,
    ) -> Result<(), RegistryError> {
        let shared = Arc::get_mut(&mut self.shared).ok_or(RegistryError::Sealed)?;
        shared.registry.register(name, Arc::new(handler))
    }

    /// Listens on all interfaces on the configured port.
    pub async fn run(&self) -> io::Result<()> {
        self.listen((Ipv4Addr::UNSPECIFIED, self.shared.config.port))
            .await
    }

    pub async fn listen(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections from `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Accepts connections from `listener` until `shutdown` completes.
    /// Running connections are aborted on shutdown.
    pub async fn serve_until(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> io::Result<()> {
        log::info!(
            "Server listening for connections on {}",
            listener.local_addr()?
        );
        if self.shared.registry.is_empty() {
            log::warn!("No sub-address registered, every Initialize will be refused");
        }
        let limit = Arc::new(Semaphore::new(self.shared.config.connections_max));
        let refusals = Arc::new(Semaphore::new(REFUSALS_MAX));
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down, closing {} connections", connections.len());
                    connections.shutdown().await;
                    return Ok(());
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("Connection task failed: {}", e);
                    }
                }
                accepted = listener.accept() => {
                    let (tcp, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::error!("Connection error: {}", e);
                            continue;
                        }
                    };
                    log::info!("New client connection from {}", peer_addr);
                    let permit = match admit(&limit, &refusals) {
                        Admission::Serve(permit) => permit,
                        Admission::Refuse(refusal) => {
                            log::warn!("Refusing {}: too many open connections", peer_addr);
                            let write_timeout = self.shared.config.write_timeout;
                            connections.spawn(async move {
                                refuse(tcp, write_timeout).await;
                                drop(refusal);
                            });
                            continue;
                        }
                        Admission::Discard => {
                            log::warn!("Dropping {}: too many open connections", peer_addr);
                            continue;
                        }
                    };
                    if let Err(e) = tcp.set_nodelay(true) {
                        log::debug!("Could not disable Nagle's algorithm: {}", e);
                    }
                    let connection = self.connection(tcp);
                    connections.spawn(async move {
                        let state = connection.run().await;
                        log::info!("Connection from {} ended in state {:?}", peer_addr, state);
                        drop(permit);
                    });
                }
            }
        }
    }

    /// Serves a single established stream until the connection ends.
    pub async fn serve_connection<S>(&self, stream: S) -> ConnectionState
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.connection(stream).run().await
    }

    /// Binds a fresh protocol state machine to an established stream.
    pub fn connection<S>(&self, stream: S) -> Connection<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Connection::new(
            self.shared.clone(),
            self.shared.next_connection_id(),
            stream,
        )
    }
}

/// Upper bound of over-limit clients notified concurrently. Beyond it, sockets
/// are closed without a `FatalError`.
const REFUSALS_MAX: usize = 8;

#[derive(Debug)]
enum Admission {
    Serve(OwnedSemaphorePermit),
    Refuse(OwnedSemaphorePermit),
    Discard,
}

fn admit(limit: &Arc<Semaphore>, refusals: &Arc<Semaphore>) -> Admission {
    if let Ok(permit) = limit.clone().try_acquire_owned() {
        Admission::Serve(permit)
    } else if let Ok(refusal) = refusals.clone().try_acquire_owned() {
        Admission::Refuse(refusal)
    } else {
        Admission::Discard
    }
}

async fn refuse(tcp: TcpStream, write_timeout: Duration) {
    let mut framed = Framed::new(tcp, MessageCodec::new(0));
    let message = Message::fatal_error(
        FatalErrorCode::MaximumClientsExceeded,
        "Too many open connections",
    );
    match timeout(write_timeout, framed.send(message)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("Could not notify refused client: {}", e),
        Err(_) => log::debug!("Timed out notifying refused client"),
    }
}
