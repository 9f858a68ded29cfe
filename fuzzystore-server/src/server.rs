//! UDP and TCP server implementation.

use crate::config::NetworkConfig;
use crate::error::ServerError;
use crate::handler::CommandHandler;
use crate::metrics::Metrics;
use crate::peer::run_peer_listener;
use crate::session::{RequestContext, Session, Transport};
use crate::updates::UpdateQueue;
use fuzzystore_protocol::codec::encode_frame;
use fuzzystore_protocol::{Decoder, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// UDP address to bind to.
    pub udp_bind: SocketAddr,
    /// Optional TCP address for framed stream clients.
    pub tcp_bind: Option<SocketAddr>,
    /// Optional TCP address for master update pushes.
    pub peer_bind: Option<SocketAddr>,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent TCP connections.
    pub max_connections: usize,
    /// Tasks reading the shared UDP socket.
    pub udp_workers: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("udp_bind", &self.udp_bind)
            .field("tcp_bind", &self.tcp_bind)
            .field("peer_bind", &self.peer_bind)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("udp_workers", &self.udp_workers)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl ServerConfig {
    pub fn new(udp_bind: SocketAddr) -> Self {
        Self {
            udp_bind,
            tcp_bind: None,
            peer_bind: None,
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            udp_workers: 4,
            metrics: None,
        }
    }

    pub fn from_network(network: &NetworkConfig) -> Self {
        Self {
            udp_bind: network.bind_addr,
            tcp_bind: network.tcp_bind,
            peer_bind: network.peer_bind,
            idle_timeout: network.idle_timeout(),
            max_connections: network.max_connections,
            udp_workers: network.udp_workers.max(1),
            metrics: None,
        }
    }

    pub fn with_tcp(mut self, addr: SocketAddr) -> Self {
        self.tcp_bind = Some(addr);
        self
    }

    pub fn with_peer(mut self, addr: SocketAddr) -> Self {
        self.peer_bind = Some(addr);
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Bound sockets, ready to serve.
pub struct Listeners {
    udp: Arc<UdpSocket>,
    tcp: Option<TcpListener>,
    peer: Option<TcpListener>,
}

impl Listeners {
    pub fn udp_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.udp.local_addr()?)
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.as_ref().and_then(|l| l.local_addr().ok())
    }
}

/// Fuzzy storage server.
pub struct Server {
    config: ServerConfig,
    handler: Arc<CommandHandler>,
    updates: Option<Arc<UpdateQueue>>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, handler: CommandHandler) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let handler = match config.metrics {
            Some(ref metrics) => handler.with_metrics(metrics.clone()),
            None => handler,
        };
        Self {
            config,
            handler: Arc::new(handler),
            updates: None,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Sets the queue receiving master updates on the peer listener.
    pub fn with_updates(mut self, updates: Arc<UpdateQueue>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Binds every configured socket.
    pub async fn bind(&self) -> Result<Listeners, ServerError> {
        let udp = UdpSocket::bind(self.config.udp_bind).await?;
        let tcp = match self.config.tcp_bind {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let peer = match self.config.peer_bind {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        Ok(Listeners {
            udp: Arc::new(udp),
            tcp,
            peer,
        })
    }

    /// Binds and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Serves already bound sockets until shutdown.
    pub async fn serve(&self, listeners: Listeners) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            "Server listening on {}/udp ({} workers)",
            listeners.udp_addr()?,
            self.config.udp_workers
        );
        for id in 0..self.config.udp_workers.max(1) {
            tasks.spawn(udp_worker(
                id,
                listeners.udp.clone(),
                self.handler.clone(),
                self.stats.clone(),
                self.shutdown.subscribe(),
            ));
        }

        if let Some(listener) = listeners.tcp {
            if let Ok(addr) = listener.local_addr() {
                tracing::info!("Server listening on {}/tcp", addr);
            }
            tasks.spawn(accept_loop(
                listener,
                self.handler.clone(),
                self.stats.clone(),
                self.config.clone(),
                self.shutdown.clone(),
                self.shutdown.subscribe(),
            ));
        }

        if let Some(listener) = listeners.peer {
            match &self.updates {
                Some(queue) => {
                    tasks.spawn(run_peer_listener(
                        listener,
                        Arc::new(self.handler.policy().clone()),
                        Arc::new(self.handler.keyring().clone()),
                        queue.clone(),
                        self.config.idle_timeout,
                        self.shutdown.clone(),
                        self.shutdown.subscribe(),
                    ));
                }
                None => tracing::warn!("Peer listener configured without an update queue"),
            }
        }

        let _ = shutdown_rx.recv().await;
        tracing::info!("Server shutting down");
        while tasks.join_next().await.is_some() {}

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a sender that triggers shutdown when sent to.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn handler(&self) -> &Arc<CommandHandler> {
        &self.handler
    }
}

async fn udp_worker(
    id: usize,
    socket: Arc<UdpSocket>,
    handler: Arc<CommandHandler>,
    stats: Arc<ServerStats>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (n, addr) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP errors from earlier sends surface here on some platforms
                        tracing::debug!("UDP worker {} receive error: {}", id, e);
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };

                stats.requests_total.fetch_add(1, Ordering::Relaxed);
                let ctx = RequestContext::new(addr, Transport::Udp);
                match handler.handle(&ctx, &buf[..n]).into_reply() {
                    Some(reply) => {
                        if let Err(e) = socket.send_to(&reply, addr).await {
                            tracing::debug!("[{}] UDP send error: {}", addr, e);
                            stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    None => {
                        stats.dropped_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("UDP worker {} stopping", id);
                break;
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<CommandHandler>,
    stats: Arc<ServerStats>,
    config: ServerConfig,
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if stats.connections_active.load(Ordering::Relaxed)
                            >= config.max_connections as u64
                        {
                            tracing::warn!("Connection limit reached, rejecting {}", addr);
                            continue;
                        }

                        stats.connections_total.fetch_add(1, Ordering::Relaxed);
                        stats.connections_active.fetch_add(1, Ordering::Relaxed);
                        if let Some(ref metrics) = config.metrics {
                            metrics.connections_total.inc();
                            metrics.connections_active.inc();
                        }

                        let handler = handler.clone();
                        let stats = stats.clone();
                        let config = config.clone();
                        let mut conn_shutdown = shutdown.subscribe();

                        tokio::spawn(async move {
                            let result = handle_connection(
                                stream,
                                addr,
                                &handler,
                                &stats,
                                config.idle_timeout,
                                &mut conn_shutdown,
                            )
                            .await;

                            if let Err(e) = result {
                                tracing::debug!("Connection {} error: {}", addr, e);
                                stats.errors_total.fetch_add(1, Ordering::Relaxed);
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            if let Some(ref metrics) = config.metrics {
                                metrics.connections_active.dec();
                            }

                            tracing::debug!("Client disconnected: {}", addr);
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

/// Serves framed requests on one stream connection.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    handler: &CommandHandler,
    stats: &ServerStats,
    idle_timeout: Duration,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    tracing::debug!("Client connected: {}", addr);

    let session = Session::new(addr);
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        tracing::debug!(
                            "[{}] Connection closed after {} requests",
                            addr,
                            session.request_count()
                        );
                        return Ok(());
                    }
                    Ok(n) => decoder.extend(&buf[..n]),
                    Err(e) => return Err(ServerError::Io(e)),
                }
            }

            _ = tokio::time::sleep(idle_timeout) => {
                if session.idle_duration() >= idle_timeout {
                    tracing::debug!("[{}] Idle timeout", addr);
                    return Ok(());
                }
            }

            _ = shutdown.recv() => {
                return Err(ServerError::ShuttingDown);
            }
        }

        while let Some(payload) = decoder.decode_payload()? {
            stats.requests_total.fetch_add(1, Ordering::Relaxed);
            let ctx = session.record_request();
            match handler.handle(&ctx, &payload).into_reply() {
                Some(reply) => stream.write_all(&encode_frame(&reply)?).await?,
                None => {
                    stats.dropped_total.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}
