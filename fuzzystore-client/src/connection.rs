//! Connection management.

use crate::error::ClientError;
use fuzzystore_protocol::codec::encode_frame;
use fuzzystore_protocol::Decoder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (64 KiB).
pub const MAX_READ_BUFFER_SIZE: usize = 64 * 1024;

/// How requests reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// One datagram per request; lost requests are resent.
    Udp,
    /// Length-prefixed frames over one persistent connection.
    Tcp,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    pub transport: TransportKind,
    /// Connection timeout (TCP only).
    pub connect_timeout: Duration,
    /// Time to wait for each reply.
    pub request_timeout: Duration,
    /// Extra attempts after a timed out request.
    pub retries: u32,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr, transport: TransportKind) -> Self {
        Self {
            addr,
            transport,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(2),
            retries: 2,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

enum Link {
    Udp(UdpSocket),
    Tcp {
        stream: TcpStream,
        decoder: Decoder,
    },
}

/// A connection to a fuzzystore server.
///
/// Requests are serialized: one request is outstanding at a time.
pub struct Connection {
    config: ConnectionConfig,
    link: Mutex<Option<Link>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects to the server. UDP sockets are bound and connected to the
    /// server address; TCP opens the stream.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let link = self.open().await?;
        *self.link.lock().await = Some(link);
        Ok(())
    }

    async fn open(&self) -> Result<Link, ClientError> {
        tracing::debug!("Connecting to {} ({:?})", self.config.addr, self.config.transport);

        match self.config.transport {
            TransportKind::Udp => {
                let local: SocketAddr = if self.config.addr.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(self.config.addr).await?;
                Ok(Link::Udp(socket))
            }
            TransportKind::Tcp => {
                let stream = tokio::time::timeout(
                    self.config.connect_timeout,
                    TcpStream::connect(self.config.addr),
                )
                .await
                .map_err(|_| ClientError::Timeout)??;
                stream.set_nodelay(true).ok();
                Ok(Link::Tcp {
                    stream,
                    decoder: Decoder::new(),
                })
            }
        }
    }

    /// Returns whether a socket is open.
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        if let Some(Link::Tcp { mut stream, .. }) = self.link.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    /// Sends `payload` and returns the first reply `accept` recognizes.
    ///
    /// Replies `accept` rejects (late answers to earlier requests) are
    /// skipped. UDP requests are resent up to `retries` times on timeout; a
    /// TCP connection that fails is reopened once per attempt.
    pub async fn exchange<T>(
        &self,
        payload: &[u8],
        mut accept: impl FnMut(&[u8]) -> Option<T>,
    ) -> Result<T, ClientError> {
        let mut guard = self.link.lock().await;
        let mut attempt = 0;

        loop {
            if guard.is_none() {
                *guard = Some(self.open().await?);
            }
            let link = guard.as_mut().ok_or(ClientError::NotConnected)?;

            let result = tokio::time::timeout(
                self.config.request_timeout,
                round_trip(link, payload, self.config.read_buffer_size, &mut accept),
            )
            .await
            .unwrap_or(Err(ClientError::Timeout));

            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    tracing::debug!(
                        "Request to {} failed ({}), retry {}/{}",
                        self.config.addr,
                        e,
                        attempt,
                        self.config.retries
                    );
                    if matches!(guard.as_ref(), Some(Link::Tcp { .. })) {
                        *guard = None;
                    }
                }
                Err(e) => {
                    if matches!(guard.as_ref(), Some(Link::Tcp { .. })) {
                        *guard = None;
                    }
                    return Err(e);
                }
            }
        }
    }
}

async fn round_trip<T>(
    link: &mut Link,
    payload: &[u8],
    buffer_size: usize,
    accept: &mut impl FnMut(&[u8]) -> Option<T>,
) -> Result<T, ClientError> {
    let mut buf = vec![0u8; buffer_size];

    match link {
        Link::Udp(socket) => {
            socket.send(payload).await?;
            loop {
                let n = socket.recv(&mut buf).await?;
                match accept(&buf[..n]) {
                    Some(reply) => return Ok(reply),
                    None => tracing::debug!("Ignoring unexpected {} byte datagram", n),
                }
            }
        }
        Link::Tcp { stream, decoder } => {
            stream.write_all(&encode_frame(payload)?).await?;
            loop {
                while let Some(frame) = decoder.decode_payload()? {
                    match accept(&frame[..]) {
                        Some(reply) => return Ok(reply),
                        None => tracing::debug!("Ignoring unexpected {} byte frame", frame.len()),
                    }
                }

                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Err(ClientError::ConnectionClosed);
                }
                decoder.extend(&buf[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:11335".parse().unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new(addr(), TransportKind::Udp);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.retries, 2);
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ConnectionConfig::new(addr(), TransportKind::Tcp).with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new(addr(), TransportKind::Tcp)
            .with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_udp_retries_then_times_out() {
        // A bound socket that never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ConnectionConfig::new(silent.local_addr().unwrap(), TransportKind::Udp)
            .with_request_timeout(Duration::from_millis(20))
            .with_retries(2);
        let conn = Connection::new(config);

        let err = conn
            .exchange(b"hello", |_| Some(()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));

        let mut buf = [0u8; 16];
        let mut received = 0;
        while let Ok(Ok((n, _))) =
            tokio::time::timeout(Duration::from_millis(50), silent.recv_from(&mut buf)).await
        {
            assert_eq!(&buf[..n], b"hello");
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn test_udp_skips_unaccepted_replies() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(b"stale", peer).await.unwrap();
            server.send_to(b"fresh", peer).await.unwrap();
        });

        let conn = Connection::new(ConnectionConfig::new(addr, TransportKind::Udp));
        let reply = conn
            .exchange(b"req", |buf| (buf == b"fresh").then(|| buf.to_vec()))
            .await
            .unwrap();
        assert_eq!(reply, b"fresh");
    }

    #[tokio::test]
    async fn test_tcp_frames() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut decoder = Decoder::new();
            let mut buf = [0u8; 64];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                decoder.extend(&buf[..n]);
                while let Some(payload) = decoder.decode_payload().unwrap() {
                    let mut echoed = payload.to_vec();
                    echoed.reverse();
                    stream.write_all(&encode_frame(&echoed).unwrap()).await.unwrap();
                }
            }
        });

        let conn = Connection::new(ConnectionConfig::new(addr, TransportKind::Tcp));
        conn.connect().await.unwrap();
        assert!(conn.is_connected().await);

        for word in [&b"abc"[..], &b"xyz"[..]] {
            let reply = conn.exchange(word, |buf| Some(buf.to_vec())).await.unwrap();
            let mut expected = word.to_vec();
            expected.reverse();
            assert_eq!(reply, expected);
        }

        conn.close().await.unwrap();
        assert!(!conn.is_connected().await);
    }
}
