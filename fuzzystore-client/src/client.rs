//! High-level client API.

use crate::connection::{Connection, ConnectionConfig, TransportKind};
use crate::error::ClientError;
use fuzzystore_protocol::envelope::{self, decode_key_hex, PUBKEY_LEN};
use fuzzystore_protocol::{
    decode_reply, Command, DecodedCommand, Digest, Extensions, Keypair, KeyId, Opcode, Reply,
    Shingles, HASH_BYTES, PROTOCOL_VERSION, VERSION_MASK,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    /// Server public key. When set, every request is encrypted for it.
    pub server_key: Option<[u8; PUBKEY_LEN]>,
    /// Local keypair for encryption; generated when absent.
    pub keypair: Option<Keypair>,
    /// Protocol version sent in requests. Versions below 4 get short replies.
    pub version: u8,
    /// Extensions appended to every request.
    pub extensions: Extensions,
}

impl ClientConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            server_key: None,
            keypair: None,
            version: PROTOCOL_VERSION,
            extensions: Extensions::new(),
        }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(ConnectionConfig::new(addr, TransportKind::Udp))
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(ConnectionConfig::new(addr, TransportKind::Tcp))
    }

    /// Encrypts requests for the hex-encoded server public key.
    pub fn with_server_key(mut self, public_hex: &str) -> Result<Self, ClientError> {
        self.server_key = Some(decode_key_hex(public_hex)?);
        Ok(self)
    }

    pub fn with_keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version & VERSION_MASK;
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connection = self.connection.with_request_timeout(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.connection = self.connection.with_retries(retries);
        self
    }
}

/// Encryption state for one server key.
///
/// Replies carry no key material, so the server key used for a request is
/// kept here to open its reply.
struct Sealer {
    server_key: [u8; PUBKEY_LEN],
    local: Keypair,
}

/// High-level client for fuzzystore.
pub struct Client {
    conn: Connection,
    sealer: Option<Sealer>,
    version: u8,
    extensions: Vec<u8>,
    next_tag: AtomicU32,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        let sealer = config.server_key.map(|server_key| Sealer {
            server_key,
            local: config.keypair.clone().unwrap_or_else(Keypair::generate),
        });

        Self {
            conn: Connection::new(config.connection),
            sealer,
            version: config.version,
            extensions: config.extensions.encode().to_vec(),
            next_tag: AtomicU32::new(rand::random()),
        }
    }

    /// Connects to the server. Requests connect lazily if this is skipped.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Key id requests are encrypted for, if encryption is on.
    pub fn server_key_id(&self) -> Option<KeyId> {
        self.sealer
            .as_ref()
            .map(|s| KeyId::for_public(&s.server_key))
    }

    /// Looks up a digest, optionally with shingles for near matching.
    pub async fn check(
        &self,
        flag: u8,
        digest: &Digest,
        shingles: Option<&Shingles>,
    ) -> Result<Reply, ClientError> {
        self.send(Command::new(Opcode::Check, flag, *digest), shingles.copied())
            .await
    }

    /// Adds `value` to the weight of a digest.
    pub async fn write(
        &self,
        flag: u8,
        digest: &Digest,
        value: i32,
        shingles: Option<&Shingles>,
    ) -> Result<Reply, ClientError> {
        let cmd = Command::new(Opcode::Write, flag, *digest).with_value(value);
        self.send(cmd, shingles.copied()).await
    }

    /// Like [`Client::write`], stored as a short-lived weak entry.
    pub async fn write_weak(
        &self,
        flag: u8,
        digest: &Digest,
        value: i32,
        shingles: Option<&Shingles>,
    ) -> Result<Reply, ClientError> {
        let cmd = Command::new(Opcode::Write, flag, *digest)
            .with_value(value)
            .weak();
        self.send(cmd, shingles.copied()).await
    }

    pub async fn delete(&self, flag: u8, digest: &Digest) -> Result<Reply, ClientError> {
        self.send(Command::new(Opcode::Del, flag, *digest), None).await
    }

    /// Returns store statistics. The entry count is carried in `flag`.
    pub async fn stat(&self) -> Result<Reply, ClientError> {
        self.send(Command::new(Opcode::Stat, 0, [0u8; HASH_BYTES]), None).await
    }

    /// Pings the server; `value` is echoed back.
    pub async fn ping(&self, flag: u8, value: i32) -> Result<Reply, ClientError> {
        let cmd = Command::new(Opcode::Ping, flag, [0u8; HASH_BYTES]).with_value(value);
        self.send(cmd, None).await
    }

    async fn send(&self, cmd: Command, shingles: Option<Shingles>) -> Result<Reply, ClientError> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let mut cmd = cmd.with_tag(tag);
        cmd.version = (cmd.version & !VERSION_MASK) | self.version;

        let mut payload = DecodedCommand::new(cmd, shingles).encode().to_vec();
        payload.extend_from_slice(&self.extensions);

        let request = match &self.sealer {
            Some(s) => envelope::seal_request(&payload, &s.server_key, &s.local)?,
            None => payload,
        };

        self.conn
            .exchange(&request, |buf| match self.open(buf) {
                Ok(reply) if reply.tag == tag => Some(reply),
                Ok(reply) => {
                    tracing::debug!("Reply tag mismatch: got {}, want {}", reply.tag, tag);
                    None
                }
                Err(e) => {
                    tracing::debug!("Undecodable reply: {}", e);
                    None
                }
            })
            .await
    }

    fn open(&self, buf: &[u8]) -> Result<Reply, ClientError> {
        let plain;
        let body = match &self.sealer {
            Some(s) => {
                plain = envelope::open_reply(buf, &s.server_key, &s.local)?;
                &plain[..]
            }
            None => buf,
        };
        Ok(decode_reply(body)?.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzystore_protocol::{decode_command, encode_reply, split_request, Epoch};
    use tokio::net::UdpSocket;

    /// Answers every datagram by echoing its value, first with a wrong tag.
    async fn echo_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
                let (fixed, _) = split_request(&buf[..n]).unwrap();
                let cmd = decode_command(fixed).unwrap().command;
                let epoch = cmd.epoch().unwrap();

                let stale = Reply::ok(cmd.tag.wrapping_sub(1), -1, 0);
                socket
                    .send_to(&encode_reply(&stale, epoch), peer)
                    .await
                    .unwrap();
                let reply = Reply::ok(cmd.tag, cmd.value, u32::from(cmd.flag));
                socket
                    .send_to(&encode_reply(&reply, epoch), peer)
                    .await
                    .unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tag_mismatch_skipped() {
        let client = Client::new(ClientConfig::udp(echo_server().await));
        let reply = client.ping(3, 77).await.unwrap();
        assert_eq!(reply.value, 77);
        assert_eq!(reply.flag, 3);

        let reply = client.ping(3, 78).await.unwrap();
        assert_eq!(reply.value, 78);
    }

    #[tokio::test]
    async fn test_old_version_request() {
        let client = Client::new(ClientConfig::udp(echo_server().await).with_version(2));
        let reply = client.write(1, &[1u8; HASH_BYTES], 5, None).await.unwrap();
        assert_eq!(reply.value, 5);
        assert_eq!(reply.digest, [0u8; HASH_BYTES]);
        assert_eq!(Epoch::from_version(2).unwrap(), Epoch::Epoch10);
    }

    #[test]
    fn test_server_key_config() {
        let server = Keypair::generate();
        let config = ClientConfig::udp("127.0.0.1:11335".parse().unwrap())
            .with_server_key(&server.public_hex())
            .unwrap();
        let client = Client::new(config);
        assert_eq!(client.server_key_id(), Some(server.key_id()));

        assert!(ClientConfig::udp("127.0.0.1:11335".parse().unwrap())
            .with_server_key("not hex")
            .is_err());
    }
}
