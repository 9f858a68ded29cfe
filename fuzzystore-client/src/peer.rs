//! Master-side update link.

use crate::error::ClientError;
use fuzzystore_protocol::codec::encode_frame;
use fuzzystore_protocol::envelope::{seal_request, PUBKEY_LEN};
use fuzzystore_protocol::{Keypair, PeerCommand, UpdateChunk};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Pushes one revisioned batch to a replica's peer listener.
///
/// Every chunk is sealed for the replica's public key with the master's
/// keypair; the replica only accepts chunks from the master key it was
/// configured with. The replica sends nothing back, so delivery is
/// confirmed only by a clean close.
pub struct PeerLink {
    addr: SocketAddr,
    stream: TcpStream,
    replica_key: [u8; PUBKEY_LEN],
    keypair: Keypair,
}

impl PeerLink {
    pub async fn connect(
        addr: SocketAddr,
        replica_key: [u8; PUBKEY_LEN],
        keypair: Keypair,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true).ok();
        tracing::debug!("Peer link to {} open", addr);

        Ok(Self {
            addr,
            stream,
            replica_key,
            keypair,
        })
    }

    /// Sends `commands` as batch `revision` and closes the link. Returns how
    /// many commands were sent.
    pub async fn send_batch(
        mut self,
        revision: u64,
        commands: &[PeerCommand],
    ) -> Result<u64, ClientError> {
        for chunk in UpdateChunk::split(revision, commands) {
            let sealed = seal_request(&chunk.encode(), &self.replica_key, &self.keypair)?;
            let frame = encode_frame(&sealed)?;
            self.stream.write_all(&frame).await?;
        }
        self.stream.flush().await?;
        self.stream.shutdown().await?;

        tracing::debug!(
            "Peer link to {} closed after revision {} ({} updates)",
            self.addr,
            revision,
            commands.len()
        );
        Ok(commands.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzystore_protocol::{
        envelope, Command, Decoder, Keyring, Opcode, HASH_BYTES, MAX_CHUNK_COMMANDS,
    };
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_batch_sealed_in_chunks() {
        let replica = Keypair::generate();
        let master = Keypair::generate();
        let keyring = Keyring::new(vec![replica.clone()]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let receiver = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await.unwrap();

            let mut decoder = Decoder::new();
            decoder.extend(&raw);
            let mut chunks = Vec::new();
            while let Some(payload) = decoder.decode_payload().unwrap() {
                let opened = envelope::open(&payload, &keyring).unwrap();
                chunks.push((opened.peer_key, UpdateChunk::decode(&opened.payload).unwrap()));
            }
            chunks
        });

        let mut cmds = vec![
            PeerCommand::Normal(Command::new(Opcode::Write, 1, [3u8; HASH_BYTES]).with_value(2));
            MAX_CHUNK_COMMANDS
        ];
        cmds.push(PeerCommand::refresh(1, [4u8; HASH_BYTES], None));

        let link = PeerLink::connect(
            addr,
            replica.public_key(),
            master.clone(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(link.send_batch(9, &cmds).await.unwrap(), cmds.len() as u64);

        let chunks = receiver.await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|(key, _)| *key == master.public_key()));
        assert!(chunks.iter().all(|(_, chunk)| chunk.revision == 9));
        assert!(!chunks[0].1.last);
        assert!(chunks[1].1.last);
        assert_eq!(chunks[1].1.commands[0].opcode(), Opcode::Refresh);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens on a freshly released port.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let result = PeerLink::connect(
            addr,
            Keypair::generate().public_key(),
            Keypair::generate(),
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_err());
    }
}
