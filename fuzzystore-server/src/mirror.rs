//! Forwarding of local updates to replicas.
//!
//! The update queue hands every applied local batch, tagged with the new
//! local revision, to [`Mirror::run`], which pushes it to each configured
//! replica over a sealed [`PeerLink`].

use crate::config::{ConfigError, UpdatesConfig};
use fuzzystore_client::{ClientError, PeerLink};
use fuzzystore_protocol::envelope::PUBKEY_LEN;
use fuzzystore_protocol::{Keypair, Keyring, PeerCommand};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

/// A locally applied batch waiting to be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorBatch {
    pub revision: u64,
    pub commands: Vec<PeerCommand>,
}

/// A replica receiving our updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub addr: SocketAddr,
    /// The replica's server public key.
    pub public_key: [u8; PUBKEY_LEN],
}

/// Pushes local batches to replicas.
pub struct Mirror {
    targets: Vec<MirrorTarget>,
    keypair: Keypair,
    timeout: Duration,
}

impl Mirror {
    pub fn new(targets: Vec<MirrorTarget>, keypair: Keypair, timeout: Duration) -> Self {
        Self {
            targets,
            keypair,
            timeout,
        }
    }

    /// Builds the forwarder from config, sealing with the first server key.
    /// Returns `None` when no mirrors are configured.
    pub fn from_config(
        config: &UpdatesConfig,
        keyring: &Keyring,
    ) -> Result<Option<Self>, ConfigError> {
        let targets = config.mirror_targets()?;
        if targets.is_empty() {
            return Ok(None);
        }

        let keypair = keyring.iter().next().cloned().ok_or_else(|| {
            ConfigError::ValidationError(
                "updates.mirrors needs a keypair in encryption.keypairs to seal pushes".to_string(),
            )
        })?;
        Ok(Some(Self::new(targets, keypair, config.mirror_timeout())))
    }

    pub fn targets(&self) -> &[MirrorTarget] {
        &self.targets
    }

    /// Public key replicas must list as their `access.master_key`.
    pub fn public_hex(&self) -> String {
        self.keypair.public_hex()
    }

    /// Pushes one batch to every target. Returns how many took it.
    pub async fn forward(&self, batch: &MirrorBatch) -> usize {
        let mut delivered = 0;
        for target in &self.targets {
            match self.push(target, batch).await {
                Ok(sent) => {
                    tracing::debug!(
                        "Forwarded revision {} ({} updates) to {}",
                        batch.revision,
                        sent,
                        target.addr
                    );
                    delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to forward revision {} to mirror {}: {}",
                        batch.revision,
                        target.addr,
                        e
                    );
                }
            }
        }
        delivered
    }

    async fn push(&self, target: &MirrorTarget, batch: &MirrorBatch) -> Result<u64, ClientError> {
        let send = async {
            let link = PeerLink::connect(
                target.addr,
                target.public_key,
                self.keypair.clone(),
                self.timeout,
            )
            .await?;
            link.send_batch(batch.revision, &batch.commands).await
        };
        tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Forwards batches until the queue drops its sender.
    pub async fn run(self, mut batches: mpsc::UnboundedReceiver<MirrorBatch>) {
        tracing::info!("Mirroring local updates to {} replica(s)", self.targets.len());
        while let Some(batch) = batches.recv().await {
            self.forward(&batch).await;
        }
        tracing::info!("Mirror stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use fuzzystore_protocol::{envelope, Command, Decoder, Opcode, UpdateChunk, HASH_BYTES};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_from_config() {
        let mut config = UpdatesConfig::default();
        let keyring = Keyring::new(vec![Keypair::generate()]);
        assert!(Mirror::from_config(&config, &keyring).unwrap().is_none());

        let replica = Keypair::generate();
        config.mirrors = vec![MirrorConfig {
            addr: "127.0.0.1:11336".parse().unwrap(),
            key: replica.public_hex(),
        }];
        let mirror = Mirror::from_config(&config, &keyring).unwrap().unwrap();
        assert_eq!(mirror.targets()[0].public_key, replica.public_key());
        assert_eq!(mirror.public_hex(), keyring.iter().next().unwrap().public_hex());

        assert!(Mirror::from_config(&config, &Keyring::default()).is_err());
    }

    #[tokio::test]
    async fn test_run_forwards_until_closed() {
        let replica = Keypair::generate();
        let master = Keypair::generate();
        let keyring = Keyring::new(vec![replica.clone()]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let receiver = tokio::spawn(async move {
            let mut revisions = Vec::new();
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut raw = Vec::new();
                stream.read_to_end(&mut raw).await.unwrap();

                let mut decoder = Decoder::new();
                decoder.extend(&raw);
                let payload = decoder.decode_payload().unwrap().unwrap();
                let opened = envelope::open(&payload, &keyring).unwrap();
                revisions.push(UpdateChunk::decode(&opened.payload).unwrap().revision);
            }
            revisions
        });

        let mirror = Mirror::new(
            vec![MirrorTarget {
                addr,
                public_key: replica.public_key(),
            }],
            master,
            Duration::from_secs(2),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(mirror.run(rx));

        let write =
            PeerCommand::Normal(Command::new(Opcode::Write, 1, [1u8; HASH_BYTES]).with_value(2));
        tx.send(MirrorBatch {
            revision: 1,
            commands: vec![write],
        })
        .unwrap();
        tx.send(MirrorBatch {
            revision: 2,
            commands: Vec::new(),
        })
        .unwrap();
        drop(tx);

        task.await.unwrap();
        assert_eq!(receiver.await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unreachable_mirror_is_skipped() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mirror = Mirror::new(
            vec![MirrorTarget {
                addr,
                public_key: Keypair::generate().public_key(),
            }],
            Keypair::generate(),
            Duration::from_secs(1),
        );
        let batch = MirrorBatch {
            revision: 1,
            commands: Vec::new(),
        };
        assert_eq!(mirror.forward(&batch).await, 0);
    }
}
