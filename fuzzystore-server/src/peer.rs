//! Master update listener.
//!
//! Masters push revisioned batches as sealed [`UpdateChunk`] frames over
//! TCP. A connection is accepted only from a master network, and every frame
//! must open with the server keyring and carry the configured master key.
//! Once the last chunk of a batch arrives the whole batch is queued under
//! the master's address as update source, provided its revision is newer
//! than anything applied or queued from that source.

use crate::access::AccessPolicy;
use crate::error::ServerError;
use crate::updates::UpdateQueue;
use fuzzystore_protocol::envelope::{self, PUBKEY_LEN};
use fuzzystore_protocol::{Decoder, Keyring, PeerCommand, ProtocolError, UpdateChunk};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Accepts master connections until `shutdown_rx` fires.
pub async fn run_peer_listener(
    listener: TcpListener,
    policy: Arc<AccessPolicy>,
    keyring: Arc<Keyring>,
    queue: Arc<UpdateQueue>,
    idle_timeout: Duration,
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Peer listener on {}", addr);
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if !policy.is_master(addr.ip()) {
                            tracing::warn!("Refusing update connection from non-master {}", addr);
                            continue;
                        }
                        let Some(master_key) = policy.master_key().copied() else {
                            tracing::warn!("Refusing update connection from {}: no master key configured", addr);
                            continue;
                        };

                        let keyring = keyring.clone();
                        let queue = queue.clone();
                        let mut conn_shutdown = shutdown.subscribe();
                        tokio::spawn(async move {
                            let link = MasterLink {
                                addr,
                                master_key,
                                keyring: &keyring,
                                queue: &queue,
                            };
                            match link.read_updates(stream, idle_timeout, &mut conn_shutdown).await {
                                Ok(count) => {
                                    tracing::info!("Master {} sent {} updates", addr, count);
                                }
                                Err(e) => {
                                    tracing::warn!("Master {} connection error: {}", addr, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Peer accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Peer listener shutting down");
                break;
            }
        }
    }
}

/// One master connection.
struct MasterLink<'a> {
    addr: SocketAddr,
    master_key: [u8; PUBKEY_LEN],
    keyring: &'a Keyring,
    queue: &'a UpdateQueue,
}

/// Chunks of the batch being received.
struct Assembly {
    revision: u64,
    next_seq: u32,
    commands: Vec<PeerCommand>,
}

impl MasterLink<'_> {
    /// Queues every complete batch on the connection. Returns how many
    /// commands were queued. A frame that fails to open, comes from another
    /// key or breaks the chunk sequence ends the connection, discarding the
    /// incomplete batch.
    async fn read_updates(
        &self,
        mut stream: TcpStream,
        idle_timeout: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<u64, ServerError> {
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 4096];
        let mut assembly: Option<Assembly> = None;
        let mut queued = 0u64;

        loop {
            tokio::select! {
                result = stream.read(&mut buf) => {
                    let n = result?;
                    if n == 0 {
                        break;
                    }
                    decoder.extend(&buf[..n]);
                }
                _ = tokio::time::sleep(idle_timeout) => {
                    tracing::debug!("[{}] Master idle timeout", self.addr);
                    break;
                }
                _ = shutdown.recv() => {
                    return Err(ServerError::ShuttingDown);
                }
            }

            while let Some(payload) = decoder.decode_payload()? {
                let chunk = self.open_chunk(&payload)?;
                if let Some(batch) = accept_chunk(&mut assembly, chunk)? {
                    queued += self.queue_batch(batch)?;
                }
            }
        }

        if decoder.buffered() > 0 {
            tracing::debug!(
                "[{}] Discarding {} trailing bytes",
                self.addr,
                decoder.buffered()
            );
        }
        if let Some(partial) = assembly {
            return Err(ServerError::BadUpdate(format!(
                "revision {} ended after {} chunks",
                partial.revision, partial.next_seq
            )));
        }
        Ok(queued)
    }

    fn open_chunk(&self, payload: &[u8]) -> Result<UpdateChunk, ServerError> {
        let opened = envelope::open(payload, self.keyring).map_err(ProtocolError::from)?;
        if opened.peer_key != self.master_key {
            return Err(ServerError::UnknownMasterKey(hex::encode(opened.peer_key)));
        }
        Ok(UpdateChunk::decode(&opened.payload).map_err(ProtocolError::from)?)
    }

    fn queue_batch(&self, batch: Assembly) -> Result<u64, ServerError> {
        let count = batch.commands.len() as u64;
        self.queue
            .push_batch(self.addr.ip().to_string(), batch.revision, batch.commands)?;
        tracing::debug!(
            "[{}] Queued revision {} ({} updates)",
            self.addr,
            batch.revision,
            count
        );
        Ok(count)
    }
}

/// Adds a chunk to the batch under assembly. Returns the batch once its
/// last chunk is in.
fn accept_chunk(
    assembly: &mut Option<Assembly>,
    chunk: UpdateChunk,
) -> Result<Option<Assembly>, ServerError> {
    let current = assembly.get_or_insert_with(|| Assembly {
        revision: chunk.revision,
        next_seq: 0,
        commands: Vec::new(),
    });

    if chunk.revision != current.revision || chunk.seq != current.next_seq {
        return Err(ServerError::BadUpdate(format!(
            "expected chunk {} of revision {}, got chunk {} of revision {}",
            current.next_seq, current.revision, chunk.seq, chunk.revision
        )));
    }

    current.next_seq += 1;
    current.commands.extend(chunk.commands);
    if chunk.last {
        Ok(assembly.take())
    } else {
        Ok(None)
    }
}
