//! fuzzystore - Fuzzy hash storage server
//!
//! Stores content digests and shingles, answering check, add and delete
//! requests over UDP (and optionally framed TCP).

use fuzzystore_core::MatchingEngine;
use fuzzystore_server::{
    keys, run_metrics_server, AccessPolicy, CommandHandler, Config, Metrics, Mirror, RateLimiter,
    Server, ServerConfig, UpdateQueue,
};
use fuzzystore_storage::{FuzzyBackend, MemoryBackend};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if FUZZYSTORE_CONFIG is set, then env overrides)
    let config_path = std::env::var("FUZZYSTORE_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load keys: {}", e);
        return Err(e.into());
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting fuzzystore server");
    tracing::info!("  UDP address: {}", config.network.bind_addr);
    if let Some(addr) = config.network.tcp_bind {
        tracing::info!("  TCP address: {}", addr);
    }
    if let Some(addr) = config.network.peer_bind {
        tracing::info!("  Peer address: {}", addr);
    }
    match config.storage.snapshot_path {
        Some(ref path) => tracing::info!("  Snapshot: {}", path.display()),
        None => tracing::info!("  Snapshot: disabled (memory only)"),
    }

    let keyring = keys::keyring_from_hex(&config.encryption.keypairs)?;
    if keyring.is_empty() {
        tracing::info!("  Encryption: disabled");
    } else {
        tracing::info!(
            "  Encryption: {} key(s){}",
            keyring.len(),
            if config.encryption.encrypted_only {
                ", plaintext refused"
            } else {
                ""
            }
        );
        for keypair in keyring.iter() {
            tracing::info!("    key {} public {}", keypair.key_id(), keypair.public_hex());
        }
    }

    if let Some(ref path) = config.storage.snapshot_path {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
    }
    let backend: Arc<dyn FuzzyBackend> =
        Arc::new(MemoryBackend::open(config.storage.memory_config())?);
    tracing::info!("  Stored hashes: {}", backend.live_count(fuzzystore_core::unix_now()));

    let engine = Arc::new(MatchingEngine::new(
        backend.clone(),
        config.matching.policy(),
    ));

    let policy = AccessPolicy::from_config(&config.access, config.encryption.encrypted_only)?;
    if policy.is_read_only() {
        tracing::info!("  Mode: read-only");
    }
    if let Some(ref key) = config.access.master_key {
        tracing::info!("  Master key: {}", key);
    }

    let mirror = Mirror::from_config(&config.updates, &keyring)?;
    if let Some(ref mirror) = mirror {
        tracing::info!("  Mirroring as {}", mirror.public_hex());
        for target in mirror.targets() {
            tracing::info!("    replica {}", target.addr);
        }
    }

    let metrics = if config.metrics.enabled {
        Some(Arc::new(Metrics::new()?))
    } else {
        None
    };

    let mut queue = UpdateQueue::new(
        backend.clone(),
        config.storage.sync_interval(),
        config.updates.max_fail,
    )
    .with_source(config.updates.source.clone());
    if let Some(ref metrics) = metrics {
        queue = queue.with_metrics(metrics.clone());
    }
    let mirror_handle = match mirror {
        Some(mirror) => {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            queue = queue.with_mirror(tx);
            Some(tokio::spawn(mirror.run(rx)))
        }
        None => None,
    };
    let queue = Arc::new(queue);

    let mut handler = CommandHandler::new(engine)
        .with_keyring(keyring)
        .with_policy(policy)
        .with_updates(queue.clone());
    if let Some(limiter) = RateLimiter::from_config(&config.ratelimit)? {
        tracing::info!(
            "  Rate limit: {}/s, burst {}",
            config.ratelimit.rate,
            config.ratelimit.burst
        );
        handler = handler.with_rate_limiter(limiter);
    }

    let mut server_config = ServerConfig::from_network(&config.network);
    if let Some(ref metrics) = metrics {
        server_config = server_config.with_metrics(metrics.clone());
    }
    let server = Arc::new(Server::new(server_config, handler).with_updates(queue.clone()));

    // Spawn metrics server
    if let Some(metrics) = metrics {
        let addr = config.metrics.bind_addr;
        let shutdown_rx = server.shutdown_handle().subscribe();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        });
    }

    // Spawn update queue
    let queue_handle = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue.run().await;
        })
    };

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    let shutdown_queue = queue.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
        shutdown_queue.shutdown();
    });

    // Run server (blocks until shutdown)
    let result = server.run().await;

    // The queue's last tick flushes pending updates and writes the snapshot
    queue.shutdown();
    let _ = queue_handle.await;
    // The queue drops its mirror sender on exit, which ends the forwarder
    if let Some(handle) = mirror_handle {
        let _ = handle.await;
    }

    result?;
    tracing::info!("Server stopped");
    Ok(())
}
