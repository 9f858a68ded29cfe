//! # fuzzystore-server
//!
//! UDP/TCP server for fuzzystore.
//!
//! This crate provides:
//! - UDP workers on a shared socket and an optional framed TCP listener
//! - Request dispatch: envelope, decoding, access policy, matching engine
//! - Source access lists, skip lists and per-network rate limiting
//! - The deferred update queue, the sealed master update listener and
//!   forwarding of local updates to replicas
//! - YAML configuration with environment overrides
//! - Prometheus metrics

pub mod access;
pub mod config;
pub mod error;
pub mod handler;
pub mod keys;
pub mod metrics;
pub mod mirror;
pub mod peer;
pub mod ratelimit;
pub mod server;
pub mod session;
pub mod updates;

pub use access::AccessPolicy;
pub use config::{
    AccessConfig, Config, ConfigError, EncryptionConfig, MatchingConfig, MetricsConfig,
    MirrorConfig, NetworkConfig, RateLimitConfig, StorageConfig, UpdatesConfig,
};
pub use error::ServerError;
pub use handler::{CommandHandler, Disposition, DropReason};
pub use metrics::{run_metrics_server, Metrics};
pub use mirror::{Mirror, MirrorBatch, MirrorTarget};
pub use ratelimit::RateLimiter;
pub use server::{Listeners, Server, ServerConfig, ServerStats};
pub use session::{RequestContext, Session, Transport};
pub use updates::UpdateQueue;
