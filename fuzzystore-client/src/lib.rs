//! # fuzzystore-client
//!
//! Client library for fuzzystore.
//!
//! This crate provides:
//! - Async UDP and framed TCP transports with timeouts and retries
//! - CHECK / WRITE / DEL / STAT / PING with tag verification
//! - Optional request encryption against a known server public key
//! - A master-side link for pushing updates to replicas

pub mod client;
pub mod connection;
pub mod error;
pub mod peer;

pub use client::{Client, ClientConfig};
pub use connection::{Connection, ConnectionConfig, TransportKind};
pub use error::ClientError;
pub use peer::PeerLink;
