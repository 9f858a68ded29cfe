//! Source-address access policy.

use crate::config::{AccessConfig, ConfigError};
use fuzzystore_protocol::envelope::PUBKEY_LEN;
use fuzzystore_protocol::Digest;
use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::IpAddr;

/// Parsed access lists.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    read_only: bool,
    encrypted_only: bool,
    allow_update: Vec<IpNetwork>,
    blocked: Vec<IpNetwork>,
    masters: Vec<IpNetwork>,
    master_key: Option<[u8; PUBKEY_LEN]>,
    skip_hashes: HashSet<Digest>,
}

impl AccessPolicy {
    pub fn from_config(config: &AccessConfig, encrypted_only: bool) -> Result<Self, ConfigError> {
        Ok(Self {
            read_only: config.read_only,
            encrypted_only,
            allow_update: config.update_networks()?,
            blocked: config.blocked_networks()?,
            masters: config.master_networks()?,
            master_key: config.master_public_key()?,
            skip_hashes: config.skip_digests()?,
        })
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn encrypted_only(mut self, encrypted_only: bool) -> Self {
        self.encrypted_only = encrypted_only;
        self
    }

    pub fn with_blocked(mut self, network: IpNetwork) -> Self {
        self.blocked.push(network);
        self
    }

    pub fn with_update_source(mut self, network: IpNetwork) -> Self {
        self.allow_update.push(network);
        self
    }

    pub fn with_master(mut self, network: IpNetwork) -> Self {
        self.masters.push(network);
        self
    }

    /// Sets the public key master pushes must be sealed with.
    pub fn with_master_key(mut self, key: [u8; PUBKEY_LEN]) -> Self {
        self.master_key = Some(key);
        self
    }

    pub fn with_skip_hash(mut self, digest: Digest) -> Self {
        self.skip_hashes.insert(digest);
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn requires_encryption(&self) -> bool {
        self.encrypted_only
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        contains(&self.blocked, ip)
    }

    /// Returns whether `ip` may send WRITE and DEL.
    pub fn can_update(&self, ip: IpAddr) -> bool {
        !self.read_only && contains(&self.allow_update, ip)
    }

    pub fn is_master(&self, ip: IpAddr) -> bool {
        contains(&self.masters, ip)
    }

    pub fn master_key(&self) -> Option<&[u8; PUBKEY_LEN]> {
        self.master_key.as_ref()
    }

    pub fn is_skipped(&self, digest: &Digest) -> bool {
        self.skip_hashes.contains(digest)
    }
}

fn contains(networks: &[IpNetwork], ip: IpAddr) -> bool {
    let ip = canonical(ip);
    networks.iter().any(|net| net.contains(ip))
}

/// Maps IPv4-mapped IPv6 addresses back to IPv4 so v4 lists apply to them.
pub(crate) fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
