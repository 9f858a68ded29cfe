//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via FUZZYSTORE_CONFIG or --config)
//! 3. Environment variables

use crate::mirror::MirrorTarget;
use fuzzystore_core::MatchPolicy;
use fuzzystore_protocol::envelope::{decode_key_hex, PUBKEY_LEN};
use fuzzystore_protocol::{Digest, DEFAULT_PORT, HASH_BYTES};
use fuzzystore_storage::MemoryConfig;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Matching thresholds.
    pub matching: MatchingConfig,
    /// Envelope keys.
    pub encryption: EncryptionConfig,
    /// Who may read and write.
    pub access: AccessConfig,
    /// CHECK rate limiting.
    pub ratelimit: RateLimitConfig,
    /// Update queue.
    pub updates: UpdatesConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("FUZZYSTORE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.storage.apply_env_overrides();
        self.matching.apply_env_overrides();
        self.encryption.apply_env_overrides();
        self.access.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Loads key secrets from the external keys file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.encryption.load_secrets()
    }

    /// Checks every field that is parsed later (keys, networks, digests).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.udp_workers == 0 {
            return Err(ConfigError::ValidationError(
                "network.udp_workers must be at least 1".to_string(),
            ));
        }

        let keyring = crate::keys::keyring_from_hex(&self.encryption.keypairs)?;
        if self.encryption.encrypted_only && keyring.is_empty() {
            return Err(ConfigError::ValidationError(
                "encryption.encrypted_only is set but no keypairs are configured".to_string(),
            ));
        }

        self.access.blocked_networks()?;
        self.access.update_networks()?;
        self.access.master_networks()?;
        self.access.skip_digests()?;
        self.ratelimit.validate()?;

        let master_key = self.access.master_public_key()?;
        if self.network.peer_bind.is_some()
            && (self.access.masters.is_empty() || master_key.is_none())
        {
            tracing::warn!(
                "network.peer_bind is set without access.masters and access.master_key; all pushes will be refused"
            );
        }
        if master_key.is_some() && keyring.is_empty() {
            return Err(ConfigError::ValidationError(
                "access.master_key is set but no keypairs are configured to open pushes".to_string(),
            ));
        }

        if !self.updates.mirror_targets()?.is_empty() && keyring.is_empty() {
            return Err(ConfigError::ValidationError(
                "updates.mirrors needs a keypair in encryption.keypairs to seal pushes".to_string(),
            ));
        }

        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.to_lowercase() == "true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address for client requests.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Optional TCP address for framed client requests.
    #[serde(with = "opt_socket_addr_serde")]
    pub tcp_bind: Option<SocketAddr>,
    /// Optional TCP address on which masters push updates.
    #[serde(with = "opt_socket_addr_serde")]
    pub peer_bind: Option<SocketAddr>,
    /// Idle TCP connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent TCP connections.
    pub max_connections: usize,
    /// Tasks reading from the shared UDP socket.
    pub udp_workers: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            tcp_bind: None,
            peer_bind: None,
            idle_timeout_secs: 300,
            max_connections: 1000,
            udp_workers: 4,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("FUZZYSTORE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(addr) = std::env::var("FUZZYSTORE_TCP_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.tcp_bind = Some(parsed);
            }
        }

        if let Ok(addr) = std::env::var("FUZZYSTORE_PEER_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.peer_bind = Some(parsed);
            }
        }

        if let Ok(timeout) = std::env::var("FUZZYSTORE_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("FUZZYSTORE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot file. Unset keeps hashes in memory only.
    pub snapshot_path: Option<PathBuf>,
    /// Lifetime of an entry after its last write or refresh, in seconds.
    pub expire_secs: u64,
    /// Lifetime of a weak entry, in seconds.
    pub weak_expire_secs: u64,
    /// Interval between update flushes, expiry and snapshot writes.
    pub sync_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: Some(PathBuf::from("./data/fuzzystore.json")),
            expire_secs: 2 * 24 * 3600,
            weak_expire_secs: 3600,
            sync_interval_secs: 60,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("FUZZYSTORE_SNAPSHOT") {
            self.snapshot_path = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        if let Ok(expire) = std::env::var("FUZZYSTORE_EXPIRE") {
            if let Ok(secs) = expire.parse() {
                self.expire_secs = secs;
            }
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    /// Backend settings derived from this section.
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            expire: Duration::from_secs(self.expire_secs),
            weak_expire: Duration::from_secs(self.weak_expire_secs),
            snapshot_path: self.snapshot_path.clone(),
        }
    }
}

/// Matching thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum agreeing shingles for a near-duplicate match.
    pub min_votes: u32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_votes: MatchPolicy::default().min_votes,
        }
    }
}

impl MatchingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(votes) = std::env::var("FUZZYSTORE_MIN_VOTES") {
            if let Ok(n) = votes.parse() {
                self.min_votes = n;
            }
        }
    }

    pub fn policy(&self) -> MatchPolicy {
        MatchPolicy {
            min_votes: self.min_votes,
        }
    }
}

/// Envelope keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Hex-encoded X25519 secret keys.
    /// Generate one with: `fuzzystore-cli keygen`
    pub keypairs: Vec<String>,
    /// Optional file with one hex secret per line.
    pub keys_file: Option<PathBuf>,
    /// Refuse plaintext requests.
    pub encrypted_only: bool,
}

impl EncryptionConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("FUZZYSTORE_KEYS_FILE") {
            self.keys_file = Some(PathBuf::from(path));
        }

        if let Some(flag) = env_flag("FUZZYSTORE_ENCRYPTED_ONLY") {
            self.encrypted_only = flag;
        }
    }

    /// Appends the secrets listed in `keys_file` to `keypairs`.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.keys_file {
            let secrets = crate::keys::read_keys_file(path)?;
            self.keypairs.extend(secrets);
        }
        Ok(())
    }
}

/// Access control lists. Entries are CIDRs or bare addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Refuse every WRITE and DEL.
    pub read_only: bool,
    /// Sources allowed to WRITE and DEL. Empty refuses all writes.
    pub allow_update: Vec<String>,
    /// Sources refused entirely.
    pub blocked: Vec<String>,
    /// Sources allowed to push updates on the peer listener.
    pub masters: Vec<String>,
    /// Hex public key the master seals its pushes with.
    pub master_key: Option<String>,
    /// Hex digests that are never stored.
    pub skip_hashes: Vec<String>,
}

impl AccessConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_flag("FUZZYSTORE_READ_ONLY") {
            self.read_only = flag;
        }
    }

    pub fn blocked_networks(&self) -> Result<Vec<IpNetwork>, ConfigError> {
        parse_networks("access.blocked", &self.blocked)
    }

    pub fn update_networks(&self) -> Result<Vec<IpNetwork>, ConfigError> {
        parse_networks("access.allow_update", &self.allow_update)
    }

    pub fn master_networks(&self) -> Result<Vec<IpNetwork>, ConfigError> {
        parse_networks("access.masters", &self.masters)
    }

    pub fn master_public_key(&self) -> Result<Option<[u8; PUBKEY_LEN]>, ConfigError> {
        self.master_key
            .as_deref()
            .map(|hex| parse_public_key("access.master_key", hex))
            .transpose()
    }

    pub fn skip_digests(&self) -> Result<HashSet<Digest>, ConfigError> {
        self.skip_hashes
            .iter()
            .map(|s| parse_digest(s.trim()))
            .collect()
    }
}

/// Leaky bucket limits for CHECK requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Drain rate in requests per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: f64,
    /// Seconds a bucket lives after creation.
    pub bucket_ttl_secs: u64,
    /// Maximum tracked buckets.
    pub max_buckets: usize,
    /// IPv4 prefix length used to group sources.
    pub network_mask: u8,
    /// Sources never limited.
    pub whitelist: Vec<String>,
    /// Log overflows without refusing.
    pub log_only: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 10.0,
            burst: 100.0,
            bucket_ttl_secs: 3600,
            max_buckets: 2000,
            network_mask: 24,
            whitelist: Vec::new(),
            log_only: false,
        }
    }
}

impl RateLimitConfig {
    pub fn bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.bucket_ttl_secs)
    }

    pub fn whitelist_networks(&self) -> Result<Vec<IpNetwork>, ConfigError> {
        parse_networks("ratelimit.whitelist", &self.whitelist)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.whitelist_networks()?;
        if !self.enabled {
            return Ok(());
        }
        if self.rate.is_nan() || self.burst.is_nan() || self.rate <= 0.0 || self.burst <= 0.0 {
            return Err(ConfigError::ValidationError(
                "ratelimit.rate and ratelimit.burst must be positive".to_string(),
            ));
        }
        if self.max_buckets == 0 {
            return Err(ConfigError::ValidationError(
                "ratelimit.max_buckets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Update queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatesConfig {
    /// Failed flushes tolerated before a batch is discarded.
    pub max_fail: u32,
    /// Source name under which local updates are versioned.
    pub source: String,
    /// Replicas receiving local WRITE and DEL updates.
    pub mirrors: Vec<MirrorConfig>,
    /// Connect and send timeout per mirror push, in seconds.
    pub mirror_timeout_secs: u64,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            max_fail: 3,
            source: "local".to_string(),
            mirrors: Vec::new(),
            mirror_timeout_secs: 5,
        }
    }
}

impl UpdatesConfig {
    pub fn mirror_timeout(&self) -> Duration {
        Duration::from_secs(self.mirror_timeout_secs.max(1))
    }

    pub fn mirror_targets(&self) -> Result<Vec<MirrorTarget>, ConfigError> {
        self.mirrors
            .iter()
            .enumerate()
            .map(|(idx, mirror)| {
                let field = format!("updates.mirrors[{}].key", idx);
                Ok(MirrorTarget {
                    addr: mirror.addr,
                    public_key: parse_public_key(&field, &mirror.key)?,
                })
            })
            .collect()
    }
}

/// One replica receiving our updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// The replica's peer listener.
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    /// The replica's hex public key.
    pub key: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(flag) = env_flag("FUZZYSTORE_METRICS_ENABLED") {
            self.enabled = flag;
        }
        if let Ok(addr) = std::env::var("FUZZYSTORE_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

fn parse_networks(field: &str, entries: &[String]) -> Result<Vec<IpNetwork>, ConfigError> {
    entries
        .iter()
        .map(|s| {
            s.trim().parse::<IpNetwork>().map_err(|e| {
                ConfigError::ValidationError(format!("{}: invalid network '{}': {}", field, s, e))
            })
        })
        .collect()
}

fn parse_public_key(field: &str, hex: &str) -> Result<[u8; PUBKEY_LEN], ConfigError> {
    decode_key_hex(hex)
        .map_err(|e| ConfigError::ValidationError(format!("{}: {}", field, e)))
}

fn parse_digest(s: &str) -> Result<Digest, ConfigError> {
    let raw = hex::decode(s).map_err(|e| {
        ConfigError::ValidationError(format!("access.skip_hashes: '{}': {}", s, e))
    })?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        ConfigError::ValidationError(format!(
            "access.skip_hashes: '{}' has {} bytes, expected {}",
            s,
            raw.len(),
            HASH_BYTES
        ))
    })
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod opt_socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &Option<SocketAddr>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match addr {
            Some(addr) => serializer.serialize_some(&addr.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SocketAddr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) if !s.is_empty() => s.parse().map(Some).map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}
