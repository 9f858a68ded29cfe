//! Server keyring loading.
//!
//! Keys are X25519 secrets written as 64 hex characters, either inline in
//! the config or in a keys file with one secret per line.

use crate::config::ConfigError;
use fuzzystore_protocol::{Keypair, Keyring};
use std::collections::HashSet;
use std::path::Path;

/// Builds the keyring from hex secrets. Duplicate keys are loaded once.
pub fn keyring_from_hex<S: AsRef<str>>(secrets: &[S]) -> Result<Keyring, ConfigError> {
    let mut keyring = Keyring::default();
    let mut seen = HashSet::new();

    for (idx, secret) in secrets.iter().enumerate() {
        let keypair = Keypair::from_hex(secret.as_ref().trim()).map_err(|e| {
            ConfigError::ValidationError(format!("encryption.keypairs[{}]: {}", idx, e))
        })?;

        if !seen.insert(keypair.public_key()) {
            tracing::warn!("Ignoring duplicate key {}", keypair.key_id());
            continue;
        }
        keyring.push(keypair);
    }

    Ok(keyring)
}

/// Reads secrets from a keys file, skipping blank lines and `#` comments.
pub fn read_keys_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
    Ok(parse_key_lines(&content))
}

fn parse_key_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
