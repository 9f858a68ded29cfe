//! Authenticated encryption envelope.
//!
//! ```text
//! Request:
//! +-------+--------+---------------+-------+-----+------------+
//! | magic | key_id | sender pubkey | nonce | mac | ciphertext |
//! | 4     | 8      | 32            | 24    | 16  | ...        |
//! +-------+--------+---------------+-------+-----+------------+
//!
//! Reply:
//! +-------+-----+------------+
//! | nonce | mac | ciphertext |
//! | 24    | 16  | ...        |
//! +-------+-----+------------+
//! ```
//!
//! The symmetric key is SHA-256 over a fixed context string and the X25519
//! shared secret between the sender's ephemeral key and one of the server's
//! static keys. The cipher is XChaCha20-Poly1305 with a detached tag.

use crate::error::CryptoError;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use sha2::{Digest as _, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Magic prefix of an encrypted request.
pub const ENCRYPTED_MAGIC: [u8; 4] = *b"rsfe";

pub const KEY_ID_LEN: usize = 8;
pub const PUBKEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const MAC_LEN: usize = 16;

/// Size of the encrypted request header.
pub const ENC_REQ_HEADER_SIZE: usize =
    ENCRYPTED_MAGIC.len() + KEY_ID_LEN + PUBKEY_LEN + NONCE_LEN + MAC_LEN;

/// Size of the encrypted reply header.
pub const ENC_REP_HEADER_SIZE: usize = NONCE_LEN + MAC_LEN;

const KDF_CONTEXT: &[u8] = b"fuzzystore-box-v1";

/// Short identifier of a server keypair: a prefix of its public key fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId(pub [u8; KEY_ID_LEN]);

impl KeyId {
    /// Computes the id of a public key.
    pub fn for_public(public: &[u8; PUBKEY_LEN]) -> Self {
        let fingerprint = fingerprint(public);
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&fingerprint[..KEY_ID_LEN]);
        KeyId(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn fingerprint(public: &[u8; PUBKEY_LEN]) -> [u8; 32] {
    Sha256::digest(public).into()
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKey([u8; 32]);

/// An X25519 keypair.
#[derive(Clone)]
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    fingerprint: [u8; 32],
}

impl Keypair {
    /// Generates a fresh random keypair.
    pub fn generate() -> Self {
        let mut bytes: [u8; 32] = rand::random();
        let keypair = Self::from_secret_bytes(bytes);
        bytes.zeroize();
        keypair
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        let fingerprint = fingerprint(public.as_bytes());
        Self {
            secret,
            public,
            fingerprint,
        }
    }

    /// Parses a hex-encoded 32-byte secret key.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = decode_key_hex(s)?;
        let keypair = Self::from_secret_bytes(bytes);
        bytes.zeroize();
        Ok(keypair)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    pub fn public_key(&self) -> [u8; PUBKEY_LEN] {
        *self.public.as_bytes()
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    pub fn key_id(&self) -> KeyId {
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&self.fingerprint[..KEY_ID_LEN]);
        KeyId(id)
    }

    /// Returns true if `id` is a prefix of this key's fingerprint.
    pub fn matches(&self, id: &KeyId) -> bool {
        self.fingerprint.starts_with(&id.0)
    }

    fn shared_key(&self, peer: &[u8; PUBKEY_LEN]) -> Result<SessionKey, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer));
        if !shared.was_contributory() {
            return Err(CryptoError::BadPublicKey);
        }

        let mut hasher = Sha256::new();
        hasher.update(KDF_CONTEXT);
        hasher.update(shared.as_bytes());
        Ok(SessionKey(hasher.finalize().into()))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("key_id", &self.key_id().to_hex())
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

/// Parses a hex-encoded 32-byte key.
pub fn decode_key_hex(s: &str) -> Result<[u8; 32], CryptoError> {
    let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    raw.try_into()
        .map_err(|raw: Vec<u8>| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", raw.len())))
}

/// The server's set of static keypairs, searched by key id.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: Vec<Keypair>,
}

impl Keyring {
    pub fn new(keys: Vec<Keypair>) -> Self {
        Self { keys }
    }

    pub fn push(&mut self, keypair: Keypair) {
        self.keys.push(keypair);
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn find(&self, id: &KeyId) -> Option<&Keypair> {
        self.keys.iter().find(|k| k.matches(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keypair> {
        self.keys.iter()
    }
}

/// Returns true if the datagram starts with the envelope magic.
pub fn is_encrypted(buf: &[u8]) -> bool {
    buf.starts_with(&ENCRYPTED_MAGIC)
}

/// A successfully opened request.
#[derive(Debug)]
pub struct Opened<'a> {
    /// Decrypted plaintext: command plus any extensions.
    pub payload: Vec<u8>,
    /// The sender's public key, used to seal the reply.
    pub peer_key: [u8; PUBKEY_LEN],
    /// The server keypair that matched the request's key id.
    pub keypair: &'a Keypair,
}

impl Opened<'_> {
    pub fn key_id(&self) -> KeyId {
        self.keypair.key_id()
    }

    /// Seals a reply back to the sender.
    pub fn seal_reply(&self, reply: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal(reply, &self.peer_key, self.keypair)
    }
}

struct RequestHeader {
    key_id: KeyId,
    pubkey: [u8; PUBKEY_LEN],
    nonce: [u8; NONCE_LEN],
    mac: [u8; MAC_LEN],
}

impl RequestHeader {
    fn parse(buf: &[u8]) -> Result<Self, CryptoError> {
        if !is_encrypted(buf) {
            return Err(CryptoError::BadMagic);
        }
        if buf.len() < ENC_REQ_HEADER_SIZE {
            return Err(CryptoError::Truncated(buf.len()));
        }

        let mut header = Self {
            key_id: KeyId([0u8; KEY_ID_LEN]),
            pubkey: [0u8; PUBKEY_LEN],
            nonce: [0u8; NONCE_LEN],
            mac: [0u8; MAC_LEN],
        };
        let mut pos = ENCRYPTED_MAGIC.len();
        for field in [
            &mut header.key_id.0[..],
            &mut header.pubkey[..],
            &mut header.nonce[..],
            &mut header.mac[..],
        ] {
            let end = pos + field.len();
            field.copy_from_slice(&buf[pos..end]);
            pos = end;
        }
        Ok(header)
    }
}

/// Opens an encrypted request using the server's keyring.
pub fn open<'a>(buf: &[u8], keyring: &'a Keyring) -> Result<Opened<'a>, CryptoError> {
    let header = RequestHeader::parse(buf)?;
    let keypair = keyring
        .find(&header.key_id)
        .ok_or_else(|| CryptoError::UnknownKey(header.key_id.to_hex()))?;

    let key = keypair.shared_key(&header.pubkey)?;
    let mut payload = buf[ENC_REQ_HEADER_SIZE..].to_vec();
    decrypt(&key, &header.nonce, &header.mac, &mut payload)?;

    Ok(Opened {
        payload,
        peer_key: header.pubkey,
        keypair,
    })
}

/// Seals a reply for `peer_key` using the server keypair that opened the request.
pub fn seal(
    reply: &[u8],
    peer_key: &[u8; PUBKEY_LEN],
    keypair: &Keypair,
) -> Result<Vec<u8>, CryptoError> {
    let key = keypair.shared_key(peer_key)?;
    let nonce: [u8; NONCE_LEN] = rand::random();
    let mut body = reply.to_vec();
    let mac = encrypt(&key, &nonce, &mut body)?;

    let mut out = Vec::with_capacity(ENC_REP_HEADER_SIZE + body.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&mac);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Client side: encrypts a request for the server key `server_public`.
pub fn seal_request(
    payload: &[u8],
    server_public: &[u8; PUBKEY_LEN],
    local: &Keypair,
) -> Result<Vec<u8>, CryptoError> {
    let key = local.shared_key(server_public)?;
    let nonce: [u8; NONCE_LEN] = rand::random();
    let mut body = payload.to_vec();
    let mac = encrypt(&key, &nonce, &mut body)?;

    let mut out = Vec::with_capacity(ENC_REQ_HEADER_SIZE + body.len());
    out.extend_from_slice(&ENCRYPTED_MAGIC);
    out.extend_from_slice(&KeyId::for_public(server_public).0);
    out.extend_from_slice(&local.public_key());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&mac);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Client side: decrypts a reply sealed by the server.
pub fn open_reply(
    buf: &[u8],
    server_public: &[u8; PUBKEY_LEN],
    local: &Keypair,
) -> Result<Vec<u8>, CryptoError> {
    if buf.len() < ENC_REP_HEADER_SIZE {
        return Err(CryptoError::Truncated(buf.len()));
    }
    let (nonce, rest) = buf.split_at(NONCE_LEN);
    let (mac, body) = rest.split_at(MAC_LEN);

    let key = local.shared_key(server_public)?;
    let mut body = body.to_vec();
    decrypt(&key, nonce, mac, &mut body)?;
    Ok(body)
}

fn encrypt(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    buf: &mut [u8],
) -> Result<[u8; MAC_LEN], CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(nonce), b"", buf)
        .map_err(|_| CryptoError::AuthFailed)?;

    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&tag);
    Ok(mac)
}

fn decrypt(key: &SessionKey, nonce: &[u8], mac: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher
        .decrypt_in_place_detached(XNonce::from_slice(nonce), b"", buf, Tag::from_slice(mac))
        .map_err(|_| CryptoError::AuthFailed)
}
