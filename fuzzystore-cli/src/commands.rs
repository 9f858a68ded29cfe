//! Command execution.

use crate::{Commands, DigestArgs, PushOp};
use chrono::{TimeZone, Utc};
use colored::Colorize;
use fuzzystore_client::{Client, PeerLink};
use fuzzystore_protocol::envelope::decode_key_hex;
use fuzzystore_protocol::{
    Command, DecodedCommand, Digest, Keypair, Opcode, PeerCommand, Reply, Shingles, HASH_BYTES,
    SHINGLE_COUNT,
};
use sha2::{Digest as _, Sha256, Sha512};
use std::time::Duration;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Words per shingle window.
const SHINGLE_WINDOW: usize = 3;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands, timeout: Duration) -> CliResult<String> {
    match cmd {
        Commands::Keygen => Err("keygen runs locally".into()),

        Commands::Ping { value } => {
            let reply = client.ping(0, value).await?;
            Ok(format!("{} (value {})", "PONG".green(), reply.value))
        }

        Commands::Stat => {
            let reply = client.stat().await?;
            Ok(format!("{} {}", "Stored hashes:".bold(), reply.flag))
        }

        Commands::Check { flag, source } => {
            let (digest, shingles) = resolve(&source)?;
            let reply = client.check(flag, &digest, shingles.as_ref()).await?;
            Ok(format_check(&digest, &reply))
        }

        Commands::Add {
            flag,
            value,
            weak,
            source,
        } => {
            let (digest, shingles) = resolve(&source)?;
            let reply = if weak {
                client
                    .write_weak(flag, &digest, value, shingles.as_ref())
                    .await?
            } else {
                client.write(flag, &digest, value, shingles.as_ref()).await?
            };
            Ok(format_update("Added", &digest, &reply))
        }

        Commands::Del { flag, source } => {
            let (digest, _) = resolve(&source)?;
            let reply = client.delete(flag, &digest).await?;
            Ok(format_update("Deleted", &digest, &reply))
        }

        Commands::Push {
            peer,
            replica_key,
            secret,
            revision,
            op,
            flag,
            value,
            source,
        } => {
            let (digest, shingles) = resolve(&source)?;
            let opcode = match op {
                PushOp::Write => Opcode::Write,
                PushOp::Del => Opcode::Del,
                PushOp::Refresh => Opcode::Refresh,
            };
            let cmd = Command::new(opcode, flag, digest).with_value(value);
            let update = PeerCommand::from(DecodedCommand::new(cmd, shingles));

            let replica_key = decode_key_hex(&replica_key)?;
            let keypair = Keypair::from_hex(&secret)?;

            let link = PeerLink::connect(peer, replica_key, keypair, timeout).await?;
            let sent = link.send_batch(revision, &[update]).await?;
            Ok(format!(
                "{} {} update(s) to {} as revision {}",
                "Pushed".green(),
                sent,
                peer.to_string().cyan(),
                revision
            ))
        }
    }
}

fn format_check(digest: &Digest, reply: &Reply) -> String {
    if !reply.is_match() {
        return format!("{} {}", "Not found".yellow(), short(digest));
    }

    let mut out = format!(
        "{} {}\n  Flag: {}\n  Value: {}\n  Probability: {:.2}",
        "Found".green(),
        short(digest),
        reply.flag,
        reply.value,
        reply.prob
    );
    if reply.digest != [0u8; HASH_BYTES] && &reply.digest != digest {
        out.push_str(&format!("\n  Matched: {}", short(&reply.digest).cyan()));
    }
    if let Some(ts) = format_ts(reply.ts) {
        out.push_str(&format!("\n  Updated: {}", ts));
    }
    out
}

fn format_update(action: &str, digest: &Digest, reply: &Reply) -> String {
    match reply.value {
        403 if reply.prob == 0.0 => format!("{}: updates not allowed", "Refused".red()),
        401 if reply.prob == 0.0 => format!("{}: hash is on the skip list", "Skipped".yellow()),
        value => format!(
            "{} {} (weight {})",
            action.green(),
            short(digest).cyan(),
            value
        ),
    }
}

fn format_ts(ts: u32) -> Option<String> {
    if ts == 0 {
        return None;
    }
    Utc.timestamp_opt(i64::from(ts), 0)
        .single()
        .map(|t| t.to_rfc3339())
}

fn short(digest: &Digest) -> String {
    hex::encode(&digest[..8])
}

/// Turns digest arguments into a digest and, if requested, shingles.
fn resolve(args: &DigestArgs) -> CliResult<(Digest, Option<Shingles>)> {
    if let Some(ref hex_digest) = args.digest {
        if args.shingles {
            return Err("--shingles needs --file or --text".into());
        }
        return Ok((parse_digest(hex_digest)?, None));
    }

    let content = match (&args.file, &args.text) {
        (Some(path), _) => String::from_utf8_lossy(&std::fs::read(path)?).into_owned(),
        (None, Some(text)) => text.clone(),
        (None, None) => return Err("one of --digest, --file or --text is required".into()),
    };

    let digest = content_digest(content.as_bytes());
    let shingles = if args.shingles {
        Some(shingles_from_text(&content).ok_or("not enough words for shingles")?)
    } else {
        None
    };
    Ok((digest, shingles))
}

fn parse_digest(s: &str) -> CliResult<Digest> {
    let raw = hex::decode(s.trim())?;
    let digest: Digest = raw.try_into().map_err(|raw: Vec<u8>| {
        format!("digest must be {} bytes, got {}", HASH_BYTES, raw.len())
    })?;
    Ok(digest)
}

/// SHA-512 of the content.
fn content_digest(content: &[u8]) -> Digest {
    let mut digest = [0u8; HASH_BYTES];
    digest.copy_from_slice(&Sha512::digest(content));
    digest
}

/// Min-hash shingles over word windows: position `i` holds the smallest
/// seeded hash of any window.
fn shingles_from_text(text: &str) -> Option<Shingles> {
    let words: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
    if words.len() < SHINGLE_WINDOW {
        return None;
    }

    let mut values = [u64::MAX; SHINGLE_COUNT];
    for window in words.windows(SHINGLE_WINDOW) {
        let joined = window.join(" ");
        for (seed, slot) in values.iter_mut().enumerate() {
            let mut hasher = Sha256::new();
            hasher.update((seed as u32).to_le_bytes());
            hasher.update(joined.as_bytes());
            let hash = hasher.finalize();
            let mut head = [0u8; 8];
            head.copy_from_slice(&hash[..8]);
            *slot = (*slot).min(u64::from_le_bytes(head));
        }
    }
    Some(Shingles(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzystore_protocol::RejectCode;

    fn text_args(text: &str, shingles: bool) -> DigestArgs {
        DigestArgs {
            digest: None,
            file: None,
            text: Some(text.to_string()),
            shingles,
        }
    }

    #[test]
    fn test_parse_digest() {
        let hex_digest = "ab".repeat(HASH_BYTES);
        assert_eq!(parse_digest(&hex_digest).unwrap(), [0xab; HASH_BYTES]);
        assert!(parse_digest("abcd").is_err());
        assert!(parse_digest("zz").is_err());
    }

    #[test]
    fn test_resolve_text() {
        let (digest, shingles) = resolve(&text_args("hello", false)).unwrap();
        assert_eq!(digest, content_digest(b"hello"));
        assert!(shingles.is_none());

        assert!(resolve(&text_args("two words", true)).is_err());
    }

    #[test]
    fn test_similar_texts_share_shingles() {
        let a = shingles_from_text("the quick brown fox jumps over the lazy dog again and again")
            .unwrap();
        let b = shingles_from_text("the quick brown fox jumps over the lazy cat again and again")
            .unwrap();
        let c = shingles_from_text("completely different words appear in this other message body")
            .unwrap();

        let same = |x: &Shingles, y: &Shingles| {
            x.0.iter().zip(y.0.iter()).filter(|(p, q)| p == q).count()
        };
        assert!(same(&a, &b) > same(&a, &c));
        assert_eq!(same(&a, &a), SHINGLE_COUNT);
    }

    #[test]
    fn test_format_update_codes() {
        let digest = [1u8; HASH_BYTES];
        let refused = Reply::rejected(0, RejectCode::Forbidden);
        assert!(format_update("Added", &digest, &refused).contains("not allowed"));
        let skipped = Reply::rejected(0, RejectCode::Skipped);
        assert!(format_update("Added", &digest, &skipped).contains("skip list"));
        assert!(format_update("Added", &digest, &Reply::ok(0, 7, 1)).contains("weight 7"));
    }

    #[test]
    fn test_format_ts() {
        assert!(format_ts(0).is_none());
        assert_eq!(format_ts(86_400).unwrap(), "1970-01-02T00:00:00+00:00");
    }
}
