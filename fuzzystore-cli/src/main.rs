//! fuzzystore-cli - Command-line interface for fuzzystore
//!
//! One-shot commands against a running server, plus local key generation.

mod commands;

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use fuzzystore_client::{Client, ClientConfig};
use fuzzystore_protocol::{Extension, Extensions, Keypair, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fuzzystore-cli")]
#[command(about = "Command-line interface for the fuzzystore fuzzy hash storage")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:11335", env = "FUZZYSTORE_SERVER")]
    server: SocketAddr,

    /// Use the framed TCP transport instead of UDP
    #[arg(long)]
    tcp: bool,

    /// Server public key (hex); enables request encryption
    #[arg(short = 'k', long, env = "FUZZYSTORE_SERVER_KEY")]
    key: Option<String>,

    /// Reply timeout in milliseconds
    #[arg(long, default_value = "2000")]
    timeout: u64,

    /// Resends after a timed out request
    #[arg(long, default_value = "2")]
    retries: u32,

    /// Protocol version to speak (1-4)
    #[arg(long, default_value_t = PROTOCOL_VERSION)]
    protocol: u8,

    /// Sender domain attached to requests
    #[arg(long)]
    domain: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Where a digest comes from.
#[derive(Args, Debug)]
pub struct DigestArgs {
    /// Digest as 128 hex characters
    #[arg(long, conflicts_with_all = ["file", "text"])]
    digest: Option<String>,

    /// Hash the contents of a file
    #[arg(long, conflicts_with = "text")]
    file: Option<PathBuf>,

    /// Hash a literal string
    #[arg(long)]
    text: Option<String>,

    /// Also send shingles computed from the content
    #[arg(long)]
    shingles: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a server keypair
    Keygen,

    /// Ping the server
    Ping {
        /// Value echoed back by the server
        #[arg(long, default_value = "0")]
        value: i32,
    },

    /// Show store statistics
    Stat,

    /// Look up a digest
    Check {
        #[arg(short, long, default_value = "1")]
        flag: u8,

        #[command(flatten)]
        source: DigestArgs,
    },

    /// Add weight to a digest
    Add {
        #[arg(short, long, default_value = "1")]
        flag: u8,

        #[arg(short, long, default_value = "1")]
        value: i32,

        /// Store as a short-lived weak entry
        #[arg(long)]
        weak: bool,

        #[command(flatten)]
        source: DigestArgs,
    },

    /// Delete a digest
    Del {
        #[arg(short, long, default_value = "1")]
        flag: u8,

        #[command(flatten)]
        source: DigestArgs,
    },

    /// Push one update to a replica's peer listener as a master
    Push {
        /// Replica peer listener address
        #[arg(long)]
        peer: SocketAddr,

        /// Replica server public key (hex)
        #[arg(long)]
        replica_key: String,

        /// Master secret key (hex); its public half is the replica's access.master_key
        #[arg(long, env = "FUZZYSTORE_MASTER_SECRET", hide_env_values = true)]
        secret: String,

        /// Batch revision; must be newer than the last one the replica applied
        #[arg(long)]
        revision: u64,

        #[arg(long, value_enum)]
        op: PushOp,

        #[arg(short, long, default_value = "1")]
        flag: u8,

        #[arg(short, long, default_value = "1")]
        value: i32,

        #[command(flatten)]
        source: DigestArgs,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PushOp {
    Write,
    Del,
    Refresh,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Handled locally, no server connection needed
    if let Commands::Keygen = cli.command {
        let keypair = Keypair::generate();
        println!("{} {}", "secret:".bold(), keypair.secret_hex());
        println!("{} {}", "public:".bold(), keypair.public_hex());
        println!("{} {}", "key id:".bold(), keypair.key_id());
        return Ok(());
    }

    let timeout = Duration::from_millis(cli.timeout);
    let mut config = if cli.tcp {
        ClientConfig::tcp(cli.server)
    } else {
        ClientConfig::udp(cli.server)
    }
    .with_timeout(timeout)
    .with_retries(cli.retries)
    .with_version(cli.protocol);

    if let Some(ref key) = cli.key {
        config = config.with_server_key(key)?;
    }
    if let Some(domain) = cli.domain {
        config = config.with_extensions(Extensions::new().with(Extension::SourceDomain(domain)));
    }
    let client = Client::new(config);

    match commands::execute(&client, cli.command, timeout).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    client.close().await?;
    Ok(())
}
