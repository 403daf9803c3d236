//! relaymesh CLI
//!
//! NAT-traversal node: STUN address discovery, entry nodes and relay circuits

mod config;

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use relaymesh_core::PeerId;
use relaymesh_discovery::StunSocket;
use relaymesh_discovery::nat::agreed_address;
use relaymesh_discovery::nat::stun::STUN_TIMEOUT;
use relaymesh_transport::{Node, NodeEvent};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use config::Config;

/// relaymesh - reach peers behind NATs through relays
#[derive(Parser)]
#[command(name = "relaymesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (default: ~/.config/relaymesh/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl+C; relayed connections are echoed back
    Daemon {
        /// Bind address, overrides the configured listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Forward circuits for other nodes
        #[arg(long)]
        relay: bool,
    },

    /// Determine the external address of this host
    Stun {
        /// STUN servers as host:port
        #[arg(required = true)]
        servers: Vec<String>,

        /// Timeout per server in milliseconds
        #[arg(long, default_value_t = STUN_TIMEOUT.as_millis() as u64)]
        timeout: u64,
    },

    /// Show configuration and identity
    Status,

    /// Generate a new identity keypair
    Keygen {
        /// Output file for private key
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Daemon { bind, relay } => run_daemon(bind, relay, &config).await?,
        Commands::Stun { servers, timeout } => {
            query_stun(&servers, Duration::from_millis(timeout)).await?;
        }
        Commands::Status => show_status(&config)?,
        Commands::Keygen { output } => generate_keypair(output)?,
    }

    Ok(())
}

/// Load the identity from `path`, or create an ephemeral one if the file
/// does not exist
fn load_identity(path: &Path) -> anyhow::Result<(PeerId, bool)> {
    if !path.exists() {
        let key = SigningKey::generate(&mut rand_core::OsRng);
        return Ok((PeerId::from_verifying_key(&key.verifying_key()), false));
    }

    let bytes = Zeroizing::new(std::fs::read(path)?);
    let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Private key file {} must hold 32 bytes", path.display()))?,
    );
    let key = SigningKey::from_bytes(&secret);
    Ok((PeerId::from_verifying_key(&key.verifying_key()), true))
}

/// Run daemon mode
async fn run_daemon(bind: Option<String>, relay: bool, config: &Config) -> anyhow::Result<()> {
    let bind: SocketAddr = match bind {
        Some(bind) => bind.parse()?,
        None => config.parse_listen_addr()?,
    };
    let (local_id, persistent) = load_identity(&config.node.private_key_file)?;
    if !persistent {
        tracing::warn!(
            "No private key at {}, using an ephemeral identity",
            config.node.private_key_file.display()
        );
    }

    tracing::info!("Starting relaymesh daemon on {} (relay: {})", bind, relay);
    let (node, mut events) = Node::new(local_id, config.node_config(relay)?, None);
    node.listen(bind, None).await?;

    println!("relaymesh daemon");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Peer ID: {}", local_id);
    println!("Listen: {}", bind);
    println!("Relay mode: {}", relay);
    println!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(NodeEvent::Listening) => {
                    println!("\nAddresses:");
                    for addr in node.get_addrs().await {
                        println!("  {}", addr);
                    }
                }
                Some(NodeEvent::Connection(mut conn)) => {
                    println!("Connection from {} via {}", conn.counterparty(), conn.remote_addr());
                    tokio::spawn(async move {
                        while let Some(chunk) = conn.recv().await {
                            if conn.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        tracing::debug!("connection from {} ended", conn.counterparty().short());
                    });
                }
                Some(NodeEvent::Close) | None => break,
            },
        }
    }

    println!("\nShutting down...");
    node.close().await;
    Ok(())
}

/// Ask every server for this host's reflexive address
async fn query_stun(servers: &[String], timeout: Duration) -> anyhow::Result<()> {
    let (socket, receiver) = StunSocket::bind("0.0.0.0:0".parse()?).await?;
    println!("Local: {}", socket.local_addr()?);

    let mut results = Vec::new();
    for server in servers {
        let resolved = tokio::net::lookup_host(server.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4));
        let Some(addr) = resolved else {
            println!("  {:<32} unresolved", server);
            continue;
        };

        match socket.request(addr, timeout).await {
            Ok(mapped) => {
                println!("  {:<32} {}", server, mapped);
                results.push(mapped);
            }
            Err(e) => println!("  {:<32} {}", server, e),
        }
    }
    receiver.abort();

    match agreed_address(&results) {
        Some(external) => println!("External: {}", external),
        None if results.is_empty() => println!("External: unknown"),
        None => println!("External: servers disagree (symmetric NAT)"),
    }
    Ok(())
}

/// Show configuration and identity
fn show_status(config: &Config) -> anyhow::Result<()> {
    println!("relaymesh status");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    match load_identity(&config.node.private_key_file)? {
        (id, true) => println!("Peer ID: {}", id),
        (_, false) => println!(
            "Peer ID: none (no key at {})",
            config.node.private_key_file.display()
        ),
    }
    println!();

    println!("Network:");
    println!("  Listen: {}", config.network.listen_addr);
    println!("  Fallback STUN servers: {}", config.fallback_stun_servers().len());
    println!("  Running locally: {}", config.network.running_locally);
    println!();

    println!("Entry nodes:");
    println!("  Seed nodes: {}", config.entry.seed_nodes.len());
    println!("  Max relays: {}", config.entry.max_relays);
    println!();

    println!("Relay:");
    println!("  Max circuits: {}", config.relay.max_relayed_connections);
    println!("  Direct upgrade: {}", config.relay.direct_upgrade);

    Ok(())
}

/// Generate a new identity keypair
fn generate_keypair(output: Option<String>) -> anyhow::Result<()> {
    println!("Generating new Ed25519 identity keypair...");

    let signing_key = SigningKey::generate(&mut rand_core::OsRng);
    let peer_id = PeerId::from_verifying_key(&signing_key.verifying_key());
    println!("Peer ID: {}", peer_id);

    if let Some(path) = output {
        let output_path = PathBuf::from(path);
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let private_bytes = Zeroizing::new(signing_key.to_bytes());
        std::fs::write(&output_path, private_bytes.as_slice())?;

        println!("Private key saved to: {}", output_path.display());
        println!("\nKeep this file secure! It contains your private key.");
    } else {
        println!("\nPrivate key not saved (use --output to save)");
    }

    Ok(())
}
