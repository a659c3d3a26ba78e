use clap::{Parser, Subcommand};
use std::error::Error;
use std::time::Duration;
use murmur::config::{ClientConfig, PlaintextFallback, ServerConfig};
use murmur::cryptography::KeyMode;
use murmur::{DEFAULT_HOST, DEFAULT_PORT, RSA_KEY_BITS};

#[derive(Parser)]
#[command(name = "murmur")]
#[command(about = "Encrypted relay chat", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat server
    Serve {
        /// Address to bind to
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,
        /// Port to bind to
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Require clients to present this secret
        #[arg(long)]
        room_secret: Option<String>,
        /// Give every client its own key and re-encrypt relayed messages
        #[arg(long)]
        per_peer_keys: bool,
        /// Evict peers whose writes stall for longer than this
        #[arg(long, default_value_t = 5000)]
        write_timeout_ms: u64,
    },
    /// Join a chat server
    Connect {
        /// Username to join as
        name: String,
        /// Server address
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,
        /// Server port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Secret required by the server, if any
        #[arg(long)]
        room_secret: Option<String>,
        /// Send unencrypted when encryption fails instead of refusing
        #[arg(long)]
        allow_plaintext_fallback: bool,
        /// RSA modulus size for this session's keypair
        #[arg(long, default_value_t = RSA_KEY_BITS)]
        rsa_bits: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve { host, port, room_secret, per_peer_keys, write_timeout_ms } => {
            let config = ServerConfig {
                host,
                port,
                room_secret,
                key_mode: if per_peer_keys { KeyMode::PerPeer } else { KeyMode::Shared },
                write_timeout: Duration::from_millis(write_timeout_ms),
            };
            murmur::commands::serve::run(config).await?;
        }
        Commands::Connect { name, host, port, room_secret, allow_plaintext_fallback, rsa_bits } => {
            let mut config = ClientConfig::new(name)
                .with_server(host, port)
                .with_rsa_bits(rsa_bits);
            if let Some(secret) = room_secret {
                config = config.with_room_secret(secret);
            }
            if allow_plaintext_fallback {
                config = config.with_plaintext_fallback(PlaintextFallback::Allow);
            }
            murmur::commands::chat::run(config).await?;
        }
    }

    Ok(())
}
