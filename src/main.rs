//! salsalink CLI: run a node, provision or inspect its preshared key.

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use salsalink::{
    CounterMode, FileEeprom, KeyLoad, KeyStore, LinkConfig, LinkError, MeshTransport, Node,
    PresharedKey, UdpMesh, NWK_OPT_ACK_REQUEST,
};

#[derive(Parser, Debug)]
#[command(name = "salsalink")]
#[command(about = "Salsa20 end-to-end encrypted two-node link")]
struct Args {
    /// EEPROM image holding the preshared key
    #[arg(long, env = "SALSALINK_EEPROM", default_value = "salsalink.eeprom", global = true)]
    eeprom: PathBuf,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an interactive node
    Run {
        /// UDP port of mesh address 0; address N listens on port_base + N
        #[arg(long, env = "SALSALINK_PORT_BASE", default_value_t = 47800)]
        port_base: u16,

        /// Keep the block counter at zero, like unmodified firmware nodes
        #[arg(long)]
        firmware_compat: bool,

        /// Ask the mesh for acknowledgements
        #[arg(long)]
        ack: bool,

        /// Polling interval in milliseconds
        #[arg(long, default_value_t = 20)]
        poll_ms: u64,
    },

    /// Write a preshared key to the EEPROM image
    #[command(group(ArgGroup::new("source").required(true).args(["key", "random"])))]
    Provision {
        /// Key as 64 hex characters
        #[arg(long)]
        key: Option<String>,

        /// Generate a random key
        #[arg(long)]
        random: bool,
    },

    /// Show the state of the stored key
    Inspect {
        /// Print the key bytes
        #[arg(long)]
        show_key: bool,
    },
}

fn init_tracing(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    match args.command {
        Command::Run {
            port_base,
            firmware_compat,
            ack,
            poll_ms,
        } => {
            let mut config = LinkConfig::default();
            if firmware_compat {
                config = config.with_counter_mode(CounterMode::Frozen);
            }
            if ack {
                config.tx_options |= NWK_OPT_ACK_REQUEST;
            }
            run(&args.eeprom, config, port_base, Duration::from_millis(poll_ms)).await
        }
        Command::Provision { key, random } => {
            // clap guarantees exactly one of --key and --random.
            let key = match key {
                Some(text) => PresharedKey::from_hex(&text)?,
                None => {
                    debug_assert!(random);
                    PresharedKey::generate()
                }
            };
            if key.is_degenerate() {
                return Err(LinkError::KeyDegenerate.into());
            }

            let mut keys = open_keys(&args.eeprom)?;
            keys.store(&key)?;
            println!("Stored key in {}", keys.storage().path().display());
            println!("Checksum: {:02X}", key.checksum());
            if key.is_fallback() {
                println!("Warning: this is the compiled-in fallback key");
            }
            Ok(())
        }
        Command::Inspect { show_key } => {
            let mut keys = open_keys(&args.eeprom)?;
            println!("Image:  {}", keys.storage().path().display());
            println!("Status: {:?}", keys.status()?);
            if let KeyLoad::Valid(key) = keys.load()? {
                println!("Checksum: {:02X}", key.checksum());
                if key.is_fallback() {
                    println!("Warning: compiled-in fallback key in use");
                }
                if show_key {
                    println!("Key: {}", hex::encode_upper(key.as_bytes()));
                }
            }
            Ok(())
        }
    }
}

fn open_keys(path: &Path) -> Result<KeyStore<FileEeprom>> {
    let image = FileEeprom::open(path)
        .with_context(|| format!("Failed to open EEPROM image {}", path.display()))?;
    Ok(KeyStore::new(image))
}

async fn run(eeprom: &Path, config: LinkConfig, port_base: u16, poll: Duration) -> Result<()> {
    let mut keys = open_keys(eeprom)?;
    let mesh = UdpMesh::new(port_base)?;

    println!("\r\n----- salsalink with Salsa20 E2E Encryption -----\r");
    let mut node = Node::start(config, mesh, &mut keys)?;
    flush_console(&mut node)?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(poll);

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    info!("Console closed");
                    break;
                };
                let mut bytes = line.into_bytes();
                bytes.push(b'\r');
                if let Err(e) = node.type_bytes(&bytes) {
                    error!(error = %e, "Console input failed");
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = node.poll() {
                    error!(error = %e, "Poll failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
        flush_console(&mut node)?;
    }

    Ok(())
}

fn flush_console<T: MeshTransport>(node: &mut Node<T>) -> Result<()> {
    let output = node.take_output();
    if !output.is_empty() {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(output.as_bytes())?;
        stdout.flush()?;
    }
    Ok(())
}
