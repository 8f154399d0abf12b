use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use stepper_chain_runtime::chain::Role;
use stepper_chain_runtime::config::{CHAIN_BAUDRATE, CHAIN_PORT, NAMED_QUEUES, STORAGE_DIR};
use stepper_chain_runtime::runtime::{self, Options};

/// Stepper board runtime: command queues, chain transport, zenoh front-end
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Chain role; omit to run without a chain link
    #[arg(long, value_enum)]
    role: Option<Role>,

    /// Serial port of the chain link
    #[arg(long, default_value = CHAIN_PORT)]
    port: String,

    #[arg(long, default_value_t = CHAIN_BAUDRATE)]
    baud: u32,

    /// Directory for saved queues and motor configuration
    #[arg(long, default_value = STORAGE_DIR)]
    storage_dir: PathBuf,

    /// Run without opening the chain link even if a role is given
    #[arg(long)]
    no_chain: bool,

    #[arg(long, default_value_t = NAMED_QUEUES)]
    named_queues: usize,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let args = Args::parse();
    let options = Options {
        role: if args.no_chain { None } else { args.role },
        port: args.port,
        baud: args.baud,
        storage_dir: args.storage_dir,
        named_queues: args.named_queues,
    };

    if let Err(e) = runtime::run(options).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
