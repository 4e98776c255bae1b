//! Tessera CLI: the command-line interface for fingerprint stores.
//!
//! Provides `tessera ensure` to fill a store for an item file, serially or
//! across worker processes, `tessera worker` as the entry point those
//! processes run, and `compact`, `keys`, `show`, `hash` and `cores` for
//! inspecting stores, inputs and the detected core allocation.

#![warn(missing_docs)]

mod context;
mod cores;
mod ensure;
mod fingerprint;
mod hash;
mod items;
mod records;
mod worker;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Tessera: a content-addressed fingerprint cache.
#[derive(Parser, Debug)]
#[command(name = "tessera", version, about = "Tessera fingerprint cache")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose (debug-level) output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a custom `tessera.toml` configuration file.
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Store directory, overriding the configured one.
    #[arg(long, global = true)]
    pub store: Option<String>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compute and store every missing fingerprint of an item file.
    Ensure(EnsureArgs),
    /// Run as a worker process. Started by `ensure`, not by hand.
    Worker(WorkerArgs),
    /// Pack loose records into the store archive.
    Compact,
    /// List every stored key.
    Keys,
    /// Print the record stored under a key.
    Show {
        /// The 64-character key.
        key: String,
    },
    /// Print the key of every item in a file.
    Hash {
        /// JSON file of structures.
        items: PathBuf,
    },
    /// Print the detected core allocation.
    Cores,
}

/// Arguments for the `tessera ensure` subcommand.
#[derive(Parser, Debug)]
pub struct EnsureArgs {
    /// JSON file of structures, either a name-to-structure object or a list.
    pub items: PathBuf,

    /// Number of cores on this machine, overriding configuration and
    /// scheduler detection. `1` computes in this process.
    #[arg(short = 'j', long)]
    pub cores: Option<usize>,

    /// Worker launch template with `{id}` and `{server}` placeholders.
    #[arg(long)]
    pub worker_command: Option<String>,

    /// Seconds each worker may take to return its results; `0` waits forever.
    #[arg(long)]
    pub worker_timeout: Option<u64>,

    /// Neighbor cutoff distance of the fingerprint.
    #[arg(long)]
    pub cutoff: Option<f64>,
}

/// Arguments for the `tessera worker` subcommand.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Worker id assigned by the launching process.
    #[arg(long)]
    pub id: usize,

    /// Address of the coordination server, `host:port`.
    #[arg(long)]
    pub server: String,
}

/// Global settings derived from CLI flags.
pub struct GlobalArgs {
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Whether to print verbose/debug information.
    pub verbose: bool,
    /// Optional path to a custom config file.
    pub config: Option<String>,
    /// Optional store directory override.
    pub store: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let global = GlobalArgs {
        quiet: cli.quiet,
        verbose: cli.verbose,
        config: cli.config,
        store: cli.store,
    };
    init_tracing(&global);

    let result = match cli.command {
        Command::Ensure(ref args) => ensure::run(args, &global),
        Command::Worker(ref args) => worker::run(args),
        Command::Compact => records::compact(&global),
        Command::Keys => records::keys(&global),
        Command::Show { ref key } => records::show(key, &global),
        Command::Hash { ref items } => hash::run(items, &global),
        Command::Cores => cores::run(&global),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

/// The filter used when `RUST_LOG` is not set.
fn default_filter(global: &GlobalArgs) -> &'static str {
    if global.quiet {
        "tessera=warn"
    } else if global.verbose {
        "tessera=debug"
    } else {
        "tessera=info"
    }
}

fn init_tracing(global: &GlobalArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(global)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
