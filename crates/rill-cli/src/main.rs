//! Rill command-line runner
//!
//! Loads a guest bundle into an engine and prints the replicated tree, or
//! evaluates a snippet in a bare sandbox context.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "rill")]
#[command(about = "Run Rill guest bundles in a sandbox", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a bundle and print the tree it renders
    Run {
        /// Bundle file
        bundle: PathBuf,
        /// Initial props as JSON
        #[arg(long)]
        props: Option<String>,
        /// Engine config file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Sandbox backend: quickjs, worker or direct
        #[arg(short, long)]
        backend: Option<String>,
        /// Cooperative budget per guest turn
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Keep running timers for this long after loading
        #[arg(long, default_value_t = 0)]
        wait_ms: u64,
        /// Compact JSON output
        #[arg(long)]
        compact: bool,
    },

    /// Evaluate a snippet and print its completion value as wire JSON
    Eval {
        /// Source code
        code: String,
        /// Sandbox backend: quickjs, worker or direct
        #[arg(short, long)]
        backend: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            bundle,
            props,
            config,
            backend,
            timeout_ms,
            wait_ms,
            compact,
        } => {
            let options = commands::run::RunOptions {
                props,
                config,
                backend,
                timeout_ms,
                wait_ms,
                compact,
            };
            let output = commands::run::execute(&bundle, &options)?;
            println!("{}", output);
        }

        Commands::Eval { code, backend } => {
            let output = commands::eval::execute(&code, backend.as_deref())?;
            println!("{}", output);
        }
    }

    Ok(())
}
