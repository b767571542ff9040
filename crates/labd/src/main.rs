//! labd — the labgrid daemon.
//!
//! Single binary that assembles every labgrid subsystem:
//! - State store (redb)
//! - Resource pool
//! - Container and VM backends
//! - Image ingest pipeline
//! - Instance manager + expiry reconciler
//! - REST API
//!
//! # Usage
//!
//! ```text
//! labd serve --config /etc/labgrid/labd.toml --data-dir /var/lib/labgrid
//! labd check-config --config /etc/labgrid/labd.toml
//! ```

mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lab_core::PlatformConfig;

const DEFAULT_FILTER: &str = "info,labd=debug,labgrid=debug";

#[derive(Parser)]
#[command(name = "labd", about = "labgrid challenge-instance daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane: API server and background reconciler.
    Serve {
        /// Configuration file; every setting has a default.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address, overriding `server.listen`.
        #[arg(long)]
        listen: Option<String>,

        /// Data directory, overriding `server.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PlatformConfig> {
    match path {
        Some(path) => PlatformConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("load {}: {e}", path.display())),
        None => Ok(PlatformConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            let mut config = load_config(config.as_ref())?;
            if let Some(data_dir) = data_dir {
                config = config.with_data_dir(&data_dir);
            }
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            config.validate()?;
            serve::run(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
