//! meshentryd — the meshentry daemon.
//!
//! Loads service records from a TOML file, resolves them through the
//! registry and keeps them fresh until interrupted. The same file can be
//! checked offline or queried once from the command line.
//!
//! # Usage
//!
//! ```text
//! meshentryd run --config meshentry.toml
//! meshentryd check --config meshentry.toml
//! meshentryd lookup --config meshentry.toml --ip 192.192.192.195 --port 27018
//! meshentryd lookup --config meshentry.toml --host api.bar.com --port 443
//! ```

mod commands;
mod config;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::LookupQuery;
use crate::config::{DaemonConfig, LoggingConfig};

#[derive(Parser)]
#[command(name = "meshentryd", about = "meshentry service registry daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load records and keep resolving them until Ctrl-C.
    Run {
        #[arg(long, default_value = "meshentry.toml")]
        config: PathBuf,
    },

    /// Validate records without resolving anything.
    Check {
        #[arg(long, default_value = "meshentry.toml")]
        config: PathBuf,
    },

    /// Answer a single lookup and print it as JSON.
    Lookup {
        #[arg(long, default_value = "meshentry.toml")]
        config: PathBuf,

        /// Destination address of the connection.
        #[arg(long, required_unless_present = "host")]
        ip: Option<IpAddr>,

        /// Host header or SNI name.
        #[arg(long)]
        host: Option<String>,

        /// Destination port.
        #[arg(long)]
        port: u16,

        /// How long to wait for DNS-mode records to resolve.
        #[arg(long, default_value = "2000")]
        wait_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let config = DaemonConfig::from_file(&config)?;
            init_tracing(&config.logging)?;
            commands::run(config).await
        }
        Command::Check { config } => {
            let config = DaemonConfig::from_file(&config)?;
            init_tracing(&config.logging)?;
            let (lines, ok) = commands::check(&config);
            for line in lines {
                println!("{line}");
            }
            if !ok {
                anyhow::bail!("configuration has rejected records");
            }
            Ok(())
        }
        Command::Lookup {
            config,
            ip,
            host,
            port,
            wait_ms,
        } => {
            let config = DaemonConfig::from_file(&config)?;
            init_tracing(&config.logging)?;
            let query = LookupQuery { ip, host, port };
            let output = commands::lookup(&config, &query, Duration::from_millis(wait_ms)).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

/// Logs go to stderr so `lookup` output stays machine-readable.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
