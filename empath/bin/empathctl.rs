//! Command-line utility for talking to a running empath scheduler
//!
//! - `status` prints the scheduler's queue snapshot
//! - `notify` announces newly written jobs so they are picked up before the
//!   next directory scan

use std::{io::Read, os::unix::net::UnixStream, path::PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use empath::controller::{find_config_file, load_config};
use empath_scheduler::{config::Settings, ipc};

/// Command-line utility for the empath transport scheduler
#[derive(Parser, Debug)]
#[command(name = "empathctl")]
#[command(about = "Query and notify the empath transport scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file naming the scheduler's sockets
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket to use instead of the one from the configuration
    #[arg(short, long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the scheduler's threads, groups and workers
    Status,
    /// Announce jobs written to the spool
    Notify {
        /// Job names relative to the transport directory (`123`, `A/B/123`)
        #[arg(required = true)]
        names: Vec<String>,
    },
}

impl Cli {
    fn socket(&self, pick: fn(&Settings) -> Option<PathBuf>) -> anyhow::Result<PathBuf> {
        if let Some(socket) = &self.socket {
            return Ok(socket.clone());
        }

        let path = find_config_file(self.config.as_deref())?;
        let config = load_config(&path)?;

        pick(&config.scheduler)
            .with_context(|| format!("{} configures no socket for this command", path.display()))
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Status => {
            let socket = cli.socket(|settings| settings.query_socket.clone())?;
            let mut stream = UnixStream::connect(&socket)
                .with_context(|| format!("Failed to connect to {}", socket.display()))?;

            let mut snapshot = String::new();
            stream.read_to_string(&mut snapshot)?;
            print!("{snapshot}");
        }
        Commands::Notify { names } => {
            let socket = cli.socket(|settings| settings.notify_socket.clone())?;

            for name in names {
                ipc::notify(&socket, name)
                    .with_context(|| format!("Failed to notify {} about {name}", socket.display()))?;
            }
        }
    }

    Ok(())
}
