//! Mount a live, read-only view of message content as a filesystem.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

mod app_config;
mod daemon;
mod fuse_check;
mod trc;

use crate::app_config::{Config, SourceConfig};
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "A live-updating, read-only FUSE view of message content.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a msg-fs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[arg(long, help = "Plain log output without spinners.")]
    plain: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the filesystem and serve it until interrupted.
    Run {
        /// Override the configured mount point.
        #[arg(short, long)]
        mount_point: Option<PathBuf>,

        /// Mirror an extra host directory at the mount root.
        #[arg(short, long = "source")]
        sources: Vec<PathBuf>,
    },

    /// Validate the configuration and print it.
    Check,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    if let Err(e) = Trc::default().plain(args.plain).init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    let mut config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        error!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    match args.command.unwrap_or(Command::Run {
        mount_point: None,
        sources: Vec::new(),
    }) {
        Command::Run {
            mount_point,
            sources,
        } => {
            if let Some(mount_point) = mount_point {
                config.mount_point = mount_point;
            }
            config
                .sources
                .extend(sources.into_iter().map(|path| SourceConfig {
                    path,
                    tree_path: "/".to_owned(),
                    exclude_empty: false,
                    expand_archives: false,
                }));
            exit_on_invalid(&config);

            if let Err(e) = fuse_check::ensure_fuse() {
                error!("{e}");
                std::process::exit(1);
            }

            debug!(config = ?config, "Starting with configuration...");
            if let Err(e) = daemon::spawn(config) {
                error!("Daemon failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Check => {
            exit_on_invalid(&config);
            println!("{config:#?}");
        }
    }
}

fn exit_on_invalid(config: &Config) {
    if let Err(error_messages) = config.validate() {
        error!("Configuration is invalid.");
        for msg in &error_messages {
            error!(" - {msg}");
        }
        std::process::exit(1);
    }
}
