//! Command-line front-end over the lifecycle manager.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcsm::{
    Implementation, InstallRequest, Instance, InstanceStatus, LifecycleManager, ManagerConfig,
    ProcessSupervisor, Variant,
    download::{HttpDownloader, ProgressFn},
    resolver::UpstreamResolver,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Install, run and remove Minecraft servers
#[derive(Parser)]
#[command(
    name = "mcsm",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Data directory (store, logs, servers)
    #[arg(long, global = true, env = "MCSM_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Download and register a new server
    Install {
        name: String,
        /// Game version, or "latest" for vanilla
        #[arg(default_value = "latest")]
        game_version: String,
        #[arg(short, long, default_value = "java")]
        edition: Implementation,
        #[arg(long, default_value = "vanilla")]
        variant: Variant,
        /// Skip the first start that generates default config files
        #[arg(long)]
        no_bootstrap: bool,
    },

    /// List installed servers
    List,

    /// Show one server's status
    Status { id: String },

    /// Start a server in the background
    Start { id: String },

    /// Stop a server
    Stop {
        id: String,
        /// Seconds to wait before forcing termination
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Stop then start a server
    Restart {
        id: String,
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Remove a stopped server and its files
    Delete { id: String },

    /// Run the first-start cycle again
    Bootstrap { id: String },

    /// List installable versions
    Versions {
        #[arg(short, long, default_value = "java")]
        edition: Implementation,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let Cli {
            data_dir,
            json,
            command,
        } = self;

        let mut config = ManagerConfig::load(data_dir).context("cannot load configuration")?;
        if let Command::Stop {
            timeout: Some(secs),
            ..
        }
        | Command::Restart {
            timeout: Some(secs),
            ..
        } = &command
        {
            config.stop_timeout = Duration::from_secs((*secs).max(1));
        }

        let resolver = Arc::new(UpstreamResolver::new()?);
        if let Command::Versions { edition } = command {
            let versions = resolver.versions(edition).await;
            if json {
                println!("{}", json!(versions));
            } else {
                versions.iter().for_each(|v| println!("{v}"));
            }
            return Ok(());
        }

        let downloader = HttpDownloader::new()?
            .with_backoff(config.download_backoff)
            .with_progress(progress_printer());
        let supervisor = ProcessSupervisor::from_config(&config);
        let manager = LifecycleManager::new(
            config,
            resolver,
            Arc::new(downloader),
            Arc::new(supervisor),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupted, cancelling");
                trigger.cancel();
            }
        });

        match command {
            Command::Install {
                name,
                game_version,
                edition,
                variant,
                no_bootstrap,
            } => {
                let bootstrap = !no_bootstrap && manager.config().bootstrap.enabled;
                let instance = manager
                    .install(
                        InstallRequest {
                            name,
                            implementation: edition,
                            variant,
                            version: game_version,
                            bootstrap,
                        },
                        &cancel,
                    )
                    .await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&instance)?);
                } else {
                    println!("Installed {} in {}", instance.id, instance.directory.display());
                }
            }
            Command::List => {
                let servers = manager.list().await?;
                if json {
                    let rows: Vec<_> = servers
                        .iter()
                        .map(|(instance, status)| json!({ "instance": instance, "status": status }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                } else if servers.is_empty() {
                    println!("No servers installed.");
                } else {
                    for (instance, status) in &servers {
                        print_row(instance, *status);
                    }
                }
            }
            Command::Status { id } => {
                let status = manager.status(&id).await?;
                if json {
                    println!("{}", json!({ "id": id, "status": status }));
                } else {
                    println!("{id}: {status}");
                }
            }
            Command::Start { id } => {
                let handle = manager.start(&id).await?;
                println!(
                    "Started {id} (pid {}), logging to {}",
                    handle.pid,
                    handle.log_path.display()
                );
            }
            Command::Stop { id, .. } => {
                manager.stop(&id, &cancel).await?;
                println!("Stopped {id}");
            }
            Command::Restart { id, .. } => {
                let handle = manager.restart(&id, &cancel).await?;
                println!("Restarted {id} (pid {})", handle.pid);
            }
            Command::Delete { id } => {
                manager.delete(&id).await?;
                println!("Deleted {id}");
            }
            Command::Bootstrap { id } => {
                manager.bootstrap(&id, &cancel).await?;
                println!("Bootstrapped {id}");
            }
            Command::Versions { .. } => {}
        }
        Ok(())
    }
}

fn print_row(instance: &Instance, status: InstanceStatus) {
    println!(
        "{:<24} {:<8} {:<8} {:<11} {:<10} {}",
        instance.id,
        status.to_string(),
        instance.implementation.to_string(),
        instance.variant.to_string(),
        instance.version,
        instance.directory.display()
    );
}

/// Prints whole-percent download progress to stderr.
fn progress_printer() -> ProgressFn {
    let last = Arc::new(AtomicU64::new(u64::MAX));
    Arc::new(move |done: u64, total: Option<u64>| {
        let Some(total) = total.filter(|t| *t > 0) else {
            return;
        };
        let pct = done.saturating_mul(100) / total;
        if last.swap(pct, Ordering::Relaxed) != pct {
            eprint!("\rdownloading... {pct:>3}%");
            if done >= total {
                eprintln!();
            }
        }
    })
}
