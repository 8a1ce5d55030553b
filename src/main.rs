//! # docsync CLI
//!
//! The `docsync` binary runs sync cycles between local document trees and
//! a remote page/database service, and inspects the state they leave
//! behind.
//!
//! ## Usage
//!
//! ```bash
//! docsync --config ./docsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsync init` | Create the state container of every mapping |
//! | `docsync mappings` | List mappings and validation problems |
//! | `docsync sync` | Run one sync cycle |
//! | `docsync watch` | Sync each mapping every `sync_interval` until interrupted |
//! | `docsync status` | Record counts and last sync time per mapping |
//! | `docsync backups <mapping> <doc>` | List a document's backups |
//! | `docsync restore <mapping> <doc>` | Restore a backup into the local tree |
//!
//! Logs go to stderr and are filtered by `RUST_LOG` (default
//! `docsync=info`). Reports go to stdout.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use docsync::config::{self, Config};
use docsync::progress::ProgressMode;
use docsync::registry::MappingRegistry;
use docsync::remote::{self, RemoteAdapter};
use docsync::report::SyncReport;
use docsync::status;
use docsync::sync::{Binding, CancellationToken, Orchestrator, SyncOptions, SyncSettings};
use docsync::watch;

/// docsync: keep a local document tree and a remote page store in sync.
///
/// All commands read their settings from the TOML file given by `--config`.
#[derive(Parser)]
#[command(
    name = "docsync",
    about = "Bidirectional sync between local documents and a remote page/database store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docsync.toml")]
    config: PathBuf,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state database of every valid mapping.
    ///
    /// Idempotent; existing records and backups are kept.
    Init,

    /// List configured mappings and why any were rejected.
    Mappings,

    /// Run one sync cycle over all mappings, or one.
    Sync {
        /// Only sync the mapping with this name.
        #[arg(long)]
        mapping: Option<String>,

        /// Rehash every document instead of trusting size, mtime and version tokens.
        #[arg(long)]
        full: bool,

        /// Detect and resolve only; transfer and commit nothing.
        #[arg(long)]
        dry_run: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Sync every mapping on its interval until interrupted (Ctrl-C).
    Watch {
        /// Only watch the mapping with this name.
        #[arg(long)]
        mapping: Option<String>,

        /// Print each report as a JSON line.
        #[arg(long)]
        json: bool,
    },

    /// Show record counts and last sync time per mapping.
    Status,

    /// List the backups of one document.
    Backups {
        /// Mapping name.
        mapping: String,
        /// Document id (path relative to the mapping root).
        document: String,
    },

    /// Restore a backup into the local tree.
    ///
    /// The next sync propagates the restored content like any local edit.
    Restore {
        /// Mapping name.
        mapping: String,
        /// Document id (path relative to the mapping root).
        document: String,
        /// Backup id; defaults to the most recent.
        #[arg(long)]
        id: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "docsync=debug" } else { "docsync=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;
    let remote = remote::create_remote(&cfg)?;
    let registry = MappingRegistry::load(&cfg.mappings, remote.as_ref());

    match cli.command {
        Commands::Init => {
            let bindings = open_bindings(&cfg, &registry, None).await?;
            println!(
                "Initialized state for {} mapping(s) in {}",
                bindings.len(),
                cfg.state.dir.display()
            );
            report_invalid(&registry);
        }
        Commands::Mappings => {
            print_mappings(&registry);
        }
        Commands::Sync {
            mapping,
            full,
            dry_run,
            json,
        } => {
            let bindings = open_bindings(&cfg, &registry, mapping.as_deref()).await?;
            report_invalid(&registry);
            let orchestrator = orchestrator(&cfg, remote);
            let cancel = cancel_on_interrupt();
            let report = orchestrator
                .run_cycle(&bindings, &cancel, SyncOptions { full, dry_run })
                .await;

            if json {
                println!("{}", report.to_json()?);
            } else {
                print!("{}", report.render_human());
            }
            if report.has_failures() {
                std::process::exit(1);
            }
        }
        Commands::Watch { mapping, json } => {
            let bindings = open_bindings(&cfg, &registry, mapping.as_deref()).await?;
            if bindings.is_empty() {
                bail!("no valid mappings to watch");
            }
            report_invalid(&registry);
            let orchestrator = orchestrator(&cfg, remote);
            let cancel = cancel_on_interrupt();

            watch::watch(
                &orchestrator,
                &bindings,
                &cancel,
                SyncOptions::default(),
                |report| {
                    if json {
                        match serde_json::to_string(&report) {
                            Ok(line) => println!("{}", line),
                            Err(e) => tracing::error!(error = %e, "failed to encode report"),
                        }
                    } else {
                        print!("{}", SyncReport::new(Utc::now(), vec![report]).render_human());
                    }
                },
            )
            .await;
        }
        Commands::Status => {
            let bindings = open_bindings(&cfg, &registry, None).await?;
            let mut statuses = Vec::with_capacity(bindings.len());
            for binding in &bindings {
                statuses.push(status::mapping_status(binding).await?);
            }
            print!("{}", status::render_status(&statuses, registry.invalid()));
        }
        Commands::Backups { mapping, document } => {
            let binding = open_one(&cfg, &registry, &mapping).await?;
            let backups = binding.state.backups(&document).await?;
            print!("{}", status::render_backups(&document, &backups));
        }
        Commands::Restore {
            mapping,
            document,
            id,
        } => {
            let binding = open_one(&cfg, &registry, &mapping).await?;
            let restored = status::restore(&binding, &document, id).await?;
            if restored.unchanged {
                println!(
                    "{} already matches backup {}",
                    restored.path.display(),
                    restored.backup_id
                );
            } else {
                println!(
                    "Restored backup {} to {}",
                    restored.backup_id,
                    restored.path.display()
                );
                if let Some(previous) = restored.replaced_backup {
                    println!("Previous content saved as backup {}", previous);
                }
            }
        }
    }

    Ok(())
}

fn orchestrator(cfg: &Config, remote: Arc<dyn RemoteAdapter>) -> Orchestrator {
    let progress = ProgressMode::default_for_tty().reporter();
    Orchestrator::new(remote, SyncSettings::from(&cfg.sync)).with_progress(Arc::from(progress))
}

/// Token cancelled on the first Ctrl-C; in-flight applies still finish.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; finishing in-flight documents");
            stopper.cancel();
        }
    });
    cancel
}

/// Open the state of every valid mapping, or only of `only`.
async fn open_bindings(
    cfg: &Config,
    registry: &MappingRegistry,
    only: Option<&str>,
) -> Result<Vec<Binding>> {
    let mappings: Vec<_> = match only {
        Some(name) => vec![find_mapping(registry, name)?.clone()],
        None => registry.list_mappings().to_vec(),
    };

    let mut bindings = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let name = mapping.name.clone();
        let binding = Binding::open(&cfg.state.dir, mapping)
            .await
            .with_context(|| format!("opening state of mapping '{}'", name))?;
        bindings.push(binding);
    }
    Ok(bindings)
}

async fn open_one(cfg: &Config, registry: &MappingRegistry, name: &str) -> Result<Binding> {
    let mut bindings = open_bindings(cfg, registry, Some(name)).await?;
    bindings
        .pop()
        .with_context(|| format!("mapping '{}' not found", name))
}

fn find_mapping<'a>(
    registry: &'a MappingRegistry,
    name: &str,
) -> Result<&'a docsync::registry::Mapping> {
    if let Some(mapping) = registry.get(name) {
        return Ok(mapping);
    }
    match registry.invalid().iter().find(|m| m.name == name) {
        Some(invalid) => bail!("mapping '{}' is invalid: {}", name, invalid.reason),
        None => bail!("unknown mapping '{}'", name),
    }
}

fn report_invalid(registry: &MappingRegistry) {
    for invalid in registry.invalid() {
        eprintln!("skipping mapping '{}': {}", invalid.name, invalid.reason);
    }
}

fn print_mappings(registry: &MappingRegistry) {
    println!(
        "{:<20} {:<14} {:<8} {:>8}   SOURCE -> TARGET",
        "MAPPING", "MODE", "POLICY", "INTERVAL"
    );
    for m in registry.list_mappings() {
        println!(
            "{:<20} {:<14} {:<8} {:>7}s   {} -> {}",
            m.name,
            m.mode.to_string(),
            format!("{:?}", m.conflict_policy).to_lowercase(),
            m.sync_interval.as_secs(),
            m.source_root.display(),
            m.target_id
        );
    }
    for m in registry.invalid() {
        println!("{:<20} INVALID: {}", m.name, m.reason);
    }
}
