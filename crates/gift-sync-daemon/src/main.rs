//! gift-sync: headless sync host for the gift tracker.
//!
//! Keeps a local JSON store, queues every local change, and reconciles with
//! the remote document API whenever it is reachable.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use gift_sync_core::gate::ConnectivityGate;
use gift_sync_core::{
    Entity, EntityType, OfflineRepository, SharedGate, SyncEvent, SyncManager, SyncQueue,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use gift_sync_daemon::{
    CycleOutcome, DaemonConfig, FileLocalStore, HttpRemoteStore, NetworkProbe, SyncSchedule,
};

#[derive(Parser, Debug)]
#[command(name = "gift-sync")]
#[command(about = "Offline-first sync for the gift tracker")]
struct Args {
    /// Directory holding config.json and store.json
    #[arg(long, global = true, default_value = ".gift-sync")]
    data_dir: PathBuf,

    /// Account to act for (defaults to user_id in config.json)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync periodically until Ctrl+C
    Run,
    /// Run one sync cycle and print the resulting state
    Sync,
    /// Show queued and failed operations
    Status,
    /// Record every entity in a JSON array file as a local create
    Import { file: PathBuf },
    /// Delete an entity locally and queue the remote delete
    Delete {
        #[arg(long = "type")]
        entity_type: EntityType,
        #[arg(long)]
        id: String,
    },
    /// Give operations that exhausted their retries another chance
    Retry {
        /// Only this queue item (default: all)
        #[arg(long)]
        id: Option<String>,
    },
}

type Manager = SyncManager<FileLocalStore, HttpRemoteStore>;

/// Everything a sync cycle needs.
struct Remote {
    manager: Manager,
    gate: Arc<SharedGate>,
    probe: NetworkProbe,
}

struct Daemon {
    config: DaemonConfig,
    user_id: String,
    local: Arc<FileLocalStore>,
}

impl Daemon {
    async fn open(args: &Args) -> Result<Self> {
        let config = DaemonConfig::load(&args.data_dir)?;
        let user_id = args
            .user
            .clone()
            .or_else(|| config.user_id.clone())
            .context("No user configured: pass --user or set user_id in config.json")?;
        let local = FileLocalStore::open(&args.data_dir)
            .await
            .with_context(|| format!("Failed to open local store in {:?}", args.data_dir))?;
        debug!("Local store: {:?}", local.path());

        Ok(Self {
            config,
            user_id,
            local: Arc::new(local),
        })
    }

    fn queue(&self) -> SyncQueue<FileLocalStore> {
        SyncQueue::new(Arc::clone(&self.local))
    }

    fn repository(&self) -> OfflineRepository<FileLocalStore> {
        OfflineRepository::new(self.queue(), Arc::clone(&self.local))
    }

    fn remote(&self) -> Result<Remote> {
        let settings = &self.config.remote;
        let base_url = settings
            .base_url
            .as_deref()
            .context("remote.base_url is not set in config.json")?;

        let store = HttpRemoteStore::new(base_url, settings.api_token.clone(), settings.timeout())?;
        let probe = NetworkProbe::new(base_url)?;
        let gate = Arc::new(SharedGate::new(
            settings.enabled,
            false,
            Some(self.user_id.clone()),
        ));
        let manager = SyncManager::new(
            Arc::clone(&self.local),
            Arc::new(store),
            gate.clone(),
            self.config.sync.clone(),
        );

        Ok(Remote {
            manager,
            gate,
            probe,
        })
    }

    async fn sync_once(&self) -> Result<()> {
        let remote = self.remote()?;
        remote.probe.refresh(&remote.gate).await;

        let status = remote.gate.status(&self.user_id);
        if !status.is_ready() {
            warn!("Sync not possible right now: {:?}", status);
        }
        let state = remote.manager.trigger_sync(&self.user_id).await?;
        println!("{}", serde_json::to_string_pretty(&state)?);
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let remote = self.remote()?;
        let mut schedule = SyncSchedule::from_config(&self.config);

        let _auth_watch = remote.manager.events().subscribe(|event| {
            if let SyncEvent::AuthExpired { user_id, .. } = event {
                error!(
                    "Remote store rejected credentials for {}; \
                     update remote.api_token in config.json",
                    user_id
                );
            }
        });

        info!(
            "Syncing {} every {:?}. Press Ctrl+C to stop.",
            self.user_id,
            self.config.sync_interval()
        );

        loop {
            remote.probe.refresh(&remote.gate).await;

            let outcome = match remote.gate.status(&self.user_id) {
                status if !status.is_ready() => {
                    debug!("Skipping cycle: {:?}", status);
                    CycleOutcome::Skipped
                }
                _ => match remote.manager.trigger_sync(&self.user_id).await {
                    Ok(state) if state.error.is_none() => CycleOutcome::Clean,
                    Ok(_) => CycleOutcome::Failed,
                    Err(e) => {
                        error!("Sync cycle failed: {}", e);
                        CycleOutcome::Failed
                    }
                },
            };

            let delay = schedule.next_delay(outcome);
            if outcome == CycleOutcome::Failed {
                info!(
                    "Retrying in {:.0}s ({} consecutive failure(s))",
                    delay.as_secs_f64(),
                    schedule.failures()
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn status(&self) -> Result<()> {
        let queue = self.queue();
        let counts = queue.counts(&self.user_id).await?;
        let terminal: Vec<_> = queue
            .list_terminal()
            .await?
            .into_iter()
            .filter(|i| i.user_id == self.user_id)
            .map(|i| {
                json!({
                    "id": i.id,
                    "entityType": i.entity_type,
                    "entityId": i.entity_id,
                    "operation": i.operation,
                    "retryCount": i.retry_count,
                    "lastError": i.last_error,
                })
            })
            .collect();

        let report = json!({
            "userId": self.user_id,
            "pendingOperations": counts.pending,
            "failedOperations": counts.terminal,
            "failed": terminal,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    async fn import(&self, file: &Path) -> Result<()> {
        let content = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("Failed to read {:?}", file))?;
        let entities: Vec<Entity> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?} as a JSON array of entities", file))?;

        let repo = self.repository();
        let mut imported = 0;
        for entity in entities {
            if entity.user_id() != self.user_id {
                warn!(
                    "Skipping {} {}: owned by {}",
                    entity.entity_type(),
                    entity.id(),
                    entity.user_id()
                );
                continue;
            }
            repo.create(entity).await?;
            imported += 1;
        }

        info!("Imported {} entity(ies)", imported);
        Ok(())
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<()> {
        let repo = self.repository();
        match repo.get(entity_type, id).await? {
            Some(entity) if entity.user_id() == self.user_id => {}
            Some(_) => bail!("{} {} belongs to another user", entity_type, id),
            None => bail!("No {} with id {}", entity_type, id),
        }
        repo.delete(&self.user_id, entity_type, id).await?;
        info!("Deleted {} {}; remote delete queued", entity_type, id);
        Ok(())
    }

    async fn retry(&self, id: Option<&str>) -> Result<()> {
        let queue = self.queue();
        let items: Vec<_> = queue
            .list_terminal()
            .await?
            .into_iter()
            .filter(|i| i.user_id == self.user_id)
            .filter(|i| id.is_none_or(|id| i.id == id))
            .collect();

        if let Some(id) = id {
            if items.is_empty() {
                bail!("No failed queue item with id {}", id);
            }
        }

        for item in &items {
            queue.requeue(&item.id).await?;
            debug!(
                "Requeued {:?} {} {}",
                item.operation, item.entity_type, item.entity_id
            );
        }
        info!("Requeued {} operation(s)", items.len());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,gift_sync_core=debug,gift_sync_daemon=debug"
    } else {
        "info,gift_sync_core=info,gift_sync_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let daemon = Daemon::open(&args).await?;

    match &args.command {
        Command::Run => daemon.run().await,
        Command::Sync => daemon.sync_once().await,
        Command::Status => daemon.status().await,
        Command::Import { file } => daemon.import(file).await,
        Command::Delete { entity_type, id } => daemon.delete(*entity_type, id).await,
        Command::Retry { id } => daemon.retry(id.as_deref()).await,
    }
}
