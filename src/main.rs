//! Command line front end for the sync engine

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ledger_sync::cache::BlobCache;
use ledger_sync::config::{BackendConfig, EngineConfig};
use ledger_sync::db::Database;
use ledger_sync::sync::{
    AttachmentQueue, AttachmentRemote, BackgroundScheduler, FileSyncAdapter, HistoryManager,
    PassOutcome, RecordStore, SchedulerConfig, StructuredSyncAdapter, SyncAdapter, SyncApiClient,
    SyncManager, Transaction, WebDavClient, WebDavCredentials,
};

#[derive(Parser)]
#[command(name = "ledger-sync", version, about = "Offline-first ledger synchronization")]
struct Cli {
    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one pull/merge/push pass
    Sync,
    /// Upload queued attachments
    Drain,
    /// Show sync, queue and log summary
    Status,
    /// Show recent sync log entries
    Log {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
        /// Delete entries older than this many days first
        #[arg(long)]
        purge_days: Option<i64>,
    },
    /// Keep syncing in the background until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let db_path = match cli.db {
        Some(path) => path,
        None => ledger_sync::default_database_path().context("Failed to prepare data directory")?,
    };
    log::info!("Database path: {:?}", db_path);
    let db = Arc::new(Database::new(db_path).context("Failed to open database")?);

    let config = EngineConfig::load(&db)?;
    let history = Arc::new(HistoryManager::new(db.clone())?);

    if let Command::Log { limit, purge_days } = cli.command {
        if let Some(days) = purge_days {
            let purged = history.enforce_retention_policy(days)?;
            println!("Purged {} entries older than {} days", purged, days);
        }
        for entry in history.recent(limit)? {
            println!(
                "{}  {:<10} {:<8} {}",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.direction.as_str(),
                entry.outcome.as_str(),
                entry.message
            );
        }
        return Ok(());
    }

    let store = RecordStore::new(db.clone());
    let cache = BlobCache::new(db.clone(), config.attachment_cache_budget_bytes);
    let backend = config
        .backend
        .clone()
        .context("No backend configured, set LEDGER_SYNC_BACKEND")?;

    match backend {
        BackendConfig::Files {
            server_url,
            remote_path,
            username,
            password,
        } => {
            let client = Arc::new(WebDavClient::new(
                &server_url,
                &remote_path,
                WebDavCredentials { username, password },
                config.request_timeout(),
            )?);
            if matches!(cli.command, Command::Status) {
                match client.test_connection().await {
                    Ok(true) => println!("Connection:      ok ({})", server_url),
                    Ok(false) => println!("Connection:      {} did not list the sync folder", server_url),
                    Err(e) => println!("Connection:      failed ({})", e),
                }
            } else {
                client.mkdir_p("").await.context("Failed to prepare remote directory")?;
            }

            let adapter = FileSyncAdapter::new(store.clone(), client.clone());
            let engine = Engine::new(adapter, client, &db, &history, cache, &config);
            engine.run(cli.command, store, &config).await
        }
        BackendConfig::Structured { base_url, token } => {
            let client = Arc::new(SyncApiClient::new(&base_url, config.request_timeout())?);
            client.set_token(token).await;
            if matches!(cli.command, Command::Status) {
                match client.test_connection().await {
                    Ok(version) => println!("Connection:      ok (server version {})", version),
                    Err(e) => println!("Connection:      failed ({})", e),
                }
            }

            let adapter = StructuredSyncAdapter::new(store.clone(), client.clone());
            let engine = Engine::new(adapter, client, &db, &history, cache, &config);
            engine.run(cli.command, store, &config).await
        }
    }
}

struct Engine<A: SyncAdapter> {
    manager: Arc<SyncManager<A>>,
    queue: Arc<AttachmentQueue>,
}

impl<A: SyncAdapter> Engine<A> {
    fn new(
        adapter: A,
        attachments: Arc<dyn AttachmentRemote>,
        db: &Arc<Database>,
        history: &Arc<HistoryManager>,
        cache: BlobCache,
        config: &EngineConfig,
    ) -> Self {
        let manager = SyncManager::new(adapter, db.clone(), history.clone(), config.sync_options());
        manager.set_enabled(config.enabled);
        let queue = AttachmentQueue::new(db.clone(), cache, attachments, history.clone());
        Self {
            manager: Arc::new(manager),
            queue: Arc::new(queue),
        }
    }

    async fn run(&self, command: Command, store: RecordStore, config: &EngineConfig) -> anyhow::Result<()> {
        match command {
            Command::Sync => match self.manager.sync_now().await? {
                PassOutcome::Completed(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                PassOutcome::Coalesced => println!("A sync pass is already running"),
            },
            Command::Drain => {
                let report = self.queue.drain().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Command::Status => {
                println!("Device:          {}", config.device_id);
                println!("Backend:         {}", self.manager.adapter().name());
                println!("Sync enabled:    {}", self.manager.is_enabled());
                println!("Outgoing batch:  {} records", store.pending_batch()?.len());
                for scope in store.scopes::<Transaction>()? {
                    let live = store
                        .in_scope::<Transaction>(&scope)?
                        .iter()
                        .filter(|t| !t.is_deleted)
                        .count();
                    println!("  {:<28} {} transactions", scope, live);
                }
                match self.manager.remote_changed().await {
                    Ok(changed) => println!("Remote changed:  {}", changed),
                    Err(e) => println!("Remote changed:  unknown ({})", e),
                }
                let history = self.manager.history().get_stats()?;
                println!("{}", serde_json::to_string_pretty(&history)?);
                let queue = self.queue.get_stats()?;
                println!("{}", serde_json::to_string_pretty(&queue)?);
            }
            Command::Watch => {
                let scheduler = BackgroundScheduler::new(
                    self.manager.clone(),
                    Some(self.queue.clone()),
                    SchedulerConfig::from(config),
                );
                scheduler.start(store.subscribe()).await?;
                scheduler.trigger_sync().await?;

                tokio::signal::ctrl_c().await?;
                log::info!("Interrupted, shutting down");
                scheduler.stop().await?;
            }
            Command::Log { .. } => {}
        }
        Ok(())
    }
}
