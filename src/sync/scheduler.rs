//! Background Sync Scheduler
//!
//! Turns signals into sync passes:
//! - Local mutations restart a debounce timer; a pass runs once the store
//!   has been quiet for the debounce period
//! - Explicit `SyncNow` requests run a pass immediately
//! - A low-frequency poll compares the remote version with the one seen by
//!   the last pass and only pulls when it moved, or when the last pass failed
//!   and local changes may still be waiting
//! - Coming back online triggers both a pass and an attachment drain
//!
//! Passes are spawned; overlapping triggers are coalesced by the manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::manager::{PassOutcome, SyncAdapter, SyncManager};
use super::queue::AttachmentQueue;
use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// A record was written locally
    LocalChange,
    /// Manual request
    SyncNow,
    SetOnline(bool),
    SetEnabled(bool),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub online: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            poll_interval: Duration::from_secs(300),
            online: true,
        }
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            debounce: config.debounce(),
            poll_interval: config.poll_interval(),
            online: config.online,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,
}

/// Background scheduler for automatic sync passes
pub struct BackgroundScheduler<A: SyncAdapter> {
    manager: Arc<SyncManager<A>>,
    queue: Option<Arc<AttachmentQueue>>,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
    commands: Mutex<Option<mpsc::UnboundedSender<SchedulerCommand>>>,
}

impl<A: SyncAdapter> BackgroundScheduler<A> {
    pub fn new(
        manager: Arc<SyncManager<A>>,
        queue: Option<Arc<AttachmentQueue>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            manager,
            queue,
            config,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Mutex::new(None),
            commands: Mutex::new(None),
        }
    }

    /// Start the background loop, listening to the store's change counter
    pub async fn start(&self, changes: watch::Receiver<u64>) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            manager: self.manager.clone(),
            queue: self.queue.clone(),
            config: self.config.clone(),
            online: self.config.online,
            debounce_deadline: None,
        };
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            worker.run(rx, changes).await;
            running.store(false, Ordering::SeqCst);
        });

        *self.task_handle.lock().await = Some(handle);
        *self.commands.lock().await = Some(tx);

        log::info!(
            "Background scheduler started (debounce {:?}, poll every {:?})",
            self.config.debounce,
            self.config.poll_interval
        );
        Ok(())
    }

    /// Stop the loop and wait for it to exit. In-flight passes finish on
    /// their own.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(tx) = self.commands.lock().await.take() {
            let _ = tx.send(SchedulerCommand::Shutdown);
        }

        if let Some(handle) = self.task_handle.lock().await.take() {
            if let Err(e) = handle.await {
                log::warn!("Scheduler task ended abnormally: {}", e);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn send(&self, command: SchedulerCommand) -> Result<(), SchedulerError> {
        let commands = self.commands.lock().await;
        let tx = commands.as_ref().ok_or(SchedulerError::NotRunning)?;
        tx.send(command).map_err(|_| SchedulerError::NotRunning)
    }

    pub async fn trigger_sync(&self) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::SyncNow).await
    }

    pub async fn set_online(&self, online: bool) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::SetOnline(online)).await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::SetEnabled(enabled)).await
    }
}

/// State owned by the background loop
struct Worker<A: SyncAdapter> {
    manager: Arc<SyncManager<A>>,
    queue: Option<Arc<AttachmentQueue>>,
    config: SchedulerConfig,
    online: bool,
    debounce_deadline: Option<Instant>,
}

impl<A: SyncAdapter> Worker<A> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
        mut changes: watch::Receiver<u64>,
    ) {
        let mut poll = tokio::time::interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watching_changes = true;

        log::info!("Scheduler loop started");

        loop {
            let deadline = self.debounce_deadline;
            let debounce = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(SchedulerCommand::Shutdown) => break,
                    Some(command) => self.handle(command),
                },
                changed = changes.changed(), if watching_changes => {
                    if changed.is_ok() {
                        self.handle(SchedulerCommand::LocalChange);
                    } else {
                        log::debug!("Record store dropped, no more change signals");
                        watching_changes = false;
                    }
                },
                _ = debounce => {
                    self.debounce_deadline = None;
                    log::debug!("Debounce elapsed, starting sync");
                    self.spawn_pass();
                    self.spawn_drain();
                },
                _ = poll.tick() => {
                    if self.can_sync() {
                        self.spawn_poll();
                    }
                },
            }
        }

        log::info!("Scheduler loop exited");
    }

    fn handle(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::LocalChange => {
                if self.can_sync() {
                    self.debounce_deadline = Some(Instant::now() + self.config.debounce);
                }
            }
            SchedulerCommand::SyncNow => {
                self.debounce_deadline = None;
                self.spawn_pass();
                self.spawn_drain();
            }
            SchedulerCommand::SetOnline(online) => {
                let reconnected = online && !self.online;
                self.online = online;
                if !online {
                    self.debounce_deadline = None;
                } else if reconnected && self.manager.is_enabled() {
                    log::info!("Back online, syncing");
                    self.spawn_pass();
                    self.spawn_drain();
                }
            }
            SchedulerCommand::SetEnabled(enabled) => {
                let resumed = enabled && !self.manager.is_enabled();
                self.manager.set_enabled(enabled);
                if !enabled {
                    self.debounce_deadline = None;
                } else if resumed && self.online {
                    // Edits made while disabled never armed the debounce
                    log::info!("Sync re-enabled, syncing");
                    self.spawn_pass();
                    self.spawn_drain();
                }
            }
            SchedulerCommand::Shutdown => {}
        }
    }

    fn can_sync(&self) -> bool {
        self.online && self.manager.is_enabled()
    }

    fn spawn_pass(&self) {
        let manager = self.manager.clone();
        tokio::spawn(async move { run_pass(&manager).await });
    }

    fn spawn_poll(&self) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            if manager.last_pass_failed() {
                log::info!("Retrying after failed sync pass");
                run_pass(&manager).await;
                return;
            }
            match manager.remote_changed().await {
                Ok(true) => {
                    log::info!("Remote version moved, starting sync");
                    run_pass(&manager).await;
                }
                Ok(false) => log::debug!("Remote unchanged, skipping pull"),
                Err(e) => log::warn!("Version poll failed: {}", e),
            }
        });
    }

    fn spawn_drain(&self) {
        let Some(queue) = self.queue.clone() else { return };
        let manager = self.manager.clone();
        tokio::spawn(async move {
            match queue.drain().await {
                Ok(report) if !report.coalesced => {
                    if report.uploaded + report.failed > 0 {
                        log::info!(
                            "Attachment drain: {} uploaded, {} failed",
                            report.uploaded,
                            report.failed
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => log::error!("Attachment drain failed: {}", e),
            }
            match queue.pending() {
                Ok(pending) => manager.set_pending_attachments(pending.len()),
                Err(e) => log::warn!("Failed to count pending attachments: {}", e),
            }
        });
    }
}

async fn run_pass<A: SyncAdapter>(manager: &SyncManager<A>) {
    match manager.sync_now().await {
        Ok(PassOutcome::Completed(report)) => {
            log::debug!("Background pass done in {} attempt(s)", report.attempts);
        }
        Ok(PassOutcome::Coalesced) => {}
        // Already recorded in the sync log by the manager
        Err(e) => log::debug!("Background pass failed: {}", e),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::error::{SyncError, SyncResult};
    use crate::sync::history::HistoryManager;
    use crate::sync::manager::{PushStats, SyncOptions};
    use crate::sync::store::MergeStats;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingAdapter {
        pulls: AtomicUsize,
        pushes: AtomicUsize,
        version: AtomicUsize,
        offline: AtomicBool,
    }

    impl CountingAdapter {
        fn reachable(&self) -> SyncResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(SyncError::NetworkFailure("connection refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SyncAdapter for CountingAdapter {
        type Snapshot = ();

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn pull(&self) -> SyncResult<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            self.reachable()
        }

        async fn merge(&self, _: &()) -> SyncResult<MergeStats> {
            Ok(MergeStats::default())
        }

        async fn push(&self, _: &()) -> SyncResult<PushStats> {
            self.reachable()?;
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(PushStats {
                observed_version: Some(self.version.load(Ordering::SeqCst).to_string()),
                ..PushStats::default()
            })
        }

        async fn remote_version(&self) -> SyncResult<String> {
            self.reachable()?;
            Ok(self.version.load(Ordering::SeqCst).to_string())
        }
    }

    fn scheduler(config: SchedulerConfig) -> BackgroundScheduler<CountingAdapter> {
        let db = Arc::new(Database::in_memory().unwrap());
        let history = Arc::new(HistoryManager::new(db.clone()).unwrap());
        let manager = Arc::new(SyncManager::new(
            CountingAdapter::default(),
            db,
            history,
            SyncOptions::default(),
        ));
        BackgroundScheduler::new(manager, None, config)
    }

    fn pulls(scheduler: &BackgroundScheduler<CountingAdapter>) -> usize {
        scheduler.manager.adapter().pulls.load(Ordering::SeqCst)
    }

    fn pushes(scheduler: &BackgroundScheduler<CountingAdapter>) -> usize {
        scheduler.manager.adapter().pushes.load(Ordering::SeqCst)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_stop() {
        let scheduler = scheduler(SchedulerConfig::default());
        let (_tx, rx) = watch::channel(0u64);

        assert!(!scheduler.is_running());
        scheduler.start(rx.clone()).await.unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start(rx).await, Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
        assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));
        assert!(matches!(scheduler.trigger_sync().await, Err(SchedulerError::NotRunning)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_bursts() {
        let scheduler = scheduler(SchedulerConfig {
            debounce: Duration::from_secs(3),
            poll_interval: Duration::from_secs(3600),
            online: true,
        });
        let (tx, rx) = watch::channel(0u64);
        scheduler.start(rx).await.unwrap();

        for i in 1..=5 {
            tx.send(i).unwrap();
            settle().await;
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert_eq!(pulls(&scheduler), 0);

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(pulls(&scheduler), 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_suppresses_debounce() {
        let scheduler = scheduler(SchedulerConfig {
            debounce: Duration::from_secs(1),
            poll_interval: Duration::from_secs(3600),
            online: false,
        });
        let (tx, rx) = watch::channel(0u64);
        scheduler.start(rx).await.unwrap();

        tx.send(1).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(pulls(&scheduler), 0);

        // reconnecting syncs right away
        scheduler.set_online(true).await.unwrap();
        settle().await;
        assert_eq!(pulls(&scheduler), 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_only_syncs_when_remote_moved() {
        let scheduler = scheduler(SchedulerConfig {
            debounce: Duration::from_secs(1),
            poll_interval: Duration::from_secs(60),
            online: true,
        });
        let (_tx, rx) = watch::channel(0u64);
        scheduler.start(rx).await.unwrap();

        scheduler.trigger_sync().await.unwrap();
        settle().await;
        assert_eq!(pulls(&scheduler), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(pulls(&scheduler), 1);

        scheduler.manager.adapter().version.store(1, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(pulls(&scheduler), 2);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_retries_after_failed_pass() {
        let scheduler = scheduler(SchedulerConfig {
            debounce: Duration::from_secs(1),
            poll_interval: Duration::from_secs(60),
            online: true,
        });
        let (tx, rx) = watch::channel(0u64);
        scheduler.start(rx).await.unwrap();

        scheduler.trigger_sync().await.unwrap();
        settle().await;
        assert_eq!(pushes(&scheduler), 1);

        // A local edit whose pass cannot reach the remote
        scheduler.manager.adapter().offline.store(true, Ordering::SeqCst);
        tx.send(1).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(pulls(&scheduler), 2);
        assert_eq!(pushes(&scheduler), 1);
        assert!(scheduler.manager.last_pass_failed());

        // Remote back, version unchanged: the next poll still pushes
        scheduler.manager.adapter().offline.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(pushes(&scheduler), 2);
        assert!(!scheduler.manager.last_pass_failed());

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reenabling_syncs_pending_edits() {
        let scheduler = scheduler(SchedulerConfig {
            debounce: Duration::from_secs(1),
            poll_interval: Duration::from_secs(3600),
            online: true,
        });
        let (tx, rx) = watch::channel(0u64);
        scheduler.start(rx).await.unwrap();

        scheduler.set_enabled(false).await.unwrap();
        settle().await;
        tx.send(1).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(pulls(&scheduler), 0);

        scheduler.set_enabled(true).await.unwrap();
        settle().await;
        assert_eq!(pulls(&scheduler), 1);
        assert_eq!(pushes(&scheduler), 1);

        scheduler.stop().await.unwrap();
    }
}
