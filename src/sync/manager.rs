//! Sync Manager - Orchestrates synchronization passes
//!
//! A pass runs `pull -> merge -> push` against one [`SyncAdapter`]. The
//! phases are tracked by [`SyncMachine`], owned by the running pass:
//!
//! ```text
//! Idle -> Pulling -> Merging -> Pushing -> Idle
//!                                  |
//!                                  +-(conflict)-> Pulling   (bounded)
//!                                  +-(exhausted / error)-> Failed
//! ```
//!
//! Only one pass runs at a time. A trigger arriving while a pass is in flight
//! is coalesced, since the running pass re-reads local state at push time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::db::Database;

use super::error::{SyncError, SyncResult};
use super::history::{HistoryManager, LogOutcome, SyncDirection};
use super::store::MergeStats;

/// Each phase may span several requests
const PHASE_TIMEOUT_FACTOR: u32 = 4;

// ============================================================================
// Adapter Seam
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushStats {
    /// Remote writes performed
    pub written: usize,
    /// Writes avoided because the remote already had the content
    pub skipped: usize,
    /// Remote version this cycle read and wrote, excluding anything written
    /// by others after the pull
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_version: Option<String>,
}

/// One remote backend, seen as a three-phase reconciliation
#[async_trait]
pub trait SyncAdapter: Send + Sync + 'static {
    /// What `pull` saw; handed to `merge` and `push` of the same cycle
    type Snapshot: Send + Sync;

    fn name(&self) -> &'static str;

    async fn pull(&self) -> SyncResult<Self::Snapshot>;

    async fn merge(&self, snapshot: &Self::Snapshot) -> SyncResult<MergeStats>;

    async fn push(&self, snapshot: &Self::Snapshot) -> SyncResult<PushStats>;

    /// Cheap fingerprint of the remote state, for polling
    async fn remote_version(&self) -> SyncResult<String>;
}

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Pulling,
    Merging,
    Pushing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    Start,
    Pulled,
    Merged,
    Pushed,
    Conflict,
    Error,
}

#[derive(Debug, Clone)]
pub struct SyncMachine {
    phase: SyncPhase,
    attempt: u32,
    max_retries: u32,
}

impl SyncMachine {
    pub fn new(max_retries: u32) -> Self {
        Self {
            phase: SyncPhase::Idle,
            attempt: 0,
            max_retries,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Current cycle number within the pass, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Apply an event. Returns `None` and leaves the phase untouched when the
    /// event is not valid in the current phase.
    pub fn apply(&mut self, event: SyncEvent) -> Option<SyncPhase> {
        use SyncEvent::*;
        use SyncPhase::*;

        let next = match (self.phase, event) {
            (Idle | Failed, Start) => {
                self.attempt = 1;
                Pulling
            }
            (Pulling, Pulled) => Merging,
            (Merging, Merged) => Pushing,
            (Pushing, SyncEvent::Pushed) => Idle,
            (Pulling | Merging | Pushing, Conflict) => {
                if self.attempt <= self.max_retries {
                    self.attempt += 1;
                    Pulling
                } else {
                    Failed
                }
            }
            (Pulling | Merging | Pushing, Error) => Failed,
            _ => return None,
        };

        self.phase = next;
        Some(next)
    }
}

// ============================================================================
// Status & Reports
// ============================================================================

/// Published through a watch channel after every phase change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub attempt: u32,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pending_attachments: usize,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            attempt: 0,
            last_sync_at: None,
            last_error: None,
            pending_attachments: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub backend: String,
    pub attempts: u32,
    pub applied: usize,
    pub kept_local: usize,
    pub skipped_files: usize,
    pub written: usize,
    pub unchanged: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum PassOutcome {
    Completed(SyncReport),
    /// Another pass was already running
    Coalesced,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub max_conflict_retries: u32,
    pub request_timeout: Duration,
    /// Base of the randomized delay between conflict retries
    pub retry_base_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            request_timeout: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(250),
        }
    }
}

// ============================================================================
// Sync Manager
// ============================================================================

pub struct SyncManager<A: SyncAdapter> {
    adapter: Arc<A>,
    db: Arc<Database>,
    history: Arc<HistoryManager>,
    options: SyncOptions,
    enabled: AtomicBool,
    in_flight: Mutex<()>,
    status: watch::Sender<SyncStatus>,
}

impl<A: SyncAdapter> SyncManager<A> {
    pub fn new(adapter: A, db: Arc<Database>, history: Arc<HistoryManager>, options: SyncOptions) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            adapter: Arc::new(adapter),
            db,
            history,
            options,
            enabled: AtomicBool::new(true),
            in_flight: Mutex::new(()),
            status,
        }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn history(&self) -> &Arc<HistoryManager> {
        &self.history
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Whether the most recent pass ended in an error
    pub fn last_pass_failed(&self) -> bool {
        self.status.borrow().last_error.is_some()
    }

    pub fn set_pending_attachments(&self, pending: usize) {
        self.status.send_modify(|s| s.pending_attachments = pending);
    }

    /// Run one pass now, or coalesce into the one already running
    pub async fn sync_now(&self) -> SyncResult<PassOutcome> {
        if !self.is_enabled() {
            return Err(SyncError::Disabled);
        }

        let Ok(_guard) = self.in_flight.try_lock() else {
            log::debug!("Sync already in flight, coalescing trigger");
            return Ok(PassOutcome::Coalesced);
        };

        let started_at = Utc::now();
        let mut machine = SyncMachine::new(self.options.max_conflict_retries);
        self.transition(&mut machine, SyncEvent::Start);
        log::info!("Starting {} sync pass", self.adapter.name());

        loop {
            let error = match self.run_cycle(&mut machine).await {
                Ok((merge, push)) => {
                    self.transition(&mut machine, SyncEvent::Pushed);
                    return Ok(PassOutcome::Completed(
                        self.finish(machine.attempt(), started_at, merge, push).await,
                    ));
                }
                Err(e) => e,
            };

            if error.is_retryable_conflict() {
                self.history.record_quietly(
                    SyncDirection::Push,
                    LogOutcome::Conflict,
                    &format!("Attempt {}: {}", machine.attempt(), error),
                    Some(&error),
                );

                if self.transition(&mut machine, SyncEvent::Conflict) == Some(SyncPhase::Pulling) {
                    let delay = self.retry_delay(machine.attempt());
                    log::warn!(
                        "Sync conflict ({}), retrying whole cycle in {:?} (attempt {})",
                        error,
                        delay,
                        machine.attempt()
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                let exhausted = format!(
                    "Remote kept changing after {} attempts, try again later",
                    machine.attempt()
                );
                return Err(self.fail(SyncError::ConflictDetected(exhausted)));
            }

            self.transition(&mut machine, SyncEvent::Error);
            return Err(self.fail(error));
        }
    }

    /// Whether the remote moved since the last completed pass
    pub async fn remote_changed(&self) -> SyncResult<bool> {
        let version = self.timed(self.adapter.remote_version()).await?;
        let last: Option<String> = self.db.get_setting(&self.version_key())?;
        Ok(last.as_deref() != Some(version.as_str()))
    }

    async fn run_cycle(&self, machine: &mut SyncMachine) -> SyncResult<(MergeStats, PushStats)> {
        let snapshot = self.timed(self.adapter.pull()).await?;
        self.transition(machine, SyncEvent::Pulled);

        let merge = self.adapter.merge(&snapshot).await?;
        for reason in &merge.skipped {
            self.history.record_quietly(
                SyncDirection::Pull,
                LogOutcome::Skipped,
                reason,
                Some(&SyncError::malformed("remote", reason)),
            );
        }
        log::debug!("Merged {} remote records, kept {} local", merge.applied, merge.kept_local);
        self.transition(machine, SyncEvent::Merged);

        let push = self.timed(self.adapter.push(&snapshot)).await?;
        Ok((merge, push))
    }

    async fn finish(&self, attempts: u32, started_at: DateTime<Utc>, merge: MergeStats, push: PushStats) -> SyncReport {
        let report = SyncReport {
            backend: self.adapter.name().to_string(),
            attempts,
            applied: merge.applied,
            kept_local: merge.kept_local,
            skipped_files: merge.skipped.len(),
            written: push.written,
            unchanged: push.skipped,
            started_at,
            finished_at: Utc::now(),
        };

        self.history.record_quietly(
            SyncDirection::Pull,
            LogOutcome::Success,
            &format!("Applied {} remote changes, kept {} local", report.applied, report.kept_local),
            None,
        );
        self.history.record_quietly(
            SyncDirection::Push,
            LogOutcome::Success,
            &format!("Wrote {} items, {} unchanged", report.written, report.unchanged),
            None,
        );

        self.status.send_modify(|s| {
            s.last_sync_at = Some(report.finished_at);
            s.last_error = None;
        });

        // Remember what this pass saw so polling can skip idle pulls. Writes by
        // others after the pull must still look new to the next poll.
        match &push.observed_version {
            Some(version) => {
                if let Err(e) = self.db.set_setting(&self.version_key(), version) {
                    log::warn!("Failed to remember remote version: {}", e);
                }
            }
            None => log::debug!("{} pass reported no remote version", report.backend),
        }

        log::info!(
            "{} sync completed in {} attempt(s): {} applied, {} written, {} unchanged",
            report.backend,
            report.attempts,
            report.applied,
            report.written,
            report.unchanged
        );
        report
    }

    fn fail(&self, error: SyncError) -> SyncError {
        log::error!("{} sync failed: {}", self.adapter.name(), error);
        self.history
            .record_quietly(SyncDirection::Push, LogOutcome::Failed, &error.to_string(), Some(&error));
        self.status.send_modify(|s| s.last_error = Some(error.to_string()));
        error
    }

    fn transition(&self, machine: &mut SyncMachine, event: SyncEvent) -> Option<SyncPhase> {
        let next = machine.apply(event);
        match next {
            Some(phase) => {
                let attempt = machine.attempt();
                self.status.send_modify(|s| {
                    s.phase = phase;
                    s.attempt = attempt;
                });
            }
            None => log::error!("Ignoring sync event {:?} in phase {:?}", event, machine.phase()),
        }
        next
    }

    /// Exponential backoff with jitter, so devices that collided spread out
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.options.retry_base_delay;
        let exp = base.saturating_mul(1u32 << attempt.saturating_sub(2).min(6));
        let jitter_ms = base.as_millis().max(1) as u64;
        exp + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    async fn timed<T>(&self, fut: impl std::future::Future<Output = SyncResult<T>>) -> SyncResult<T> {
        let limit = self.options.request_timeout.saturating_mul(PHASE_TIMEOUT_FACTOR);
        tokio::time::timeout(limit, fut).await?
    }

    fn version_key(&self) -> String {
        format!("remote_version:{}", self.adapter.name())
    }
}

// ============================================================================
// Tests
// ============================================================================
