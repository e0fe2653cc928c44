//! The sync cycle: flush the outbox, fetch the remote set, diff it against the
//! local collection by quote text, then merge or hold the diff for the user.
//!
//! ```text
//! idle -> flushing-outbox -> fetching -> { no-change | auto-merged | awaiting-manual-resolution } -> idle
//! ```
//!
//! `awaiting-manual-resolution` is left only through [`SyncEngine::accept_all`],
//! [`SyncEngine::resolve`] or [`SyncEngine::dismiss`].
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::db::Pool;
use crate::model::{ConflictMode, Quote, RemoteQuote, SyncState};
use crate::outbox::{FlushReport, Outbox, RetryPolicy};
use crate::remote::RemoteService;
use crate::store::QuoteStore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("no sync diff is awaiting resolution")]
    NothingPending,
}

/// A quote present on both sides whose categories differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub local: Quote,
    pub remote: RemoteQuote,
}

/// Remote items that are absent locally (`new`) or disagree on category
/// (`conflicts`). The two sets never share a text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncDiff {
    pub new: Vec<RemoteQuote>,
    pub conflicts: Vec<Conflict>,
}

impl SyncDiff {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.conflicts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another cycle was still running.
    Skipped,
    /// The remote set could not be fetched; local state is untouched.
    FetchFailed { reason: String },
    NoChange,
    AutoMerged { added: usize, replaced: usize },
    AwaitingResolution(SyncDiff),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub flush: FlushReport,
    pub outcome: SyncOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    KeepLocal,
    UseRemote,
}

/// The user's answers to a pending diff. New items not listed in `accept` and
/// conflicts not listed in `conflicts` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub accept: HashSet<String>,
    pub conflicts: HashMap<String, ConflictChoice>,
}

impl Resolution {
    pub fn accept_all(diff: &SyncDiff) -> Self {
        Self {
            accept: diff.new.iter().map(|rq| rq.text.clone()).collect(),
            conflicts: diff
                .conflicts
                .iter()
                .map(|c| (c.remote.text.clone(), ConflictChoice::UseRemote))
                .collect(),
        }
    }

    pub fn accept(mut self, text: impl Into<String>) -> Self {
        self.accept.insert(text.into());
        self
    }

    pub fn choose(mut self, text: impl Into<String>, choice: ConflictChoice) -> Self {
        self.conflicts.insert(text.into(), choice);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolutionSummary {
    pub accepted: usize,
    pub replaced: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { remote_id: String },
    Queued { outbox_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub quote: Quote,
    pub delivery: Delivery,
}

/// Compare the remote set against the local one by text. Only the first
/// occurrence of a text on either side is considered.
pub fn diff(local: &[Quote], remote: &[RemoteQuote]) -> SyncDiff {
    let mut local_by_text: HashMap<&str, &Quote> = HashMap::new();
    for quote in local {
        local_by_text.entry(quote.text.as_str()).or_insert(quote);
    }

    let mut seen = HashSet::new();
    let mut out = SyncDiff::default();
    for rq in remote {
        if !seen.insert(rq.text.as_str()) {
            continue;
        }
        match local_by_text.get(rq.text.as_str()) {
            None => out.new.push(rq.clone()),
            Some(local) if local.category != rq.category => out.conflicts.push(Conflict {
                local: (*local).clone(),
                remote: rq.clone(),
            }),
            Some(_) => {}
        }
    }
    out
}

/// Remote precedence: local quotes whose text the remote also has are dropped,
/// the rest keep their order, and the remote quotes follow in remote order.
pub fn auto_merge(local: &[Quote], remote: &[RemoteQuote]) -> Vec<Quote> {
    let remote_texts: HashSet<&str> = remote.iter().map(|rq| rq.text.as_str()).collect();
    let mut merged: Vec<Quote> = local
        .iter()
        .filter(|q| !remote_texts.contains(q.text.as_str()))
        .cloned()
        .collect();
    let mut seen = HashSet::new();
    for rq in remote {
        if seen.insert(rq.text.as_str()) {
            merged.push(rq.to_quote());
        }
    }
    merged
}

pub struct SyncEngine {
    store: Arc<Mutex<QuoteStore>>,
    outbox: Arc<Mutex<Outbox>>,
    remote: Arc<dyn RemoteService>,
    mode: ConflictMode,
    single_flight: bool,
    retry: RetryPolicy,
    cycle_guard: Mutex<()>,
    state: std::sync::Mutex<SyncState>,
    pending: std::sync::Mutex<Option<SyncDiff>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("mode", &self.mode)
            .field("single_flight", &self.single_flight)
            .field("retry", &self.retry)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        store: QuoteStore,
        outbox: Outbox,
        remote: Arc<dyn RemoteService>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            outbox: Arc::new(Mutex::new(outbox)),
            remote,
            mode: settings.conflict_mode,
            single_flight: settings.single_flight,
            retry: RetryPolicy::from_settings(settings),
            cycle_guard: Mutex::new(()),
            state: std::sync::Mutex::new(SyncState::Idle),
            pending: std::sync::Mutex::new(None),
        }
    }

    /// Load the collection and the outbox from `pool`.
    pub async fn open(
        pool: Pool,
        remote: Arc<dyn RemoteService>,
        settings: &SyncSettings,
    ) -> Result<Self> {
        let store = QuoteStore::load(pool.clone()).await?;
        let outbox = Outbox::load(pool).await?;
        Ok(Self::new(store, outbox, remote, settings))
    }

    pub fn store(&self) -> &Arc<Mutex<QuoteStore>> {
        &self.store
    }

    pub fn outbox(&self) -> &Arc<Mutex<Outbox>> {
        &self.outbox
    }

    pub fn mode(&self) -> ConflictMode {
        self.mode
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SyncState) {
        debug!(state = state.as_str(), "sync state");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn pending_diff(&self) -> Option<SyncDiff> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_pending(&self, diff: Option<SyncDiff>) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = diff;
    }

    /// Number of quotes not yet acknowledged by the remote side.
    pub async fn unsynced_count(&self) -> usize {
        self.outbox.lock().await.len()
    }

    /// Add a quote locally, then try to deliver it right away.
    ///
    /// The quote is queued before the attempt and the entry removed once the
    /// remote side confirms it, so a failed or cancelled delivery leaves it in
    /// the outbox for the next cycle. The outbox stays locked meanwhile so a
    /// concurrent flush cannot post the same entry.
    #[instrument(skip_all)]
    pub async fn submit_quote(&self, text: &str, category: &str) -> Result<Submission> {
        let quote = self.store.lock().await.add(text, category).await?;
        let mut outbox = self.outbox.lock().await;
        let outbox_id = outbox.enqueue(quote.clone()).await?;
        let delivery = match self.remote.post_quote(&quote).await {
            Ok(created) => {
                outbox.remove(outbox_id).await?;
                info!(remote_id = %created.id, "quote delivered");
                Delivery::Delivered {
                    remote_id: created.id,
                }
            }
            Err(err) => {
                warn!(?err, %outbox_id, "immediate delivery failed; left queued");
                Delivery::Queued { outbox_id }
            }
        };
        Ok(Submission { quote, delivery })
    }

    /// Run one sync cycle.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _guard = if self.single_flight {
            match self.cycle_guard.try_lock() {
                Ok(guard) => Some(guard),
                Err(_) => {
                    info!("previous sync cycle still running; skipping");
                    return Ok(CycleReport {
                        flush: FlushReport::default(),
                        outcome: SyncOutcome::Skipped,
                    });
                }
            }
        } else {
            None
        };

        let resting = if self.pending_diff().is_some() {
            SyncState::AwaitingResolution
        } else {
            SyncState::Idle
        };

        self.set_state(SyncState::FlushingOutbox);
        let flush = {
            let mut outbox = self.outbox.lock().await;
            match outbox.flush(self.remote.as_ref(), self.retry).await {
                Ok(report) => report,
                Err(err) => {
                    self.set_state(resting);
                    return Err(err);
                }
            }
        };

        self.set_state(SyncState::Fetching);
        let remote = match self.remote.fetch_quotes().await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(?err, "failed to fetch remote quotes; keeping local state");
                self.set_state(resting);
                return Ok(CycleReport {
                    flush,
                    outcome: SyncOutcome::FetchFailed {
                        reason: format!("{:#}", err),
                    },
                });
            }
        };

        let mut store = self.store.lock().await;
        let changes = diff(store.quotes(), &remote);
        if changes.is_empty() {
            drop(store);
            self.set_state(resting);
            return Ok(CycleReport {
                flush,
                outcome: SyncOutcome::NoChange,
            });
        }

        let outcome = match self.mode {
            ConflictMode::Auto => {
                let merged = auto_merge(store.quotes(), &remote);
                if let Err(err) = store.replace_all(merged).await {
                    self.set_state(resting);
                    return Err(err);
                }
                // An automatic merge supersedes whatever was waiting for the user.
                self.set_pending(None);
                self.set_state(SyncState::Idle);
                info!(
                    added = changes.new.len(),
                    replaced = changes.conflicts.len(),
                    "remote changes merged"
                );
                SyncOutcome::AutoMerged {
                    added: changes.new.len(),
                    replaced: changes.conflicts.len(),
                }
            }
            ConflictMode::Manual => {
                self.set_pending(Some(changes.clone()));
                self.set_state(SyncState::AwaitingResolution);
                info!(
                    new = changes.new.len(),
                    conflicts = changes.conflicts.len(),
                    "remote changes awaiting resolution"
                );
                SyncOutcome::AwaitingResolution(changes)
            }
        };
        Ok(CycleReport { flush, outcome })
    }

    /// Accept every new remote quote and take the remote side of every conflict.
    pub async fn accept_all(&self) -> Result<ResolutionSummary> {
        let diff = self.pending_diff().ok_or(SyncError::NothingPending)?;
        self.resolve(Resolution::accept_all(&diff)).await
    }

    /// Apply only the selected changes from the pending diff.
    #[instrument(skip_all)]
    pub async fn resolve(&self, resolution: Resolution) -> Result<ResolutionSummary> {
        let diff = self.pending_diff().ok_or(SyncError::NothingPending)?;

        let accepted: Vec<Quote> = diff
            .new
            .iter()
            .filter(|rq| resolution.accept.contains(&rq.text))
            .map(RemoteQuote::to_quote)
            .collect();
        let recategorized: Vec<(String, String)> = diff
            .conflicts
            .iter()
            .filter(|c| {
                resolution.conflicts.get(&c.remote.text) == Some(&ConflictChoice::UseRemote)
            })
            .map(|c| (c.remote.text.clone(), c.remote.category.clone()))
            .collect();
        let summary = ResolutionSummary {
            accepted: accepted.len(),
            replaced: recategorized.len(),
        };

        if summary.accepted > 0 || summary.replaced > 0 {
            self.store
                .lock()
                .await
                .apply_changes(accepted, &recategorized)
                .await?;
        }
        self.set_pending(None);
        self.set_state(SyncState::Idle);
        info!(
            accepted = summary.accepted,
            replaced = summary.replaced,
            "sync diff resolved"
        );
        Ok(summary)
    }

    /// Drop the pending diff without touching local data.
    pub fn dismiss(&self) -> Result<(), SyncError> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.take().is_none() {
            return Err(SyncError::NothingPending);
        }
        drop(pending);
        self.set_state(SyncState::Idle);
        info!("sync diff dismissed");
        Ok(())
    }

    /// Re-run the cycle every `period`, starting immediately. Each tick runs as
    /// its own task; stopping only prevents future ticks.
    pub fn start_periodic(self: &Arc<Self>, period: Duration) -> PeriodicSync {
        let engine = Arc::clone(self);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    match engine.run_cycle().await {
                        Ok(report) => log_report(&report),
                        Err(err) => error!(?err, "sync cycle error"),
                    }
                });
            }
        });
        PeriodicSync { ticker }
    }
}

fn log_report(report: &CycleReport) {
    let flush = report.flush;
    match &report.outcome {
        SyncOutcome::Skipped => {}
        SyncOutcome::FetchFailed { reason } => {
            warn!(%reason, delivered = flush.delivered, requeued = flush.requeued, "sync cycle aborted")
        }
        SyncOutcome::NoChange => {
            info!(delivered = flush.delivered, requeued = flush.requeued, "sync cycle: no change")
        }
        SyncOutcome::AutoMerged { added, replaced } => info!(
            added,
            replaced,
            delivered = flush.delivered,
            requeued = flush.requeued,
            "sync cycle: merged"
        ),
        SyncOutcome::AwaitingResolution(diff) => info!(
            new = diff.new.len(),
            conflicts = diff.conflicts.len(),
            "sync cycle: awaiting resolution"
        ),
    }
}

/// Handle to the periodic ticker.
#[derive(Debug)]
pub struct PeriodicSync {
    ticker: JoinHandle<()>,
}

impl PeriodicSync {
    /// Stop future ticks. A cycle already running completes.
    pub fn stop(self) {
        self.ticker.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.ticker.is_finished()
    }
}
