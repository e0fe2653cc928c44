use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::db::{self, Pool};
use crate::model::{OutboxEntry, Quote};
use crate::remote::RemoteService;

/// Retry behaviour for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// 0 retries forever.
    pub max_attempts: u32,
    /// 0 retries on every flush without waiting.
    pub max_backoff_secs: u64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            max_backoff_secs: settings.max_backoff_seconds,
        }
    }

    /// Exponential backoff: 5s * 2^attempt, capped at `max_backoff_secs`.
    pub fn delay_after(&self, attempts: u32) -> Option<Duration> {
        if self.max_backoff_secs == 0 {
            return None;
        }
        let secs = 5_u64 << attempts.saturating_sub(1).min(10);
        let capped = secs.min(self.max_backoff_secs);
        Some(Duration::seconds(capped as i64))
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

/// What one flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub delivered: usize,
    pub requeued: usize,
    pub abandoned: usize,
    /// Entries skipped because their backoff has not elapsed.
    pub deferred: usize,
}

impl FlushReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.requeued + self.abandoned
    }
}

/// Quotes waiting for confirmed remote delivery, mirrored under
/// [`db::KEY_OUTBOX`].
#[derive(Debug)]
pub struct Outbox {
    pool: Pool,
    entries: Vec<OutboxEntry>,
}

impl Outbox {
    #[instrument(skip_all)]
    pub async fn load(pool: Pool) -> Result<Self> {
        let entries = db::get_json::<Vec<OutboxEntry>>(&pool, db::KEY_OUTBOX)
            .await?
            .unwrap_or_default();
        Ok(Self { pool, entries })
    }

    /// Persist `entries`, then make them the live queue.
    async fn commit(&mut self, entries: Vec<OutboxEntry>) -> Result<()> {
        db::set_json(&self.pool, db::KEY_OUTBOX, &entries)
            .await
            .context("failed to persist outbox")?;
        self.entries = entries;
        Ok(())
    }

    pub fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue a quote for delivery and persist the queue.
    #[instrument(skip_all)]
    pub async fn enqueue(&mut self, quote: Quote) -> Result<Uuid> {
        let entry = OutboxEntry::new(quote);
        let id = entry.id;
        let mut entries = self.entries.clone();
        entries.push(entry);
        self.commit(entries).await?;
        info!(%id, pending = self.entries.len(), "quote queued for delivery");
        Ok(id)
    }

    /// Drop an entry whose delivery was confirmed outside of [`Outbox::flush`].
    /// Returns whether it was still queued.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn remove(&mut self, id: Uuid) -> Result<bool> {
        if !self.entries.iter().any(|e| e.id == id) {
            return Ok(false);
        }
        let entries = self.entries.iter().filter(|e| e.id != id).cloned().collect();
        self.commit(entries).await?;
        Ok(true)
    }

    /// Try every due entry once, in queue order. Delivered entries leave the
    /// queue; failed ones stay for the next flush unless the policy gives up on
    /// them. The queue is persisted once at the end when anything changed, and
    /// the live queue is only replaced after that write, so a flush that is
    /// dropped or fails part way leaves every entry queued.
    #[instrument(skip_all)]
    pub async fn flush(
        &mut self,
        remote: &dyn RemoteService,
        policy: RetryPolicy,
    ) -> Result<FlushReport> {
        self.flush_at(remote, policy, Utc::now()).await
    }

    pub(crate) async fn flush_at(
        &mut self,
        remote: &dyn RemoteService,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        if self.entries.is_empty() {
            return Ok(report);
        }

        let mut kept = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries.clone() {
            if !entry.is_due(now) {
                report.deferred += 1;
                kept.push(entry);
                continue;
            }
            match remote.post_quote(&entry.quote).await {
                Ok(created) => {
                    report.delivered += 1;
                    info!(id = %entry.id, remote_id = %created.id, "outbox entry delivered");
                }
                Err(err) => {
                    entry.attempts += 1;
                    if policy.exhausted(entry.attempts) {
                        report.abandoned += 1;
                        warn!(?err, id = %entry.id, attempts = entry.attempts, "outbox entry abandoned");
                        continue;
                    }
                    entry.next_attempt_at = policy.delay_after(entry.attempts).map(|d| now + d);
                    warn!(?err, id = %entry.id, attempts = entry.attempts, "outbox delivery failed; requeued");
                    report.requeued += 1;
                    kept.push(entry);
                }
            }
        }
        if report.attempted() > 0 {
            self.commit(kept).await?;
        }
        Ok(report)
    }
}
