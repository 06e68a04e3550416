//! # Outbox
//!
//! C7 — the two sweeps that move a published version from the
//! transactional outbox into a search-indexable state (spec §4.7):
//!
//! * the **producer sweep** claims outbox rows and turns each into a
//!   [`af_types::SearchIndexJob`];
//! * the **consumer sweep** claims pending jobs and asks the truth
//!   store whether the referenced version is actually published yet,
//!   retrying with [`af_retry::job_backoff`]'s unjittered schedule
//!   until `maxAttempts` is exhausted.
//!
//! Both sweeps are idempotent per tick: a crash between claim and the
//! matching terminal write just leaves the row claimable again once its
//! visibility timeout (modeled here as "still `Processing`" — the
//! in-memory and Postgres backends both resolve this via their claim
//! filters) elapses.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use af_store::TruthStore;
use af_types::{JobStatus, SearchIndexJob, VersionState};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Tunables sourced from `af-config::OutboxConfig` — kept as a plain
/// struct here so this crate doesn't depend on `af-config`.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub claim_batch_size: u32,
    pub max_attempts: u32,
    pub backoff_base: StdDuration,
    pub backoff_max_exponent: u32,
    pub backoff_cap: StdDuration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: 100,
            max_attempts: 8,
            backoff_base: StdDuration::from_secs(1),
            backoff_max_exponent: 6,
            backoff_cap: StdDuration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerSweepReport {
    pub claimed_count: u32,
    pub enqueued_count: u32,
    pub delivered_count: u32,
    pub requeued_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSweepReport {
    pub claimed_count: u32,
    pub completed_count: u32,
    pub retried_count: u32,
    pub terminal_failed_count: u32,
}

pub struct OutboxSweeper {
    store: Arc<dyn TruthStore>,
    config: SweepConfig,
}

impl OutboxSweeper {
    pub fn new(store: Arc<dyn TruthStore>, config: SweepConfig) -> Self {
        Self { store, config }
    }

    /// Spec §4.7 producer sweep: claim outbox rows, resolve each one's
    /// `version_id`, upsert the corresponding `SearchIndexJob`, and mark
    /// the event delivered. A row whose `version_id` cannot be resolved
    /// is requeued rather than dropped, so a malformed payload never
    /// silently disappears.
    pub async fn sweep_outbox(&self, now: DateTime<Utc>) -> anyhow::Result<ProducerSweepReport> {
        let batch = self.store.claim_outbox_batch(now, self.config.claim_batch_size).await?;
        let mut report = ProducerSweepReport { claimed_count: batch.len() as u32, ..Default::default() };

        for event in batch {
            match resolve_version_id(&event) {
                Some(version_id) => {
                    self.store
                        .upsert_search_job(SearchIndexJob {
                            tenant_id: event.tenant_id,
                            version_id,
                            status: JobStatus::Pending,
                            attempts: 0,
                            available_at: now,
                            last_error: None,
                            updated_at: now,
                        })
                        .await?;
                    self.store.mark_outbox_delivered(event.event_id, now).await?;
                    report.enqueued_count += 1;
                    report.delivered_count += 1;
                }
                None => {
                    tracing::warn!(event_id = %event.event_id, "outbox event carries no resolvable versionId, requeuing");
                    let next = now + chrono::Duration::seconds(30);
                    self.store.reschedule_outbox_event(event.event_id, next).await?;
                    report.requeued_count += 1;
                }
            }
        }

        Ok(report)
    }

    /// Spec §4.7 consumer sweep: a claimed job completes once its
    /// version is actually `Published`; anything else counts as a
    /// failed attempt, retried with [`af_retry::job_backoff`]'s
    /// deterministic schedule until `attempts >= maxAttempts`.
    pub async fn sweep_jobs(&self, now: DateTime<Utc>) -> anyhow::Result<ConsumerSweepReport> {
        let batch = self.store.claim_search_jobs(now, self.config.claim_batch_size).await?;
        let mut report = ConsumerSweepReport { claimed_count: batch.len() as u32, ..Default::default() };

        for job in batch {
            let published = matches!(
                self.store.find_version(job.version_id).await?,
                Some(v) if v.state == VersionState::Published
            );

            if published {
                self.store.complete_search_job(job.tenant_id, job.version_id).await?;
                report.completed_count += 1;
                continue;
            }

            let attempts_after = job.attempts + 1;
            let terminal = attempts_after >= self.config.max_attempts;
            let delay = af_retry::job_backoff(
                self.config.backoff_base,
                attempts_after,
                self.config.backoff_max_exponent,
                self.config.backoff_cap,
            );
            let next_available_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(300));

            self.store
                .fail_search_job(job.tenant_id, job.version_id, next_available_at, "version_not_published", terminal)
                .await?;

            if terminal {
                report.terminal_failed_count += 1;
            } else {
                report.retried_count += 1;
            }
        }

        Ok(report)
    }
}

/// `aggregate_id` is the version UUID for `version.published` events;
/// fall back to a `versionId` field in the payload for forward
/// compatibility with event types this sweeper doesn't know about yet.
fn resolve_version_id(event: &af_types::OutboxEvent) -> Option<Uuid> {
    if let Ok(id) = Uuid::parse_str(&event.aggregate_id) {
        return Some(id);
    }
    event
        .payload_json
        .get("versionId")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}
