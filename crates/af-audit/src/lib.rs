//! # Audit
//!
//! C9 — the read side nothing else in the workspace writes to:
//! readiness probes against C1/C2, the operational backlog summary, and
//! the audit trail listing. Every number here comes from a store method
//! that already exists for another component's own bookkeeping; this
//! crate adds no new storage, only aggregation.

use std::sync::Arc;

use af_error::Error;
use af_objectstore::ObjectStore;
use af_store::TruthStore;
use af_types::AuditRecord;
use chrono::{DateTime, Utc};

/// A key that is never written by any real upload; probing it with
/// `head` only tests that the object store backend answers requests at
/// all, not that any particular object exists.
const READINESS_PROBE_KEY: &str = "__artifortress_readiness_probe__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyHealth {
    pub name: String,
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    pub healthy: bool,
    pub dependencies: Vec<DependencyHealth>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpsSummary {
    pub pending_outbox_events: u64,
    pub available_outbox_events: u64,
    pub oldest_pending_outbox_age_seconds: Option<i64>,
    pub pending_search_jobs: u64,
    pub failed_search_jobs: u64,
    pub incomplete_gc_runs: u64,
    pub recent_policy_timeouts_24h: u64,
}

pub struct AuditService {
    store: Arc<dyn TruthStore>,
    objects: Arc<dyn ObjectStore>,
}

impl AuditService {
    pub fn new(store: Arc<dyn TruthStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { store, objects }
    }

    /// Spec §4.9 readiness: probes the truth store and the object
    /// store each with a call that's already cheap and side-effect
    /// free for its owning component, so readiness checks add no new
    /// load shape of their own.
    pub async fn readiness(&self, now: DateTime<Utc>) -> ReadinessReport {
        let truth_healthy = self.store.count_outbox_backlog(now).await.is_ok();
        let object_healthy = self.objects.head(READINESS_PROBE_KEY).await.is_ok();

        let dependencies = vec![
            DependencyHealth { name: "truth_store".to_string(), healthy: truth_healthy },
            DependencyHealth { name: "object_store".to_string(), healthy: object_healthy },
        ];
        let healthy = dependencies.iter().all(|d| d.healthy);
        ReadinessReport { healthy, dependencies }
    }

    /// Spec §4.9 ops summary: a point-in-time snapshot of backlog
    /// depth across C7 and C8, plus how many policy evaluations have
    /// fail-closed in the last 24 hours.
    pub async fn ops_summary(&self, now: DateTime<Utc>) -> Result<OpsSummary, Error> {
        let backlog = self.store.count_outbox_backlog(now).await?;
        let pending_search_jobs = self.store.count_pending_search_jobs().await?;
        let failed_search_jobs = self.store.count_failed_search_jobs().await?;
        let incomplete_gc_runs = self.store.count_incomplete_gc_runs().await?;

        let since = now - chrono::Duration::hours(24);
        let timeouts = self.store.list_audit_records(Some("policy.timeout"), Some(since), 10_000).await?;

        Ok(OpsSummary {
            pending_outbox_events: backlog.pending,
            available_outbox_events: backlog.available,
            oldest_pending_outbox_age_seconds: backlog.oldest_pending_age_seconds,
            pending_search_jobs,
            failed_search_jobs,
            incomplete_gc_runs,
            recent_policy_timeouts_24h: timeouts.len() as u64,
        })
    }

    /// Spec §4.9 audit listing: `action` and `since` are both optional
    /// filters; `limit` is always enforced, never unbounded.
    pub async fn list_audit_records(
        &self,
        action: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<AuditRecord>, Error> {
        let limit = limit.clamp(1, 1000);
        Ok(self.store.list_audit_records(action, since, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_objectstore::InMemoryObjectStore;
    use af_store::InMemoryTruthStore;

    fn service() -> (Arc<InMemoryTruthStore>, AuditService) {
        let store = Arc::new(InMemoryTruthStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        (store.clone(), AuditService::new(store, objects))
    }

    #[tokio::test]
    async fn readiness_is_healthy_against_fresh_in_memory_backends() {
        let (_store, service) = service();
        let report = service.readiness(Utc::now()).await;
        assert!(report.healthy);
        assert_eq!(report.dependencies.len(), 2);
        assert!(report.dependencies.iter().all(|d| d.healthy));
    }

    #[tokio::test]
    async fn ops_summary_reflects_recent_policy_timeouts() {
        let (store, service) = service();
        let now = Utc::now();
        store
            .insert_audit_record(AuditRecord {
                action: "policy.timeout".to_string(),
                actor: "policy-engine".to_string(),
                resource_type: "package_version".to_string(),
                resource_id: uuid::Uuid::new_v4().to_string(),
                details: serde_json::json!({}),
                occurred_at: now,
            })
            .await
            .unwrap();
        store
            .insert_audit_record(AuditRecord {
                action: "policy.timeout".to_string(),
                actor: "policy-engine".to_string(),
                resource_type: "package_version".to_string(),
                resource_id: uuid::Uuid::new_v4().to_string(),
                details: serde_json::json!({}),
                occurred_at: now - chrono::Duration::hours(48),
            })
            .await
            .unwrap();

        let summary = service.ops_summary(now).await.unwrap();
        assert_eq!(summary.recent_policy_timeouts_24h, 1);
    }

    #[tokio::test]
    async fn audit_listing_clamps_limit() {
        let (_store, service) = service();
        let records = service.list_audit_records(None, None, 0).await.unwrap();
        assert!(records.is_empty());
    }
}
