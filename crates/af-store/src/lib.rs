//! # Store
//!
//! C1 — the truth store adapter. Defines [`TruthStore`], the trait every
//! higher component (`af-uploads`, `af-publish`, `af-policy`,
//! `af-outbox`, `af-lifecycle`, `af-audit`) talks to instead of SQL
//! directly, plus two implementations: [`memory::InMemoryTruthStore`]
//! for tests, and [`postgres::PgTruthStore`] backed by `diesel-async` +
//! `bb8` against a real Postgres instance.
//!
//! The trait's "claim" methods (`claim_outbox_batch`,
//! `claim_search_jobs`) model spec §4.7's `SELECT ... FOR UPDATE SKIP
//! LOCKED` sweep: a batch of rows is atomically marked in-flight and
//! handed to exactly one caller, so two sweepers running concurrently
//! never process the same row twice.

pub mod memory;
pub mod postgres;
mod schema;

use af_types::{
    AuditRecord, Blob, Manifest, OutboxEvent, PackageVersion, PolicyEvaluation, QuarantineItem,
    QuarantineStatus, Repo, RoleBinding, SearchIndexJob, Tombstone, Token, UploadSession,
    VersionIdentity, VersionState, ArtifactEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Bookkeeping row for one `af-lifecycle` GC execute run. Not part of the
/// spec §3 data model (GC runs aren't a domain entity); it exists purely
/// so `af-audit`'s ops summary can report `incompleteGcRuns` — a row
/// inserted before the transactional delete batch and completed after it
/// commits means a row with `completed_at: None` can only happen if the
/// process died mid-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcRunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_version_count: u32,
    pub deleted_blob_count: u32,
}

/// Backlog posture returned by `count_outbox_backlog`, feeding C9's
/// `/admin/ops/summary` (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboxBacklog {
    pub pending: u64,
    pub available: u64,
    pub oldest_pending_age_seconds: Option<i64>,
}

/// Everything the rest of the workspace needs from the truth store.
///
/// Every method that mutates more than one row is documented with which
/// invariant from spec §8 it's responsible for upholding atomically;
/// implementations (`memory`, `postgres`) must wrap those in a single
/// transaction.
#[async_trait]
pub trait TruthStore: Send + Sync {
    // -- repos / tenancy --------------------------------------------------
    async fn find_repo(&self, tenant_id: Uuid, repo_key: &str) -> anyhow::Result<Option<Repo>>;
    async fn insert_repo(&self, repo: Repo) -> anyhow::Result<Repo>;
    /// Every repo in `tenant_id`, for building the `(repo_id, repo_key)`
    /// map that translates role bindings into `RepoScope`s (spec §4.3).
    async fn list_repos_for_tenant(&self, tenant_id: Uuid) -> anyhow::Result<Vec<Repo>>;

    // -- tokens / role bindings (consumed by af-auth's lookup traits) ----
    async fn find_token_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<Token>>;
    async fn insert_token(&self, token: Token) -> anyhow::Result<Token>;
    async fn revoke_token(&self, token_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<()>;
    async fn find_role_bindings(&self, tenant_id: Uuid, subject: &str) -> anyhow::Result<Vec<RoleBinding>>;
    async fn upsert_role_binding(&self, binding: RoleBinding) -> anyhow::Result<()>;

    // -- upload sessions (C4) ---------------------------------------------
    async fn insert_upload_session(&self, session: UploadSession) -> anyhow::Result<UploadSession>;
    async fn find_upload_session(&self, upload_id: Uuid) -> anyhow::Result<Option<UploadSession>>;
    async fn transition_upload_session(
        &self,
        upload_id: Uuid,
        from: af_types::UploadState,
        to: af_types::UploadState,
    ) -> anyhow::Result<bool>;
    async fn complete_upload_session(&self, upload_id: Uuid, blob_digest: &str, deduped: bool) -> anyhow::Result<()>;
    async fn find_expired_upload_sessions(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<UploadSession>>;

    // -- blobs --------------------------------------------------------------
    async fn find_blob(&self, digest: &str) -> anyhow::Result<Option<Blob>>;
    async fn insert_blob_if_absent(&self, blob: Blob) -> anyhow::Result<Blob>;

    // -- package versions (C5) ----------------------------------------------
    async fn find_version_by_identity(&self, identity: &VersionIdentity) -> anyhow::Result<Option<PackageVersion>>;
    async fn insert_draft_version(&self, version: PackageVersion) -> anyhow::Result<PackageVersion>;
    async fn upsert_artifact_entry(&self, entry: ArtifactEntry) -> anyhow::Result<()>;
    async fn find_artifact_entries(&self, version_id: Uuid) -> anyhow::Result<Vec<ArtifactEntry>>;
    async fn upsert_manifest(&self, manifest: Manifest) -> anyhow::Result<()>;
    async fn find_manifest(&self, version_id: Uuid) -> anyhow::Result<Option<Manifest>>;

    /// Package versions in `repo_id` whose `ArtifactEntry` set references
    /// `digest` (spec §4.4 read-path visibility / §4.6 quarantine
    /// gating: both need "which versions in this repo point at this
    /// blob").
    async fn find_versions_referencing_blob_in_repo(&self, repo_id: Uuid, digest: &str) -> anyhow::Result<Vec<PackageVersion>>;

    /// `true` iff some `committed` upload session in `repo_id` produced
    /// `digest` (spec §4.4: a freshly committed, not-yet-entried blob is
    /// still visible to the repo that committed it).
    async fn has_committed_session_for_blob_in_repo(&self, repo_id: Uuid, digest: &str) -> anyhow::Result<bool>;

    /// Atomically: version `Draft -> Published`, insert one
    /// `version.published` outbox event, insert one audit record.
    /// Invariant 3 (spec §8): publish is exactly-once — this method must
    /// fail with a conflict (return `Ok(false)`) if the version is not
    /// currently `Draft`, rather than silently re-publishing.
    async fn publish_version_transactionally(
        &self,
        version_id: Uuid,
        outbox_event: OutboxEvent,
        audit_record: AuditRecord,
    ) -> anyhow::Result<bool>;

    async fn find_version(&self, version_id: Uuid) -> anyhow::Result<Option<PackageVersion>>;

    // -- policy / quarantine (C6) -------------------------------------------
    async fn insert_policy_evaluation(&self, evaluation: PolicyEvaluation) -> anyhow::Result<()>;
    async fn insert_quarantine_item(&self, item: QuarantineItem) -> anyhow::Result<()>;
    async fn find_quarantine_item(&self, version_id: Uuid) -> anyhow::Result<Option<QuarantineItem>>;
    async fn find_quarantine_item_by_id(&self, quarantine_id: Uuid) -> anyhow::Result<Option<QuarantineItem>>;
    async fn list_quarantine_items(&self, repo_id: Uuid, status: Option<QuarantineStatus>) -> anyhow::Result<Vec<QuarantineItem>>;
    async fn update_quarantine_status(&self, quarantine_id: Uuid, status: QuarantineStatus) -> anyhow::Result<()>;

    // -- outbox / search jobs (C7) -------------------------------------------
    async fn insert_outbox_event(&self, event: OutboxEvent) -> anyhow::Result<()>;
    /// `SELECT ... FOR UPDATE SKIP LOCKED`-equivalent claim of up to
    /// `limit` undelivered, available events, returned in `available_at`
    /// order so retries age out fairly.
    async fn claim_outbox_batch(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<OutboxEvent>>;
    async fn mark_outbox_delivered(&self, event_id: Uuid, delivered_at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn reschedule_outbox_event(&self, event_id: Uuid, available_at: DateTime<Utc>) -> anyhow::Result<()>;

    async fn upsert_search_job(&self, job: SearchIndexJob) -> anyhow::Result<()>;
    async fn claim_search_jobs(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<SearchIndexJob>>;
    async fn complete_search_job(&self, tenant_id: Uuid, version_id: Uuid) -> anyhow::Result<()>;
    /// Record a failed attempt. `terminal` picks the resulting status:
    /// `false` puts the job back in `Pending` for `next_available_at` to
    /// pick it up again; `true` moves it to `Failed`, which `claim_search_jobs`
    /// never selects, ending the retry loop. The caller (the C7 sweeper)
    /// decides `terminal` by comparing attempts against its configured cap.
    async fn fail_search_job(
        &self,
        tenant_id: Uuid,
        version_id: Uuid,
        next_available_at: DateTime<Utc>,
        error: &str,
        terminal: bool,
    ) -> anyhow::Result<()>;
    async fn count_pending_search_jobs(&self) -> anyhow::Result<u64>;
    async fn count_failed_search_jobs(&self) -> anyhow::Result<u64>;
    async fn count_outbox_backlog(&self, now: DateTime<Utc>) -> anyhow::Result<OutboxBacklog>;

    // -- lifecycle / GC (C8) --------------------------------------------------
    async fn insert_tombstone(&self, tombstone: Tombstone) -> anyhow::Result<()>;
    async fn find_tombstone(&self, version_id: Uuid) -> anyhow::Result<Option<Tombstone>>;
    /// Tombstones whose `retention_until` has passed, ordered
    /// `retention_until asc, version_id asc` per spec §8's stable-GC-
    /// ordering invariant.
    async fn find_due_tombstones(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<Tombstone>>;
    async fn delete_version_and_entries(&self, version_id: Uuid) -> anyhow::Result<Vec<ArtifactEntry>>;
    /// Zero-reference blobs created at or before `created_before` (the
    /// `now - graceHours` cutoff), so a blob that was just committed
    /// can't be collected before it picks up its first `ArtifactEntry`.
    async fn find_orphan_blobs(&self, limit: u32, created_before: DateTime<Utc>) -> anyhow::Result<Vec<Blob>>;
    async fn delete_blob(&self, digest: &str) -> anyhow::Result<()>;

    /// Bookkeeping for GC runs; see [`GcRunRecord`].
    async fn start_gc_run(&self, run: GcRunRecord) -> anyhow::Result<()>;
    async fn complete_gc_run(&self, run_id: Uuid, completed_at: DateTime<Utc>, deleted_version_count: u32, deleted_blob_count: u32) -> anyhow::Result<()>;
    async fn count_incomplete_gc_runs(&self) -> anyhow::Result<u64>;

    // -- audit (C9) -----------------------------------------------------------
    async fn insert_audit_record(&self, record: AuditRecord) -> anyhow::Result<()>;
    /// Most recent audit records, optionally filtered to an exact
    /// `action` and/or an `occurred_at >= since` floor, newest first.
    async fn list_audit_records(&self, action: Option<&str>, since: Option<DateTime<Utc>>, limit: u32) -> anyhow::Result<Vec<AuditRecord>>;
}

pub type SharedTruthStore = std::sync::Arc<dyn TruthStore>;

pub use memory::InMemoryTruthStore;
pub use postgres::PgTruthStore;
