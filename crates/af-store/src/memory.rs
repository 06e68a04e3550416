//! An in-process [`TruthStore`] backed by `Mutex`-guarded `HashMap`s.
//! Every trait method takes the single top-level mutex, so "atomic"
//! multi-row operations (`publish_version_transactionally`) are trivially
//! atomic: nothing else can observe the store mid-mutation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use af_types::{
    AuditRecord, Blob, JobStatus, Manifest, OutboxEvent, PackageVersion, PolicyEvaluation,
    QuarantineItem, QuarantineStatus, Repo, RoleBinding, SearchIndexJob, Tombstone, Token,
    UploadSession, UploadState, VersionIdentity, VersionState, ArtifactEntry,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{GcRunRecord, OutboxBacklog, TruthStore};

#[derive(Default)]
struct State {
    repos: HashMap<(Uuid, String), Repo>,
    tokens: HashMap<Uuid, Token>,
    tokens_by_hash: HashMap<String, Uuid>,
    role_bindings: HashMap<(Uuid, Uuid, String), RoleBinding>,
    upload_sessions: HashMap<Uuid, UploadSession>,
    blobs: HashMap<String, Blob>,
    versions: HashMap<Uuid, PackageVersion>,
    version_identities: BTreeMap<VersionIdentity, Uuid>,
    artifact_entries: HashMap<Uuid, Vec<ArtifactEntry>>,
    manifests: HashMap<Uuid, Manifest>,
    policy_evaluations: Vec<PolicyEvaluation>,
    quarantine: HashMap<Uuid, QuarantineItem>,
    outbox: HashMap<Uuid, OutboxEvent>,
    outbox_claimed: std::collections::HashSet<Uuid>,
    search_jobs: HashMap<(Uuid, Uuid), SearchIndexJob>,
    tombstones: HashMap<Uuid, Tombstone>,
    audit: Vec<AuditRecord>,
    gc_runs: HashMap<Uuid, GcRunRecord>,
}

#[derive(Default)]
pub struct InMemoryTruthStore {
    state: Mutex<State>,
}

impl InMemoryTruthStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("truth store mutex poisoned")
    }
}

#[async_trait]
impl TruthStore for InMemoryTruthStore {
    async fn find_repo(&self, tenant_id: Uuid, repo_key: &str) -> anyhow::Result<Option<Repo>> {
        Ok(self.lock().repos.get(&(tenant_id, repo_key.to_string())).cloned())
    }

    async fn insert_repo(&self, repo: Repo) -> anyhow::Result<Repo> {
        let mut state = self.lock();
        state.repos.insert((repo.tenant_id, repo.repo_key.clone()), repo.clone());
        Ok(repo)
    }

    async fn list_repos_for_tenant(&self, tenant_id: Uuid) -> anyhow::Result<Vec<Repo>> {
        let state = self.lock();
        Ok(state.repos.values().filter(|r| r.tenant_id == tenant_id).cloned().collect())
    }

    async fn find_token_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<Token>> {
        let state = self.lock();
        Ok(state.tokens_by_hash.get(token_hash).and_then(|id| state.tokens.get(id)).cloned())
    }

    async fn insert_token(&self, token: Token) -> anyhow::Result<Token> {
        let mut state = self.lock();
        state.tokens_by_hash.insert(token.token_hash.clone(), token.token_id);
        state.tokens.insert(token.token_id, token.clone());
        Ok(token)
    }

    async fn revoke_token(&self, token_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(token) = self.lock().tokens.get_mut(&token_id) {
            token.revoked_at = Some(now);
        }
        Ok(())
    }

    async fn find_role_bindings(&self, tenant_id: Uuid, subject: &str) -> anyhow::Result<Vec<RoleBinding>> {
        Ok(self
            .lock()
            .role_bindings
            .values()
            .filter(|b| b.tenant_id == tenant_id && b.subject == subject)
            .cloned()
            .collect())
    }

    async fn upsert_role_binding(&self, binding: RoleBinding) -> anyhow::Result<()> {
        let key = (binding.tenant_id, binding.repo_id, binding.subject.clone());
        self.lock().role_bindings.insert(key, binding);
        Ok(())
    }

    async fn insert_upload_session(&self, session: UploadSession) -> anyhow::Result<UploadSession> {
        let mut state = self.lock();
        state.upload_sessions.insert(session.upload_id, session.clone());
        Ok(session)
    }

    async fn find_upload_session(&self, upload_id: Uuid) -> anyhow::Result<Option<UploadSession>> {
        Ok(self.lock().upload_sessions.get(&upload_id).cloned())
    }

    async fn transition_upload_session(&self, upload_id: Uuid, from: UploadState, to: UploadState) -> anyhow::Result<bool> {
        let mut state = self.lock();
        match state.upload_sessions.get_mut(&upload_id) {
            Some(session) if session.state == from => {
                session.state = to;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => anyhow::bail!("upload session {upload_id} not found"),
        }
    }

    async fn complete_upload_session(&self, upload_id: Uuid, blob_digest: &str, deduped: bool) -> anyhow::Result<()> {
        let mut state = self.lock();
        let session = state
            .upload_sessions
            .get_mut(&upload_id)
            .ok_or_else(|| anyhow::anyhow!("upload session {upload_id} not found"))?;
        session.state = UploadState::Committed;
        session.committed_blob_digest = Some(blob_digest.to_string());
        session.deduped = deduped;
        Ok(())
    }

    async fn find_expired_upload_sessions(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<UploadSession>> {
        let state = self.lock();
        let mut out: Vec<_> = state
            .upload_sessions
            .values()
            .filter(|s| !s.state.is_terminal() && s.is_expired(now))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.expires_at);
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn find_blob(&self, digest: &str) -> anyhow::Result<Option<Blob>> {
        Ok(self.lock().blobs.get(digest).cloned())
    }

    async fn insert_blob_if_absent(&self, blob: Blob) -> anyhow::Result<Blob> {
        let mut state = self.lock();
        let existing = state.blobs.get(&blob.digest).cloned();
        match existing {
            Some(existing) => Ok(existing),
            None => {
                state.blobs.insert(blob.digest.clone(), blob.clone());
                Ok(blob)
            }
        }
    }

    async fn find_version_by_identity(&self, identity: &VersionIdentity) -> anyhow::Result<Option<PackageVersion>> {
        let state = self.lock();
        Ok(state.version_identities.get(identity).and_then(|id| state.versions.get(id)).cloned())
    }

    async fn insert_draft_version(&self, version: PackageVersion) -> anyhow::Result<PackageVersion> {
        let mut state = self.lock();
        let identity = af_types::normalize_version_identity(
            version.tenant_id,
            version.repo_id,
            &version.package_type,
            version.package_namespace.as_deref(),
            &version.package_name,
            &version.version,
        );
        state.version_identities.insert(identity, version.version_id);
        state.versions.insert(version.version_id, version.clone());
        Ok(version)
    }

    async fn upsert_artifact_entry(&self, entry: ArtifactEntry) -> anyhow::Result<()> {
        let mut state = self.lock();
        let entries = state.artifact_entries.entry(entry.version_id).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.relative_path == entry.relative_path) {
            *existing = entry;
        } else {
            entries.push(entry);
        }
        Ok(())
    }

    async fn find_artifact_entries(&self, version_id: Uuid) -> anyhow::Result<Vec<ArtifactEntry>> {
        Ok(self.lock().artifact_entries.get(&version_id).cloned().unwrap_or_default())
    }

    async fn upsert_manifest(&self, manifest: Manifest) -> anyhow::Result<()> {
        self.lock().manifests.insert(manifest.version_id, manifest);
        Ok(())
    }

    async fn find_manifest(&self, version_id: Uuid) -> anyhow::Result<Option<Manifest>> {
        Ok(self.lock().manifests.get(&version_id).cloned())
    }

    async fn find_versions_referencing_blob_in_repo(&self, repo_id: Uuid, digest: &str) -> anyhow::Result<Vec<PackageVersion>> {
        let state = self.lock();
        Ok(state
            .versions
            .values()
            .filter(|v| v.repo_id == repo_id)
            .filter(|v| {
                state
                    .artifact_entries
                    .get(&v.version_id)
                    .is_some_and(|entries| entries.iter().any(|e| e.blob_digest == digest))
            })
            .cloned()
            .collect())
    }

    async fn has_committed_session_for_blob_in_repo(&self, repo_id: Uuid, digest: &str) -> anyhow::Result<bool> {
        Ok(self.lock().upload_sessions.values().any(|s| {
            s.repo_id == repo_id && s.state == UploadState::Committed && s.committed_blob_digest.as_deref() == Some(digest)
        }))
    }

    async fn publish_version_transactionally(
        &self,
        version_id: Uuid,
        outbox_event: OutboxEvent,
        audit_record: AuditRecord,
    ) -> anyhow::Result<bool> {
        let mut state = self.lock();
        let version = state
            .versions
            .get_mut(&version_id)
            .ok_or_else(|| anyhow::anyhow!("version {version_id} not found"))?;
        if version.state != VersionState::Draft {
            return Ok(false);
        }
        version.state = VersionState::Published;
        version.published_at = Some(Utc::now());
        state.outbox.insert(outbox_event.event_id, outbox_event);
        state.audit.push(audit_record);
        Ok(true)
    }

    async fn find_version(&self, version_id: Uuid) -> anyhow::Result<Option<PackageVersion>> {
        Ok(self.lock().versions.get(&version_id).cloned())
    }

    async fn insert_policy_evaluation(&self, evaluation: PolicyEvaluation) -> anyhow::Result<()> {
        self.lock().policy_evaluations.push(evaluation);
        Ok(())
    }

    async fn insert_quarantine_item(&self, item: QuarantineItem) -> anyhow::Result<()> {
        self.lock().quarantine.insert(item.version_id, item);
        Ok(())
    }

    async fn find_quarantine_item(&self, version_id: Uuid) -> anyhow::Result<Option<QuarantineItem>> {
        Ok(self.lock().quarantine.get(&version_id).cloned())
    }

    async fn find_quarantine_item_by_id(&self, quarantine_id: Uuid) -> anyhow::Result<Option<QuarantineItem>> {
        Ok(self.lock().quarantine.values().find(|q| q.quarantine_id == quarantine_id).cloned())
    }

    async fn list_quarantine_items(&self, repo_id: Uuid, status: Option<QuarantineStatus>) -> anyhow::Result<Vec<QuarantineItem>> {
        let state = self.lock();
        let mut out: Vec<_> = state
            .quarantine
            .values()
            .filter(|q| q.repo_id == repo_id)
            .filter(|q| status.is_none_or(|s| q.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|q| q.quarantine_id);
        Ok(out)
    }

    async fn update_quarantine_status(&self, quarantine_id: Uuid, status: QuarantineStatus) -> anyhow::Result<()> {
        let mut state = self.lock();
        if let Some(item) = state.quarantine.values_mut().find(|q| q.quarantine_id == quarantine_id) {
            item.status = status;
        }
        Ok(())
    }

    async fn insert_outbox_event(&self, event: OutboxEvent) -> anyhow::Result<()> {
        self.lock().outbox.insert(event.event_id, event);
        Ok(())
    }

    async fn claim_outbox_batch(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<OutboxEvent>> {
        let mut state = self.lock();
        let mut candidates: Vec<_> = state
            .outbox
            .values()
            .filter(|e| e.delivered_at.is_none() && e.available_at <= now && !state.outbox_claimed.contains(&e.event_id))
            .cloned()
            .collect();
        candidates.sort_by_key(|e| e.available_at);
        candidates.truncate(limit as usize);
        for c in &candidates {
            state.outbox_claimed.insert(c.event_id);
        }
        Ok(candidates)
    }

    async fn mark_outbox_delivered(&self, event_id: Uuid, delivered_at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut state = self.lock();
        if let Some(event) = state.outbox.get_mut(&event_id) {
            event.delivered_at = Some(delivered_at);
        }
        state.outbox_claimed.remove(&event_id);
        Ok(())
    }

    async fn reschedule_outbox_event(&self, event_id: Uuid, available_at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut state = self.lock();
        if let Some(event) = state.outbox.get_mut(&event_id) {
            event.available_at = available_at;
        }
        state.outbox_claimed.remove(&event_id);
        Ok(())
    }

    async fn upsert_search_job(&self, job: SearchIndexJob) -> anyhow::Result<()> {
        self.lock().search_jobs.insert((job.tenant_id, job.version_id), job);
        Ok(())
    }

    async fn claim_search_jobs(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<SearchIndexJob>> {
        let mut state = self.lock();
        let mut candidates: Vec<_> = state
            .search_jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Pending) && j.available_at <= now)
            .cloned()
            .collect();
        candidates.sort_by_key(|j| j.available_at);
        candidates.truncate(limit as usize);
        for c in &candidates {
            if let Some(job) = state.search_jobs.get_mut(&(c.tenant_id, c.version_id)) {
                job.status = JobStatus::Processing;
            }
        }
        Ok(candidates)
    }

    async fn complete_search_job(&self, tenant_id: Uuid, version_id: Uuid) -> anyhow::Result<()> {
        let mut state = self.lock();
        if let Some(job) = state.search_jobs.get_mut(&(tenant_id, version_id)) {
            job.status = JobStatus::Completed;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail_search_job(
        &self,
        tenant_id: Uuid,
        version_id: Uuid,
        next_available_at: DateTime<Utc>,
        error: &str,
        terminal: bool,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        if let Some(job) = state.search_jobs.get_mut(&(tenant_id, version_id)) {
            job.status = if terminal { JobStatus::Failed } else { JobStatus::Pending };
            job.attempts += 1;
            job.available_at = next_available_at;
            job.last_error = Some(error.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn count_pending_search_jobs(&self) -> anyhow::Result<u64> {
        Ok(self.lock().search_jobs.values().filter(|j| matches!(j.status, JobStatus::Pending)).count() as u64)
    }

    async fn count_failed_search_jobs(&self) -> anyhow::Result<u64> {
        Ok(self.lock().search_jobs.values().filter(|j| matches!(j.status, JobStatus::Failed)).count() as u64)
    }

    async fn count_outbox_backlog(&self, now: DateTime<Utc>) -> anyhow::Result<OutboxBacklog> {
        let state = self.lock();
        let undelivered: Vec<_> = state.outbox.values().filter(|e| e.delivered_at.is_none()).collect();
        let available = undelivered.iter().filter(|e| e.available_at <= now).count() as u64;
        let oldest_pending_age_seconds = undelivered
            .iter()
            .map(|e| e.occurred_at)
            .min()
            .map(|oldest| now.signed_duration_since(oldest).num_seconds());
        Ok(OutboxBacklog {
            pending: undelivered.len() as u64,
            available,
            oldest_pending_age_seconds,
        })
    }

    async fn insert_tombstone(&self, tombstone: Tombstone) -> anyhow::Result<()> {
        self.lock().tombstones.insert(tombstone.version_id, tombstone);
        Ok(())
    }

    async fn find_tombstone(&self, version_id: Uuid) -> anyhow::Result<Option<Tombstone>> {
        Ok(self.lock().tombstones.get(&version_id).cloned())
    }

    async fn find_due_tombstones(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<Tombstone>> {
        let state = self.lock();
        let mut out: Vec<_> = state.tombstones.values().filter(|t| t.retention_until <= now).cloned().collect();
        out.sort_by(|a, b| a.retention_until.cmp(&b.retention_until).then(a.version_id.cmp(&b.version_id)));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn delete_version_and_entries(&self, version_id: Uuid) -> anyhow::Result<Vec<ArtifactEntry>> {
        let mut state = self.lock();
        let entries = state.artifact_entries.remove(&version_id).unwrap_or_default();
        state.versions.remove(&version_id);
        state.manifests.remove(&version_id);
        state.tombstones.remove(&version_id);
        Ok(entries)
    }

    /// Orphan status is derived live from `artifact_entries` rather than
    /// a maintained refcount, so a blob referenced by any surviving
    /// version's entry is never misreported as collectible.
    async fn find_orphan_blobs(&self, limit: u32, created_before: DateTime<Utc>) -> anyhow::Result<Vec<Blob>> {
        let state = self.lock();
        let referenced: std::collections::HashSet<&str> = state
            .artifact_entries
            .values()
            .flatten()
            .map(|e| e.blob_digest.as_str())
            .collect();
        let mut out: Vec<_> = state
            .blobs
            .values()
            .filter(|b| !referenced.contains(b.digest.as_str()) && b.created_at <= created_before)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.digest.cmp(&b.digest));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn delete_blob(&self, digest: &str) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.blobs.remove(digest);
        Ok(())
    }

    async fn start_gc_run(&self, run: GcRunRecord) -> anyhow::Result<()> {
        self.lock().gc_runs.insert(run.run_id, run);
        Ok(())
    }

    async fn complete_gc_run(&self, run_id: Uuid, completed_at: DateTime<Utc>, deleted_version_count: u32, deleted_blob_count: u32) -> anyhow::Result<()> {
        if let Some(run) = self.lock().gc_runs.get_mut(&run_id) {
            run.completed_at = Some(completed_at);
            run.deleted_version_count = deleted_version_count;
            run.deleted_blob_count = deleted_blob_count;
        }
        Ok(())
    }

    async fn count_incomplete_gc_runs(&self) -> anyhow::Result<u64> {
        Ok(self.lock().gc_runs.values().filter(|r| r.completed_at.is_none()).count() as u64)
    }

    async fn insert_audit_record(&self, record: AuditRecord) -> anyhow::Result<()> {
        self.lock().audit.push(record);
        Ok(())
    }

    async fn list_audit_records(&self, action: Option<&str>, since: Option<DateTime<Utc>>, limit: u32) -> anyhow::Result<Vec<AuditRecord>> {
        let state = self.lock();
        let mut out: Vec<_> = state
            .audit
            .iter()
            .filter(|r| action.is_none_or(|a| r.action == a))
            .filter(|r| since.is_none_or(|s| r.occurred_at >= s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        out.truncate(limit as usize);
        Ok(out)
    }
}
