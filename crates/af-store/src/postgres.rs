//! Postgres-backed [`TruthStore`] via `diesel-async` + `bb8`.
//!
//! Every multi-row mutation documented on the trait as "atomically" runs
//! inside `conn.transaction(...)` — diesel-async's `scoped-futures`-backed
//! transaction helper, not a hand-rolled `BEGIN`/`COMMIT`. Enum columns are
//! `Text` in `schema.rs`; `to_text`/`from_text` pairs below do the
//! conversion at the boundary instead of a per-enum diesel `SqlType`.

use crate::schema::{
    artifact_entries, audit_records, blobs, gc_runs, manifests, outbox_events, package_versions,
    policy_evaluations, quarantine_items, repos, role_bindings, search_index_jobs, tokens,
    tombstones, upload_sessions,
};
use crate::{GcRunRecord, OutboxBacklog, TruthStore};
use af_types::{
    ArtifactEntry, AuditRecord, Blob, JobStatus, Manifest, OutboxEvent, PackageVersion,
    PolicyEvaluation, QuarantineItem, QuarantineStatus, Repo, RepoType, Role, RoleBinding,
    SearchIndexJob, Tombstone, Token, UploadSession, UploadState, VersionIdentity, VersionState,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bb8::Pool;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use std::collections::BTreeSet;
use uuid::Uuid;

type PgPool = Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Postgres-backed [`TruthStore`]. Cloning is cheap: the pool is an `Arc`
/// internally.
#[derive(Clone)]
pub struct PgTruthStore {
    pool: PgPool,
}

impl PgTruthStore {
    /// Builds a connection pool against `database_url` sized to
    /// `max_connections` (spec §4.2's `Postgres__MaxConnections`).
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_connections)
            .build(manager)
            .await
            .context("building postgres connection pool")?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> anyhow::Result<bb8::PooledConnection<'_, AsyncDieselConnectionManager<AsyncPgConnection>>> {
        self.pool.get().await.context("checking out postgres connection")
    }
}

// -- enum <-> text conversions --------------------------------------------

fn repo_type_to_text(t: RepoType) -> &'static str {
    match t {
        RepoType::Local => "local",
        RepoType::Remote => "remote",
        RepoType::Virtual => "virtual",
    }
}
fn repo_type_from_text(s: &str) -> anyhow::Result<RepoType> {
    match s {
        "local" => Ok(RepoType::Local),
        "remote" => Ok(RepoType::Remote),
        "virtual" => Ok(RepoType::Virtual),
        other => Err(anyhow!("unknown repo_type {other}")),
    }
}

fn upload_state_to_text(s: UploadState) -> &'static str {
    match s {
        UploadState::Initiated => "initiated",
        UploadState::PartsUploading => "parts_uploading",
        UploadState::PendingCommit => "pending_commit",
        UploadState::Committed => "committed",
        UploadState::Aborted => "aborted",
    }
}
fn upload_state_from_text(s: &str) -> anyhow::Result<UploadState> {
    match s {
        "initiated" => Ok(UploadState::Initiated),
        "parts_uploading" => Ok(UploadState::PartsUploading),
        "pending_commit" => Ok(UploadState::PendingCommit),
        "committed" => Ok(UploadState::Committed),
        "aborted" => Ok(UploadState::Aborted),
        other => Err(anyhow!("unknown upload_session state {other}")),
    }
}

fn version_state_to_text(s: VersionState) -> &'static str {
    match s {
        VersionState::Draft => "draft",
        VersionState::Published => "published",
        VersionState::Tombstoned => "tombstoned",
    }
}
fn version_state_from_text(s: &str) -> anyhow::Result<VersionState> {
    match s {
        "draft" => Ok(VersionState::Draft),
        "published" => Ok(VersionState::Published),
        "tombstoned" => Ok(VersionState::Tombstoned),
        other => Err(anyhow!("unknown package_version state {other}")),
    }
}

fn quarantine_status_to_text(s: QuarantineStatus) -> &'static str {
    match s {
        QuarantineStatus::Quarantined => "quarantined",
        QuarantineStatus::Released => "released",
        QuarantineStatus::Rejected => "rejected",
    }
}
fn quarantine_status_from_text(s: &str) -> anyhow::Result<QuarantineStatus> {
    match s {
        "quarantined" => Ok(QuarantineStatus::Quarantined),
        "released" => Ok(QuarantineStatus::Released),
        "rejected" => Ok(QuarantineStatus::Rejected),
        other => Err(anyhow!("unknown quarantine status {other}")),
    }
}

fn job_status_to_text(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}
fn job_status_from_text(s: &str) -> anyhow::Result<JobStatus> {
    match s {
        "pending" => Ok(JobStatus::Pending),
        "processing" => Ok(JobStatus::Processing),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        other => Err(anyhow!("unknown search_index_job status {other}")),
    }
}

// -- row <-> domain mapping -------------------------------------------------

#[derive(Queryable, Insertable)]
#[diesel(table_name = repos)]
struct RepoRow {
    repo_id: Uuid,
    tenant_id: Uuid,
    repo_key: String,
    repo_type: String,
    upstream_url: Option<String>,
    member_repo_keys: Vec<String>,
}

impl RepoRow {
    fn from_domain(r: &Repo) -> Self {
        Self {
            repo_id: r.repo_id,
            tenant_id: r.tenant_id,
            repo_key: r.repo_key.clone(),
            repo_type: repo_type_to_text(r.repo_type).to_string(),
            upstream_url: r.upstream_url.clone(),
            member_repo_keys: r.member_repo_keys.clone(),
        }
    }

    fn into_domain(self) -> anyhow::Result<Repo> {
        Ok(Repo {
            repo_id: self.repo_id,
            tenant_id: self.tenant_id,
            repo_key: self.repo_key,
            repo_type: repo_type_from_text(&self.repo_type)?,
            upstream_url: self.upstream_url,
            member_repo_keys: self.member_repo_keys,
        })
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = tokens)]
struct TokenRow {
    token_id: Uuid,
    tenant_id: Uuid,
    subject: String,
    token_hash: String,
    scopes: Vec<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
}

impl TokenRow {
    fn from_domain(t: &Token) -> Self {
        Self {
            token_id: t.token_id,
            tenant_id: t.tenant_id,
            subject: t.subject.clone(),
            token_hash: t.token_hash.clone(),
            scopes: t.scopes.iter().map(|s| s.to_string()).collect(),
            created_at: t.created_at,
            expires_at: t.expires_at,
            revoked_at: t.revoked_at,
        }
    }

    fn into_domain(self) -> anyhow::Result<Token> {
        let scopes = self
            .scopes
            .iter()
            .map(|s| af_types::RepoScope::parse(s).ok_or_else(|| anyhow!("bad scope {s}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Token {
            token_id: self.token_id,
            tenant_id: self.tenant_id,
            subject: self.subject,
            token_hash: self.token_hash,
            scopes,
            created_at: self.created_at,
            expires_at: self.expires_at,
            revoked_at: self.revoked_at,
        })
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = upload_sessions)]
struct UploadSessionRow {
    upload_id: Uuid,
    tenant_id: Uuid,
    repo_id: Uuid,
    expected_digest: String,
    expected_length: i64,
    storage_upload_id: String,
    object_staging_key: String,
    state: String,
    created_by_subject: String,
    expires_at: DateTime<Utc>,
    committed_blob_digest: Option<String>,
    deduped: bool,
}

impl UploadSessionRow {
    fn from_domain(s: &UploadSession) -> Self {
        Self {
            upload_id: s.upload_id,
            tenant_id: s.tenant_id,
            repo_id: s.repo_id,
            expected_digest: s.expected_digest.clone(),
            expected_length: s.expected_length as i64,
            storage_upload_id: s.storage_upload_id.clone(),
            object_staging_key: s.object_staging_key.clone(),
            state: upload_state_to_text(s.state).to_string(),
            created_by_subject: s.created_by_subject.clone(),
            expires_at: s.expires_at,
            committed_blob_digest: s.committed_blob_digest.clone(),
            deduped: s.deduped,
        }
    }

    fn into_domain(self) -> anyhow::Result<UploadSession> {
        Ok(UploadSession {
            upload_id: self.upload_id,
            tenant_id: self.tenant_id,
            repo_id: self.repo_id,
            expected_digest: self.expected_digest,
            expected_length: self.expected_length as u64,
            storage_upload_id: self.storage_upload_id,
            object_staging_key: self.object_staging_key,
            state: upload_state_from_text(&self.state)?,
            created_by_subject: self.created_by_subject,
            expires_at: self.expires_at,
            committed_blob_digest: self.committed_blob_digest,
            deduped: self.deduped,
        })
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = blobs)]
struct BlobRow {
    digest: String,
    length_bytes: i64,
    storage_key: String,
    created_at: DateTime<Utc>,
}

impl BlobRow {
    fn from_domain(b: &Blob) -> Self {
        Self {
            digest: b.digest.clone(),
            length_bytes: b.length_bytes as i64,
            storage_key: b.storage_key.clone(),
            created_at: b.created_at,
        }
    }
    fn into_domain(self) -> Blob {
        Blob {
            digest: self.digest,
            length_bytes: self.length_bytes as u64,
            storage_key: self.storage_key,
            created_at: self.created_at,
        }
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = package_versions)]
struct PackageVersionRow {
    version_id: Uuid,
    tenant_id: Uuid,
    repo_id: Uuid,
    package_type: String,
    package_namespace: Option<String>,
    package_name: String,
    version: String,
    state: String,
    created_by_subject: String,
    published_at: Option<DateTime<Utc>>,
}

impl PackageVersionRow {
    fn from_domain(v: &PackageVersion) -> Self {
        Self {
            version_id: v.version_id,
            tenant_id: v.tenant_id,
            repo_id: v.repo_id,
            package_type: v.package_type.clone(),
            package_namespace: v.package_namespace.clone(),
            package_name: v.package_name.clone(),
            version: v.version.clone(),
            state: version_state_to_text(v.state).to_string(),
            created_by_subject: v.created_by_subject.clone(),
            published_at: v.published_at,
        }
    }

    fn into_domain(self) -> anyhow::Result<PackageVersion> {
        Ok(PackageVersion {
            version_id: self.version_id,
            tenant_id: self.tenant_id,
            repo_id: self.repo_id,
            package_type: self.package_type,
            package_namespace: self.package_namespace,
            package_name: self.package_name,
            version: self.version,
            state: version_state_from_text(&self.state)?,
            created_by_subject: self.created_by_subject,
            published_at: self.published_at,
        })
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = artifact_entries)]
struct ArtifactEntryRow {
    version_id: Uuid,
    relative_path: String,
    blob_digest: String,
    size_bytes: i64,
}

impl ArtifactEntryRow {
    fn from_domain(e: &ArtifactEntry) -> Self {
        Self {
            version_id: e.version_id,
            relative_path: e.relative_path.clone(),
            blob_digest: e.blob_digest.clone(),
            size_bytes: e.size_bytes as i64,
        }
    }
    fn into_domain(self) -> ArtifactEntry {
        ArtifactEntry {
            version_id: self.version_id,
            relative_path: self.relative_path,
            blob_digest: self.blob_digest,
            size_bytes: self.size_bytes as u64,
        }
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = manifests)]
struct ManifestRow {
    version_id: Uuid,
    manifest_json: serde_json::Value,
    manifest_blob_digest: Option<String>,
}

impl ManifestRow {
    fn from_domain(m: &Manifest) -> Self {
        Self {
            version_id: m.version_id,
            manifest_json: m.manifest_json.clone(),
            manifest_blob_digest: m.manifest_blob_digest.clone(),
        }
    }
    fn into_domain(self) -> Manifest {
        Manifest {
            version_id: self.version_id,
            manifest_json: self.manifest_json,
            manifest_blob_digest: self.manifest_blob_digest,
        }
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = outbox_events)]
struct OutboxEventRow {
    event_id: Uuid,
    tenant_id: Uuid,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    payload_json: serde_json::Value,
    available_at: DateTime<Utc>,
    occurred_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
}

impl OutboxEventRow {
    fn from_domain(e: &OutboxEvent) -> Self {
        Self {
            event_id: e.event_id,
            tenant_id: e.tenant_id,
            aggregate_type: e.aggregate_type.clone(),
            aggregate_id: e.aggregate_id.clone(),
            event_type: e.event_type.clone(),
            payload_json: e.payload_json.clone(),
            available_at: e.available_at,
            occurred_at: e.occurred_at,
            delivered_at: e.delivered_at,
            claimed_at: e.claimed_at,
        }
    }
    fn into_domain(self) -> OutboxEvent {
        OutboxEvent {
            event_id: self.event_id,
            tenant_id: self.tenant_id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload_json: self.payload_json,
            available_at: self.available_at,
            occurred_at: self.occurred_at,
            delivered_at: self.delivered_at,
            claimed_at: self.claimed_at,
        }
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = search_index_jobs)]
struct SearchIndexJobRow {
    tenant_id: Uuid,
    version_id: Uuid,
    status: String,
    attempts: i32,
    available_at: DateTime<Utc>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl SearchIndexJobRow {
    fn from_domain(j: &SearchIndexJob) -> Self {
        Self {
            tenant_id: j.tenant_id,
            version_id: j.version_id,
            status: job_status_to_text(j.status).to_string(),
            attempts: j.attempts as i32,
            available_at: j.available_at,
            last_error: j.last_error.clone(),
            updated_at: j.updated_at,
        }
    }
    fn into_domain(self) -> anyhow::Result<SearchIndexJob> {
        Ok(SearchIndexJob {
            tenant_id: self.tenant_id,
            version_id: self.version_id,
            status: job_status_from_text(&self.status)?,
            attempts: self.attempts as u32,
            available_at: self.available_at,
            last_error: self.last_error,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = tombstones)]
struct TombstoneRow {
    version_id: Uuid,
    reason: String,
    retention_until: DateTime<Utc>,
}

impl TombstoneRow {
    fn from_domain(t: &Tombstone) -> Self {
        Self {
            version_id: t.version_id,
            reason: t.reason.clone(),
            retention_until: t.retention_until,
        }
    }
    fn into_domain(self) -> Tombstone {
        Tombstone {
            version_id: self.version_id,
            reason: self.reason,
            retention_until: self.retention_until,
        }
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = quarantine_items)]
struct QuarantineItemRow {
    quarantine_id: Uuid,
    tenant_id: Uuid,
    repo_id: Uuid,
    version_id: Uuid,
    status: String,
}

impl QuarantineItemRow {
    fn from_domain(q: &QuarantineItem) -> Self {
        Self {
            quarantine_id: q.quarantine_id,
            tenant_id: q.tenant_id,
            repo_id: q.repo_id,
            version_id: q.version_id,
            status: quarantine_status_to_text(q.status).to_string(),
        }
    }
    fn into_domain(self) -> anyhow::Result<QuarantineItem> {
        Ok(QuarantineItem {
            quarantine_id: self.quarantine_id,
            tenant_id: self.tenant_id,
            repo_id: self.repo_id,
            version_id: self.version_id,
            status: quarantine_status_from_text(&self.status)?,
        })
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = policy_evaluations)]
struct PolicyEvaluationRow {
    evaluation_id: Uuid,
    version_id: Uuid,
    action: String,
    decision: String,
    decision_source: String,
    reason: String,
    engine_version: Option<String>,
}

impl PolicyEvaluationRow {
    fn from_domain(e: &PolicyEvaluation) -> Self {
        Self {
            evaluation_id: e.evaluation_id,
            version_id: e.version_id,
            action: e.action.clone(),
            decision: format!("{:?}", e.decision).to_lowercase(),
            decision_source: format!("{:?}", e.decision_source).to_lowercase(),
            reason: e.reason.clone(),
            engine_version: e.engine_version.clone(),
        }
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = gc_runs)]
struct GcRunRow {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    deleted_version_count: i32,
    deleted_blob_count: i32,
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = audit_records)]
struct AuditRecordRow {
    #[diesel(deserialize_as = i64)]
    id: i64,
    action: String,
    actor: String,
    resource_type: String,
    resource_id: String,
    details: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

impl AuditRecordRow {
    fn into_domain(self) -> AuditRecord {
        AuditRecord {
            action: self.action,
            actor: self.actor,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            details: self.details,
            occurred_at: self.occurred_at,
        }
    }
}

#[async_trait]
impl TruthStore for PgTruthStore {
    async fn find_repo(&self, tenant_id: Uuid, repo_key: &str) -> anyhow::Result<Option<Repo>> {
        let mut conn = self.conn().await?;
        let row = repos::table
            .filter(repos::tenant_id.eq(tenant_id))
            .filter(repos::repo_key.eq(repo_key))
            .first::<RepoRow>(&mut conn)
            .await
            .optional()?;
        row.map(RepoRow::into_domain).transpose()
    }

    async fn insert_repo(&self, repo: Repo) -> anyhow::Result<Repo> {
        let mut conn = self.conn().await?;
        diesel::insert_into(repos::table)
            .values(RepoRow::from_domain(&repo))
            .execute(&mut conn)
            .await?;
        Ok(repo)
    }

    async fn list_repos_for_tenant(&self, tenant_id: Uuid) -> anyhow::Result<Vec<Repo>> {
        let mut conn = self.conn().await?;
        let rows = repos::table
            .filter(repos::tenant_id.eq(tenant_id))
            .load::<RepoRow>(&mut conn)
            .await?;
        rows.into_iter().map(RepoRow::into_domain).collect()
    }

    async fn find_token_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<Token>> {
        let mut conn = self.conn().await?;
        let row = tokens::table
            .filter(tokens::token_hash.eq(token_hash))
            .first::<TokenRow>(&mut conn)
            .await
            .optional()?;
        row.map(TokenRow::into_domain).transpose()
    }

    async fn insert_token(&self, token: Token) -> anyhow::Result<Token> {
        let mut conn = self.conn().await?;
        diesel::insert_into(tokens::table)
            .values(TokenRow::from_domain(&token))
            .execute(&mut conn)
            .await?;
        Ok(token)
    }

    async fn revoke_token(&self, token_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(tokens::table.filter(tokens::token_id.eq(token_id)))
            .set(tokens::revoked_at.eq(Some(now)))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_role_bindings(&self, tenant_id: Uuid, subject: &str) -> anyhow::Result<Vec<RoleBinding>> {
        let mut conn = self.conn().await?;
        let rows: Vec<(Uuid, Uuid, String, Vec<String>)> = role_bindings::table
            .filter(role_bindings::tenant_id.eq(tenant_id))
            .filter(role_bindings::subject.eq(subject))
            .select((
                role_bindings::tenant_id,
                role_bindings::repo_id,
                role_bindings::subject,
                role_bindings::roles,
            ))
            .load(&mut conn)
            .await?;
        rows.into_iter()
            .map(|(tenant_id, repo_id, subject, roles)| {
                let roles = roles
                    .iter()
                    .map(|r| role_from_text(r))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok(RoleBinding { tenant_id, repo_id, subject, roles })
            })
            .collect()
    }

    async fn upsert_role_binding(&self, binding: RoleBinding) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let roles: Vec<String> = binding.roles.iter().map(|r| role_to_text(*r).to_string()).collect();
        diesel::insert_into(role_bindings::table)
            .values((
                role_bindings::tenant_id.eq(binding.tenant_id),
                role_bindings::repo_id.eq(binding.repo_id),
                role_bindings::subject.eq(binding.subject.clone()),
                role_bindings::roles.eq(roles.clone()),
            ))
            .on_conflict((role_bindings::tenant_id, role_bindings::repo_id, role_bindings::subject))
            .do_update()
            .set(role_bindings::roles.eq(roles))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn insert_upload_session(&self, session: UploadSession) -> anyhow::Result<UploadSession> {
        let mut conn = self.conn().await?;
        diesel::insert_into(upload_sessions::table)
            .values(UploadSessionRow::from_domain(&session))
            .execute(&mut conn)
            .await?;
        Ok(session)
    }

    async fn find_upload_session(&self, upload_id: Uuid) -> anyhow::Result<Option<UploadSession>> {
        let mut conn = self.conn().await?;
        let row = upload_sessions::table
            .filter(upload_sessions::upload_id.eq(upload_id))
            .first::<UploadSessionRow>(&mut conn)
            .await
            .optional()?;
        row.map(UploadSessionRow::into_domain).transpose()
    }

    async fn transition_upload_session(
        &self,
        upload_id: Uuid,
        from: UploadState,
        to: UploadState,
    ) -> anyhow::Result<bool> {
        let mut conn = self.conn().await?;
        let affected = diesel::update(
            upload_sessions::table
                .filter(upload_sessions::upload_id.eq(upload_id))
                .filter(upload_sessions::state.eq(upload_state_to_text(from))),
        )
        .set(upload_sessions::state.eq(upload_state_to_text(to)))
        .execute(&mut conn)
        .await?;
        Ok(affected == 1)
    }

    async fn complete_upload_session(&self, upload_id: Uuid, blob_digest: &str, deduped: bool) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(upload_sessions::table.filter(upload_sessions::upload_id.eq(upload_id)))
            .set((
                upload_sessions::state.eq(upload_state_to_text(UploadState::Committed)),
                upload_sessions::committed_blob_digest.eq(Some(blob_digest.to_string())),
                upload_sessions::deduped.eq(deduped),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_expired_upload_sessions(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<UploadSession>> {
        let mut conn = self.conn().await?;
        let rows = upload_sessions::table
            .filter(upload_sessions::expires_at.lt(now))
            .filter(
                upload_sessions::state
                    .eq(upload_state_to_text(UploadState::Initiated))
                    .or(upload_sessions::state.eq(upload_state_to_text(UploadState::PartsUploading)))
                    .or(upload_sessions::state.eq(upload_state_to_text(UploadState::PendingCommit))),
            )
            .order(upload_sessions::expires_at.asc())
            .limit(limit as i64)
            .load::<UploadSessionRow>(&mut conn)
            .await?;
        rows.into_iter().map(UploadSessionRow::into_domain).collect()
    }

    async fn find_blob(&self, digest: &str) -> anyhow::Result<Option<Blob>> {
        let mut conn = self.conn().await?;
        let row = blobs::table
            .filter(blobs::digest.eq(digest))
            .first::<BlobRow>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(BlobRow::into_domain))
    }

    async fn insert_blob_if_absent(&self, blob: Blob) -> anyhow::Result<Blob> {
        let mut conn = self.conn().await?;
        diesel::insert_into(blobs::table)
            .values(BlobRow::from_domain(&blob))
            .on_conflict(blobs::digest)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        let row = blobs::table
            .filter(blobs::digest.eq(&blob.digest))
            .first::<BlobRow>(&mut conn)
            .await?;
        Ok(row.into_domain())
    }

    async fn find_version_by_identity(&self, identity: &VersionIdentity) -> anyhow::Result<Option<PackageVersion>> {
        let mut conn = self.conn().await?;
        let mut query = package_versions::table
            .filter(package_versions::tenant_id.eq(identity.tenant_id))
            .filter(package_versions::repo_id.eq(identity.repo_id))
            .filter(package_versions::package_type.eq(&identity.package_type))
            .filter(package_versions::package_name.eq(&identity.package_name))
            .filter(package_versions::version.eq(&identity.version))
            .into_boxed();
        query = match &identity.package_namespace {
            Some(ns) => query.filter(package_versions::package_namespace.eq(ns)),
            None => query.filter(package_versions::package_namespace.is_null()),
        };
        let row = query.first::<PackageVersionRow>(&mut conn).await.optional()?;
        row.map(PackageVersionRow::into_domain).transpose()
    }

    async fn insert_draft_version(&self, version: PackageVersion) -> anyhow::Result<PackageVersion> {
        let mut conn = self.conn().await?;
        diesel::insert_into(package_versions::table)
            .values(PackageVersionRow::from_domain(&version))
            .execute(&mut conn)
            .await?;
        Ok(version)
    }

    async fn upsert_artifact_entry(&self, entry: ArtifactEntry) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(artifact_entries::table)
            .values(ArtifactEntryRow::from_domain(&entry))
            .on_conflict((artifact_entries::version_id, artifact_entries::relative_path))
            .do_update()
            .set((
                artifact_entries::blob_digest.eq(entry.blob_digest.clone()),
                artifact_entries::size_bytes.eq(entry.size_bytes),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_artifact_entries(&self, version_id: Uuid) -> anyhow::Result<Vec<ArtifactEntry>> {
        let mut conn = self.conn().await?;
        let rows = artifact_entries::table
            .filter(artifact_entries::version_id.eq(version_id))
            .order(artifact_entries::relative_path.asc())
            .load::<ArtifactEntryRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(ArtifactEntryRow::into_domain).collect())
    }

    async fn upsert_manifest(&self, manifest: Manifest) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(manifests::table)
            .values(ManifestRow::from_domain(&manifest))
            .on_conflict(manifests::version_id)
            .do_update()
            .set((
                manifests::manifest_json.eq(manifest.manifest_json.clone()),
                manifests::manifest_blob_digest.eq(manifest.manifest_blob_digest.clone()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_manifest(&self, version_id: Uuid) -> anyhow::Result<Option<Manifest>> {
        let mut conn = self.conn().await?;
        let row = manifests::table
            .filter(manifests::version_id.eq(version_id))
            .first::<ManifestRow>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(ManifestRow::into_domain))
    }

    async fn find_versions_referencing_blob_in_repo(&self, repo_id: Uuid, digest: &str) -> anyhow::Result<Vec<PackageVersion>> {
        let mut conn = self.conn().await?;
        let rows = package_versions::table
            .inner_join(artifact_entries::table.on(artifact_entries::version_id.eq(package_versions::version_id)))
            .filter(package_versions::repo_id.eq(repo_id))
            .filter(artifact_entries::blob_digest.eq(digest))
            .select((
                package_versions::version_id,
                package_versions::tenant_id,
                package_versions::repo_id,
                package_versions::package_type,
                package_versions::package_namespace,
                package_versions::package_name,
                package_versions::version,
                package_versions::state,
                package_versions::created_by_subject,
                package_versions::published_at,
            ))
            .distinct()
            .load::<PackageVersionRow>(&mut conn)
            .await?;
        rows.into_iter().map(PackageVersionRow::into_domain).collect()
    }

    async fn has_committed_session_for_blob_in_repo(&self, repo_id: Uuid, digest: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = upload_sessions::table
            .filter(upload_sessions::repo_id.eq(repo_id))
            .filter(upload_sessions::state.eq(upload_state_to_text(UploadState::Committed)))
            .filter(upload_sessions::committed_blob_digest.eq(digest))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count > 0)
    }

    async fn publish_version_transactionally(
        &self,
        version_id: Uuid,
        outbox_event: OutboxEvent,
        audit_record: AuditRecord,
    ) -> anyhow::Result<bool> {
        let mut conn = self.conn().await?;
        conn.transaction::<bool, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let affected = diesel::update(
                    package_versions::table
                        .filter(package_versions::version_id.eq(version_id))
                        .filter(package_versions::state.eq(version_state_to_text(VersionState::Draft))),
                )
                .set((
                    package_versions::state.eq(version_state_to_text(VersionState::Published)),
                    package_versions::published_at.eq(Some(outbox_event.occurred_at)),
                ))
                .execute(conn)
                .await?;
                if affected != 1 {
                    return Ok(false);
                }
                diesel::insert_into(outbox_events::table)
                    .values(OutboxEventRow::from_domain(&outbox_event))
                    .execute(conn)
                    .await?;
                insert_audit_row(conn, &audit_record).await?;
                Ok(true)
            })
        })
        .await
    }

    async fn find_version(&self, version_id: Uuid) -> anyhow::Result<Option<PackageVersion>> {
        let mut conn = self.conn().await?;
        let row = package_versions::table
            .filter(package_versions::version_id.eq(version_id))
            .first::<PackageVersionRow>(&mut conn)
            .await
            .optional()?;
        row.map(PackageVersionRow::into_domain).transpose()
    }

    async fn insert_policy_evaluation(&self, evaluation: PolicyEvaluation) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(policy_evaluations::table)
            .values(PolicyEvaluationRow::from_domain(&evaluation))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn insert_quarantine_item(&self, item: QuarantineItem) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(quarantine_items::table)
            .values(QuarantineItemRow::from_domain(&item))
            .on_conflict(quarantine_items::quarantine_id)
            .do_update()
            .set(quarantine_items::status.eq(quarantine_status_to_text(item.status)))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_quarantine_item(&self, version_id: Uuid) -> anyhow::Result<Option<QuarantineItem>> {
        let mut conn = self.conn().await?;
        let row = quarantine_items::table
            .filter(quarantine_items::version_id.eq(version_id))
            .first::<QuarantineItemRow>(&mut conn)
            .await
            .optional()?;
        row.map(QuarantineItemRow::into_domain).transpose()
    }

    async fn find_quarantine_item_by_id(&self, quarantine_id: Uuid) -> anyhow::Result<Option<QuarantineItem>> {
        let mut conn = self.conn().await?;
        let row = quarantine_items::table
            .filter(quarantine_items::quarantine_id.eq(quarantine_id))
            .first::<QuarantineItemRow>(&mut conn)
            .await
            .optional()?;
        row.map(QuarantineItemRow::into_domain).transpose()
    }

    async fn list_quarantine_items(&self, repo_id: Uuid, status: Option<QuarantineStatus>) -> anyhow::Result<Vec<QuarantineItem>> {
        let mut conn = self.conn().await?;
        let mut query = quarantine_items::table
            .filter(quarantine_items::repo_id.eq(repo_id))
            .into_boxed();
        if let Some(status) = status {
            query = query.filter(quarantine_items::status.eq(quarantine_status_to_text(status)));
        }
        let rows = query
            .order(quarantine_items::quarantine_id.asc())
            .load::<QuarantineItemRow>(&mut conn)
            .await?;
        rows.into_iter().map(QuarantineItemRow::into_domain).collect()
    }

    async fn update_quarantine_status(&self, quarantine_id: Uuid, status: QuarantineStatus) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(quarantine_items::table.filter(quarantine_items::quarantine_id.eq(quarantine_id)))
            .set(quarantine_items::status.eq(quarantine_status_to_text(status)))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn insert_outbox_event(&self, event: OutboxEvent) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(outbox_events::table)
            .values(OutboxEventRow::from_domain(&event))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_outbox_batch(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<OutboxEvent>> {
        let mut conn = self.conn().await?;
        conn.transaction::<Vec<OutboxEvent>, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let rows = outbox_events::table
                    .filter(outbox_events::delivered_at.is_null())
                    .filter(outbox_events::available_at.le(now))
                    .order(outbox_events::available_at.asc())
                    .limit(limit as i64)
                    .for_update()
                    .skip_locked()
                    .load::<OutboxEventRow>(conn)
                    .await?;
                let ids: Vec<Uuid> = rows.iter().map(|r| r.event_id).collect();
                diesel::update(outbox_events::table.filter(outbox_events::event_id.eq_any(&ids)))
                    .set(outbox_events::claimed_at.eq(Some(now)))
                    .execute(conn)
                    .await?;
                Ok(rows.into_iter().map(OutboxEventRow::into_domain).collect())
            })
        })
        .await
    }

    async fn mark_outbox_delivered(&self, event_id: Uuid, delivered_at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_events::table.filter(outbox_events::event_id.eq(event_id)))
            .set(outbox_events::delivered_at.eq(Some(delivered_at)))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn reschedule_outbox_event(&self, event_id: Uuid, available_at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(outbox_events::table.filter(outbox_events::event_id.eq(event_id)))
            .set((
                outbox_events::available_at.eq(available_at),
                outbox_events::claimed_at.eq(None::<DateTime<Utc>>),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn upsert_search_job(&self, job: SearchIndexJob) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(search_index_jobs::table)
            .values(SearchIndexJobRow::from_domain(&job))
            .on_conflict((search_index_jobs::tenant_id, search_index_jobs::version_id))
            .do_update()
            .set((
                search_index_jobs::status.eq(job_status_to_text(job.status)),
                search_index_jobs::available_at.eq(job.available_at),
                search_index_jobs::updated_at.eq(job.updated_at),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_search_jobs(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<SearchIndexJob>> {
        let mut conn = self.conn().await?;
        conn.transaction::<Vec<SearchIndexJob>, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let rows = search_index_jobs::table
                    .filter(search_index_jobs::status.eq(job_status_to_text(JobStatus::Pending)))
                    .filter(search_index_jobs::available_at.le(now))
                    .order(search_index_jobs::available_at.asc())
                    .limit(limit as i64)
                    .for_update()
                    .skip_locked()
                    .load::<SearchIndexJobRow>(conn)
                    .await?;
                for row in &rows {
                    diesel::update(
                        search_index_jobs::table
                            .filter(search_index_jobs::tenant_id.eq(row.tenant_id))
                            .filter(search_index_jobs::version_id.eq(row.version_id)),
                    )
                    .set((
                        search_index_jobs::status.eq(job_status_to_text(JobStatus::Processing)),
                        search_index_jobs::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;
                }
                rows.into_iter().map(|r| r.into_domain()).collect()
            })
        })
        .await
    }

    async fn complete_search_job(&self, tenant_id: Uuid, version_id: Uuid) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(
            search_index_jobs::table
                .filter(search_index_jobs::tenant_id.eq(tenant_id))
                .filter(search_index_jobs::version_id.eq(version_id)),
        )
        .set((
            search_index_jobs::status.eq(job_status_to_text(JobStatus::Completed)),
            search_index_jobs::last_error.eq(None::<String>),
        ))
        .execute(&mut conn)
        .await?;
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
        let mut conn = self.conn().await?;
        let status = if terminal { JobStatus::Failed } else { JobStatus::Pending };
        diesel::update(
            search_index_jobs::table
                .filter(search_index_jobs::tenant_id.eq(tenant_id))
                .filter(search_index_jobs::version_id.eq(version_id)),
        )
        .set((
            search_index_jobs::status.eq(job_status_to_text(status)),
            search_index_jobs::available_at.eq(next_available_at),
            search_index_jobs::last_error.eq(Some(error.to_string())),
            search_index_jobs::attempts.eq(search_index_jobs::attempts + 1),
        ))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn count_pending_search_jobs(&self) -> anyhow::Result<u64> {
        let mut conn = self.conn().await?;
        let count: i64 = search_index_jobs::table
            .filter(search_index_jobs::status.eq(job_status_to_text(JobStatus::Pending)))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count as u64)
    }

    async fn count_failed_search_jobs(&self) -> anyhow::Result<u64> {
        let mut conn = self.conn().await?;
        let count: i64 = search_index_jobs::table
            .filter(search_index_jobs::status.eq(job_status_to_text(JobStatus::Failed)))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count as u64)
    }

    async fn count_outbox_backlog(&self, now: DateTime<Utc>) -> anyhow::Result<OutboxBacklog> {
        let mut conn = self.conn().await?;
        let pending: i64 = outbox_events::table
            .filter(outbox_events::delivered_at.is_null())
            .count()
            .get_result(&mut conn)
            .await?;
        let available: i64 = outbox_events::table
            .filter(outbox_events::delivered_at.is_null())
            .filter(outbox_events::available_at.le(now))
            .count()
            .get_result(&mut conn)
            .await?;
        let oldest: Option<DateTime<Utc>> = outbox_events::table
            .filter(outbox_events::delivered_at.is_null())
            .select(outbox_events::occurred_at)
            .order(outbox_events::occurred_at.asc())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(OutboxBacklog {
            pending: pending as u64,
            available: available as u64,
            oldest_pending_age_seconds: oldest.map(|t| (now - t).num_seconds().max(0)),
        })
    }

    async fn insert_tombstone(&self, tombstone: Tombstone) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(tombstones::table)
            .values(TombstoneRow::from_domain(&tombstone))
            .on_conflict(tombstones::version_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_tombstone(&self, version_id: Uuid) -> anyhow::Result<Option<Tombstone>> {
        let mut conn = self.conn().await?;
        let row = tombstones::table
            .filter(tombstones::version_id.eq(version_id))
            .first::<TombstoneRow>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(TombstoneRow::into_domain))
    }

    async fn find_due_tombstones(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<Tombstone>> {
        let mut conn = self.conn().await?;
        let rows = tombstones::table
            .filter(tombstones::retention_until.le(now))
            .order((tombstones::retention_until.asc(), tombstones::version_id.asc()))
            .limit(limit as i64)
            .load::<TombstoneRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(TombstoneRow::into_domain).collect())
    }

    async fn delete_version_and_entries(&self, version_id: Uuid) -> anyhow::Result<Vec<ArtifactEntry>> {
        let mut conn = self.conn().await?;
        conn.transaction::<Vec<ArtifactEntry>, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let entries = artifact_entries::table
                    .filter(artifact_entries::version_id.eq(version_id))
                    .load::<ArtifactEntryRow>(conn)
                    .await?;
                diesel::delete(artifact_entries::table.filter(artifact_entries::version_id.eq(version_id)))
                    .execute(conn)
                    .await?;
                diesel::delete(manifests::table.filter(manifests::version_id.eq(version_id)))
                    .execute(conn)
                    .await?;
                diesel::delete(tombstones::table.filter(tombstones::version_id.eq(version_id)))
                    .execute(conn)
                    .await?;
                diesel::delete(package_versions::table.filter(package_versions::version_id.eq(version_id)))
                    .execute(conn)
                    .await?;
                Ok(entries.into_iter().map(ArtifactEntryRow::into_domain).collect())
            })
        })
        .await
    }

    async fn find_orphan_blobs(&self, limit: u32, created_before: DateTime<Utc>) -> anyhow::Result<Vec<Blob>> {
        let mut conn = self.conn().await?;
        let rows = blobs::table
            .filter(diesel::dsl::not(diesel::dsl::exists(
                artifact_entries::table.filter(artifact_entries::blob_digest.eq(blobs::digest)),
            )))
            .filter(blobs::created_at.le(created_before))
            .order(blobs::digest.asc())
            .limit(limit as i64)
            .load::<BlobRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(BlobRow::into_domain).collect())
    }

    async fn delete_blob(&self, digest: &str) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::delete(blobs::table.filter(blobs::digest.eq(digest)))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn start_gc_run(&self, run: GcRunRecord) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(gc_runs::table)
            .values(GcRunRow {
                run_id: run.run_id,
                started_at: run.started_at,
                completed_at: run.completed_at,
                deleted_version_count: run.deleted_version_count as i32,
                deleted_blob_count: run.deleted_blob_count as i32,
            })
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn complete_gc_run(&self, run_id: Uuid, completed_at: DateTime<Utc>, deleted_version_count: u32, deleted_blob_count: u32) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(gc_runs::table.filter(gc_runs::run_id.eq(run_id)))
            .set((
                gc_runs::completed_at.eq(Some(completed_at)),
                gc_runs::deleted_version_count.eq(deleted_version_count as i32),
                gc_runs::deleted_blob_count.eq(deleted_blob_count as i32),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn count_incomplete_gc_runs(&self) -> anyhow::Result<u64> {
        let mut conn = self.conn().await?;
        let count: i64 = gc_runs::table
            .filter(gc_runs::completed_at.is_null())
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count as u64)
    }

    async fn insert_audit_record(&self, record: AuditRecord) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        insert_audit_row(&mut conn, &record).await
    }

    async fn list_audit_records(&self, action: Option<&str>, since: Option<DateTime<Utc>>, limit: u32) -> anyhow::Result<Vec<AuditRecord>> {
        let mut conn = self.conn().await?;
        let mut query = audit_records::table.into_boxed();
        if let Some(action) = action {
            query = query.filter(audit_records::action.eq(action.to_string()));
        }
        if let Some(since) = since {
            query = query.filter(audit_records::occurred_at.ge(since));
        }
        let rows = query
            .order(audit_records::occurred_at.desc())
            .limit(limit as i64)
            .load::<AuditRecordRow>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(AuditRecordRow::into_domain).collect())
    }
}

async fn insert_audit_row(conn: &mut AsyncPgConnection, record: &AuditRecord) -> anyhow::Result<()> {
    diesel::insert_into(audit_records::table)
        .values((
            audit_records::action.eq(record.action.clone()),
            audit_records::actor.eq(record.actor.clone()),
            audit_records::resource_type.eq(record.resource_type.clone()),
            audit_records::resource_id.eq(record.resource_id.clone()),
            audit_records::details.eq(record.details.clone()),
            audit_records::occurred_at.eq(record.occurred_at),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

fn role_to_text(r: af_types::Role) -> &'static str {
    match r {
        af_types::Role::Admin => "admin",
        af_types::Role::Write => "write",
        af_types::Role::Read => "read",
    }
}
fn role_from_text(s: &str) -> anyhow::Result<af_types::Role> {
    match s {
        "admin" => Ok(af_types::Role::Admin),
        "write" => Ok(af_types::Role::Write),
        "read" => Ok(af_types::Role::Read),
        other => Err(anyhow!("unknown role {other}")),
    }
}
