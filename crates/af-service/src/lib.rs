//! The HTTP edge (spec §6): a thin `axum` layer over [`af_core::ArtifortressCore`].
//! Every handler here does exactly three things — extract the bearer
//! credential, parse the request body, and call straight into the
//! facade — so the actual business rules live in exactly one place.

#![deny(unsafe_code)]

use std::sync::Arc;

use af_core::ArtifortressCore;
use af_error::Error;
use af_objectstore::ByteRange;
use af_policy::EvaluateRequest;
use af_publish::{DraftRequest, EntryRequest};
use af_types::{Principal, QuarantineStatus, RepoType};
use axum::{
    extract::{Path as AxPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

pub struct AppState {
    pub core: Arc<ArtifortressCore>,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let resp = self.0.to_response();
        (status, Json(json!({ "error": resp.error, "message": resp.message }))).into_response()
    }
}

fn bearer(headers: &HeaderMap) -> &str {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
}

async fn authenticate(state: &AppState, headers: &HeaderMap, repo_keys: &[(Uuid, String)]) -> Result<Principal, ApiError> {
    Ok(state.core.authenticate(bearer(headers), Utc::now(), repo_keys).await?)
}

pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/v1/auth/pats", post(issue_pat))
        .route("/v1/auth/pats/revoke", post(revoke_pat))
        .route("/v1/auth/whoami", get(whoami))
        .route("/v1/auth/saml/metadata", get(saml_metadata))
        .route("/v1/auth/saml/acs", post(saml_acs))
        .route("/v1/repos", post(create_repo))
        .route("/v1/repos/{key}", get(get_repo))
        .route("/v1/repos/{key}/bindings/{subject}", put(upsert_binding))
        .route("/v1/repos/{key}/uploads", post(create_upload))
        .route("/v1/repos/{key}/uploads/{id}/parts", post(presign_part))
        .route("/v1/repos/{key}/uploads/{id}/complete", post(complete_upload))
        .route("/v1/repos/{key}/uploads/{id}/abort", post(abort_upload))
        .route("/v1/repos/{key}/uploads/{id}/commit", post(commit_upload))
        .route("/v1/repos/{key}/blobs/{digest}", get(read_blob))
        .route("/v1/repos/{key}/packages/versions/drafts", post(create_draft))
        .route("/v1/repos/{key}/packages/versions/{v}/entries", post(upsert_entries))
        .route("/v1/repos/{key}/packages/versions/{v}/manifest", put(put_manifest).get(get_manifest))
        .route("/v1/repos/{key}/packages/versions/{v}/publish", post(publish_version))
        .route("/v1/repos/{key}/packages/versions/{v}/tombstone", post(tombstone_version))
        .route("/v1/repos/{key}/policy/evaluations", post(evaluate_policy))
        .route("/v1/repos/{key}/quarantine", get(list_quarantine))
        .route("/v1/repos/{key}/quarantine/{id}/release", post(release_quarantine))
        .route("/v1/repos/{key}/quarantine/{id}/reject", post(reject_quarantine))
        .route("/v1/admin/gc/runs", post(run_gc))
        .route("/v1/admin/reconcile/blobs", get(reconcile_blobs))
        .route("/v1/admin/ops/summary", get(ops_summary))
        .route("/v1/audit", get(list_audit))
        .with_state(state)
}

async fn health_live() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "time": Utc::now().to_rfc3339() }))
}

async fn health_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.core.readiness(Utc::now()).await;
    let status = if report.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "status": if report.healthy { "ready" } else { "not_ready" },
            "dependencies": report.dependencies.iter().map(|d| json!({ "name": d.name, "healthy": d.healthy })).collect::<Vec<_>>(),
        })),
    )
}

#[derive(Deserialize)]
struct IssuePatRequest {
    tenant_id: Uuid,
    subject: String,
    ttl_seconds: i64,
}

async fn issue_pat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<IssuePatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let (token, plaintext) = state
        .core
        .issue_pat(&principal, req.tenant_id, &req.subject, vec![], chrono::Duration::seconds(req.ttl_seconds), Utc::now())
        .await?;
    Ok(Json(json!({ "token": plaintext, "tokenId": token.token_id })))
}

#[derive(Deserialize)]
struct RevokePatRequest {
    token_id: Uuid,
}

async fn revoke_pat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RevokePatRequest>,
) -> Result<StatusCode, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    state.core.revoke_pat(&principal, req.token_id, Utc::now()).await?;
    Ok(StatusCode::OK)
}

async fn whoami(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    Ok(Json(json!({
        "subject": principal.subject,
        "scopes": principal.scopes.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        "authSource": format!("{:?}", principal.auth_source),
    })))
}

async fn saml_metadata() -> impl IntoResponse {
    let body = "<?xml version=\"1.0\"?><EntityDescriptor xmlns=\"urn:oasis:names:tc:SAML:2.0:metadata\"/>";
    ([(axum::http::header::CONTENT_TYPE, "application/samlmetadata+xml")], body.to_string())
}

#[derive(Deserialize)]
struct SamlAcsRequest {
    tenant_id: Uuid,
    #[serde(rename = "SAMLResponse")]
    saml_response: String,
}

async fn saml_acs(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SamlAcsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (token, plaintext) = state.core.saml_acs(req.tenant_id, &req.saml_response, Utc::now()).await?;
    Ok(Json(json!({ "token": plaintext, "tokenId": token.token_id })))
}

#[derive(Deserialize)]
struct CreateRepoRequest {
    tenant_id: Uuid,
    repo_key: String,
    repo_type: String,
    upstream_url: Option<String>,
    #[serde(default)]
    member_repo_keys: Vec<String>,
}

async fn create_repo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRepoRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let repo_type = match req.repo_type.as_str() {
        "local" => RepoType::Local,
        "remote" => RepoType::Remote,
        "virtual" => RepoType::Virtual,
        other => return Err(Error::validation(format!("unknown repoType '{other}'")).into()),
    };
    let repo = state
        .core
        .create_repo(&principal, req.tenant_id, &req.repo_key, repo_type, req.upstream_url, req.member_repo_keys)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "repoId": repo.repo_id, "repoKey": repo.repo_key }))))
}

#[derive(Deserialize)]
struct TenantQuery {
    tenant_id: Uuid,
}

async fn get_repo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(key): AxPath<String>,
    Query(q): Query<TenantQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let repo = state.core.get_repo(&principal, q.tenant_id, &key).await?;
    Ok(Json(json!({ "repoId": repo.repo_id, "repoKey": repo.repo_key })))
}

#[derive(Deserialize)]
struct UpsertBindingBody {
    tenant_id: Uuid,
    repo_id: Uuid,
    roles: std::collections::BTreeSet<af_types::Role>,
}

async fn upsert_binding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, subject)): AxPath<(String, String)>,
    Json(req): Json<UpsertBindingBody>,
) -> Result<StatusCode, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    state
        .core
        .upsert_role_binding(&principal, &key, af_types::RoleBinding { tenant_id: req.tenant_id, repo_id: req.repo_id, subject, roles: req.roles })
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct CreateUploadBody {
    tenant_id: Uuid,
    expected_digest: String,
    expected_length: u64,
}

async fn create_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(key): AxPath<String>,
    Json(req): Json<CreateUploadBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let created = state
        .core
        .create_upload(
            &principal,
            req.tenant_id,
            &key,
            af_uploads::CreateUploadRequest { expected_digest: req.expected_digest, expected_length: req.expected_length },
            Utc::now(),
        )
        .await?;
    let status = if created.deduped { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(json!({ "uploadId": created.session.upload_id, "state": format!("{:?}", created.session.state), "deduped": created.deduped }))))
}

#[derive(Deserialize)]
struct PresignPartBody {
    part_number: u32,
    #[serde(default = "default_ttl_seconds")]
    ttl_seconds: u64,
}

fn default_ttl_seconds() -> u64 {
    900
}

async fn presign_part(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, id)): AxPath<(String, Uuid)>,
    Json(req): Json<PresignPartBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let url = state
        .core
        .presign_upload_part(&principal, &key, id, req.part_number, std::time::Duration::from_secs(req.ttl_seconds), Utc::now())
        .await?;
    Ok(Json(json!({ "uploadUrl": url })))
}

#[derive(Deserialize)]
struct CompletePartEntry {
    part_number: u32,
    etag: String,
}

#[derive(Deserialize)]
struct CompleteUploadBody {
    parts: Vec<CompletePartEntry>,
}

async fn complete_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, id)): AxPath<(String, Uuid)>,
    Json(req): Json<CompleteUploadBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let parts = req.parts.into_iter().map(|p| (p.part_number, p.etag)).collect();
    let session = state.core.complete_upload(&principal, &key, id, parts, Utc::now()).await?;
    Ok(Json(json!({ "uploadId": session.upload_id, "state": format!("{:?}", session.state) })))
}

#[derive(Deserialize, Default)]
struct AbortUploadBody {
    reason: Option<String>,
}

async fn abort_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, id)): AxPath<(String, Uuid)>,
    body: Option<Json<AbortUploadBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let reason = body.and_then(|b| b.0.reason);
    let session = state.core.abort_upload(&principal, &key, id, reason, Utc::now()).await?;
    Ok(Json(json!({ "uploadId": session.upload_id, "state": format!("{:?}", session.state) })))
}

async fn commit_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, id)): AxPath<(String, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let session = state.core.commit_upload(&principal, &key, id, Utc::now()).await?;
    Ok(Json(json!({ "uploadId": session.upload_id, "state": format!("{:?}", session.state), "digest": session.committed_blob_digest })))
}

#[derive(Deserialize)]
struct BlobReadQuery {
    tenant_id: Uuid,
}

async fn read_blob(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, digest)): AxPath<(String, String)>,
    Query(q): Query<BlobReadQuery>,
) -> Result<Response, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let range = headers
        .get(axum::http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse);

    match state.core.read_blob(&principal, q.tenant_id, &key, &digest, range).await? {
        Some((data, _total)) => {
            let status = if range.is_some() { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };
            Ok((status, data).into_response())
        }
        None => Ok(StatusCode::RANGE_NOT_SATISFIABLE.into_response()),
    }
}

#[derive(Deserialize)]
struct CreateDraftBody {
    tenant_id: Uuid,
    package_type: String,
    #[serde(default)]
    package_namespace: String,
    package_name: String,
    version: String,
}

async fn create_draft(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(key): AxPath<String>,
    Json(req): Json<CreateDraftBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let outcome = state
        .core
        .create_draft(
            &principal,
            req.tenant_id,
            &key,
            DraftRequest {
                package_type: req.package_type,
                package_namespace: req.package_namespace,
                package_name: req.package_name,
                version: req.version,
            },
            Utc::now(),
        )
        .await?;
    let status = if outcome.reused_draft { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(json!({ "versionId": outcome.version.version_id, "reusedDraft": outcome.reused_draft }))))
}

#[derive(Deserialize)]
struct EntryBody {
    relative_path: String,
    blob_digest: String,
    size_bytes: u64,
}

#[derive(Deserialize)]
struct UpsertEntriesBody {
    entries: Vec<EntryBody>,
}

async fn upsert_entries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, version_id)): AxPath<(String, Uuid)>,
    Json(req): Json<UpsertEntriesBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let entries = req
        .entries
        .into_iter()
        .map(|e| EntryRequest { relative_path: e.relative_path, blob_digest: e.blob_digest, size_bytes: e.size_bytes })
        .collect();
    let saved = state.core.upsert_entries(&principal, &key, version_id, entries).await?;
    Ok(Json(json!({ "entryCount": saved.len() })))
}

async fn put_manifest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, version_id)): AxPath<(String, Uuid)>,
    Json(manifest): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let manifest = state.core.upsert_manifest(&principal, &key, version_id, manifest).await?;
    Ok(Json(json!({ "manifestBlobDigest": manifest.manifest_blob_digest })))
}

async fn get_manifest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, version_id)): AxPath<(String, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    match state.core.get_manifest(&principal, &key, version_id).await? {
        Some(manifest) => Ok(Json(json!({
            "versionId": manifest.version_id,
            "manifest": manifest.manifest_json,
            "manifestBlobDigest": manifest.manifest_blob_digest,
        }))),
        None => Err(Error::not_found(format!("manifest for version {version_id} not found")).into()),
    }
}

async fn publish_version(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, version_id)): AxPath<(String, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let outcome = state.core.publish_version(&principal, &key, version_id, Utc::now()).await?;
    Ok(Json(json!({ "versionId": outcome.version.version_id, "state": format!("{:?}", outcome.version.state), "idempotent": outcome.idempotent })))
}

#[derive(Deserialize)]
struct TombstoneBody {
    reason: String,
    #[serde(default = "default_retention_days")]
    retention_days: i64,
}

fn default_retention_days() -> i64 {
    30
}

async fn tombstone_version(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, version_id)): AxPath<(String, Uuid)>,
    Json(req): Json<TombstoneBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let tombstone = state
        .core
        .tombstone_version(&principal, &key, version_id, af_lifecycle::TombstoneRequest { reason: req.reason, retention_days: req.retention_days }, Utc::now())
        .await?;
    Ok(Json(json!({ "versionId": tombstone.version_id, "retentionUntil": tombstone.retention_until })))
}

#[derive(Deserialize)]
struct EvaluatePolicyBody {
    tenant_id: Uuid,
    version_id: Uuid,
    action: String,
    reason: String,
    decision_hint: Option<String>,
}

async fn evaluate_policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(key): AxPath<String>,
    Json(req): Json<EvaluatePolicyBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let action = match req.action.as_str() {
        "publish" => af_types::PolicyAction::Publish,
        "promote" => af_types::PolicyAction::Promote,
        other => return Err(Error::validation(format!("unknown action '{other}'")).into()),
    };
    let hint = af_policy::parse_decision_hint(req.decision_hint.as_deref())?;
    let outcome = state
        .core
        .evaluate_policy(
            &principal,
            req.tenant_id,
            &key,
            EvaluateRequest { version_id: req.version_id, action, reason: req.reason, decision_hint: hint, engine_version: None },
            Utc::now(),
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "evaluationId": outcome.evaluation_id, "decision": format!("{:?}", outcome.decision), "quarantineId": outcome.quarantine_id })),
    ))
}

#[derive(Deserialize)]
struct QuarantineListQuery {
    tenant_id: Uuid,
    status: Option<String>,
}

async fn list_quarantine(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(key): AxPath<String>,
    Query(q): Query<QuarantineListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let status = match q.status.as_deref() {
        Some("quarantined") => Some(QuarantineStatus::Quarantined),
        Some("released") => Some(QuarantineStatus::Released),
        Some("rejected") => Some(QuarantineStatus::Rejected),
        _ => None,
    };
    let items = state.core.list_quarantine(&principal, q.tenant_id, &key, status).await?;
    Ok(Json(json!({ "items": items.iter().map(|i| json!({ "quarantineId": i.quarantine_id, "versionId": i.version_id, "status": format!("{:?}", i.status) })).collect::<Vec<_>>() })))
}

#[derive(Deserialize)]
struct QuarantineTransitionQuery {
    tenant_id: Uuid,
}

async fn release_quarantine(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, id)): AxPath<(String, Uuid)>,
    Query(q): Query<QuarantineTransitionQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let item = state.core.release_quarantine(&principal, q.tenant_id, &key, id, Utc::now()).await?;
    Ok(Json(json!({ "quarantineId": item.quarantine_id, "status": format!("{:?}", item.status) })))
}

async fn reject_quarantine(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath((key, id)): AxPath<(String, Uuid)>,
    Query(q): Query<QuarantineTransitionQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let item = state.core.reject_quarantine(&principal, q.tenant_id, &key, id, Utc::now()).await?;
    Ok(Json(json!({ "quarantineId": item.quarantine_id, "status": format!("{:?}", item.status) })))
}

#[derive(Deserialize)]
struct RunGcBody {
    #[serde(default = "default_dry_run_true")]
    dry_run: bool,
    #[serde(default = "default_gc_batch_size")]
    batch_size: u32,
    #[serde(default)]
    grace_hours: u32,
}

fn default_dry_run_true() -> bool {
    true
}

fn default_gc_batch_size() -> u32 {
    500
}

async fn run_gc(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RunGcBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let report = state.core.run_gc(&principal, req.batch_size, req.grace_hours, req.dry_run, Utc::now()).await?;
    Ok(Json(json!({
        "mode": if report.dry_run { "dry_run" } else { "execute" },
        "deletedVersionCount": report.deleted_version_count,
        "deletedBlobCount": report.deleted_blob_count,
    })))
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_reconcile_limit")]
    limit: u32,
}

fn default_reconcile_limit() -> u32 {
    100
}

async fn reconcile_blobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let report = state.core.reconcile(&principal, q.limit, Utc::now()).await?;
    Ok(Json(json!({ "orphanBlobCount": report.orphan_blob_count, "sampleDigests": report.sample_digests })))
}

async fn ops_summary(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let summary = state.core.ops_summary(&principal, Utc::now()).await?;
    Ok(Json(json!({
        "pendingOutboxEvents": summary.pending_outbox_events,
        "availableOutboxEvents": summary.available_outbox_events,
        "oldestPendingOutboxAgeSeconds": summary.oldest_pending_outbox_age_seconds,
        "pendingSearchJobs": summary.pending_search_jobs,
        "failedSearchJobs": summary.failed_search_jobs,
        "incompleteGcRuns": summary.incomplete_gc_runs,
        "recentPolicyTimeouts24h": summary.recent_policy_timeouts_24h,
    })))
}

#[derive(Deserialize)]
struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    limit: u32,
    action: Option<String>,
}

fn default_audit_limit() -> u32 {
    100
}

async fn list_audit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<AuditQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = authenticate(&state, &headers, &[]).await?;
    let records = state.core.list_audit_records(&principal, q.action.as_deref(), None, q.limit).await?;
    Ok(Json(json!({
        "records": records.iter().map(|r| json!({
            "action": r.action, "actor": r.actor, "resourceType": r.resource_type,
            "resourceId": r.resource_id, "occurredAt": r.occurred_at,
        })).collect::<Vec<_>>()
    })))
}
