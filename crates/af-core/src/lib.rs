//! # Core
//!
//! C10 — the request orchestration facade: the one place that knows
//! how a bearer credential, a repo-scoped authorization check, and a
//! single component call fit together to answer one HTTP request (spec
//! §6). `af-service` is a thin transport shim over this crate; nothing
//! here knows about HTTP status codes directly; `af_error::Error`
//! carries that mapping.
//!
//! Every public method here takes an already-parsed bearer credential
//! (or nothing, for unauthenticated endpoints like readiness) and a
//! `repo_key`, resolves the [`af_types::Principal`], checks the
//! required [`af_types::Role`] against it, and only then delegates to
//! the owning component crate. Nothing downstream re-checks
//! authorization — this is the single seam where it happens, the way
//! `shipper-auth`'s credential resolver is the one place the CLI
//! decided which outbound token to use.

use std::sync::Arc;

use af_auth::{saml, AuthResolver, AuthSettings, PatLookup, RoleBindingLookup};
use af_audit::{AuditService, OpsSummary, ReadinessReport};
use af_error::Error;
use af_lifecycle::{GcReport, LifecycleEngine, ReconcileReport, TombstoneRequest};
use af_objectstore::{ByteRange, ObjectStore};
use af_outbox::{ConsumerSweepReport, OutboxSweeper, ProducerSweepReport, SweepConfig};
use af_policy::{EvaluateOutcome, EvaluateRequest, PolicyEngine, PolicyTimeoutConfig};
use af_publish::{DraftOutcome, DraftRequest, EntryRequest, PublishOutcome, PublishWorkflow};
use af_store::TruthStore;
use af_types::{
    has_role, AuditRecord, Manifest, PackageVersion, Principal, QuarantineItem, QuarantineStatus,
    Repo, RepoScope, RepoType, Role, RoleBinding, Token, UploadSession,
};
use af_uploads::{CreateUploadRequest, CreatedUpload, UploadEngine};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Adapts [`TruthStore`] to `af-auth`'s narrow PAT lookup trait, so
/// `af-auth` doesn't need to depend on the whole store trait.
struct StorePatLookup {
    store: Arc<dyn TruthStore>,
}

#[async_trait::async_trait]
impl PatLookup for StorePatLookup {
    async fn find_by_hash(&self, _tenant_hint: Option<Uuid>, token_hash: &str) -> anyhow::Result<Option<Token>> {
        self.store.find_token_by_hash(token_hash).await
    }
}

struct StoreBindingLookup {
    store: Arc<dyn TruthStore>,
}

#[async_trait::async_trait]
impl RoleBindingLookup for StoreBindingLookup {
    async fn find_bindings(&self, tenant_id: Uuid, subject: &str) -> anyhow::Result<Vec<RoleBinding>> {
        self.store.find_role_bindings(tenant_id, subject).await
    }
}

pub struct ArtifortressCore {
    store: Arc<dyn TruthStore>,
    objects: Arc<dyn ObjectStore>,
    auth: AuthResolver<StorePatLookup, StoreBindingLookup>,
    uploads: UploadEngine,
    publish: PublishWorkflow,
    policy: PolicyEngine,
    outbox: OutboxSweeper,
    lifecycle: LifecycleEngine,
    audit: AuditService,
}

impl ArtifortressCore {
    pub fn new(
        store: Arc<dyn TruthStore>,
        objects: Arc<dyn ObjectStore>,
        auth_settings: AuthSettings,
        upload_session_ttl: chrono::Duration,
        policy_timeout: PolicyTimeoutConfig,
        outbox_config: SweepConfig,
    ) -> Self {
        let auth = AuthResolver::new(
            auth_settings,
            Arc::new(StorePatLookup { store: store.clone() }),
            Arc::new(StoreBindingLookup { store: store.clone() }),
        );
        Self {
            uploads: UploadEngine::new(store.clone(), objects.clone(), upload_session_ttl),
            publish: PublishWorkflow::new(store.clone()),
            policy: PolicyEngine::new(store.clone(), policy_timeout),
            outbox: OutboxSweeper::new(store.clone(), outbox_config),
            lifecycle: LifecycleEngine::new(store.clone(), objects.clone()),
            audit: AuditService::new(store.clone(), objects.clone()),
            store,
            objects,
            auth,
        }
    }

    // -- authentication -----------------------------------------------------

    /// Resolve a bearer credential given the tenant's currently known
    /// `(repo_id, repo_key)` pairs, for OIDC/SAML scope mapping.
    pub async fn authenticate(&self, presented: &str, now: DateTime<Utc>, repo_keys: &[(Uuid, String)]) -> Result<Principal, Error> {
        self.auth.resolve(presented, now, repo_keys).await
    }

    pub fn whoami(&self, principal: &Principal) -> Principal {
        principal.clone()
    }

    async fn require_role(&self, principal: &Principal, repo_key: &str, role: Role) -> Result<(), Error> {
        if has_role(&principal.scopes, repo_key, role) {
            Ok(())
        } else {
            Err(Error::auth_z(format!("subject '{}' lacks {role} on '{repo_key}'", principal.subject)))
        }
    }

    async fn find_repo_or_404(&self, tenant_id: Uuid, repo_key: &str) -> Result<Repo, Error> {
        self.store
            .find_repo(tenant_id, repo_key)
            .await?
            .ok_or_else(|| Error::not_found(format!("repo '{repo_key}' not found")))
    }

    // -- repos / bindings -----------------------------------------------------

    pub async fn create_repo(
        &self,
        principal: &Principal,
        tenant_id: Uuid,
        repo_key: &str,
        repo_type: RepoType,
        upstream_url: Option<String>,
        member_repo_keys: Vec<String>,
    ) -> Result<Repo, Error> {
        self.require_role(principal, "*", Role::Admin).await?;
        let repo = Repo::new(Uuid::new_v4(), tenant_id, repo_key, repo_type, upstream_url, member_repo_keys)
            .map_err(|e| Error::validation(e.to_string()))?;
        Ok(self.store.insert_repo(repo).await?)
    }

    pub async fn get_repo(&self, principal: &Principal, tenant_id: Uuid, repo_key: &str) -> Result<Repo, Error> {
        self.require_role(principal, repo_key, Role::Read).await?;
        self.find_repo_or_404(tenant_id, repo_key).await
    }

    pub async fn upsert_role_binding(
        &self,
        principal: &Principal,
        repo_key: &str,
        binding: RoleBinding,
    ) -> Result<(), Error> {
        self.require_role(principal, repo_key, Role::Admin).await?;
        Ok(self.store.upsert_role_binding(binding).await?)
    }

    // -- PAT lifecycle --------------------------------------------------------

    /// Issues a fresh personal access token and returns its plaintext
    /// exactly once; only the SHA-256 hash is ever persisted.
    pub async fn issue_pat(
        &self,
        principal: &Principal,
        tenant_id: Uuid,
        subject: &str,
        scopes: Vec<RepoScope>,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<(Token, String), Error> {
        self.require_role(principal, "*", Role::Admin).await?;
        let plaintext = format!("pat_{}", Uuid::new_v4().simple());
        let token = Token {
            token_id: Uuid::new_v4(),
            tenant_id,
            subject: subject.to_string(),
            token_hash: af_crypto::hash_token(&plaintext),
            scopes,
            created_at: now,
            expires_at: now + ttl,
            revoked_at: None,
        };
        let token = self.store.insert_token(token).await?;
        Ok((token, plaintext))
    }

    pub async fn revoke_pat(&self, principal: &Principal, token_id: Uuid, now: DateTime<Utc>) -> Result<(), Error> {
        self.require_role(principal, "*", Role::Admin).await?;
        Ok(self.store.revoke_token(token_id, now).await?)
    }

    /// SAML ACS: exchange an IdP assertion for a freshly issued PAT
    /// scoped to whatever role bindings the asserted subject already
    /// has.
    pub async fn saml_acs(&self, tenant_id: Uuid, raw_saml_response: &str, now: DateTime<Utc>) -> Result<(Token, String), Error> {
        let assertion = saml::parse_response(raw_saml_response)?;
        let bindings = self.store.find_role_bindings(tenant_id, &assertion.name_id).await?;
        let repos = self.store.list_repos_for_tenant(tenant_id).await?;
        let repo_keys: Vec<(Uuid, String)> = repos.into_iter().map(|r| (r.repo_id, r.repo_key)).collect();
        let scopes = af_auth::bindings_to_scopes(&bindings, &repo_keys);
        let plaintext = format!("pat_{}", Uuid::new_v4().simple());
        let token = Token {
            token_id: Uuid::new_v4(),
            tenant_id,
            subject: assertion.name_id,
            token_hash: af_crypto::hash_token(&plaintext),
            scopes,
            created_at: now,
            expires_at: now + chrono::Duration::hours(8),
            revoked_at: None,
        };
        let token = self.store.insert_token(token).await?;
        Ok((token, plaintext))
    }

    // -- uploads (C4) ---------------------------------------------------------

    pub async fn create_upload(
        &self,
        principal: &Principal,
        tenant_id: Uuid,
        repo_key: &str,
        req: CreateUploadRequest,
        now: DateTime<Utc>,
    ) -> Result<CreatedUpload, Error> {
        self.require_role(principal, repo_key, Role::Write).await?;
        let repo = self.find_repo_or_404(tenant_id, repo_key).await?;
        self.uploads.create(tenant_id, repo.repo_id, repo_key, &principal.subject, req, now).await
    }

    pub async fn presign_upload_part(
        &self,
        principal: &Principal,
        repo_key: &str,
        upload_id: Uuid,
        part_number: u32,
        ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        self.require_role(principal, repo_key, Role::Write).await?;
        self.uploads.presign_part(upload_id, part_number, ttl, now).await
    }

    pub async fn complete_upload(
        &self,
        principal: &Principal,
        repo_key: &str,
        upload_id: Uuid,
        parts: Vec<(u32, String)>,
        now: DateTime<Utc>,
    ) -> Result<UploadSession, Error> {
        self.require_role(principal, repo_key, Role::Write).await?;
        self.uploads.complete(upload_id, parts, now).await
    }

    pub async fn abort_upload(
        &self,
        principal: &Principal,
        repo_key: &str,
        upload_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<UploadSession, Error> {
        self.require_role(principal, repo_key, Role::Write).await?;
        self.uploads.abort(upload_id, reason, now).await
    }

    pub async fn commit_upload(
        &self,
        principal: &Principal,
        repo_key: &str,
        upload_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UploadSession, Error> {
        self.require_role(principal, repo_key, Role::Write).await?;
        self.uploads.commit(upload_id, now).await
    }

    /// Blob read gated by repo-scoped visibility and quarantine status
    /// (spec §4.6: a quarantined or rejected blob is unreadable through
    /// the repo that quarantined it, even with `Read`).
    pub async fn read_blob(
        &self,
        principal: &Principal,
        tenant_id: Uuid,
        repo_key: &str,
        digest: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<(Vec<u8>, u64)>, Error> {
        self.require_role(principal, repo_key, Role::Read).await?;
        let repo = self.find_repo_or_404(tenant_id, repo_key).await?;

        if !self.uploads.is_blob_visible_in_repo(repo.repo_id, digest).await? {
            return Err(Error::not_found(format!("blob {digest} not found in repo '{repo_key}'")));
        }
        if self.policy.is_blob_quarantined_in_repo(repo.repo_id, digest).await? {
            return Err(Error::quarantined_blob(format!("blob {digest} is quarantined in repo '{repo_key}'")));
        }

        self.uploads.read_blob(digest, range).await
    }

    // -- publish workflow (C5) -------------------------------------------------

    pub async fn create_draft(
        &self,
        principal: &Principal,
        tenant_id: Uuid,
        repo_key: &str,
        req: DraftRequest,
        now: DateTime<Utc>,
    ) -> Result<DraftOutcome, Error> {
        self.require_role(principal, repo_key, Role::Write).await?;
        let repo = self.find_repo_or_404(tenant_id, repo_key).await?;
        self.publish.create_draft(tenant_id, repo.repo_id, &principal.subject, req, now).await
    }

    pub async fn upsert_entries(
        &self,
        principal: &Principal,
        repo_key: &str,
        version_id: Uuid,
        entries: Vec<EntryRequest>,
    ) -> Result<Vec<af_types::ArtifactEntry>, Error> {
        self.require_role(principal, repo_key, Role::Write).await?;
        self.publish.upsert_entries(version_id, entries).await
    }

    pub async fn upsert_manifest(
        &self,
        principal: &Principal,
        repo_key: &str,
        version_id: Uuid,
        manifest_json: serde_json::Value,
    ) -> Result<Manifest, Error> {
        self.require_role(principal, repo_key, Role::Write).await?;
        self.publish.upsert_manifest(version_id, manifest_json).await
    }

    pub async fn get_manifest(
        &self,
        principal: &Principal,
        repo_key: &str,
        version_id: Uuid,
    ) -> Result<Option<Manifest>, Error> {
        self.require_role(principal, repo_key, Role::Read).await?;
        self.publish.get_manifest(version_id).await
    }

    pub async fn publish_version(
        &self,
        principal: &Principal,
        repo_key: &str,
        version_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome, Error> {
        self.require_role(principal, repo_key, Role::Promote).await?;
        self.publish.publish(version_id, &principal.subject, now).await
    }

    // -- policy / quarantine (C6) ----------------------------------------------

    pub async fn evaluate_policy(
        &self,
        principal: &Principal,
        tenant_id: Uuid,
        repo_key: &str,
        req: EvaluateRequest,
        now: DateTime<Utc>,
    ) -> Result<EvaluateOutcome, Error> {
        self.require_role(principal, repo_key, Role::Promote).await?;
        let repo = self.find_repo_or_404(tenant_id, repo_key).await?;
        self.policy.evaluate(tenant_id, repo.repo_id, repo_key, req, now).await
    }

    pub async fn list_quarantine(
        &self,
        principal: &Principal,
        tenant_id: Uuid,
        repo_key: &str,
        status: Option<QuarantineStatus>,
    ) -> Result<Vec<QuarantineItem>, Error> {
        self.require_role(principal, repo_key, Role::Read).await?;
        let repo = self.find_repo_or_404(tenant_id, repo_key).await?;
        self.policy.list_quarantine(repo.repo_id, status).await
    }

    pub async fn release_quarantine(
        &self,
        principal: &Principal,
        tenant_id: Uuid,
        repo_key: &str,
        quarantine_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<QuarantineItem, Error> {
        self.require_role(principal, repo_key, Role::Promote).await?;
        let repo = self.find_repo_or_404(tenant_id, repo_key).await?;
        self.policy.transition_quarantine(repo.repo_id, quarantine_id, QuarantineStatus::Released, &principal.subject, now).await
    }

    pub async fn reject_quarantine(
        &self,
        principal: &Principal,
        tenant_id: Uuid,
        repo_key: &str,
        quarantine_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<QuarantineItem, Error> {
        self.require_role(principal, repo_key, Role::Promote).await?;
        let repo = self.find_repo_or_404(tenant_id, repo_key).await?;
        self.policy.transition_quarantine(repo.repo_id, quarantine_id, QuarantineStatus::Rejected, &principal.subject, now).await
    }

    // -- lifecycle & GC (C8) ----------------------------------------------------

    pub async fn tombstone_version(
        &self,
        principal: &Principal,
        repo_key: &str,
        version_id: Uuid,
        req: TombstoneRequest,
        now: DateTime<Utc>,
    ) -> Result<af_types::Tombstone, Error> {
        self.require_role(principal, repo_key, Role::Promote).await?;
        self.lifecycle.tombstone(version_id, &principal.subject, req, now).await
    }

    pub async fn run_gc(
        &self,
        principal: &Principal,
        batch_size: u32,
        grace_hours: u32,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<GcReport, Error> {
        self.require_role(principal, "*", Role::Admin).await?;
        self.lifecycle.run_gc(now, batch_size, grace_hours, dry_run, &principal.subject).await
    }

    pub async fn reconcile(&self, principal: &Principal, sample_size: u32, now: DateTime<Utc>) -> Result<ReconcileReport, Error> {
        self.require_role(principal, "*", Role::Admin).await?;
        self.lifecycle.reconcile(now, sample_size).await
    }

    // -- outbox / search job sweeps (C7) -----------------------------------------

    /// Not gated by a principal: invoked by `af-service`'s background
    /// scheduler loop, never by an inbound HTTP request.
    pub async fn sweep_outbox(&self, now: DateTime<Utc>) -> anyhow::Result<ProducerSweepReport> {
        self.outbox.sweep_outbox(now).await
    }

    pub async fn sweep_search_jobs(&self, now: DateTime<Utc>) -> anyhow::Result<ConsumerSweepReport> {
        self.outbox.sweep_jobs(now).await
    }

    // -- audit, readiness, ops (C9) -----------------------------------------------

    pub async fn readiness(&self, now: DateTime<Utc>) -> ReadinessReport {
        self.audit.readiness(now).await
    }

    pub async fn ops_summary(&self, principal: &Principal, now: DateTime<Utc>) -> Result<OpsSummary, Error> {
        self.require_role(principal, "*", Role::Admin).await?;
        self.audit.ops_summary(now).await
    }

    pub async fn list_audit_records(
        &self,
        principal: &Principal,
        action: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<AuditRecord>, Error> {
        self.require_role(principal, "*", Role::Admin).await?;
        self.audit.list_audit_records(action, since, limit).await
    }

    /// Look up a version by id, for handlers that need it before
    /// dispatching to a component (e.g. resolving `repo_key` from a
    /// `version_id` path segment).
    pub async fn find_version(&self, version_id: Uuid) -> Result<Option<PackageVersion>, Error> {
        Ok(self.store.find_version(version_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_objectstore::InMemoryObjectStore;
    use af_store::InMemoryTruthStore;
    use af_types::AuthSource;

    fn core() -> ArtifortressCore {
        let store: Arc<dyn TruthStore> = Arc::new(InMemoryTruthStore::new());
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        ArtifortressCore::new(
            store,
            objects,
            AuthSettings { bootstrap_token: Some("test-boot-token".into()), oidc_issuer: None, oidc_audience: None, oidc_hs256_shared_secret: None, oidc_jwks_uri: None },
            chrono::Duration::hours(1),
            PolicyTimeoutConfig::default(),
            SweepConfig::default(),
        )
    }

    fn admin() -> Principal {
        Principal { subject: "bootstrap".into(), scopes: vec![RepoScope::wildcard(Role::Admin)], auth_source: AuthSource::Bootstrap }
    }

    #[tokio::test]
    async fn bootstrap_token_authenticates_as_admin() {
        let core = core();
        let principal = core.authenticate("test-boot-token", Utc::now(), &[]).await.unwrap();
        assert_eq!(principal.subject, "bootstrap");
        assert!(has_role(&principal.scopes, "anything", Role::Admin));
    }

    #[tokio::test]
    async fn create_repo_requires_admin_role() {
        let core = core();
        let reader = Principal { subject: "bob".into(), scopes: vec![RepoScope::new("demo", Role::Read)], auth_source: AuthSource::Pat };
        let err = core
            .create_repo(&reader, Uuid::nil(), "demo", RepoType::Local, None, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn full_publish_path_through_the_facade() {
        let core = core();
        let admin = admin();
        let now = Utc::now();

        let repo = core.create_repo(&admin, Uuid::nil(), "demo", RepoType::Local, None, vec![]).await.unwrap();
        assert_eq!(repo.repo_key, "demo");

        let created = core
            .create_upload(
                &admin,
                Uuid::nil(),
                "demo",
                CreateUploadRequest { expected_digest: "a".repeat(64), expected_length: 3 },
                now,
            )
            .await
            .unwrap();
        assert!(!created.deduped);

        // an unauthorized subject cannot even create a draft.
        let stranger = Principal { subject: "eve".into(), scopes: vec![], auth_source: AuthSource::Pat };
        let err = core
            .create_draft(
                &stranger,
                Uuid::nil(),
                "demo",
                DraftRequest { package_type: "npm".into(), package_namespace: "".into(), package_name: "x".into(), version: "1.0.0".into() },
                now,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn readiness_requires_no_principal() {
        let core = core();
        let report = core.readiness(Utc::now()).await;
        assert!(report.healthy);
    }

    #[tokio::test]
    async fn saml_acs_issues_token_scoped_to_repo_key_not_uuid() {
        let core = core();
        let admin = admin();
        let now = Utc::now();

        let repo = core.create_repo(&admin, Uuid::nil(), "demo", RepoType::Local, None, vec![]).await.unwrap();
        core.upsert_role_binding(
            &admin,
            "demo",
            RoleBinding {
                tenant_id: Uuid::nil(),
                repo_id: repo.repo_id,
                subject: "alice@example.com".into(),
                roles: [Role::Write].into_iter().collect(),
            },
        )
        .await
        .unwrap();

        use base64::Engine;
        let xml = r#"<saml2p:Response><saml2:Assertion><saml2:Subject><saml2:NameID>alice@example.com</saml2:NameID></saml2:Subject></saml2:Assertion></saml2p:Response>"#;
        let encoded = base64::engine::general_purpose::STANDARD.encode(xml.as_bytes());

        let (token, _plaintext) = core.saml_acs(Uuid::nil(), &encoded, now).await.unwrap();

        assert!(
            has_role(&token.scopes, "demo", Role::Write),
            "token scope must be keyed by repo_key 'demo', not the repo's UUID"
        );
    }
}
