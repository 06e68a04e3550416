//! # Types
//!
//! Core domain types for Artifortress: the entities that make up the
//! truth store (§3 of the design spec) plus the small value types shared
//! across components (roles, scopes, principals).
//!
//! Nothing in this crate talks to a database or the network; it is pure
//! data plus the handful of parsing/validation rules that are cheap
//! enough to check in-process (digest shape, scope grammar, role
//! ordering). Anything that needs I/O or a transaction lives in
//! `af-store`, `af-objectstore`, or one of the component crates.
//!
//! ## Identity
//!
//! Identifiers that cross process boundaries are UUIDs (`Uuid`); rows
//! that only ever live inside the truth store may use a narrower type at
//! the storage layer, but nothing here assumes that.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A 64-character lowercase-hex SHA-256 digest.
pub type Digest = String;

/// Returns `true` iff `s` is exactly 64 lowercase hex characters.
pub fn is_valid_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `{tenant_id, slug}` — the top-level isolation boundary. Every entity
/// below carries a `tenant_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: Uuid,
    pub slug: String,
}

/// The three repository flavors from spec §3. `Virtual` repos aggregate
/// `member_repo_keys`; `Remote` repos proxy an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    Local,
    Remote,
    Virtual,
}

/// `{repo_id, tenant_id, repo_key, repo_type, upstream_url?, member_repo_keys[]}`.
///
/// Construction is validated by [`Repo::new`]; once built, the fields are
/// plain and callers may still mutate them directly (the truth store is
/// the actual enforcement point for persisted invariants), but `new`
/// exists so every code path constructing a fresh repo gets the same
/// checks spec §3 requires:
///
/// - `repo_key` is lowercase, trimmed, and must not contain `:`.
/// - `Remote` requires an absolute `upstream_url`.
/// - `Virtual` requires at least one distinct member key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub repo_id: Uuid,
    pub tenant_id: Uuid,
    pub repo_key: String,
    pub repo_type: RepoType,
    pub upstream_url: Option<String>,
    pub member_repo_keys: Vec<String>,
}

/// Errors raised while constructing or normalizing a [`Repo`], a
/// [`RepoScope`], or a package-version identity tuple. These are
/// in-process validation failures; callers map them to
/// `af_error::Error::Validation` at the component boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ValidationError {}

/// Lowercase + trim a repo key, rejecting `:` per spec §3.
pub fn normalize_repo_key(raw: &str) -> Result<String, ValidationError> {
    let key = raw.trim().to_lowercase();
    if key.is_empty() {
        return Err(ValidationError("repoKey must not be empty.".into()));
    }
    if key.contains(':') {
        return Err(ValidationError("repoKey cannot contain ':'.".into()));
    }
    Ok(key)
}

impl Repo {
    pub fn new(
        repo_id: Uuid,
        tenant_id: Uuid,
        repo_key: &str,
        repo_type: RepoType,
        upstream_url: Option<String>,
        member_repo_keys: Vec<String>,
    ) -> Result<Self, ValidationError> {
        let repo_key = normalize_repo_key(repo_key)?;

        match repo_type {
            RepoType::Remote => {
                let url = upstream_url
                    .as_deref()
                    .ok_or_else(|| ValidationError("remote repo requires upstream_url.".into()))?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ValidationError(
                        "remote repo upstream_url must be an absolute URI.".into(),
                    ));
                }
            }
            RepoType::Virtual => {
                let distinct: BTreeSet<&str> =
                    member_repo_keys.iter().map(|s| s.as_str()).collect();
                if distinct.is_empty() {
                    return Err(ValidationError(
                        "virtual repo requires at least one member.".into(),
                    ));
                }
            }
            RepoType::Local => {}
        }

        Ok(Self {
            repo_id,
            tenant_id,
            repo_key,
            repo_type,
            upstream_url,
            member_repo_keys,
        })
    }
}

/// `{tenant_id, repo_id, subject, roles}`, unique on `(tenant, repo, subject)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub tenant_id: Uuid,
    pub repo_id: Uuid,
    pub subject: String,
    pub roles: BTreeSet<Role>,
}

/// The four roles from spec §3. Ordering (`implies`) is defined
/// separately below rather than via `Ord`, since role implication is not
/// a total order (`promote` and `write` don't compare).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Read,
    Write,
    Admin,
    Promote,
}

impl Role {
    /// `true` iff holding `self` grants `required`. `admin` implies
    /// everything; `write` implies `read`; all other pairs are reflexive
    /// only (testable property 4 in spec §8).
    pub fn implies(self, required: Role) -> bool {
        if self == required {
            return true;
        }
        matches!((self, required), (Role::Admin, _) | (Role::Write, Role::Read))
    }

    fn as_str(self) -> &'static str {
        match self {
            Role::Read => "read",
            Role::Write => "write",
            Role::Admin => "admin",
            Role::Promote => "promote",
        }
    }

    fn from_str(s: &str) -> Option<Role> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Some(Role::Read),
            "write" => Some(Role::Write),
            "admin" => Some(Role::Admin),
            "promote" => Some(Role::Promote),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `(repo_key|"*", role)`, serialized as `repo:<key|*>:<role>` (spec §3,
/// GLOSSARY). `RepoScope::parse` and `Display` are exact inverses for any
/// value produced by this module (property 2 in spec §8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoScope {
    pub repo_key: String,
    pub role: Role,
}

impl RepoScope {
    pub fn new(repo_key: impl Into<String>, role: Role) -> Self {
        Self {
            repo_key: repo_key.into(),
            role,
        }
    }

    pub fn wildcard(role: Role) -> Self {
        Self {
            repo_key: "*".to_string(),
            role,
        }
    }

    /// Parse `repo:<key|*>:<role>`. Returns `None` (rather than an error)
    /// on malformed input, since callers treat invalid scopes as
    /// null-safe droppable entries (spec §4.3) rather than hard failures.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        if parts.next()? != "repo" {
            return None;
        }
        let key = parts.next()?;
        let role_str = parts.next()?;
        if parts.next().is_some() || key.is_empty() {
            return None;
        }
        let role = Role::from_str(role_str)?;
        let key = if key == "*" {
            "*".to_string()
        } else {
            normalize_repo_key(key).ok()?
        };
        Some(Self { repo_key: key, role })
    }

    /// `true` iff this scope's repo key matches `repo_key` (exact after
    /// normalization, or `*`). Matching is case-insensitive and trims
    /// whitespace on the input, per spec §4.3.
    pub fn matches_repo(&self, repo_key: &str) -> bool {
        self.repo_key == "*" || self.repo_key == repo_key.trim().to_lowercase()
    }
}

impl fmt::Display for RepoScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repo:{}:{}", self.repo_key, self.role)
    }
}

impl From<RepoScope> for String {
    fn from(s: RepoScope) -> String {
        s.to_string()
    }
}

impl TryFrom<String> for RepoScope {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        RepoScope::parse(&s).ok_or_else(|| ValidationError(format!("invalid scope: {s}")))
    }
}

/// `true` iff any scope in `scopes` grants `required_role` on `repo_key`
/// (spec §4.3). Monotone in `scopes` (property 3 in spec §8): adding a
/// scope can only add permissions, never remove them.
pub fn has_role(scopes: &[RepoScope], repo_key: &str, required_role: Role) -> bool {
    scopes
        .iter()
        .any(|s| s.matches_repo(repo_key) && s.role.implies(required_role))
}

/// Where a resolved [`Principal`] ultimately came from, in the bearer
/// resolution order of spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    Bootstrap,
    Pat,
    OidcHs256,
    OidcRs256,
    Saml,
}

/// The result of successful bearer validation (GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    pub scopes: Vec<RepoScope>,
    pub auth_source: AuthSource,
}

/// A personal access token row. The plaintext is never stored (invariant
/// 1); only `token_hash`, the lowercase-hex SHA-256 of the plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: Uuid,
    pub tenant_id: Uuid,
    pub subject: String,
    pub token_hash: String,
    pub scopes: Vec<RepoScope>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// Upload session lifecycle states (spec §4.4's state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Initiated,
    PartsUploading,
    PendingCommit,
    Committed,
    Aborted,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Committed | UploadState::Aborted)
    }
}

/// A multipart upload session (spec §3, §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: Uuid,
    pub tenant_id: Uuid,
    pub repo_id: Uuid,
    pub expected_digest: Digest,
    pub expected_length: u64,
    pub storage_upload_id: String,
    pub object_staging_key: String,
    pub state: UploadState,
    pub created_by_subject: String,
    pub expires_at: DateTime<Utc>,
    pub committed_blob_digest: Option<Digest>,
    pub deduped: bool,
}

impl UploadSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Canonical staging key for a fresh (non-deduped) upload session, per
/// spec §4.4: `staging/<tenant:N>/<repo_key>/<upload_id:N>`.
pub fn staging_key(tenant_id: Uuid, repo_key: &str, upload_id: Uuid) -> String {
    format!("staging/{tenant_id}/{repo_key}/{upload_id}")
}

/// A content-addressed blob (spec §3). A digest has exactly one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub digest: Digest,
    pub length_bytes: u64,
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
}

/// Package version lifecycle states (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    Draft,
    Published,
    Tombstoned,
}

/// A package version row. Identity is `(tenant, repo, type, namespace,
/// name, version)` after normalization (`normalize_version_identity`)
/// and must not change once `state == Published` (invariant 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersion {
    pub version_id: Uuid,
    pub tenant_id: Uuid,
    pub repo_id: Uuid,
    pub package_type: String,
    pub package_namespace: Option<String>,
    pub package_name: String,
    pub version: String,
    pub state: VersionState,
    pub created_by_subject: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// The identity tuple used to detect draft reuse / collisions (spec
/// §4.5): `type`/`name` lowercased and trimmed, `namespace` lowercased
/// when present, `version` trimmed (not lowercased — versions are
/// case-sensitive in most package ecosystems).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionIdentity {
    pub tenant_id: Uuid,
    pub repo_id: Uuid,
    pub package_type: String,
    pub package_namespace: Option<String>,
    pub package_name: String,
    pub version: String,
}

pub fn normalize_version_identity(
    tenant_id: Uuid,
    repo_id: Uuid,
    package_type: &str,
    package_namespace: Option<&str>,
    package_name: &str,
    version: &str,
) -> VersionIdentity {
    VersionIdentity {
        tenant_id,
        repo_id,
        package_type: package_type.trim().to_lowercase(),
        package_namespace: package_namespace.map(|n| n.trim().to_lowercase()),
        package_name: package_name.trim().to_lowercase(),
        version: version.trim().to_string(),
    }
}

/// One file within a [`PackageVersion`] (spec §3). `checksum_sha256`
/// always equals `blob_digest`; it is kept as a separate field because
/// that's the shape the data model names, but callers should treat it as
/// derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub version_id: Uuid,
    pub relative_path: String,
    pub blob_digest: Digest,
    pub size_bytes: u64,
}

impl ArtifactEntry {
    pub fn checksum_sha256(&self) -> &str {
        &self.blob_digest
    }
}

/// `{version_id, manifest_json, manifest_blob_digest?}` (spec §3, §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version_id: Uuid,
    pub manifest_json: serde_json::Value,
    pub manifest_blob_digest: Option<Digest>,
}

/// A durable side-effect record written alongside a truth-store mutation
/// in the same transaction (GLOSSARY). Currently the only `event_type` in
/// use is `version.published` (spec §4.5, §4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: Uuid,
    pub tenant_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload_json: serde_json::Value,
    pub available_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Search-indexing job status (spec §3, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Unique per `(tenant, version_id)` (invariant 4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchIndexJob {
    pub tenant_id: Uuid,
    pub version_id: Uuid,
    pub status: JobStatus,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A deferred-delete marker (spec §3, §4.8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub version_id: Uuid,
    pub reason: String,
    pub retention_until: DateTime<Utc>,
}

/// Quarantine lifecycle states (spec §3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStatus {
    Quarantined,
    Released,
    Rejected,
}

/// At most one per version (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineItem {
    pub quarantine_id: Uuid,
    pub tenant_id: Uuid,
    pub repo_id: Uuid,
    pub version_id: Uuid,
    pub status: QuarantineStatus,
}

/// Policy evaluation action / decision enums (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Publish,
    Promote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    Quarantine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    HintAllow,
    HintDeny,
    HintQuarantine,
    DefaultAllow,
}

/// Append-only evaluation record (spec §3, §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub evaluation_id: Uuid,
    pub version_id: Uuid,
    pub action: PolicyAction,
    pub decision: PolicyDecision,
    pub decision_source: DecisionSource,
    pub reason: String,
    pub engine_version: Option<String>,
}

/// Append-only audit record of a privileged action (spec §3, §4.9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: String,
    pub actor: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_validation() {
        assert!(is_valid_digest(&"a".repeat(64)));
        assert!(!is_valid_digest(&"a".repeat(63)));
        assert!(!is_valid_digest(&"A".repeat(64)));
        assert!(!is_valid_digest("not-hex-but-64-chars-long-000000000000000000000000000000000"));
    }

    #[test]
    fn repo_key_normalization() {
        assert_eq!(normalize_repo_key("  Foo-Bar  ").unwrap(), "foo-bar");
        assert!(normalize_repo_key("has:colon").is_err());
        assert!(normalize_repo_key("   ").is_err());
    }

    #[test]
    fn repo_remote_requires_absolute_url() {
        let err = Repo::new(
            Uuid::nil(),
            Uuid::nil(),
            "r",
            RepoType::Remote,
            Some("not-a-url".into()),
            vec![],
        )
        .unwrap_err();
        assert!(err.0.contains("absolute"));
    }

    #[test]
    fn repo_virtual_requires_member() {
        assert!(Repo::new(Uuid::nil(), Uuid::nil(), "r", RepoType::Virtual, None, vec![]).is_err());
        assert!(Repo::new(
            Uuid::nil(),
            Uuid::nil(),
            "r",
            RepoType::Virtual,
            None,
            vec!["a".into()]
        )
        .is_ok());
    }

    #[test]
    fn role_implication() {
        assert!(Role::Admin.implies(Role::Read));
        assert!(Role::Admin.implies(Role::Write));
        assert!(Role::Admin.implies(Role::Promote));
        assert!(Role::Write.implies(Role::Read));
        assert!(!Role::Read.implies(Role::Write));
        assert!(!Role::Promote.implies(Role::Write));
        for r in [Role::Read, Role::Write, Role::Admin, Role::Promote] {
            assert!(r.implies(r));
        }
    }

    #[test]
    fn scope_round_trip() {
        let s = RepoScope::new("my-repo", Role::Write);
        let text = s.to_string();
        assert_eq!(text, "repo:my-repo:write");
        assert_eq!(text.matches(':').count(), 2);
        assert_eq!(RepoScope::parse(&text).unwrap(), s);
    }

    #[test]
    fn scope_wildcard_matches_any_repo() {
        let s = RepoScope::wildcard(Role::Admin);
        assert!(s.matches_repo("anything"));
        assert!(s.matches_repo("  Whitespace  "));
    }

    #[test]
    fn scope_parse_rejects_malformed() {
        assert!(RepoScope::parse("not-a-scope").is_none());
        assert!(RepoScope::parse("repo:key:unknown-role").is_none());
        assert!(RepoScope::parse("repo::write").is_none());
        assert!(RepoScope::parse("repo:key:write:extra").is_none());
    }

    #[test]
    fn has_role_is_monotone() {
        let repo = "demo";
        let base = vec![RepoScope::new(repo, Role::Read)];
        assert!(has_role(&base, repo, Role::Read));
        assert!(!has_role(&base, repo, Role::Write));

        let mut extended = base.clone();
        extended.push(RepoScope::new(repo, Role::Write));
        // adding a scope never removes a previously-granted permission
        assert!(has_role(&extended, repo, Role::Read));
        assert!(has_role(&extended, repo, Role::Write));
    }

    #[test]
    fn token_activity() {
        let now = Utc::now();
        let mut t = Token {
            token_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            subject: "s".into(),
            token_hash: "h".into(),
            scopes: vec![],
            created_at: now - chrono::Duration::hours(1),
            expires_at: now + chrono::Duration::hours(1),
            revoked_at: None,
        };
        assert!(t.is_active(now));
        t.revoked_at = Some(now);
        assert!(!t.is_active(now));
    }

    #[test]
    fn staging_key_is_canonical() {
        let tenant = Uuid::nil();
        let upload = Uuid::nil();
        let key = staging_key(tenant, "my-repo", upload);
        assert_eq!(
            key,
            format!("staging/{tenant}/my-repo/{upload}")
        );
    }

    #[test]
    fn version_identity_normalizes_type_and_name_not_version() {
        let id = normalize_version_identity(
            Uuid::nil(),
            Uuid::nil(),
            "NuGet",
            Some("MyOrg"),
            "MyPackage",
            "1.0.0-RC1",
        );
        assert_eq!(id.package_type, "nuget");
        assert_eq!(id.package_namespace, Some("myorg".to_string()));
        assert_eq!(id.package_name, "mypackage");
        assert_eq!(id.version, "1.0.0-RC1");
    }
}
