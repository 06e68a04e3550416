//! # Policy & quarantine
//!
//! C6 — timeout-bounded policy evaluation (fail-closed) and the
//! quarantine lifecycle that gates blob reads (spec §4.6). Grounded on
//! `af-publish`'s single-transaction shape (evaluate → insert evaluation
//! row → maybe upsert quarantine → audit) and on `shipper-retry`'s
//! timeout-vs-deadline framing, generalized here to a policy engine call
//! instead of a network retry.

use af_error::Error;
use af_store::SharedTruthStore;
use af_types::{
    AuditRecord, DecisionSource, PolicyAction, PolicyDecision, PolicyEvaluation, QuarantineItem,
    QuarantineStatus,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Request shape for `POST /v1/repos/{key}/policy/evaluations` (spec §4.6).
#[derive(Debug, Clone)]
pub struct EvaluateRequest {
    pub version_id: Uuid,
    pub action: PolicyAction,
    pub reason: String,
    /// `decisionHint`: blank means "no hint", resolved to `(allow,
    /// default_allow)`.
    pub decision_hint: Option<PolicyDecision>,
    /// Test hook: `"simulate_timeout"` forces the fail-closed path
    /// regardless of the configured timeout (spec §4.6).
    pub engine_version: Option<String>,
}

/// How long the evaluation is allowed to take before it's treated as a
/// timeout (spec §4.6's hard bound).
#[derive(Debug, Clone, Copy)]
pub struct PolicyTimeoutConfig {
    pub timeout_ms: u64,
}

impl Default for PolicyTimeoutConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluateOutcome {
    pub evaluation_id: Uuid,
    pub decision: PolicyDecision,
    pub decision_source: DecisionSource,
    pub quarantine_id: Option<Uuid>,
}

/// C6's policy/quarantine engine, stateless apart from the shared truth
/// store handle (the actual evaluation "engine" is the hint parameter —
/// spec §4.6 scopes rule evaluation itself out of this workspace).
pub struct PolicyEngine {
    store: SharedTruthStore,
    timeout: PolicyTimeoutConfig,
}

impl PolicyEngine {
    pub fn new(store: SharedTruthStore, timeout: PolicyTimeoutConfig) -> Self {
        Self { store, timeout }
    }

    /// Evaluate `req` against `repo_id`, within `tenant_id`. Spec §4.6:
    /// a real engine call or the `simulate_timeout` test hook both take
    /// the fail-closed path — no evaluation row, no quarantine mutation,
    /// just a `503 policy_timeout` plus an audit record of the timeout
    /// itself.
    pub async fn evaluate(
        &self,
        tenant_id: Uuid,
        repo_id: Uuid,
        repo_key: &str,
        req: EvaluateRequest,
        now: DateTime<Utc>,
    ) -> Result<EvaluateOutcome, Error> {
        if req.reason.trim().is_empty() {
            return Err(Error::validation("reason must not be empty."));
        }

        let (decision, source) = match req.decision_hint {
            None => (PolicyDecision::Allow, DecisionSource::DefaultAllow),
            Some(PolicyDecision::Allow) => (PolicyDecision::Allow, DecisionSource::HintAllow),
            Some(PolicyDecision::Deny) => (PolicyDecision::Deny, DecisionSource::HintDeny),
            Some(PolicyDecision::Quarantine) => {
                (PolicyDecision::Quarantine, DecisionSource::HintQuarantine)
            }
        };

        if req.engine_version.as_deref() == Some("simulate_timeout")
            || self.engine_exceeds_timeout()
        {
            self.store
                .insert_audit_record(AuditRecord {
                    action: "policy.timeout".to_string(),
                    actor: "system".to_string(),
                    resource_type: "package_version".to_string(),
                    resource_id: req.version_id.to_string(),
                    details: serde_json::json!({
                        "repoKey": repo_key,
                        "versionId": req.version_id,
                        "action": action_str(req.action),
                        "timeoutMs": self.timeout.timeout_ms,
                    }),
                    occurred_at: now,
                })
                .await?;
            return Err(Error::policy_timeout(format!(
                "policy evaluation timed out: action={} timeoutMs={}",
                action_str(req.action),
                self.timeout.timeout_ms
            )));
        }

        let evaluation_id = Uuid::new_v4();
        self.store
            .insert_policy_evaluation(PolicyEvaluation {
                evaluation_id,
                version_id: req.version_id,
                action: req.action,
                decision,
                decision_source: source,
                reason: req.reason.clone(),
                engine_version: req.engine_version.clone(),
            })
            .await?;

        let quarantine_id = if matches!(decision, PolicyDecision::Quarantine) {
            let existing = self.store.find_quarantine_item(req.version_id).await?;
            let id = existing.as_ref().map(|q| q.quarantine_id).unwrap_or_else(Uuid::new_v4);
            self.store
                .insert_quarantine_item(QuarantineItem {
                    quarantine_id: id,
                    tenant_id,
                    repo_id,
                    version_id: req.version_id,
                    status: QuarantineStatus::Quarantined,
                })
                .await?;
            Some(id)
        } else {
            None
        };

        self.store
            .insert_audit_record(AuditRecord {
                action: "policy.evaluated".to_string(),
                actor: "system".to_string(),
                resource_type: "package_version".to_string(),
                resource_id: req.version_id.to_string(),
                details: serde_json::json!({
                    "repoKey": repo_key,
                    "versionId": req.version_id,
                    "action": action_str(req.action),
                    "decision": decision_str(decision),
                    "decisionSource": source_str(source),
                    "quarantineId": quarantine_id,
                }),
                occurred_at: now,
            })
            .await?;

        Ok(EvaluateOutcome { evaluation_id, decision, decision_source: source, quarantine_id })
    }

    /// Hook point for a real engine timeout check; the corpus has no
    /// external policy engine to call, so this is always `false` outside
    /// the `simulate_timeout` test path above.
    fn engine_exceeds_timeout(&self) -> bool {
        false
    }

    /// `true` iff `digest` is blocked for reads from `repo_id` (spec
    /// §4.6): some artifact entry of a version in this repo references
    /// the digest, and that version's quarantine status is
    /// `quarantined` or `rejected`. `released` does not block.
    pub async fn is_blob_quarantined_in_repo(&self, repo_id: Uuid, digest: &str) -> Result<bool, Error> {
        let versions = self.store.find_versions_referencing_blob_in_repo(repo_id, digest).await?;
        for v in versions {
            if let Some(item) = self.store.find_quarantine_item(v.version_id).await? {
                if matches!(item.status, QuarantineStatus::Quarantined | QuarantineStatus::Rejected) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub async fn list_quarantine(
        &self,
        repo_id: Uuid,
        status: Option<QuarantineStatus>,
    ) -> Result<Vec<QuarantineItem>, Error> {
        Ok(self.store.list_quarantine_items(repo_id, status).await?)
    }

    /// `release`/`reject`: repo-scoped transitions out of `quarantined`.
    /// A quarantine row not owned by `repo_id` is `Forbidden` rather
    /// than `NotFound`, to avoid leaking cross-repo quarantine IDs by
    /// letting a caller distinguish "doesn't exist" from "exists
    /// elsewhere" (spec §4.6).
    pub async fn transition_quarantine(
        &self,
        repo_id: Uuid,
        quarantine_id: Uuid,
        target: QuarantineStatus,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<QuarantineItem, Error> {
        let item = self
            .store
            .find_quarantine_item_by_id(quarantine_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("quarantine {quarantine_id} not found")))?;

        if item.repo_id != repo_id {
            return Err(Error::auth_z("quarantine item does not belong to this repo"));
        }
        if item.status != QuarantineStatus::Quarantined {
            return Err(Error::conflict(format!(
                "quarantine {quarantine_id} is {:?}, not quarantined",
                item.status
            )));
        }

        self.store.update_quarantine_status(quarantine_id, target).await?;

        self.store
            .insert_audit_record(AuditRecord {
                action: format!("quarantine.{}", status_action(target)),
                actor: actor.to_string(),
                resource_type: "quarantine_item".to_string(),
                resource_id: quarantine_id.to_string(),
                details: serde_json::json!({
                    "quarantineId": quarantine_id,
                    "versionId": item.version_id,
                    "status": decision_source_irrelevant(target),
                }),
                occurred_at: now,
            })
            .await?;

        Ok(QuarantineItem { status: target, ..item })
    }
}

fn action_str(a: PolicyAction) -> &'static str {
    match a {
        PolicyAction::Publish => "publish",
        PolicyAction::Promote => "promote",
    }
}

fn decision_str(d: PolicyDecision) -> &'static str {
    match d {
        PolicyDecision::Allow => "allow",
        PolicyDecision::Deny => "deny",
        PolicyDecision::Quarantine => "quarantine",
    }
}

fn source_str(s: DecisionSource) -> &'static str {
    match s {
        DecisionSource::HintAllow => "hint_allow",
        DecisionSource::HintDeny => "hint_deny",
        DecisionSource::HintQuarantine => "hint_quarantine",
        DecisionSource::DefaultAllow => "default_allow",
    }
}

fn status_action(s: QuarantineStatus) -> &'static str {
    match s {
        QuarantineStatus::Quarantined => "quarantined",
        QuarantineStatus::Released => "released",
        QuarantineStatus::Rejected => "rejected",
    }
}

fn decision_source_irrelevant(s: QuarantineStatus) -> &'static str {
    status_action(s)
}

/// Parse the `decisionHint` request field, per spec §4.6: blank is
/// `None` (default allow), anything else must be a known decision.
pub fn parse_decision_hint(raw: Option<&str>) -> Result<Option<PolicyDecision>, Error> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some("allow") => Ok(Some(PolicyDecision::Allow)),
        Some("deny") => Ok(Some(PolicyDecision::Deny)),
        Some("quarantine") => Ok(Some(PolicyDecision::Quarantine)),
        Some(other) => Err(Error::validation(format!("unknown decisionHint '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_store::InMemoryTruthStore;
    use std::sync::Arc;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(Arc::new(InMemoryTruthStore::new()), PolicyTimeoutConfig::default())
    }

    #[tokio::test]
    async fn blank_hint_defaults_to_allow() {
        let engine = engine();
        let outcome = engine
            .evaluate(
                Uuid::nil(),
                Uuid::nil(),
                "demo",
                EvaluateRequest {
                    version_id: Uuid::new_v4(),
                    action: PolicyAction::Publish,
                    reason: "looks fine".into(),
                    decision_hint: None,
                    engine_version: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.decision, PolicyDecision::Allow);
        assert_eq!(outcome.decision_source, DecisionSource::DefaultAllow);
        assert!(outcome.quarantine_id.is_none());
    }

    #[tokio::test]
    async fn quarantine_hint_upserts_quarantine_item() {
        let engine = engine();
        let version_id = Uuid::new_v4();
        let outcome = engine
            .evaluate(
                Uuid::nil(),
                Uuid::new_v4(),
                "demo",
                EvaluateRequest {
                    version_id,
                    action: PolicyAction::Publish,
                    reason: "suspicious".into(),
                    decision_hint: Some(PolicyDecision::Quarantine),
                    engine_version: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(outcome.quarantine_id.is_some());

        // repeating is idempotent: same version, same quarantine id
        let outcome2 = engine
            .evaluate(
                Uuid::nil(),
                Uuid::new_v4(),
                "demo",
                EvaluateRequest {
                    version_id,
                    action: PolicyAction::Publish,
                    reason: "still suspicious".into(),
                    decision_hint: Some(PolicyDecision::Quarantine),
                    engine_version: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.quarantine_id, outcome2.quarantine_id);
    }

    #[tokio::test]
    async fn simulate_timeout_fails_closed_without_writing_evaluation() {
        let engine = engine();
        let err = engine
            .evaluate(
                Uuid::nil(),
                Uuid::nil(),
                "demo",
                EvaluateRequest {
                    version_id: Uuid::new_v4(),
                    action: PolicyAction::Publish,
                    reason: "whatever".into(),
                    decision_hint: None,
                    engine_version: Some("simulate_timeout".into()),
                },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn empty_reason_is_rejected() {
        let engine = engine();
        let err = engine
            .evaluate(
                Uuid::nil(),
                Uuid::nil(),
                "demo",
                EvaluateRequest {
                    version_id: Uuid::new_v4(),
                    action: PolicyAction::Publish,
                    reason: "  ".into(),
                    decision_hint: None,
                    engine_version: None,
                },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn quarantine_transition_is_repo_scoped() {
        let engine = engine();
        let repo_a = Uuid::new_v4();
        let repo_b = Uuid::new_v4();
        let outcome = engine
            .evaluate(
                Uuid::nil(),
                repo_a,
                "a",
                EvaluateRequest {
                    version_id: Uuid::new_v4(),
                    action: PolicyAction::Publish,
                    reason: "x".into(),
                    decision_hint: Some(PolicyDecision::Quarantine),
                    engine_version: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let quarantine_id = outcome.quarantine_id.unwrap();

        let err = engine
            .transition_quarantine(repo_b, quarantine_id, QuarantineStatus::Released, "bob", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403, "cross-repo access must be Forbidden, not NotFound");

        let released = engine
            .transition_quarantine(repo_a, quarantine_id, QuarantineStatus::Released, "bob", Utc::now())
            .await
            .unwrap();
        assert_eq!(released.status, QuarantineStatus::Released);
    }

    #[tokio::test]
    async fn quarantine_transition_rejects_bad_source_state() {
        let engine = engine();
        let repo_id = Uuid::new_v4();
        let outcome = engine
            .evaluate(
                Uuid::nil(),
                repo_id,
                "a",
                EvaluateRequest {
                    version_id: Uuid::new_v4(),
                    action: PolicyAction::Publish,
                    reason: "x".into(),
                    decision_hint: Some(PolicyDecision::Quarantine),
                    engine_version: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let quarantine_id = outcome.quarantine_id.unwrap();
        engine
            .transition_quarantine(repo_id, quarantine_id, QuarantineStatus::Released, "bob", Utc::now())
            .await
            .unwrap();

        let err = engine
            .transition_quarantine(repo_id, quarantine_id, QuarantineStatus::Rejected, "bob", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn decision_hint_parsing() {
        assert_eq!(parse_decision_hint(None).unwrap(), None);
        assert_eq!(parse_decision_hint(Some("")).unwrap(), None);
        assert_eq!(parse_decision_hint(Some(" allow ")).unwrap(), Some(PolicyDecision::Allow));
        assert!(parse_decision_hint(Some("bogus")).is_err());
    }
}
