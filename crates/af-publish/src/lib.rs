//! # Publish
//!
//! C5 — the draft-to-publish workflow: spec §4.5's `draft -> published`
//! state transition with exactly-once outbox emission, plus entry and
//! manifest management while a version is still mutable.
//!
//! The identity tuple (tenant, repo, package type, namespace, name,
//! version) is the dedupe/draft-reuse key; `af-types::normalize_version_identity`
//! is the single place that defines how that tuple is canonicalized, and
//! this crate is the only caller of it outside `af-store`'s tests.

use std::sync::Arc;

use af_error::Error;
use af_store::TruthStore;
use af_types::{
    normalize_version_identity, ArtifactEntry, AuditRecord, Manifest, OutboxEvent, PackageVersion,
    VersionState,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DraftRequest {
    pub package_type: String,
    pub package_namespace: String,
    pub package_name: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct DraftOutcome {
    pub version: PackageVersion,
    pub reused_draft: bool,
}

#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub relative_path: String,
    pub blob_digest: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub version: PackageVersion,
    pub idempotent: bool,
    pub event_emitted: bool,
}

pub struct PublishWorkflow {
    store: Arc<dyn TruthStore>,
}

impl PublishWorkflow {
    pub fn new(store: Arc<dyn TruthStore>) -> Self {
        Self { store }
    }

    /// Spec §4.5 draft create: idempotent on the identity tuple. A
    /// matching draft is returned as-is; a matching published or
    /// tombstoned version is a conflict (versions are immutable once
    /// published).
    pub async fn create_draft(
        &self,
        tenant_id: Uuid,
        repo_id: Uuid,
        subject: &str,
        req: DraftRequest,
        now: DateTime<Utc>,
    ) -> Result<DraftOutcome, Error> {
        if req.package_type.trim().is_empty() {
            return Err(Error::validation("packageType must not be blank."));
        }
        if req.package_name.trim().is_empty() {
            return Err(Error::validation("packageName must not be blank."));
        }
        if req.version.trim().is_empty() {
            return Err(Error::validation("version must not be blank."));
        }

        let identity = normalize_version_identity(
            tenant_id,
            repo_id,
            &req.package_type,
            &req.package_namespace,
            &req.package_name,
            &req.version,
        );

        if let Some(existing) = self.store.find_version_by_identity(&identity).await? {
            return match existing.state {
                VersionState::Draft => Ok(DraftOutcome { version: existing, reused_draft: true }),
                VersionState::Published | VersionState::Tombstoned => Err(Error::conflict(format!(
                    "version {} {} already exists in state {:?}",
                    req.package_name, req.version, existing.state
                ))),
            };
        }

        let version = PackageVersion {
            version_id: Uuid::new_v4(),
            tenant_id,
            repo_id,
            package_type: req.package_type.trim().to_lowercase(),
            package_namespace: req.package_namespace.trim().to_lowercase(),
            package_name: req.package_name.trim().to_lowercase(),
            version: req.version.trim().to_string(),
            state: VersionState::Draft,
            created_by_subject: subject.to_string(),
            published_at: None,
        };
        let version = self.store.insert_draft_version(version).await?;
        Ok(DraftOutcome { version, reused_draft: false })
    }

    async fn load_draft(&self, version_id: Uuid) -> Result<PackageVersion, Error> {
        let version = self
            .store
            .find_version(version_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("version {version_id} not found")))?;
        if version.state != VersionState::Draft {
            return Err(Error::conflict(format!("version {version_id} is not a draft")));
        }
        Ok(version)
    }

    /// Spec §4.5 entries: each `relativePath` must be non-blank and
    /// unique within the request, and `blobDigest` must reference an
    /// already-committed blob.
    pub async fn upsert_entries(&self, version_id: Uuid, entries: Vec<EntryRequest>) -> Result<Vec<ArtifactEntry>, Error> {
        self.load_draft(version_id).await?;

        if entries.is_empty() {
            return Err(Error::validation("entries must not be empty."));
        }

        let mut seen_paths = std::collections::HashSet::new();
        for entry in &entries {
            if entry.relative_path.trim().is_empty() {
                return Err(Error::validation("relativePath must not be blank."));
            }
            if !seen_paths.insert(entry.relative_path.clone()) {
                return Err(Error::validation(format!("Duplicate relativePath '{}' in request.", entry.relative_path)));
            }
        }

        let mut saved = Vec::with_capacity(entries.len());
        for entry in entries {
            let blob = self
                .store
                .find_blob(&entry.blob_digest)
                .await?
                .ok_or_else(|| Error::validation(format!("blob {} does not exist", entry.blob_digest)))?;
            if entry.size_bytes != blob.length_bytes {
                return Err(Error::validation(format!(
                    "sizeBytes {} does not match blob {}'s length {}",
                    entry.size_bytes, entry.blob_digest, blob.length_bytes
                )));
            }

            let record = ArtifactEntry {
                version_id,
                relative_path: entry.relative_path,
                blob_digest: entry.blob_digest,
                size_bytes: blob.length_bytes,
            };
            self.store.upsert_artifact_entry(record.clone()).await?;
            saved.push(record);
        }
        Ok(saved)
    }

    pub async fn list_entries(&self, version_id: Uuid) -> Result<Vec<ArtifactEntry>, Error> {
        Ok(self.store.find_artifact_entries(version_id).await?)
    }

    /// Spec §4.5 manifest: per-`packageType` shape checks live here
    /// rather than in `af-types`, since they're workflow policy, not
    /// wire-format invariants.
    pub async fn upsert_manifest(&self, version_id: Uuid, manifest_json: serde_json::Value) -> Result<Manifest, Error> {
        let version = self.load_draft(version_id).await?;
        validate_manifest_shape(&version.package_type, &manifest_json)?;

        let serialized = serde_json::to_vec(&manifest_json)
            .map_err(|e| Error::validation(format!("manifest is not serializable: {e}")))?;
        let digest = af_crypto_digest(&serialized);

        let manifest = Manifest { version_id, manifest_json, manifest_blob_digest: digest };
        self.store.upsert_manifest(manifest.clone()).await?;
        Ok(manifest)
    }

    pub async fn get_manifest(&self, version_id: Uuid) -> Result<Option<Manifest>, Error> {
        Ok(self.store.find_manifest(version_id).await?)
    }

    /// Spec §4.5 publish: atomic Draft -> Published transition plus
    /// exactly-once outbox emission. Re-publishing an already-published
    /// version is a no-op that signals `idempotent: true` and does not
    /// re-emit the event.
    pub async fn publish(&self, version_id: Uuid, subject: &str, now: DateTime<Utc>) -> Result<PublishOutcome, Error> {
        let version = self
            .store
            .find_version(version_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("version {version_id} not found")))?;

        if version.state == VersionState::Published {
            return Ok(PublishOutcome { version, idempotent: true, event_emitted: false });
        }
        if version.state == VersionState::Tombstoned {
            return Err(Error::conflict(format!("version {version_id} is tombstoned")));
        }

        let entries = self.store.find_artifact_entries(version_id).await?;
        if entries.is_empty() {
            return Err(Error::conflict("version has no entries; cannot publish an empty package"));
        }
        if self.store.find_manifest(version_id).await?.is_none() {
            return Err(Error::conflict("version has no manifest; cannot publish"));
        }

        let event = OutboxEvent {
            event_id: Uuid::new_v4(),
            tenant_id: version.tenant_id,
            aggregate_type: "package_version".to_string(),
            aggregate_id: version_id.to_string(),
            event_type: "version.published".to_string(),
            payload_json: serde_json::json!({
                "versionId": version_id,
                "repoId": version.repo_id,
                "packageType": version.package_type,
                "packageName": version.package_name,
                "version": version.version,
            }),
            available_at: now,
            occurred_at: now,
            delivered_at: None,
        };
        let audit = AuditRecord {
            action: "version.published".to_string(),
            actor: subject.to_string(),
            resource_type: "package_version".to_string(),
            resource_id: version_id.to_string(),
            details: serde_json::json!({ "packageName": version.package_name, "version": version.version }),
            occurred_at: now,
        };

        let transitioned = self.store.publish_version_transactionally(version_id, event, audit).await?;
        let published = self
            .store
            .find_version(version_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("version {version_id} not found")))?;

        if transitioned {
            Ok(PublishOutcome { version: published, idempotent: false, event_emitted: true })
        } else {
            // Lost a race against a concurrent publish; surface the same
            // idempotent shape the caller would have seen had it observed
            // the already-published state up front.
            Ok(PublishOutcome { version: published, idempotent: true, event_emitted: false })
        }
    }
}

fn validate_manifest_shape(package_type: &str, manifest: &serde_json::Value) -> Result<(), Error> {
    let obj = manifest
        .as_object()
        .ok_or_else(|| Error::validation("manifest must be a JSON object."))?;

    match package_type {
        "nuget" => {
            require_string_field(obj, "id")?;
            require_string_field(obj, "version")?;
        }
        "npm" => {
            require_string_field(obj, "name")?;
            require_string_field(obj, "version")?;
        }
        "maven" => {
            require_string_field(obj, "groupId")?;
            require_string_field(obj, "artifactId")?;
            require_string_field(obj, "version")?;
        }
        _ => {}
    }
    Ok(())
}

fn require_string_field(obj: &serde_json::Map<String, serde_json::Value>, field: &str) -> Result<(), Error> {
    match obj.get(field).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(Error::validation(format!("manifest.{field} is required for this package type."))),
    }
}

fn af_crypto_digest(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_store::InMemoryTruthStore;
    use af_types::Blob;

    fn workflow() -> Arc<InMemoryTruthStore> {
        Arc::new(InMemoryTruthStore::new())
    }

    #[tokio::test]
    async fn create_draft_is_idempotent_on_identity() {
        let store = workflow();
        let wf = PublishWorkflow::new(store.clone());
        let now = Utc::now();
        let req = DraftRequest {
            package_type: "npm".into(),
            package_namespace: "".into(),
            package_name: "left-pad".into(),
            version: "1.0.0".into(),
        };

        let first = wf.create_draft(Uuid::nil(), Uuid::nil(), "alice", req.clone(), now).await.unwrap();
        assert!(!first.reused_draft);

        let second = wf.create_draft(Uuid::nil(), Uuid::nil(), "alice", req, now).await.unwrap();
        assert!(second.reused_draft);
        assert_eq!(second.version.version_id, first.version.version_id);
    }

    #[tokio::test]
    async fn create_draft_conflicts_with_published_version() {
        let store = workflow();
        let wf = PublishWorkflow::new(store.clone());
        let now = Utc::now();
        let req = DraftRequest {
            package_type: "npm".into(),
            package_namespace: "".into(),
            package_name: "left-pad".into(),
            version: "1.0.0".into(),
        };
        let draft = wf.create_draft(Uuid::nil(), Uuid::nil(), "alice", req.clone(), now).await.unwrap();

        store
            .insert_blob_if_absent(Blob { digest: "a".repeat(64), length_bytes: 3, storage_key: "blobs/a".into(), created_at: now })
            .await
            .unwrap();
        wf.upsert_entries(
            draft.version.version_id,
            vec![EntryRequest { relative_path: "index.js".into(), blob_digest: "a".repeat(64), size_bytes: 3 }],
        )
        .await
        .unwrap();
        wf.upsert_manifest(draft.version.version_id, serde_json::json!({ "name": "left-pad", "version": "1.0.0" }))
            .await
            .unwrap();
        wf.publish(draft.version.version_id, "alice", now).await.unwrap();

        let err = wf.create_draft(Uuid::nil(), Uuid::nil(), "alice", req, now).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn publish_requires_entries_and_manifest() {
        let store = workflow();
        let wf = PublishWorkflow::new(store.clone());
        let now = Utc::now();
        let draft = wf
            .create_draft(
                Uuid::nil(),
                Uuid::nil(),
                "alice",
                DraftRequest { package_type: "npm".into(), package_namespace: "".into(), package_name: "x".into(), version: "1.0.0".into() },
                now,
            )
            .await
            .unwrap();

        let err = wf.publish(draft.version.version_id, "alice", now).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn publish_twice_is_idempotent_without_second_event() {
        let store = workflow();
        let wf = PublishWorkflow::new(store.clone());
        let now = Utc::now();
        let draft = wf
            .create_draft(
                Uuid::nil(),
                Uuid::nil(),
                "alice",
                DraftRequest { package_type: "npm".into(), package_namespace: "".into(), package_name: "x".into(), version: "1.0.0".into() },
                now,
            )
            .await
            .unwrap();

        store
            .insert_blob_if_absent(Blob { digest: "b".repeat(64), length_bytes: 1, storage_key: "blobs/b".into(), created_at: now })
            .await
            .unwrap();
        wf.upsert_entries(
            draft.version.version_id,
            vec![EntryRequest { relative_path: "index.js".into(), blob_digest: "b".repeat(64), size_bytes: 1 }],
        )
        .await
        .unwrap();
        wf.upsert_manifest(draft.version.version_id, serde_json::json!({ "name": "x", "version": "1.0.0" }))
            .await
            .unwrap();

        let first = wf.publish(draft.version.version_id, "alice", now).await.unwrap();
        assert!(!first.idempotent);
        assert!(first.event_emitted);

        let second = wf.publish(draft.version.version_id, "alice", now).await.unwrap();
        assert!(second.idempotent);
        assert!(!second.event_emitted);
    }

    #[tokio::test]
    async fn manifest_shape_requires_nuget_fields() {
        let store = workflow();
        let wf = PublishWorkflow::new(store.clone());
        let now = Utc::now();
        let draft = wf
            .create_draft(
                Uuid::nil(),
                Uuid::nil(),
                "alice",
                DraftRequest { package_type: "nuget".into(), package_namespace: "".into(), package_name: "x".into(), version: "1.0.0".into() },
                now,
            )
            .await
            .unwrap();

        let err = wf.upsert_manifest(draft.version.version_id, serde_json::json!({ "id": "x" })).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn entries_reject_duplicate_relative_path_in_request() {
        let store = workflow();
        let wf = PublishWorkflow::new(store.clone());
        let now = Utc::now();
        let draft = wf
            .create_draft(
                Uuid::nil(),
                Uuid::nil(),
                "alice",
                DraftRequest { package_type: "npm".into(), package_namespace: "".into(), package_name: "x".into(), version: "1.0.0".into() },
                now,
            )
            .await
            .unwrap();

        store
            .insert_blob_if_absent(Blob { digest: "d".repeat(64), length_bytes: 1, storage_key: "blobs/d".into(), created_at: now })
            .await
            .unwrap();

        let err = wf
            .upsert_entries(
                draft.version.version_id,
                vec![
                    EntryRequest { relative_path: "a.txt".into(), blob_digest: "d".repeat(64), size_bytes: 1 },
                    EntryRequest { relative_path: "a.txt".into(), blob_digest: "d".repeat(64), size_bytes: 1 },
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn entries_reject_size_mismatch_against_blob() {
        let store = workflow();
        let wf = PublishWorkflow::new(store.clone());
        let now = Utc::now();
        let draft = wf
            .create_draft(
                Uuid::nil(),
                Uuid::nil(),
                "alice",
                DraftRequest { package_type: "npm".into(), package_namespace: "".into(), package_name: "x".into(), version: "1.0.0".into() },
                now,
            )
            .await
            .unwrap();
        store
            .insert_blob_if_absent(Blob { digest: "f".repeat(64), length_bytes: 3, storage_key: "blobs/f".into(), created_at: now })
            .await
            .unwrap();

        let err = wf
            .upsert_entries(
                draft.version.version_id,
                vec![EntryRequest { relative_path: "a.txt".into(), blob_digest: "f".repeat(64), size_bytes: 999 }],
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn entries_cannot_be_mutated_once_published() {
        let store = workflow();
        let wf = PublishWorkflow::new(store.clone());
        let now = Utc::now();
        let draft = wf
            .create_draft(
                Uuid::nil(),
                Uuid::nil(),
                "alice",
                DraftRequest { package_type: "npm".into(), package_namespace: "".into(), package_name: "x".into(), version: "1.0.0".into() },
                now,
            )
            .await
            .unwrap();
        store
            .insert_blob_if_absent(Blob { digest: "e".repeat(64), length_bytes: 1, storage_key: "blobs/e".into(), created_at: now })
            .await
            .unwrap();
        wf.upsert_entries(
            draft.version.version_id,
            vec![EntryRequest { relative_path: "a.txt".into(), blob_digest: "e".repeat(64), size_bytes: 1 }],
        )
        .await
        .unwrap();
        wf.upsert_manifest(draft.version.version_id, serde_json::json!({ "name": "x", "version": "1.0.0" }))
            .await
            .unwrap();
        wf.publish(draft.version.version_id, "alice", now).await.unwrap();

        let err = wf
            .upsert_entries(
                draft.version.version_id,
                vec![EntryRequest { relative_path: "b.txt".into(), blob_digest: "e".repeat(64), size_bytes: 1 }],
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }
}
