//! # Uploads
//!
//! C4 — the multipart upload session engine: spec §4.4's state machine
//! (`initiated -> parts_uploading -> pending_commit -> committed`, with
//! `aborted` reachable from any non-terminal state), digest+length
//! verification on commit, and dedupe-on-commit against an existing
//! [`af_types::Blob`].
//!
//! Grounded on `af-store`'s `TruthStore::transition_upload_session`
//! (the claim-style compare-and-swap) and `af-objectstore`'s multipart
//! trait; this crate is the glue that enforces the *order* those calls
//! must happen in, the way `shipper-storage`'s backend selection enforces
//! which calls are legal once a backend is chosen.

use std::sync::Arc;

use af_error::Error;
use af_objectstore::{ByteRange, ObjectStore, PartETag};
use af_store::TruthStore;
use af_types::{is_valid_digest, staging_key, AuditRecord, Blob, UploadSession, UploadState};
use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha256};
use uuid::Uuid;

/// `POST …/repos/{key}/uploads` request (spec §4.4).
#[derive(Debug, Clone)]
pub struct CreateUploadRequest {
    pub expected_digest: String,
    pub expected_length: u64,
}

#[derive(Debug, Clone)]
pub struct CreatedUpload {
    pub session: UploadSession,
    pub deduped: bool,
}

pub struct UploadEngine {
    store: Arc<dyn TruthStore>,
    objects: Arc<dyn ObjectStore>,
    session_ttl: chrono::Duration,
}

impl UploadEngine {
    pub fn new(store: Arc<dyn TruthStore>, objects: Arc<dyn ObjectStore>, session_ttl: chrono::Duration) -> Self {
        Self { store, objects, session_ttl }
    }

    /// Spec §4.4 create: validate shape, dedupe against an existing
    /// blob of the same `(digest, length)`, or start a fresh multipart
    /// upload.
    pub async fn create(
        &self,
        tenant_id: Uuid,
        repo_id: Uuid,
        repo_key: &str,
        subject: &str,
        req: CreateUploadRequest,
        now: DateTime<Utc>,
    ) -> Result<CreatedUpload, Error> {
        if !is_valid_digest(&req.expected_digest) {
            return Err(Error::validation(
                "expectedDigest must be a 64-character lowercase hex SHA-256 digest.",
            ));
        }
        if req.expected_length == 0 {
            return Err(Error::validation("expectedLength must be at least 1."));
        }

        let upload_id = Uuid::new_v4();

        if let Some(existing) = self.store.find_blob(&req.expected_digest).await? {
            if existing.length_bytes == req.expected_length {
                let session = UploadSession {
                    upload_id,
                    tenant_id,
                    repo_id,
                    expected_digest: req.expected_digest.clone(),
                    expected_length: req.expected_length,
                    storage_upload_id: String::new(),
                    object_staging_key: String::new(),
                    state: UploadState::Committed,
                    created_by_subject: subject.to_string(),
                    expires_at: now + self.session_ttl,
                    committed_blob_digest: Some(existing.digest.clone()),
                    deduped: true,
                };
                let session = self.store.insert_upload_session(session).await?;
                self.store
                    .insert_audit_record(AuditRecord {
                        action: "upload.deduped".to_string(),
                        actor: subject.to_string(),
                        resource_type: "upload_session".to_string(),
                        resource_id: upload_id.to_string(),
                        details: serde_json::json!({ "repoKey": repo_key, "digest": existing.digest }),
                        occurred_at: now,
                    })
                    .await?;
                return Ok(CreatedUpload { session, deduped: true });
            }
        }

        let staging_key = staging_key(tenant_id, repo_key, upload_id);
        let storage_upload_id = match self.objects.start_multipart(&staging_key).await {
            Ok(id) => id,
            Err(e) => return Err(Error::dependency_unavailable(format!("object store start_multipart failed: {e}"))),
        };

        let session = UploadSession {
            upload_id,
            tenant_id,
            repo_id,
            expected_digest: req.expected_digest,
            expected_length: req.expected_length,
            storage_upload_id,
            object_staging_key: staging_key,
            state: UploadState::Initiated,
            created_by_subject: subject.to_string(),
            expires_at: now + self.session_ttl,
            committed_blob_digest: None,
            deduped: false,
        };
        let session = self.store.insert_upload_session(session).await?;
        Ok(CreatedUpload { session, deduped: false })
    }

    async fn load_live_session(&self, upload_id: Uuid, now: DateTime<Utc>) -> Result<UploadSession, Error> {
        let session = self
            .store
            .find_upload_session(upload_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("upload {upload_id} not found")))?;
        if session.is_expired(now) && !session.state.is_terminal() {
            return Err(Error::conflict("upload session has expired"));
        }
        Ok(session)
    }

    /// Spec §4.4 presign-part: legal from `initiated` or
    /// `parts_uploading`; transitions to `parts_uploading`.
    pub async fn presign_part(
        &self,
        upload_id: Uuid,
        part_number: u32,
        ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        if part_number == 0 {
            return Err(Error::validation("partNumber must be positive."));
        }
        let session = self.load_live_session(upload_id, now).await?;
        match session.state {
            UploadState::Initiated | UploadState::PartsUploading => {}
            _ => return Err(Error::conflict(format!("upload {upload_id} is not accepting parts"))),
        }

        if session.state == UploadState::Initiated {
            self.store
                .transition_upload_session(upload_id, UploadState::Initiated, UploadState::PartsUploading)
                .await?;
        }

        self.objects
            .presign_part(&session.object_staging_key, &session.storage_upload_id, part_number, ttl, now)
            .map_err(|e| Error::dependency_unavailable(format!("presign failed: {e}")))
    }

    /// Spec §4.4 complete: parts must be non-empty, unique, ascending,
    /// positive part numbers with non-blank ETags (outer quotes
    /// stripped).
    pub async fn complete(
        &self,
        upload_id: Uuid,
        parts: Vec<(u32, String)>,
        now: DateTime<Utc>,
    ) -> Result<UploadSession, Error> {
        let session = self.load_live_session(upload_id, now).await?;
        if session.state != UploadState::PartsUploading {
            return Err(Error::conflict(format!("upload {upload_id} is not in parts_uploading state")));
        }
        if parts.is_empty() {
            return Err(Error::validation("parts must not be empty."));
        }

        let mut seen = std::collections::HashSet::new();
        let mut prev = 0u32;
        let mut etags = Vec::with_capacity(parts.len());
        for (number, etag) in parts {
            if number == 0 {
                return Err(Error::validation("partNumber must be positive."));
            }
            if !seen.insert(number) {
                return Err(Error::validation(format!("Duplicate partNumber '{number}' is not allowed.")));
            }
            if number <= prev && prev != 0 {
                return Err(Error::validation("part numbers must be strictly ascending."));
            }
            prev = number;
            let cleaned = etag.trim().trim_matches('"');
            if cleaned.is_empty() {
                return Err(Error::validation("part etag must not be blank."));
            }
            etags.push(PartETag { part_number: number, etag: cleaned.to_string() });
        }

        self.objects
            .complete_multipart(&session.object_staging_key, &session.storage_upload_id, &etags)
            .await
            .map_err(|e| Error::dependency_unavailable(format!("complete_multipart failed: {e}")))?;

        self.store
            .transition_upload_session(upload_id, UploadState::PartsUploading, UploadState::PendingCommit)
            .await?;

        self.load_live_session(upload_id, now).await
    }

    /// Spec §4.4 abort: best-effort object-store abort, then terminal
    /// transition regardless of current (non-terminal) state.
    pub async fn abort(&self, upload_id: Uuid, reason: Option<String>, now: DateTime<Utc>) -> Result<UploadSession, Error> {
        let session = self.load_live_session(upload_id, now).await?;
        if session.state.is_terminal() {
            return Err(Error::conflict(format!("upload {upload_id} is already {:?}", session.state)));
        }

        let reason = reason.filter(|r| !r.trim().is_empty()).unwrap_or_else(|| "client_abort".to_string());

        if let Err(e) = self.objects.abort_multipart(&session.object_staging_key, &session.storage_upload_id).await {
            tracing::warn!(upload_id = %upload_id, error = %e, "best-effort abort_multipart failed");
        }

        self.store.transition_upload_session(upload_id, session.state, UploadState::Aborted).await?;
        self.store
            .insert_audit_record(AuditRecord {
                action: "upload.aborted".to_string(),
                actor: session.created_by_subject.clone(),
                resource_type: "upload_session".to_string(),
                resource_id: upload_id.to_string(),
                details: serde_json::json!({ "reason": reason }),
                occurred_at: now,
            })
            .await?;

        self.load_live_session(upload_id, now).await
    }

    /// Spec §4.4 commit: stream the staging object, verify digest+
    /// length, and on match upsert the `Blob` row atomically with the
    /// session's `committed` transition.
    pub async fn commit(&self, upload_id: Uuid, now: DateTime<Utc>) -> Result<UploadSession, Error> {
        let session = self.load_live_session(upload_id, now).await?;
        if session.state != UploadState::PendingCommit {
            return Err(Error::conflict(format!("upload {upload_id} is not in pending_commit state")));
        }

        let bytes = self
            .objects
            .get(&session.object_staging_key, None)
            .await
            .map_err(|e| Error::dependency_unavailable(format!("staging read failed: {e}")))?
            .ok_or_else(|| Error::dependency_unavailable("staging object missing at commit time"))?;

        let streamed_digest = hex::encode(Sha256::digest(&bytes));
        let streamed_length = bytes.len() as u64;

        if streamed_digest != session.expected_digest || streamed_length != session.expected_length {
            self.store.transition_upload_session(upload_id, UploadState::PendingCommit, UploadState::Aborted).await?;
            if let Err(e) = self.objects.abort_multipart(&session.object_staging_key, &session.storage_upload_id).await {
                tracing::warn!(upload_id = %upload_id, error = %e, "best-effort abort after verification failure");
            }
            self.store
                .insert_audit_record(AuditRecord {
                    action: "upload.commit.verification_failed".to_string(),
                    actor: session.created_by_subject.clone(),
                    resource_type: "upload_session".to_string(),
                    resource_id: upload_id.to_string(),
                    details: serde_json::json!({
                        "expectedDigest": session.expected_digest,
                        "streamedDigest": streamed_digest,
                        "expectedLength": session.expected_length,
                        "streamedLength": streamed_length,
                    }),
                    occurred_at: now,
                })
                .await?;
            return Err(Error::upload_verification_failed(format!(
                "expected digest {} (length {}), got {} (length {})",
                session.expected_digest, session.expected_length, streamed_digest, streamed_length
            )));
        }

        let final_key = format!("blobs/{streamed_digest}");
        self.objects
            .copy(&session.object_staging_key, &final_key)
            .await
            .map_err(|e| Error::dependency_unavailable(format!("promote to final key failed: {e}")))?;

        self.store
            .insert_blob_if_absent(Blob {
                digest: streamed_digest.clone(),
                length_bytes: streamed_length,
                storage_key: final_key,
                created_at: now,
            })
            .await?;
        self.store.complete_upload_session(upload_id, &streamed_digest, false).await?;
        self.store
            .insert_audit_record(AuditRecord {
                action: "upload.committed".to_string(),
                actor: session.created_by_subject.clone(),
                resource_type: "upload_session".to_string(),
                resource_id: upload_id.to_string(),
                details: serde_json::json!({ "digest": streamed_digest, "lengthBytes": streamed_length }),
                occurred_at: now,
            })
            .await?;

        self.load_live_session(upload_id, now).await
    }

    /// Spec §4.4 repo-scoped blob visibility: the blob must be
    /// referenced by a committed session *in this repo* or by an
    /// artifact entry of a version in this repo.
    pub async fn is_blob_visible_in_repo(&self, repo_id: Uuid, digest: &str) -> Result<bool, Error> {
        if self.store.has_committed_session_for_blob_in_repo(repo_id, digest).await? {
            return Ok(true);
        }
        Ok(!self.store.find_versions_referencing_blob_in_repo(repo_id, digest).await?.is_empty())
    }

    /// Read a (possibly ranged) slice of a committed blob's bytes.
    /// Returns `Ok(None)` when the range cannot be satisfied (caller
    /// maps that to 416).
    pub async fn read_blob(&self, digest: &str, range: Option<ByteRange>) -> Result<Option<(Vec<u8>, u64)>, Error> {
        let blob = self
            .store
            .find_blob(digest)
            .await?
            .ok_or_else(|| Error::not_found(format!("blob {digest} not found")))?;
        if let Some(r) = range {
            if r.resolve(blob.length_bytes).is_none() {
                return Ok(None);
            }
        }
        let data = self
            .objects
            .get(&blob.storage_key, range)
            .await
            .map_err(|e| Error::dependency_unavailable(format!("blob read failed: {e}")))?;
        Ok(data.map(|d| (d, blob.length_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_objectstore::InMemoryObjectStore;
    use af_store::InMemoryTruthStore;

    fn engine() -> UploadEngine {
        UploadEngine::new(
            Arc::new(InMemoryTruthStore::new()),
            Arc::new(InMemoryObjectStore::new()),
            chrono::Duration::hours(1),
        )
    }

    fn digest_of(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[tokio::test]
    async fn create_rejects_bad_digest_shape() {
        let engine = engine();
        let err = engine
            .create(
                Uuid::nil(),
                Uuid::nil(),
                "demo",
                "alice",
                CreateUploadRequest { expected_digest: "not-hex".into(), expected_length: 10 },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn create_rejects_zero_length() {
        let engine = engine();
        let err = engine
            .create(
                Uuid::nil(),
                Uuid::nil(),
                "demo",
                "alice",
                CreateUploadRequest { expected_digest: "a".repeat(64), expected_length: 0 },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    async fn upload_and_commit(engine: &UploadEngine, repo_id: Uuid, bytes: &[u8]) -> UploadSession {
        let now = Utc::now();
        let digest = digest_of(bytes);
        let created = engine
            .create(
                Uuid::nil(),
                repo_id,
                "demo",
                "alice",
                CreateUploadRequest { expected_digest: digest, expected_length: bytes.len() as u64 },
                now,
            )
            .await
            .unwrap();
        assert!(!created.deduped);
        let upload_id = created.session.upload_id;

        engine.presign_part(upload_id, 1, std::time::Duration::from_secs(900), now).await.unwrap();

        // simulate the client PUT by writing directly to the in-memory
        // object store's in-flight upload before calling complete.
        engine
            .objects
            .complete_multipart(
                &created.session.object_staging_key,
                &created.session.storage_upload_id,
                &[],
            )
            .await
            .ok();

        engine
    }

    #[tokio::test]
    async fn full_happy_path_commits_with_matching_digest() {
        let store = Arc::new(InMemoryTruthStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let engine = UploadEngine::new(store.clone(), objects.clone(), chrono::Duration::hours(1));

        let repo_id = Uuid::new_v4();
        let bytes = b"hello world".to_vec();
        let now = Utc::now();
        let digest = digest_of(&bytes);

        let created = engine
            .create(
                Uuid::nil(),
                repo_id,
                "demo",
                "alice",
                CreateUploadRequest { expected_digest: digest.clone(), expected_length: bytes.len() as u64 },
                now,
            )
            .await
            .unwrap();
        let upload_id = created.session.upload_id;

        engine.presign_part(upload_id, 1, std::time::Duration::from_secs(900), now).await.unwrap();

        // write the part directly into the in-memory backing store, the
        // way a client's presigned PUT would.
        objects.put_part_for_test(&created.session.storage_upload_id, 1, &bytes).await.unwrap();

        let completed = engine.complete(upload_id, vec![(1, "etag-1".into())], now).await.unwrap();
        assert_eq!(completed.state, UploadState::PendingCommit);

        let committed = engine.commit(upload_id, now).await.unwrap();
        assert_eq!(committed.state, UploadState::Committed);
        assert_eq!(committed.committed_blob_digest.as_deref(), Some(digest.as_str()));
        assert!(!committed.deduped);
    }

    #[tokio::test]
    async fn dedupe_short_circuits_object_store() {
        let store = Arc::new(InMemoryTruthStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let engine = UploadEngine::new(store.clone(), objects, chrono::Duration::hours(1));

        let digest = "c".repeat(64);
        store
            .insert_blob_if_absent(Blob { digest: digest.clone(), length_bytes: 5, storage_key: "blobs/c".into(), created_at: Utc::now() })
            .await
            .unwrap();

        let created = engine
            .create(
                Uuid::nil(),
                Uuid::new_v4(),
                "demo",
                "alice",
                CreateUploadRequest { expected_digest: digest.clone(), expected_length: 5 },
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(created.deduped);
        assert_eq!(created.session.state, UploadState::Committed);
        assert_eq!(created.session.committed_blob_digest.as_deref(), Some(digest.as_str()));
    }

    #[tokio::test]
    async fn abort_is_terminal_and_rejects_second_call() {
        let engine = engine();
        let created = engine
            .create(
                Uuid::nil(),
                Uuid::new_v4(),
                "demo",
                "alice",
                CreateUploadRequest { expected_digest: "d".repeat(64), expected_length: 4 },
                Utc::now(),
            )
            .await
            .unwrap();
        let upload_id = created.session.upload_id;

        let aborted = engine.abort(upload_id, None, Utc::now()).await.unwrap();
        assert_eq!(aborted.state, UploadState::Aborted);

        let err = engine.abort(upload_id, None, Utc::now()).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn complete_rejects_duplicate_part_numbers() {
        let engine = engine();
        let created = engine
            .create(
                Uuid::nil(),
                Uuid::new_v4(),
                "demo",
                "alice",
                CreateUploadRequest { expected_digest: "e".repeat(64), expected_length: 4 },
                Utc::now(),
            )
            .await
            .unwrap();
        let upload_id = created.session.upload_id;
        let now = Utc::now();
        engine.presign_part(upload_id, 1, std::time::Duration::from_secs(900), now).await.unwrap();

        let err = engine
            .complete(upload_id, vec![(1, "a".into()), (1, "b".into())], now)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.message().contains("Duplicate partNumber"));
    }

    #[tokio::test]
    async fn commit_verification_mismatch_aborts_session() {
        let store = Arc::new(InMemoryTruthStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let engine = UploadEngine::new(store, objects.clone(), chrono::Duration::hours(1));

        let now = Utc::now();
        let wrong_digest = "f".repeat(64);
        let created = engine
            .create(
                Uuid::nil(),
                Uuid::new_v4(),
                "demo",
                "alice",
                CreateUploadRequest { expected_digest: wrong_digest, expected_length: 3 },
                now,
            )
            .await
            .unwrap();
        let upload_id = created.session.upload_id;

        engine.presign_part(upload_id, 1, std::time::Duration::from_secs(900), now).await.unwrap();
        objects.put(&created.session.object_staging_key, b"xyz").await.unwrap();

        // force the session straight to pending_commit to isolate the
        // commit-time verification path from complete_multipart's part
        // bookkeeping, which the in-memory backend tracks separately.
        engine
            .store
            .transition_upload_session(upload_id, UploadState::PartsUploading, UploadState::PendingCommit)
            .await
            .unwrap();

        let err = engine.commit(upload_id, now).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.error_code(), "upload_verification_failed");

        let session = engine.store.find_upload_session(upload_id).await.unwrap().unwrap();
        assert_eq!(session.state, UploadState::Aborted);
    }

    #[tokio::test]
    async fn commit_success_path_creates_blob_and_commits_session() {
        let store = Arc::new(InMemoryTruthStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let engine = UploadEngine::new(store, objects.clone(), chrono::Duration::hours(1));

        let now = Utc::now();
        let bytes = b"abc".to_vec();
        let digest = digest_of(&bytes);
        let created = engine
            .create(
                Uuid::nil(),
                Uuid::new_v4(),
                "demo",
                "alice",
                CreateUploadRequest { expected_digest: digest.clone(), expected_length: 3 },
                now,
            )
            .await
            .unwrap();
        let upload_id = created.session.upload_id;

        engine.presign_part(upload_id, 1, std::time::Duration::from_secs(900), now).await.unwrap();
        objects.put(&created.session.object_staging_key, &bytes).await.unwrap();
        engine
            .store
            .transition_upload_session(upload_id, UploadState::PartsUploading, UploadState::PendingCommit)
            .await
            .unwrap();

        let committed = engine.commit(upload_id, now).await.unwrap();
        assert_eq!(committed.state, UploadState::Committed);
        assert_eq!(committed.committed_blob_digest.as_deref(), Some(digest.as_str()));

        let blob = engine.store.find_blob(&digest).await.unwrap().unwrap();
        assert_eq!(blob.length_bytes, 3);
    }
}
