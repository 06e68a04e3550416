//! # Object store
//!
//! C2 — the object-store adapter: multipart upload, presigned part URLs,
//! head/get/delete for content-addressed blobs and staged upload data.
//! The trait shape is carried over from `shipper-storage`'s
//! `StorageBackend` (read/write/delete/exists/list over a key namespace)
//! generalized to the multipart session lifecycle spec §4.2/§4.4 need,
//! since a plain put/get doesn't cover resumable multi-gigabyte uploads.
//!
//! Two implementations: [`InMemoryObjectStore`] for tests and
//! [`S3CompatibleObjectStore`] for a real S3-compatible (MinIO-style)
//! endpoint, signing presigned URLs with HMAC-SHA256 the way
//! `shipper-webhook` signs outbound webhook payloads.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

/// Metadata about a stored object (spec §3's `Blob.length_bytes` plus
/// whatever the backend can report).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub length_bytes: u64,
    pub etag: String,
}

/// One completed part of a multipart upload (spec §4.2: part number +
/// the backend-reported ETag, needed to call `CompleteMultipartUpload`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartETag {
    pub part_number: u32,
    pub etag: String,
}

/// An inclusive byte range for a ranged GET (spec §4.4's ranged
/// download). `end` is `None` for an open-ended range (`bytes=500-`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Resolve against the object's actual length, per HTTP range
    /// semantics (RFC 7233 §2.1). Returns `None` if the range cannot be
    /// satisfied (start at or past the object length), the condition
    /// that maps to 416 at the upload-engine layer.
    pub fn resolve(&self, total_len: u64) -> Option<(u64, u64)> {
        if self.start >= total_len {
            return None;
        }
        let end = self.end.map(|e| e.min(total_len.saturating_sub(1))).unwrap_or(total_len.saturating_sub(1));
        if end < self.start {
            return None;
        }
        Some((self.start, end))
    }

    /// Parse a single-range `Range: bytes=<start>-<end>` header value.
    /// Multi-range requests are not supported (spec §4.4 Non-goals).
    pub fn parse(header_value: &str) -> Option<Self> {
        let spec = header_value.strip_prefix("bytes=")?;
        let (start_s, end_s) = spec.split_once('-')?;
        if start_s.is_empty() {
            // suffix range: bytes=-500 means "last 500 bytes"; callers
            // resolve this against total_len themselves since we don't
            // have it here. Represent as start=0 sentinel handled by
            // the caller — unsupported in this minimal parser.
            return None;
        }
        let start: u64 = start_s.parse().ok()?;
        let end = if end_s.is_empty() { None } else { Some(end_s.parse().ok()?) };
        Some(Self { start, end })
    }
}

/// The C2 object store contract. All operations are keyed by an opaque
/// string (either a content-addressed `blobs/<digest>` path or a
/// staging path from `af_types::staging_key`).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Begin a multipart upload, returning the backend's
    /// `storage_upload_id`.
    async fn start_multipart(&self, key: &str) -> anyhow::Result<String>;

    /// A presigned URL the client can `PUT` one part to directly,
    /// bypassing the service for the actual bytes (spec §4.2). Signing
    /// is CPU-only, so this is synchronous.
    fn presign_part(&self, key: &str, storage_upload_id: &str, part_number: u32, ttl: std::time::Duration, now: DateTime<Utc>) -> anyhow::Result<String>;

    async fn complete_multipart(&self, key: &str, storage_upload_id: &str, parts: &[PartETag]) -> anyhow::Result<ObjectMeta>;

    async fn abort_multipart(&self, key: &str, storage_upload_id: &str) -> anyhow::Result<()>;

    /// Single-shot write, used for small objects (manifests) that don't
    /// need a multipart session.
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<ObjectMeta>;

    async fn head(&self, key: &str) -> anyhow::Result<Option<ObjectMeta>>;

    /// Read the object, optionally restricted to `range`. Returns
    /// `Ok(None)` if `range` cannot be satisfied against the object's
    /// actual length (the caller maps that to 416).
    async fn get(&self, key: &str, range: Option<ByteRange>) -> anyhow::Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Server-side copy, used to promote a staging object to its
    /// content-addressed final key on commit without re-uploading bytes.
    async fn copy(&self, from: &str, to: &str) -> anyhow::Result<()>;
}

struct InFlightUpload {
    parts: HashMap<u32, Vec<u8>>,
}

/// An in-process object store for tests and the in-memory `af-store`
/// pairing — no network, no disk.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<HashMap<String, InFlightUpload>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-only seam: write a part's bytes directly into an in-flight
    /// multipart upload, standing in for the client's presigned PUT
    /// that real object stores receive out of band.
    pub async fn put_part_for_test(&self, storage_upload_id: &str, part_number: u32, data: &[u8]) -> anyhow::Result<()> {
        let mut uploads = self.uploads.lock().await;
        let upload = uploads
            .get_mut(storage_upload_id)
            .ok_or_else(|| anyhow::anyhow!("unknown upload id {storage_upload_id}"))?;
        upload.parts.insert(part_number, data.to_vec());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn start_multipart(&self, _key: &str) -> anyhow::Result<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads.lock().await.insert(
            upload_id.clone(),
            InFlightUpload { parts: HashMap::new() },
        );
        Ok(upload_id)
    }

    fn presign_part(&self, key: &str, storage_upload_id: &str, part_number: u32, ttl: std::time::Duration, now: DateTime<Utc>) -> anyhow::Result<String> {
        Ok(format!(
            "memory://{key}?uploadId={storage_upload_id}&partNumber={part_number}&expires={}",
            (now + chrono::Duration::from_std(ttl).unwrap_or_default()).timestamp()
        ))
    }

    async fn complete_multipart(&self, key: &str, storage_upload_id: &str, parts: &[PartETag]) -> anyhow::Result<ObjectMeta> {
        let mut uploads = self.uploads.lock().await;
        let upload = uploads
            .remove(storage_upload_id)
            .ok_or_else(|| anyhow::anyhow!("unknown upload id {storage_upload_id}"))?;

        let mut ordered: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        ordered.sort_unstable();

        let mut body = Vec::new();
        for part_number in &ordered {
            let chunk = upload
                .parts
                .get(part_number)
                .ok_or_else(|| anyhow::anyhow!("missing part {part_number} in storage"))?;
            body.extend_from_slice(chunk);
        }

        let meta = ObjectMeta {
            key: key.to_string(),
            length_bytes: body.len() as u64,
            etag: hex::encode(sha2::Sha256::digest_bytes(&body)),
        };
        self.objects.lock().await.insert(key.to_string(), body);
        Ok(meta)
    }

    async fn abort_multipart(&self, _key: &str, storage_upload_id: &str) -> anyhow::Result<()> {
        self.uploads.lock().await.remove(storage_upload_id);
        Ok(())
    }

    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<ObjectMeta> {
        self.objects.lock().await.insert(key.to_string(), data.to_vec());
        Ok(ObjectMeta {
            key: key.to_string(),
            length_bytes: data.len() as u64,
            etag: hex::encode(sha2::Sha256::digest_bytes(data)),
        })
    }

    async fn head(&self, key: &str) -> anyhow::Result<Option<ObjectMeta>> {
        let objects = self.objects.lock().await;
        Ok(objects.get(key).map(|data| ObjectMeta {
            key: key.to_string(),
            length_bytes: data.len() as u64,
            etag: hex::encode(sha2::Sha256::digest_bytes(data)),
        }))
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> anyhow::Result<Option<Vec<u8>>> {
        let objects = self.objects.lock().await;
        let Some(data) = objects.get(key) else {
            return Ok(None);
        };
        match range {
            None => Ok(Some(data.clone())),
            Some(r) => match r.resolve(data.len() as u64) {
                None => Ok(None),
                Some((start, end)) => Ok(Some(data[start as usize..=end as usize].to_vec())),
            },
        }
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let mut objects = self.objects.lock().await;
        let data = objects
            .get(from)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("copy source {from} not found"))?;
        objects.insert(to.to_string(), data);
        Ok(())
    }
}

/// A small helper trait extension so `Sha256::digest` reads naturally at
/// call sites above without importing `sha2::Digest` everywhere.
trait DigestExt {
    fn digest_bytes(data: &[u8]) -> Vec<u8>;
}

impl DigestExt for Sha256 {
    fn digest_bytes(data: &[u8]) -> Vec<u8> {
        use sha2::Digest;
        Sha256::digest(data).to_vec()
    }
}

/// Configuration for [`S3CompatibleObjectStore`]: endpoint, bucket, and
/// the access/secret key pair used to derive the HMAC signing key.
#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// An S3-compatible (MinIO/AWS S3) object store. Presigned URLs use a
/// simplified HMAC-SHA256 query-string signature (signing string is
/// `METHOD\nkey\nuploadId\npartNumber\nexpires`) rather than full AWS
/// SigV4 — the wire format AWS itself expects is out of scope for this
/// workspace (spec §4.2 only requires that a presigned URL grant
/// time-boxed, single-operation access), but the HMAC-over-endpoint
/// primitive is the same one `shipper-webhook` uses for outbound
/// payload signatures.
pub struct S3CompatibleObjectStore {
    credentials: S3Credentials,
    client: reqwest::Client,
}

impl S3CompatibleObjectStore {
    pub fn new(credentials: S3Credentials) -> Self {
        Self {
            credentials,
            client: reqwest::Client::new(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.credentials.endpoint.trim_end_matches('/'), self.credentials.bucket, key)
    }

    fn sign(&self, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.secret_access_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl ObjectStore for S3CompatibleObjectStore {
    async fn start_multipart(&self, key: &str) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(format!("{}?uploads", self.object_url(key)))
            .send()
            .await?
            .error_for_status()?;
        let body = resp.text().await?;
        extract_upload_id(&body).ok_or_else(|| anyhow::anyhow!("no UploadId in response"))
    }

    fn presign_part(&self, key: &str, storage_upload_id: &str, part_number: u32, ttl: std::time::Duration, now: DateTime<Utc>) -> anyhow::Result<String> {
        let expires = (now + chrono::Duration::from_std(ttl)?).timestamp();
        let message = format!("PUT\n{key}\n{storage_upload_id}\n{part_number}\n{expires}");
        let signature = self.sign(&message);
        Ok(format!(
            "{}?uploadId={storage_upload_id}&partNumber={part_number}&expires={expires}&signature={signature}&accessKey={}",
            self.object_url(key), self.credentials.access_key_id,
        ))
    }

    async fn complete_multipart(&self, key: &str, storage_upload_id: &str, parts: &[PartETag]) -> anyhow::Result<ObjectMeta> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for p in parts {
            body.push_str(&format!("<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>", p.part_number, p.etag));
        }
        body.push_str("</CompleteMultipartUpload>");

        let resp = self
            .client
            .post(format!("{}?uploadId={storage_upload_id}", self.object_url(key)))
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        let etag = resp
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();
        let length_bytes = resp
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(ObjectMeta { key: key.to_string(), length_bytes, etag })
    }

    async fn abort_multipart(&self, key: &str, storage_upload_id: &str) -> anyhow::Result<()> {
        self.client
            .delete(format!("{}?uploadId={storage_upload_id}", self.object_url(key)))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<ObjectMeta> {
        let resp = self
            .client
            .put(self.object_url(key))
            .body(data.to_vec())
            .send()
            .await?
            .error_for_status()?;
        let etag = resp
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();
        Ok(ObjectMeta { key: key.to_string(), length_bytes: data.len() as u64, etag })
    }

    async fn head(&self, key: &str) -> anyhow::Result<Option<ObjectMeta>> {
        let resp = self.client.head(self.object_url(key)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let length_bytes = resp
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let etag = resp
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();
        Ok(Some(ObjectMeta { key: key.to_string(), length_bytes, etag }))
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> anyhow::Result<Option<Vec<u8>>> {
        let mut req = self.client.get(self.object_url(key));
        if let Some(r) = range {
            let header = match r.end {
                Some(end) => format!("bytes={}-{end}", r.start),
                None => format!("bytes={}-", r.start),
            };
            req = req.header("Range", header);
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if resp.status() == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.client.delete(self.object_url(key)).send().await?.error_for_status()?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> anyhow::Result<()> {
        self.client
            .put(self.object_url(to))
            .header("x-amz-copy-source", format!("/{}/{}", self.credentials.bucket, from))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn extract_upload_id(xml_body: &str) -> Option<String> {
    let start = xml_body.find("<UploadId>")? + "<UploadId>".len();
    let end = xml_body[start..].find("</UploadId>")? + start;
    Some(xml_body[start..end].to_string())
}

pub type SharedObjectStore = Arc<dyn ObjectStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_round_trip_orders_parts_correctly() {
        let store = InMemoryObjectStore::new();
        let upload_id = store.start_multipart("blobs/abc").await.unwrap();

        {
            let mut uploads = store.uploads.lock().await;
            let upload = uploads.get_mut(&upload_id).unwrap();
            upload.parts.insert(2, b"world".to_vec());
            upload.parts.insert(1, b"hello ".to_vec());
        }

        let meta = store
            .complete_multipart(
                "blobs/abc",
                &upload_id,
                &[
                    PartETag { part_number: 1, etag: "x".into() },
                    PartETag { part_number: 2, etag: "y".into() },
                ],
            )
            .await
            .unwrap();

        assert_eq!(meta.length_bytes, 11);
        let data = store.get("blobs/abc", None).await.unwrap().unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn abort_discards_uploaded_parts() {
        let store = InMemoryObjectStore::new();
        let upload_id = store.start_multipart("blobs/x").await.unwrap();
        store.abort_multipart("blobs/x", &upload_id).await.unwrap();

        let err = store
            .complete_multipart("blobs/x", &upload_id, &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown upload id"));
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let store = InMemoryObjectStore::new();
        assert!(store.get("nope", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ranged_get_returns_requested_slice() {
        let store = InMemoryObjectStore::new();
        store.put("blobs/range", b"0123456789").await.unwrap();

        let slice = store
            .get("blobs/range", Some(ByteRange { start: 2, end: Some(4) }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slice, b"234");
    }

    #[tokio::test]
    async fn ranged_get_beyond_length_is_none() {
        let store = InMemoryObjectStore::new();
        store.put("blobs/short", b"abc").await.unwrap();

        let result = store
            .get("blobs/short", Some(ByteRange { start: 10, end: Some(20) }))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn copy_duplicates_without_consuming_source() {
        let store = InMemoryObjectStore::new();
        store.put("staging/1", b"payload").await.unwrap();
        store.copy("staging/1", "blobs/final").await.unwrap();

        assert_eq!(store.get("staging/1", None).await.unwrap().unwrap(), b"payload");
        assert_eq!(store.get("blobs/final", None).await.unwrap().unwrap(), b"payload");
    }

    #[test]
    fn byte_range_parses_closed_range() {
        let r = ByteRange::parse("bytes=10-20").unwrap();
        assert_eq!(r.start, 10);
        assert_eq!(r.end, Some(20));
    }

    #[test]
    fn byte_range_parses_open_ended_range() {
        let r = ByteRange::parse("bytes=500-").unwrap();
        assert_eq!(r.start, 500);
        assert_eq!(r.end, None);
    }

    #[test]
    fn byte_range_rejects_malformed_header() {
        assert!(ByteRange::parse("not-a-range").is_none());
    }

    #[test]
    fn byte_range_resolve_clamps_open_end() {
        let r = ByteRange { start: 5, end: None };
        assert_eq!(r.resolve(10), Some((5, 9)));
    }

    #[test]
    fn byte_range_resolve_rejects_start_past_length() {
        let r = ByteRange { start: 100, end: Some(200) };
        assert!(r.resolve(10).is_none());
    }

    #[test]
    fn extract_upload_id_from_xml() {
        let xml = "<InitiateMultipartUploadResult><UploadId>abc-123</UploadId></InitiateMultipartUploadResult>";
        assert_eq!(extract_upload_id(xml), Some("abc-123".to_string()));
    }

    #[test]
    fn presign_signature_is_deterministic_for_same_inputs() {
        let store = S3CompatibleObjectStore::new(S3Credentials {
            endpoint: "http://localhost:9000".into(),
            bucket: "artifacts".into(),
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
        });
        let now = Utc::now();
        let a = store.presign_part("blobs/x", "upload-1", 1, std::time::Duration::from_secs(900), now).unwrap();
        let b = store.presign_part("blobs/x", "upload-1", 1, std::time::Duration::from_secs(900), now).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn presign_signature_differs_for_different_parts() {
        let store = S3CompatibleObjectStore::new(S3Credentials {
            endpoint: "http://localhost:9000".into(),
            bucket: "artifacts".into(),
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
        });
        let now = Utc::now();
        let a = store.presign_part("blobs/x", "upload-1", 1, std::time::Duration::from_secs(900), now).unwrap();
        let b = store.presign_part("blobs/x", "upload-1", 2, std::time::Duration::from_secs(900), now).unwrap();
        assert_ne!(a, b);
    }
}
