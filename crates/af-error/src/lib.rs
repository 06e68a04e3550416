//! # Error
//!
//! The error taxonomy every Artifortress component returns through. There
//! is deliberately one `Error` type for the whole workspace rather than a
//! per-crate type: the HTTP edge (out of scope here, but the thing that
//! eventually wraps C10) needs one place to map a failure to a status
//! code and `error` string, and that place is [`status_code`] /
//! [`error_code`] below.
//!
//! Library-internal plumbing (config parsing, file I/O) still uses
//! `anyhow::Result` where the failure can't usefully be typed; it gets
//! converted to an [`Error`] at the boundary of whatever public operation
//! calls it, usually via [`Error::dependency_unavailable`] or
//! [`Error::transient`].

use serde::Serialize;

/// The full set of failure kinds a component operation can return.
///
/// Each variant carries the human-readable `message` that ends up in the
/// response body; anything structured enough to be machine-read (a repo
/// key, a digest) belongs in the message text for now — no caller parses
/// it back out.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or semantically invalid input: bad scope grammar, a
    /// `repoKey` containing `:`, a digest that isn't 64 hex chars, a
    /// byte range the object can't satisfy's sibling (see
    /// `RangeNotSatisfiable` for that one specifically).
    #[error("validation error: {0}")]
    Validation(String),

    /// No credential could be resolved, or the one presented doesn't
    /// verify (expired/revoked PAT, bad JWT signature, unknown issuer).
    #[error("authentication failed: {0}")]
    AuthN(String),

    /// A credential resolved fine but doesn't carry the role required
    /// for the requested operation on the requested repo.
    #[error("authorization failed: {0}")]
    AuthZ(String),

    /// The referenced tenant/repo/version/upload/blob does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation collides with existing state: draft/version
    /// identity already published, upload session already committed,
    /// duplicate role binding. `code` distinguishes the generic
    /// `"conflict"` from spec-named scenarios like
    /// `"upload_verification_failed"` that callers need to match on.
    #[error("conflict: {message}")]
    Conflict { code: &'static str, message: String },

    /// A ranged download request's range cannot be satisfied against the
    /// object's actual length.
    #[error("range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    /// The target row is currently claimed by another worker (outbox/job
    /// claim-lock) or otherwise locked against the requested mutation.
    /// `code` carries the spec-named scenario (e.g. `"quarantined_blob"`)
    /// when there is one, else the generic `"locked"`.
    #[error("locked: {message}")]
    Locked { code: &'static str, message: String },

    /// A required downstream dependency (truth store, object store,
    /// policy engine) could not be reached at all.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// A downstream dependency failed in a way that is expected to
    /// succeed on retry (serialization failure, policy evaluation
    /// timeout). Carries no backoff schedule itself — that's `af-retry`'s
    /// job — just marks the failure as retryable. `code` carries the
    /// spec-named scenario (e.g. `"policy_timeout"`) when there is one,
    /// else the generic `"transient"`.
    #[error("transient failure: {message}")]
    Transient { code: &'static str, message: String },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn auth_n(msg: impl Into<String>) -> Self {
        Error::AuthN(msg.into())
    }

    pub fn auth_z(msg: impl Into<String>) -> Self {
        Error::AuthZ(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict { code: "conflict", message: msg.into() }
    }

    /// Digest or length mismatch discovered at upload commit time
    /// (spec §4.4/§7).
    pub fn upload_verification_failed(msg: impl Into<String>) -> Self {
        Error::Conflict { code: "upload_verification_failed", message: msg.into() }
    }

    pub fn range_not_satisfiable(msg: impl Into<String>) -> Self {
        Error::RangeNotSatisfiable(msg.into())
    }

    pub fn locked(msg: impl Into<String>) -> Self {
        Error::Locked { code: "locked", message: msg.into() }
    }

    /// A blob read that resolves to a quarantined or rejected blob in
    /// the requested repo (spec §4.6/§7).
    pub fn quarantined_blob(msg: impl Into<String>) -> Self {
        Error::Locked { code: "quarantined_blob", message: msg.into() }
    }

    pub fn dependency_unavailable(msg: impl Into<String>) -> Self {
        Error::DependencyUnavailable(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient { code: "transient", message: msg.into() }
    }

    /// The policy engine's fail-closed timeout path (spec §4.6/§7).
    pub fn policy_timeout(msg: impl Into<String>) -> Self {
        Error::Transient { code: "policy_timeout", message: msg.into() }
    }

    /// `true` iff retrying the same operation unchanged has a reasonable
    /// chance of succeeding. Used by `af-retry`-driven sweepers to decide
    /// whether to reschedule or give up immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::DependencyUnavailable(_) | Error::Transient { .. } | Error::Locked { .. })
    }

    /// The machine-readable `error` string returned in the response body,
    /// per the mapping table in spec §6/§7. This is the single source of
    /// truth for that mapping; nothing else in the workspace should
    /// hand-write one of these strings.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::AuthN(_) => "unauthenticated",
            Error::AuthZ(_) => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::Conflict { code, .. } => code,
            Error::RangeNotSatisfiable(_) => "range_not_satisfiable",
            Error::Locked { code, .. } => code,
            Error::DependencyUnavailable(_) => "dependency_unavailable",
            Error::Transient { code, .. } => code,
        }
    }

    /// The HTTP status code this error kind maps to, per spec §6/§7.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::AuthN(_) => 401,
            Error::AuthZ(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict { .. } => 409,
            Error::RangeNotSatisfiable(_) => 416,
            Error::Locked { .. } => 423,
            Error::DependencyUnavailable(_) => 503,
            Error::Transient { .. } => 503,
        }
    }

    /// The error message text, independent of variant.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// The wire body every component operation's error maps to:
    /// `{"error": "<code>", "message": "<text>"}`.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.error_code(),
            message: self.message(),
        }
    }
}

/// The JSON error body returned by `af-core` (spec §6: every non-2xx
/// response carries this shape).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

/// Converts a library-internal `anyhow::Error` into a typed
/// [`Error::DependencyUnavailable`]. Use at a boundary where the failure
/// is unambiguously "something downstream/infra broke" rather than a
/// validation or auth failure, which should be raised directly as the
/// specific variant instead of routed through `anyhow`.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::DependencyUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(Error::validation("x").status_code(), 400);
        assert_eq!(Error::auth_n("x").status_code(), 401);
        assert_eq!(Error::auth_z("x").status_code(), 403);
        assert_eq!(Error::not_found("x").status_code(), 404);
        assert_eq!(Error::conflict("x").status_code(), 409);
        assert_eq!(Error::range_not_satisfiable("x").status_code(), 416);
        assert_eq!(Error::locked("x").status_code(), 423);
        assert_eq!(Error::dependency_unavailable("x").status_code(), 503);
        assert_eq!(Error::transient("x").status_code(), 503);
    }

    #[test]
    fn retryable_kinds() {
        assert!(Error::transient("x").is_retryable());
        assert!(Error::dependency_unavailable("x").is_retryable());
        assert!(Error::locked("x").is_retryable());
        assert!(!Error::validation("x").is_retryable());
        assert!(!Error::conflict("x").is_retryable());
    }

    #[test]
    fn response_shape() {
        let resp = Error::not_found("version not found").to_response();
        assert_eq!(resp.error, "not_found");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"], "not_found");
        assert_eq!(json["message"], "not found: version not found");
    }

    #[test]
    fn anyhow_conversion_is_dependency_unavailable() {
        let e: Error = anyhow::anyhow!("connection refused").into();
        assert_eq!(e.status_code(), 503);
        assert_eq!(e.error_code(), "dependency_unavailable");
    }

    #[test]
    fn named_scenarios_carry_specific_codes() {
        let quarantined = Error::quarantined_blob("blob x is quarantined");
        assert_eq!(quarantined.error_code(), "quarantined_blob");
        assert_eq!(quarantined.status_code(), 423);

        let timeout = Error::policy_timeout("policy evaluation timed out");
        assert_eq!(timeout.error_code(), "policy_timeout");
        assert_eq!(timeout.status_code(), 503);

        let verification = Error::upload_verification_failed("digest mismatch");
        assert_eq!(verification.error_code(), "upload_verification_failed");
        assert_eq!(verification.status_code(), 409);

        // generic constructors still report the generic codes.
        assert_eq!(Error::locked("x").error_code(), "locked");
        assert_eq!(Error::transient("x").error_code(), "transient");
        assert_eq!(Error::conflict("x").error_code(), "conflict");
    }
}
