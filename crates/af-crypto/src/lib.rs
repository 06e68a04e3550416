//! # Crypto
//!
//! The small set of cryptographic primitives C3 (identity & authz) needs:
//! PAT hashing, constant-time bootstrap-token comparison, and JWT
//! HS256/RS256 verification against a JWKS document. Nothing here talks
//! to the network — fetching a JWKS document and caching/refreshing it
//! is `af-auth`'s job; this crate only verifies a token against
//! key material it's handed.

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// SHA-256 of `plaintext`, lowercase hex. The only form of a PAT that is
/// ever persisted (spec §3 invariant 1) is this hash — never the
/// plaintext.
pub fn hash_token(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    hex::encode(digest)
}

/// Constant-time equality check for the bootstrap token (spec §4.3):
/// comparing presented-vs-configured bootstrap credentials with `==`
/// would leak timing information proportional to the common prefix
/// length. Length differences are still observable (the byte count is
/// public), but content at matching positions is not.
pub fn bootstrap_token_matches(presented: &str, configured: &str) -> bool {
    if presented.len() != configured.len() {
        return false;
    }
    presented.as_bytes().ct_eq(configured.as_bytes()).into()
}

/// One entry of a JWKS document (`RFC 7517`, restricted to the fields an
/// RSA verification key needs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kid: String,
    pub kty: String,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
}

/// A parsed JWKS document, the shape an OIDC provider's `jwks_uri`
/// returns (`{"keys": [...]}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    pub fn parse(body: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

/// The claims every Artifortress bearer JWT is expected to carry. Extra
/// claims in the token are ignored; `scope` may be absent (some issuers
/// put authorization elsewhere and af-auth's claim-role mapping handles
/// that case).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub iss: String,
    #[serde(default)]
    pub aud: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Decode and verify an HS256 JWT against a shared secret, checking
/// issuer and (when `audience` is `Some`) audience.
pub fn verify_hs256(token: &str, shared_secret: &str, issuer: &str, audience: Option<&str>) -> anyhow::Result<TokenClaims> {
    let key = DecodingKey::from_secret(shared_secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[issuer]);
    if let Some(aud) = audience {
        validation.set_audience(&[aud]);
    } else {
        validation.validate_aud = false;
    }
    let data = decode::<TokenClaims>(token, &key, &validation)?;
    Ok(data.claims)
}

/// Decode and verify an RS256 JWT against a JWKS document, selecting the
/// key by the token header's `kid`. Returns an error if the `kid` isn't
/// present in `jwks` — callers (af-auth) are expected to retry with a
/// freshly-fetched JWKS once before treating this as a hard failure,
/// since key rotation can lag a local cache.
pub fn verify_rs256(
    token: &str,
    jwks: &Jwks,
    issuer: &str,
    audience: Option<&str>,
) -> anyhow::Result<TokenClaims> {
    let header = jsonwebtoken::decode_header(token)?;
    let kid = header
        .kid
        .ok_or_else(|| anyhow::anyhow!("token header missing kid"))?;
    let jwk = jwks
        .find(&kid)
        .ok_or_else(|| anyhow::anyhow!("no matching key for kid {kid}"))?;
    let n = jwk
        .n
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("jwk {kid} missing modulus"))?;
    let e = jwk
        .e
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("jwk {kid} missing exponent"))?;
    let key = DecodingKey::from_rsa_components(n, e)?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&[issuer]);
    if let Some(aud) = audience {
        validation.set_audience(&[aud]);
    } else {
        validation.validate_aud = false;
    }
    let data = decode::<TokenClaims>(token, &key, &validation)?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_lowercase_hex() {
        let a = hash_token("my-secret-token");
        let b = hash_token("my-secret-token");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c)));
    }

    #[test]
    fn different_tokens_hash_differently() {
        assert_ne!(hash_token("a"), hash_token("b"));
    }

    #[test]
    fn bootstrap_compare_matches_equal_strings() {
        assert!(bootstrap_token_matches("same-value", "same-value"));
    }

    #[test]
    fn bootstrap_compare_rejects_different_length() {
        assert!(!bootstrap_token_matches("short", "much-longer-value"));
    }

    #[test]
    fn bootstrap_compare_rejects_different_content_same_length() {
        assert!(!bootstrap_token_matches("aaaaaa", "aaaaab"));
    }

    #[test]
    fn jwks_parse_and_find() {
        let body = r#"{"keys":[{"kid":"k1","kty":"RSA","n":"abc","e":"AQAB"}]}"#;
        let jwks = Jwks::parse(body).unwrap();
        assert!(jwks.find("k1").is_some());
        assert!(jwks.find("missing").is_none());
    }

    #[test]
    fn hs256_round_trip() {
        use jsonwebtoken::{EncodingKey, Header, encode};

        let claims = TokenClaims {
            sub: "alice".into(),
            iss: "https://issuer.example".into(),
            aud: Some("artifortress".into()),
            exp: (chrono_like_now() + 3600),
            scope: Some("repo:*:read".into()),
            extra: HashMap::new(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"shared-secret"),
        )
        .unwrap();

        let verified = verify_hs256(&token, "shared-secret", "https://issuer.example", Some("artifortress")).unwrap();
        assert_eq!(verified.sub, "alice");
    }

    #[test]
    fn hs256_rejects_wrong_secret() {
        use jsonwebtoken::{EncodingKey, Header, encode};

        let claims = TokenClaims {
            sub: "alice".into(),
            iss: "https://issuer.example".into(),
            aud: None,
            exp: chrono_like_now() + 3600,
            scope: None,
            extra: HashMap::new(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(b"right")).unwrap();
        assert!(verify_hs256(&token, "wrong", "https://issuer.example", None).is_err());
    }

    fn chrono_like_now() -> i64 {
        // avoids pulling chrono into this crate just for a test fixture
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }
}
