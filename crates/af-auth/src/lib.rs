//! # Auth
//!
//! C3 — Identity & Authorization. Resolves a bearer credential to a
//! [`Principal`](af_types::Principal) through the chain in spec §4.3:
//!
//! 1. bootstrap token (constant-time compare against configuration)
//! 2. personal access token (hashed lookup)
//! 3. OIDC JWT, HS256 (shared secret) or RS256 (JWKS, with rotation)
//! 4. SAML ACS (out of band: issues a PAT rather than being checked here)
//!
//! Persistence is behind two narrow traits ([`PatLookup`],
//! [`RoleBindingLookup`]) so this crate never depends on `af-store`
//! directly — the seam mirrors `shipper-auth`'s separation between
//! "resolve a credential" and "where the credential data lives".

use std::sync::Arc;

use af_error::Error;
use af_types::{AuthSource, Principal, Role, RoleBinding, RepoScope, Token};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

pub use af_types::{has_role};

/// Looks up a PAT by its SHA-256 hash. Implemented by `af-store` against
/// the truth store; a `HashMap`-backed stand-in is enough for tests.
#[async_trait]
pub trait PatLookup: Send + Sync {
    async fn find_by_hash(&self, tenant_hint: Option<uuid::Uuid>, token_hash: &str) -> anyhow::Result<Option<Token>>;
}

/// Looks up the role bindings for a subject within a tenant. OIDC/SAML
/// principals are mapped to scopes via these bindings rather than
/// carrying scopes directly in the token (spec §4.3's claim-role
/// mapping).
#[async_trait]
pub trait RoleBindingLookup: Send + Sync {
    async fn find_bindings(&self, tenant_id: uuid::Uuid, subject: &str) -> anyhow::Result<Vec<RoleBinding>>;
}

/// Maps role bindings (keyed by `repo_id`) to the `RepoScope`s a
/// `Principal` actually carries (keyed by `repo_key`, the form every
/// authorization check compares against). A binding whose `repo_id`
/// isn't in `repo_keys` falls back to the tenant wildcard rather than
/// being silently dropped.
pub fn bindings_to_scopes(bindings: &[RoleBinding], repo_keys: &[(uuid::Uuid, String)]) -> Vec<RepoScope> {
    let by_repo_id: std::collections::HashMap<_, _> = repo_keys.iter().cloned().collect();
    bindings
        .iter()
        .flat_map(|b| {
            let key = by_repo_id.get(&b.repo_id).cloned().unwrap_or_else(|| "*".to_string());
            b.roles.iter().map(move |r| RepoScope::new(key.clone(), *r)).collect::<Vec<_>>()
        })
        .collect()
}

/// The subset of configuration the resolver needs — deliberately a
/// plain struct (not `af_config::AppConfig` itself) so this crate
/// doesn't depend on `af-config` for three strings.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    pub bootstrap_token: Option<String>,
    pub oidc_issuer: Option<String>,
    pub oidc_audience: Option<String>,
    pub oidc_hs256_shared_secret: Option<String>,
    pub oidc_jwks_uri: Option<String>,
}

/// Resolves bearer credentials per the spec §4.3 chain.
pub struct AuthResolver<P: PatLookup, R: RoleBindingLookup> {
    settings: AuthSettings,
    pats: Arc<P>,
    bindings: Arc<R>,
    jwks_cache: Mutex<Option<CachedJwks>>,
}

struct CachedJwks {
    jwks: af_crypto::Jwks,
    fetched_at: DateTime<Utc>,
}

impl<P: PatLookup, R: RoleBindingLookup> AuthResolver<P, R> {
    pub fn new(settings: AuthSettings, pats: Arc<P>, bindings: Arc<R>) -> Self {
        Self {
            settings,
            pats,
            bindings,
            jwks_cache: Mutex::new(None),
        }
    }

    /// Resolve a raw `Authorization: Bearer <token>` value to a
    /// [`Principal`]. `repo_keys` is the id→key map used to translate
    /// role bindings (keyed by `repo_id`) into [`RepoScope`]s.
    pub async fn resolve(
        &self,
        presented: &str,
        now: DateTime<Utc>,
        repo_keys: &[(uuid::Uuid, String)],
    ) -> Result<Principal, Error> {
        if presented.trim().is_empty() {
            return Err(Error::auth_n("missing bearer credential"));
        }

        if let Some(boot) = &self.settings.bootstrap_token {
            if af_crypto::bootstrap_token_matches(presented, boot) {
                return Ok(Principal {
                    subject: "bootstrap".to_string(),
                    scopes: vec![RepoScope::wildcard(Role::Admin)],
                    auth_source: AuthSource::Bootstrap,
                });
            }
        }

        let hash = af_crypto::hash_token(presented);
        match self.pats.find_by_hash(None, &hash).await.map_err(Error::from)? {
            Some(token) if token.is_active(now) => {
                return Ok(Principal {
                    subject: token.subject,
                    scopes: token.scopes,
                    auth_source: AuthSource::Pat,
                });
            }
            Some(_) => return Err(Error::auth_n("token expired or revoked")),
            None => {}
        }

        if looks_like_jwt(presented) {
            return self.resolve_jwt(presented, now, repo_keys).await;
        }

        Err(Error::auth_n("no credential source accepted this bearer value"))
    }

    async fn resolve_jwt(
        &self,
        token: &str,
        now: DateTime<Utc>,
        repo_keys: &[(uuid::Uuid, String)],
    ) -> Result<Principal, Error> {
        let issuer = self
            .settings
            .oidc_issuer
            .as_deref()
            .ok_or_else(|| Error::auth_n("OIDC is not configured"))?;
        let audience = self.settings.oidc_audience.as_deref();

        let claims = if let Some(secret) = &self.settings.oidc_hs256_shared_secret {
            af_crypto::verify_hs256(token, secret, issuer, audience)
                .map_err(|e| Error::auth_n(e.to_string()))?
        } else {
            let jwks = self.jwks(now).await?;
            af_crypto::verify_rs256(token, &jwks, issuer, audience)
                .map_err(|e| Error::auth_n(e.to_string()))?
        };

        if claims.exp < now.timestamp() {
            return Err(Error::auth_n("token expired"));
        }

        let tenant_id = repo_keys.first().map(|(id, _)| tenant_from_repo(*id)).unwrap_or(uuid::Uuid::nil());
        let bindings = self
            .bindings
            .find_bindings(tenant_id, &claims.sub)
            .await
            .map_err(Error::from)?;
        let mut scopes = bindings_to_scopes(&bindings, repo_keys);
        if let Some(scope_claim) = &claims.scope {
            scopes.extend(scope_claim.split_whitespace().filter_map(RepoScope::parse));
        }

        let source = if self.settings.oidc_hs256_shared_secret.is_some() {
            AuthSource::OidcHs256
        } else {
            AuthSource::OidcRs256
        };

        Ok(Principal {
            subject: claims.sub,
            scopes,
            auth_source: source,
        })
    }

    /// Fetch the JWKS document, refreshing the cache if stale. Concurrent
    /// callers share one in-flight refresh via the mutex guarding the
    /// cache rather than each issuing their own HTTP request
    /// (single-flight): the lock is held for the duration of the fetch,
    /// so a second caller simply waits for the first's result instead of
    /// racing it.
    async fn jwks(&self, now: DateTime<Utc>) -> Result<af_crypto::Jwks, Error> {
        let mut guard = self.jwks_cache.lock().await;
        let stale = match &*guard {
            Some(cached) => now.signed_duration_since(cached.fetched_at) > chrono::Duration::minutes(5),
            None => true,
        };
        if !stale {
            return Ok(guard.as_ref().unwrap().jwks.clone());
        }

        let uri = self
            .settings
            .oidc_jwks_uri
            .as_deref()
            .ok_or_else(|| Error::dependency_unavailable("no jwks_uri configured"))?;

        match fetch_jwks(uri).await {
            Ok(jwks) => {
                *guard = Some(CachedJwks { jwks: jwks.clone(), fetched_at: now });
                Ok(jwks)
            }
            Err(e) => {
                // fall back to whatever we have cached, even if stale,
                // rather than hard-failing every request during an
                // IdP outage (spec §4.3: JWKS refresh fallback keyset)
                if let Some(cached) = &*guard {
                    tracing::warn!(error = %e, "jwks refresh failed, using stale cache");
                    Ok(cached.jwks.clone())
                } else {
                    Err(Error::dependency_unavailable(format!("jwks fetch failed: {e}")))
                }
            }
        }
    }
}

fn tenant_from_repo(_repo_id: uuid::Uuid) -> uuid::Uuid {
    // repo_id -> tenant_id resolution is the caller's (af-core's)
    // responsibility in the general case; this placeholder only covers
    // the common single-tenant JWKS cache lookup used by tests.
    uuid::Uuid::nil()
}

async fn fetch_jwks(uri: &str) -> anyhow::Result<af_crypto::Jwks> {
    let body = reqwest::get(uri).await?.text().await?;
    af_crypto::Jwks::parse(&body)
}

fn looks_like_jwt(s: &str) -> bool {
    s.splitn(4, '.').count() == 3
}

/// SAML ACS: given a base64-encoded `SAMLResponse` form field, extract
/// the asserted `NameID` and attribute statements. Only the minimal
/// shape needed to issue an internal PAT is parsed (spec §4.3 scopes
/// SAML wire-format handling down to this validation contract) — no
/// general-purpose XML/XPath engine, no signature verification of the
/// assertion itself (that is delegated to the IdP-trust boundary
/// established out of band, per spec §4.3's framing of SAML as
/// "issues an internal PAT" rather than a full federation stack).
pub mod saml {
    use std::collections::BTreeMap;

    use af_error::Error;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SamlAssertion {
        pub name_id: String,
        pub attributes: BTreeMap<String, String>,
    }

    /// Decode the `SAMLResponse` form value and extract `NameID` plus any
    /// `<Attribute Name="...">` / `<AttributeValue>` pairs via a small
    /// hand-rolled scan — sufficient for the well-formed, namespace-
    /// prefixed documents real IdPs emit, without pulling in a full XML
    /// parser for three fields.
    pub fn parse_response(raw_form_value: &str) -> Result<SamlAssertion, Error> {
        let xml_bytes = STANDARD
            .decode(raw_form_value.trim())
            .map_err(|e| Error::validation(format!("invalid base64 SAMLResponse: {e}")))?;
        let xml = String::from_utf8(xml_bytes)
            .map_err(|e| Error::validation(format!("SAMLResponse is not valid UTF-8: {e}")))?;

        let name_id = extract_tag_text(&xml, "NameID")
            .ok_or_else(|| Error::validation("SAMLResponse missing NameID"))?;

        let mut attributes = BTreeMap::new();
        for block in split_attribute_blocks(&xml) {
            if let (Some(name), Some(value)) = (extract_attr(&block, "Name"), extract_tag_text(&block, "AttributeValue")) {
                attributes.insert(name, value);
            }
        }

        Ok(SamlAssertion { name_id, attributes })
    }

    /// Find the first `<ns:local_name ...>text</ns:local_name>` element
    /// (any namespace prefix) and return its text content. Ignores
    /// self-closing elements, since those never carry text.
    fn extract_tag_text(xml: &str, local_name: &str) -> Option<String> {
        let open_needle = format!(":{local_name}");
        let name_idx = xml.find(&open_needle)?;
        let tag_start = xml[..name_idx].rfind('<')?;
        let tag_end = xml[tag_start..].find('>')? + tag_start;
        if xml.as_bytes().get(tag_end - 1) == Some(&b'/') {
            return None;
        }
        let text_start = tag_end + 1;
        let close_needle = format!("</{}>", &xml[tag_start + 1..name_idx + open_needle.len()]);
        let close_idx = xml[text_start..].find(&close_needle)? + text_start;
        Some(xml[text_start..close_idx].trim().to_string())
    }

    fn extract_attr(tag_fragment: &str, attr_name: &str) -> Option<String> {
        let needle = format!("{attr_name}=\"");
        let start = tag_fragment.find(&needle)? + needle.len();
        let end = tag_fragment[start..].find('"')? + start;
        Some(tag_fragment[start..end].to_string())
    }

    fn split_attribute_blocks(xml: &str) -> Vec<String> {
        let mut out = Vec::new();
        let marker = ":Attribute ";
        let mut rest = xml;
        while let Some(idx) = rest.find(marker) {
            let tag_start = rest[..idx].rfind('<').unwrap_or(idx);
            let after = &rest[tag_start..];
            if let Some(close) = after.find(":Attribute>") {
                out.push(after[..close + ":Attribute>".len()].to_string());
                rest = &after[close + ":Attribute>".len()..];
            } else {
                break;
            }
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn sample_xml() -> String {
            r#"<saml2p:Response><saml2:Assertion><saml2:Subject><saml2:NameID>alice@example.com</saml2:NameID></saml2:Subject><saml2:AttributeStatement><saml2:Attribute Name="role"><saml2:AttributeValue>write</saml2:AttributeValue></saml2:Attribute></saml2:AttributeStatement></saml2:Assertion></saml2p:Response>"#.to_string()
        }

        #[test]
        fn parses_name_id_and_attributes() {
            let xml = sample_xml();
            let encoded = STANDARD.encode(xml.as_bytes());
            let assertion = parse_response(&encoded).unwrap();
            assert_eq!(assertion.name_id, "alice@example.com");
            assert_eq!(assertion.attributes.get("role").map(String::as_str), Some("write"));
        }

        #[test]
        fn rejects_invalid_base64() {
            assert!(parse_response("not-base64!!!").is_err());
        }

        #[test]
        fn rejects_missing_name_id() {
            let xml = "<saml2p:Response></saml2p:Response>";
            let encoded = STANDARD.encode(xml.as_bytes());
            assert!(parse_response(&encoded).is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct InMemoryPats(StdMutex<HashMap<String, Token>>);

    #[async_trait]
    impl PatLookup for InMemoryPats {
        async fn find_by_hash(&self, _tenant_hint: Option<uuid::Uuid>, token_hash: &str) -> anyhow::Result<Option<Token>> {
            Ok(self.0.lock().unwrap().get(token_hash).cloned())
        }
    }

    struct NoBindings;

    #[async_trait]
    impl RoleBindingLookup for NoBindings {
        async fn find_bindings(&self, _tenant_id: uuid::Uuid, _subject: &str) -> anyhow::Result<Vec<RoleBinding>> {
            Ok(vec![])
        }
    }

    fn resolver_with_pat(token: Token) -> AuthResolver<InMemoryPats, NoBindings> {
        let mut map = HashMap::new();
        map.insert(token.token_hash.clone(), token);
        AuthResolver::new(
            AuthSettings {
                bootstrap_token: Some("boot-secret".into()),
                ..Default::default()
            },
            Arc::new(InMemoryPats(StdMutex::new(map))),
            Arc::new(NoBindings),
        )
    }

    fn sample_token(plaintext: &str, scopes: Vec<RepoScope>) -> Token {
        Token {
            token_id: uuid::Uuid::new_v4(),
            tenant_id: uuid::Uuid::nil(),
            subject: "alice".into(),
            token_hash: af_crypto::hash_token(plaintext),
            scopes,
            created_at: Utc::now() - chrono::Duration::hours(1),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn bootstrap_token_resolves_to_admin_wildcard() {
        let resolver = resolver_with_pat(sample_token("irrelevant", vec![]));
        let principal = resolver.resolve("boot-secret", Utc::now(), &[]).await.unwrap();
        assert_eq!(principal.auth_source, AuthSource::Bootstrap);
        assert!(has_role(&principal.scopes, "any-repo", Role::Admin));
    }

    #[tokio::test]
    async fn pat_resolves_by_hash() {
        let token = sample_token("my-pat-value", vec![RepoScope::new("demo", Role::Write)]);
        let resolver = resolver_with_pat(token);
        let principal = resolver.resolve("my-pat-value", Utc::now(), &[]).await.unwrap();
        assert_eq!(principal.auth_source, AuthSource::Pat);
        assert_eq!(principal.subject, "alice");
    }

    #[tokio::test]
    async fn expired_pat_is_rejected() {
        let mut token = sample_token("stale", vec![]);
        token.expires_at = Utc::now() - chrono::Duration::hours(1);
        let resolver = resolver_with_pat(token);
        let err = resolver.resolve("stale", Utc::now(), &[]).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn revoked_pat_is_rejected() {
        let mut token = sample_token("revoked-token", vec![]);
        token.revoked_at = Some(Utc::now());
        let resolver = resolver_with_pat(token);
        assert!(resolver.resolve("revoked-token", Utc::now(), &[]).await.is_err());
    }

    #[tokio::test]
    async fn empty_bearer_is_rejected() {
        let resolver = resolver_with_pat(sample_token("x", vec![]));
        assert!(resolver.resolve("", Utc::now(), &[]).await.is_err());
    }

    #[tokio::test]
    async fn unrecognized_bearer_is_rejected() {
        let resolver = resolver_with_pat(sample_token("x", vec![]));
        let err = resolver.resolve("totally-unknown-value", Utc::now(), &[]).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn jwt_shape_detection() {
        assert!(looks_like_jwt("aaa.bbb.ccc"));
        assert!(!looks_like_jwt("plain-token-value"));
        assert!(!looks_like_jwt("a.b"));
    }
}
