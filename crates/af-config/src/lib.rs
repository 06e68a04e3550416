//! # Config
//!
//! Environment-driven configuration for every Artifortress component.
//! Each section gets its own `*Config::from_env()`, reading
//! double-underscore hierarchical variables
//! (`ConnectionStrings__Postgres`, `ObjectStorage__PresignPartTtlSeconds`,
//! ...) directly with `std::env::var`, the same shape
//! `shipper-storage`'s `config_from_env` used for its own env-driven
//! backend selection — no config file format, no layered merge, just
//! env vars with defaults.
//!
//! Every loader is independently unit-testable with `temp-env`, so a
//! test can set exactly the variables it cares about without leaking
//! into the rest of the process's environment.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
    }
}

/// `ConnectionStrings__Postgres`, `Postgres__MaxConnections`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    pub fn from_env() -> Result<Self> {
        let connection_string = env_var("ConnectionStrings__Postgres")
            .context("ConnectionStrings__Postgres is required")?;
        let max_connections = parse_env("Postgres__MaxConnections", 10u32)?;
        Ok(Self {
            connection_string,
            max_connections,
        })
    }
}

/// `ObjectStorage__Endpoint`, `ObjectStorage__Bucket`,
/// `ObjectStorage__AccessKeyId`, `ObjectStorage__SecretAccessKey`,
/// `ObjectStorage__PresignPartTtlSeconds` (spec §4.2: clamped into
/// `[60, 3600]`, default 900).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub presign_part_ttl: Duration,
}

const PRESIGN_TTL_MIN_SECS: u64 = 60;
const PRESIGN_TTL_MAX_SECS: u64 = 3600;
const PRESIGN_TTL_DEFAULT_SECS: u64 = 900;

impl ObjectStorageConfig {
    pub fn from_env() -> Result<Self> {
        let endpoint =
            env_var("ObjectStorage__Endpoint").context("ObjectStorage__Endpoint is required")?;
        let bucket = env_var("ObjectStorage__Bucket").context("ObjectStorage__Bucket is required")?;
        let access_key_id = env_or("ObjectStorage__AccessKeyId", "");
        let secret_access_key = env_or("ObjectStorage__SecretAccessKey", "");
        let raw_ttl = parse_env("ObjectStorage__PresignPartTtlSeconds", PRESIGN_TTL_DEFAULT_SECS)?;
        let clamped = raw_ttl.clamp(PRESIGN_TTL_MIN_SECS, PRESIGN_TTL_MAX_SECS);
        Ok(Self {
            endpoint,
            bucket,
            access_key_id,
            secret_access_key,
            presign_part_ttl: Duration::from_secs(clamped),
        })
    }
}

/// `Auth__BootstrapToken`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub bootstrap_token: Option<String>,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bootstrap_token: env_var("Auth__BootstrapToken"),
        })
    }
}

/// `Oidc__Issuer`, `Oidc__Audience`, `Oidc__JwksUri`,
/// `Oidc__Hs256SharedSecret`, `Oidc__JwksRefreshIntervalSeconds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcConfig {
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub jwks_uri: Option<String>,
    pub hs256_shared_secret: Option<String>,
    pub jwks_refresh_interval: Duration,
}

impl OidcConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            issuer: env_var("Oidc__Issuer"),
            audience: env_var("Oidc__Audience"),
            jwks_uri: env_var("Oidc__JwksUri"),
            hs256_shared_secret: env_var("Oidc__Hs256SharedSecret"),
            jwks_refresh_interval: Duration::from_secs(parse_env(
                "Oidc__JwksRefreshIntervalSeconds",
                300u64,
            )?),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.issuer.is_some() && (self.jwks_uri.is_some() || self.hs256_shared_secret.is_some())
    }
}

/// `Saml__IdpMetadataUrl`, `Saml__SpEntityId`, `Saml__AcsUrl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlConfig {
    pub idp_metadata_url: Option<String>,
    pub sp_entity_id: Option<String>,
    pub acs_url: Option<String>,
}

impl SamlConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            idp_metadata_url: env_var("Saml__IdpMetadataUrl"),
            sp_entity_id: env_var("Saml__SpEntityId"),
            acs_url: env_var("Saml__AcsUrl"),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.idp_metadata_url.is_some() && self.sp_entity_id.is_some()
    }
}

/// `Gc__TombstoneRetentionDays`, `Gc__BatchSize`, `Gc__RetentionGraceHours`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    pub tombstone_retention_days: u32,
    pub batch_size: u32,
    /// Default `graceHours` used when a GC run request omits the field.
    pub retention_grace_hours: u32,
}

impl GcConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            tombstone_retention_days: parse_env("Gc__TombstoneRetentionDays", 30u32)?,
            batch_size: parse_env("Gc__BatchSize", 500u32)?,
            retention_grace_hours: parse_env("Gc__RetentionGraceHours", 0u32)?,
        })
    }
}

/// `Outbox__SweepIntervalSeconds`, `Outbox__ClaimBatchSize`,
/// `Outbox__MaxAttempts`, `Outbox__BackoffBaseSeconds`,
/// `Outbox__BackoffMaxExponent`, `Outbox__BackoffCapSeconds` (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxConfig {
    pub sweep_interval: Duration,
    pub claim_batch_size: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max_exponent: u32,
    pub backoff_cap: Duration,
}

impl OutboxConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            sweep_interval: Duration::from_secs(parse_env("Outbox__SweepIntervalSeconds", 5u64)?),
            claim_batch_size: parse_env("Outbox__ClaimBatchSize", 100u32)?,
            max_attempts: parse_env("Outbox__MaxAttempts", 8u32)?,
            backoff_base: Duration::from_secs(parse_env("Outbox__BackoffBaseSeconds", 1u64)?),
            backoff_max_exponent: parse_env("Outbox__BackoffMaxExponent", 6u32)?,
            backoff_cap: Duration::from_secs(parse_env("Outbox__BackoffCapSeconds", 300u64)?),
        })
    }
}

/// `Log__Format` (`json` | `pretty`), `Log__Level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

impl LogConfig {
    pub fn from_env() -> Result<Self> {
        let format = match env_or("Log__Format", "pretty").to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        Ok(Self {
            format,
            level: env_or("Log__Level", "info"),
        })
    }
}

/// Everything wired together, the shape `af-service`'s `main` loads once
/// at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub postgres: PostgresConfig,
    pub object_storage: ObjectStorageConfig,
    pub auth: AuthConfig,
    pub oidc: OidcConfig,
    pub saml: SamlConfig,
    pub gc: GcConfig,
    pub outbox: OutboxConfig,
    pub log: LogConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            postgres: PostgresConfig::from_env()?,
            object_storage: ObjectStorageConfig::from_env()?,
            auth: AuthConfig::from_env()?,
            oidc: OidcConfig::from_env()?,
            saml: SamlConfig::from_env()?,
            gc: GcConfig::from_env()?,
            outbox: OutboxConfig::from_env()?,
            log: LogConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_requires_connection_string() {
        temp_env::with_vars_unset(["ConnectionStrings__Postgres"], || {
            assert!(PostgresConfig::from_env().is_err());
        });
    }

    #[test]
    fn postgres_reads_max_connections_default() {
        temp_env::with_vars(
            [("ConnectionStrings__Postgres", Some("postgres://localhost/af"))],
            || {
                let cfg = PostgresConfig::from_env().unwrap();
                assert_eq!(cfg.max_connections, 10);
            },
        );
    }

    #[test]
    fn object_storage_ttl_clamps_low() {
        temp_env::with_vars(
            [
                ("ObjectStorage__Endpoint", Some("http://localhost:9000")),
                ("ObjectStorage__Bucket", Some("artifacts")),
                ("ObjectStorage__PresignPartTtlSeconds", Some("5")),
            ],
            || {
                let cfg = ObjectStorageConfig::from_env().unwrap();
                assert_eq!(cfg.presign_part_ttl, Duration::from_secs(60));
            },
        );
    }

    #[test]
    fn object_storage_ttl_clamps_high() {
        temp_env::with_vars(
            [
                ("ObjectStorage__Endpoint", Some("http://localhost:9000")),
                ("ObjectStorage__Bucket", Some("artifacts")),
                ("ObjectStorage__PresignPartTtlSeconds", Some("999999")),
            ],
            || {
                let cfg = ObjectStorageConfig::from_env().unwrap();
                assert_eq!(cfg.presign_part_ttl, Duration::from_secs(3600));
            },
        );
    }

    #[test]
    fn object_storage_ttl_default_is_900() {
        temp_env::with_vars(
            [
                ("ObjectStorage__Endpoint", Some("http://localhost:9000")),
                ("ObjectStorage__Bucket", Some("artifacts")),
            ],
            || {
                temp_env::with_vars_unset(["ObjectStorage__PresignPartTtlSeconds"], || {
                    let cfg = ObjectStorageConfig::from_env().unwrap();
                    assert_eq!(cfg.presign_part_ttl, Duration::from_secs(900));
                });
            },
        );
    }

    #[test]
    fn oidc_is_configured_needs_issuer_and_key_source() {
        let cfg = OidcConfig {
            issuer: Some("https://issuer.example".into()),
            audience: None,
            jwks_uri: None,
            hs256_shared_secret: None,
            jwks_refresh_interval: Duration::from_secs(300),
        };
        assert!(!cfg.is_configured());

        let cfg = OidcConfig {
            hs256_shared_secret: Some("shh".into()),
            ..cfg
        };
        assert!(cfg.is_configured());
    }

    #[test]
    fn log_format_defaults_to_pretty() {
        temp_env::with_vars_unset(["Log__Format"], || {
            let cfg = LogConfig::from_env().unwrap();
            assert_eq!(cfg.format, LogFormat::Pretty);
        });
    }

    #[test]
    fn log_format_reads_json() {
        temp_env::with_vars([("Log__Format", Some("json"))], || {
            let cfg = LogConfig::from_env().unwrap();
            assert_eq!(cfg.format, LogFormat::Json);
        });
    }
}
