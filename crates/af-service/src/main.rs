//! Artifortress's HTTP edge: loads configuration from the environment,
//! wires C1-C10 together behind [`af_core::ArtifortressCore`], serves
//! the spec §6 surface, and runs the outbox/search-job sweeper loop in
//! the background.

#![deny(unsafe_code)]

use std::sync::Arc;

use af_auth::AuthSettings;
use af_config::{AppConfig, LogFormat};
use af_core::ArtifortressCore;
use af_objectstore::{ObjectStore, S3CompatibleObjectStore, S3Credentials};
use af_policy::PolicyTimeoutConfig;
use af_service::{build_app, AppState};
use af_store::{PgTruthStore, TruthStore};
use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration from environment")?;
    init_tracing(&config.log);

    let store: Arc<dyn TruthStore> = Arc::new(
        PgTruthStore::connect(&config.postgres.connection_string, config.postgres.max_connections)
            .await
            .context("connecting to postgres")?,
    );
    let objects: Arc<dyn ObjectStore> = Arc::new(S3CompatibleObjectStore::new(S3Credentials {
        endpoint: config.object_storage.endpoint.clone(),
        bucket: config.object_storage.bucket.clone(),
        access_key_id: config.object_storage.access_key_id.clone(),
        secret_access_key: config.object_storage.secret_access_key.clone(),
    }));

    let auth_settings = AuthSettings {
        bootstrap_token: config.auth.bootstrap_token.clone(),
        oidc_issuer: config.oidc.issuer.clone(),
        oidc_audience: config.oidc.audience.clone(),
        oidc_hs256_shared_secret: config.oidc.hs256_shared_secret.clone(),
        oidc_jwks_uri: config.oidc.jwks_uri.clone(),
    };

    let core = Arc::new(ArtifortressCore::new(
        store,
        objects,
        auth_settings,
        chrono::Duration::hours(24),
        PolicyTimeoutConfig::default(),
        af_outbox::SweepConfig {
            claim_batch_size: config.outbox.claim_batch_size,
            max_attempts: config.outbox.max_attempts,
            backoff_base: config.outbox.backoff_base,
            backoff_max_exponent: config.outbox.backoff_max_exponent,
            backoff_cap: config.outbox.backoff_cap,
        },
    ));

    tokio::spawn(run_sweep_loop(core.clone(), config.outbox.sweep_interval));

    let app = build_app(Arc::new(AppState { core }));
    let bind = env_or("Http__Bind", "0.0.0.0:8080");
    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("binding {bind}"))?;
    info!(bind = %bind, "af-service listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")
}

/// Drives C7's producer and consumer sweeps on a fixed interval. Each
/// iteration's failure is logged and swallowed — a transient outage in
/// the truth store shouldn't kill the whole process, just this tick.
async fn run_sweep_loop(core: Arc<ArtifortressCore>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();
        match core.sweep_outbox(now).await {
            Ok(report) => {
                if report.claimed_count > 0 {
                    info!(claimed = report.claimed_count, enqueued = report.enqueued_count, requeued = report.requeued_count, "outbox sweep");
                }
            }
            Err(err) => warn!(error = %err, "outbox sweep failed"),
        }
        match core.sweep_search_jobs(now).await {
            Ok(report) => {
                if report.claimed_count > 0 {
                    info!(claimed = report.claimed_count, completed = report.completed_count, retried = report.retried_count, terminal = report.terminal_failed_count, "search job sweep");
                }
            }
            Err(err) => warn!(error = %err, "search job sweep failed"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install ctrl-c handler");
    }
}

fn init_tracing(log: &af_config::LogConfig) {
    let filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match log.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}
