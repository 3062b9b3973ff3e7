mod api;
mod authn;
mod authz;
mod batch;
mod config;
mod context;
mod credential;
mod error;
mod handler;
mod health;
mod model;
mod oauth;
mod oidc;
mod proxy;
mod session;
mod storage;
mod store;
mod transfer;

#[cfg(test)]
mod testing;

use std::{process::ExitCode, sync::Arc};

use anyhow::Context as _;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use authn::Authenticator;
use authz::Authorizer;
use batch::BatchService;
use config::Config;
use context::SystemClock;
use handler::{router, AppState};
use health::HealthCheck;
use oauth::{GitHubOAuth, OAuthService};
use oidc::{GitHubOidcVerifier, OidcAuthenticator};
use proxy::ProxyTransfer;
use session::SessionManager;
use storage::S3Storage;
use store::{MemoryKv, MemoryMetadataStore, MemoryPolicyStore};
use transfer::TransferPlanner;

const DEFAULT_LOG_FILTER: &str = "ghlfs_server=info,tower_http=info";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let conf = match Config::load() {
        Ok(conf) => conf,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
    };

    match run(conf).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn build_state(conf: Config) -> anyhow::Result<AppState> {
    let default_redirect_uri = conf
        .github
        .redirect_uris
        .first()
        .cloned()
        .context("no OAuth redirect URI configured")?;
    let http = reqwest::Client::builder()
        .build()
        .context("failed to create HTTP client")?;

    let metadata = Arc::new(MemoryMetadataStore::new());
    let policies = Arc::new(MemoryPolicyStore::new());
    let kv = Arc::new(MemoryKv::new());
    let storage = Arc::new(S3Storage::new(conf.s3_client, conf.s3_bucket));

    let authz = Arc::new(Authorizer::new(policies.clone()));
    let planner = Arc::new(TransferPlanner::new(
        metadata.clone(),
        storage.clone(),
        kv.clone(),
        conf.transfer_mode,
    ));
    let sessions = Arc::new(SessionManager::new(kv.clone()));

    let oidc = match conf.oidc {
        Some(oidc) => {
            tracing::info!(
                repositories = oidc.allowed_repositories.len(),
                "OIDC bearer authentication enabled"
            );
            Some(OidcAuthenticator::new(
                Arc::new(GitHubOidcVerifier::new(http.clone(), oidc.audience)),
                oidc.allowed_repositories,
            ))
        }
        None => None,
    };
    let provider = GitHubOAuth::new(http, conf.github.client_id, conf.github.client_secret);

    Ok(AppState {
        base_url: conf.base_url,
        clock: Arc::new(SystemClock),
        batch: BatchService::new(authz.clone(), planner.clone(), policies),
        proxy: ProxyTransfer::new(authz.clone(), metadata, storage.clone(), conf.proxy_timeout),
        authz,
        planner,
        authenticator: Authenticator::new(oidc, sessions.clone()),
        oauth: OAuthService::new(
            Arc::new(provider),
            kv,
            sessions.clone(),
            conf.github.redirect_uris,
        ),
        sessions,
        default_redirect_uri,
        secure_cookies: conf.secure_cookies,
        health_checks: vec![storage as Arc<dyn HealthCheck>],
    })
}

async fn run(conf: Config) -> anyhow::Result<()> {
    let (host, port) = conf.listen_addr.clone();
    let transfer_mode = conf.transfer_mode;
    let state = Arc::new(build_state(conf)?);

    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("failed to listen on {host}:{port}"))?;
    tracing::info!(%host, port, ?transfer_mode, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("error serving")
}
