//! Interactive GitHub login.
//!
//! Login parks the requested repository and redirect URI under a random
//! state token. The callback consumes that token exactly once, exchanges the
//! code, checks the user's permissions on the repository and mints a session.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use ghlfs_common::{Provider, RepositoryIdentifier, RepositoryPermissions, UserInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    context::Context,
    error::{Error, Result, StoreError},
    session::SessionManager,
    store::BlobStore,
};

pub const STATE_TTL: Duration = Duration::from_secs(10 * 60);
pub const SCOPES: &[&str] = &["repo"];

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderUser {
    pub id: u64,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn authorization_url(
        &self,
        state: &str,
        redirect_uri: &str,
        scopes: &[&str],
    ) -> Result<String, ProviderError>;
    /// Exchanges an authorization code for an access token.
    async fn exchange_code(
        &self,
        ctx: &Context,
        code: &str,
        redirect_uri: &str,
    ) -> Result<String, ProviderError>;
    async fn fetch_user(&self, ctx: &Context, token: &str) -> Result<ProviderUser, ProviderError>;
    async fn fetch_repository_permissions(
        &self,
        ctx: &Context,
        token: &str,
        repository: &RepositoryIdentifier,
    ) -> Result<RepositoryPermissions, ProviderError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct OAuthState {
    repository: String,
    redirect_uri: String,
}

fn state_key(state: &str) -> String {
    format!("oauth-state:{state}")
}

pub struct OAuthService {
    provider: Arc<dyn OAuthProvider>,
    states: Arc<dyn BlobStore>,
    sessions: Arc<SessionManager>,
    allowed_redirects: Vec<String>,
}

impl OAuthService {
    pub fn new(
        provider: Arc<dyn OAuthProvider>,
        states: Arc<dyn BlobStore>,
        sessions: Arc<SessionManager>,
        allowed_redirects: Vec<String>,
    ) -> Self {
        Self {
            provider,
            states,
            sessions,
            allowed_redirects,
        }
    }

    /// Returns the upstream authorization URL the user should be sent to.
    pub async fn start_authentication(
        &self,
        _ctx: &Context,
        repository: Option<&RepositoryIdentifier>,
        redirect_uri: &str,
    ) -> Result<String> {
        let repository = repository.ok_or(Error::InvalidRepository)?;
        if redirect_uri.is_empty() || !self.allowed_redirects.iter().any(|r| r == redirect_uri) {
            return Err(Error::InvalidRedirectUri);
        }

        let state = ghlfs_common::random_token();
        let parked = serde_json::to_vec(&OAuthState {
            repository: repository.to_string(),
            redirect_uri: redirect_uri.to_string(),
        })
        .map_err(|e| Error::StateSaveFailed(StoreError::Backend(e.to_string())))?;
        self.states
            .put(&state_key(&state), parked, STATE_TTL)
            .await
            .map_err(Error::StateSaveFailed)?;

        self.provider
            .authorization_url(&state, redirect_uri, SCOPES)
            .map_err(|e| Error::internal("failed to build authorization URL", e))
    }

    /// Completes the login and returns the new session id.
    pub async fn handle_callback(&self, ctx: &Context, code: &str, state: &str) -> Result<String> {
        if code.is_empty() {
            return Err(Error::InvalidCode);
        }
        if state.is_empty() {
            return Err(Error::InvalidState);
        }

        let parked = match self.states.take(&state_key(state)).await {
            Ok(Some(parked)) => parked,
            Ok(None) | Err(StoreError::NotFound) => return Err(Error::InvalidState),
            Err(e) => return Err(Error::internal("state lookup failed", e)),
        };
        let parked: OAuthState =
            serde_json::from_slice(&parked).map_err(|_| Error::InvalidState)?;
        let repository: RepositoryIdentifier = parked
            .repository
            .parse()
            .map_err(|_| Error::InvalidRepository)?;

        let token = self
            .provider
            .exchange_code(ctx, code, &parked.redirect_uri)
            .await
            .map_err(|e| Error::CodeExchangeFailed(e.to_string()))?;
        let profile = self
            .provider
            .fetch_user(ctx, &token)
            .await
            .map_err(|e| Error::UserInfoFailed(e.to_string()))?;
        let permissions = self
            .provider
            .fetch_repository_permissions(ctx, &token, &repository)
            .await
            .map_err(|e| Error::RepositoryAccessCheckFailed(e.to_string()))?;
        if !permissions.can_upload() && !permissions.can_download() {
            tracing::info!(user = %profile.login, %repository, "login denied: no repository access");
            return Err(Error::RepositoryAccessDenied);
        }

        let name = profile.name.unwrap_or_default();
        let user = UserInfo::new(profile.id.to_string(), "", name, Provider::GitHub)
            .map_err(Error::UserInfoCreationFailed)?
            .with_repository(repository.clone())
            .with_permissions(permissions);
        let session = self
            .sessions
            .create(ctx, &user)
            .await
            .map_err(Error::SessionCreationFailed)?;
        tracing::info!(user = %profile.login, %repository, "login succeeded");
        Ok(session)
    }
}

// ----------------------------- GitHub ------------------------------

const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("ghlfs-server/", env!("CARGO_PKG_VERSION"));

pub struct GitHubOAuth {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct RepositoryResponse {
    #[serde(default)]
    permissions: Option<RepositoryPermissions>,
}

impl GitHubOAuth {
    pub fn new(http: reqwest::Client, client_id: String, client_secret: String) -> Self {
        Self {
            http,
            client_id,
            client_secret,
        }
    }

    fn api_get(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{GITHUB_API_URL}{path}"))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .bearer_auth(token)
    }
}

#[async_trait]
impl OAuthProvider for GitHubOAuth {
    fn authorization_url(
        &self,
        state: &str,
        redirect_uri: &str,
        scopes: &[&str],
    ) -> Result<String, ProviderError> {
        let scope = scopes.join(" ");
        let url = reqwest::Url::parse_with_params(
            GITHUB_AUTHORIZE_URL,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| ProviderError::Rejected(e.to_string()))?;
        Ok(url.into())
    }

    async fn exchange_code(
        &self,
        _ctx: &Context,
        code: &str,
        redirect_uri: &str,
    ) -> Result<String, ProviderError> {
        let resp: TokenResponse = self
            .http
            .post(GITHUB_TOKEN_URL)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match resp {
            TokenResponse {
                access_token: Some(token),
                ..
            } if !token.is_empty() => Ok(token),
            TokenResponse {
                error,
                error_description,
                ..
            } => Err(ProviderError::Rejected(
                error_description
                    .or(error)
                    .unwrap_or_else(|| "no access token in response".to_string()),
            )),
        }
    }

    async fn fetch_user(&self, _ctx: &Context, token: &str) -> Result<ProviderUser, ProviderError> {
        Ok(self
            .api_get("/user", token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn fetch_repository_permissions(
        &self,
        _ctx: &Context,
        token: &str,
        repository: &RepositoryIdentifier,
    ) -> Result<RepositoryPermissions, ProviderError> {
        let path = format!("/repos/{}/{}", repository.owner(), repository.name());
        let resp = self.api_get(&path, token).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            // GitHub hides repositories the token cannot see.
            return Ok(RepositoryPermissions::default());
        }
        let resp: RepositoryResponse = resp.error_for_status()?.json().await?;
        Ok(resp.permissions.unwrap_or_default())
    }
}
