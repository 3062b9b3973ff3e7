//! GitHub Actions OIDC bearer tokens.

use std::sync::Arc;

use async_trait::async_trait;
use ghlfs_common::{Provider, RepositoryIdentifier, RepositoryPermissions, UserInfo};
use jsonwebtoken::{jwk::JwkSet, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::{
    context::Context,
    error::{Error, Result},
};

pub const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// The claims of a GitHub Actions token that the server cares about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitHubClaims {
    pub sub: String,
    pub repository: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    #[serde(default)]
    pub actor: String,
}

#[async_trait]
pub trait OidcVerifier: Send + Sync {
    /// Checks signature, issuer, audience and expiry. Any failure is
    /// reported as [`Error::InvalidToken`].
    async fn verify(&self, ctx: &Context, token: &str) -> Result<GitHubClaims>;
}

/// Turns a verified CI token into a [`UserInfo`] for an allowlisted
/// repository.
pub struct OidcAuthenticator {
    verifier: Arc<dyn OidcVerifier>,
    allowed: Vec<RepositoryIdentifier>,
}

impl OidcAuthenticator {
    pub fn new(verifier: Arc<dyn OidcVerifier>, allowed: Vec<RepositoryIdentifier>) -> Self {
        Self { verifier, allowed }
    }

    pub async fn authenticate(&self, ctx: &Context, token: &str) -> Result<UserInfo> {
        let claims = self.verifier.verify(ctx, token).await?;
        let repository: RepositoryIdentifier = claims
            .repository
            .parse()
            .map_err(|_| Error::InvalidToken("malformed repository claim".to_string()))?;

        if !self.allowed.iter().any(|r| r.equals_fold(&repository)) {
            tracing::debug!(%repository, "OIDC token for repository outside allowlist");
            return Err(Error::RepositoryNotAllowed);
        }

        let user = UserInfo::new(claims.sub, "", claims.actor, Provider::GitHub)
            .map_err(|_| Error::InvalidToken("empty subject".to_string()))?
            .with_repository(repository)
            .with_ref(claims.git_ref)
            .with_permissions(RepositoryPermissions::full());
        Ok(user)
    }
}

/// Verifies tokens against GitHub's published signing keys. The key set is
/// cached and refetched when a token names an unknown key id.
pub struct GitHubOidcVerifier {
    http: reqwest::Client,
    jwks_url: String,
    issuer: String,
    audience: String,
    keys: RwLock<Option<JwkSet>>,
}

impl GitHubOidcVerifier {
    pub fn new(http: reqwest::Client, audience: String) -> Self {
        Self {
            http,
            jwks_url: format!("{GITHUB_ACTIONS_ISSUER}/.well-known/jwks"),
            issuer: GITHUB_ACTIONS_ISSUER.to_string(),
            audience,
            keys: RwLock::new(None),
        }
    }

    async fn fetch_keys(&self) -> Result<JwkSet> {
        let keys = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::internal("failed to fetch OIDC signing keys", e))?
            .json::<JwkSet>()
            .await
            .map_err(|e| Error::internal("failed to decode OIDC signing keys", e))?;
        *self.keys.write().await = Some(keys.clone());
        Ok(keys)
    }

    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        let cached = self.keys.read().await.clone();
        let keys = match cached {
            Some(keys) if keys.find(kid).is_some() => keys,
            _ => self.fetch_keys().await?,
        };
        let jwk = keys
            .find(kid)
            .ok_or_else(|| Error::InvalidToken(format!("unknown key id {kid}")))?;
        DecodingKey::from_jwk(jwk).map_err(|e| Error::InvalidToken(e.to_string()))
    }
}

#[async_trait]
impl OidcVerifier for GitHubOidcVerifier {
    async fn verify(&self, _ctx: &Context, token: &str) -> Result<GitHubClaims> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| Error::InvalidToken(e.to_string()))?;
        let Some(kid) = header.kid else {
            return Err(Error::InvalidToken("missing key id".to_string()));
        };
        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);
        let data = jsonwebtoken::decode::<GitHubClaims>(token, &key, &validation)
            .map_err(|e| Error::InvalidToken(e.to_string()))?;
        Ok(data.claims)
    }
}
