use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Request, State},
    http,
    middleware::Next,
    response::Response,
};
use ghlfs_common::{RepositoryIdentifier, UserInfo};

use crate::{
    context::Context,
    error::{Error, Result},
    handler::AppState,
    oidc::OidcAuthenticator,
    session::{basic_auth_session, session_cookie, SessionManager},
};

/// Resolves the caller's identity from request headers.
///
/// A bearer token always takes the OIDC path, even if a session cookie is
/// also present. Otherwise the session id comes from the cookie, or from
/// the password of Basic credentials stored by Git's credential helper.
pub struct Authenticator {
    oidc: Option<OidcAuthenticator>,
    sessions: Arc<SessionManager>,
}

impl Authenticator {
    pub fn new(oidc: Option<OidcAuthenticator>, sessions: Arc<SessionManager>) -> Self {
        Self { oidc, sessions }
    }

    pub async fn resolve(&self, ctx: &Context, headers: &http::HeaderMap) -> Result<UserInfo> {
        let authorization = headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if let Some(token) = authorization.and_then(|v| v.strip_prefix("Bearer ")) {
            let Some(oidc) = &self.oidc else {
                return Err(Error::OidcNotConfigured);
            };
            return oidc.authenticate(ctx, token.trim()).await;
        }

        let Some(id) = session_cookie(headers).or_else(|| basic_auth_session(headers)) else {
            return Err(Error::Unauthenticated);
        };
        self.sessions.load(ctx, &id).await
    }
}

/// Checks that the identity belongs to the repository named in the URL.
pub fn reconcile(user: &UserInfo, owner: &str, repo: &str) -> Result<RepositoryIdentifier> {
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    let url_repo =
        RepositoryIdentifier::new(owner, repo).map_err(|_| Error::InvalidRepositoryPath)?;
    match user.repository() {
        Some(user_repo) if url_repo.equals_fold(user_repo) => Ok(url_repo),
        _ => Err(Error::Forbidden),
    }
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let ctx = state.context();
    let user = state.authenticator.resolve(&ctx, req.headers()).await?;

    let owner = params.get("owner").map(String::as_str).unwrap_or_default();
    let repo = params.get("repo").map(String::as_str).unwrap_or_default();
    reconcile(&user, owner, repo)?;
    tracing::debug!(sub = user.sub(), owner, repo, "request authenticated");

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
