use std::{sync::Arc, time::Duration};

use axum::http;
use base64::{prelude::BASE64_STANDARD, Engine};
use ghlfs_common::{Provider, RepositoryPermissions, UserInfo};
use serde::{Deserialize, Serialize};

use crate::{
    context::Context,
    error::{Error, Result, StoreError},
    store::BlobStore,
};

pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const SESSION_COOKIE: &str = "ghlfs_session";

/// Stored form of an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub sub: String,
    pub email: String,
    pub name: String,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<RepositoryPermissions>,
}

impl From<&UserInfo> for SessionData {
    fn from(user: &UserInfo) -> Self {
        Self {
            sub: user.sub().to_string(),
            email: user.email().to_string(),
            name: user.name().to_string(),
            provider: user.provider(),
            repository: user.repository().map(ToString::to_string),
            git_ref: Some(user.git_ref().to_string()).filter(|r| !r.is_empty()),
            permissions: user.permissions().copied(),
        }
    }
}

impl TryFrom<SessionData> for UserInfo {
    type Error = Error;

    fn try_from(data: SessionData) -> Result<Self> {
        let mut user = UserInfo::new(data.sub, data.email, data.name, data.provider)
            .map_err(|_| Error::InvalidSessionData)?;
        if let Some(repository) = data.repository {
            let repository = repository.parse().map_err(|_| Error::InvalidSessionData)?;
            user = user.with_repository(repository);
        }
        if let Some(git_ref) = data.git_ref {
            user = user.with_ref(git_ref);
        }
        if let Some(permissions) = data.permissions {
            user = user.with_permissions(permissions);
        }
        Ok(user)
    }
}

fn session_key(id: &str) -> String {
    format!("session:{id}")
}

pub struct SessionManager {
    blobs: Arc<dyn BlobStore>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            ttl: SESSION_TTL,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores the user under a fresh random identifier and returns it.
    pub async fn create(&self, _ctx: &Context, user: &UserInfo) -> Result<String, StoreError> {
        let id = ghlfs_common::random_token();
        let data = serde_json::to_vec(&SessionData::from(user))
            .map_err(|e| StoreError::Backend(format!("failed to encode session: {e}")))?;
        self.blobs.put(&session_key(&id), data, self.ttl).await?;
        Ok(id)
    }

    pub async fn load(&self, _ctx: &Context, id: &str) -> Result<UserInfo> {
        if id.is_empty() {
            return Err(Error::SessionNotFound);
        }
        let data = match self.blobs.get(&session_key(id)).await {
            Ok(Some(data)) => data,
            Ok(None) | Err(StoreError::NotFound) => return Err(Error::SessionNotFound),
            Err(e) => return Err(Error::internal("session lookup failed", e)),
        };
        let data: SessionData =
            serde_json::from_slice(&data).map_err(|_| Error::InvalidSessionData)?;
        data.try_into()
    }

    pub async fn delete(&self, _ctx: &Context, id: &str) -> Result<()> {
        self.blobs
            .delete(&session_key(id))
            .await
            .map_err(|e| Error::internal("session deletion failed", e))
    }
}

/// The value of the session cookie, if present and non-empty.
pub fn session_cookie(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// The password of HTTP Basic credentials, which Git's credential helper
/// fills with the session id.
pub fn basic_auth_session(headers: &http::HeaderMap) -> Option<String> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_, password) = decoded.split_once(':')?;
    Some(password.to_string()).filter(|p| !p.is_empty())
}

pub fn set_cookie_header(id: &str, ttl: Duration, secure: bool) -> String {
    let secure = if secure { " Secure;" } else { "" };
    format!(
        "{SESSION_COOKIE}={id}; HttpOnly;{secure} SameSite=Lax; Max-Age={}; Path=/",
        ttl.as_secs()
    )
}

pub fn clear_cookie_header(secure: bool) -> String {
    set_cookie_header("", Duration::ZERO, secure)
}
