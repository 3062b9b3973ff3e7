use axum::{
    body::Body,
    http,
    response::{IntoResponse, Response},
};
use ghlfs_common::ValueError;
use thiserror::Error;

use crate::api::{GitLfsErrorData, LFS_MIME};

/// Failure reported by a metadata, policy, cache or blob store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflicting record already exists")]
    Conflict,
    #[error("{0}")]
    Backend(String),
}

/// Failure reported by the object storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found in storage")]
    NotFound,
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    // Validation
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error("no objects")]
    NoObjects,
    #[error("unsupported transfer adapter specified (supported: basic)")]
    UnsupportedTransfer,
    #[error("invalid repository")]
    InvalidRepository,
    #[error("invalid redirect URI")]
    InvalidRedirectUri,
    #[error("invalid code")]
    InvalidCode,
    #[error("invalid state")]
    InvalidState,
    #[error("Invalid repository path")]
    InvalidRepositoryPath,
    #[error("{0}")]
    BadRequest(String),

    // Authentication
    #[error("authentication required")]
    Unauthenticated,
    #[error("session not found")]
    SessionNotFound,
    #[error("invalid session data")]
    InvalidSessionData,
    #[error("OIDC not configured")]
    OidcNotConfigured,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("code exchange failed: {0}")]
    CodeExchangeFailed(String),
    #[error("failed to fetch user info: {0}")]
    UserInfoFailed(String),

    // Authorization
    #[error("authorization denied")]
    AuthorizationDenied,
    #[error("access denied")]
    AccessDenied,
    #[error("Forbidden")]
    Forbidden,
    #[error("repository not allowed")]
    RepositoryNotAllowed,
    #[error("repository access denied")]
    RepositoryAccessDenied,

    // Resource state
    #[error("object not found")]
    ObjectNotFound,
    #[error("object not uploaded yet")]
    NotUploaded,
    #[error("size mismatch")]
    SizeMismatch,
    #[error("cache miss")]
    CacheMiss,

    // Infrastructure
    #[error("repository access check failed: {0}")]
    RepositoryAccessCheckFailed(String),
    #[error("failed to create user info: {0}")]
    UserInfoCreationFailed(ValueError),
    #[error("state save failed: {0}")]
    StateSaveFailed(StoreError),
    #[error("session creation failed: {0}")]
    SessionCreationFailed(StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("{context}: {source}")]
    Internal {
        context: &'static str,
        source: BoxError,
    },
}

impl Error {
    pub fn internal(context: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Internal {
            context,
            source: source.into(),
        }
    }

    pub fn status(&self) -> http::StatusCode {
        use http::StatusCode as S;
        match self {
            Self::Value(_) | Self::NoObjects | Self::UnsupportedTransfer => {
                S::UNPROCESSABLE_ENTITY
            }
            Self::InvalidRepository
            | Self::InvalidRedirectUri
            | Self::InvalidCode
            | Self::InvalidState
            | Self::InvalidRepositoryPath
            | Self::BadRequest(_) => S::BAD_REQUEST,
            Self::Unauthenticated
            | Self::SessionNotFound
            | Self::InvalidSessionData
            | Self::OidcNotConfigured
            | Self::InvalidToken(_)
            | Self::CodeExchangeFailed(_)
            | Self::UserInfoFailed(_) => S::UNAUTHORIZED,
            Self::AuthorizationDenied
            | Self::AccessDenied
            | Self::Forbidden
            | Self::RepositoryNotAllowed
            | Self::RepositoryAccessDenied => S::FORBIDDEN,
            Self::ObjectNotFound | Self::NotUploaded | Self::CacheMiss => S::NOT_FOUND,
            Self::SizeMismatch => S::CONFLICT,
            Self::Storage(_) | Self::RepositoryAccessCheckFailed(_) => S::BAD_GATEWAY,
            Self::DeadlineExceeded => S::GATEWAY_TIMEOUT,
            Self::UserInfoCreationFailed(_)
            | Self::StateSaveFailed(_)
            | Self::SessionCreationFailed(_)
            | Self::Internal { .. } => S::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message shown to clients. Server-side failures do not leak their
    /// source chain.
    fn public_message(&self) -> String {
        match self {
            Self::Storage(_) => "Storage backend error".to_string(),
            Self::Internal { context, .. } => context.to_string(),
            Self::RepositoryAccessCheckFailed(_) => "repository access check failed".to_string(),
            Self::UserInfoCreationFailed(_) => "failed to create user info".to_string(),
            Self::StateSaveFailed(_) => "state save failed".to_string(),
            Self::SessionCreationFailed(_) => "session creation failed".to_string(),
            Self::InvalidToken(_) => "invalid token".to_string(),
            Self::CodeExchangeFailed(_) => "code exchange failed".to_string(),
            Self::UserInfoFailed(_) => "failed to fetch user info".to_string(),
            other => other.to_string(),
        }
    }
}

const FALLBACK_BODY: &str = r#"{"message":"Internal server error"}"#;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "request failed: {self}");
        } else {
            tracing::warn!(status = status.as_u16(), "request rejected: {self}");
        }

        let message = self.public_message();
        let body = serde_json::to_vec(&GitLfsErrorData { message: &message })
            .unwrap_or_else(|_| FALLBACK_BODY.as_bytes().to_vec());

        let mut resp = Response::new(Body::from(body));
        *resp.status_mut() = status;
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(LFS_MIME),
        );
        if status == http::StatusCode::UNAUTHORIZED {
            resp.headers_mut().insert(
                "LFS-Authenticate",
                http::HeaderValue::from_static("Basic realm=\"Git LFS\""),
            );
        }
        resp
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[test]
fn test_status_mapping() {
    use http::StatusCode;

    assert_eq!(
        Error::Value(ValueError::InvalidOid).status(),
        StatusCode::UNPROCESSABLE_ENTITY
    );
    assert_eq!(Error::AccessDenied.status(), StatusCode::FORBIDDEN);
    assert_eq!(Error::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        Error::InvalidRepositoryPath.status(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(Error::DeadlineExceeded.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        Error::Storage(StorageError::Backend("boom".into())).status(),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(
        Error::internal("metadata update failed", StoreError::Backend("x".into())).status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[tokio::test]
async fn test_error_response() {
    let resp = Error::Unauthenticated.into_response();
    assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers()["LFS-Authenticate"], "Basic realm=\"Git LFS\"");
    assert_eq!(resp.headers()[http::header::CONTENT_TYPE], LFS_MIME);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], br#"{"message":"authentication required"}"#);

    let resp = Error::internal("metadata update failed", StoreError::Backend("db down".into()))
        .into_response();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], br#"{"message":"metadata update failed"}"#);
}
