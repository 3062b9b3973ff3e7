use std::collections::HashMap;

use axum::{
    Json,
    extract::{FromRequest, Request, rejection},
    http,
    response::{IntoResponse, Response},
};
use ghlfs_common::HashAlgorithm;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::Error;

// ----------------------- Generic facilities ----------------------

#[derive(Debug, Serialize)]
pub struct GitLfsErrorData<'a> {
    pub message: &'a str,
}

#[derive(Debug, Clone)]
pub struct GitLfsJson<T>(pub Json<T>);

pub const LFS_MIME: &str = "application/vnd.git-lfs+json";

/// Upper bound for JSON request bodies on the LFS routes.
pub const MAX_JSON_BODY: usize = 10 * 1024 * 1024;

pub enum GitLfsJsonRejection {
    Json(rejection::JsonRejection),
    MissingGitLfsJsonContentType,
}

impl IntoResponse for GitLfsJsonRejection {
    fn into_response(self) -> Response {
        match self {
            Self::Json(rej) if rej.status() == http::StatusCode::PAYLOAD_TOO_LARGE => {
                let mut resp = Error::BadRequest(rej.body_text()).into_response();
                *resp.status_mut() = http::StatusCode::PAYLOAD_TOO_LARGE;
                resp
            }
            Self::Json(rej) => {
                let mut resp = Error::BadRequest(rej.body_text()).into_response();
                *resp.status_mut() = http::StatusCode::UNPROCESSABLE_ENTITY;
                resp
            }
            Self::MissingGitLfsJsonContentType => Error::BadRequest(format!(
                "Expected request with `Content-Type: {LFS_MIME}`"
            ))
            .into_response(),
        }
    }
}

pub fn is_git_lfs_json_mimetype(mimetype: &str) -> bool {
    let Ok(mime) = mimetype.parse::<mime::Mime>() else {
        return false;
    };
    if mime.type_() != mime::APPLICATION
        || mime.subtype() != "vnd.git-lfs"
        || mime.suffix() != Some(mime::JSON)
    {
        return false;
    }
    match mime.get_param(mime::CHARSET) {
        Some(mime::UTF_8) | None => true,
        Some(_) => false,
    }
}

fn has_git_lfs_json_content_type(req: &Request) -> bool {
    let Some(content_type) = req.headers().get(http::header::CONTENT_TYPE) else {
        return false;
    };
    let Ok(content_type) = content_type.to_str() else {
        return false;
    };
    is_git_lfs_json_mimetype(content_type)
}

/// Whether any `Accept` header lists the Git LFS media type.
pub fn accepts_git_lfs_json(headers: &http::HeaderMap) -> bool {
    headers
        .get_all(http::header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(is_git_lfs_json_mimetype)
}

impl<T, S> FromRequest<S> for GitLfsJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = GitLfsJsonRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if !has_git_lfs_json_content_type(&req) {
            return Err(GitLfsJsonRejection::MissingGitLfsJsonContentType);
        }
        Json::<T>::from_request(req, state)
            .await
            .map(GitLfsJson)
            .map_err(GitLfsJsonRejection::Json)
    }
}

impl<T: Serialize> IntoResponse for GitLfsJson<T> {
    fn into_response(self) -> Response {
        let GitLfsJson(json) = self;
        let mut resp = json.into_response();
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(LFS_MIME),
        );
        resp
    }
}

// ----------------------- Git LFS Batch API -----------------------

/// Wire form of a batch request. Values are validated by the batch service,
/// not by deserialization, so malformed OIDs surface as domain errors.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct BatchRequest {
    pub operation: String,
    #[serde(default = "default_transfers")]
    pub transfers: Vec<TransferAdapter>,
    pub objects: Vec<BatchRequestObject>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<GitRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algo: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct GitRef {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct BatchRequestObject {
    pub oid: String,
    pub size: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub enum TransferAdapter {
    #[serde(rename = "basic")]
    Basic,
    #[serde(other)]
    Unknown,
}

fn default_transfers() -> Vec<TransferAdapter> {
    vec![TransferAdapter::Basic]
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BatchResponse {
    pub transfer: TransferAdapter,
    pub objects: Vec<BatchResponseObject>,
    pub hash_algo: HashAlgorithm,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BatchResponseObject {
    pub oid: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<BatchResponseObjectActions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchResponseObjectError>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BatchResponseObjectError {
    pub code: u16,
    pub message: String,
}

impl BatchResponseObject {
    pub fn error(
        obj: &BatchRequestObject,
        code: http::StatusCode,
        message: impl Into<String>,
    ) -> BatchResponseObject {
        BatchResponseObject {
            oid: obj.oid.clone(),
            size: obj.size,
            authenticated: None,
            actions: None,
            error: Some(BatchResponseObjectError {
                code: code.as_u16(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BatchResponseObjectAction {
    pub href: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

#[derive(Default, Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BatchResponseObjectActions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<BatchResponseObjectAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<BatchResponseObjectAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<BatchResponseObjectAction>,
}

// ------------------------ Verify & session -----------------------

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct VerifyRequest {
    pub oid: String,
    pub size: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct MessageResponse {
    pub message: String,
}

#[test]
fn test_mimetype() {
    assert!(is_git_lfs_json_mimetype("application/vnd.git-lfs+json"));
    assert!(!is_git_lfs_json_mimetype("application/vnd.git-lfs"));
    assert!(!is_git_lfs_json_mimetype("application/json"));
    assert!(is_git_lfs_json_mimetype(
        "application/vnd.git-lfs+json; charset=utf-8"
    ));
    assert!(is_git_lfs_json_mimetype(
        "application/vnd.git-lfs+json; charset=UTF-8"
    ));
    assert!(!is_git_lfs_json_mimetype(
        "application/vnd.git-lfs+json; charset=ISO-8859-1"
    ));
}

#[test]
fn test_accept() {
    let mut headers = http::HeaderMap::new();
    assert!(!accepts_git_lfs_json(&headers));
    headers.insert(
        http::header::ACCEPT,
        http::HeaderValue::from_static("application/json, application/vnd.git-lfs+json"),
    );
    assert!(accepts_git_lfs_json(&headers));
}

#[test]
fn test_deserialize() {
    let json = r#"{"operation":"upload","objects":[{"oid":"8f4123f9a7181f488c5e111d82cefd992e461ae5df01fd2254399e6e670b2d3c","size":170904}],
                   "transfers":["lfs-standalone-file","basic","ssh"],"ref":{"name":"refs/heads/main"},"hash_algo":"sha256"}"#;
    let expected = BatchRequest {
        operation: "upload".to_string(),
        objects: vec![BatchRequestObject {
            oid: "8f4123f9a7181f488c5e111d82cefd992e461ae5df01fd2254399e6e670b2d3c".to_string(),
            size: 170904,
        }],
        transfers: vec![
            TransferAdapter::Unknown,
            TransferAdapter::Basic,
            TransferAdapter::Unknown,
        ],
        git_ref: Some(GitRef {
            name: "refs/heads/main".to_string(),
        }),
        hash_algo: Some("sha256".to_string()),
    };
    let parsed = serde_json::from_str::<BatchRequest>(json).unwrap();
    assert_eq!(parsed, expected);

    let minimal: BatchRequest =
        serde_json::from_str(r#"{"operation":"download","objects":[]}"#).unwrap();
    assert_eq!(minimal.transfers, vec![TransferAdapter::Basic]);
    assert_eq!(minimal.git_ref, None);
    assert_eq!(minimal.hash_algo, None);
}

#[test]
fn test_request_roundtrip_keeps_optional_fields() {
    let req = BatchRequest {
        operation: "download".to_string(),
        transfers: vec![TransferAdapter::Basic],
        objects: vec![BatchRequestObject {
            oid: "a".repeat(64),
            size: 12,
        }],
        git_ref: Some(GitRef {
            name: "refs/heads/dev".to_string(),
        }),
        hash_algo: Some("sha256".to_string()),
    };
    let json = serde_json::to_string(&req).unwrap();
    assert_eq!(serde_json::from_str::<BatchRequest>(&json).unwrap(), req);
}

#[test]
fn test_serialize_response_object_without_actions() {
    let obj = BatchResponseObject {
        oid: "c".repeat(64),
        size: 512,
        authenticated: Some(true),
        actions: None,
        error: None,
    };
    let value = serde_json::to_value(&obj).unwrap();
    assert_eq!(
        value,
        serde_json::json!({"oid": "c".repeat(64), "size": 512, "authenticated": true})
    );

    let resp = BatchResponse {
        transfer: TransferAdapter::Basic,
        objects: vec![obj],
        hash_algo: HashAlgorithm::Sha256,
    };
    let value = serde_json::to_value(&resp).unwrap();
    assert_eq!(value["transfer"], "basic");
    assert_eq!(value["hash_algo"], "sha256");
}
