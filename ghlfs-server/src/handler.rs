use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{self, HeaderMap},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use futures::{StreamExt, TryStreamExt};
use ghlfs_common::{Oid, Operation, RepositoryIdentifier, UserInfo};
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::trace::TraceLayer;

use crate::{
    api::{
        accepts_git_lfs_json, BatchRequest, BatchResponse, GitLfsJson, MessageResponse,
        VerifyRequest, LFS_MIME, MAX_JSON_BODY,
    },
    authn::{require_auth, Authenticator},
    authz::Authorizer,
    batch::BatchService,
    context::{Clock, Context},
    credential::{render_page, Shell},
    error::{Error, Result},
    health::{handle_healthz, handle_readyz, HealthCheck},
    oauth::OAuthService,
    proxy::ProxyTransfer,
    session::{clear_cookie_header, session_cookie, set_cookie_header, SessionManager},
    transfer::{Links, TransferPlanner},
};

pub struct AppState {
    // Should not end with a slash.
    pub base_url: String,
    pub clock: Arc<dyn Clock>,
    pub authz: Arc<Authorizer>,
    pub batch: BatchService,
    pub planner: Arc<TransferPlanner>,
    pub proxy: ProxyTransfer,
    pub authenticator: Authenticator,
    pub oauth: OAuthService,
    pub sessions: Arc<SessionManager>,
    pub default_redirect_uri: String,
    pub secure_cookies: bool,
    pub health_checks: Vec<Arc<dyn HealthCheck>>,
}

impl AppState {
    pub fn context(&self) -> Context {
        Context::new(self.clock.clone())
    }

    fn links<'a>(&'a self, owner: &'a str, repo: &'a str) -> Links<'a> {
        Links {
            base_url: &self.base_url,
            owner,
            repo,
        }
    }

    /// Host name Git will ask the credential helper about.
    fn credential_host(&self) -> String {
        reqwest::Url::parse(&self.base_url)
            .ok()
            .and_then(|url| {
                let host = url.host_str()?.to_string();
                Some(match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                })
            })
            .unwrap_or_default()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let lfs = Router::new()
        .route(
            "/{owner}/{repo}/info/lfs/objects/batch",
            post(handle_batch).layer(DefaultBodyLimit::max(MAX_JSON_BODY)),
        )
        .route(
            "/{owner}/{repo}/info/lfs/objects/verify",
            post(handle_verify).layer(DefaultBodyLimit::max(MAX_JSON_BODY)),
        )
        .route(
            "/{owner}/{repo}/objects/{oid}",
            get(handle_obj_download).put(handle_obj_upload),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(lfs)
        .route("/auth/github/login", get(handle_login))
        .route("/auth/github/callback", get(handle_callback))
        .route("/auth/session", get(handle_session_page))
        .route("/auth/logout", post(handle_logout))
        .route("/healthz", get(handle_healthz))
        .route("/readyz", get(handle_readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn trim_git_suffix(repo: &str) -> &str {
    repo.strip_suffix(".git").unwrap_or(repo)
}

fn require_permission(user: &UserInfo, operation: Operation) -> Result<()> {
    if user.permissions().is_some_and(|p| p.allows(operation)) {
        Ok(())
    } else {
        Err(Error::Forbidden)
    }
}

fn require_lfs_accept(headers: &HeaderMap) -> Result<()> {
    if accepts_git_lfs_json(headers) {
        Ok(())
    } else {
        Err(Error::BadRequest(format!(
            "Expected `{LFS_MIME}` in list of acceptable response media types"
        )))
    }
}

// --------------------------- LFS routes ----------------------------

async fn handle_batch(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    Extension(user): Extension<UserInfo>,
    headers: HeaderMap,
    GitLfsJson(Json(payload)): GitLfsJson<BatchRequest>,
) -> Result<GitLfsJson<BatchResponse>> {
    require_lfs_accept(&headers)?;
    if let Ok(operation) = payload.operation.parse::<Operation>() {
        require_permission(&user, operation)?;
    }

    let ctx = state.context();
    let links = state.links(&owner, trim_git_suffix(&repo));
    let resp = state
        .batch
        .handle_batch_request(
            &ctx,
            links.base_url,
            links.owner,
            links.repo,
            &payload,
            user.repository(),
        )
        .await?;
    Ok(GitLfsJson(Json(resp)))
}

async fn handle_verify(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<UserInfo>,
    headers: HeaderMap,
    GitLfsJson(Json(payload)): GitLfsJson<VerifyRequest>,
) -> Result<GitLfsJson<MessageResponse>> {
    require_lfs_accept(&headers)?;
    require_permission(&user, Operation::Upload)?;

    let ctx = state.context();
    if let (Ok(oid), Some(repo)) = (payload.oid.parse::<Oid>(), user.repository()) {
        if !state.authz.can_access(&ctx, repo, &oid).await? {
            return Err(Error::AccessDenied);
        }
    }
    state
        .planner
        .verify_upload(&ctx, &payload.oid, payload.size)
        .await?;
    Ok(GitLfsJson(Json(MessageResponse {
        message: "success".to_string(),
    })))
}

fn proxy_target<'a>(user: &'a UserInfo, oid: &str) -> Result<(&'a RepositoryIdentifier, Oid)> {
    let repo = user.repository().ok_or(Error::Forbidden)?;
    Ok((repo, oid.parse()?))
}

async fn handle_obj_upload(
    State(state): State<Arc<AppState>>,
    Path((_owner, _repo, oid)): Path<(String, String, String)>,
    Extension(user): Extension<UserInfo>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    require_permission(&user, Operation::Upload)?;
    let (repo, oid) = proxy_target(&user, &oid)?;
    let declared_size = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let body = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    state
        .proxy
        .upload(&state.context(), repo, &oid, Box::new(body), declared_size)
        .await?;
    Ok(http::StatusCode::OK.into_response())
}

async fn handle_obj_download(
    State(state): State<Arc<AppState>>,
    Path((_owner, _repo, oid)): Path<(String, String, String)>,
    Extension(user): Extension<UserInfo>,
) -> Result<Response> {
    require_permission(&user, Operation::Download)?;
    let (repo, oid) = proxy_target(&user, &oid)?;

    let deadline = tokio::time::Instant::now() + state.proxy.timeout();
    let (reader, size) = state.proxy.download(&state.context(), repo, &oid).await?;
    // The reader is dropped when the stream ends, errors or the client goes away.
    let stream = ReaderStream::new(reader).take_until(tokio::time::sleep_until(deadline));

    let mut resp = Body::from_stream(stream).into_response();
    let headers = resp.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(http::header::CONTENT_LENGTH, size.into());
    Ok(resp)
}

// -------------------------- Interactive auth ---------------------------

fn found(location: &str) -> Result<Response> {
    Response::builder()
        .status(http::StatusCode::FOUND)
        .header(http::header::LOCATION, location)
        .body(Body::empty())
        .map_err(|e| Error::internal("failed to build redirect", e))
}

#[derive(Deserialize)]
struct LoginParams {
    #[serde(default)]
    repository: String,
    redirect_uri: Option<String>,
}

async fn handle_login(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LoginParams>,
) -> Result<Response> {
    let repository: Option<RepositoryIdentifier> = params.repository.parse().ok();
    let redirect_uri = params
        .redirect_uri
        .as_deref()
        .unwrap_or(&state.default_redirect_uri);
    let url = state
        .oauth
        .start_authentication(&state.context(), repository.as_ref(), redirect_uri)
        .await?;
    found(&url)
}

#[derive(Deserialize)]
struct CallbackParams {
    #[serde(default)]
    code: String,
    #[serde(default)]
    state: String,
}

async fn handle_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Response> {
    let session_id = state
        .oauth
        .handle_callback(&state.context(), &params.code, &params.state)
        .await?;

    let page = reqwest::Url::parse_with_params(
        &format!("{}/auth/session", state.base_url),
        &[
            ("session_id", session_id.as_str()),
            ("host", state.credential_host().as_str()),
        ],
    )
    .map_err(|e| Error::internal("failed to build session page URL", e))?;

    let mut resp = found(page.as_str())?;
    let cookie = set_cookie_header(&session_id, state.sessions.ttl(), state.secure_cookies);
    let cookie = http::HeaderValue::try_from(cookie)
        .map_err(|e| Error::internal("failed to build session cookie", e))?;
    resp.headers_mut().insert(http::header::SET_COOKIE, cookie);
    Ok(resp)
}

#[derive(Deserialize)]
struct SessionPageParams {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    shell: String,
}

async fn handle_session_page(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SessionPageParams>,
) -> Result<Response> {
    if params.session_id.is_empty() {
        return Err(Error::BadRequest("missing session_id".to_string()));
    }
    state
        .sessions
        .load(&state.context(), &params.session_id)
        .await?;

    let shell = params.shell.parse().unwrap_or(Shell::Bash);
    let host = if params.host.is_empty() {
        state.credential_host()
    } else {
        params.host
    };
    Ok(Html(render_page(shell, &host, &params.session_id)).into_response())
}

async fn handle_logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Response> {
    if let Some(id) = session_cookie(&headers) {
        state.sessions.delete(&state.context(), &id).await?;
    }
    let cookie = http::HeaderValue::try_from(clear_cookie_header(state.secure_cookies))
        .map_err(|e| Error::internal("failed to build session cookie", e))?;
    let mut resp = http::StatusCode::NO_CONTENT.into_response();
    resp.headers_mut().insert(http::header::SET_COOKIE, cookie);
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{BatchRequestObject, TransferAdapter},
        oidc::{GitHubClaims, OidcAuthenticator},
        store::{MemoryKv, MemoryMetadataStore, MemoryPolicyStore, PolicyStore},
        testing::{oid, FixedClock, MockOAuthProvider, MockObjectStorage, MockOidcVerifier},
        transfer::TransferMode,
    };
    use axum::body::to_bytes;
    use ghlfs_common::{Provider, RepositoryPermissions};
    use tower::ServiceExt;

    const BASE: &str = "https://lfs.example.com";
    const CALLBACK: &str = "https://lfs.example.com/auth/github/callback";

    struct Harness {
        state: Arc<AppState>,
        policies: Arc<MemoryPolicyStore>,
        blobs: Arc<MemoryKv>,
        storage: Arc<MockObjectStorage>,
    }

    fn harness(mode: TransferMode, oauth_permissions: RepositoryPermissions) -> Harness {
        let clock = FixedClock::at("2024-05-01T12:00:00Z");
        let metadata = Arc::new(MemoryMetadataStore::new());
        let policies = Arc::new(MemoryPolicyStore::new());
        let blobs = Arc::new(MemoryKv::new());
        let storage = Arc::new(MockObjectStorage::new());

        let authz = Arc::new(Authorizer::new(policies.clone()));
        let planner = Arc::new(TransferPlanner::new(
            metadata.clone(),
            storage.clone(),
            blobs.clone(),
            mode,
        ));
        let sessions = Arc::new(SessionManager::new(blobs.clone()));
        let oidc = OidcAuthenticator::new(
            Arc::new(MockOidcVerifier::accepting(GitHubClaims {
                sub: "repo:ci/repo:ref:refs/heads/main".to_string(),
                repository: "ci/repo".to_string(),
                git_ref: "refs/heads/main".to_string(),
                actor: "bot".to_string(),
            })),
            vec!["ci/repo".parse().unwrap()],
        );

        let state = Arc::new(AppState {
            base_url: BASE.to_string(),
            clock: Arc::new(clock),
            authz: authz.clone(),
            batch: BatchService::new(authz.clone(), planner.clone(), policies.clone()),
            planner,
            proxy: ProxyTransfer::new(
                authz,
                metadata,
                storage.clone(),
                crate::proxy::DEFAULT_PROXY_TIMEOUT,
            ),
            authenticator: Authenticator::new(Some(oidc), sessions.clone()),
            oauth: OAuthService::new(
                Arc::new(MockOAuthProvider::new(oauth_permissions)),
                blobs.clone(),
                sessions.clone(),
                vec![CALLBACK.to_string()],
            ),
            sessions,
            default_redirect_uri: CALLBACK.to_string(),
            secure_cookies: true,
            health_checks: Vec::new(),
        });
        Harness {
            state,
            policies,
            blobs,
            storage,
        }
    }

    fn push() -> RepositoryPermissions {
        RepositoryPermissions {
            push: true,
            pull: true,
            ..Default::default()
        }
    }

    async fn login(h: &Harness, repo: &str, permissions: RepositoryPermissions) -> String {
        let user = UserInfo::new("42", "", "Mona", Provider::GitHub)
            .unwrap()
            .with_repository(repo.parse().unwrap())
            .with_permissions(permissions);
        h.state
            .sessions
            .create(&h.state.context(), &user)
            .await
            .unwrap()
    }

    fn batch_body(operation: &str, objects: &[(&Oid, i64)]) -> Vec<u8> {
        serde_json::to_vec(&BatchRequest {
            operation: operation.to_string(),
            transfers: vec![TransferAdapter::Basic],
            objects: objects
                .iter()
                .map(|(oid, size)| BatchRequestObject {
                    oid: oid.to_string(),
                    size: *size,
                })
                .collect(),
            git_ref: None,
            hash_algo: None,
        })
        .unwrap()
    }

    fn lfs_post(uri: &str, session: Option<&str>, body: Vec<u8>) -> http::Request<Body> {
        let mut req = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::ACCEPT, LFS_MIME)
            .header(http::header::CONTENT_TYPE, LFS_MIME);
        if let Some(id) = session {
            req = req.header(http::header::COOKIE, format!("ghlfs_session={id}"));
        }
        req.body(Body::from(body)).unwrap()
    }

    async fn send(h: &Harness, req: http::Request<Body>) -> Response {
        router(h.state.clone()).oneshot(req).await.unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_download_presigned() {
        let h = harness(TransferMode::Presigned, push());
        let session = login(&h, "alice/x", push()).await;
        let x = oid('a');

        let resp = send(
            &h,
            lfs_post(
                "/alice/x.git/info/lfs/objects/batch",
                Some(&session),
                batch_body("upload", &[(&x, 1024)]),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(resp.headers()[http::header::CONTENT_TYPE], LFS_MIME);
        let body = json_body(resp).await;
        assert_eq!(body["transfer"], "basic");
        assert_eq!(body["hash_algo"], "sha256");
        assert_eq!(body["objects"][0]["actions"]["upload"]["expires_in"], 900);
        assert_eq!(
            body["objects"][0]["actions"]["verify"]["href"],
            "https://lfs.example.com/alice/x/info/lfs/objects/verify"
        );
        let policy = h.policies.find_by_oid(&x).await.unwrap().unwrap();
        assert_eq!(policy.repository().to_string(), "alice/x");

        let resp = send(
            &h,
            lfs_post(
                "/alice/x/info/lfs/objects/verify",
                Some(&session),
                serde_json::to_vec(&VerifyRequest {
                    oid: x.to_string(),
                    size: 1024,
                })
                .unwrap(),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(json_body(resp).await["message"], "success");

        let resp = send(
            &h,
            lfs_post(
                "/alice/x/info/lfs/objects/batch",
                Some(&session),
                batch_body("download", &[(&x, 1024)]),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["objects"][0]["authenticated"], true);
        assert!(body["objects"][0]["actions"]["download"]["href"]
            .as_str()
            .unwrap()
            .contains(x.as_str()));
    }

    #[tokio::test]
    async fn test_cross_repository_download_denied() {
        let h = harness(TransferMode::Presigned, push());
        let alice = login(&h, "alice/x", push()).await;
        let bob = login(&h, "bob/y", push()).await;
        let x = oid('a');

        let resp = send(
            &h,
            lfs_post(
                "/alice/x/info/lfs/objects/batch",
                Some(&alice),
                batch_body("upload", &[(&x, 10)]),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::OK);

        let resp = send(
            &h,
            lfs_post(
                "/bob/y/info/lfs/objects/batch",
                Some(&bob),
                batch_body("download", &[(&x, 10)]),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["message"], "access denied");
        assert_eq!(h.policies.len().await, 1);
    }

    #[tokio::test]
    async fn test_replayed_credentials_forbidden() {
        let h = harness(TransferMode::Presigned, push());
        let alice = login(&h, "alice/x", push()).await;
        let resp = send(
            &h,
            lfs_post(
                "/bob/y/info/lfs/objects/batch",
                Some(&alice),
                batch_body("download", &[(&oid('a'), 1)]),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
        assert_eq!(json_body(resp).await["message"], "Forbidden");

        // Case differences between URL and identity are tolerated.
        let resp = send(
            &h,
            lfs_post(
                "/Alice/X.git/info/lfs/objects/batch",
                Some(&alice),
                batch_body("upload", &[(&oid('a'), 1)]),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unauthenticated() {
        let h = harness(TransferMode::Presigned, push());
        let resp = send(
            &h,
            lfs_post(
                "/alice/x/info/lfs/objects/batch",
                None,
                batch_body("download", &[(&oid('a'), 1)]),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers()["LFS-Authenticate"],
            "Basic realm=\"Git LFS\""
        );
        assert_eq!(resp.headers()[http::header::CONTENT_TYPE], LFS_MIME);
    }

    #[tokio::test]
    async fn test_header_and_validation_errors() {
        let h = harness(TransferMode::Presigned, push());
        let session = login(&h, "alice/x", push()).await;

        let mut req = lfs_post(
            "/alice/x/info/lfs/objects/batch",
            Some(&session),
            batch_body("download", &[(&oid('a'), 1)]),
        );
        req.headers_mut()
            .insert(http::header::ACCEPT, "application/json".parse().unwrap());
        assert_eq!(send(&h, req).await.status(), http::StatusCode::BAD_REQUEST);

        let mut req = lfs_post(
            "/alice/x/info/lfs/objects/batch",
            Some(&session),
            batch_body("download", &[(&oid('a'), 1)]),
        );
        req.headers_mut()
            .insert(http::header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert_eq!(send(&h, req).await.status(), http::StatusCode::BAD_REQUEST);

        let resp = send(
            &h,
            lfs_post(
                "/alice/x/info/lfs/objects/batch",
                Some(&session),
                batch_body("delete", &[(&oid('a'), 1)]),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::UNPROCESSABLE_ENTITY);

        let resp = send(
            &h,
            lfs_post(
                "/alice/x/info/lfs/objects/batch",
                Some(&session),
                b"{not json".to_vec(),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_oversized_body() {
        let h = harness(TransferMode::Presigned, push());
        let session = login(&h, "alice/x", push()).await;

        for endpoint in ["batch", "verify"] {
            let resp = send(
                &h,
                lfs_post(
                    &format!("/alice/x/info/lfs/objects/{endpoint}"),
                    Some(&session),
                    vec![b' '; MAX_JSON_BODY + 10],
                ),
            )
            .await;
            assert_eq!(resp.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
            assert_eq!(resp.headers()[http::header::CONTENT_TYPE], LFS_MIME);
            assert!(json_body(resp).await["message"].is_string());
        }
    }

    #[tokio::test]
    async fn test_read_only_session_cannot_upload() {
        let h = harness(TransferMode::Presigned, push());
        let session = login(
            &h,
            "alice/x",
            RepositoryPermissions {
                pull: true,
                ..Default::default()
            },
        )
        .await;
        let resp = send(
            &h,
            lfs_post(
                "/alice/x/info/lfs/objects/batch",
                Some(&session),
                batch_body("upload", &[(&oid('a'), 1)]),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
        assert_eq!(h.policies.len().await, 0);
    }

    #[tokio::test]
    async fn test_oidc_bearer() {
        let h = harness(TransferMode::Presigned, push());
        let mut req = lfs_post(
            "/ci/repo/info/lfs/objects/batch",
            None,
            batch_body("upload", &[(&oid('c'), 3)]),
        );
        req.headers_mut()
            .insert(http::header::AUTHORIZATION, "Bearer token".parse().unwrap());
        assert_eq!(send(&h, req).await.status(), http::StatusCode::OK);

        let mut req = lfs_post(
            "/alice/x/info/lfs/objects/batch",
            None,
            batch_body("upload", &[(&oid('c'), 3)]),
        );
        req.headers_mut()
            .insert(http::header::AUTHORIZATION, "Bearer token".parse().unwrap());
        assert_eq!(send(&h, req).await.status(), http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_proxy_round_trip() {
        let h = harness(TransferMode::Proxy, push());
        let session = login(&h, "alice/x", push()).await;
        let x = oid('b');

        let resp = send(
            &h,
            lfs_post(
                "/alice/x/info/lfs/objects/batch",
                Some(&session),
                batch_body("upload", &[(&x, 5)]),
            ),
        )
        .await;
        let body = json_body(resp).await;
        assert_eq!(
            body["objects"][0]["actions"]["upload"]["href"],
            format!("{BASE}/alice/x/objects/{x}")
        );

        let req = http::Request::builder()
            .method(http::Method::PUT)
            .uri(format!("/alice/x/objects/{x}"))
            .header(http::header::COOKIE, format!("ghlfs_session={session}"))
            .header(http::header::CONTENT_LENGTH, "5")
            .body(Body::from("hello"))
            .unwrap();
        assert_eq!(send(&h, req).await.status(), http::StatusCode::OK);
        assert_eq!(
            h.storage
                .object(&format!("objects/sha256/bb/bb/{x}"))
                .as_deref(),
            Some(&b"hello"[..])
        );

        let req = http::Request::builder()
            .uri(format!("/alice/x/objects/{x}"))
            .header(http::header::COOKIE, format!("ghlfs_session={session}"))
            .body(Body::empty())
            .unwrap();
        let resp = send(&h, req).await;
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(resp.headers()[http::header::CONTENT_LENGTH], "5");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_proxy_download_of_unknown_object() {
        let h = harness(TransferMode::Proxy, push());
        let session = login(&h, "alice/x", push()).await;
        let req = http::Request::builder()
            .uri(format!("/alice/x/objects/{}", oid('9')))
            .header(http::header::COOKIE, format!("ghlfs_session={session}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h, req).await.status(), http::StatusCode::FORBIDDEN);
    }

    fn location(resp: &Response) -> reqwest::Url {
        reqwest::Url::parse(resp.headers()[http::header::LOCATION].to_str().unwrap()).unwrap()
    }

    fn query(url: &reqwest::Url, key: &str) -> String {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    async fn start_login(h: &Harness) -> String {
        let req = http::Request::builder()
            .uri("/auth/github/login?repository=alice/x")
            .body(Body::empty())
            .unwrap();
        let resp = send(h, req).await;
        assert_eq!(resp.status(), http::StatusCode::FOUND);
        query(&location(&resp), "state")
    }

    #[tokio::test]
    async fn test_oauth_flow() {
        let h = harness(TransferMode::Presigned, push());
        let state = start_login(&h).await;

        let req = http::Request::builder()
            .uri(format!("/auth/github/callback?code=abc&state={state}"))
            .body(Body::empty())
            .unwrap();
        let resp = send(&h, req).await;
        assert_eq!(resp.status(), http::StatusCode::FOUND);
        let cookie = resp.headers()[http::header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("ghlfs_session="));
        assert!(cookie.contains("HttpOnly; Secure; SameSite=Lax; Max-Age=86400; Path=/"));

        let page = location(&resp);
        assert_eq!(page.path(), "/auth/session");
        assert_eq!(query(&page, "host"), "lfs.example.com");
        let session = query(&page, "session_id");

        let req = http::Request::builder()
            .uri(format!("/auth/session?session_id={session}&host=lfs.example.com&shell=zsh"))
            .body(Body::empty())
            .unwrap();
        let resp = send(&h, req).await;
        assert_eq!(resp.status(), http::StatusCode::OK);
        let html = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(html.to_vec()).unwrap();
        assert!(html.contains(&format!("password={session}")));

        // The new session authenticates LFS requests.
        let resp = send(
            &h,
            lfs_post(
                "/alice/x/info/lfs/objects/batch",
                Some(&session),
                batch_body("upload", &[(&oid('a'), 1)]),
            ),
        )
        .await;
        assert_eq!(resp.status(), http::StatusCode::OK);

        let req = http::Request::builder()
            .method(http::Method::POST)
            .uri("/auth/logout")
            .header(http::header::COOKIE, format!("ghlfs_session={session}"))
            .body(Body::empty())
            .unwrap();
        let resp = send(&h, req).await;
        assert_eq!(resp.status(), http::StatusCode::NO_CONTENT);
        assert!(matches!(
            h.state.sessions.load(&h.state.context(), &session).await,
            Err(Error::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_oauth_callback_without_access() {
        let h = harness(TransferMode::Presigned, RepositoryPermissions::default());
        let state = start_login(&h).await;
        let req = http::Request::builder()
            .uri(format!("/auth/github/callback?code=abc&state={state}"))
            .body(Body::empty())
            .unwrap();
        let resp = send(&h, req).await;
        assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
        assert!(resp.headers().get(http::header::SET_COOKIE).is_none());
        assert_eq!(h.blobs.len().await, 0);
    }

    #[tokio::test]
    async fn test_login_rejects_bad_parameters() {
        let h = harness(TransferMode::Presigned, push());
        for uri in [
            "/auth/github/login",
            "/auth/github/login?repository=alice/x&redirect_uri=https://evil.example.com/",
            "/auth/github/callback?state=s",
        ] {
            let req = http::Request::builder().uri(uri).body(Body::empty()).unwrap();
            assert_eq!(
                send(&h, req).await.status(),
                http::StatusCode::BAD_REQUEST,
                "{uri}"
            );
        }
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(TransferMode::Presigned, push());
        let req = http::Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        assert_eq!(send(&h, req).await.status(), http::StatusCode::OK);
        let req = http::Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let resp = send(&h, req).await;
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }
}
