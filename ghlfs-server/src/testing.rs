//! Test doubles for the collaborator traits.

use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use ghlfs_common::{Oid, RepositoryIdentifier, RepositoryPermissions, Size, StorageKey};
use tokio::io::AsyncReadExt;

use crate::{
    context::{Clock, Context},
    error::{Error, Result, StorageError, StoreError},
    model::{AccessPolicy, LfsObject},
    oauth::{OAuthProvider, ProviderError, ProviderUser},
    oidc::{GitHubClaims, OidcVerifier},
    storage::{ObjectReader, ObjectStorage, PresignedRequest},
    store::{Cache, MemoryKv, MetadataStore, PolicyStore},
};

/// An OID made of 64 copies of `c`.
pub fn oid(c: char) -> Oid {
    std::iter::repeat(c).take(Oid::LEN).collect::<String>().parse().unwrap()
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone)]
pub struct FixedClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn at(rfc3339: &str) -> Self {
        let now = DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc);
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        *self.now.lock().unwrap() += by;
    }

    pub fn context(&self) -> Context {
        Context::new(Arc::new(self.clone()))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

fn backend_down() -> StoreError {
    StoreError::Backend("backend unavailable".to_string())
}

pub struct FailingPolicyStore;

#[async_trait]
impl PolicyStore for FailingPolicyStore {
    async fn find_by_oid(&self, _oid: &Oid) -> Result<Option<AccessPolicy>, StoreError> {
        Err(backend_down())
    }

    async fn save(&self, _policy: &AccessPolicy) -> Result<(), StoreError> {
        Err(backend_down())
    }
}

pub struct FailingMetadataStore;

#[async_trait]
impl MetadataStore for FailingMetadataStore {
    async fn find(&self, _oid: &Oid) -> Result<LfsObject, StoreError> {
        Err(backend_down())
    }

    async fn save(&self, _obj: &LfsObject) -> Result<(), StoreError> {
        Err(backend_down())
    }

    async fn update(&self, _obj: &LfsObject) -> Result<(), StoreError> {
        Err(backend_down())
    }
}

/// Looks empty until the first save, which loses a race against `owner`.
pub struct ConflictingPolicyStore {
    owner: RepositoryIdentifier,
    raced: AtomicBool,
}

impl ConflictingPolicyStore {
    pub fn owned_by(owner: &str) -> Self {
        Self {
            owner: owner.parse().unwrap(),
            raced: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PolicyStore for ConflictingPolicyStore {
    async fn find_by_oid(&self, oid: &Oid) -> Result<Option<AccessPolicy>, StoreError> {
        if !self.raced.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(AccessPolicy::new(
            oid.clone(),
            self.owner.clone(),
            Utc::now(),
        )))
    }

    async fn save(&self, _policy: &AccessPolicy) -> Result<(), StoreError> {
        self.raced.store(true, Ordering::SeqCst);
        Err(StoreError::Conflict)
    }
}

/// Object storage keeping bytes in memory and minting fake signed URLs.
#[derive(Default)]
pub struct MockObjectStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    presigned: AtomicUsize,
    fail_presign: AtomicBool,
    stall_gets: AtomicBool,
}

impl MockObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presign_count(&self) -> usize {
        self.presigned.load(Ordering::SeqCst)
    }

    pub fn fail_presign(&self, fail: bool) {
        self.fail_presign.store(fail, Ordering::SeqCst);
    }

    /// Makes `get_object` hang forever.
    pub fn stall_gets(&self, stall: bool) {
        self.stall_gets.store(stall, Ordering::SeqCst);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    fn presign(
        &self,
        method: &str,
        key: &StorageKey,
        expires_in: Duration,
    ) -> Result<PresignedRequest, StorageError> {
        if self.fail_presign.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("signing failed".to_string()));
        }
        self.presigned.fetch_add(1, Ordering::SeqCst);
        Ok(PresignedRequest {
            href: format!(
                "https://storage.example.com/bucket/{key}?X-Amz-Method={method}&X-Amz-Expires={}",
                expires_in.as_secs()
            ),
            header: HashMap::new(),
        })
    }
}

#[async_trait]
impl ObjectStorage for MockObjectStorage {
    async fn presign_put(
        &self,
        key: &StorageKey,
        _size: Size,
        expires_in: Duration,
    ) -> Result<PresignedRequest, StorageError> {
        self.presign("PUT", key, expires_in)
    }

    async fn presign_get(
        &self,
        key: &StorageKey,
        expires_in: Duration,
    ) -> Result<PresignedRequest, StorageError> {
        self.presign("GET", key, expires_in)
    }

    async fn get_object(
        &self,
        key: &StorageKey,
    ) -> Result<(ObjectReader, Option<u64>), StorageError> {
        if self.stall_gets.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let data = self.object(key.as_str()).ok_or(StorageError::NotFound)?;
        let len = data.len() as u64;
        Ok((Box::new(Cursor::new(data)), Some(len)))
    }

    async fn put_object(
        &self,
        key: &StorageKey,
        body: ObjectReader,
        size: Size,
    ) -> Result<(), StorageError> {
        let mut data = Vec::new();
        body.take(size.get() + 1).read_to_end(&mut data).await?;
        if data.len() as u64 != size.get() {
            return Err(StorageError::Backend("body length mismatch".to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(key.as_str().to_string(), data);
        Ok(())
    }
}

/// A [`MemoryKv`] cache that records deletions and can be told to fail them.
pub struct RecordingCache {
    inner: MemoryKv,
    deleted: Mutex<Vec<String>>,
    fail_deletes: AtomicBool,
}

impl RecordingCache {
    pub fn new(inner: MemoryKv) -> Self {
        Self {
            inner,
            deleted: Mutex::new(Vec::new()),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Cache for RecordingCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        Cache::get(&self.inner, key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(backend_down());
        }
        self.deleted.lock().unwrap().push(key.to_string());
        Cache::delete(&self.inner, key).await
    }
}

pub struct MockOidcVerifier {
    claims: Option<GitHubClaims>,
}

impl MockOidcVerifier {
    pub fn accepting(claims: GitHubClaims) -> Self {
        Self {
            claims: Some(claims),
        }
    }

    pub fn rejecting() -> Self {
        Self { claims: None }
    }
}

#[async_trait]
impl OidcVerifier for MockOidcVerifier {
    async fn verify(&self, _ctx: &Context, _token: &str) -> Result<GitHubClaims> {
        self.claims
            .clone()
            .ok_or_else(|| Error::InvalidToken("signature mismatch".to_string()))
    }
}

/// GitHub stand-in: user 42 ("mona") with fixed permissions on every
/// repository.
pub struct MockOAuthProvider {
    permissions: RepositoryPermissions,
    fail_at: Mutex<Option<String>>,
    redirect: Mutex<Option<String>>,
}

impl MockOAuthProvider {
    pub fn new(permissions: RepositoryPermissions) -> Self {
        Self {
            permissions,
            fail_at: Mutex::new(None),
            redirect: Mutex::new(None),
        }
    }

    /// Makes one step fail: `"exchange"`, `"user"` or `"permissions"`.
    pub fn fail_at(&self, step: &str) {
        *self.fail_at.lock().unwrap() = Some(step.to_string());
    }

    /// The redirect URI passed to the last code exchange.
    pub fn exchanged_redirect(&self) -> Option<String> {
        self.redirect.lock().unwrap().clone()
    }

    fn check(&self, step: &str) -> Result<(), ProviderError> {
        match self.fail_at.lock().unwrap().as_deref() {
            Some(s) if s == step => Err(ProviderError::Rejected(format!("{step} failed"))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl OAuthProvider for MockOAuthProvider {
    fn authorization_url(
        &self,
        state: &str,
        redirect_uri: &str,
        scopes: &[&str],
    ) -> Result<String, ProviderError> {
        let scope = scopes.join(" ");
        let url = reqwest::Url::parse_with_params(
            "https://github.example.com/login/oauth/authorize",
            &[
                ("client_id", "test-client"),
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
        _code: &str,
        redirect_uri: &str,
    ) -> Result<String, ProviderError> {
        self.check("exchange")?;
        *self.redirect.lock().unwrap() = Some(redirect_uri.to_string());
        Ok("gho_token".to_string())
    }

    async fn fetch_user(&self, _ctx: &Context, _token: &str) -> Result<ProviderUser, ProviderError> {
        self.check("user")?;
        Ok(ProviderUser {
            id: 42,
            login: "mona".to_string(),
            name: Some("Mona Lisa".to_string()),
        })
    }

    async fn fetch_repository_permissions(
        &self,
        _ctx: &Context,
        _token: &str,
        _repository: &RepositoryIdentifier,
    ) -> Result<RepositoryPermissions, ProviderError> {
        self.check("permissions")?;
        Ok(self.permissions)
    }
}
