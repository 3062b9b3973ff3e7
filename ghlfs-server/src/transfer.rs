use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::http::StatusCode;
use chrono::{DateTime, TimeDelta, Utc};
use ghlfs_common::{HashAlgorithm, Oid, Size, StorageKey};
use serde::{Deserialize, Serialize};

use crate::{
    api::{
        BatchRequestObject, BatchResponseObject, BatchResponseObjectAction,
        BatchResponseObjectActions,
    },
    context::{self, Context},
    error::{Error, Result, StoreError},
    model::LfsObject,
    storage::{ObjectStorage, PresignedRequest},
    store::{Cache, MetadataStore},
};

/// Lifetime of every minted transfer action.
pub const ACTION_TTL: Duration = Duration::from_secs(15 * 60);

/// A cached upload action is only handed out again while it has at least this
/// much validity left.
const MIN_REUSE_VALIDITY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Clients talk to object storage through presigned URLs.
    #[default]
    Presigned,
    /// Clients send and receive object bytes through this server.
    Proxy,
}

/// Where the externally visible routes of one repository live.
#[derive(Debug, Copy, Clone)]
pub struct Links<'a> {
    /// Should not end with a slash.
    pub base_url: &'a str,
    pub owner: &'a str,
    pub repo: &'a str,
}

impl Links<'_> {
    pub fn object(&self, oid: &Oid) -> String {
        format!("{}/{}/{}/objects/{oid}", self.base_url, self.owner, self.repo)
    }

    pub fn verify(&self) -> String {
        format!(
            "{}/{}/{}/info/lfs/objects/verify",
            self.base_url, self.owner, self.repo
        )
    }
}

pub fn upload_cache_key(oid: &Oid) -> String {
    format!("batch-upload:{oid}")
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedUploadAction {
    href: String,
    header: HashMap<String, String>,
    size: u64,
    expires_at: DateTime<Utc>,
}

/// Result of planning one upload.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub response: BatchResponseObject,
    /// False when the object is already stored (or the plan failed).
    pub needs_transfer: bool,
}

fn expires_in_secs(ttl: Duration) -> i64 {
    ttl.as_secs() as i64
}

pub struct TransferPlanner {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStorage>,
    cache: Arc<dyn Cache>,
    mode: TransferMode,
}

impl TransferPlanner {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStorage>,
        cache: Arc<dyn Cache>,
        mode: TransferMode,
    ) -> Self {
        Self {
            metadata,
            storage,
            cache,
            mode,
        }
    }

    pub async fn plan_upload(
        &self,
        ctx: &Context,
        links: Links<'_>,
        obj: &BatchRequestObject,
        oid: &Oid,
        size: Size,
        hash_algo: &str,
    ) -> UploadPlan {
        let failed = |code: StatusCode, message: &str| UploadPlan {
            response: BatchResponseObject::error(obj, code, message),
            needs_transfer: false,
        };

        let storage_key = match self.metadata.find(oid).await {
            Err(StoreError::NotFound) => {
                let Ok(storage_key) = StorageKey::for_object(oid, hash_algo) else {
                    return failed(StatusCode::BAD_REQUEST, "invalid storage key");
                };
                let Ok(algo) = HashAlgorithm::parse(hash_algo) else {
                    return failed(StatusCode::BAD_REQUEST, "invalid hash algorithm");
                };
                let record = LfsObject::new(ctx, oid.clone(), size, algo, storage_key.clone());
                if let Err(e) = self.metadata.save(&record).await {
                    tracing::error!(%oid, "failed to save object metadata: {e}");
                    return failed(StatusCode::INTERNAL_SERVER_ERROR, "metadata save failed");
                }
                storage_key
            }
            Err(e) => {
                tracing::error!(%oid, "failed to fetch object metadata: {e}");
                return failed(StatusCode::INTERNAL_SERVER_ERROR, "metadata fetch failed");
            }
            Ok(existing) if existing.is_uploaded() => {
                if existing.size() != size {
                    return failed(StatusCode::CONFLICT, "size mismatch");
                }
                return UploadPlan {
                    response: BatchResponseObject {
                        oid: obj.oid.clone(),
                        size: obj.size,
                        authenticated: Some(true),
                        actions: None,
                        error: None,
                    },
                    needs_transfer: false,
                };
            }
            Ok(pending) => pending.storage_key().clone(),
        };

        let upload = match self.upload_action(ctx, links, oid, &storage_key, size).await {
            Ok(upload) => upload,
            Err(e) => {
                tracing::error!(%oid, "failed to generate upload URL: {e}");
                return failed(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "upload URL generation failed",
                );
            }
        };

        UploadPlan {
            response: BatchResponseObject {
                oid: obj.oid.clone(),
                size: obj.size,
                authenticated: Some(true),
                actions: Some(BatchResponseObjectActions {
                    upload: Some(upload),
                    verify: Some(BatchResponseObjectAction {
                        href: links.verify(),
                        header: HashMap::new(),
                        expires_in: Some(expires_in_secs(ACTION_TTL)),
                    }),
                    ..Default::default()
                }),
                error: None,
            },
            needs_transfer: true,
        }
    }

    async fn upload_action(
        &self,
        ctx: &Context,
        links: Links<'_>,
        oid: &Oid,
        storage_key: &StorageKey,
        size: Size,
    ) -> Result<BatchResponseObjectAction> {
        let now = context::now(ctx);
        let cache_key = upload_cache_key(oid);

        if let Some(cached) = self.cached_upload_action(&cache_key).await {
            let remaining = cached.expires_at - now;
            if cached.size == size.get()
                && remaining >= TimeDelta::seconds(MIN_REUSE_VALIDITY.as_secs() as i64)
            {
                return Ok(BatchResponseObjectAction {
                    href: cached.href,
                    header: cached.header,
                    expires_in: Some(remaining.num_seconds()),
                });
            }
        }

        let minted = match self.mode {
            TransferMode::Presigned => {
                self.storage
                    .presign_put(storage_key, size, ACTION_TTL)
                    .await?
            }
            TransferMode::Proxy => PresignedRequest {
                href: links.object(oid),
                header: HashMap::new(),
            },
        };

        let expires_at = now + TimeDelta::seconds(ACTION_TTL.as_secs() as i64);
        let entry = CachedUploadAction {
            href: minted.href.clone(),
            header: minted.header.clone(),
            size: size.get(),
            expires_at,
        };
        match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                if let Err(e) = self
                    .cache
                    .set(&cache_key, bytes, ACTION_TTL - MIN_REUSE_VALIDITY)
                    .await
                {
                    tracing::warn!(%oid, "failed to cache upload action: {e}");
                }
            }
            Err(e) => tracing::warn!(%oid, "failed to encode upload action: {e}"),
        }

        Ok(BatchResponseObjectAction {
            href: minted.href,
            header: minted.header,
            expires_in: Some(expires_in_secs(ACTION_TTL)),
        })
    }

    async fn cached_upload_action(&self, key: &str) -> Option<CachedUploadAction> {
        let bytes = match self.cache.get(key).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound) => return None,
            Err(e) => {
                tracing::warn!("failed to read upload action cache: {e}");
                return None;
            }
        };
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn plan_download(
        &self,
        _ctx: &Context,
        links: Links<'_>,
        obj: &BatchRequestObject,
        oid: &Oid,
    ) -> BatchResponseObject {
        let record = match self.metadata.find(oid).await {
            Ok(record) => record,
            Err(StoreError::NotFound) => {
                return BatchResponseObject::error(
                    obj,
                    StatusCode::NOT_FOUND,
                    "object does not exist",
                );
            }
            Err(e) => {
                tracing::error!(%oid, "failed to fetch object metadata: {e}");
                return BatchResponseObject::error(
                    obj,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metadata fetch failed",
                );
            }
        };
        if !record.is_uploaded() {
            return BatchResponseObject::error(obj, StatusCode::NOT_FOUND, "not uploaded yet");
        }

        let minted = match self.mode {
            TransferMode::Presigned => {
                match self
                    .storage
                    .presign_get(record.storage_key(), ACTION_TTL)
                    .await
                {
                    Ok(presigned) => presigned,
                    Err(e) => {
                        tracing::error!(%oid, "failed to generate download URL: {e}");
                        return BatchResponseObject::error(
                            obj,
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "download URL generation failed",
                        );
                    }
                }
            }
            TransferMode::Proxy => PresignedRequest {
                href: links.object(oid),
                header: HashMap::new(),
            },
        };

        BatchResponseObject {
            oid: obj.oid.clone(),
            size: obj.size,
            authenticated: Some(true),
            actions: Some(BatchResponseObjectActions {
                download: Some(BatchResponseObjectAction {
                    href: minted.href,
                    header: minted.header,
                    expires_in: Some(expires_in_secs(ACTION_TTL)),
                }),
                ..Default::default()
            }),
            error: None,
        }
    }

    /// Confirms an upload performed against a minted URL.
    pub async fn verify_upload(&self, ctx: &Context, oid: &str, size: i64) -> Result<()> {
        let oid: Oid = oid.parse()?;
        let size = Size::new(size)?;
        if size.is_zero() {
            return Err(ghlfs_common::ValueError::InvalidSize.into());
        }

        let mut record = match self.metadata.find(&oid).await {
            Ok(record) => record,
            Err(StoreError::NotFound) => return Err(Error::ObjectNotFound),
            Err(e) => return Err(Error::internal("metadata fetch failed", e)),
        };
        if record.size() != size {
            return Err(Error::SizeMismatch);
        }

        record.mark_as_uploaded(ctx);
        self.metadata
            .update(&record)
            .await
            .map_err(|e| Error::internal("metadata update failed", e))?;

        if let Err(e) = self.cache.delete(&upload_cache_key(&oid)).await {
            tracing::warn!(%oid, "failed to invalidate upload action cache: {e}");
        }
        tracing::info!(%oid, %size, "object verified");
        Ok(())
    }
}
