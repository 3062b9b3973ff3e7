//! Object bytes streamed through the server instead of presigned URLs.

use std::{future::Future, sync::Arc, time::Duration};

use ghlfs_common::{Oid, Operation, RepositoryIdentifier, Size};

use crate::{
    authz::Authorizer,
    context::Context,
    error::{Error, Result, StorageError, StoreError},
    model::LfsObject,
    storage::{ObjectReader, ObjectStorage},
    store::MetadataStore,
};

pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub struct ProxyTransfer {
    authz: Arc<Authorizer>,
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStorage>,
    timeout: Duration,
}

impl ProxyTransfer {
    pub fn new(
        authz: Arc<Authorizer>,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStorage>,
        timeout: Duration,
    ) -> Self {
        Self {
            authz,
            metadata,
            storage,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::DeadlineExceeded)?
    }

    async fn find(&self, oid: &Oid) -> Result<LfsObject> {
        match self.metadata.find(oid).await {
            Ok(record) => Ok(record),
            Err(StoreError::NotFound) => Err(Error::ObjectNotFound),
            Err(e) => Err(Error::internal("metadata fetch failed", e)),
        }
    }

    /// Stores the request body for an object whose upload was planned by a
    /// batch call. `declared_size` is the request's `Content-Length`, if any.
    pub async fn upload(
        &self,
        ctx: &Context,
        repo: &RepositoryIdentifier,
        oid: &Oid,
        body: ObjectReader,
        declared_size: Option<u64>,
    ) -> Result<()> {
        self.with_deadline(async {
            self.authz
                .authorize(ctx, Operation::Upload, Some(repo), oid)
                .await?;
            let mut record = self.find(oid).await?;
            let size = declared_size.map(Size::from).unwrap_or(record.size());
            if size != record.size() {
                return Err(Error::SizeMismatch);
            }

            self.storage
                .put_object(record.storage_key(), body, size)
                .await?;

            record.mark_as_uploaded(ctx);
            self.metadata
                .update(&record)
                .await
                .map_err(|e| Error::internal("metadata update failed", e))?;
            tracing::info!(%oid, %size, %repo, "object uploaded through proxy");
            Ok(())
        })
        .await
    }

    /// Opens the stored object. The returned size is the recorded object size.
    pub async fn download(
        &self,
        ctx: &Context,
        repo: &RepositoryIdentifier,
        oid: &Oid,
    ) -> Result<(ObjectReader, u64)> {
        self.with_deadline(async {
            self.authz
                .authorize(ctx, Operation::Download, Some(repo), oid)
                .await?;
            let record = self.find(oid).await?;
            if !record.is_uploaded() {
                return Err(Error::NotUploaded);
            }
            let (reader, stored_len) = self
                .storage
                .get_object(record.storage_key())
                .await
                .map_err(|e| match e {
                    StorageError::NotFound => Error::ObjectNotFound,
                    e => Error::Storage(e),
                })?;
            let size = record.size().get();
            if let Some(stored_len) = stored_len.filter(|&len| len != size) {
                return Err(Error::Storage(StorageError::Backend(format!(
                    "stored object {oid} has {stored_len} bytes, expected {size}"
                ))));
            }
            Ok((reader, size))
        })
        .await
    }
}
