use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use aws_sdk_s3::{
    error::SdkError,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
};
use ghlfs_common::{Size, StorageKey};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{error::StorageError, health::HealthCheck};

pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// A request the client may perform directly against object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedRequest {
    pub href: String,
    pub header: HashMap<String, String>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn presign_put(
        &self,
        key: &StorageKey,
        size: Size,
        expires_in: Duration,
    ) -> Result<PresignedRequest, StorageError>;

    async fn presign_get(
        &self,
        key: &StorageKey,
        expires_in: Duration,
    ) -> Result<PresignedRequest, StorageError>;

    /// Opens a streaming reader. The second value is the length reported by
    /// the backend, if any.
    async fn get_object(&self, key: &StorageKey)
        -> Result<(ObjectReader, Option<u64>), StorageError>;

    /// Stores exactly `size` bytes read from `body`.
    async fn put_object(
        &self,
        key: &StorageKey,
        body: ObjectReader,
        size: Size,
    ) -> Result<(), StorageError>;
}

pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

fn presigning_config(
    expires_in: Duration,
) -> Result<aws_sdk_s3::presigning::PresigningConfig, StorageError> {
    aws_sdk_s3::presigning::PresigningConfig::expires_in(expires_in)
        .map_err(|e| StorageError::Backend(format!("invalid presigning config: {e}")))
}

fn into_presigned(req: aws_sdk_s3::presigning::PresignedRequest) -> PresignedRequest {
    PresignedRequest {
        header: req
            .headers()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect(),
        href: req.uri().to_string(),
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn presign_put(
        &self,
        key: &StorageKey,
        size: Size,
        expires_in: Duration,
    ) -> Result<PresignedRequest, StorageError> {
        let content_length = i64::try_from(size.get())
            .map_err(|_| StorageError::Backend("object too large".to_string()))?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_length(content_length)
            .presigned(presigning_config(expires_in)?)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to presign PutObject: {e}")))?;
        Ok(into_presigned(presigned))
    }

    async fn presign_get(
        &self,
        key: &StorageKey,
        expires_in: Duration,
    ) -> Result<PresignedRequest, StorageError> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .presigned(presigning_config(expires_in)?)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to presign GetObject: {e}")))?;
        Ok(into_presigned(presigned))
    }

    async fn get_object(
        &self,
        key: &StorageKey,
    ) -> Result<(ObjectReader, Option<u64>), StorageError> {
        let result = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(result) => result,
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                return Err(StorageError::NotFound);
            }
            Err(e) => {
                return Err(StorageError::Backend(format!(
                    "failed to GetObject {key}: {e}"
                )))
            }
        };
        let length = result
            .content_length()
            .and_then(|len| u64::try_from(len).ok());
        Ok((Box::new(result.body.into_async_read()), length))
    }

    async fn put_object(
        &self,
        key: &StorageKey,
        mut body: ObjectReader,
        size: Size,
    ) -> Result<(), StorageError> {
        let part_size = part_size(size.get());
        if size.get() <= part_size {
            let buf = read_part(&mut body, size.get()).await?;
            expect_end(&mut body).await?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key.as_str())
                .content_length(buf.len() as i64)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| StorageError::Backend(format!("failed to PutObject {key}: {e}")))?;
            return Ok(());
        }

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!("failed to CreateMultipartUpload {key}: {e}"))
            })?;
        let Some(upload_id) = upload.upload_id() else {
            return Err(StorageError::Backend(format!(
                "CreateMultipartUpload {key} returned no upload id"
            )));
        };

        let parts = match self
            .upload_parts(key, upload_id, &mut body, size.get(), part_size)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key.as_str())
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(%key, "failed to abort multipart upload: {abort}");
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key.as_str())
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!("failed to CompleteMultipartUpload {key}: {e}"))
            })?;
        Ok(())
    }
}

impl S3Storage {
    /// Sends `size` bytes of `body` as consecutive parts. At most one part is
    /// held in memory at a time.
    async fn upload_parts(
        &self,
        key: &StorageKey,
        upload_id: &str,
        body: &mut ObjectReader,
        size: u64,
        part_size: u64,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut parts = Vec::new();
        let mut remaining = size;
        let mut part_number = 1;
        while remaining > 0 {
            let len = remaining.min(part_size);
            let buf = read_part(body, len).await?;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key.as_str())
                .upload_id(upload_id)
                .part_number(part_number)
                .content_length(len as i64)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| {
                    StorageError::Backend(format!(
                        "failed to UploadPart {part_number} of {key}: {e}"
                    ))
                })?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_owned))
                    .part_number(part_number)
                    .build(),
            );
            remaining -= len;
            part_number += 1;
        }
        expect_end(body).await?;
        Ok(parts)
    }
}

const MIN_PART_SIZE: u64 = 8 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;

/// Part length for a multipart upload of `size` bytes, staying within the
/// S3 part-count limit.
fn part_size(size: u64) -> u64 {
    MIN_PART_SIZE.max(size.div_ceil(MAX_PARTS))
}

fn length_mismatch(msg: String) -> StorageError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
}

/// Reads exactly `len` bytes.
async fn read_part(body: &mut ObjectReader, len: u64) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::with_capacity(len as usize);
    (&mut *body).take(len).read_to_end(&mut buf).await?;
    if buf.len() as u64 != len {
        return Err(length_mismatch(format!(
            "body ended after {} of {len} bytes",
            buf.len()
        )));
    }
    Ok(buf)
}

async fn expect_end(body: &mut ObjectReader) -> Result<(), StorageError> {
    let mut extra = [0u8; 1];
    if body.read(&mut extra).await? != 0 {
        return Err(length_mismatch("body longer than declared size".to_string()));
    }
    Ok(())
}

#[async_trait]
impl HealthCheck for S3Storage {
    fn name(&self) -> &str {
        "object_storage"
    }

    async fn check(&self) -> Result<(), String> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| format!("HeadBucket failed: {e}"))
    }
}
