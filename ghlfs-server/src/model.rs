use chrono::{DateTime, TimeDelta, Utc};
use ghlfs_common::{HashAlgorithm, Oid, RepositoryIdentifier, Size, StorageKey};
use serde::{Deserialize, Serialize};

use crate::context::{self, Context};

/// Metadata about a stored LFS object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LfsObject {
    oid: Oid,
    size: Size,
    hash_algo: HashAlgorithm,
    storage_key: StorageKey,
    uploaded: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl LfsObject {
    /// A freshly planned upload; bytes have not arrived yet.
    pub fn new(
        ctx: &Context,
        oid: Oid,
        size: Size,
        hash_algo: HashAlgorithm,
        storage_key: StorageKey,
    ) -> Self {
        let now = context::now(ctx);
        Self {
            oid,
            size,
            hash_algo,
            storage_key,
            uploaded: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn hash_algo(&self) -> HashAlgorithm {
        self.hash_algo
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.storage_key
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// `updated_at` always moves forward, even when the clock has not.
    pub fn mark_as_uploaded(&mut self, ctx: &Context) {
        let now = context::now(ctx);
        self.uploaded = true;
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + TimeDelta::nanoseconds(1)
        };
    }
}

/// Records which repository owns an OID. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    id: String,
    oid: Oid,
    repository: RepositoryIdentifier,
    created_at: DateTime<Utc>,
}

impl AccessPolicy {
    pub fn new(oid: Oid, repository: RepositoryIdentifier, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ghlfs_common::random_token(),
            oid,
            repository,
            created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    pub fn repository(&self) -> &RepositoryIdentifier {
        &self.repository
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::Clock as _, testing::FixedClock};

    fn object(ctx: &Context) -> LfsObject {
        let oid: Oid = "d".repeat(64).parse().unwrap();
        let key = StorageKey::for_object(&oid, "sha256").unwrap();
        LfsObject::new(ctx, oid, Size::from(1024), HashAlgorithm::Sha256, key)
    }

    #[test]
    fn test_new_object_is_pending() {
        let clock = FixedClock::at("2024-05-01T12:00:00Z");
        let obj = object(&clock.context());
        assert!(!obj.is_uploaded());
        assert_eq!(obj.created_at(), obj.updated_at());
    }

    #[test]
    fn test_mark_as_uploaded_advances_time() {
        let clock = FixedClock::at("2024-05-01T12:00:00Z");
        let ctx = clock.context();
        let mut obj = object(&ctx);
        let before = obj.updated_at();

        // Pinned clock: still strictly later.
        obj.mark_as_uploaded(&ctx);
        assert!(obj.is_uploaded());
        assert!(obj.updated_at() > before);
        assert!(obj.updated_at() >= obj.created_at());

        clock.advance(TimeDelta::seconds(30));
        let before = obj.updated_at();
        obj.mark_as_uploaded(&ctx);
        assert_eq!(obj.updated_at(), clock.now());
        assert!(obj.updated_at() > before);
    }
}
