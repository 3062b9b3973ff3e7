//! Persistence interfaces used by the core, with in-memory drivers.
//!
//! The in-memory drivers are what the server runs with out of the box; every
//! trait here can be backed by a real database without touching the core.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use ghlfs_common::Oid;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    error::StoreError,
    model::{AccessPolicy, LfsObject},
};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Returns [`StoreError::NotFound`] if no record exists for the OID.
    async fn find(&self, oid: &Oid) -> Result<LfsObject, StoreError>;
    /// Inserts a new record. Fails with [`StoreError::Conflict`] if one exists.
    async fn save(&self, obj: &LfsObject) -> Result<(), StoreError>;
    /// Replaces an existing record. Fails with [`StoreError::NotFound`] if absent.
    async fn update(&self, obj: &LfsObject) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn find_by_oid(&self, oid: &Oid) -> Result<Option<AccessPolicy>, StoreError>;
    /// Must reject a second policy for the same OID with [`StoreError::Conflict`].
    async fn save(&self, policy: &AccessPolicy) -> Result<(), StoreError>;
}

/// Short-lived key/value cache. A miss is reported as [`StoreError::NotFound`].
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Opaque blob storage with expiry, used for OAuth state and sessions.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Get-and-delete; a second call for the same key returns `None`.
    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

// ---------------------------- In-memory ----------------------------

#[derive(Default)]
pub struct MemoryMetadataStore {
    objects: Mutex<HashMap<Oid, LfsObject>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn find(&self, oid: &Oid) -> Result<LfsObject, StoreError> {
        self.objects
            .lock()
            .await
            .get(oid)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn save(&self, obj: &LfsObject) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().await;
        if objects.contains_key(obj.oid()) {
            return Err(StoreError::Conflict);
        }
        objects.insert(obj.oid().clone(), obj.clone());
        Ok(())
    }

    async fn update(&self, obj: &LfsObject) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().await;
        let Some(existing) = objects.get_mut(obj.oid()) else {
            return Err(StoreError::NotFound);
        };
        *existing = obj.clone();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPolicyStore {
    policies: Mutex<HashMap<Oid, AccessPolicy>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.policies.lock().await.len()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn find_by_oid(&self, oid: &Oid) -> Result<Option<AccessPolicy>, StoreError> {
        Ok(self.policies.lock().await.get(oid).cloned())
    }

    async fn save(&self, policy: &AccessPolicy) -> Result<(), StoreError> {
        // Check and insert under one lock: this is the OID uniqueness constraint.
        let mut policies = self.policies.lock().await;
        if policies.contains_key(policy.oid()) {
            return Err(StoreError::Conflict);
        }
        policies.insert(policy.oid().clone(), policy.clone());
        Ok(())
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Expiring key/value map serving both as [`Cache`] and [`BlobStore`].
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    async fn live(&self, key: &str, remove: bool) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        if remove {
            entries.remove(key).map(|e| e.value)
        } else {
            entries.get(key).map(|e| e.value.clone())
        }
    }

    /// Number of unexpired entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    async fn insert(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries.lock().await.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[async_trait]
impl Cache for MemoryKv {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.live(key, false).await.ok_or(StoreError::NotFound)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.insert(key, value, ttl).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryKv {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.insert(key, value, ttl).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.live(key, false).await)
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.live(key, true).await)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
