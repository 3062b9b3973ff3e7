use std::sync::Arc;

use ghlfs_common::{Oid, Operation, RepositoryIdentifier, ValueError};

use crate::{
    context::Context,
    error::{Error, Result, StoreError},
    model::AccessPolicy,
    store::PolicyStore,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// No policy exists yet; the caller is expected to install one once the
    /// upload has been planned.
    pub is_new_object: bool,
}

/// Decides per-object access from the stored access policies.
///
/// The first repository to upload an OID owns it. Afterwards only that
/// repository may upload or download it. Repository comparison here is
/// case-sensitive.
pub struct Authorizer {
    policies: Arc<dyn PolicyStore>,
}

impl Authorizer {
    pub fn new(policies: Arc<dyn PolicyStore>) -> Self {
        Self { policies }
    }

    async fn find_policy(&self, oid: &Oid) -> Result<Option<AccessPolicy>> {
        match self.policies.find_by_oid(oid).await {
            Ok(policy) => Ok(policy),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(Error::internal("policy lookup failed", e)),
        }
    }

    pub async fn authorize(
        &self,
        _ctx: &Context,
        operation: Operation,
        user_repo: Option<&RepositoryIdentifier>,
        oid: &Oid,
    ) -> Result<Decision> {
        let Some(user_repo) = user_repo else {
            return Err(ValueError::InvalidRepositoryIdentifier.into());
        };

        match self.find_policy(oid).await? {
            None => match operation {
                Operation::Upload => Ok(Decision {
                    allowed: true,
                    is_new_object: true,
                }),
                Operation::Download => Err(Error::AuthorizationDenied),
            },
            Some(policy) if policy.repository() == user_repo => Ok(Decision {
                allowed: true,
                is_new_object: false,
            }),
            Some(_) => Err(Error::AuthorizationDenied),
        }
    }

    /// Read-only check: does `user_repo` own `oid`?
    pub async fn can_access(
        &self,
        _ctx: &Context,
        user_repo: &RepositoryIdentifier,
        oid: &Oid,
    ) -> Result<bool> {
        Ok(self
            .find_policy(oid)
            .await?
            .is_some_and(|policy| policy.repository() == user_repo))
    }
}
