use std::sync::Arc;

use ghlfs_common::{HashAlgorithm, Oid, Operation, RepositoryIdentifier, Size, ValueError};

use crate::{
    api::{BatchRequest, BatchRequestObject, BatchResponse, TransferAdapter},
    authz::{Authorizer, Decision},
    context::Context,
    error::{Error, Result, StoreError},
    model::AccessPolicy,
    store::PolicyStore,
    transfer::{Links, TransferPlanner},
};

struct ValidatedObject<'a> {
    request: &'a BatchRequestObject,
    oid: Oid,
    size: Size,
}

/// Runs the Git LFS `objects/batch` operation.
pub struct BatchService {
    authz: Arc<Authorizer>,
    planner: Arc<TransferPlanner>,
    policies: Arc<dyn PolicyStore>,
}

impl BatchService {
    pub fn new(
        authz: Arc<Authorizer>,
        planner: Arc<TransferPlanner>,
        policies: Arc<dyn PolicyStore>,
    ) -> Self {
        Self {
            authz,
            planner,
            policies,
        }
    }

    /// Objects are processed one after another, and the response lists them
    /// in request order. An authorization failure on any object fails the
    /// whole batch with [`Error::AccessDenied`].
    pub async fn handle_batch_request(
        &self,
        ctx: &Context,
        base_url: &str,
        owner: &str,
        repo: &str,
        request: &BatchRequest,
        repository: Option<&RepositoryIdentifier>,
    ) -> Result<BatchResponse> {
        let operation: Operation = request.operation.parse()?;
        if request.objects.is_empty() {
            return Err(Error::NoObjects);
        }
        let objects = request
            .objects
            .iter()
            .map(|obj| -> Result<ValidatedObject, ValueError> {
                Ok(ValidatedObject {
                    request: obj,
                    oid: obj.oid.parse()?,
                    size: Size::new(obj.size)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let hash_algo = HashAlgorithm::parse(request.hash_algo.as_deref().unwrap_or(""))?;
        if !request.transfers.is_empty() && !request.transfers.contains(&TransferAdapter::Basic) {
            return Err(Error::UnsupportedTransfer);
        }

        let links = Links {
            base_url,
            owner,
            repo,
        };
        tracing::debug!(
            %operation,
            objects = objects.len(),
            repository = %repository.map(ToString::to_string).unwrap_or_default(),
            "handling batch request"
        );

        let mut responses = Vec::with_capacity(objects.len());
        match operation {
            Operation::Download => {
                for obj in &objects {
                    self.authorize(ctx, Operation::Download, repository, &obj.oid)
                        .await?;
                    responses.push(
                        self.planner
                            .plan_download(ctx, links, obj.request, &obj.oid)
                            .await,
                    );
                }
            }
            Operation::Upload => {
                for obj in &objects {
                    let decision = self
                        .authorize(ctx, Operation::Upload, repository, &obj.oid)
                        .await?;
                    let plan = self
                        .planner
                        .plan_upload(
                            ctx,
                            links,
                            obj.request,
                            &obj.oid,
                            obj.size,
                            hash_algo.as_str(),
                        )
                        .await;
                    if decision.is_new_object && plan.response.error.is_none() {
                        if let Some(owner) = repository {
                            self.install_policy(ctx, &obj.oid, owner).await?;
                        }
                    }
                    responses.push(plan.response);
                }
            }
        }

        Ok(BatchResponse {
            transfer: TransferAdapter::Basic,
            objects: responses,
            hash_algo,
        })
    }

    async fn authorize(
        &self,
        ctx: &Context,
        operation: Operation,
        repository: Option<&RepositoryIdentifier>,
        oid: &Oid,
    ) -> Result<Decision> {
        match self.authz.authorize(ctx, operation, repository, oid).await {
            Ok(decision) => Ok(decision),
            Err(Error::AuthorizationDenied)
            | Err(Error::Value(ValueError::InvalidRepositoryIdentifier)) => {
                tracing::debug!(%oid, %operation, "object access denied");
                Err(Error::AccessDenied)
            }
            Err(e) => Err(e),
        }
    }

    /// Claims ownership of a new OID. When a concurrent request won the race,
    /// the stored policy decides: same repository is fine, anything else is
    /// denied.
    async fn install_policy(
        &self,
        ctx: &Context,
        oid: &Oid,
        owner: &RepositoryIdentifier,
    ) -> Result<()> {
        let policy = AccessPolicy::new(oid.clone(), owner.clone(), ctx.now());
        match self.policies.save(&policy).await {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict) => match self.policies.find_by_oid(oid).await {
                Ok(Some(existing)) if existing.repository() == owner => Ok(()),
                Ok(_) => Err(Error::AccessDenied),
                Err(e) => Err(Error::internal("policy creation failed", e)),
            },
            Err(e) => Err(Error::internal("policy creation failed", e)),
        }
    }
}
