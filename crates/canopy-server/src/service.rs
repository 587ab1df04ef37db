use std::sync::Arc;

use canopy_core::engine::{
    CheckRequest, CheckResult, EngineConfig, PermissionChecker, RequestMemo,
};
use canopy_core::{
    Creative, CreativeId, NewCreative, NewShare, Permission, Share, ShareId, TenantId, User,
    UserId,
};
use canopy_storage::{
    CreativeStore, ShareStore, StorageError, StoreFactory, SweepReport, UserStore,
    run_sweep_cycle,
};

use crate::adapter::StorePermissionReader;
use crate::audit;
use crate::error::ApiError;
use crate::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct CreateCreativeInput {
    pub actor: UserId,
    pub parent_id: Option<CreativeId>,
    /// Makes the new creative an alias of this one.
    pub origin_id: Option<CreativeId>,
}

#[derive(Debug, Clone)]
pub struct GrantInput {
    pub actor: UserId,
    pub creative_id: CreativeId,
    /// `None` grants to everyone.
    pub user_id: Option<UserId>,
    pub permission: Permission,
}

pub struct PermissionService<F: StoreFactory> {
    factory: Arc<F>,
    engine_config: EngineConfig,
    metrics: Option<Arc<Metrics>>,
}

type Checker<F> = PermissionChecker<StorePermissionReader<<F as StoreFactory>::Store>>;

impl<F: StoreFactory> PermissionService<F> {
    pub fn new(factory: Arc<F>, engine_config: EngineConfig) -> Self {
        Self {
            factory,
            engine_config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn store(&self, tenant_id: &TenantId) -> F::Store {
        self.factory.for_tenant(tenant_id)
    }

    fn checker(&self, store: F::Store) -> Checker<F> {
        let reader = StorePermissionReader::new(Arc::new(store));
        PermissionChecker::new(Arc::new(reader), self.engine_config.clone())
    }

    pub async fn check(
        &self,
        tenant_id: &TenantId,
        request: &CheckRequest,
    ) -> Result<CheckResult, ApiError> {
        let checker = self.checker(self.store(tenant_id));
        let result = checker.check(request).await?;
        self.record_check(&result);

        tracing::debug!(
            creative_id = %request.creative_id,
            required = request.required.as_str(),
            allowed = result.allowed,
            source = %result.source,
            "permission checked"
        );
        Ok(result)
    }

    pub async fn has_permission(
        &self,
        tenant_id: &TenantId,
        creative_id: &CreativeId,
        actor: Option<&UserId>,
        required: Permission,
    ) -> Result<bool, ApiError> {
        let request = CheckRequest::new(*creative_id, actor.copied(), required);
        Ok(self.check(tenant_id, &request).await?.allowed)
    }

    /// Like [`has_permission`](Self::has_permission), but any error denies.
    pub async fn authorize(
        &self,
        tenant_id: &TenantId,
        creative_id: &CreativeId,
        actor: Option<&UserId>,
        required: Permission,
    ) -> bool {
        match self
            .has_permission(tenant_id, creative_id, actor, required)
            .await
        {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    creative_id = %creative_id,
                    error = %err,
                    "authorization failed closed"
                );
                false
            }
        }
    }

    /// The creatives among `ids` the actor holds `required` on, in input
    /// order, checked against one request memo.
    pub async fn filter_permitted(
        &self,
        tenant_id: &TenantId,
        ids: &[CreativeId],
        actor: Option<&UserId>,
        required: Permission,
    ) -> Result<Vec<CreativeId>, ApiError> {
        let checker = self.checker(self.store(tenant_id));
        let mut memo = RequestMemo::new();
        let permitted = checker
            .filter_permitted(&mut memo, ids, actor, required)
            .await?;

        tracing::debug!(
            requested = ids.len(),
            permitted = permitted.len(),
            memo_rows = memo.row_count(),
            "filtered creatives"
        );
        Ok(permitted)
    }

    pub async fn effective_origin(
        &self,
        tenant_id: &TenantId,
        creative_id: &CreativeId,
    ) -> Result<Creative, ApiError> {
        let checker = self.checker(self.store(tenant_id));
        let mut memo = RequestMemo::new();
        Ok(checker.effective_origin(&mut memo, creative_id).await?)
    }

    pub async fn create_user(&self, tenant_id: &TenantId, name: &str) -> Result<User, ApiError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::InvalidRequest(
                "user name must not be empty".to_string(),
            ));
        }
        Ok(self.store(tenant_id).create_user(name).await?)
    }

    pub async fn delete_user(&self, tenant_id: &TenantId, user_id: &UserId) -> Result<(), ApiError> {
        self.store(tenant_id).delete_user(user_id).await?;
        audit::audit_user_deleted(tenant_id, user_id);
        Ok(())
    }

    pub async fn create_creative(
        &self,
        tenant_id: &TenantId,
        input: CreateCreativeInput,
    ) -> Result<Creative, ApiError> {
        if let Some(ref parent) = input.parent_id {
            self.require(tenant_id, &input.actor, parent, Permission::Write, "create_creative")
                .await?;
        }
        if let Some(ref origin) = input.origin_id {
            self.require(tenant_id, &input.actor, origin, Permission::Read, "link_creative")
                .await?;
        }

        let new = NewCreative {
            owner_id: input.actor,
            parent_id: input.parent_id,
            origin_id: input.origin_id,
        };
        Ok(self.store(tenant_id).create_creative(&new).await?)
    }

    pub async fn move_creative(
        &self,
        tenant_id: &TenantId,
        actor: &UserId,
        creative_id: &CreativeId,
        new_parent: Option<&CreativeId>,
    ) -> Result<Creative, ApiError> {
        self.require_manage(tenant_id, actor, creative_id, "move_creative")
            .await?;
        if let Some(parent) = new_parent {
            self.require(tenant_id, actor, parent, Permission::Write, "move_creative")
                .await?;
        }

        let creative = self
            .store(tenant_id)
            .move_creative(creative_id, new_parent)
            .await?;
        audit::audit_creative_moved(tenant_id, &creative, actor);
        Ok(creative)
    }

    pub async fn delete_creative(
        &self,
        tenant_id: &TenantId,
        actor: &UserId,
        creative_id: &CreativeId,
    ) -> Result<Vec<CreativeId>, ApiError> {
        self.require_manage(tenant_id, actor, creative_id, "delete_creative")
            .await?;

        let deleted = self.store(tenant_id).delete_creative(creative_id).await?;
        audit::audit_creative_deleted(tenant_id, creative_id, deleted.len(), actor);
        Ok(deleted)
    }

    pub async fn grant(&self, tenant_id: &TenantId, input: GrantInput) -> Result<Share, ApiError> {
        self.require(
            tenant_id,
            &input.actor,
            &input.creative_id,
            Permission::Admin,
            "grant",
        )
        .await?;

        let new = NewShare::new(
            input.creative_id,
            input.user_id,
            input.permission,
            input.actor,
        );
        let share = self.store(tenant_id).create_share(&new).await?;
        audit::audit_share_granted(tenant_id, &share);
        Ok(share)
    }

    pub async fn change_grant(
        &self,
        tenant_id: &TenantId,
        actor: &UserId,
        share_id: &ShareId,
        permission: Permission,
    ) -> Result<Share, ApiError> {
        let store = self.store(tenant_id);
        let existing = store
            .get_share(share_id)
            .await?
            .ok_or_else(|| StorageError::not_found("share", share_id))?;
        self.require(
            tenant_id,
            actor,
            &existing.creative_id,
            Permission::Admin,
            "change_grant",
        )
        .await?;

        let share = store.update_share(share_id, permission).await?;
        audit::audit_share_changed(tenant_id, &share, actor);
        Ok(share)
    }

    /// Removes the share held by `user_id` (or the public share) on the
    /// creative. Rows it produced fall back to inherited grants.
    pub async fn revoke(
        &self,
        tenant_id: &TenantId,
        actor: &UserId,
        creative_id: &CreativeId,
        user_id: Option<&UserId>,
    ) -> Result<Share, ApiError> {
        self.require(tenant_id, actor, creative_id, Permission::Admin, "revoke")
            .await?;

        let store = self.store(tenant_id);
        let existing = store
            .find_share(creative_id, user_id)
            .await?
            .ok_or_else(|| {
                StorageError::not_found(
                    "share",
                    format!(
                        "{creative_id}/{}",
                        canopy_core::model::audience_label(user_id)
                    ),
                )
            })?;

        let share = store.destroy_share(&existing.id).await?;
        audit::audit_share_revoked(tenant_id, &share, actor);
        Ok(share)
    }

    pub async fn run_sweep(&self, tenant_id: &TenantId) -> Result<SweepReport, ApiError> {
        let store = self.store(tenant_id);
        match run_sweep_cycle(&store).await {
            Ok(report) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_sweep(&report);
                }
                audit::audit_sweep(tenant_id, &report);
                Ok(report)
            }
            Err(err) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.record_sweep_failure();
                }
                Err(err.into())
            }
        }
    }

    async fn require(
        &self,
        tenant_id: &TenantId,
        actor: &UserId,
        creative_id: &CreativeId,
        required: Permission,
        operation: &str,
    ) -> Result<(), ApiError> {
        let request = CheckRequest::new(*creative_id, Some(*actor), required);
        if self.check(tenant_id, &request).await?.allowed {
            return Ok(());
        }
        audit::audit_access_denied(tenant_id, Some(actor), creative_id, required, operation);
        Err(ApiError::forbidden(Some(actor), *creative_id, required))
    }

    /// Admin on the creative, or ownership of the alias itself.
    async fn require_manage(
        &self,
        tenant_id: &TenantId,
        actor: &UserId,
        creative_id: &CreativeId,
        operation: &str,
    ) -> Result<(), ApiError> {
        let creative = self
            .store(tenant_id)
            .get_creative(creative_id)
            .await?
            .ok_or_else(|| StorageError::not_found("creative", creative_id))?;
        if creative.is_alias() && creative.owner_id == *actor {
            return Ok(());
        }
        self.require(tenant_id, actor, creative_id, Permission::Admin, operation)
            .await
    }

    fn record_check(&self, result: &CheckResult) {
        if let Some(ref metrics) = self.metrics {
            metrics.record_check(result);
        }
    }
}
