use std::sync::Arc;

use canopy_core::engine::{CheckError, PermissionReader};
use canopy_core::tree::TreeSnapshot;
use canopy_core::{CacheRow, Creative, CreativeId, UserId};
use canopy_storage::{CreativeStore, PermissionCacheStore, UserStore};

/// Serves the checker's reads from a tenant store.
pub struct StorePermissionReader<S> {
    store: Arc<S>,
}

impl<S> StorePermissionReader<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S> PermissionReader for StorePermissionReader<S>
where
    S: UserStore + CreativeStore + PermissionCacheStore,
{
    async fn creatives(&self, ids: &[CreativeId]) -> Result<Vec<Creative>, CheckError> {
        Ok(self.store.get_creatives(ids).await?)
    }

    async fn user_exists(&self, id: &UserId) -> Result<bool, CheckError> {
        Ok(self.store.get_user(id).await?.is_some())
    }

    async fn cache_rows(
        &self,
        creative_ids: &[CreativeId],
        user_id: Option<&UserId>,
    ) -> Result<Vec<CacheRow>, CheckError> {
        Ok(self.store.cache_rows(creative_ids, user_id).await?)
    }

    async fn ancestry(
        &self,
        ids: &[CreativeId],
        actor: Option<&UserId>,
    ) -> Result<TreeSnapshot, CheckError> {
        Ok(self.store.ancestry(ids, actor).await?)
    }
}
