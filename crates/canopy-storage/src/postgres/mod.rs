pub mod migrations;
mod queries;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use canopy_core::materialize::{audiences_for_subtree, plan_subtree};
use canopy_core::model::{
    CacheKey, CacheRow, Creative, CreativeId, NewCreative, NewShare, Share, ShareId, TenantId,
    User, UserId,
};
use canopy_core::permission::Permission;
use canopy_core::tree::TreeSnapshot;

use crate::traits::{
    CreativeStore, OrphanReason, PermissionCacheStore, ShareStore, StorageError, StoreFactory,
    UserStore,
};

use queries::uuids;

fn schema_name_for_tenant(tenant_id: &TenantId) -> String {
    let simple = tenant_id.as_uuid().as_simple().to_string();
    format!("tenant_{simple}")
}

fn to_storage_error(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    schema: String,
}

impl PostgresStore {
    /// Opens a write transaction holding the tenant's write lock.
    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(to_storage_error)?;
        queries::lock_tenant(&mut *tx, &self.schema).await?;
        Ok(tx)
    }
}

async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), StorageError> {
    tx.commit().await.map_err(to_storage_error)
}

async fn require_creative(
    conn: &mut PgConnection,
    schema: &str,
    id: &CreativeId,
) -> Result<Creative, StorageError> {
    queries::fetch_creatives(conn, schema, &uuids([id]))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| StorageError::not_found("creative", id))
}

async fn require_user(
    conn: &mut PgConnection,
    schema: &str,
    id: &UserId,
) -> Result<(), StorageError> {
    match queries::fetch_user(conn, schema, id).await? {
        Some(_) => Ok(()),
        None => Err(StorageError::not_found("user", id)),
    }
}

/// The non-alias creative `id` stands for.
async fn resolve_origin(
    conn: &mut PgConnection,
    schema: &str,
    id: &CreativeId,
) -> Result<CreativeId, StorageError> {
    let creative = require_creative(&mut *conn, schema, id).await?;
    let Some(origin_id) = creative.origin_id else {
        return Ok(creative.id);
    };
    let origin = require_creative(&mut *conn, schema, &origin_id).await?;
    if origin.is_alias() {
        return Err(StorageError::Integrity(format!(
            "origin {origin_id} of alias {id} is itself an alias"
        )));
    }
    Ok(origin_id)
}

/// Rewrites every cache row under `node` inside the caller's transaction.
async fn recompute(
    conn: &mut PgConnection,
    schema: &str,
    node: &CreativeId,
) -> Result<usize, StorageError> {
    let chain = queries::fetch_chain(&mut *conn, schema, node).await?;
    let below = queries::fetch_subtree(&mut *conn, schema, node).await?;
    let subtree_ids = uuids(below.iter().map(|c| &c.id));

    let mut snapshot = TreeSnapshot::new();
    let mut ids = uuids(chain.iter().map(|c| &c.id));
    ids.extend(&subtree_ids);
    ids.sort();
    ids.dedup();
    for creative in chain.into_iter().chain(below) {
        snapshot.insert_creative(creative);
    }
    for share in queries::fetch_shares_on(&mut *conn, schema, &ids, None).await? {
        snapshot.insert_share(share);
    }

    let mut audiences = audiences_for_subtree(&snapshot, node)?;
    for audience in queries::fetch_cache_audiences(&mut *conn, schema, &subtree_ids).await? {
        if !audiences.contains(&audience) {
            audiences.push(audience);
        }
    }

    let plan = plan_subtree(&snapshot, node, &audiences)?;
    let written = plan.len();
    for key in &plan.clears {
        queries::delete_cache_row(&mut *conn, schema, key).await?;
    }
    for row in &plan.upserts {
        queries::upsert_cache_row(&mut *conn, schema, row).await?;
    }
    Ok(written)
}

impl UserStore for PostgresStore {
    async fn create_user(&self, name: &str) -> Result<User, StorageError> {
        let user = User {
            id: UserId::generate(),
            name: name.to_string(),
        };
        queries::insert_user(&self.pool, &self.schema, &user).await?;
        Ok(user)
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<User>, StorageError> {
        queries::fetch_user(&self.pool, &self.schema, id).await
    }

    async fn delete_user(&self, id: &UserId) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        queries::delete_cache_rows_for_user(&mut *tx, &self.schema, id).await?;
        let shares = queries::delete_shares_for_user(&mut *tx, &self.schema, id).await?;
        if !queries::delete_user(&mut *tx, &self.schema, id).await? {
            return Err(StorageError::not_found("user", id));
        }
        commit(tx).await?;

        tracing::debug!(user_id = %id, shares, "deleted user");
        Ok(())
    }
}

impl CreativeStore for PostgresStore {
    async fn create_creative(&self, new: &NewCreative) -> Result<Creative, StorageError> {
        let mut tx = self.begin().await?;
        require_user(&mut tx, &self.schema, &new.owner_id).await?;
        let parent_id = match new.parent_id {
            Some(ref parent) => Some(resolve_origin(&mut tx, &self.schema, parent).await?),
            None => None,
        };
        let origin_id = match new.origin_id {
            Some(ref origin) => Some(resolve_origin(&mut tx, &self.schema, origin).await?),
            None => None,
        };

        let creative = Creative {
            id: CreativeId::generate(),
            parent_id,
            origin_id,
            owner_id: new.owner_id,
        };
        queries::insert_creative(&mut *tx, &self.schema, &creative).await?;
        recompute(&mut tx, &self.schema, &creative.id).await?;
        commit(tx).await?;
        Ok(creative)
    }

    async fn get_creative(&self, id: &CreativeId) -> Result<Option<Creative>, StorageError> {
        Ok(
            queries::fetch_creatives(&self.pool, &self.schema, &uuids([id]))
                .await?
                .into_iter()
                .next(),
        )
    }

    async fn get_creatives(&self, ids: &[CreativeId]) -> Result<Vec<Creative>, StorageError> {
        queries::fetch_creatives(&self.pool, &self.schema, &uuids(ids)).await
    }

    async fn children(&self, id: &CreativeId) -> Result<Vec<Creative>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(to_storage_error)?;
        require_creative(&mut conn, &self.schema, id).await?;
        queries::fetch_children(&mut *conn, &self.schema, id).await
    }

    async fn move_creative(
        &self,
        id: &CreativeId,
        new_parent: Option<&CreativeId>,
    ) -> Result<Creative, StorageError> {
        let mut tx = self.begin().await?;
        let mut creative = require_creative(&mut tx, &self.schema, id).await?;
        let parent_id = match new_parent {
            Some(parent) => Some(resolve_origin(&mut tx, &self.schema, parent).await?),
            None => None,
        };
        if let Some(ref parent) = parent_id {
            let lineage = queries::fetch_chain(&mut *tx, &self.schema, parent).await?;
            if lineage.iter().any(|c| c.id == *id) {
                return Err(StorageError::InvalidMove(format!(
                    "creative {id} cannot move under itself or its descendant {parent}"
                )));
            }
        }

        queries::update_parent(&mut *tx, &self.schema, id, parent_id.as_ref()).await?;
        creative.parent_id = parent_id;
        let rewritten = recompute(&mut tx, &self.schema, id).await?;
        commit(tx).await?;

        tracing::debug!(creative_id = %id, rows = rewritten, "moved creative");
        Ok(creative)
    }

    async fn delete_creative(&self, id: &CreativeId) -> Result<Vec<CreativeId>, StorageError> {
        let mut tx = self.begin().await?;
        require_creative(&mut tx, &self.schema, id).await?;

        let mut doomed: HashSet<CreativeId> = queries::fetch_subtree(&mut *tx, &self.schema, id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        loop {
            let origins = uuids(doomed.iter());
            let aliases: Vec<CreativeId> =
                queries::fetch_aliases_of(&mut *tx, &self.schema, &origins)
                    .await?
                    .into_iter()
                    .map(|c| c.id)
                    .filter(|alias| !doomed.contains(alias))
                    .collect();
            if aliases.is_empty() {
                break;
            }
            for alias in aliases {
                for creative in queries::fetch_subtree(&mut *tx, &self.schema, &alias).await? {
                    doomed.insert(creative.id);
                }
            }
        }

        let ids = uuids(doomed.iter());
        queries::delete_cache_rows_on(&mut *tx, &self.schema, &ids).await?;
        queries::delete_shares_on(&mut *tx, &self.schema, &ids).await?;
        queries::delete_creatives(&mut *tx, &self.schema, &ids).await?;
        commit(tx).await?;

        let mut deleted: Vec<CreativeId> = doomed.into_iter().collect();
        deleted.sort();
        Ok(deleted)
    }

    async fn ancestry(
        &self,
        ids: &[CreativeId],
        actor: Option<&UserId>,
    ) -> Result<TreeSnapshot, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(to_storage_error)?;
        let lineage = queries::fetch_chains(&mut *conn, &self.schema, &uuids(ids)).await?;
        if let Some(missing) = ids
            .iter()
            .find(|id| !lineage.iter().any(|c| c.id == **id))
        {
            return Err(StorageError::not_found("creative", missing));
        }
        let found = uuids(lineage.iter().map(|c| &c.id));
        let shares = queries::fetch_shares_on(&mut *conn, &self.schema, &found, Some(actor)).await?;
        Ok(TreeSnapshot::from_parts(lineage, shares))
    }
}

impl ShareStore for PostgresStore {
    async fn create_share(&self, new: &NewShare) -> Result<Share, StorageError> {
        let mut tx = self.begin().await?;
        let creative_id = resolve_origin(&mut tx, &self.schema, &new.creative_id).await?;
        require_user(&mut tx, &self.schema, &new.shared_by_id).await?;
        if let Some(ref user) = new.user_id {
            require_user(&mut tx, &self.schema, user).await?;
        }

        let share = Share {
            id: ShareId::generate(),
            creative_id,
            user_id: new.user_id,
            permission: new.permission,
            shared_by_id: new.shared_by_id,
        };
        queries::insert_share(&mut *tx, &self.schema, &share).await?;
        let rewritten = recompute(&mut tx, &self.schema, &creative_id).await?;
        commit(tx).await?;

        tracing::debug!(share = %share, rows = rewritten, "created share");
        Ok(share)
    }

    async fn update_share(
        &self,
        id: &ShareId,
        permission: Permission,
    ) -> Result<Share, StorageError> {
        let mut tx = self.begin().await?;
        let share = queries::update_share_permission(&mut *tx, &self.schema, id, permission)
            .await?
            .ok_or_else(|| StorageError::not_found("share", id))?;
        recompute(&mut tx, &self.schema, &share.creative_id).await?;
        commit(tx).await?;
        Ok(share)
    }

    async fn destroy_share(&self, id: &ShareId) -> Result<Share, StorageError> {
        let mut tx = self.begin().await?;
        let share = queries::delete_share(&mut *tx, &self.schema, id)
            .await?
            .ok_or_else(|| StorageError::not_found("share", id))?;
        let rewritten = recompute(&mut tx, &self.schema, &share.creative_id).await?;
        commit(tx).await?;

        tracing::debug!(share = %share, rows = rewritten, "destroyed share");
        Ok(share)
    }

    async fn find_share(
        &self,
        creative_id: &CreativeId,
        user_id: Option<&UserId>,
    ) -> Result<Option<Share>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(to_storage_error)?;
        let root = resolve_origin(&mut conn, &self.schema, creative_id).await?;
        queries::find_share(&mut *conn, &self.schema, &root, user_id).await
    }

    async fn get_share(&self, id: &ShareId) -> Result<Option<Share>, StorageError> {
        queries::fetch_share(&self.pool, &self.schema, id).await
    }

    async fn list_shares(&self, creative_id: &CreativeId) -> Result<Vec<Share>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(to_storage_error)?;
        let root = resolve_origin(&mut conn, &self.schema, creative_id).await?;
        queries::fetch_shares_on(&mut *conn, &self.schema, &uuids([&root]), None).await
    }
}

impl PermissionCacheStore for PostgresStore {
    async fn cache_rows(
        &self,
        creative_ids: &[CreativeId],
        user_id: Option<&UserId>,
    ) -> Result<Vec<CacheRow>, StorageError> {
        queries::fetch_cache_rows(&self.pool, &self.schema, &uuids(creative_ids), user_id).await
    }

    async fn list_cache_rows(&self) -> Result<Vec<CacheRow>, StorageError> {
        queries::fetch_all_cache_rows(&self.pool, &self.schema).await
    }

    async fn orphan_candidates(&self) -> Result<Vec<CacheKey>, StorageError> {
        queries::fetch_orphan_candidates(&self.pool, &self.schema).await
    }

    async fn delete_cache_row_if_orphaned(
        &self,
        key: &CacheKey,
    ) -> Result<Option<OrphanReason>, StorageError> {
        queries::delete_cache_row_if_orphaned(&self.pool, &self.schema, key).await
    }
}

pub struct PostgresStoreFactory {
    pool: PgPool,
    schemas: Mutex<HashMap<TenantId, String>>,
}

impl PostgresStoreFactory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schemas: Mutex::new(HashMap::new()),
        }
    }

    pub async fn provision_tenant(
        &self,
        tenant_id: &TenantId,
        name: &str,
    ) -> Result<(), StorageError> {
        let schema_name = schema_name_for_tenant(tenant_id);

        sqlx::query(
            "INSERT INTO tenants (id, name, pg_schema) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(tenant_id.as_uuid())
        .bind(name)
        .bind(&schema_name)
        .execute(&self.pool)
        .await
        .map_err(to_storage_error)?;

        migrations::create_tenant_schema(&self.pool, &schema_name).await?;

        let mut schemas = self.schemas.lock().unwrap();
        schemas.insert(*tenant_id, schema_name);

        Ok(())
    }
}

impl StoreFactory for PostgresStoreFactory {
    type Store = PostgresStore;

    fn for_tenant(&self, tenant_id: &TenantId) -> PostgresStore {
        let schemas = self.schemas.lock().unwrap();
        let schema = schemas
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| schema_name_for_tenant(tenant_id));

        PostgresStore {
            pool: self.pool.clone(),
            schema,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn schema_name_is_valid_for_any_tenant() {
        for _ in 0..8 {
            let name = schema_name_for_tenant(&TenantId::generate());
            assert!(migrations::validate_schema_name(&name).is_ok(), "{name}");
        }
    }

    #[test]
    fn schema_name_uses_simple_uuid() {
        let tenant = TenantId::new(Uuid::nil());

        assert_eq!(
            schema_name_for_tenant(&tenant),
            "tenant_00000000000000000000000000000000"
        );
    }
}
