use uuid::Uuid;

use canopy_core::model::{CacheKey, CacheRow, Creative, CreativeId, Share, ShareId, User, UserId};
use canopy_core::permission::Permission;

use crate::traits::{OrphanReason, StorageError};

/// Recursion bound for tree queries; deeper chains are treated as cycles.
const MAX_TREE_DEPTH: i32 = 4096;

type CreativeRecord = (Uuid, Option<Uuid>, Option<Uuid>, Uuid);
type ShareRecord = (Uuid, Uuid, Option<Uuid>, String, Uuid);
type CacheRecord = (Uuid, Option<Uuid>, String, Option<Uuid>);

fn to_storage_error(e: sqlx::Error) -> StorageError {
    StorageError::Internal(e.to_string())
}

fn parse_permission(value: &str) -> Result<Permission, StorageError> {
    value
        .parse::<Permission>()
        .map_err(|e| StorageError::Integrity(e.to_string()))
}

fn creative_from(record: CreativeRecord) -> Creative {
    let (id, parent_id, origin_id, owner_id) = record;
    Creative {
        id: CreativeId::new(id),
        parent_id: parent_id.map(CreativeId::new),
        origin_id: origin_id.map(CreativeId::new),
        owner_id: UserId::new(owner_id),
    }
}

fn share_from(record: ShareRecord) -> Result<Share, StorageError> {
    let (id, creative_id, user_id, permission, shared_by_id) = record;
    Ok(Share {
        id: ShareId::new(id),
        creative_id: CreativeId::new(creative_id),
        user_id: user_id.map(UserId::new),
        permission: parse_permission(&permission)?,
        shared_by_id: UserId::new(shared_by_id),
    })
}

fn cache_row_from(record: CacheRecord) -> Result<CacheRow, StorageError> {
    let (creative_id, user_id, permission, source_share_id) = record;
    Ok(CacheRow {
        creative_id: CreativeId::new(creative_id),
        user_id: user_id.map(UserId::new),
        permission: parse_permission(&permission)?,
        source_share_id: source_share_id.map(ShareId::new),
    })
}

pub fn uuids<'a>(ids: impl IntoIterator<Item = &'a CreativeId>) -> Vec<Uuid> {
    ids.into_iter().map(|id| *id.as_uuid()).collect()
}

fn audience_uuid(user_id: Option<&UserId>) -> Option<Uuid> {
    user_id.map(|u| *u.as_uuid())
}

/// Serialises tree and share writes within one tenant until the
/// surrounding transaction ends.
pub async fn lock_tenant<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
) -> Result<(), StorageError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(schema)
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

// users

pub async fn insert_user<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    user: &User,
) -> Result<(), StorageError> {
    let query = format!("INSERT INTO {schema}.users (id, name) VALUES ($1, $2)");
    sqlx::query(&query)
        .bind(user.id.as_uuid())
        .bind(&user.name)
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

pub async fn fetch_user<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    id: &UserId,
) -> Result<Option<User>, StorageError> {
    let query = format!("SELECT id, name FROM {schema}.users WHERE id = $1");
    let row: Option<(Uuid, String)> = sqlx::query_as(&query)
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(row.map(|(id, name)| User {
        id: UserId::new(id),
        name,
    }))
}

pub async fn delete_user<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    id: &UserId,
) -> Result<bool, StorageError> {
    let query = format!("DELETE FROM {schema}.users WHERE id = $1");
    let result = sqlx::query(&query)
        .bind(id.as_uuid())
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(result.rows_affected() > 0)
}

// creatives

pub async fn insert_creative<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    creative: &Creative,
) -> Result<(), StorageError> {
    let query = format!(
        "INSERT INTO {schema}.creatives (id, parent_id, origin_id, owner_id) VALUES ($1, $2, $3, $4)"
    );
    sqlx::query(&query)
        .bind(creative.id.as_uuid())
        .bind(creative.parent_id.map(|p| *p.as_uuid()))
        .bind(creative.origin_id.map(|o| *o.as_uuid()))
        .bind(creative.owner_id.as_uuid())
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

pub async fn fetch_creatives<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    ids: &[Uuid],
) -> Result<Vec<Creative>, StorageError> {
    let query = format!(
        "SELECT id, parent_id, origin_id, owner_id FROM {schema}.creatives WHERE id = ANY($1)"
    );
    let rows: Vec<CreativeRecord> = sqlx::query_as(&query)
        .bind(ids)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(rows.into_iter().map(creative_from).collect())
}

pub async fn fetch_children<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    id: &CreativeId,
) -> Result<Vec<Creative>, StorageError> {
    let query = format!(
        "SELECT id, parent_id, origin_id, owner_id FROM {schema}.creatives \
         WHERE parent_id = $1 ORDER BY id"
    );
    let rows: Vec<CreativeRecord> = sqlx::query_as(&query)
        .bind(id.as_uuid())
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(rows.into_iter().map(creative_from).collect())
}

pub async fn fetch_aliases_of<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    origins: &[Uuid],
) -> Result<Vec<Creative>, StorageError> {
    let query = format!(
        "SELECT id, parent_id, origin_id, owner_id FROM {schema}.creatives \
         WHERE origin_id = ANY($1)"
    );
    let rows: Vec<CreativeRecord> = sqlx::query_as(&query)
        .bind(origins)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(rows.into_iter().map(creative_from).collect())
}

/// `id` followed by its ancestors, nearest first.
pub async fn fetch_chain<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    id: &CreativeId,
) -> Result<Vec<Creative>, StorageError> {
    let query = format!(
        r#"
        WITH RECURSIVE lineage AS (
            SELECT id, parent_id, origin_id, owner_id, 0 AS depth
            FROM {schema}.creatives WHERE id = $1
            UNION ALL
            SELECT c.id, c.parent_id, c.origin_id, c.owner_id, lineage.depth + 1
            FROM {schema}.creatives c
            JOIN lineage ON c.id = lineage.parent_id
            WHERE lineage.depth < $2
        )
        SELECT id, parent_id, origin_id, owner_id FROM lineage ORDER BY depth
        "#
    );
    let rows: Vec<CreativeRecord> = sqlx::query_as(&query)
        .bind(id.as_uuid())
        .bind(MAX_TREE_DEPTH)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(rows.into_iter().map(creative_from).collect())
}

/// Every creative in `ids` and all of their ancestors, each once.
pub async fn fetch_chains<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    ids: &[Uuid],
) -> Result<Vec<Creative>, StorageError> {
    let query = format!(
        r#"
        WITH RECURSIVE lineage AS (
            SELECT id, parent_id, origin_id, owner_id, 0 AS depth
            FROM {schema}.creatives WHERE id = ANY($1)
            UNION ALL
            SELECT c.id, c.parent_id, c.origin_id, c.owner_id, lineage.depth + 1
            FROM {schema}.creatives c
            JOIN lineage ON c.id = lineage.parent_id
            WHERE lineage.depth < $2
        )
        SELECT DISTINCT id, parent_id, origin_id, owner_id FROM lineage
        "#
    );
    let rows: Vec<CreativeRecord> = sqlx::query_as(&query)
        .bind(ids)
        .bind(MAX_TREE_DEPTH)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(rows.into_iter().map(creative_from).collect())
}

/// `id` and everything below it.
pub async fn fetch_subtree<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    id: &CreativeId,
) -> Result<Vec<Creative>, StorageError> {
    let query = format!(
        r#"
        WITH RECURSIVE below AS (
            SELECT id, parent_id, origin_id, owner_id, 0 AS depth
            FROM {schema}.creatives WHERE id = $1
            UNION ALL
            SELECT c.id, c.parent_id, c.origin_id, c.owner_id, below.depth + 1
            FROM {schema}.creatives c
            JOIN below ON c.parent_id = below.id
            WHERE below.depth < $2
        )
        SELECT id, parent_id, origin_id, owner_id FROM below
        "#
    );
    let rows: Vec<CreativeRecord> = sqlx::query_as(&query)
        .bind(id.as_uuid())
        .bind(MAX_TREE_DEPTH)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(rows.into_iter().map(creative_from).collect())
}

pub async fn update_parent<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    id: &CreativeId,
    parent_id: Option<&CreativeId>,
) -> Result<(), StorageError> {
    let query = format!("UPDATE {schema}.creatives SET parent_id = $2 WHERE id = $1");
    sqlx::query(&query)
        .bind(id.as_uuid())
        .bind(parent_id.map(|p| *p.as_uuid()))
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

pub async fn delete_creatives<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    ids: &[Uuid],
) -> Result<(), StorageError> {
    let query = format!("DELETE FROM {schema}.creatives WHERE id = ANY($1)");
    sqlx::query(&query)
        .bind(ids)
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

// shares

const SHARE_COLUMNS: &str = "id, creative_id, user_id, permission, shared_by_id";

pub async fn insert_share<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    share: &Share,
) -> Result<(), StorageError> {
    let query = format!("INSERT INTO {schema}.shares ({SHARE_COLUMNS}) VALUES ($1, $2, $3, $4, $5)");
    sqlx::query(&query)
        .bind(share.id.as_uuid())
        .bind(share.creative_id.as_uuid())
        .bind(audience_uuid(share.user_id.as_ref()))
        .bind(share.permission.as_str())
        .bind(share.shared_by_id.as_uuid())
        .execute(executor)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StorageError::DuplicateShare {
                    creative_id: share.creative_id,
                    audience: canopy_core::model::audience_label(share.user_id.as_ref()),
                };
            }
            to_storage_error(e)
        })?;
    Ok(())
}

pub async fn fetch_share<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    id: &ShareId,
) -> Result<Option<Share>, StorageError> {
    let query = format!("SELECT {SHARE_COLUMNS} FROM {schema}.shares WHERE id = $1");
    let row: Option<ShareRecord> = sqlx::query_as(&query)
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    row.map(share_from).transpose()
}

pub async fn find_share<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    creative_id: &CreativeId,
    user_id: Option<&UserId>,
) -> Result<Option<Share>, StorageError> {
    let query = format!(
        "SELECT {SHARE_COLUMNS} FROM {schema}.shares \
         WHERE creative_id = $1 AND user_id IS NOT DISTINCT FROM $2"
    );
    let row: Option<ShareRecord> = sqlx::query_as(&query)
        .bind(creative_id.as_uuid())
        .bind(audience_uuid(user_id))
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    row.map(share_from).transpose()
}

/// Shares on `creative_ids`; with `actor` set, only the actor's and the
/// public ones.
pub async fn fetch_shares_on<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    creative_ids: &[Uuid],
    actor: Option<Option<&UserId>>,
) -> Result<Vec<Share>, StorageError> {
    let rows: Vec<ShareRecord> = match actor {
        None => {
            let query = format!(
                "SELECT {SHARE_COLUMNS} FROM {schema}.shares \
                 WHERE creative_id = ANY($1) ORDER BY user_id NULLS FIRST"
            );
            sqlx::query_as(&query)
                .bind(creative_ids)
                .fetch_all(executor)
                .await
        }
        Some(actor) => {
            let query = format!(
                "SELECT {SHARE_COLUMNS} FROM {schema}.shares \
                 WHERE creative_id = ANY($1) AND (user_id IS NULL OR user_id = $2)"
            );
            sqlx::query_as(&query)
                .bind(creative_ids)
                .bind(audience_uuid(actor))
                .fetch_all(executor)
                .await
        }
    }
    .map_err(to_storage_error)?;
    rows.into_iter().map(share_from).collect()
}

pub async fn update_share_permission<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    id: &ShareId,
    permission: Permission,
) -> Result<Option<Share>, StorageError> {
    let query = format!(
        "UPDATE {schema}.shares SET permission = $2, updated_at = now() \
         WHERE id = $1 RETURNING {SHARE_COLUMNS}"
    );
    let row: Option<ShareRecord> = sqlx::query_as(&query)
        .bind(id.as_uuid())
        .bind(permission.as_str())
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    row.map(share_from).transpose()
}

pub async fn delete_share<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    id: &ShareId,
) -> Result<Option<Share>, StorageError> {
    let query = format!("DELETE FROM {schema}.shares WHERE id = $1 RETURNING {SHARE_COLUMNS}");
    let row: Option<ShareRecord> = sqlx::query_as(&query)
        .bind(id.as_uuid())
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    row.map(share_from).transpose()
}

pub async fn delete_shares_for_user<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    user_id: &UserId,
) -> Result<u64, StorageError> {
    let query = format!("DELETE FROM {schema}.shares WHERE user_id = $1");
    let result = sqlx::query(&query)
        .bind(user_id.as_uuid())
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(result.rows_affected())
}

pub async fn delete_shares_on<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    creative_ids: &[Uuid],
) -> Result<(), StorageError> {
    let query = format!("DELETE FROM {schema}.shares WHERE creative_id = ANY($1)");
    sqlx::query(&query)
        .bind(creative_ids)
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

// permission cache

const CACHE_COLUMNS: &str = "creative_id, user_id, permission, source_share_id";

pub async fn fetch_cache_rows<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    creative_ids: &[Uuid],
    user_id: Option<&UserId>,
) -> Result<Vec<CacheRow>, StorageError> {
    let query = format!(
        "SELECT {CACHE_COLUMNS} FROM {schema}.permission_cache \
         WHERE creative_id = ANY($1) AND (user_id IS NULL OR user_id = $2)"
    );
    let rows: Vec<CacheRecord> = sqlx::query_as(&query)
        .bind(creative_ids)
        .bind(audience_uuid(user_id))
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    rows.into_iter().map(cache_row_from).collect()
}

pub async fn fetch_all_cache_rows<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
) -> Result<Vec<CacheRow>, StorageError> {
    let query = format!(
        "SELECT {CACHE_COLUMNS} FROM {schema}.permission_cache \
         ORDER BY creative_id, user_id NULLS FIRST"
    );
    let rows: Vec<CacheRecord> = sqlx::query_as(&query)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    rows.into_iter().map(cache_row_from).collect()
}

/// Distinct audiences holding a row on any of `creative_ids`.
pub async fn fetch_cache_audiences<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    creative_ids: &[Uuid],
) -> Result<Vec<Option<UserId>>, StorageError> {
    let query = format!(
        "SELECT DISTINCT user_id FROM {schema}.permission_cache WHERE creative_id = ANY($1)"
    );
    let rows: Vec<(Option<Uuid>,)> = sqlx::query_as(&query)
        .bind(creative_ids)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(rows.into_iter().map(|(u,)| u.map(UserId::new)).collect())
}

/// Concurrent writers of the same key converge on the last value.
pub async fn upsert_cache_row<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    row: &CacheRow,
) -> Result<(), StorageError> {
    let query = format!(
        r#"
        INSERT INTO {schema}.permission_cache ({CACHE_COLUMNS})
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (creative_id, user_id) DO UPDATE
        SET permission = EXCLUDED.permission,
            source_share_id = EXCLUDED.source_share_id,
            updated_at = now()
        "#
    );
    sqlx::query(&query)
        .bind(row.creative_id.as_uuid())
        .bind(audience_uuid(row.user_id.as_ref()))
        .bind(row.permission.as_str())
        .bind(row.source_share_id.map(|s| *s.as_uuid()))
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

pub async fn delete_cache_row<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    key: &CacheKey,
) -> Result<(), StorageError> {
    let query = format!(
        "DELETE FROM {schema}.permission_cache \
         WHERE creative_id = $1 AND user_id IS NOT DISTINCT FROM $2"
    );
    sqlx::query(&query)
        .bind(key.creative_id.as_uuid())
        .bind(audience_uuid(key.user_id.as_ref()))
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

pub async fn delete_cache_rows_on<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    creative_ids: &[Uuid],
) -> Result<(), StorageError> {
    let query = format!("DELETE FROM {schema}.permission_cache WHERE creative_id = ANY($1)");
    sqlx::query(&query)
        .bind(creative_ids)
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

pub async fn delete_cache_rows_for_user<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    user_id: &UserId,
) -> Result<(), StorageError> {
    let query = format!("DELETE FROM {schema}.permission_cache WHERE user_id = $1");
    sqlx::query(&query)
        .bind(user_id.as_uuid())
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

fn orphan_condition(schema: &str) -> String {
    format!(
        r#"(
            NOT EXISTS (SELECT 1 FROM {schema}.creatives c WHERE c.id = pc.creative_id)
            OR (pc.user_id IS NOT NULL
                AND NOT EXISTS (SELECT 1 FROM {schema}.users u WHERE u.id = pc.user_id))
            OR (pc.source_share_id IS NOT NULL
                AND NOT EXISTS (SELECT 1 FROM {schema}.shares sh WHERE sh.id = pc.source_share_id))
        )"#
    )
}

pub async fn fetch_orphan_candidates<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
) -> Result<Vec<CacheKey>, StorageError> {
    let condition = orphan_condition(schema);
    let query = format!(
        "SELECT pc.creative_id, pc.user_id FROM {schema}.permission_cache pc WHERE {condition}"
    );
    let rows: Vec<(Uuid, Option<Uuid>)> = sqlx::query_as(&query)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(rows
        .into_iter()
        .map(|(creative_id, user_id)| {
            CacheKey::new(CreativeId::new(creative_id), user_id.map(UserId::new))
        })
        .collect())
}

/// Check and delete happen in one statement, so a row repaired since the
/// scan is left alone.
pub async fn delete_cache_row_if_orphaned<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    schema: &str,
    key: &CacheKey,
) -> Result<Option<OrphanReason>, StorageError> {
    let condition = orphan_condition(schema);
    let query = format!(
        r#"
        DELETE FROM {schema}.permission_cache pc
        WHERE pc.creative_id = $1
          AND pc.user_id IS NOT DISTINCT FROM $2
          AND {condition}
        RETURNING CASE
            WHEN NOT EXISTS (SELECT 1 FROM {schema}.creatives c WHERE c.id = pc.creative_id)
                THEN 'missing_creative'
            WHEN pc.user_id IS NOT NULL
                AND NOT EXISTS (SELECT 1 FROM {schema}.users u WHERE u.id = pc.user_id)
                THEN 'missing_user'
            ELSE 'missing_share'
        END
        "#
    );
    let row: Option<(String,)> = sqlx::query_as(&query)
        .bind(key.creative_id.as_uuid())
        .bind(audience_uuid(key.user_id.as_ref()))
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    row.map(|(reason,)| reason.parse()).transpose()
}
