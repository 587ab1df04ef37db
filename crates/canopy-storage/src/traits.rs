use std::fmt;

use canopy_core::engine::CheckError;
use canopy_core::model::{
    CacheKey, CacheRow, Creative, CreativeId, NewCreative, NewShare, Share, ShareId, TenantId,
    User, UserId,
};
use canopy_core::permission::Permission;
use canopy_core::tree::{TreeError, TreeSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("a share already exists on creative {creative_id} for {audience}")]
    DuplicateShare {
        creative_id: CreativeId,
        audience: String,
    },
    #[error("invalid move: {0}")]
    InvalidMove(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("data integrity error: {0}")]
    Integrity(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        StorageError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StorageError::DuplicateShare { .. } | StorageError::InvalidMove(_)
        )
    }
}

impl From<TreeError> for StorageError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::CreativeNotFound(id) => StorageError::not_found("creative", id),
            other => StorageError::Integrity(other.to_string()),
        }
    }
}

impl From<StorageError> for CheckError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Integrity(msg) => CheckError::Integrity(msg),
            other => CheckError::StorageError(other.to_string()),
        }
    }
}

/// Why the sweep removed a cache row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrphanReason {
    MissingCreative,
    MissingUser,
    MissingShare,
}

impl OrphanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrphanReason::MissingCreative => "missing_creative",
            OrphanReason::MissingUser => "missing_user",
            OrphanReason::MissingShare => "missing_share",
        }
    }
}

impl std::str::FromStr for OrphanReason {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing_creative" => Ok(OrphanReason::MissingCreative),
            "missing_user" => Ok(OrphanReason::MissingUser),
            "missing_share" => Ok(OrphanReason::MissingShare),
            other => Err(StorageError::Internal(format!(
                "unknown orphan reason: {other}"
            ))),
        }
    }
}

impl fmt::Display for OrphanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait UserStore: Send + Sync {
    fn create_user(&self, name: &str) -> impl Future<Output = Result<User, StorageError>> + Send;

    fn get_user(
        &self,
        id: &UserId,
    ) -> impl Future<Output = Result<Option<User>, StorageError>> + Send;

    /// Removes the user, every share granted to them and every cache row
    /// derived from those shares.
    fn delete_user(&self, id: &UserId) -> impl Future<Output = Result<(), StorageError>> + Send;
}

pub trait CreativeStore: Send + Sync {
    /// Creates a creative and materialises its cache rows.
    ///
    /// A parent that is an alias is replaced by its origin; an origin that
    /// is an alias is replaced by the creative it links to.
    fn create_creative(
        &self,
        new: &NewCreative,
    ) -> impl Future<Output = Result<Creative, StorageError>> + Send;

    fn get_creative(
        &self,
        id: &CreativeId,
    ) -> impl Future<Output = Result<Option<Creative>, StorageError>> + Send;

    /// The creatives among `ids` that exist, in no particular order.
    fn get_creatives(
        &self,
        ids: &[CreativeId],
    ) -> impl Future<Output = Result<Vec<Creative>, StorageError>> + Send;

    fn children(
        &self,
        id: &CreativeId,
    ) -> impl Future<Output = Result<Vec<Creative>, StorageError>> + Send;

    /// Reparents `id` and recomputes the cache rows of its subtree.
    fn move_creative(
        &self,
        id: &CreativeId,
        new_parent: Option<&CreativeId>,
    ) -> impl Future<Output = Result<Creative, StorageError>> + Send;

    /// Deletes `id`, its descendants and every alias of a deleted creative,
    /// together with their shares and cache rows. Returns the deleted ids.
    fn delete_creative(
        &self,
        id: &CreativeId,
    ) -> impl Future<Output = Result<Vec<CreativeId>, StorageError>> + Send;

    /// Every creative in `ids`, their ancestors, and the shares on them for
    /// `actor` and the public audience. Fails if any of `ids` is missing.
    fn ancestry(
        &self,
        ids: &[CreativeId],
        actor: Option<&UserId>,
    ) -> impl Future<Output = Result<TreeSnapshot, StorageError>> + Send;
}

pub trait ShareStore: Send + Sync {
    /// Creates a share and updates the cache rows below it in the same
    /// transaction. A share made through an alias lands on its origin.
    fn create_share(
        &self,
        new: &NewShare,
    ) -> impl Future<Output = Result<Share, StorageError>> + Send;

    fn update_share(
        &self,
        id: &ShareId,
        permission: Permission,
    ) -> impl Future<Output = Result<Share, StorageError>> + Send;

    /// Removes a share. Rows it produced fall back to whatever the
    /// ancestors grant, or disappear.
    fn destroy_share(&self, id: &ShareId)
    -> impl Future<Output = Result<Share, StorageError>> + Send;

    fn find_share(
        &self,
        creative_id: &CreativeId,
        user_id: Option<&UserId>,
    ) -> impl Future<Output = Result<Option<Share>, StorageError>> + Send;

    fn get_share(
        &self,
        id: &ShareId,
    ) -> impl Future<Output = Result<Option<Share>, StorageError>> + Send;

    fn list_shares(
        &self,
        creative_id: &CreativeId,
    ) -> impl Future<Output = Result<Vec<Share>, StorageError>> + Send;
}

pub trait PermissionCacheStore: Send + Sync {
    /// Rows on `creative_ids` for `user_id` together with the public rows
    /// on the same creatives.
    fn cache_rows(
        &self,
        creative_ids: &[CreativeId],
        user_id: Option<&UserId>,
    ) -> impl Future<Output = Result<Vec<CacheRow>, StorageError>> + Send;

    fn list_cache_rows(&self) -> impl Future<Output = Result<Vec<CacheRow>, StorageError>> + Send;

    /// Keys of rows that currently look orphaned. Read-only.
    fn orphan_candidates(
        &self,
    ) -> impl Future<Output = Result<Vec<CacheKey>, StorageError>> + Send;

    /// Deletes the row at `key` only if it is still orphaned at delete time.
    fn delete_cache_row_if_orphaned(
        &self,
        key: &CacheKey,
    ) -> impl Future<Output = Result<Option<OrphanReason>, StorageError>> + Send;
}

pub trait StoreFactory: Send + Sync {
    type Store: UserStore + CreativeStore + ShareStore + PermissionCacheStore + Clone + 'static;

    fn for_tenant(&self, tenant_id: &TenantId) -> Self::Store;
}
