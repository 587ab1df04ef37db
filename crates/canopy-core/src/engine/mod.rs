mod check;
mod memo;

pub use check::{CheckRequest, CheckResult, DecisionSource, PermissionChecker};
pub use memo::RequestMemo;

use std::future::Future;

use crate::model::{CacheRow, Creative, CreativeId, UserId};
use crate::tree::{TreeError, TreeSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("creative not found: {0}")]
    CreativeNotFound(CreativeId),

    #[error("user not found: {0}")]
    UserNotFound(UserId),

    #[error("data integrity error: {0}")]
    Integrity(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

impl CheckError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CheckError::CreativeNotFound(_) | CheckError::UserNotFound(_)
        )
    }
}

impl From<TreeError> for CheckError {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::CreativeNotFound(id) => CheckError::CreativeNotFound(id),
            other => CheckError::Integrity(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reject checks for actors that do not exist instead of treating them
    /// as strangers.
    pub verify_actor: bool,
    /// Walk the ancestry when neither a user nor a public cache row exists.
    pub ancestor_fallback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verify_actor: true,
            ancestor_fallback: true,
        }
    }
}

pub trait PermissionReader: Send + Sync {
    fn creatives(
        &self,
        ids: &[CreativeId],
    ) -> impl Future<Output = Result<Vec<Creative>, CheckError>> + Send;

    fn user_exists(&self, id: &UserId) -> impl Future<Output = Result<bool, CheckError>> + Send;

    /// Cache rows on `creative_ids` for `user_id` plus the public rows on
    /// the same creatives. With `user_id = None` only public rows.
    fn cache_rows(
        &self,
        creative_ids: &[CreativeId],
        user_id: Option<&UserId>,
    ) -> impl Future<Output = Result<Vec<CacheRow>, CheckError>> + Send;

    /// Every creative in `ids`, all of their ancestors, and the shares on
    /// them for `actor` and the public, in one snapshot.
    fn ancestry(
        &self,
        ids: &[CreativeId],
        actor: Option<&UserId>,
    ) -> impl Future<Output = Result<TreeSnapshot, CheckError>> + Send;
}
