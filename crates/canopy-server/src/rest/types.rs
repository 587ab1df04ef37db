use serde::{Deserialize, Serialize};

use canopy_core::engine::CheckResult;
use canopy_core::{Creative, Share, User};
use canopy_storage::SweepReport;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user_id: String,
    pub name: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            user_id: user.id.to_string(),
            name: user.name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteUserRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCreativeRequest {
    pub actor_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub origin_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreativeRefRequest {
    pub creative_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MoveCreativeRequest {
    pub actor_id: String,
    pub creative_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteCreativeRequest {
    pub actor_id: String,
    pub creative_id: String,
}

#[derive(Debug, Serialize)]
pub struct CreativeResponse {
    pub creative_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    pub owner_id: String,
}

impl From<Creative> for CreativeResponse {
    fn from(creative: Creative) -> Self {
        Self {
            creative_id: creative.id.to_string(),
            parent_id: creative.parent_id.map(|id| id.to_string()),
            origin_id: creative.origin_id.map(|id| id.to_string()),
            owner_id: creative.owner_id.to_string(),
        }
    }
}

/// `user_id` absent or null addresses the public share.
#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub actor_id: String,
    pub creative_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub permission: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateShareRequest {
    pub actor_id: String,
    pub share_id: String,
    pub permission: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub actor_id: String,
    pub creative_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ShareResponse {
    pub share_id: String,
    pub creative_id: String,
    pub user_id: Option<String>,
    pub permission: String,
    pub shared_by_id: String,
}

impl From<Share> for ShareResponse {
    fn from(share: Share) -> Self {
        Self {
            share_id: share.id.to_string(),
            creative_id: share.creative_id.to_string(),
            user_id: share.user_id.map(|id| id.to_string()),
            permission: share.permission.as_str().to_string(),
            shared_by_id: share.shared_by_id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckPermissionRequest {
    pub creative_id: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub permission: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckPermissionResponse {
    pub allowed: bool,
    pub source: String,
    pub root_id: String,
}

impl From<CheckResult> for CheckPermissionResponse {
    fn from(result: CheckResult) -> Self {
        Self {
            allowed: result.allowed,
            source: result.source.as_str().to_string(),
            root_id: result.root_id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FilterPermittedRequest {
    pub creative_ids: Vec<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub permission: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FilterPermittedResponse {
    pub creative_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub removed: usize,
    pub missing_creative: usize,
    pub missing_user: usize,
    pub missing_share: usize,
}

impl From<SweepReport> for SweepResponse {
    fn from(report: SweepReport) -> Self {
        Self {
            removed: report.removed(),
            missing_creative: report.missing_creative,
            missing_user: report.missing_user,
            missing_share: report.missing_share,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
