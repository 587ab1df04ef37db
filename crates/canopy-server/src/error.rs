use canopy_core::engine::CheckError;
use canopy_core::{CreativeId, Permission};
use canopy_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("check error: {0}")]
    Check(#[from] CheckError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{actor} lacks {required} on creative {creative_id}")]
    Forbidden {
        actor: String,
        creative_id: CreativeId,
        required: Permission,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn forbidden(
        actor: Option<&canopy_core::UserId>,
        creative_id: CreativeId,
        required: Permission,
    ) -> Self {
        ApiError::Forbidden {
            actor: canopy_core::model::audience_label(actor),
            creative_id,
            required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::UserId;

    #[test]
    fn api_error_from_check_error() {
        let id = CreativeId::generate();
        let api_err: ApiError = CheckError::CreativeNotFound(id).into();

        assert!(
            api_err.to_string().contains(&id.to_string()),
            "expected creative id in error message, got: {api_err}"
        );
    }

    #[test]
    fn api_error_from_storage_error() {
        let api_err: ApiError = StorageError::InvalidMove("cycle".to_string()).into();

        assert!(
            api_err.to_string().contains("invalid move"),
            "expected 'invalid move' in error message, got: {api_err}"
        );
    }

    #[test]
    fn forbidden_names_actor_and_level() {
        let actor = UserId::generate();
        let creative = CreativeId::generate();

        let msg = ApiError::forbidden(Some(&actor), creative, Permission::Admin).to_string();

        assert!(msg.contains(&actor.to_string()), "{msg}");
        assert!(msg.contains("admin"), "{msg}");
    }

    #[test]
    fn forbidden_for_anonymous_actor() {
        let msg = ApiError::forbidden(None, CreativeId::generate(), Permission::Read).to_string();

        assert!(msg.starts_with("public"), "{msg}");
    }
}
