use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use canopy_core::engine::CheckRequest;
use canopy_core::{CreativeId, Permission, ShareId, UserId};
use canopy_storage::{StorageError, StoreFactory};

use crate::error::ApiError;
use crate::service::{CreateCreativeInput, GrantInput};

use super::AppState;
use super::types::*;

fn parse_id<T: From<uuid::Uuid>>(field: &str, value: &str) -> Result<T, ApiError> {
    uuid::Uuid::parse_str(value)
        .map(T::from)
        .map_err(|e| ApiError::InvalidRequest(format!("{field} is not a UUID: {e}")))
}

fn parse_optional_id<T: From<uuid::Uuid>>(
    field: &str,
    value: Option<&str>,
) -> Result<Option<T>, ApiError> {
    value.map(|v| parse_id(field, v)).transpose()
}

/// An absent level means `read`.
fn parse_permission(value: Option<&str>) -> Result<Permission, ApiError> {
    match value {
        Some(v) => v
            .parse()
            .map_err(|e: canopy_core::permission::UnknownPermission| {
                ApiError::InvalidRequest(e.to_string())
            }),
        None => Ok(Permission::Read),
    }
}

fn api_error_to_response(err: ApiError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        ApiError::Check(e) if e.is_not_found() => StatusCode::NOT_FOUND,
        ApiError::Check(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ApiError::Storage(e) if e.is_validation() => StatusCode::CONFLICT,
        ApiError::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
        ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
        ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "request failed");
    }

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn respond<T: Serialize>(result: Result<T, ApiError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => api_error_to_response(e).into_response(),
    }
}

pub async fn create_user<F>(
    State(state): State<AppState<F>>,
    Json(req): Json<CreateUserRequest>,
) -> Response
where
    F: StoreFactory + 'static,
{
    let result = state.service.create_user(&state.tenant_id, &req.name).await;
    respond(result.map(UserResponse::from))
}

pub async fn delete_user<F>(
    State(state): State<AppState<F>>,
    Json(req): Json<DeleteUserRequest>,
) -> Response
where
    F: StoreFactory + 'static,
{
    let result = async {
        let user_id: UserId = parse_id("user_id", &req.user_id)?;
        state.service.delete_user(&state.tenant_id, &user_id).await?;
        Ok::<_, ApiError>(DeletedResponse {
            deleted_ids: vec![user_id.to_string()],
        })
    }
    .await;
    respond(result)
}

pub async fn create_creative<F>(
    State(state): State<AppState<F>>,
    Json(req): Json<CreateCreativeRequest>,
) -> Response
where
    F: StoreFactory + 'static,
{
    let result = async {
        let input = CreateCreativeInput {
            actor: parse_id("actor_id", &req.actor_id)?,
            parent_id: parse_optional_id("parent_id", req.parent_id.as_deref())?,
            origin_id: parse_optional_id("origin_id", req.origin_id.as_deref())?,
        };
        state.service.create_creative(&state.tenant_id, input).await
    }
    .await;
    respond(result.map(CreativeResponse::from))
}

pub async fn effective_origin<F>(
    State(state): State<AppState<F>>,
    Json(req): Json<CreativeRefRequest>,
) -> Response
where
    F: StoreFactory + 'static,
{
    let result = async {
        let creative_id: CreativeId = parse_id("creative_id", &req.creative_id)?;
        state
            .service
            .effective_origin(&state.tenant_id, &creative_id)
            .await
    }
    .await;
    respond(result.map(CreativeResponse::from))
}

pub async fn move_creative<F>(
    State(state): State<AppState<F>>,
    Json(req): Json<MoveCreativeRequest>,
) -> Response
where
    F: StoreFactory + 'static,
{
    let result = async {
        let actor: UserId = parse_id("actor_id", &req.actor_id)?;
        let creative_id: CreativeId = parse_id("creative_id", &req.creative_id)?;
        let parent_id: Option<CreativeId> =
            parse_optional_id("parent_id", req.parent_id.as_deref())?;
        state
            .service
            .move_creative(&state.tenant_id, &actor, &creative_id, parent_id.as_ref())
            .await
    }
    .await;
    respond(result.map(CreativeResponse::from))
}

pub async fn delete_creative<F>(
    State(state): State<AppState<F>>,
    Json(req): Json<DeleteCreativeRequest>,
) -> Response
where
    F: StoreFactory + 'static,
{
    let result = async {
        let actor: UserId = parse_id("actor_id", &req.actor_id)?;
        let creative_id: CreativeId = parse_id("creative_id", &req.creative_id)?;
        let deleted = state
            .service
            .delete_creative(&state.tenant_id, &actor, &creative_id)
            .await?;
        Ok::<_, ApiError>(DeletedResponse {
            deleted_ids: deleted.iter().map(ToString::to_string).collect(),
        })
    }
    .await;
    respond(result)
}

pub async fn grant<F>(State(state): State<AppState<F>>, Json(req): Json<GrantRequest>) -> Response
where
    F: StoreFactory + 'static,
{
    let result = async {
        let input = GrantInput {
            actor: parse_id("actor_id", &req.actor_id)?,
            creative_id: parse_id("creative_id", &req.creative_id)?,
            user_id: parse_optional_id("user_id", req.user_id.as_deref())?,
            permission: parse_permission(Some(&req.permission))?,
        };
        state.service.grant(&state.tenant_id, input).await
    }
    .await;
    respond(result.map(ShareResponse::from))
}

pub async fn update_share<F>(
    State(state): State<AppState<F>>,
    Json(req): Json<UpdateShareRequest>,
) -> Response
where
    F: StoreFactory + 'static,
{
    let result = async {
        let actor: UserId = parse_id("actor_id", &req.actor_id)?;
        let share_id: ShareId = parse_id("share_id", &req.share_id)?;
        let permission = parse_permission(Some(&req.permission))?;
        state
            .service
            .change_grant(&state.tenant_id, &actor, &share_id, permission)
            .await
    }
    .await;
    respond(result.map(ShareResponse::from))
}

pub async fn revoke<F>(State(state): State<AppState<F>>, Json(req): Json<RevokeRequest>) -> Response
where
    F: StoreFactory + 'static,
{
    let result = async {
        let actor: UserId = parse_id("actor_id", &req.actor_id)?;
        let creative_id: CreativeId = parse_id("creative_id", &req.creative_id)?;
        let user_id: Option<UserId> = parse_optional_id("user_id", req.user_id.as_deref())?;
        state
            .service
            .revoke(&state.tenant_id, &actor, &creative_id, user_id.as_ref())
            .await
    }
    .await;
    respond(result.map(ShareResponse::from))
}

pub async fn check_permission<F>(
    State(state): State<AppState<F>>,
    Json(req): Json<CheckPermissionRequest>,
) -> Response
where
    F: StoreFactory + 'static,
{
    let result = async {
        let request = CheckRequest::new(
            parse_id("creative_id", &req.creative_id)?,
            parse_optional_id("actor_id", req.actor_id.as_deref())?,
            parse_permission(req.permission.as_deref())?,
        );
        state.service.check(&state.tenant_id, &request).await
    }
    .await;
    respond(result.map(CheckPermissionResponse::from))
}

pub async fn filter_permitted<F>(
    State(state): State<AppState<F>>,
    Json(req): Json<FilterPermittedRequest>,
) -> Response
where
    F: StoreFactory + 'static,
{
    let result = async {
        let ids = req
            .creative_ids
            .iter()
            .map(|id| parse_id("creative_ids", id))
            .collect::<Result<Vec<CreativeId>, _>>()?;
        let actor: Option<UserId> = parse_optional_id("actor_id", req.actor_id.as_deref())?;
        let required = parse_permission(req.permission.as_deref())?;
        let permitted = state
            .service
            .filter_permitted(&state.tenant_id, &ids, actor.as_ref(), required)
            .await?;
        Ok::<_, ApiError>(FilterPermittedResponse {
            creative_ids: permitted.iter().map(ToString::to_string).collect(),
        })
    }
    .await;
    respond(result)
}

pub async fn sweep<F>(State(state): State<AppState<F>>) -> Response
where
    F: StoreFactory + 'static,
{
    let result = state.service.run_sweep(&state.tenant_id).await;
    respond(result.map(SweepResponse::from))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}
