// handler/methods.rs
use std::sync::Arc;

use axum::{
    extract::Path,
    response::IntoResponse,
    routing::{delete, get, put},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::settlementdtos::{AddMethodDto, ApiResponse},
    error::HttpError,
    middleware::JWTAuthMiddleware,
    models::methodmodel::PaymentMethodType,
    AppState,
};

pub fn methods_handler() -> Router {
    Router::new()
        .route("/", get(list_methods).post(add_method))
        .route("/:method_id", delete(delete_method))
        .route("/:method_id/default", put(set_default_method))
}

pub async fn list_methods(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
) -> Result<impl IntoResponse, HttpError> {
    let methods = app_state.method_service.list(&auth.actor).await?;
    Ok(Json(ApiResponse::success("Payment methods retrieved", methods)))
}

pub async fn add_method(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Json(body): Json<AddMethodDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let method_type: PaymentMethodType = body.method_type.parse()?;
    let method = app_state
        .method_service
        .add(&auth.actor, method_type, &body.account, body.make_default)
        .await?;
    Ok(Json(ApiResponse::success("Payment method added", method)))
}

pub async fn set_default_method(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(method_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let method = app_state.method_service.set_default(method_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Default payment method updated", method)))
}

pub async fn delete_method(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(method_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    app_state.method_service.delete(method_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Payment method removed", method_id)))
}
