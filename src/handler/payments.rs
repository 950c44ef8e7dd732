// handler/payments.rs
use std::sync::Arc;

use axum::{
    extract::Path,
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::settlementdtos::{ApiResponse, ConfirmDto, StartChargeDto, UpdateStatusDto},
    error::HttpError,
    middleware::JWTAuthMiddleware,
    AppState,
};

pub fn payments_handler() -> Router {
    Router::new()
        .route("/:payment_id", get(get_payment))
        .route("/:payment_id/charge", post(start_charge))
        .route("/:payment_id/poll", post(poll_charge))
        .route("/:payment_id/cancel", put(cancel_payment))
}

/// Admin-only routes, mounted behind `require_admin`.
pub fn payments_admin_handler() -> Router {
    Router::new()
        .route("/:payment_id/status", put(update_payment_status))
        .route("/:payment_id/confirm", post(confirm_manual_payment))
}

pub async fn get_payment(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(payment_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let payment = app_state.payment_service.get_payment(payment_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Payment retrieved", payment)))
}

pub async fn start_charge(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(payment_id): Path<Uuid>,
    body: Option<Json<StartChargeDto>>,
) -> Result<impl IntoResponse, HttpError> {
    let Json(body) = body.unwrap_or_default();
    let start = app_state
        .payment_service
        .start_charge(payment_id, &auth.actor, body.method_id)
        .await?;
    Ok(Json(ApiResponse::success("Charge started", start)))
}

pub async fn poll_charge(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(payment_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    app_state.payment_service.get_payment(payment_id, &auth.actor).await?;
    let payment = app_state.payment_service.poll_charge(payment_id).await?;
    Ok(Json(ApiResponse::success("Charge status refreshed", payment)))
}

pub async fn cancel_payment(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(payment_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let payment = app_state.payment_service.cancel(payment_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Payment cancelled", payment)))
}

pub async fn update_payment_status(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(payment_id): Path<Uuid>,
    Json(body): Json<UpdateStatusDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let payment = app_state
        .payment_service
        .update_status(payment_id, &auth.actor, &body.status, &body.note)
        .await?;
    Ok(Json(ApiResponse::success("Payment status updated", payment)))
}

pub async fn confirm_manual_payment(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(payment_id): Path<Uuid>,
    Json(body): Json<ConfirmDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let payment = app_state
        .payment_service
        .confirm_manual_payment(payment_id, &auth.actor, &body.reference)
        .await?
        .into_payment();
    Ok(Json(ApiResponse::success("Manual payment confirmed", payment)))
}
