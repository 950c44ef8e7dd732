// handler/escrow.rs
use std::sync::Arc;

use axum::{
    extract::Path,
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Json, Router,
};
use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::settlementdtos::{ApiResponse, ConfirmDto, DisputeDto, ResolveDisputeDto, UpdateStatusDto},
    error::HttpError,
    middleware::JWTAuthMiddleware,
    AppState,
};

pub fn escrow_handler() -> Router {
    Router::new()
        .route("/:escrow_id", get(get_escrow))
        .route("/:escrow_id/obligations", get(get_obligations))
        .route("/:escrow_id/release-conditions", put(mark_release_conditions_met))
        .route("/:escrow_id/dispute", post(file_dispute))
}

/// Admin-only routes, mounted behind `require_admin`.
pub fn escrow_admin_handler() -> Router {
    Router::new()
        .route("/escrow/:escrow_id/status", put(update_escrow_status))
        .route("/escrow/:escrow_id/resolve", put(resolve_dispute))
        .route("/obligations/:obligation_id/dispatch", post(dispatch_obligation))
        .route("/obligations/:obligation_id/confirm", post(confirm_obligation))
        .route("/integrity-issues", get(get_integrity_issues))
        .route("/integrity-issues/:issue_id/resolve", put(resolve_integrity_issue))
        .route("/reconcile", post(run_reconciliation))
}

pub async fn get_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(escrow_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let escrow = app_state.escrow_service.get_escrow(escrow_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Escrow retrieved", escrow)))
}

pub async fn get_obligations(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(escrow_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let obligations = app_state.escrow_service.obligations(escrow_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Obligations retrieved", obligations)))
}

pub async fn mark_release_conditions_met(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(escrow_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let outcome = app_state
        .escrow_service
        .mark_release_conditions_met(escrow_id, &auth.actor)
        .await?;
    Ok(Json(ApiResponse::success("Release conditions recorded", outcome)))
}

pub async fn file_dispute(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(escrow_id): Path<Uuid>,
    Json(body): Json<DisputeDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let outcome = app_state
        .escrow_service
        .file_dispute(escrow_id, &auth.actor, &body.reason)
        .await?;
    Ok(Json(ApiResponse::success("Dispute filed", outcome)))
}

pub async fn update_escrow_status(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(escrow_id): Path<Uuid>,
    Json(body): Json<UpdateStatusDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let outcome = app_state
        .escrow_service
        .update_escrow_status(escrow_id, &body.status, &auth.actor, &body.note)
        .await?;
    Ok(Json(ApiResponse::success("Escrow status updated", outcome)))
}

pub async fn resolve_dispute(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(escrow_id): Path<Uuid>,
    Json(body): Json<ResolveDisputeDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let outcome = app_state
        .escrow_service
        .resolve_dispute(escrow_id, &auth.actor, body.resolution, &body.note)
        .await?;
    Ok(Json(ApiResponse::success("Dispute resolved", outcome)))
}

pub async fn dispatch_obligation(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(obligation_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let obligation = app_state.escrow_service.dispatch_obligation(obligation_id).await?;
    Ok(Json(ApiResponse::success("Obligation dispatched", obligation)))
}

pub async fn confirm_obligation(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(obligation_id): Path<Uuid>,
    Json(body): Json<ConfirmDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let obligation = app_state
        .escrow_service
        .confirm_obligation(obligation_id, &auth.actor, &body.reference)
        .await?;
    Ok(Json(ApiResponse::success("Obligation confirmed", obligation)))
}

pub async fn get_integrity_issues(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
) -> Result<impl IntoResponse, HttpError> {
    let issues = app_state.escrow_service.open_integrity_issues(&auth.actor).await?;
    Ok(Json(ApiResponse::success("Open integrity issues", issues)))
}

pub async fn resolve_integrity_issue(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(issue_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let issue = app_state
        .escrow_service
        .resolve_integrity_issue(issue_id, &auth.actor)
        .await?;
    Ok(Json(ApiResponse::success("Integrity issue resolved", issue)))
}

pub async fn run_reconciliation(
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let report = app_state.escrow_service.reconcile(Utc::now()).await?;
    Ok(Json(ApiResponse::success("Reconciliation finished", report)))
}
