// handler/applications.rs
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
    dtos::settlementdtos::{ApiResponse, DisputeDto, InitiatePaymentDto, ReviewDto},
    error::HttpError,
    middleware::JWTAuthMiddleware,
    models::paymentmodel::Money,
    AppState,
};

pub fn applications_handler() -> Router {
    Router::new()
        .route("/shifts/:shift_id/applications", post(apply_to_shift).get(get_shift_applications))
        .route("/applications/:application_id", get(get_application))
        .route("/applications/:application_id/accept", put(accept_application))
        .route("/applications/:application_id/reject", put(reject_application))
        .route("/applications/:application_id/withdraw", put(withdraw_application))
        .route("/applications/:application_id/check-in", put(check_in))
        .route("/applications/:application_id/check-out", put(check_out))
        .route("/applications/:application_id/complete", put(confirm_completion))
        .route("/applications/:application_id/dispute", post(file_dispute))
        .route("/applications/:application_id/review", post(submit_review))
        .route("/applications/:application_id/payments", post(initiate_payment))
}

pub async fn apply_to_shift(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(shift_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let application = app_state.shift_service.apply(shift_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Application submitted", application)))
}

pub async fn get_shift_applications(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(shift_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let applications = app_state.shift_service.list_for_shift(shift_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Applications retrieved", applications)))
}

pub async fn get_application(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(application_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let application = app_state.shift_service.get_application(application_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Application retrieved", application)))
}

pub async fn accept_application(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(application_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let application = app_state.shift_service.accept(application_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Application accepted", application)))
}

pub async fn reject_application(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(application_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let application = app_state.shift_service.reject(application_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Application rejected", application)))
}

pub async fn withdraw_application(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(application_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let application = app_state.shift_service.withdraw(application_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Application withdrawn", application)))
}

pub async fn check_in(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(application_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let application = app_state.shift_service.check_in(application_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Checked in", application)))
}

pub async fn check_out(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(application_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let application = app_state.shift_service.check_out(application_id, &auth.actor).await?;
    Ok(Json(ApiResponse::success("Checked out", application)))
}

pub async fn confirm_completion(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(application_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let application = app_state
        .shift_service
        .confirm_completion(application_id, &auth.actor)
        .await?;
    Ok(Json(ApiResponse::success("Shift completed", application)))
}

pub async fn file_dispute(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(application_id): Path<Uuid>,
    Json(body): Json<DisputeDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let application = app_state
        .shift_service
        .file_dispute(application_id, &auth.actor, &body.reason)
        .await?;
    Ok(Json(ApiResponse::success("Dispute filed", application)))
}

pub async fn submit_review(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(application_id): Path<Uuid>,
    Json(body): Json<ReviewDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let application = app_state
        .shift_service
        .submit_review(application_id, &auth.actor, body.rating, body.text)
        .await?;
    Ok(Json(ApiResponse::success("Review submitted", application)))
}

pub async fn initiate_payment(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddleware>,
    Path(application_id): Path<Uuid>,
    Json(body): Json<InitiatePaymentDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let money = Money::parse(&body.amount, &body.currency)?;
    let payment = app_state
        .payment_service
        .initiate(application_id, &auth.actor, &money, body.method_id)
        .await?;
    Ok(Json(ApiResponse::success("Payment initiated", payment)))
}
