// handler/webhooks.rs
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Path,
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Extension, Json, Router,
};

use crate::{dtos::settlementdtos::ApiResponse, error::HttpError, AppState};

/// Provider callbacks. Not behind `auth`; each gateway verifies its own
/// signature against the raw body.
pub fn webhooks_handler() -> Router {
    Router::new().route("/:provider", post(provider_webhook))
}

pub async fn provider_webhook(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let payment = app_state
        .payment_service
        .handle_webhook(&provider, &headers, &body)
        .await?;

    let message = match &payment {
        Some(payment) => {
            tracing::info!(%provider, payment_id = %payment.id, status = payment.status.to_str(), "webhook applied");
            "Webhook processed"
        }
        None => "Webhook acknowledged",
    };
    Ok(Json(ApiResponse::success(message, payment)))
}
