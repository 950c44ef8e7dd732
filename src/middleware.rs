use std::sync::Arc;

use axum::{
    extract::Request,
    http::header,
    middleware::Next,
    response::IntoResponse,
    Extension,
};

use crate::{
    error::{ErrorMessage, HttpError},
    models::usermodel::{Actor, UserRole},
    utils::token,
    AppState,
};

/// The caller resolved from the bearer token. Handlers pass `actor` into
/// every service call.
#[derive(Debug, Clone, Copy)]
pub struct JWTAuthMiddleware {
    pub actor: Actor,
}

pub async fn auth(
    Extension(app_state): Extension<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, HttpError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|auth_header| auth_header.to_str().ok())
        .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .ok_or_else(|| HttpError::unauthorized(ErrorMessage::TokenNotProvided.to_string()))?;

    let claims = token::decode_token(token, app_state.env.jwt_secret.as_bytes())?;
    let actor = claims.actor()?;

    req.extensions_mut().insert(JWTAuthMiddleware { actor });
    Ok(next.run(req).await)
}

pub async fn role_check(
    req: Request,
    next: Next,
    required_roles: Vec<UserRole>,
) -> Result<impl IntoResponse, HttpError> {
    let auth = req
        .extensions()
        .get::<JWTAuthMiddleware>()
        .ok_or_else(|| HttpError::unauthorized(ErrorMessage::UserNotAuthenticated.to_string()))?;

    let allowed = match auth.actor {
        Actor::User { role, .. } => required_roles.contains(&role),
        Actor::System => false,
    };
    if !allowed {
        return Err(HttpError::forbidden(ErrorMessage::PermissionDenied.to_string()));
    }

    Ok(next.run(req).await)
}

pub async fn require_admin(req: Request, next: Next) -> Result<impl IntoResponse, HttpError> {
    role_check(req, next, vec![UserRole::Admin]).await
}
