// routes.rs
use std::sync::Arc;

use axum::{middleware, routing::get, Extension, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    handler::{
        applications::applications_handler,
        escrow::{escrow_admin_handler, escrow_handler},
        methods::methods_handler,
        payments::{payments_admin_handler, payments_handler},
        webhooks::webhooks_handler,
    },
    middleware::{auth, require_admin},
    AppState,
};

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Server is running"
    }))
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    // `auth` is the outer layer so `require_admin` sees the actor.
    let admin_routes = Router::new()
        .nest("/payments", payments_admin_handler())
        .merge(escrow_admin_handler())
        .layer(middleware::from_fn(require_admin))
        .layer(middleware::from_fn(auth));

    let api_route = Router::new()
        .merge(applications_handler().layer(middleware::from_fn(auth)))
        .nest("/payments", payments_handler().layer(middleware::from_fn(auth)))
        .nest("/escrow", escrow_handler().layer(middleware::from_fn(auth)))
        .nest("/methods", methods_handler().layer(middleware::from_fn(auth)))
        .nest("/admin", admin_routes)
        .nest("/webhooks", webhooks_handler())
        .layer(TraceLayer::new_for_http())
        .layer(Extension(app_state));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::{
        config::Config,
        db::{memory::MemoryStore, SettlementStore},
        models::usermodel::UserRole,
        service::payment_provider::GatewayRegistry,
        utils::{crypto::AccountVault, token},
    };

    const SECRET: &str = "router-test-secret";

    fn app() -> Router {
        let config = Config::from_lookup(|name| match name {
            "DATABASE_URL" => Some("postgres://localhost/shiftpay".to_string()),
            "JWT_SECRET_KEY" => Some(SECRET.to_string()),
            "PAYMENT_METHOD_KEY" => Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string()),
            _ => None,
        })
        .unwrap();
        let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
        let vault = Arc::new(AccountVault::new(&config.payment_method_key).unwrap());
        create_router(Arc::new(AppState::new(config, store, GatewayRegistry::new(), vault)))
    }

    fn bearer(role: UserRole) -> String {
        let token = token::create_token(Uuid::new_v4(), role, SECRET.as_bytes(), 60).unwrap();
        format!("Bearer {}", token)
    }

    fn request(method: Method, uri: &str, authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let response = app().oneshot(request(Method::GET, "/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_or_bad_token_is_unauthorized() {
        let response = app()
            .oneshot(request(Method::GET, "/api/methods", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app()
            .oneshot(request(Method::GET, "/api/methods", Some("Bearer not-a-jwt")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_authenticated_user_lists_methods() {
        let auth = bearer(UserRole::Professional);
        let response = app()
            .oneshot(request(Method::GET, "/api/methods", Some(&auth)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_routes_reject_other_roles() {
        let auth = bearer(UserRole::Facility);
        let response = app()
            .oneshot(request(Method::POST, "/api/admin/reconcile", Some(&auth)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let auth = bearer(UserRole::Admin);
        let response = app()
            .oneshot(request(Method::POST, "/api/admin/reconcile", Some(&auth)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_webhook_provider_is_rejected() {
        let response = app()
            .oneshot(request(Method::POST, "/api/webhooks/stripe", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_payment_is_not_found() {
        let auth = bearer(UserRole::Facility);
        let uri = format!("/api/payments/{}", Uuid::new_v4());
        let response = app().oneshot(request(Method::GET, &uri, Some(&auth))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
