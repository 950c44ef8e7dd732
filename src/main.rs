mod config;
mod db;
mod dtos;
mod error;
mod handler;
mod middleware;
mod models;
mod routes;
mod service;
mod utils;

use std::sync::Arc;

use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Method,
};
use config::Config;
use dotenv::dotenv;
use routes::create_router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use crate::{
    db::{db::DBClient, SettlementStore},
    service::{
        escrow_service::EscrowService,
        method_service::MethodService,
        notification_service::NotificationService,
        payment_provider::GatewayRegistry,
        payment_service::PaymentService,
        providers::registry_from_config,
        shift_service::ShiftService,
    },
    utils::crypto::AccountVault,
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct AppState {
    pub env: Config,
    pub shift_service: Arc<ShiftService>,
    pub payment_service: Arc<PaymentService>,
    pub escrow_service: Arc<EscrowService>,
    pub method_service: Arc<MethodService>,
    pub notification_service: Arc<NotificationService>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn SettlementStore>,
        gateways: GatewayRegistry,
        vault: Arc<AccountVault>,
    ) -> Self {
        let retry = config.retry_policy();
        let notification_service = Arc::new(NotificationService::new(EVENT_BUFFER));

        let escrow_service = Arc::new(EscrowService::new(
            store.clone(),
            gateways.clone(),
            vault.clone(),
            notification_service.clone(),
            retry,
        ));

        let shift_service = Arc::new(ShiftService::new(
            store.clone(),
            escrow_service.clone(),
            notification_service.clone(),
            config.withdrawal_window(),
            config.auto_complete_grace(),
        ));

        let payment_service = Arc::new(PaymentService::new(
            store.clone(),
            gateways,
            notification_service.clone(),
            retry,
            config.platform_fee_percent,
        ));

        let method_service = Arc::new(MethodService::new(store, vault));

        Self {
            env: config,
            shift_service,
            payment_service,
            escrow_service,
            method_service,
            notification_service,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    dotenv().ok();

    let config = match Config::init() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let pool = match PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => {
            tracing::info!(max_connections = config.database_max_connections, "connected to the database");
            pool
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to the database");
            std::process::exit(1);
        }
    };

    let gateways = match registry_from_config(&config) {
        Ok(gateways) => gateways,
        Err(err) => {
            tracing::error!(error = %err, "payment gateways could not be configured");
            std::process::exit(1);
        }
    };
    tracing::info!(providers = ?gateways.providers(), "payment gateways registered");

    let vault = match AccountVault::new(&config.payment_method_key) {
        Ok(vault) => Arc::new(vault),
        Err(err) => {
            tracing::error!(error = %err, "payment method key rejected");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn SettlementStore> = Arc::new(DBClient::new(pool));
    let app_state = Arc::new(AppState::new(config.clone(), store, gateways, vault));

    if let Some(secs) = config.sweep_interval_secs {
        let app_state = app_state.clone();
        tokio::spawn(async move {
            service::background_jobs::start_settlement_sweep(app_state, tokio::time::Duration::from_secs(secs)).await;
        });
    } else {
        tracing::info!("SWEEP_INTERVAL_SECS not set; settlement sweep disabled");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([AUTHORIZATION, ACCEPT, CONTENT_TYPE])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE]);

    let app = create_router(app_state).layer(cors);

    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(port = config.port, error = %err, "could not bind listener");
            std::process::exit(1);
        }
    };
    tracing::info!(port = config.port, "server is running");

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "server stopped");
    }
}
