pub mod coinbase;
pub mod manual;
pub mod paypal;

use std::sync::Arc;

use crate::{
    config::Config,
    models::methodmodel::PaymentMethodType,
    service::payment_provider::{GatewayError, GatewayRegistry},
};

/// Registers an adapter for every provider the configuration enables.
pub fn registry_from_config(config: &Config) -> Result<GatewayRegistry, GatewayError> {
    let mut registry = GatewayRegistry::new();

    if let Some(paypal) = &config.paypal {
        registry.register(
            Arc::new(paypal::PaypalGateway::new(paypal.clone())?),
            &[PaymentMethodType::Paypal, PaymentMethodType::Card],
        );
    }
    if let Some(coinbase) = &config.coinbase {
        registry.register(
            Arc::new(coinbase::CoinbaseGateway::new(coinbase.clone())?),
            &[PaymentMethodType::Coinbase],
        );
    }
    if let Some(recipient) = &config.zelle_recipient {
        registry.register(
            Arc::new(manual::ManualGateway::new(recipient.clone())),
            &[PaymentMethodType::Zelle, PaymentMethodType::Cashapp, PaymentMethodType::Bank],
        );
    }

    tracing::info!(providers = ?registry.providers(), "payment gateways registered");
    Ok(registry)
}
