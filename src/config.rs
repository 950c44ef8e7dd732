// config.rs
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::service::payment_provider::RetryPolicy;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    /// Some, but not all, variables of a provider group are set.
    #[error("{provider} is partially configured; missing {missing}")]
    Partial { provider: &'static str, missing: &'static str },
}

#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct CoinbaseConfig {
    pub api_key: String,
    pub webhook_secret: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub jwt_secret: String,
    pub port: u16,
    pub payment_method_key: [u8; 32],
    pub platform_fee_percent: u32,
    pub withdrawal_window_hours: i64,
    pub auto_complete_grace_hours: i64,
    pub gateway_max_attempts: u32,
    pub gateway_initial_backoff_ms: u64,
    pub paypal: Option<PaypalConfig>,
    pub coinbase: Option<CoinbaseConfig>,
    pub zelle_recipient: Option<String>,
    pub sweep_interval_secs: Option<u64>,
}

impl Config {
    pub fn init() -> Result<Config, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source. `init` reads the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let var = |name: &'static str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        let database_url = required("DATABASE_URL")?;
        let jwt_secret = required("JWT_SECRET_KEY")?;
        let payment_method_key = decode_key(&required("PAYMENT_METHOD_KEY")?)?;

        let paypal = group(
            "paypal",
            [
                ("PAYPAL_CLIENT_ID", var("PAYPAL_CLIENT_ID")),
                ("PAYPAL_CLIENT_SECRET", var("PAYPAL_CLIENT_SECRET")),
                ("PAYPAL_WEBHOOK_ID", var("PAYPAL_WEBHOOK_ID")),
                ("PAYPAL_API_BASE", var("PAYPAL_API_BASE")),
            ],
        )?
        .map(|[client_id, client_secret, webhook_id, api_base]| PaypalConfig {
            client_id,
            client_secret,
            webhook_id,
            api_base: api_base.trim_end_matches('/').to_string(),
        });

        let coinbase = group(
            "coinbase",
            [
                ("COINBASE_API_KEY", var("COINBASE_API_KEY")),
                ("COINBASE_WEBHOOK_SECRET", var("COINBASE_WEBHOOK_SECRET")),
                ("COINBASE_API_BASE", var("COINBASE_API_BASE")),
            ],
        )?
        .map(|[api_key, webhook_secret, api_base]| CoinbaseConfig {
            api_key,
            webhook_secret,
            api_base: api_base.trim_end_matches('/').to_string(),
        });

        Ok(Config {
            database_url,
            database_max_connections: parse_or(var("DATABASE_MAX_CONNECTIONS"), "DATABASE_MAX_CONNECTIONS", 10)?,
            jwt_secret,
            port: parse_or(var("PORT"), "PORT", 8000)?,
            payment_method_key,
            platform_fee_percent: parse_or(var("PLATFORM_FEE_PERCENT"), "PLATFORM_FEE_PERCENT", 3)?,
            withdrawal_window_hours: parse_or(var("WITHDRAWAL_WINDOW_HOURS"), "WITHDRAWAL_WINDOW_HOURS", 24)?,
            auto_complete_grace_hours: parse_or(var("AUTO_COMPLETE_GRACE_HOURS"), "AUTO_COMPLETE_GRACE_HOURS", 48)?,
            gateway_max_attempts: parse_or(var("GATEWAY_MAX_ATTEMPTS"), "GATEWAY_MAX_ATTEMPTS", 3)?,
            gateway_initial_backoff_ms: parse_or(var("GATEWAY_INITIAL_BACKOFF_MS"), "GATEWAY_INITIAL_BACKOFF_MS", 500)?,
            paypal,
            coinbase,
            zelle_recipient: var("ZELLE_RECIPIENT"),
            sweep_interval_secs: var("SWEEP_INTERVAL_SECS")
                .map(|v| parse("SWEEP_INTERVAL_SECS", &v))
                .transpose()?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.gateway_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.gateway_initial_backoff_ms),
        }
    }

    pub fn withdrawal_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.withdrawal_window_hours)
    }

    pub fn auto_complete_grace(&self) -> chrono::Duration {
        chrono::Duration::hours(self.auto_complete_grace_hours)
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match value {
        Some(v) => parse(name, &v),
        None => Ok(default),
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = STANDARD.decode(encoded).map_err(|e| ConfigError::Invalid {
        name: "PAYMENT_METHOD_KEY",
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| ConfigError::Invalid {
        name: "PAYMENT_METHOD_KEY",
        reason: format!("expected 32 bytes, got {}", b.len()),
    })
}

/// All-or-nothing provider credentials.
fn group<const N: usize>(
    provider: &'static str,
    vars: [(&'static str, Option<String>); N],
) -> Result<Option<[String; N]>, ConfigError> {
    if vars.iter().all(|(_, v)| v.is_none()) {
        return Ok(None);
    }
    if let Some((missing, _)) = vars.iter().find(|(_, v)| v.is_none()) {
        return Err(ConfigError::Partial { provider, missing });
    }
    Ok(Some(vars.map(|(_, v)| v.unwrap_or_default())))
}
