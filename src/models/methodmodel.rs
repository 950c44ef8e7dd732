use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::error::ServiceError;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "payment_method_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethodType {
    Paypal,
    Card,
    Coinbase,
    Zelle,
    Cashapp,
    Bank,
}

impl PaymentMethodType {
    pub fn to_str(&self) -> &str {
        match self {
            PaymentMethodType::Paypal => "paypal",
            PaymentMethodType::Card => "card",
            PaymentMethodType::Coinbase => "coinbase",
            PaymentMethodType::Zelle => "zelle",
            PaymentMethodType::Cashapp => "cashapp",
            PaymentMethodType::Bank => "bank",
        }
    }
}

impl FromStr for PaymentMethodType {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paypal" => Ok(PaymentMethodType::Paypal),
            "card" => Ok(PaymentMethodType::Card),
            "coinbase" | "crypto" => Ok(PaymentMethodType::Coinbase),
            "zelle" => Ok(PaymentMethodType::Zelle),
            "cashapp" => Ok(PaymentMethodType::Cashapp),
            "bank" | "bank_transfer" => Ok(PaymentMethodType::Bank),
            other => Err(ServiceError::UnsupportedPaymentMethod(other.to_string())),
        }
    }
}

/// A stored payout or funding destination. `encrypted_account` is never
/// serialized; clients only see `account_hint`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct PaymentMethod {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub method_type: PaymentMethodType,
    #[serde(skip_serializing, default)]
    pub encrypted_account: String,
    pub account_hint: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Masks everything but the last four characters of an account identifier.
pub fn account_hint(account: &str) -> String {
    let chars: Vec<char> = account.trim().chars().collect();
    let visible = chars.len().min(4);
    let tail: String = chars[chars.len() - visible..].iter().collect();
    format!("****{}", tail)
}
