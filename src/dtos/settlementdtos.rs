// dtos/settlementdtos.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::models::escrowmodel::DisputeResolution;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct InitiatePaymentDto {
    /// Decimal string, e.g. "150.00". Parsed into `Money` by the service layer.
    #[validate(length(min = 1, max = 20, message = "Amount is required"))]
    pub amount: String,

    #[validate(length(equal = 3, message = "Currency must be a three-letter code"))]
    pub currency: String,

    pub method_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct StartChargeDto {
    pub method_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct UpdateStatusDto {
    #[validate(length(min = 1, message = "Status is required"))]
    pub status: String,

    #[validate(length(max = 500, message = "Note must be at most 500 characters"))]
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct DisputeDto {
    #[validate(custom = "validate_dispute_reason")]
    pub reason: String,
}

/// Counts characters after trimming, so padding cannot stand in for a reason.
fn validate_dispute_reason(reason: &str) -> Result<(), ValidationError> {
    if !(5..=1000).contains(&reason.trim().chars().count()) {
        let mut err = ValidationError::new("reason_length");
        err.message = Some("Reason must be between 5 and 1000 characters".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ResolveDisputeDto {
    pub resolution: DisputeResolution,

    #[validate(length(min = 1, max = 500, message = "A resolution note is required"))]
    pub note: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ConfirmDto {
    #[validate(length(min = 1, max = 120, message = "Transfer reference is required"))]
    pub reference: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct AddMethodDto {
    #[validate(length(min = 1, message = "Method type is required"))]
    pub method_type: String,

    #[validate(length(min = 4, max = 200, message = "Account must be between 4 and 200 characters"))]
    pub account: String,

    #[serde(default)]
    pub make_default: bool,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ReviewDto {
    #[validate(range(min = 1, max = 5, message = "Rating must be between 1 and 5"))]
    pub rating: i16,

    #[validate(length(max = 1000, message = "Review must be at most 1000 characters"))]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: &str, data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiate_payment_validation() {
        let dto: InitiatePaymentDto =
            serde_json::from_str(r#"{"amount": "150.00", "currency": "USD"}"#).unwrap();
        assert!(dto.validate().is_ok());
        assert!(dto.method_id.is_none());

        let dto = InitiatePaymentDto {
            amount: "150.00".to_string(),
            currency: "US".to_string(),
            method_id: None,
        };
        assert!(dto.validate().is_err());
    }

    #[test]
    fn test_dispute_reason_ignores_padding() {
        let blank = DisputeDto { reason: "         ".to_string() };
        assert!(blank.validate().is_err());
        let padded = DisputeDto { reason: "  ok \n  ".to_string() };
        assert!(padded.validate().is_err());

        let dto: DisputeDto = serde_json::from_str(r#"{"reason": "  left two hours early  "}"#).unwrap();
        assert!(dto.validate().is_ok());
    }

    #[test]
    fn test_review_and_resolution_parsing() {
        let review = ReviewDto { rating: 6, text: None };
        assert!(review.validate().is_err());

        let dto: ResolveDisputeDto =
            serde_json::from_str(r#"{"resolution": "refund_to_facility", "note": "no-show"}"#).unwrap();
        assert_eq!(dto.resolution, DisputeResolution::RefundToFacility);
    }
}
