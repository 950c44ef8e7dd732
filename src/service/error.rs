use thiserror::Error;
use uuid::Uuid;
use axum::http::StatusCode;

use crate::{
    error::{ErrorMessage, HttpError},
    models::{
        escrowmodel::EscrowStatus,
        paymentmodel::PaymentStatus,
        shiftmodel::{ApplicationStatus, ShiftStatus},
    },
    service::payment_provider::GatewayError,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Shift {0} not found")]
    ShiftNotFound(Uuid),

    #[error("Shift application {0} not found")]
    ApplicationNotFound(Uuid),

    #[error("Payment {0} not found")]
    PaymentNotFound(Uuid),

    #[error("Escrow transaction {0} not found")]
    EscrowNotFound(Uuid),

    #[error("Payment method {0} not found")]
    MethodNotFound(Uuid),

    #[error("Settlement obligation {0} not found")]
    ObligationNotFound(Uuid),

    #[error("User {0} does not own this resource")]
    NotOwner(Uuid),

    #[error("Actor is not a party to escrow {0}")]
    NotParty(Uuid),

    #[error("Admin identity required for {0}")]
    AdminRequired(&'static str),

    #[error("A {0} identity is required")]
    RoleRequired(&'static str),

    #[error("Application {id} is {current:?}; cannot {action}")]
    InvalidState { id: Uuid, current: ApplicationStatus, action: &'static str },

    #[error("Shift {0} already has an accepted application")]
    ShiftAlreadyFilled(Uuid),

    #[error("Shift {0} is {1:?} and no longer takes applications")]
    ShiftNotOpen(Uuid, ShiftStatus),

    #[error("Professional already has a live application on shift {0}")]
    DuplicateApplication(Uuid),

    #[error("Withdrawal window closed for application {0}")]
    WithdrawalWindowClosed(Uuid),

    #[error("Review already submitted for application {0}")]
    ReviewAlreadySubmitted(Uuid),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Application {0} already has an active payment")]
    DuplicateActivePayment(Uuid),

    #[error("Application {0} is not accepted")]
    ApplicationNotAccepted(Uuid),

    #[error("Payment {id} cannot move from {from:?} to {to}")]
    InvalidStatusTransition { id: Uuid, from: PaymentStatus, to: String },

    #[error("Unrecognized escrow status '{0}'")]
    InvalidEscrowStatus(String),

    #[error("Escrow {id} cannot move from {from:?} to {to:?}")]
    InvalidEscrowTransition { id: Uuid, from: EscrowStatus, to: EscrowStatus },

    #[error("{entity} {id} is in terminal state {state}")]
    TerminalStateViolation { entity: &'static str, id: Uuid, state: String },

    #[error("Concurrent modification; refresh and retry")]
    ConcurrentModification,

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Gateway configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("Invalid webhook: {0}")]
    InvalidWebhook(String),

    #[error("No payment gateway handles {0} methods")]
    UnsupportedPaymentMethod(String),

    #[error("Payment method {0} is referenced by an active payment")]
    MethodInUse(Uuid),

    #[error("Integrity violation on {entity} {id}: {details}")]
    IntegrityViolation { entity: &'static str, id: Uuid, details: String },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // lock_not_available, serialization_failure, deadlock_detected
            if matches!(db_err.code().as_deref(), Some("55P03") | Some("40001") | Some("40P01")) {
                return ServiceError::ConcurrentModification;
            }
        }
        ServiceError::Database(err)
    }
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(msg) => ServiceError::GatewayUnavailable(msg),
            GatewayError::Rejected(msg) => ServiceError::GatewayRejected(msg),
            GatewayError::ConfigurationMissing(msg) => ServiceError::ConfigurationMissing(msg),
            GatewayError::InvalidSignature => ServiceError::InvalidWebhook("signature mismatch".to_string()),
            GatewayError::MalformedPayload(msg) => ServiceError::InvalidWebhook(msg),
            GatewayError::Unsupported(op) => ServiceError::Validation(format!("gateway does not support {}", op)),
        }
    }
}

impl ServiceError {
    pub fn terminal(entity: &'static str, id: Uuid, state: impl std::fmt::Debug) -> Self {
        ServiceError::TerminalStateViolation {
            entity,
            id,
            state: format!("{:?}", state),
        }
    }

    /// Stable identifier of the invariant that blocked the call.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::ShiftNotFound(_) => "SHIFT_NOT_FOUND",
            ServiceError::ApplicationNotFound(_) => "APPLICATION_NOT_FOUND",
            ServiceError::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            ServiceError::EscrowNotFound(_) => "ESCROW_NOT_FOUND",
            ServiceError::MethodNotFound(_) => "METHOD_NOT_FOUND",
            ServiceError::ObligationNotFound(_) => "OBLIGATION_NOT_FOUND",
            ServiceError::NotOwner(_) => "NOT_OWNER",
            ServiceError::NotParty(_) => "NOT_PARTY",
            ServiceError::AdminRequired(_) => "ADMIN_REQUIRED",
            ServiceError::RoleRequired(_) => "ROLE_REQUIRED",
            ServiceError::InvalidState { .. } => "INVALID_STATE",
            ServiceError::ShiftAlreadyFilled(_) => "SHIFT_ALREADY_FILLED",
            ServiceError::ShiftNotOpen(_, _) => "SHIFT_NOT_OPEN",
            ServiceError::DuplicateApplication(_) => "DUPLICATE_APPLICATION",
            ServiceError::WithdrawalWindowClosed(_) => "WITHDRAWAL_WINDOW_CLOSED",
            ServiceError::ReviewAlreadySubmitted(_) => "REVIEW_ALREADY_SUBMITTED",
            ServiceError::InvalidAmount(_) => "INVALID_AMOUNT",
            ServiceError::DuplicateActivePayment(_) => "DUPLICATE_ACTIVE_PAYMENT",
            ServiceError::ApplicationNotAccepted(_) => "APPLICATION_NOT_ACCEPTED",
            ServiceError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            ServiceError::InvalidEscrowStatus(_) => "INVALID_ESCROW_STATUS",
            ServiceError::InvalidEscrowTransition { .. } => "INVALID_ESCROW_TRANSITION",
            ServiceError::TerminalStateViolation { .. } => "TERMINAL_STATE_VIOLATION",
            ServiceError::ConcurrentModification => "CONCURRENT_MODIFICATION",
            ServiceError::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            ServiceError::GatewayRejected(_) => "GATEWAY_REJECTED",
            ServiceError::ConfigurationMissing(_) => "CONFIGURATION_MISSING",
            ServiceError::InvalidWebhook(_) => "INVALID_WEBHOOK",
            ServiceError::UnsupportedPaymentMethod(_) => "UNSUPPORTED_PAYMENT_METHOD",
            ServiceError::MethodInUse(_) => "METHOD_IN_USE",
            ServiceError::IntegrityViolation { .. } => "INTEGRITY_VIOLATION",
            ServiceError::Encryption(_) => "ENCRYPTION_ERROR",
            ServiceError::Database(_) => "DATABASE_ERROR",
            ServiceError::Validation(_) => "VALIDATION_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::ShiftNotFound(_)
            | ServiceError::ApplicationNotFound(_)
            | ServiceError::PaymentNotFound(_)
            | ServiceError::EscrowNotFound(_)
            | ServiceError::MethodNotFound(_)
            | ServiceError::ObligationNotFound(_) => StatusCode::NOT_FOUND,

            ServiceError::NotOwner(_)
            | ServiceError::NotParty(_)
            | ServiceError::AdminRequired(_)
            | ServiceError::RoleRequired(_) => StatusCode::FORBIDDEN,

            ServiceError::InvalidState { .. }
            | ServiceError::ShiftAlreadyFilled(_)
            | ServiceError::ShiftNotOpen(_, _)
            | ServiceError::DuplicateApplication(_)
            | ServiceError::WithdrawalWindowClosed(_)
            | ServiceError::ReviewAlreadySubmitted(_)
            | ServiceError::DuplicateActivePayment(_)
            | ServiceError::ApplicationNotAccepted(_)
            | ServiceError::InvalidStatusTransition { .. }
            | ServiceError::InvalidEscrowTransition { .. }
            | ServiceError::TerminalStateViolation { .. }
            | ServiceError::ConcurrentModification
            | ServiceError::MethodInUse(_) => StatusCode::CONFLICT,

            ServiceError::InvalidAmount(_)
            | ServiceError::InvalidEscrowStatus(_)
            | ServiceError::UnsupportedPaymentMethod(_)
            | ServiceError::Validation(_) => StatusCode::BAD_REQUEST,

            ServiceError::InvalidWebhook(_) => StatusCode::UNAUTHORIZED,

            ServiceError::GatewayRejected(_) => StatusCode::PAYMENT_REQUIRED,
            ServiceError::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,

            ServiceError::ConfigurationMissing(_)
            | ServiceError::IntegrityViolation { .. }
            | ServiceError::Encryption(_)
            | ServiceError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ServiceError> for HttpError {
    fn from(error: ServiceError) -> Self {
        let status = error.status_code();
        let code = error.code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code, "settlement error: {}", error);
            return HttpError::with_code(ErrorMessage::ServerError.to_string(), status, code);
        }
        HttpError::with_code(error.to_string(), status, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let id = Uuid::new_v4();
        let err = ServiceError::ShiftAlreadyFilled(id);
        assert_eq!(err.code(), "SHIFT_ALREADY_FILLED");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err = ServiceError::terminal("escrow", id, EscrowStatus::Released);
        assert_eq!(err.code(), "TERMINAL_STATE_VIOLATION");
        assert!(err.to_string().contains("Released"));

        assert_eq!(
            ServiceError::GatewayUnavailable("timeout".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_gateway_error_mapping() {
        let err: ServiceError = GatewayError::Rejected("card declined".into()).into();
        assert!(matches!(err, ServiceError::GatewayRejected(_)));

        let err: ServiceError = GatewayError::InvalidSignature.into();
        assert_eq!(err.code(), "INVALID_WEBHOOK");
    }

    #[test]
    fn test_row_not_found_stays_database_error() {
        let err: ServiceError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, ServiceError::Database(_)));
    }

    #[test]
    fn test_into_http_error_keeps_code() {
        let http: HttpError = ServiceError::WithdrawalWindowClosed(Uuid::new_v4()).into();
        assert_eq!(http.status, StatusCode::CONFLICT);
        assert_eq!(http.code.as_deref(), Some("WITHDRAWAL_WINDOW_CLOSED"));
    }
}
