pub mod applications;
pub mod escrow;
pub mod methods;
pub mod payments;
pub mod webhooks;
