pub mod background_jobs;
pub mod error;
pub mod escrow_service;
pub mod method_service;
pub mod notification_service;
pub mod payment_provider;
pub mod payment_service;
pub mod providers;
pub mod shift_service;
