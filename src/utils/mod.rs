pub mod crypto;
pub mod decimal;
pub mod token;
