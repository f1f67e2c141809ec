//! STK push payment integration
//!
//! Request validation and signing, the gateway client with its credential
//! cache, and parsing of asynchronous result callbacks.

pub mod callback;
pub mod error;
pub mod provider;
pub mod providers;
pub mod request_builder;
pub mod token_cache;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult, ValidationReason};
pub use provider::StkPushGateway;
