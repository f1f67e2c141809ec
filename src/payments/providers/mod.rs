//! Gateway implementations of [`StkPushGateway`](crate::payments::provider::StkPushGateway).

pub mod mpesa;

pub use mpesa::{MpesaConfig, MpesaGateway};
