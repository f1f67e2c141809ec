//! M-Pesa STK push initiation and reconciliation engine.

pub mod api;
pub mod config;
pub mod database;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
