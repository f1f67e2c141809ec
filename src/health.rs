//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info};

use crate::database::repository::TransactionStore;
use crate::payments::token_cache::CredentialCache;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    store: Arc<dyn TransactionStore>,
    credentials: Option<Arc<CredentialCache>>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn TransactionStore>, credentials: Option<Arc<CredentialCache>>) -> Self {
        Self { store, credentials }
    }

    /// Storage is required; the gateway credential only degrades the status.
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut storage_up = true;
        let mut degraded = false;

        let start = Instant::now();
        match timeout(Duration::from_secs(5), self.store.health_check()).await {
            Ok(Ok(())) => {
                let response_time = start.elapsed().as_millis();
                health_status.checks.insert(
                    "storage".to_string(),
                    ComponentHealth::up(Some(response_time)),
                );
                info!("Storage health check: OK ({}ms)", response_time);
            }
            Ok(Err(e)) => {
                storage_up = false;
                health_status.checks.insert(
                    "storage".to_string(),
                    ComponentHealth::down(Some(e.to_string())),
                );
                error!("Storage health check failed: {}", e);
            }
            Err(_) => {
                storage_up = false;
                health_status.checks.insert(
                    "storage".to_string(),
                    ComponentHealth::down(Some("Timeout".to_string())),
                );
                error!("Storage health check timed out");
            }
        }

        // reads the cache only; never calls the auth endpoint
        if let Some(credentials) = &self.credentials {
            let component = match credentials.current().await {
                Some(credential) if credential.is_usable(chrono::Utc::now()) => {
                    ComponentHealth::up(None)
                }
                Some(_) => {
                    degraded = true;
                    ComponentHealth::warning(None, Some("Access token expired".to_string()))
                }
                None => ComponentHealth::warning(
                    None,
                    Some("No access token fetched yet".to_string()),
                ),
            };
            health_status
                .checks
                .insert("gateway_credentials".to_string(), component);
        }

        health_status.status = match (storage_up, degraded) {
            (false, _) => HealthState::Unhealthy,
            (true, true) => HealthState::Degraded,
            (true, false) => HealthState::Healthy,
        };

        health_status
    }
}
