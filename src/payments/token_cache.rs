//! Process-wide cache for the gateway bearer credential.
//!
//! Refreshes are single-flight: while one fetch is outstanding every other
//! caller that needs a new credential awaits the same shared future and gets
//! the same outcome, so a slow response can never overwrite a fresher token.

use crate::payments::error::{PaymentError, PaymentResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A credential as issued by the auth endpoint.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub access_token: String,
    pub expires_in: Duration,
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch_credential(&self) -> PaymentResult<IssuedCredential>;
}

#[derive(Debug, Clone)]
pub struct CachedCredential {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedCredential {
    fn from_issued(issued: IssuedCredential, now: DateTime<Utc>) -> PaymentResult<Self> {
        if issued.access_token.trim().is_empty() {
            return Err(PaymentError::AuthenticationFailure {
                message: "auth endpoint returned an empty access token".to_string(),
            });
        }
        if issued.expires_in <= Duration::zero() {
            return Err(PaymentError::AuthenticationFailure {
                message: "auth endpoint returned a non-positive expiry".to_string(),
            });
        }
        let expires_at = now.checked_add_signed(issued.expires_in).ok_or_else(|| {
            PaymentError::AuthenticationFailure {
                message: "auth endpoint returned an out-of-range expiry".to_string(),
            }
        })?;
        Ok(Self {
            value: issued.access_token,
            expires_at,
        })
    }

    /// Never serve once `now >= expires_at`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at
            .checked_sub_signed(margin)
            .is_some_and(|refresh_at| now < refresh_at)
    }
}

type RefreshHandle = Shared<BoxFuture<'static, PaymentResult<CachedCredential>>>;

enum RefreshTicket {
    /// Another caller's refresh landed after our first read.
    Ready(CachedCredential),
    InFlight(RefreshHandle),
}

pub struct CredentialCache {
    source: Arc<dyn CredentialSource>,
    cached: Arc<RwLock<Option<CachedCredential>>>,
    in_flight: Mutex<Option<RefreshHandle>>,
    refresh_margin: Duration,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn CredentialSource>, refresh_margin: Duration) -> Self {
        Self {
            source,
            cached: Arc::new(RwLock::new(None)),
            in_flight: Mutex::new(None),
            refresh_margin,
        }
    }

    /// Returns a usable bearer token, fetching one only when needed.
    pub async fn get_token(&self) -> PaymentResult<String> {
        if let Some(credential) = self.current().await {
            if credential.is_fresh(Utc::now(), self.refresh_margin) {
                debug!("using cached gateway access token");
                return Ok(credential.value);
            }
        }

        let refresh = match self.join_or_start_refresh() {
            RefreshTicket::Ready(credential) => return Ok(credential.value),
            RefreshTicket::InFlight(handle) => handle,
        };
        let outcome = refresh.clone().await;
        self.finish_refresh(&refresh);

        match outcome {
            Ok(credential) => Ok(credential.value),
            Err(err) => {
                // a token inside its refresh margin is still valid until expires_at
                if let Some(credential) = self.current().await {
                    if credential.is_usable(Utc::now()) {
                        warn!(
                            error = %err,
                            expires_at = %credential.expires_at,
                            "access token refresh failed, serving unexpired cached token"
                        );
                        return Ok(credential.value);
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn current(&self) -> Option<CachedCredential> {
        self.cached.read().await.clone()
    }

    fn join_or_start_refresh(&self) -> RefreshTicket {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.as_ref() {
            debug!("joining in-flight access token refresh");
            return RefreshTicket::InFlight(handle.clone());
        }

        // second look under the slot lock: a refresh may have completed since
        // the caller's first read
        if let Ok(cached) = self.cached.try_read() {
            if let Some(credential) = cached
                .as_ref()
                .filter(|c| c.is_fresh(Utc::now(), self.refresh_margin))
            {
                debug!("access token refreshed concurrently, skipping fetch");
                return RefreshTicket::Ready(credential.clone());
            }
        }

        let source = Arc::clone(&self.source);
        let cached = Arc::clone(&self.cached);
        let handle = async move {
            info!("requesting new gateway access token");
            let issued = AssertUnwindSafe(source.fetch_credential())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(PaymentError::AuthenticationFailure {
                        message: "credential fetch panicked".to_string(),
                    })
                })
                .map_err(into_authentication_failure)?;
            let credential = CachedCredential::from_issued(issued, Utc::now())?;
            *cached.write().await = Some(credential.clone());
            info!(expires_at = %credential.expires_at, "gateway access token obtained");
            Ok(credential)
        }
        .boxed()
        .shared();

        *slot = Some(handle.clone());
        RefreshTicket::InFlight(handle)
    }

    fn finish_refresh(&self, handle: &RefreshHandle) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.ptr_eq(handle)) {
            *slot = None;
        }
    }
}

fn into_authentication_failure(err: PaymentError) -> PaymentError {
    match err {
        PaymentError::AuthenticationFailure { .. } => err,
        other => PaymentError::AuthenticationFailure {
            message: other.to_string(),
        },
    }
}
