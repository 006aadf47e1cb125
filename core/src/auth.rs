//! Auth state container.
//!
//! # Design
//! `AuthStore` mirrors the remote session's user into a local identity slot.
//! It subscribes to `RemoteService` session changes for its whole lifetime and
//! the listener overwrites the slot on every notification; that listener is
//! the source of truth. `sign_in`/`sign_up`/`sign_out` also update the slot
//! when they succeed, so callers see the result without waiting for the push.
//!
//! Other containers read the identity through an `AuthHandle`, a cloneable
//! read-only view of the same slot.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::error::ApiError;
use crate::remote::RemoteService;
use crate::session::ListenerId;
use crate::types::{Credentials, Identity};

/// Read-only view of the current identity.
#[derive(Debug, Clone, Default)]
pub struct AuthHandle {
    identity: Arc<RwLock<Option<Identity>>>,
}

impl AuthHandle {
    pub fn current_user(&self) -> Option<Identity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The current identity, or `NotAuthenticated`.
    pub fn require_user(&self) -> Result<Identity, ApiError> {
        self.current_user().ok_or(ApiError::NotAuthenticated)
    }

    fn set(&self, identity: Option<Identity>) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = identity;
    }
}

pub struct AuthStore {
    service: Arc<dyn RemoteService>,
    handle: AuthHandle,
    listener: ListenerId,
}

impl AuthStore {
    /// Subscribe to `service` session changes. The identity starts from the
    /// session the service already holds, if any.
    pub fn new(service: Arc<dyn RemoteService>) -> Self {
        let handle = AuthHandle::default();
        let slot = handle.clone();
        let listener = service.on_session_change(Arc::new(move |event, session| {
            debug!(?event, signed_in = session.is_some(), "auth state notified");
            slot.set(session.map(|s| s.user.clone()));
        }));
        Self {
            service,
            handle,
            listener,
        }
    }

    pub fn handle(&self) -> AuthHandle {
        self.handle.clone()
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.handle.current_user()
    }

    pub fn set_user(&self, identity: Option<Identity>) {
        self.handle.set(identity);
    }

    pub fn sign_in(&self, email: &str, password: &str) -> Result<Identity, ApiError> {
        let outcome = self
            .service
            .sign_in_with_password(&Credentials::new(email, password))?;
        let user = outcome.user.ok_or_else(|| {
            ApiError::DeserializationError("sign-in response carried no user".to_string())
        })?;
        self.handle.set(Some(user.clone()));
        Ok(user)
    }

    /// Create an account. Returns `None` when the service created the user
    /// without returning it (the identity is then left as it was).
    pub fn sign_up(&self, email: &str, password: &str) -> Result<Option<Identity>, ApiError> {
        let outcome = self.service.sign_up(&Credentials::new(email, password))?;
        if let Some(user) = &outcome.user {
            self.handle.set(Some(user.clone()));
        }
        Ok(outcome.user)
    }

    pub fn sign_out(&self) -> Result<(), ApiError> {
        self.service.sign_out()?;
        self.handle.set(None);
        Ok(())
    }
}

impl Drop for AuthStore {
    fn drop(&mut self) {
        self.service.remove_session_listener(self.listener);
    }
}
