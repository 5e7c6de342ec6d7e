//! The capability interface consulted for authentication/authorization.
//!
//! The control plane never implements auth itself; handlers present the
//! caller's bearer token and the path they want to touch, and the
//! configured authorizer decides. The default implementation allows
//! everything, which is the standalone/dev posture.

use async_trait::async_trait;
use axum::http::HeaderMap;
use gantry_path::PathId;
use thiserror::Error;

/// What the caller wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    View,
    Edit,
}

/// Auth decisions.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication failed")]
    Unauthenticated,

    #[error("not authorized")]
    Forbidden,
}

/// The external auth capability.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        token: Option<&str>,
        action: AuthAction,
        path: &PathId,
    ) -> Result<(), AuthError>;
}

/// Allows every request.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(
        &self,
        _token: Option<&str>,
        _action: AuthAction,
        _path: &PathId,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Extracts a bearer token from the request headers.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(ToString::to_string)
}
