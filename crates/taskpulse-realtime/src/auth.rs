//! Token validation seam.
//!
//! Authentication lives outside the core; the hub only needs a yes/no plus
//! an optional user id. A failed validation downgrades the connection to
//! anonymous instead of rejecting it.

use async_trait::async_trait;

use taskpulse_shared::error::PulseResult;

/// Claims extracted from a validated token
#[derive(Debug, Clone, Default)]
pub struct AuthClaims {
    pub user_id: Option<String>,
}

/// External auth collaborator interface
#[async_trait]
pub trait TokenValidator: Send + Sync + std::fmt::Debug {
    async fn validate(&self, token: &str) -> PulseResult<AuthClaims>;
}

/// Default validator: no tokens are accepted, every connection is
/// anonymous. Deployments plug their collaborator in at the composition
/// root.
#[derive(Debug, Default)]
pub struct NullTokenValidator;

#[async_trait]
impl TokenValidator for NullTokenValidator {
    async fn validate(&self, _token: &str) -> PulseResult<AuthClaims> {
        Err(taskpulse_shared::PulseError::Validation(
            "no token validator configured".into(),
        ))
    }
}
