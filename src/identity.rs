//! Tenant and actor lookup consumed by the audit boundaries.
//!
//! Authentication and tenant resolution happen elsewhere; the audit
//! pipeline only reads their result. An upstream layer may insert an
//! [`Identity`] into the request extensions, otherwise the configured
//! [`IdentityProvider`] is asked.

use serde::{Deserialize, Serialize};

/// Tenant and actor identity attached to audit records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Identity {
    /// Tenant the request acts within; absent for platform-level calls.
    pub tenant_id: Option<String>,
    /// Authenticated user identifier.
    pub user_id: Option<String>,
    /// Authenticated user email.
    pub user_email: Option<String>,
}

impl Identity {
    /// Identity for an authenticated user within a tenant.
    #[must_use]
    pub fn new(tenant_id: Option<String>, user_id: String, user_email: Option<String>) -> Self {
        Self {
            tenant_id,
            user_id: Some(user_id),
            user_email,
        }
    }
}

/// Resolves the identity of the caller when none was attached to the request.
pub trait IdentityProvider: Send + Sync {
    /// Return the identity for the calling context.
    fn current(&self) -> Identity;
}

/// Provider that always reports an anonymous caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousIdentity;

impl IdentityProvider for AnonymousIdentity {
    fn current(&self) -> Identity {
        Identity::default()
    }
}

/// Provider returning a fixed identity, used by background jobs that act
/// on behalf of a known tenant.
#[derive(Debug, Clone, Default)]
pub struct FixedIdentity(pub Identity);

impl IdentityProvider for FixedIdentity {
    fn current(&self) -> Identity {
        self.0.clone()
    }
}
