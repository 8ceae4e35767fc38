//! Caller identity for the admin surface.
//!
//! Every entry point receives an [`AuthContext`] and must obtain an [`AdminContext`]
//! through [`AuthContext::require_admin`] before touching the engine.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Owner,
    Caregiver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    Anonymous,
    User { user_id: Ulid, role: Role },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("admin role required")]
    Forbidden,
}

/// Proof that the caller holds the admin role. Only `require_admin` builds one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminContext {
    admin_id: Ulid,
}

impl AdminContext {
    pub fn admin_id(&self) -> Ulid {
        self.admin_id
    }
}

impl AuthContext {
    pub fn user(user_id: Ulid, role: Role) -> Self {
        AuthContext::User { user_id, role }
    }

    pub fn require_admin(&self) -> Result<AdminContext, AuthError> {
        match self {
            AuthContext::Anonymous => Err(AuthError::Unauthenticated),
            AuthContext::User {
                user_id,
                role: Role::Admin,
            } => Ok(AdminContext { admin_id: *user_id }),
            AuthContext::User { .. } => Err(AuthError::Forbidden),
        }
    }
}

/// Static bearer tokens from configuration.
#[derive(Clone, Default)]
pub struct TokenAuthority {
    tokens: HashMap<String, (Ulid, Role)>,
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("tokens", &format_args!("[{} redacted]", self.tokens.len()))
            .finish()
    }
}

impl TokenAuthority {
    pub fn new(admin_tokens: impl IntoIterator<Item = (String, Ulid)>) -> Self {
        Self {
            tokens: admin_tokens
                .into_iter()
                .map(|(token, id)| (token, (id, Role::Admin)))
                .collect(),
        }
    }

    pub fn with_user(mut self, token: impl Into<String>, user_id: Ulid, role: Role) -> Self {
        self.tokens.insert(token.into(), (user_id, role));
        self
    }

    /// Resolve an `Authorization` header value.
    pub fn resolve(&self, authorization: Option<&str>) -> AuthContext {
        let Some(token) = authorization.and_then(|v| v.strip_prefix("Bearer ")) else {
            return AuthContext::Anonymous;
        };
        match self.tokens.get(token.trim()) {
            Some((user_id, role)) => AuthContext::user(*user_id, *role),
            None => AuthContext::Anonymous,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
