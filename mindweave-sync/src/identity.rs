//! Identity seam.
//!
//! Authentication happens outside the sync core. Connections present
//! [`Credentials`]; an [`IdentityProvider`] turns them into an [`Identity`]
//! or refuses them.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{SyncError, SyncResult};
use crate::model::Identity;

/// What a connection presents when it joins or calls the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: Option<String>,
    pub claimed: Option<Identity>,
}

impl Credentials {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            claimed: None,
        }
    }

    pub fn claim(identity: Identity) -> Self {
        Self {
            token: None,
            claimed: Some(identity),
        }
    }
}

pub trait IdentityProvider: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> SyncResult<Identity>;
}

/// Accepts the claimed identity as-is.
///
/// For deployments where an upstream proxy has already authenticated the
/// caller and forwards who it is.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedIdentity;

impl IdentityProvider for TrustedIdentity {
    fn authenticate(&self, credentials: &Credentials) -> SyncResult<Identity> {
        credentials
            .claimed
            .clone()
            .ok_or_else(|| SyncError::AccessDenied("no identity presented".into()))
    }
}

/// Fixed token → identity table.
#[derive(Default)]
pub struct StaticTokens {
    tokens: RwLock<HashMap<String, Identity>>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, identity: Identity) {
        self.tokens.write().insert(token.into(), identity);
    }

    #[must_use]
    pub fn with(self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity);
        self
    }
}

impl IdentityProvider for StaticTokens {
    fn authenticate(&self, credentials: &Credentials) -> SyncResult<Identity> {
        let token = credentials
            .token
            .as_deref()
            .ok_or_else(|| SyncError::AccessDenied("missing token".into()))?;
        self.tokens
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| SyncError::AccessDenied("unknown token".into()))
    }
}
