//! The `auth` module is the seam to the platform's client and channel
//! services.
//!
//! Both services live outside this crate and are consumed through the two
//! traits below. The helpers wrapping them fail closed: a transport error
//! from either service counts as a refusal.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::utils::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Publish,
    Subscribe,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Publish => f.write_str("publish"),
            Permission::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// Outcome of a secret lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Authentication {
    pub id: String,
    pub authenticated: bool,
}

#[async_trait]
pub trait ClientAuthenticator: Send + Sync {
    /// Resolves a client secret to the client's identity.
    async fn authenticate(&self, secret: &str) -> Result<Authentication>;
}

#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    /// Whether `client_id` holds `permission` on `channel_id`.
    async fn authorize(
        &self,
        client_id: &str,
        channel_id: &str,
        permission: Permission,
    ) -> Result<bool>;
}

/// Authenticates `secret`, returning the client identity.
pub async fn identify(auth: &dyn ClientAuthenticator, secret: &str) -> Result<String> {
    match auth.authenticate(secret).await {
        Ok(res) if res.authenticated && !res.id.is_empty() => Ok(res.id),
        Ok(_) => {
            warn!("client authentication refused");
            Err(Error::Authentication)
        }
        Err(e) => {
            warn!("client authentication failed: {e}");
            Err(Error::Authentication)
        }
    }
}

/// Authorizes `client_id` for `permission` on `channel_id`.
pub async fn check(
    authz: &dyn ChannelAuthorizer,
    client_id: &str,
    channel_id: &str,
    permission: Permission,
) -> Result<()> {
    match authz.authorize(client_id, channel_id, permission).await {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!(client = %client_id, channel = %channel_id, "{permission} not permitted");
            Err(Error::Authorization)
        }
        Err(e) => {
            warn!(client = %client_id, channel = %channel_id, "{permission} authorization failed: {e}");
            Err(Error::Authorization)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;
