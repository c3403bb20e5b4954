//! In-memory stand-ins for the client and channel services.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Authentication, ChannelAuthorizer, ClientAuthenticator, Permission};
use crate::utils::error::{Error, Result};

/// Maps secrets to client ids and grants explicit `(client, channel,
/// permission)` triples. `unreachable` makes every call fail like a dropped
/// connection.
#[derive(Default)]
pub struct StaticAuth {
    secrets: HashMap<String, String>,
    grants: HashSet<(String, String, Permission)>,
    pub unreachable: bool,
    pub calls: Mutex<Vec<(String, String, Permission)>>,
}

impl StaticAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(mut self, secret: &str, id: &str) -> Self {
        self.secrets.insert(secret.to_string(), id.to_string());
        self
    }

    pub fn grant(mut self, id: &str, channel: &str, permission: Permission) -> Self {
        self.grants
            .insert((id.to_string(), channel.to_string(), permission));
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }
}

#[async_trait]
impl ClientAuthenticator for StaticAuth {
    async fn authenticate(&self, secret: &str) -> Result<Authentication> {
        if self.unreachable {
            return Err(Error::backend("connection refused"));
        }
        Ok(match self.secrets.get(secret) {
            Some(id) => Authentication {
                id: id.clone(),
                authenticated: true,
            },
            None => Authentication::default(),
        })
    }
}

#[async_trait]
impl ChannelAuthorizer for StaticAuth {
    async fn authorize(
        &self,
        client_id: &str,
        channel_id: &str,
        permission: Permission,
    ) -> Result<bool> {
        if self.unreachable {
            return Err(Error::backend("connection refused"));
        }
        let key = (client_id.to_string(), channel_id.to_string(), permission);
        self.calls.lock().push(key.clone());
        Ok(self.grants.contains(&key))
    }
}
