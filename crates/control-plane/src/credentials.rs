//! Lookup of the per-server management API secret.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::persistence::{credentials as credential_store, Db};
use crate::Result;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn api_secret(&self, server_id: Uuid) -> Result<Option<String>>;
}

pub type DynCredentialStore = Arc<dyn CredentialStore>;

/// Secrets kept in the `server_credentials` table.
#[derive(Clone)]
pub struct DbCredentialStore {
    db: Db,
}

impl DbCredentialStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn store(&self, server_id: Uuid, secret: &str) -> Result<()> {
        credential_store::put_api_secret(&self.db, server_id, secret).await
    }
}

#[async_trait]
impl CredentialStore for DbCredentialStore {
    async fn api_secret(&self, server_id: Uuid) -> Result<Option<String>> {
        credential_store::get_api_secret(&self.db, server_id).await
    }
}

/// In-process secrets, for embedding and tests.
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    secrets: Arc<RwLock<HashMap<Uuid, String>>>,
}

impl MemoryCredentialStore {
    pub async fn insert(&self, server_id: Uuid, secret: impl Into<String>) {
        self.secrets.write().await.insert(server_id, secret.into());
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn api_secret(&self, server_id: Uuid) -> Result<Option<String>> {
        Ok(self.secrets.read().await.get(&server_id).cloned())
    }
}
