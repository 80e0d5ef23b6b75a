//! User and operator notifications.
//!
//! Delivery is best-effort: callers log failures and move on.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::Result;

/// A device of `user_id` now lives on a different server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerChange {
    pub user_id: i64,
    pub device_id: Uuid,
    pub device_name: String,
    pub from_server: String,
    pub to_server: String,
    pub to_location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorAlert {
    ServerOffline {
        server_id: Uuid,
        server_name: String,
    },
    NoBackupAvailable {
        server_id: Uuid,
        server_name: String,
    },
    FailoverFinished {
        server_id: Uuid,
        server_name: String,
        backup_name: String,
        migrated: u32,
        failed: u32,
        skipped: u32,
    },
    BandwidthCritical {
        server_id: Uuid,
        server_name: String,
        percentage: f64,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user_server_change(&self, change: &ServerChange) -> Result<()>;
    async fn notify_operator(&self, alert: &OperatorAlert) -> Result<()>;
}

pub type DynNotifier = Arc<dyn Notifier>;

/// Writes notifications to the structured log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_user_server_change(&self, change: &ServerChange) -> Result<()> {
        info!(
            user_id = change.user_id,
            device_id = %change.device_id,
            from = %change.from_server,
            to = %change.to_server,
            "user device moved to another server"
        );
        Ok(())
    }

    async fn notify_operator(&self, alert: &OperatorAlert) -> Result<()> {
        warn!(alert = ?alert, "operator alert");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WebhookEvent<'a> {
    ServerChange(&'a ServerChange),
    OperatorAlert(&'a OperatorAlert),
}

/// Posts every notification as JSON to a configured endpoint.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, event: WebhookEvent<'_>) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_user_server_change(&self, change: &ServerChange) -> Result<()> {
        self.post(WebhookEvent::ServerChange(change)).await
    }

    async fn notify_operator(&self, alert: &OperatorAlert) -> Result<()> {
        self.post(WebhookEvent::OperatorAlert(alert)).await
    }
}

pub fn from_config(config: &crate::config::NotificationConfig) -> Result<DynNotifier> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}
