//! Management API of the remote VPN nodes.
//!
//! [`PeerApi`] is the seam every fleet operation goes through to touch a
//! node's WireGuard configuration. [`http::HttpPeerApi`] is the production
//! implementation; tests substitute an in-memory fake.

use std::sync::Arc;

use async_trait::async_trait;
use common::peer::PeerEntry;
use thiserror::Error;

use crate::persistence::{HealthStatus, ServerRecord};

pub mod http;

pub use http::HttpPeerApi;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerApiError {
    /// Connection refused, DNS failure, TLS failure or timeout.
    #[error("server {server} unreachable: {reason}")]
    RemoteUnreachable { server: String, reason: String },
    /// The node answered with a non-success status or refused the change.
    #[error("server {server} rejected the request with status {status}: {body}")]
    RemoteRejected {
        server: String,
        status: u16,
        body: String,
    },
    #[error("no API credential configured for server {server}")]
    ConfigMissing { server: String },
    #[error("server {server} returned an unreadable response: {reason}")]
    InvalidResponse { server: String, reason: String },
}

/// Outcome of a single health probe. Probes never fail; failures read as offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    pub status: HealthStatus,
    pub response_time_ms: Option<i64>,
    pub detail: Option<String>,
}

impl HealthProbe {
    pub fn offline(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Offline,
            response_time_ms: None,
            detail: Some(detail.into()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status != HealthStatus::Offline
    }
}

#[async_trait]
pub trait PeerApi: Send + Sync {
    /// Registers `public_key` on the node, typically with `allowed_ips = "<ip>/32"`.
    async fn add_peer(
        &self,
        server: &ServerRecord,
        public_key: &str,
        allowed_ips: Option<&str>,
    ) -> Result<(), PeerApiError>;

    /// Removes `public_key` from the node. Removing an absent peer succeeds.
    async fn remove_peer(&self, server: &ServerRecord, public_key: &str) -> Result<(), PeerApiError>;

    async fn check_health(&self, server: &ServerRecord) -> HealthProbe;

    async fn list_peers(&self, server: &ServerRecord) -> Result<Vec<PeerEntry>, PeerApiError>;
}

pub type DynPeerApi = Arc<dyn PeerApi>;
