use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::peer::{
    AddPeerRequest, ListPeersResponse, NodeHealthResponse, PeerAck, PeerEntry, RemovePeerRequest,
    ADD_PEER_PATH, API_SECRET_HEADER, HEALTH_PATH, LIST_PEERS_PATH, REMOVE_PEER_PATH,
};
use metrics::counter;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{HealthProbe, PeerApi, PeerApiError};
use crate::config::PeerApiConfig;
use crate::credentials::DynCredentialStore;
use crate::persistence::{HealthStatus, ServerRecord};

/// [`PeerApi`] over HTTPS with the `X-API-Secret` header.
#[derive(Clone)]
pub struct HttpPeerApi {
    client: reqwest::Client,
    credentials: DynCredentialStore,
    scheme: String,
    health_timeout: Duration,
    request_timeout: Duration,
}

impl HttpPeerApi {
    pub fn new(config: &PeerApiConfig, credentials: DynCredentialStore) -> anyhow::Result<Self> {
        if config.accept_invalid_certs {
            warn!("peer API certificate validation disabled");
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(concat!("fleet-control-plane/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            credentials,
            scheme: config.scheme.clone(),
            health_timeout: config.health_timeout(),
            request_timeout: config.request_timeout(),
        })
    }

    fn url(&self, server: &ServerRecord, path: &str) -> String {
        let host = if server.address.contains(':') && !server.address.starts_with('[') {
            format!("[{}]", server.address)
        } else {
            server.address.clone()
        };
        format!("{}://{}:{}{}", self.scheme, host, server.api_port, path)
    }

    async fn secret(&self, server: &ServerRecord) -> Result<String, PeerApiError> {
        match self.credentials.api_secret(server.id).await {
            Ok(Some(secret)) if !secret.is_empty() => Ok(secret),
            Ok(_) => Err(PeerApiError::ConfigMissing {
                server: server.name.clone(),
            }),
            Err(err) => {
                warn!(?err, server = %server.name, "credential lookup failed");
                Err(PeerApiError::ConfigMissing {
                    server: server.name.clone(),
                })
            }
        }
    }

    async fn post_json<T: serde::Serialize>(
        &self,
        server: &ServerRecord,
        path: &str,
        body: &T,
    ) -> Result<(StatusCode, String), PeerApiError> {
        let secret = self.secret(server).await?;
        let response = self
            .client
            .post(self.url(server, path))
            .header(API_SECRET_HEADER, secret)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|err| unreachable(server, &err))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

fn unreachable(server: &ServerRecord, err: &reqwest::Error) -> PeerApiError {
    let reason = if err.is_timeout() {
        "timed out".to_string()
    } else {
        err.to_string()
    };
    PeerApiError::RemoteUnreachable {
        server: server.name.clone(),
        reason,
    }
}

fn rejected(server: &ServerRecord, status: StatusCode, body: String) -> PeerApiError {
    PeerApiError::RemoteRejected {
        server: server.name.clone(),
        status: status.as_u16(),
        body,
    }
}

/// Nodes may answer 200 with `{"success": false}`; treat that as a refusal.
fn refusal(body: &str) -> Option<String> {
    let ack: PeerAck = serde_json::from_str(body).ok()?;
    match ack.success {
        Some(false) => Some(ack.error.unwrap_or_else(|| "request refused".to_string())),
        _ => None,
    }
}

fn reports_absent(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    lowered.contains("not found") || lowered.contains("no such peer") || lowered.contains("does not exist")
}

fn record_call(op: &'static str, result: &'static str) {
    counter!("fleet_peer_api_requests_total", "op" => op, "result" => result).increment(1);
}

#[async_trait]
impl PeerApi for HttpPeerApi {
    async fn add_peer(
        &self,
        server: &ServerRecord,
        public_key: &str,
        allowed_ips: Option<&str>,
    ) -> Result<(), PeerApiError> {
        let body = AddPeerRequest {
            public_key: public_key.to_string(),
            allowed_ips: allowed_ips.map(str::to_string),
        };
        let result = match self.post_json(server, ADD_PEER_PATH, &body).await {
            Ok((status, text)) if status.is_success() => match refusal(&text) {
                Some(reason) => Err(rejected(server, status, reason)),
                None => Ok(()),
            },
            Ok((status, text)) => Err(rejected(server, status, text)),
            Err(err) => Err(err),
        };
        record_call("add_peer", if result.is_ok() { "ok" } else { "error" });
        debug!(server = %server.name, ok = result.is_ok(), "add-peer");
        result
    }

    async fn remove_peer(&self, server: &ServerRecord, public_key: &str) -> Result<(), PeerApiError> {
        let body = RemovePeerRequest {
            public_key: public_key.to_string(),
        };
        let result = match self.post_json(server, REMOVE_PEER_PATH, &body).await {
            Ok((status, _)) if status == StatusCode::NOT_FOUND => Ok(()),
            Ok((status, text)) if status.is_success() => match refusal(&text) {
                Some(reason) if reports_absent(&reason) => Ok(()),
                Some(reason) => Err(rejected(server, status, reason)),
                None => Ok(()),
            },
            Ok((status, text)) if reports_absent(&text) => {
                debug!(server = %server.name, %status, "peer already absent");
                Ok(())
            }
            Ok((status, text)) => Err(rejected(server, status, text)),
            Err(err) => Err(err),
        };
        record_call("remove_peer", if result.is_ok() { "ok" } else { "error" });
        debug!(server = %server.name, ok = result.is_ok(), "remove-peer");
        result
    }

    async fn check_health(&self, server: &ServerRecord) -> HealthProbe {
        let started = Instant::now();
        let response = self
            .client
            .get(self.url(server, HEALTH_PATH))
            .timeout(self.health_timeout)
            .send()
            .await;
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let probe = match response {
            Err(err) => HealthProbe::offline(unreachable(server, &err).to_string()),
            Ok(response) if !response.status().is_success() => {
                HealthProbe::offline(format!("health endpoint returned {}", response.status()))
            }
            Ok(response) => {
                let body: NodeHealthResponse = response.json().await.unwrap_or_default();
                let status = match body.status.as_deref().map(str::to_ascii_lowercase) {
                    Some(s) if s == "degraded" => HealthStatus::Degraded,
                    Some(s) if s == "offline" => HealthStatus::Offline,
                    _ => HealthStatus::Online,
                };
                HealthProbe {
                    status,
                    response_time_ms: Some(elapsed_ms),
                    detail: body.detail,
                }
            }
        };
        record_call("check_health", probe.status.as_str());
        probe
    }

    async fn list_peers(&self, server: &ServerRecord) -> Result<Vec<PeerEntry>, PeerApiError> {
        let secret = self.secret(server).await?;
        let response = self
            .client
            .get(self.url(server, LIST_PEERS_PATH))
            .header(API_SECRET_HEADER, secret)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|err| unreachable(server, &err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            record_call("list_peers", "error");
            return Err(rejected(server, status, text));
        }

        let peers = response
            .json::<ListPeersResponse>()
            .await
            .map_err(|err| PeerApiError::InvalidResponse {
                server: server.name.clone(),
                reason: err.to_string(),
            })?
            .into_peers();
        record_call("list_peers", "ok");
        Ok(peers)
    }
}
