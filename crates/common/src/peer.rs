//! Request and response bodies of the node management API.
//!
//! Every VPN node exposes the same four endpoints. All authenticated calls
//! carry the per-server secret in [`API_SECRET_HEADER`].

use serde::{Deserialize, Serialize};

/// Header carrying the per-server shared secret.
pub const API_SECRET_HEADER: &str = "X-API-Secret";
/// Path for registering a peer.
pub const ADD_PEER_PATH: &str = "/api/add-peer";
/// Path for removing a peer.
pub const REMOVE_PEER_PATH: &str = "/api/remove-peer";
/// Path for listing registered peers.
pub const LIST_PEERS_PATH: &str = "/api/list-peers";
/// Unauthenticated liveness path.
pub const HEALTH_PATH: &str = "/health";

/// Body of `POST /api/add-peer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPeerRequest {
    /// Base64 WireGuard public key of the device.
    pub public_key: String,
    /// Allowed IPs for the peer, e.g. `10.8.0.5/32`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<String>,
}

/// Body of `POST /api/remove-peer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovePeerRequest {
    /// Base64 WireGuard public key of the device.
    pub public_key: String,
}

/// One peer as reported by `GET /api/list-peers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Base64 WireGuard public key.
    pub public_key: String,
    /// Allowed IPs configured on the node, when reported.
    #[serde(default)]
    pub allowed_ips: Option<String>,
}

/// Response of `GET /api/list-peers`.
///
/// Nodes answer either with `{"peers": [...]}` or with a bare array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListPeersResponse {
    /// Object form with an optional count.
    Wrapped {
        /// Registered peers.
        peers: Vec<PeerEntry>,
        /// Count reported by the node.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_count: Option<u32>,
    },
    /// Bare array form.
    Bare(Vec<PeerEntry>),
}

impl ListPeersResponse {
    /// Returns the peers regardless of the response shape.
    pub fn into_peers(self) -> Vec<PeerEntry> {
        match self {
            ListPeersResponse::Wrapped { peers, .. } => peers,
            ListPeersResponse::Bare(peers) => peers,
        }
    }
}

/// Response of `GET /health`. Every field is optional; a bare 2xx is healthy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealthResponse {
    /// Self-reported state, `online` or `degraded`.
    #[serde(default)]
    pub status: Option<String>,
    /// Number of configured peers.
    #[serde(default)]
    pub peer_count: Option<u32>,
    /// Free-form detail from the node.
    #[serde(default)]
    pub detail: Option<String>,
}

/// Generic acknowledgement returned by mutating endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAck {
    /// Whether the node applied the change.
    #[serde(default)]
    pub success: Option<bool>,
    /// Error or status text.
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_peers_accepts_wrapped_and_bare_shapes() {
        let wrapped: ListPeersResponse = serde_json::from_str(
            r#"{"peers":[{"public_key":"abc","allowed_ips":"10.8.0.2/32"}],"peer_count":1}"#,
        )
        .expect("wrapped");
        let bare: ListPeersResponse =
            serde_json::from_str(r#"[{"public_key":"abc"}]"#).expect("bare");

        assert_eq!(wrapped.into_peers()[0].allowed_ips.as_deref(), Some("10.8.0.2/32"));
        assert_eq!(bare.into_peers()[0].public_key, "abc");
    }

    #[test]
    fn add_peer_omits_missing_allowed_ips() {
        let body = serde_json::to_value(AddPeerRequest {
            public_key: "abc".into(),
            allowed_ips: None,
        })
        .expect("serialize");
        assert_eq!(body, serde_json::json!({ "public_key": "abc" }));
    }
}
