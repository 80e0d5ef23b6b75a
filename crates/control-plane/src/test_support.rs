use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use common::peer::PeerEntry;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{BandwidthConfig, FailoverConfig, SelectionConfig};
use crate::directory::ServerDirectory;
use crate::failover::FailoverCoordinator;
use crate::ipam::AddressPool;
use crate::lifecycle::PeerLifecycleManager;
use crate::notify::{Notifier, OperatorAlert, ServerChange};
use crate::peers::{HealthProbe, PeerApi, PeerApiError};
use crate::persistence::{
    migrations, servers as server_store, AccessLevel, Db, HealthStatus, NewServer, ServerRecord,
};
use crate::selector::{ServerSelector, Subscriber};

pub(crate) async fn test_pool() -> Db {
    let db = migrations::init_pool("sqlite::memory:").await.expect("pool");
    migrations::run_migrations(&db).await.expect("migrations");
    db
}

/// A deterministic, valid WireGuard public key.
pub(crate) fn wg_key(seed: u8) -> String {
    STANDARD.encode([seed; 32])
}

pub(crate) fn sample_server(name: &str, max_users: i64) -> ServerRecord {
    let now = Utc::now();
    ServerRecord {
        id: Uuid::new_v4(),
        name: name.into(),
        location: String::new(),
        country_code: None,
        address: "127.0.0.1".into(),
        api_port: i64::from(server_store::DEFAULT_API_PORT),
        wg_port: i64::from(server_store::DEFAULT_WG_PORT),
        wg_public_key: None,
        dns: None,
        provider: None,
        max_users,
        current_users: 0,
        bandwidth_used: 0,
        bandwidth_cap_bytes: None,
        access_level: AccessLevel::Public,
        is_visible: true,
        is_active: true,
        vip_email: None,
        dedicated_user_email: None,
        port_forwarding_allowed: false,
        health_status: HealthStatus::Online,
        last_health_check: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) async fn insert_server(pool: &Db, name: &str, max_users: i64) -> ServerRecord {
    let mut new_server = NewServer::new(name, "127.0.0.1", max_users);
    new_server.location = format!("{name} city");
    new_server.wg_public_key = Some(wg_key(200));
    server_store::create_server(pool, new_server)
        .await
        .expect("insert server")
}

pub(crate) async fn set_load(pool: &Db, id: Uuid, current_users: i64) {
    sqlx::query("UPDATE servers SET current_users = ?2 WHERE id = ?1")
        .bind(id)
        .bind(current_users)
        .execute(pool)
        .await
        .expect("set load");
}

pub(crate) fn directory(pool: &Db) -> ServerDirectory {
    ServerDirectory::new(
        pool.clone(),
        &SelectionConfig::default(),
        BandwidthConfig::default(),
    )
}

#[derive(Default)]
struct FakeNodes {
    peers: HashMap<Uuid, HashMap<String, Option<String>>>,
    unreachable: HashSet<Uuid>,
    rejected_keys: HashSet<String>,
    health: HashMap<Uuid, HealthProbe>,
    delay: Option<Duration>,
}

/// In-memory stand-in for the node management API.
#[derive(Clone, Default)]
pub(crate) struct FakePeerApi {
    nodes: Arc<Mutex<FakeNodes>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakePeerApi {
    fn nodes(&self) -> std::sync::MutexGuard<'_, FakeNodes> {
        self.nodes.lock().expect("fake nodes")
    }

    pub(crate) fn has_peer(&self, server_id: Uuid, key: &str) -> bool {
        self.nodes()
            .peers
            .get(&server_id)
            .is_some_and(|peers| peers.contains_key(key))
    }

    pub(crate) fn allowed_ips_of(&self, server_id: Uuid, key: &str) -> Option<String> {
        self.nodes()
            .peers
            .get(&server_id)
            .and_then(|peers| peers.get(key).cloned().flatten())
    }

    pub(crate) fn peers_on(&self, server_id: Uuid) -> Vec<String> {
        let mut keys: Vec<String> = self
            .nodes()
            .peers
            .get(&server_id)
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub(crate) fn seed_peer(&self, server_id: Uuid, key: &str) {
        self.nodes()
            .peers
            .entry(server_id)
            .or_default()
            .insert(key.to_string(), None);
    }

    pub(crate) fn drop_peer(&self, server_id: Uuid, key: &str) {
        if let Some(peers) = self.nodes().peers.get_mut(&server_id) {
            peers.remove(key);
        }
    }

    pub(crate) fn set_unreachable(&self, server_id: Uuid, unreachable: bool) {
        let mut nodes = self.nodes();
        if unreachable {
            nodes.unreachable.insert(server_id);
        } else {
            nodes.unreachable.remove(&server_id);
        }
    }

    pub(crate) fn reject_key(&self, key: &str) {
        self.nodes().rejected_keys.insert(key.to_string());
    }

    pub(crate) fn set_health(&self, server_id: Uuid, probe: HealthProbe) {
        self.nodes().health.insert(server_id, probe);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.nodes().delay = Some(delay);
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check_reachable(&self, server: &ServerRecord) -> Result<(), PeerApiError> {
        if self.nodes().unreachable.contains(&server.id) {
            return Err(PeerApiError::RemoteUnreachable {
                server: server.name.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    async fn pause(&self) {
        let delay = self.nodes().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PeerApi for FakePeerApi {
    async fn add_peer(
        &self,
        server: &ServerRecord,
        public_key: &str,
        allowed_ips: Option<&str>,
    ) -> Result<(), PeerApiError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.pause().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.check_reachable(server)?;
        let mut nodes = self.nodes();
        if nodes.rejected_keys.contains(public_key) {
            return Err(PeerApiError::RemoteRejected {
                server: server.name.clone(),
                status: 500,
                body: "wg set failed".into(),
            });
        }
        nodes
            .peers
            .entry(server.id)
            .or_default()
            .insert(public_key.to_string(), allowed_ips.map(str::to_string));
        Ok(())
    }

    async fn remove_peer(&self, server: &ServerRecord, public_key: &str) -> Result<(), PeerApiError> {
        self.check_reachable(server)?;
        if let Some(peers) = self.nodes().peers.get_mut(&server.id) {
            peers.remove(public_key);
        }
        Ok(())
    }

    async fn check_health(&self, server: &ServerRecord) -> HealthProbe {
        if self.check_reachable(server).is_err() {
            return HealthProbe::offline("connection refused");
        }
        self.nodes()
            .health
            .get(&server.id)
            .cloned()
            .unwrap_or(HealthProbe {
                status: HealthStatus::Online,
                response_time_ms: Some(3),
                detail: None,
            })
    }

    async fn list_peers(&self, server: &ServerRecord) -> Result<Vec<PeerEntry>, PeerApiError> {
        self.check_reachable(server)?;
        Ok(self
            .nodes()
            .peers
            .get(&server.id)
            .map(|peers| {
                peers
                    .iter()
                    .map(|(key, allowed)| PeerEntry {
                        public_key: key.clone(),
                        allowed_ips: allowed.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct Recorded {
    changes: Vec<ServerChange>,
    alerts: Vec<OperatorAlert>,
    cancel_on_change: Option<CancellationToken>,
}

#[derive(Clone, Default)]
pub(crate) struct RecordingNotifier {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingNotifier {
    pub(crate) fn changes(&self) -> Vec<ServerChange> {
        self.inner.lock().expect("recorded").changes.clone()
    }

    pub(crate) fn alerts(&self) -> Vec<OperatorAlert> {
        self.inner.lock().expect("recorded").alerts.clone()
    }

    /// Cancels `token` on the first user notification.
    pub(crate) fn cancel_on_change(&self, token: CancellationToken) {
        self.inner.lock().expect("recorded").cancel_on_change = Some(token);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_user_server_change(&self, change: &ServerChange) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("recorded");
        inner.changes.push(change.clone());
        if let Some(token) = &inner.cancel_on_change {
            token.cancel();
        }
        Ok(())
    }

    async fn notify_operator(&self, alert: &OperatorAlert) -> crate::Result<()> {
        self.inner.lock().expect("recorded").alerts.push(alert.clone());
        Ok(())
    }
}

/// The fleet services wired over an in-memory database and fake nodes.
pub(crate) struct TestFleet {
    pub db: Db,
    pub directory: ServerDirectory,
    pub selector: ServerSelector,
    pub peers: FakePeerApi,
    pub notifier: RecordingNotifier,
    pub lifecycle: PeerLifecycleManager,
    pub failover: FailoverCoordinator,
}

impl TestFleet {
    pub(crate) async fn new() -> Self {
        let db = test_pool().await;
        let directory = directory(&db);
        let selector = ServerSelector::new(directory.clone());
        let peers = FakePeerApi::default();
        let notifier = RecordingNotifier::default();
        let addresses = AddressPool::new(db.clone(), "10.8.0.0/16".parse().expect("subnet"));
        let lifecycle = PeerLifecycleManager::new(
            directory.clone(),
            selector.clone(),
            Arc::new(peers.clone()),
            Arc::new(notifier.clone()),
            addresses,
        );
        let failover = FailoverCoordinator::new(
            directory.clone(),
            selector.clone(),
            lifecycle.clone(),
            Arc::new(notifier.clone()),
            FailoverConfig::default(),
        );
        Self {
            db,
            directory,
            selector,
            peers,
            notifier,
            lifecycle,
            failover,
        }
    }

    pub(crate) fn set_failover_config(&mut self, config: FailoverConfig) {
        self.failover = FailoverCoordinator::new(
            self.directory.clone(),
            self.selector.clone(),
            self.lifecycle.clone(),
            Arc::new(self.notifier.clone()),
            config,
        );
    }

    pub(crate) async fn server(&self, name: &str, max_users: i64) -> ServerRecord {
        insert_server(&self.db, name, max_users).await
    }

    pub(crate) fn user(&self, user_id: i64) -> Subscriber {
        Subscriber {
            user_id,
            email: format!("user{user_id}@example.com"),
            is_vip: false,
        }
    }

    pub(crate) async fn load_of(&self, server_id: Uuid) -> i64 {
        self.directory
            .get(server_id)
            .await
            .expect("server")
            .current_users
    }
}
