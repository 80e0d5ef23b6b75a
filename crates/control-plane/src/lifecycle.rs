//! Creating, moving and removing client devices.
//!
//! The database and the WireGuard configuration on the nodes are two sources
//! of truth. Every operation here orders its steps so that a failure part way
//! leaves at worst a stale peer on a node, never a device row pointing at a
//! server that does not know its key. Load counters are reserved before any
//! remote change and released on every failure path.

use std::collections::HashSet;

use ::metrics::counter;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client_config;
use crate::directory::ServerDirectory;
use crate::error::{FleetError, FleetResult};
use crate::ipam::AddressPool;
use crate::notify::{DynNotifier, ServerChange};
use crate::peers::DynPeerApi;
use crate::persistence::{devices as device_store, DeviceRecord, NewDevice, ServerRecord};
use crate::selector::{SelectionReason, ServerSelector, Subscriber};

const MAX_DEVICE_NAME_LEN: usize = 64;
const WG_KEY_LEN: usize = 32;
/// Selection is retried when a least-loaded pick fills up before we reserve it.
const MAX_PLACEMENT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub name: String,
    pub public_key: String,
    pub assigned_ip: Option<String>,
}

/// Differences between the device table and a node's live peer list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Devices recorded on the server whose key the node does not have.
    pub missing_on_remote: Vec<String>,
    /// Keys on the node that no device row claims for this server.
    pub unknown_on_remote: Vec<String>,
}

#[derive(Clone)]
pub struct PeerLifecycleManager {
    directory: ServerDirectory,
    selector: ServerSelector,
    peers: DynPeerApi,
    notifier: DynNotifier,
    addresses: AddressPool,
}

impl PeerLifecycleManager {
    pub fn new(
        directory: ServerDirectory,
        selector: ServerSelector,
        peers: DynPeerApi,
        notifier: DynNotifier,
        addresses: AddressPool,
    ) -> Self {
        Self {
            directory,
            selector,
            peers,
            notifier,
            addresses,
        }
    }

    pub fn directory(&self) -> &ServerDirectory {
        &self.directory
    }

    pub async fn device(&self, id: Uuid) -> FleetResult<DeviceRecord> {
        device_store::get_device(self.directory.db(), id)
            .await?
            .ok_or_else(|| FleetError::device_not_found(id))
    }

    pub async fn devices_for_user(&self, user_id: i64) -> FleetResult<Vec<DeviceRecord>> {
        Ok(device_store::list_devices_for_user(self.directory.db(), user_id).await?)
    }

    /// Places a new device on the best server for `user` and registers its key there.
    pub async fn provision(&self, user: &Subscriber, params: DeviceParams) -> FleetResult<DeviceRecord> {
        let name = params.name.trim();
        if name.is_empty() || name.len() > MAX_DEVICE_NAME_LEN {
            return Err(FleetError::InvalidInput(format!(
                "device name must be 1-{MAX_DEVICE_NAME_LEN} characters"
            )));
        }
        validate_public_key(&params.public_key)?;
        if device_store::find_device_by_public_key(self.directory.db(), &params.public_key)
            .await?
            .is_some()
        {
            return Err(FleetError::InvalidInput("public key is already registered".into()));
        }

        let server = self.reserve_placement(user).await?;

        let lease = match self.addresses.lease(params.assigned_ip.as_deref()).await {
            Ok(lease) => lease,
            Err(err) => {
                self.release_slot(server.id).await;
                return Err(err);
            }
        };
        let assigned_ip = lease.ip().to_string();
        let allowed_ips = format!("{assigned_ip}/32");

        if let Err(err) = self
            .peers
            .add_peer(&server, &params.public_key, Some(&allowed_ips))
            .await
        {
            warn!(user_id = user.user_id, server = %server.name, %err, "peer registration failed");
            self.release_slot(server.id).await;
            counter!("fleet_provisioning_total", "result" => "error").increment(1);
            return Err(FleetError::provision_failed(err.into()));
        }

        let new_device = NewDevice {
            id: Uuid::new_v4(),
            user_id: user.user_id,
            name: name.to_string(),
            public_key: params.public_key.clone(),
            assigned_ip,
            server_id: server.id,
        };
        let device = match device_store::create_device(self.directory.db(), new_device).await {
            Ok(device) => device,
            Err(err) => {
                error!(user_id = user.user_id, server = %server.name, ?err, "device insert failed after peer registration");
                if let Err(remove_err) = self.peers.remove_peer(&server, &params.public_key).await {
                    error!(server = %server.name, %remove_err, "peer left on node without a device row");
                }
                self.release_slot(server.id).await;
                counter!("fleet_provisioning_total", "result" => "error").increment(1);
                return Err(FleetError::provision_failed(FleetError::Storage(err)));
            }
        };
        drop(lease);

        info!(
            device_id = %device.id,
            user_id = device.user_id,
            server = %server.name,
            ip = %device.assigned_ip,
            "device provisioned"
        );
        counter!("fleet_provisioning_total", "result" => "ok").increment(1);
        Ok(device)
    }

    async fn reserve_placement(&self, user: &Subscriber) -> FleetResult<ServerRecord> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let selection = self.selector.select(user).await?;
            match self.directory.increment_load(selection.server.id).await {
                Ok(()) => return Ok(selection.server),
                Err(FleetError::CapacityExhausted { server_id })
                    if selection.reason == SelectionReason::LeastLoaded
                        && attempt < MAX_PLACEMENT_ATTEMPTS =>
                {
                    debug!(%server_id, attempt, "selected server filled up, selecting again");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Removes the device from its node and forgets it.
    pub async fn deprovision(&self, device_id: Uuid) -> FleetResult<()> {
        let device = self.device(device_id).await?;
        self.drop_remote_peer(device_id, device.server_id, &device.public_key)
            .await;
        let Some(server_id) = device_store::delete_device(self.directory.db(), device_id).await?
        else {
            return Err(FleetError::device_not_found(device_id));
        };
        if server_id != device.server_id {
            // Moved while the old peer was being removed.
            self.drop_remote_peer(device_id, server_id, &device.public_key)
                .await;
        }
        self.release_slot(server_id).await;
        info!(%device_id, user_id = device.user_id, "device deprovisioned");
        counter!("fleet_deprovisioning_total").increment(1);
        Ok(())
    }

    /// Moves a device to `new_server_id`, keeping its key and overlay address.
    pub async fn migrate(&self, device_id: Uuid, new_server_id: Uuid) -> FleetResult<DeviceRecord> {
        let device = self.device(device_id).await?;
        let target = self.directory.get(new_server_id).await?;
        if device.server_id == target.id {
            debug!(%device_id, server = %target.name, "device already on target server");
            return Ok(device);
        }
        let source = self.directory.get(device.server_id).await?;

        self.directory
            .increment_load(target.id)
            .await
            .map_err(|err| FleetError::migration_failed(device_id, err))?;

        if let Err(err) = self.peers.remove_peer(&source, &device.public_key).await {
            debug!(%device_id, server = %source.name, %err, "old peer removal failed, continuing");
        }

        let allowed_ips = device.allowed_ips();
        if let Err(err) = self
            .peers
            .add_peer(&target, &device.public_key, Some(&allowed_ips))
            .await
        {
            self.release_slot(target.id).await;
            self.restore_peer(&device, &source).await;
            counter!("fleet_migrations_total", "result" => "error").increment(1);
            return Err(FleetError::migration_failed(device_id, err.into()));
        }

        match device_store::update_device_server(self.directory.db(), device_id, source.id, target.id)
            .await
        {
            Ok(true) => {}
            Ok(false) => return self.settle_lost_move(&device, &target).await,
            Err(err) => {
                error!(%device_id, to = %target.name, ?err, "device row not updated, moving peer back");
                if let Err(remove_err) = self.peers.remove_peer(&target, &device.public_key).await {
                    warn!(%device_id, server = %target.name, %remove_err, "peer left on target server");
                }
                self.release_slot(target.id).await;
                self.restore_peer(&device, &source).await;
                counter!("fleet_migrations_total", "result" => "error").increment(1);
                return Err(FleetError::migration_failed(device_id, FleetError::Storage(err)));
            }
        }
        self.release_slot(source.id).await;

        let change = ServerChange {
            user_id: device.user_id,
            device_id,
            device_name: device.name.clone(),
            from_server: source.name.clone(),
            to_server: target.name.clone(),
            to_location: target.location.clone(),
        };
        if let Err(err) = self.notifier.notify_user_server_change(&change).await {
            warn!(%device_id, ?err, "server change notification failed");
        }

        info!(%device_id, from = %source.name, to = %target.name, "device migrated");
        counter!("fleet_migrations_total", "result" => "ok").increment(1);
        self.device(device_id).await
    }

    /// Compares the devices recorded on `server_id` with the node's peer list.
    pub async fn reconcile(&self, server_id: Uuid) -> FleetResult<ReconcileReport> {
        let server = self.directory.get(server_id).await?;
        let remote = self.peers.list_peers(&server).await?;
        let recorded = device_store::list_devices_for_server(self.directory.db(), server_id, None).await?;

        let remote_keys: HashSet<&str> = remote.iter().map(|peer| peer.public_key.as_str()).collect();
        let recorded_keys: HashSet<&str> = recorded.iter().map(|d| d.public_key.as_str()).collect();

        let mut missing_on_remote: Vec<String> = recorded_keys
            .difference(&remote_keys)
            .map(|key| key.to_string())
            .collect();
        let mut unknown_on_remote: Vec<String> = remote_keys
            .difference(&recorded_keys)
            .map(|key| key.to_string())
            .collect();
        missing_on_remote.sort();
        unknown_on_remote.sort();

        if !missing_on_remote.is_empty() || !unknown_on_remote.is_empty() {
            warn!(
                server = %server.name,
                missing = missing_on_remote.len(),
                unknown = unknown_on_remote.len(),
                "peer drift detected"
            );
        }
        Ok(ReconcileReport {
            missing_on_remote,
            unknown_on_remote,
        })
    }

    pub async fn client_config(&self, device_id: Uuid) -> FleetResult<String> {
        let device = self.device(device_id).await?;
        let server = self.directory.get(device.server_id).await?;
        client_config::render(&device, &server, None)
    }

    /// The row left `device`'s old server while this move was in flight: a
    /// concurrent move or a deprovision got there first.
    async fn settle_lost_move(
        &self,
        device: &DeviceRecord,
        target: &ServerRecord,
    ) -> FleetResult<DeviceRecord> {
        self.release_slot(target.id).await;
        let current = device_store::get_device(self.directory.db(), device.id).await?;
        if let Some(current) = current.as_ref().filter(|d| d.server_id == target.id) {
            debug!(device_id = %device.id, server = %target.name, "concurrent move already placed device");
            return Ok(current.clone());
        }

        if let Err(err) = self.peers.remove_peer(target, &device.public_key).await {
            warn!(device_id = %device.id, server = %target.name, %err, "peer left on target server");
        }
        counter!("fleet_migrations_total", "result" => "error").increment(1);
        let cause = match current {
            Some(current) => FleetError::InvalidInput(format!(
                "device moved to server {} during migration",
                current.server_id
            )),
            None => FleetError::device_not_found(device.id),
        };
        Err(FleetError::migration_failed(device.id, cause))
    }

    async fn drop_remote_peer(&self, device_id: Uuid, server_id: Uuid, public_key: &str) {
        match self.directory.get(server_id).await {
            Ok(server) => {
                if let Err(err) = self.peers.remove_peer(&server, public_key).await {
                    warn!(%device_id, server = %server.name, %err, "peer removal failed, leaving a stale peer");
                }
            }
            Err(err) => warn!(%device_id, %err, "server of device not found"),
        }
    }

    async fn release_slot(&self, server_id: Uuid) {
        if let Err(err) = self.directory.decrement_load(server_id).await {
            warn!(%server_id, %err, "load counter release failed");
        }
    }

    async fn restore_peer(&self, device: &DeviceRecord, source: &ServerRecord) {
        let allowed_ips = device.allowed_ips();
        match self
            .peers
            .add_peer(source, &device.public_key, Some(&allowed_ips))
            .await
        {
            Ok(()) => debug!(device_id = %device.id, server = %source.name, "peer restored on original server"),
            Err(err) => error!(
                device_id = %device.id,
                server = %source.name,
                %err,
                "device has no peer on any server after failed migration"
            ),
        }
    }
}

/// WireGuard public keys are 32 bytes, base64 encoded.
pub fn validate_public_key(key: &str) -> FleetResult<()> {
    match STANDARD.decode(key.trim()) {
        Ok(bytes) if bytes.len() == WG_KEY_LEN && key.trim() == key => Ok(()),
        _ => Err(FleetError::InvalidInput(
            "public_key must be a base64 encoded 32 byte WireGuard key".into(),
        )),
    }
}
