//! Overlay address allocation.
//!
//! Addresses are unique across the whole fleet so a device keeps its IP when
//! it migrates. The first host of the subnet is reserved for the nodes.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use ipnetwork::Ipv4Network;
use tracing::warn;

use crate::error::{FleetError, FleetResult};
use crate::persistence::{devices as device_store, Db};

#[derive(Clone)]
pub struct AddressPool {
    db: Db,
    network: Ipv4Network,
    leased: Arc<Mutex<HashSet<Ipv4Addr>>>,
}

/// An address held for a provisioning in flight. Released on drop.
#[derive(Debug)]
pub struct AddressLease {
    ip: Ipv4Addr,
    leased: Arc<Mutex<HashSet<Ipv4Addr>>>,
}

impl AddressLease {
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        match self.leased.lock() {
            Ok(mut leased) => {
                leased.remove(&self.ip);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.ip);
            }
        }
    }
}

impl AddressPool {
    pub fn new(db: Db, network: Ipv4Network) -> Self {
        Self {
            db,
            network,
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    fn host_range(&self) -> (u32, u32) {
        let first = u32::from(self.network.network()).saturating_add(2);
        let last = u32::from(self.network.broadcast()).saturating_sub(1);
        (first, last)
    }

    /// Parses `raw` and checks that it is an allocatable host of the subnet.
    pub fn validate(&self, raw: &str) -> FleetResult<Ipv4Addr> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_suffix("/32").unwrap_or(trimmed);
        let ip: Ipv4Addr = trimmed
            .parse()
            .map_err(|_| FleetError::InvalidInput(format!("invalid overlay address {raw}")))?;
        let (first, last) = self.host_range();
        let value = u32::from(ip);
        if !self.network.contains(ip) || value < first || value > last {
            return Err(FleetError::InvalidInput(format!(
                "overlay address {ip} is outside the allocatable range of {}",
                self.network
            )));
        }
        Ok(ip)
    }

    /// Leases the lowest free address, or `requested` when it is free.
    pub async fn lease(&self, requested: Option<&str>) -> FleetResult<AddressLease> {
        let requested = requested.map(|raw| self.validate(raw)).transpose()?;
        let used: HashSet<Ipv4Addr> = device_store::list_assigned_ips(&self.db)
            .await?
            .iter()
            .filter_map(|ip| match ip.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(%ip, "unparseable assigned_ip in devices table");
                    None
                }
            })
            .collect();

        let mut leased = self
            .leased
            .lock()
            .map_err(|_| anyhow::anyhow!("address lease table poisoned"))?;

        let ip = match requested {
            Some(ip) => {
                if used.contains(&ip) || leased.contains(&ip) {
                    return Err(FleetError::InvalidInput(format!(
                        "overlay address {ip} is already assigned"
                    )));
                }
                ip
            }
            None => {
                let (first, last) = self.host_range();
                (first..=last)
                    .map(Ipv4Addr::from)
                    .find(|ip| !used.contains(ip) && !leased.contains(ip))
                    .ok_or(FleetError::AddressPoolExhausted)?
            }
        };

        leased.insert(ip);
        Ok(AddressLease {
            ip,
            leased: Arc::clone(&self.leased),
        })
    }
}
