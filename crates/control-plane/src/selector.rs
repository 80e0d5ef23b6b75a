use std::cmp::Ordering;

use ::metrics::counter;
use tracing::debug;
use uuid::Uuid;

use crate::directory::ServerDirectory;
use crate::error::{FleetError, FleetResult};
use crate::persistence::{servers as server_store, ServerRecord};

/// The user a placement decision is made for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub user_id: i64,
    pub email: String,
    pub is_vip: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// The user's own server, chosen regardless of load.
    Dedicated,
    LeastLoaded,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::Dedicated => "dedicated",
            SelectionReason::LeastLoaded => "least_loaded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub server: ServerRecord,
    pub reason: SelectionReason,
}

#[derive(Clone)]
pub struct ServerSelector {
    directory: ServerDirectory,
}

impl ServerSelector {
    pub fn new(directory: ServerDirectory) -> Self {
        Self { directory }
    }

    pub async fn get_best_server_for_user(&self, user: &Subscriber) -> FleetResult<ServerRecord> {
        Ok(self.select(user).await?.server)
    }

    /// Dedicated server first for VIPs, otherwise the least loaded public server.
    pub async fn select(&self, user: &Subscriber) -> FleetResult<Selection> {
        if user.is_vip {
            if let Some(server) =
                server_store::find_bound_server(self.directory.db(), &user.email).await?
            {
                debug!(user_id = user.user_id, server = %server.name, "dedicated server selected");
                counter!("fleet_selections_total", "reason" => SelectionReason::Dedicated.as_str())
                    .increment(1);
                return Ok(Selection {
                    server,
                    reason: SelectionReason::Dedicated,
                });
            }
        }

        let candidates = server_store::list_selection_candidates(self.directory.db()).await?;
        let mut ranked = Vec::with_capacity(candidates.len());
        for server in candidates {
            let uptime = self.directory.uptime_percentage(server.id).await?;
            ranked.push((server, uptime));
        }
        ranked.sort_by(|(a, a_uptime), (b, b_uptime)| {
            a.cmp_load(b)
                .then_with(|| b_uptime.total_cmp(a_uptime))
                .then_with(|| a.name.cmp(&b.name))
        });

        let Some((server, uptime)) = ranked.into_iter().next() else {
            counter!("fleet_selections_total", "reason" => "none").increment(1);
            return Err(FleetError::NoServerAvailable);
        };
        debug!(
            user_id = user.user_id,
            server = %server.name,
            load = server.load_percentage(),
            uptime,
            "least loaded server selected"
        );
        counter!("fleet_selections_total", "reason" => SelectionReason::LeastLoaded.as_str())
            .increment(1);
        Ok(Selection {
            server,
            reason: SelectionReason::LeastLoaded,
        })
    }

    /// Shared server that can absorb devices from `failed_id`. Dedicated servers never qualify.
    pub async fn find_backup_server(&self, failed_id: Uuid) -> FleetResult<Option<ServerRecord>> {
        let mut candidates =
            server_store::list_backup_candidates(self.directory.db(), failed_id).await?;
        candidates.sort_by(backup_order);
        Ok(candidates.into_iter().next())
    }
}

fn backup_order(a: &ServerRecord, b: &ServerRecord) -> Ordering {
    a.cmp_load(b)
        .then_with(|| b.port_forwarding_allowed.cmp(&a.port_forwarding_allowed))
        .then_with(|| a.name.cmp(&b.name))
}
