use crate::error::{FleetError, FleetResult};
use crate::persistence::{DeviceRecord, ServerRecord};

pub const PRIVATE_KEY_PLACEHOLDER: &str = "<client-private-key>";
const DEFAULT_DNS: &str = "1.1.1.1, 8.8.8.8";
const KEEPALIVE_SECS: u16 = 25;

/// WireGuard `wg-quick` config for `device` on `server`. The private key never
/// leaves the client, so a placeholder is emitted unless one is supplied.
pub fn render(device: &DeviceRecord, server: &ServerRecord, private_key: Option<&str>) -> FleetResult<String> {
    let server_key = server
        .wg_public_key
        .as_deref()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| {
            FleetError::InvalidInput(format!(
                "server {} has no WireGuard public key configured",
                server.name
            ))
        })?;
    let dns = server
        .dns
        .as_deref()
        .filter(|dns| !dns.trim().is_empty())
        .unwrap_or(DEFAULT_DNS);
    let host = if server.address.contains(':') && !server.address.starts_with('[') {
        format!("[{}]", server.address)
    } else {
        server.address.clone()
    };

    let private_key = private_key.unwrap_or(PRIVATE_KEY_PLACEHOLDER);
    let address = device.allowed_ips();
    let wg_port = server.wg_port;

    Ok(format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {address}\n\
         DNS = {dns}\n\
         \n\
         [Peer]\n\
         PublicKey = {server_key}\n\
         AllowedIPs = 0.0.0.0/0, ::/0\n\
         Endpoint = {host}:{wg_port}\n\
         PersistentKeepalive = {KEEPALIVE_SECS}\n"
    ))
}
