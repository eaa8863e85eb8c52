//! Local interface scan.
//!
//! The bus advertises the mac addresses of the interfaces a device could
//! reach us through. Loopback, link-local and public addresses are not
//! part of that set.

use std::net::IpAddr;

use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tracing::{debug, warn};

/// Address usable on a home LAN.
pub fn is_lan_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && v4.is_private(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            !v6.is_loopback() && !link_local && unique_local
        }
    }
}

fn usable_mac(mac: &str) -> Option<String> {
    let mac = mac.trim().to_ascii_lowercase();
    if mac.is_empty() || mac == "00:00:00:00:00:00" {
        None
    } else {
        Some(mac)
    }
}

fn interfaces() -> Vec<NetworkInterface> {
    NetworkInterface::show().unwrap_or_else(|e| {
        warn!(error = %e, "Unable to list network interfaces");
        Vec::new()
    })
}

/// Sorted, deduplicated mac addresses of interfaces carrying a LAN address.
pub fn local_macs() -> Vec<String> {
    let mut macs: Vec<String> = interfaces()
        .into_iter()
        .filter(|itf| itf.addr.iter().any(|a| is_lan_address(&a.ip())))
        .filter_map(|itf| itf.mac_addr.as_deref().and_then(usable_mac))
        .collect();
    macs.sort();
    macs.dedup();
    debug!(count = macs.len(), "Local mac addresses");
    macs
}

/// First LAN address of this host, advertised in the `ip` header.
pub fn local_lan_ip() -> Option<IpAddr> {
    interfaces()
        .into_iter()
        .flat_map(|itf| itf.addr.into_iter().map(|a| a.ip()))
        .find(|ip| ip.is_ipv4() && is_lan_address(ip))
}

/// Whether `/proc/net/route` holds a default IPv4 route.
pub(crate) fn proc_route_has_default(content: &str) -> bool {
    content.lines().skip(1).any(|line| {
        let mut cols = line.split_whitespace();
        matches!((cols.next(), cols.next()), (Some(_), Some("00000000")))
    })
}

/// Whether the host currently has a route out.
///
/// Linux exposes the routing table directly. Elsewhere a LAN address on any
/// interface is taken as the sign that the network is up.
pub fn has_default_route() -> bool {
    if cfg!(target_os = "linux") {
        if let Ok(content) = std::fs::read_to_string("/proc/net/route") {
            return proc_route_has_default(&content);
        }
    }
    local_lan_ip().is_some()
}
