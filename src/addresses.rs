//! Address list computation from Kubernetes `Endpoints` objects.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};

use crate::target::{Port, TargetInfo};

/// A resolved backend address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    /// IP and port of the backend.
    pub addr: SocketAddr,
    /// The `service.namespace` name to present to the server (e.g. for TLS).
    pub server_name: String,
    /// Name of the object backing the address (usually the pod), if known.
    pub target_name: Option<String>,
}

/// Computes the sorted, de-duplicated list of ready addresses for `target`.
///
/// Not-ready addresses are never included. Subsets without a usable port and
/// addresses that are not IPs are skipped.
#[must_use]
pub fn make_addresses(endpoints: &Endpoints, target: &TargetInfo) -> Vec<Address> {
    let server_name = target.server_name();
    let mut addrs = BTreeMap::new();

    for subset in endpoints.subsets.iter().flatten() {
        let Some(port) = select_port(subset, target.port.as_ref()) else {
            tracing::debug!(
                "skipping endpoint subset without port {:?} for {server_name}",
                target.port
            );
            continue;
        };

        for address in subset.addresses.iter().flatten() {
            let Ok(ip) = address.ip.parse::<IpAddr>() else {
                tracing::debug!("skipping invalid endpoint address: {}", address.ip);
                continue;
            };

            let addr = SocketAddr::new(ip, port);
            addrs.entry(addr).or_insert_with(|| Address {
                addr,
                server_name: server_name.clone(),
                target_name: target_name(address),
            });
        }
    }

    addrs.into_values().collect()
}

/// Picks the port number to use for a subset.
///
/// With no requested port the first declared port wins. A named port must be
/// declared by the subset. A numeric port must be declared too, unless the
/// subset declares no ports at all.
fn select_port(subset: &EndpointSubset, requested: Option<&Port>) -> Option<u16> {
    let ports = subset.ports.as_deref().unwrap_or_default();

    match requested {
        None => ports.first().and_then(port_number),
        Some(Port::Name(name)) => ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .and_then(port_number),
        Some(Port::Number(n)) if ports.is_empty() => Some(*n),
        Some(Port::Number(n)) => ports
            .iter()
            .filter_map(port_number)
            .find(|p| p == n),
    }
}

fn port_number(port: &EndpointPort) -> Option<u16> {
    u16::try_from(port.port).ok().filter(|p| *p != 0)
}

fn target_name(address: &EndpointAddress) -> Option<String> {
    address
        .target_ref
        .as_ref()
        .and_then(|r| r.name.clone())
        .or_else(|| address.hostname.clone())
}
