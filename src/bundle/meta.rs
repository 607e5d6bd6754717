// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Platform network configuration for the node META partition.
//!
//! A machine without DHCP reads its address, default route and resolvers from
//! META key [`META_KEY_NETWORK`](crate::constants::META_KEY_NETWORK) while it is
//! still in maintenance mode. The document built here is what the node expects
//! under that key.

use crate::crd::MachineMeta;
use crate::errors::BundleError;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};

const LAYER_PLATFORM: &str = "platform";

/// Address part of a machine endpoint (`10.0.0.21`, `10.0.0.21:50000` or `[fd00::1]:50000`).
fn endpoint_ip(endpoint: &str) -> Option<IpAddr> {
    endpoint
        .parse::<IpAddr>()
        .ok()
        .or_else(|| endpoint.parse::<SocketAddr>().ok().map(|a| a.ip()))
}

/// Renders the platform network document for a machine reachable at `endpoint`.
///
/// # Errors
///
/// Returns [`BundleError::InvalidMeta`] when the endpoint is not an IP address, the
/// interface or gateway is empty, or the prefix length does not fit the address
/// family.
pub fn network_meta(endpoint: &str, meta: &MachineMeta) -> Result<String, BundleError> {
    let invalid = |reason: String| BundleError::InvalidMeta { reason };

    let ip = endpoint_ip(endpoint)
        .ok_or_else(|| invalid(format!("endpoint '{endpoint}' is not an IP address")))?;
    let (family, max_prefix) = match ip {
        IpAddr::V4(_) => ("inet4", 32),
        IpAddr::V6(_) => ("inet6", 128),
    };
    if meta.subnet == 0 || meta.subnet > max_prefix {
        return Err(invalid(format!(
            "prefix length {} is out of range for {family}",
            meta.subnet
        )));
    }
    if meta.interface.is_empty() {
        return Err(invalid("interface is required".to_string()));
    }
    if meta.gateway.parse::<IpAddr>().is_err() {
        return Err(invalid(format!("gateway '{}' is not an IP address", meta.gateway)));
    }

    let hostnames: Vec<Value> = if meta.hostname.is_empty() {
        Vec::new()
    } else {
        vec![json!({ "hostname": meta.hostname, "layer": LAYER_PLATFORM })]
    };

    let document = json!({
        "addresses": [{
            "address": format!("{ip}/{}", meta.subnet),
            "linkName": meta.interface,
            "family": family,
            "scope": "global",
            "flags": "permanent",
            "layer": LAYER_PLATFORM
        }],
        "links": [{
            "name": meta.interface,
            "logical": false,
            "up": true,
            "mtu": 0,
            "kind": "",
            "type": "ether",
            "layer": LAYER_PLATFORM
        }],
        "routes": [{
            "family": family,
            "dst": "",
            "src": "",
            "gateway": meta.gateway,
            "outLinkName": meta.interface,
            "table": "main",
            "scope": "global",
            "type": "unicast",
            "flags": "",
            "protocol": "static",
            "layer": LAYER_PLATFORM
        }],
        "hostnames": hostnames,
        "resolvers": [{ "dnsServers": meta.dns_servers, "layer": LAYER_PLATFORM }],
        "timeServers": [],
        "operators": [],
        "externalIPs": []
    });

    serde_yaml::to_string(&document).map_err(|source| BundleError::Serialize {
        what: "network metadata",
        source,
    })
}

#[cfg(test)]
#[path = "meta_tests.rs"]
mod meta_tests;
