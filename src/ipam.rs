// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Static IP allocation inside a managed network.
//!
//! Nothing is reserved by calling `get_ip`: the caller records the returned address in
//! `Ipam::ips_used` (and on the node it creates). Two concurrent calls against the same network
//! can hand out the same address, so callers must serialize allocation per network.

use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use {cidr::IpCidr, log::debug};

use crate::{
    cluster::ClusterNetwork,
    context::Context,
    error::{Error, Result, ResultExt},
};

/// Get the first free address of `network`, according to the runtime's current view of it.
pub async fn get_ip(ctx: &Context, network: &ClusterNetwork) -> Result<IpAddr> {
    let current = ctx
        .runtime()
        .get_network(&network.name)
        .await
        .with_context(|| format!("failed to get network '{}'", network.name))?;

    let Some(prefix) = current.ipam.prefix.or(network.ipam.prefix) else {
        return Err(Error::InvalidConfig(format!(
            "network '{}' has no IP prefix to allocate from",
            network.name
        )));
    };

    // Addresses handed out earlier in this operation may not be visible in the runtime yet.
    let used: Vec<IpAddr> = current
        .ipam
        .ips_used
        .iter()
        .chain(network.ipam.ips_used.iter())
        .copied()
        .collect();

    let ip = first_free(&prefix, &used).ok_or_else(|| Error::NoFreeAddress {
        network: network.name.clone(),
        prefix: prefix.to_string(),
    })?;

    debug!("Allocated IP {ip} in network '{}' ({prefix})", network.name);
    Ok(ip)
}

/// The numerically lowest address in `prefix` that is neither the network address, the
/// broadcast address, nor listed in `used`.
pub fn first_free(prefix: &IpCidr, used: &[IpAddr]) -> Option<IpAddr> {
    let network = to_int(prefix.first_address());
    let broadcast = to_int(prefix.last_address());
    if broadcast - network < 2 {
        return None;
    }

    let used: HashSet<u128> = used
        .iter()
        .filter(|ip| prefix.contains(ip))
        .map(|ip| to_int(*ip))
        .collect();

    (network + 1..broadcast)
        .find(|candidate| !used.contains(candidate))
        .map(|free| from_int(free, matches!(prefix, IpCidr::V4(_))))
}

fn to_int(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_int(value: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn skips_network_address_and_used() {
        let prefix: IpCidr = "172.28.0.0/16".parse().unwrap();
        assert_eq!(first_free(&prefix, &[]), Some(ip("172.28.0.1")));
        assert_eq!(
            first_free(&prefix, &[ip("172.28.0.1"), ip("172.28.0.2")]),
            Some(ip("172.28.0.3"))
        );
        // Used addresses outside the prefix are irrelevant.
        assert_eq!(
            first_free(&prefix, &[ip("10.0.0.1")]),
            Some(ip("172.28.0.1"))
        );
    }

    #[test]
    fn exhausted_prefix() {
        let prefix: IpCidr = "10.0.0.0/30".parse().unwrap();
        assert_eq!(first_free(&prefix, &[ip("10.0.0.1")]), Some(ip("10.0.0.2")));
        // .0 is the network address, .3 the broadcast address.
        assert_eq!(first_free(&prefix, &[ip("10.0.0.1"), ip("10.0.0.2")]), None);

        let tiny: IpCidr = "10.0.0.0/31".parse().unwrap();
        assert_eq!(first_free(&tiny, &[]), None);
    }

    #[test]
    fn ipv6() {
        let prefix: IpCidr = "fd00::/120".parse().unwrap();
        assert_eq!(first_free(&prefix, &[ip("fd00::1")]), Some(ip("fd00::2")));
    }
}
