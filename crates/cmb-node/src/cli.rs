//! Endpoint and rate resolution for the CLI.
//!
//! `-a`/`-p` (and `-r` for the client) are repeatable; a single value
//! broadcasts across the other list, otherwise the counts must match and
//! values pair up positionally.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{bail, Result};

use cmb_proto::{DEFAULT_PORT, DEFAULT_SENDING_RATE};

/// Lowest port the CLI accepts; the well-known range is reserved.
pub const MIN_PORT: u16 = 1024;

/// Pairs up repeated `-a` and `-p` flags into socket addresses.
pub fn resolve_endpoints(addrs: &[IpAddr], ports: &[u16]) -> Result<Vec<SocketAddr>> {
    let mut addrs = addrs.to_vec();
    let mut ports = ports.to_vec();

    if addrs.is_empty() {
        addrs.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    if ports.is_empty() {
        ports.push(DEFAULT_PORT);
    }
    if addrs.len() == 1 {
        addrs = vec![addrs[0]; ports.len()];
    }
    if ports.len() == 1 {
        ports = vec![ports[0]; addrs.len()];
    }
    if addrs.len() != ports.len() {
        bail!(
            "expected the number of addresses ({}) to match the number of ports ({}), \
             or either to be a single value",
            addrs.len(),
            ports.len()
        );
    }
    for &port in &ports {
        if port < MIN_PORT {
            bail!("port {port} is below the allowed minimum {MIN_PORT}");
        }
    }

    Ok(addrs.into_iter().zip(ports).map(|(ip, port)| SocketAddr::new(ip, port)).collect())
}

/// Pairs repeated `-r` flags with the resolved endpoints.
pub fn resolve_rates(rates: &[u32], endpoints: usize) -> Result<Vec<u32>> {
    let mut rates = rates.to_vec();
    if rates.is_empty() {
        rates.push(DEFAULT_SENDING_RATE);
    }
    if rates.len() == 1 {
        rates = vec![rates[0]; endpoints];
    }
    if rates.len() != endpoints {
        bail!(
            "expected the number of rates ({}) to match the number of endpoints ({}), \
             or a single rate for all",
            rates.len(),
            endpoints
        );
    }
    for &rate in &rates {
        if rate == 0 {
            bail!("sending rate must be positive");
        }
    }
    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_defaults_when_nothing_given() {
        let endpoints = resolve_endpoints(&[], &[]).unwrap();
        assert_eq!(endpoints, vec![SocketAddr::new(ip("127.0.0.1"), DEFAULT_PORT)]);
    }

    #[test]
    fn test_single_address_broadcasts_over_ports() {
        let endpoints = resolve_endpoints(&[ip("10.0.0.1")], &[2000, 2001]).unwrap();
        assert_eq!(
            endpoints,
            vec![
                SocketAddr::new(ip("10.0.0.1"), 2000),
                SocketAddr::new(ip("10.0.0.1"), 2001),
            ]
        );
    }

    #[test]
    fn test_single_port_broadcasts_over_addresses() {
        let endpoints = resolve_endpoints(&[ip("127.0.0.1"), ip("::1")], &[1337]).unwrap();
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints.iter().all(|e| e.port() == 1337));
    }

    #[test]
    fn test_mismatched_counts_rejected() {
        assert!(resolve_endpoints(&[ip("10.0.0.1"), ip("10.0.0.2")], &[1337, 1338, 1339]).is_err());
    }

    #[test]
    fn test_low_port_rejected() {
        assert!(resolve_endpoints(&[ip("127.0.0.1")], &[80]).is_err());
    }

    #[test]
    fn test_rates_broadcast_and_match() {
        assert_eq!(resolve_rates(&[], 2).unwrap(), vec![DEFAULT_SENDING_RATE; 2]);
        assert_eq!(resolve_rates(&[50_000], 2).unwrap(), vec![50_000, 50_000]);
        assert_eq!(resolve_rates(&[50_000, 25_000], 2).unwrap(), vec![50_000, 25_000]);
        assert!(resolve_rates(&[1, 2, 3], 2).is_err());
        assert!(resolve_rates(&[0], 1).is_err());
    }
}
