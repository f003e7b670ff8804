//! Host address resolution for worker launches.

use std::net::{IpAddr, UdpSocket};

use relaygrid_core::config::PoolConfig;
use tracing::info;

use crate::error::{PoolError, PoolResult};

/// The addresses handed to every worker on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub private_ip: String,
    pub public_ip: String,
}

/// Resolve the host's addresses from `config`.
///
/// A missing private address is detected from the default route; a missing
/// public address falls back to the private one.
pub fn resolve(config: &PoolConfig) -> PoolResult<HostAddress> {
    let private_ip = match &config.private_ip {
        Some(ip) => parse_ip(ip)?,
        None => detect_private_ip()?,
    };
    let public_ip = match &config.public_ip {
        Some(ip) => parse_ip(ip)?,
        None => private_ip,
    };

    let address = HostAddress {
        private_ip: private_ip.to_string(),
        public_ip: public_ip.to_string(),
    };
    info!(private_ip = %address.private_ip, public_ip = %address.public_ip, "host address resolved");
    Ok(address)
}

fn parse_ip(ip: &str) -> PoolResult<IpAddr> {
    ip.parse()
        .map_err(|e| PoolError::Address(format!("invalid address {ip:?}: {e}")))
}

/// The local address the kernel would use to reach the outside world.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
fn detect_private_ip() -> PoolResult<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| PoolError::Address(format!("failed to open route lookup socket: {e}")))?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|e| PoolError::Address(format!("no default route: {e}")))?;
    let addr = socket
        .local_addr()
        .map_err(|e| PoolError::Address(e.to_string()))?;
    Ok(addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_addresses_win() {
        let config = PoolConfig {
            private_ip: Some("10.1.2.3".to_string()),
            public_ip: Some("198.51.100.9".to_string()),
            ..PoolConfig::default()
        };
        let address = resolve(&config).unwrap();
        assert_eq!(address.private_ip, "10.1.2.3");
        assert_eq!(address.public_ip, "198.51.100.9");
    }

    #[test]
    fn public_defaults_to_private() {
        let config = PoolConfig {
            private_ip: Some("10.1.2.3".to_string()),
            ..PoolConfig::default()
        };
        assert_eq!(resolve(&config).unwrap().public_ip, "10.1.2.3");
    }

    #[test]
    fn invalid_address_is_rejected() {
        let config = PoolConfig {
            private_ip: Some("not-an-ip".to_string()),
            ..PoolConfig::default()
        };
        assert!(matches!(resolve(&config), Err(PoolError::Address(_))));
    }
}
