//! Service configuration.
//!
//! Every knob has a default matching what the host application expects out of
//! the box: proxy on port 8080, tunnel interface at `10.0.0.2/24` with a
//! catch-all route, `8.8.8.8` as DNS and an MTU of 1500.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PROXY_PORT: u16 = 8080;
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub const DEFAULT_TUN_NAME: &str = "tunproxy0";
pub const DEFAULT_TUN_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const DEFAULT_TUN_PREFIX: u8 = 24;
pub const DEFAULT_TUN_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
pub const DEFAULT_TUN_MTU: u16 = 1500;

/// Smallest MTU an IPv4 link is required to carry.
pub const MIN_TUN_MTU: u16 = 576;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Bound on establishing an upstream connection.
    pub connect_timeout: Duration,
    /// Idle-read timeout applied to every client and upstream socket.
    pub idle_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PROXY_PORT)),
            connect_timeout: DEFAULT_IO_TIMEOUT,
            idle_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

/// A route pushed through the tunnel interface, `0.0.0.0/0` by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

impl Route {
    pub const DEFAULT: Route = Route {
        network: Ipv4Addr::UNSPECIFIED,
        prefix_len: 0,
    };
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub route: Route,
    pub dns: Ipv4Addr,
    pub mtu: u16,
    /// Install `route` into the host routing table after bringing the device
    /// up. Off by default: a catch-all route on a desktop host redirects
    /// all of its traffic into the device.
    pub install_route: bool,
}

impl InterfaceConfig {
    /// Dotted netmask for `prefix_len`, `None` if the prefix exceeds 32.
    pub fn netmask(&self) -> Option<Ipv4Addr> {
        prefix_to_netmask(self.prefix_len)
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_TUN_NAME.to_string(),
            address: DEFAULT_TUN_ADDRESS,
            prefix_len: DEFAULT_TUN_PREFIX,
            route: Route::DEFAULT,
            dns: DEFAULT_TUN_DNS,
            mtu: DEFAULT_TUN_MTU,
            install_route: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    pub proxy: ProxyConfig,
    pub interface: InterfaceConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Fixed wait between interface re-establish attempts.
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

pub fn prefix_to_netmask(prefix_len: u8) -> Option<Ipv4Addr> {
    if prefix_len > 32 {
        return None;
    }
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix_len))
        .unwrap_or(0);
    Some(Ipv4Addr::from(bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_host_expectations() {
        let config = ServiceConfig::default();
        assert_eq!(config.proxy.listen.port(), 8080);
        assert_eq!(config.proxy.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.interface.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.interface.prefix_len, 24);
        assert_eq!(config.interface.route.to_string(), "0.0.0.0/0");
        assert_eq!(config.interface.dns, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(config.interface.mtu, 1500);
    }

    #[test]
    fn test_prefix_to_netmask() {
        assert_eq!(prefix_to_netmask(24), Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(prefix_to_netmask(0), Some(Ipv4Addr::UNSPECIFIED));
        assert_eq!(prefix_to_netmask(32), Some(Ipv4Addr::BROADCAST));
        assert_eq!(prefix_to_netmask(20), Some(Ipv4Addr::new(255, 255, 240, 0)));
        assert_eq!(prefix_to_netmask(33), None);
    }
}
