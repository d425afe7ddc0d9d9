//! Tunnel interface lifecycle.
//!
//! A [`VirtualInterface`] wraps any async byte device that reads and writes
//! whole IP packets. [`TunProvider`] builds one from a real TUN device; tests
//! and embedders can plug in their own [`InterfaceProvider`].

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::{InterfaceConfig, MIN_TUN_MTU};
use crate::error::InterfaceError;

/// A packet-oriented device: every read yields one packet, every write
/// carries one packet.
pub trait PacketDevice: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> PacketDevice for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Creates tunnel interfaces. Called once at service start and again for
/// every reconnect attempt.
#[async_trait]
pub trait InterfaceProvider: Send + Sync {
    async fn establish(&self, config: &InterfaceConfig)
        -> Result<VirtualInterface, InterfaceError>;
}

pub struct VirtualInterface {
    device: Box<dyn PacketDevice>,
    config: InterfaceConfig,
}

impl VirtualInterface {
    pub fn new<D>(device: D, config: InterfaceConfig) -> Self
    where
        D: PacketDevice + 'static,
    {
        Self {
            device: Box::new(device),
            config,
        }
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    pub async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.read(buf).await
    }

    pub async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.device.write_all(packet).await
    }

    /// Release the device handle.
    pub async fn teardown(mut self) {
        if let Err(e) = self.device.shutdown().await {
            debug!("Error shutting down interface {}: {}", self.config.name, e);
        }
        info!("Tunnel interface {} closed", self.config.name);
    }
}

impl fmt::Debug for VirtualInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualInterface")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub fn validate(config: &InterfaceConfig) -> Result<(), InterfaceError> {
    if config.name.is_empty() {
        return Err(InterfaceError::InvalidConfig("empty interface name".into()));
    }
    if config.prefix_len > 32 {
        return Err(InterfaceError::InvalidConfig(format!(
            "prefix length {} exceeds 32",
            config.prefix_len
        )));
    }
    if config.route.prefix_len > 32 {
        return Err(InterfaceError::InvalidConfig(format!(
            "route prefix length {} exceeds 32",
            config.route.prefix_len
        )));
    }
    if config.mtu < MIN_TUN_MTU {
        return Err(InterfaceError::InvalidConfig(format!(
            "MTU {} below minimum {}",
            config.mtu, MIN_TUN_MTU
        )));
    }
    Ok(())
}

/// Brings up an OS TUN device in non-blocking mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct TunProvider;

#[async_trait]
impl InterfaceProvider for TunProvider {
    async fn establish(
        &self,
        config: &InterfaceConfig,
    ) -> Result<VirtualInterface, InterfaceError> {
        validate(config)?;
        let netmask = config
            .netmask()
            .ok_or_else(|| InterfaceError::InvalidConfig("bad prefix length".into()))?;

        let device = {
            let mut tun_config = tun::Configuration::default();
            tun_config
                .tun_name(&config.name)
                .address(config.address)
                .netmask(netmask)
                .mtu(config.mtu)
                .up();

            tun::create_as_async(&tun_config).map_err(|e| InterfaceError::Create {
                name: config.name.clone(),
                reason: e.to_string(),
            })?
        };

        if config.install_route {
            install_route(config).await?;
        }

        info!(
            "Tunnel interface {} up: {}/{} mtu={} route={} dns={}",
            config.name, config.address, config.prefix_len, config.mtu, config.route, config.dns
        );

        Ok(VirtualInterface::new(device, config.clone()))
    }
}

#[cfg(target_os = "linux")]
async fn install_route(config: &InterfaceConfig) -> Result<(), InterfaceError> {
    let route = config.route.to_string();
    let route_error = |reason: String| InterfaceError::Route {
        name: config.name.clone(),
        route: route.clone(),
        reason,
    };

    let status = tokio::process::Command::new("ip")
        .args(["route", "replace", &route, "dev", &config.name])
        .status()
        .await
        .map_err(|e| route_error(e.to_string()))?;

    if !status.success() {
        return Err(route_error(format!("ip exited with {}", status)));
    }

    debug!("Installed route {} via {}", route, config.name);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn install_route(config: &InterfaceConfig) -> Result<(), InterfaceError> {
    Err(InterfaceError::Route {
        name: config.name.clone(),
        route: config.route.to_string(),
        reason: "route installation is only supported on Linux".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_defaults() {
        assert!(validate(&InterfaceConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = InterfaceConfig::default();
        config.prefix_len = 33;
        assert!(matches!(validate(&config), Err(InterfaceError::InvalidConfig(_))));

        let mut config = InterfaceConfig::default();
        config.mtu = 100;
        assert!(matches!(validate(&config), Err(InterfaceError::InvalidConfig(_))));

        let mut config = InterfaceConfig::default();
        config.name.clear();
        assert!(matches!(validate(&config), Err(InterfaceError::InvalidConfig(_))));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_route_failure_is_reported() {
        let config = InterfaceConfig {
            name: "tp-no-such-dev".into(),
            route: crate::config::Route {
                network: std::net::Ipv4Addr::new(198, 51, 100, 0),
                prefix_len: 24,
            },
            ..InterfaceConfig::default()
        };

        let err = install_route(&config).await.unwrap_err();
        assert!(matches!(err, InterfaceError::Route { .. }));
    }

    #[tokio::test]
    async fn test_virtual_interface_moves_whole_packets() {
        let (device, mut peer) = tokio::io::duplex(4096);
        let mut iface = VirtualInterface::new(device, InterfaceConfig::default());

        peer.write_all(&[0x45, 0, 0, 20]).await.unwrap();
        let mut buf = [0u8; 64];
        let n = iface.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x45, 0, 0, 20]);

        iface.write_packet(&[1, 2, 3]).await.unwrap();
        let mut out = [0u8; 3];
        peer.read_exact(&mut out).await.unwrap();
        assert_eq!(out, [1, 2, 3]);

        iface.teardown().await;
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
