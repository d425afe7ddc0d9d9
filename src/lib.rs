//! Local HTTP forward proxy with a tunnel-interface packet loop.
//!
//! The [`Service`] owns three components that start and stop together: a
//! virtual network interface, an HTTP/1.x forward proxy (including `CONNECT`
//! tunnelling) listening on a local port, and a packet loop that reads raw IP
//! packets from the interface and passes them through.

#![warn(clippy::all)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod http;
pub mod interface;
pub mod listener;
pub mod registry;
pub mod relay;
pub mod service;
pub mod stats;

pub use config::{InterfaceConfig, ProxyConfig, ReconnectConfig, Route, ServiceConfig};
pub use dispatcher::{DispatchSnapshot, DispatchStats};
pub use error::{InterfaceError, ProxyError, ServiceError};
pub use event::ServiceEvent;
pub use interface::{InterfaceProvider, PacketDevice, TunProvider, VirtualInterface};
pub use listener::ProxyServer;
pub use registry::{ConnectionInfo, ConnectionPhase};
pub use service::{Service, ServiceState, ServiceStatus};
pub use stats::{format_bytes, TrafficSnapshot, TrafficStats};
