//! Lifecycle controller.
//!
//! Starts and stops the tunnel interface, the proxy listener and the packet
//! loop as one unit, and re-establishes the interface when it fails while the
//! service is running.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{InterfaceConfig, ServiceConfig};
use crate::dispatcher::{self, DispatchExit, DispatchSnapshot, DispatchStats};
use crate::error::ServiceError;
use crate::event::ServiceEvent;
use crate::interface::{InterfaceProvider, TunProvider, VirtualInterface};
use crate::listener::ProxyServer;
use crate::registry::{ConnectionInfo, ConnectionRegistry};
use crate::stats::{TrafficSnapshot, TrafficStats};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Point-in-time view for the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub traffic: TrafficSnapshot,
    pub packets: DispatchSnapshot,
    pub proxy_addr: Option<SocketAddr>,
    pub active_connections: usize,
}

struct Running {
    proxy: ProxyServer,
    supervisor: JoinHandle<Option<VirtualInterface>>,
    shutdown: CancellationToken,
}

/// What the host can see while the service runs.
struct Live {
    proxy_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
}

struct Inner {
    config: ServiceConfig,
    provider: Arc<dyn InterfaceProvider>,
    stats: Arc<TrafficStats>,
    packets: Arc<DispatchStats>,
    events: broadcast::Sender<ServiceEvent>,
    state: RwLock<ServiceState>,
    // serializes start/stop
    running: Mutex<Option<Running>>,
    live: RwLock<Option<Live>>,
}

/// Handle to the proxy service. Cheap to clone; all clones control the same
/// service.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    /// A service backed by a real TUN device.
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_provider(config, Arc::new(TunProvider))
    }

    pub fn with_provider(config: ServiceConfig, provider: Arc<dyn InterfaceProvider>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                provider,
                stats: Arc::new(TrafficStats::new()),
                packets: Arc::new(DispatchStats::new()),
                events,
                state: RwLock::new(ServiceState::Stopped),
                running: Mutex::new(None),
                live: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Bring the service up. Does nothing unless the service is stopped.
    ///
    /// On failure every partially started component is released again and
    /// the service stays stopped. The work runs on its own task, so dropping
    /// the returned future does not leave the service half started.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.start().await }).await?
    }

    /// Tear the service down. Does nothing unless the service is running.
    ///
    /// Closes the listener, force-closes every client connection, stops the
    /// packet loop and finally releases the interface. Like [`start`], the
    /// teardown runs to completion even if the caller stops waiting.
    ///
    /// [`start`]: Service::start
    pub async fn stop(&self) {
        let inner = self.inner.clone();
        if let Err(e) = tokio::spawn(async move { inner.stop().await }).await {
            warn!("Service teardown task failed: {}", e);
        }
    }

    /// Stop if running, start otherwise.
    pub async fn toggle(&self) -> Result<(), ServiceError> {
        if self.is_running() {
            self.stop().await;
            Ok(())
        } else {
            self.start().await
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn status(&self) -> ServiceStatus {
        let live = self.inner.live.read();
        ServiceStatus {
            state: self.state(),
            traffic: self.inner.stats.snapshot(),
            packets: self.inner.packets.snapshot(),
            proxy_addr: live.as_ref().map(|l| l.proxy_addr),
            active_connections: live.as_ref().map_or(0, |l| l.registry.len()),
        }
    }

    /// Address the proxy listener is bound to while running.
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.inner.live.read().as_ref().map(|l| l.proxy_addr)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .live
            .read()
            .as_ref()
            .map(|l| l.registry.connections())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.inner.stats
    }

    pub fn packet_stats(&self) -> DispatchSnapshot {
        self.inner.packets.snapshot()
    }

    /// Zero the byte counters.
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

}

impl Inner {
    fn set_state(&self, state: ServiceState) {
        *self.state.write() = state;
    }

    async fn start(&self) -> Result<(), ServiceError> {
        let mut running = self.running.lock().await;

        {
            let mut state = self.state.write();
            if *state != ServiceState::Stopped {
                return Ok(());
            }
            *state = ServiceState::Starting;
        }

        let iface = match self.provider.establish(&self.config.interface).await {
            Ok(iface) => iface,
            Err(e) => {
                warn!("Failed to establish tunnel interface: {}", e);
                self.set_state(ServiceState::Stopped);
                return Err(e.into());
            }
        };

        let proxy = match ProxyServer::bind(
            self.config.proxy.clone(),
            self.stats.clone(),
            self.events.clone(),
        ) {
            Ok(proxy) => proxy,
            Err(e) => {
                iface.teardown().await;
                self.set_state(ServiceState::Stopped);
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            iface,
            Reconnector {
                provider: self.provider.clone(),
                config: self.config.interface.clone(),
                delay: self.config.reconnect.delay,
                events: self.events.clone(),
            },
            self.packets.clone(),
            shutdown.clone(),
        ));

        let proxy_addr = proxy.local_addr();
        *self.live.write() = Some(Live {
            proxy_addr,
            registry: proxy.registry().clone(),
        });
        *running = Some(Running {
            proxy,
            supervisor,
            shutdown,
        });
        self.set_state(ServiceState::Running);

        info!("✅ Service running (proxy {})", proxy_addr);
        let _ = self.events.send(ServiceEvent::Started { proxy_addr });
        Ok(())
    }

    async fn stop(&self) {
        let mut running = self.running.lock().await;

        {
            let mut state = self.state.write();
            if *state != ServiceState::Running {
                return;
            }
            *state = ServiceState::Stopping;
        }

        if let Some(Running {
            proxy,
            supervisor,
            shutdown,
        }) = running.take()
        {
            proxy.shutdown().await;

            shutdown.cancel();
            let iface = match supervisor.await {
                Ok(iface) => iface,
                Err(e) => {
                    warn!("Packet loop ended abnormally: {}", e);
                    None
                }
            };

            if let Some(iface) = iface {
                iface.teardown().await;
            }
        }

        *self.live.write() = None;
        self.set_state(ServiceState::Stopped);

        info!("🛑 Service stopped");
        let _ = self.events.send(ServiceEvent::Stopped);
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("state", &self.state())
            .field("proxy_addr", &self.proxy_addr())
            .finish_non_exhaustive()
    }
}

/// Everything needed to bring a lost interface back.
struct Reconnector {
    provider: Arc<dyn InterfaceProvider>,
    config: InterfaceConfig,
    delay: Duration,
    events: broadcast::Sender<ServiceEvent>,
}

impl Reconnector {
    /// Retry every `delay` until an interface comes up or `shutdown` fires.
    async fn reconnect(&self, shutdown: &CancellationToken) -> Option<VirtualInterface> {
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Interface reconnect abandoned after {} attempts", attempt);
                    return None;
                }
                _ = tokio::time::sleep(self.delay) => {}
            }

            attempt += 1;
            match self.provider.establish(&self.config).await {
                Ok(iface) => {
                    info!("🔄 Tunnel interface {} restored (attempt {})", self.config.name, attempt);
                    return Some(iface);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }
}

/// Runs the packet loop and replaces the interface whenever it goes away.
/// Hands the live interface back on shutdown so the caller can release it.
async fn supervise(
    mut iface: VirtualInterface,
    reconnector: Reconnector,
    packets: Arc<DispatchStats>,
    shutdown: CancellationToken,
) -> Option<VirtualInterface> {
    loop {
        match dispatcher::run(&mut iface, &shutdown, &packets).await {
            DispatchExit::Cancelled => return Some(iface),
            DispatchExit::Closed => {
                warn!("Tunnel interface {} closed unexpectedly", iface.config().name)
            }
            DispatchExit::Failed(e) => {
                warn!("Tunnel interface {} failed: {}", iface.config().name, e)
            }
        }

        iface.teardown().await;
        let _ = reconnector.events.send(ServiceEvent::InterfaceLost);

        iface = reconnector.reconnect(&shutdown).await?;
        let _ = reconnector.events.send(ServiceEvent::InterfaceRestored);
    }
}
