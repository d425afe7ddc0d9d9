//! Connection acceptor and per-connection handler.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ServiceError};
use crate::event::ServiceEvent;
use crate::http::read_request;
use crate::registry::{ConnectionPhase, ConnectionRegistry, Registration};
use crate::relay::{relay_http, relay_tunnel};
use crate::stats::{SessionBytes, TrafficStats};

const LISTEN_BACKLOG: i32 = 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Shared by every connection handler.
#[derive(Clone)]
struct ProxyContext {
    config: ProxyConfig,
    stats: Arc<TrafficStats>,
    events: broadcast::Sender<ServiceEvent>,
}

/// A running forward proxy: a bound listener plus its accept loop.
#[derive(Debug)]
pub struct ProxyServer {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl ProxyServer {
    /// Bind the listening socket and spawn the accept loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        config: ProxyConfig,
        stats: Arc<TrafficStats>,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Result<Self, ServiceError> {
        let addr = config.listen;
        let listener = bind_listener(addr).map_err(|source| ServiceError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServiceError::Bind { addr, source })?;

        info!("🚀 Proxy listening on http://{}", local_addr);

        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();
        let ctx = ProxyContext {
            config,
            stats,
            events,
        };

        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            registry.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            registry,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Close the listening socket, then force-close every registered
    /// connection and wait briefly for their handlers to unwind.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        let closed = self.registry.close_all();

        let drain_start = Instant::now();
        while !self.registry.is_empty() && drain_start.elapsed() < DRAIN_TIMEOUT {
            tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
        }

        let remaining = self.registry.len();
        if remaining > 0 {
            warn!("{} connections still unwinding after shutdown", remaining);
        }

        info!(
            "Proxy on {} stopped ({} connections closed)",
            self.local_addr, closed
        );
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ProxyContext,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (client_stream, client_addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Error accepting client connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        debug!("New client connection from {}", client_addr);
        ctx.stats.record_accepted();

        let registration = registry.register(client_addr);
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let closed = registration.token().clone();

            tokio::select! {
                _ = closed.cancelled() => {
                    debug!("Connection {} force-closed", client_addr);
                }
                result = handle_connection(client_stream, &registration, &ctx) => {
                    if let Err(e) = result {
                        debug!("Connection error from {}: {}", client_addr, e);
                        ctx.stats.record_failed();
                    }
                }
            }

            ctx.stats.record_closed();
        });
    }

    // dropping the listener here closes the socket
    info!("Stopped accepting connections");
}

async fn handle_connection(
    client: TcpStream,
    registration: &Registration,
    ctx: &ProxyContext,
) -> Result<(), ProxyError> {
    let _ = client.set_nodelay(true);
    let peer = registration.peer();
    let mut client = BufReader::new(client);

    let request = match read_request(&mut client, ctx.config.idle_timeout).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("Empty request from {}", peer);
            return Ok(());
        }
        Err(e) => {
            send_error_response(&mut client, &e).await;
            return Err(e);
        }
    };

    debug!("Request from {}: {} {}", peer, request.method, request.target);
    registration.set_phase(ConnectionPhase::Relaying);

    let mut bytes = SessionBytes::default();
    let result = if request.is_connect() {
        relay_tunnel(client, &request, &ctx.config, &mut bytes).await
    } else {
        let result = relay_http(&mut client, &request, &ctx.config, &mut bytes).await;
        if let Err(e) = &result {
            send_error_response(&mut client, e).await;
        }
        result
    };

    let reached_upstream = match &result {
        Ok(()) => true,
        Err(e) => e.reached_upstream(),
    };
    if reached_upstream {
        let totals = ctx.stats.record_session(bytes);
        let _ = ctx.events.send(ServiceEvent::Traffic(totals));
        debug!(
            "Session {} done: in={} out={} (total in={} out={})",
            peer, bytes.bytes_in, bytes.bytes_out, totals.bytes_in, totals.bytes_out
        );
    }

    result
}

/// Plain-HTTP path only: CONNECT failures never get a response.
async fn send_error_response(client: &mut BufReader<TcpStream>, error: &ProxyError) {
    let Some(response) = error.response(false) else {
        return;
    };

    if let Err(e) = client.write_all(response).await {
        debug!("Error sending error response: {}", e);
        return;
    }
    let _ = client.flush().await;
    let _ = client.get_mut().shutdown().await;
}
