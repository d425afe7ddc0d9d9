//! Upstream relays: plain-HTTP forwarding and CONNECT tunnels.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http::{Authority, HttpTarget, Request, DEFAULT_CONNECT_PORT, RESPONSE_200_CONNECT};
use crate::stats::SessionBytes;

pub const RELAY_BUFFER_SIZE: usize = 8 * 1024;

// ============================================================================
// PLAIN HTTP
// ============================================================================

/// Forward a non-CONNECT request and stream the upstream response back.
///
/// The request body is forwarded only when `Content-Length` is declared;
/// chunked request bodies are not relayed. Bytes are accumulated into
/// `bytes` as they move so a failed relay still reports what it transferred.
pub async fn relay_http(
    client: &mut BufReader<TcpStream>,
    request: &Request,
    config: &ProxyConfig,
    bytes: &mut SessionBytes,
) -> Result<(), ProxyError> {
    let target = HttpTarget::parse(&request.target)?;

    debug!(
        "Proxying {} request to {}{}",
        request.method, target.authority, target.path
    );

    let mut upstream = connect_upstream(&target.authority, config.connect_timeout).await?;

    let head = request.upstream_head(&target.path);
    upstream
        .write_all(&head)
        .await
        .map_err(ProxyError::UpstreamIo)?;
    bytes.bytes_out += head.len() as u64;

    let body_len = request.content_length();
    if body_len > 0 {
        pump(
            client,
            &mut upstream,
            Some(body_len),
            config.idle_timeout,
            &mut bytes.bytes_out,
        )
        .await
        .map_err(ProxyError::UpstreamIo)?;
    } else {
        upstream.flush().await.map_err(ProxyError::UpstreamIo)?;
    }

    match pump(
        &mut upstream,
        client,
        None,
        config.idle_timeout,
        &mut bytes.bytes_in,
    )
    .await
    {
        Ok(()) => Ok(()),
        // nothing reached the client yet, so a 502 is still possible
        Err(e) if bytes.bytes_in == 0 => Err(ProxyError::UpstreamIo(e)),
        // upstream kept the connection open after its response
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            debug!("Upstream {} idle after response, closing", target.authority);
            Ok(())
        }
        Err(e) => Err(ProxyError::Relay(e)),
    }
}

// ============================================================================
// CONNECT TUNNEL
// ============================================================================

/// Open a CONNECT tunnel and pump bytes both ways until both directions end.
///
/// The success line is written only once the upstream connection is up; on
/// failure the caller just closes the client socket.
pub async fn relay_tunnel(
    client: BufReader<TcpStream>,
    request: &Request,
    config: &ProxyConfig,
    bytes: &mut SessionBytes,
) -> Result<(), ProxyError> {
    let authority = Authority::parse(&request.target, DEFAULT_CONNECT_PORT)?;

    debug!("Connecting tunnel to {}", authority);

    let upstream = connect_upstream(&authority, config.connect_timeout).await?;

    // anything the client pipelined behind the CONNECT head
    let pending = client.buffer().to_vec();
    let mut client = client.into_inner();

    client
        .write_all(RESPONSE_200_CONNECT)
        .await
        .map_err(ProxyError::Relay)?;
    client.flush().await.map_err(ProxyError::Relay)?;

    let (client_rd, client_wr) = client.into_split();
    let (upstream_rd, upstream_wr) = upstream.into_split();
    let abort = CancellationToken::new();

    let (sent, received) = tokio::join!(
        copy_direction(
            client_rd,
            upstream_wr,
            &pending,
            config.idle_timeout,
            &abort,
            "client -> upstream",
        ),
        copy_direction(
            upstream_rd,
            client_wr,
            &[],
            config.idle_timeout,
            &abort,
            "upstream -> client",
        ),
    );

    bytes.bytes_out += sent;
    bytes.bytes_in += received;

    debug!(
        "Tunnel to {} closed (out={} in={})",
        authority, sent, received
    );

    Ok(())
}

/// One half of a tunnel. End of stream half-closes the writer so the peer
/// sees it; an idle timeout ends only this half; any other I/O error tears
/// down both halves.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    preface: &[u8],
    idle: Duration,
    abort: &CancellationToken,
    label: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut moved = 0u64;

    let copy = async {
        if !preface.is_empty() {
            writer.write_all(preface).await?;
            moved += preface.len() as u64;
        }
        pump(&mut reader, &mut writer, None, idle, &mut moved).await?;
        writer.shutdown().await
    };

    let result = tokio::select! {
        result = copy => result,
        _ = abort.cancelled() => Ok(()),
    };

    match result {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
            debug!("Tunnel {} idle, ending", label);
        }
        Err(e) => {
            debug!("Tunnel {} ended: {}", label, e);
            abort.cancel();
        }
    }

    moved
}

// ============================================================================
// HELPERS
// ============================================================================

async fn connect_upstream(
    authority: &Authority,
    connect_timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    let connect_future = TcpStream::connect((authority.host.as_str(), authority.port));

    let stream = match timeout(connect_timeout, connect_future).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!("Upstream connect failed {}: {}", authority, e);
            return Err(ProxyError::upstream_connect(authority.to_string(), e));
        }
        Err(_) => {
            debug!("Upstream timeout {}", authority);
            return Err(ProxyError::upstream_connect(
                authority.to_string(),
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            ));
        }
    };

    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Copy from `reader` to `writer` in fixed-size chunks until end of stream,
/// or until exactly `limit` bytes when given. Each read is bounded by
/// `idle`. `counter` is bumped as bytes are written.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: Option<u64>,
    idle: Duration,
    counter: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = [0u8; RELAY_BUFFER_SIZE];
    let mut remaining = limit;

    loop {
        let want = match remaining {
            Some(0) => break,
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX).min(buf.len()),
            None => buf.len(),
        };

        let n = match timeout(idle, reader.read(&mut buf[..want])).await {
            Ok(read) => read?,
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "idle read timeout"));
            }
        };

        if n == 0 {
            if remaining.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended before declared length",
                ));
            }
            break;
        }

        writer.write_all(&buf[..n]).await?;
        *counter += n as u64;

        if let Some(rest) = remaining.as_mut() {
            *rest -= n as u64;
        }
    }

    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{read_request, RESPONSE_200_CONNECT};
    use tokio::net::TcpListener;

    const IDLE: Duration = Duration::from_secs(5);

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            connect_timeout: IDLE,
            idle_timeout: IDLE,
        }
    }

    /// Returns (proxy-side client stream wrapped in a reader, the test's end).
    async fn client_pair() -> (BufReader<TcpStream>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (outer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (BufReader::new(accepted.unwrap().0), outer.unwrap())
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_pump_respects_limit() {
        let mut reader: &[u8] = b"0123456789";
        let mut out = Vec::new();
        let mut counter = 0;
        pump(&mut reader, &mut out, Some(4), IDLE, &mut counter)
            .await
            .unwrap();
        assert_eq!(out, b"0123");
        assert_eq!(counter, 4);
        assert_eq!(reader, b"456789");
    }

    #[tokio::test]
    async fn test_pump_short_body_is_error() {
        let mut reader: &[u8] = b"abc";
        let mut out = Vec::new();
        let mut counter = 0;
        let err = pump(&mut reader, &mut out, Some(10), IDLE, &mut counter)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(counter, 3);
    }

    #[tokio::test]
    async fn test_pump_idle_timeout() {
        let (mut idle_side, _keep) = tokio::io::duplex(64);
        let mut out = Vec::new();
        let mut counter = 0;
        let err = pump(
            &mut idle_side,
            &mut out,
            None,
            Duration::from_millis(50),
            &mut counter,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_relay_http_forwards_head_and_body() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut reader = BufReader::new(&mut socket);
            let request = read_request(&mut reader, IDLE).await.unwrap().unwrap();
            let mut body = vec![0u8; request.content_length() as usize];
            reader.read_exact(&mut body).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            (request, body)
        });

        let (mut proxy_side, mut outer) = client_pair().await;
        let raw = format!(
            "POST http://{}/submit HTTP/1.1\r\nHost: x\r\nProxy-Connection: keep-alive\r\nContent-Length: 5\r\n\r\nhello",
            upstream_addr
        );
        outer.write_all(raw.as_bytes()).await.unwrap();

        let request = read_request(&mut proxy_side, IDLE).await.unwrap().unwrap();
        let mut bytes = SessionBytes::default();
        relay_http(&mut proxy_side, &request, &test_config(), &mut bytes)
            .await
            .unwrap();
        drop(proxy_side);

        let (seen, body) = server.await.unwrap();
        assert_eq!(seen.target, "/submit");
        assert_eq!(seen.header("proxy-connection"), None);
        assert_eq!(seen.header("host"), Some("x"));
        assert_eq!(body, b"hello");

        let mut response = Vec::new();
        outer.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        assert_eq!(bytes.bytes_in, response.len() as u64);
        assert!(bytes.bytes_out >= 5);
    }

    #[tokio::test]
    async fn test_relay_http_idle_upstream_after_response_is_success() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut reader = BufReader::new(&mut socket);
            read_request(&mut reader, IDLE).await.unwrap().unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
                .await
                .unwrap();
            // hold the connection open without sending more
            let _ = done_rx.await;
        });

        let (mut proxy_side, mut outer) = client_pair().await;
        outer
            .write_all(format!("GET http://{}/ HTTP/1.1\r\n\r\n", upstream_addr).as_bytes())
            .await
            .unwrap();

        let request = read_request(&mut proxy_side, IDLE).await.unwrap().unwrap();
        let mut config = test_config();
        config.idle_timeout = Duration::from_millis(200);
        let mut bytes = SessionBytes::default();
        relay_http(&mut proxy_side, &request, &config, &mut bytes)
            .await
            .unwrap();
        drop(proxy_side);
        let _ = done_tx.send(());

        let mut response = Vec::new();
        outer.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
        assert_eq!(bytes.bytes_in, response.len() as u64);
    }

    #[tokio::test]
    async fn test_relay_http_silent_upstream_is_upstream_error() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut reader = BufReader::new(&mut socket);
            read_request(&mut reader, IDLE).await.unwrap().unwrap();
            let _ = done_rx.await;
        });

        let (mut proxy_side, mut outer) = client_pair().await;
        outer
            .write_all(format!("GET http://{}/ HTTP/1.1\r\n\r\n", upstream_addr).as_bytes())
            .await
            .unwrap();

        let request = read_request(&mut proxy_side, IDLE).await.unwrap().unwrap();
        let mut config = test_config();
        config.idle_timeout = Duration::from_millis(200);
        let mut bytes = SessionBytes::default();
        let err = relay_http(&mut proxy_side, &request, &config, &mut bytes)
            .await
            .unwrap_err();
        let _ = done_tx.send(());

        assert!(matches!(err, ProxyError::UpstreamIo(_)));
        assert!(err.response(false).is_some());
    }

    #[tokio::test]
    async fn test_relay_http_connect_failure() {
        let port = closed_port().await;
        let (mut proxy_side, mut outer) = client_pair().await;
        outer
            .write_all(format!("GET http://127.0.0.1:{}/ HTTP/1.1\r\n\r\n", port).as_bytes())
            .await
            .unwrap();

        let request = read_request(&mut proxy_side, IDLE).await.unwrap().unwrap();
        let mut bytes = SessionBytes::default();
        let err = relay_http(&mut proxy_side, &request, &test_config(), &mut bytes)
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::UpstreamConnect { .. }));
        assert!(err.response(false).is_some());
        assert_eq!(bytes, SessionBytes::default());
    }

    #[tokio::test]
    async fn test_relay_tunnel_echo() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let (mut rd, mut wr) = socket.split();
            tokio::io::copy(&mut rd, &mut wr).await.unwrap();
        });

        let (mut proxy_side, mut outer) = client_pair().await;
        outer
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\nearly", upstream_addr).as_bytes())
            .await
            .unwrap();

        let request = read_request(&mut proxy_side, IDLE).await.unwrap().unwrap();
        let relay = tokio::spawn(async move {
            let mut bytes = SessionBytes::default();
            relay_tunnel(proxy_side, &request, &test_config(), &mut bytes)
                .await
                .map(|_| bytes)
        });

        let mut established = vec![0u8; RESPONSE_200_CONNECT.len()];
        outer.read_exact(&mut established).await.unwrap();
        assert_eq!(established, RESPONSE_200_CONNECT);

        let mut echoed = [0u8; 5];
        outer.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"early");

        outer.write_all(b"again").await.unwrap();
        outer.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"again");

        outer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        outer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let bytes = relay.await.unwrap().unwrap();
        assert_eq!(bytes.bytes_out, 10);
        assert_eq!(bytes.bytes_in, 10);
    }

    #[tokio::test]
    async fn test_relay_tunnel_unreachable_sends_nothing() {
        let port = closed_port().await;
        let (mut proxy_side, mut outer) = client_pair().await;
        outer
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port).as_bytes())
            .await
            .unwrap();

        let request = read_request(&mut proxy_side, IDLE).await.unwrap().unwrap();
        let mut bytes = SessionBytes::default();
        let err = relay_tunnel(proxy_side, &request, &test_config(), &mut bytes)
            .await
            .unwrap_err();
        assert!(err.response(true).is_none());

        let mut rest = Vec::new();
        outer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
