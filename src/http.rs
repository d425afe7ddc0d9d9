//! HTTP/1.x request parsing for the forward proxy.
//!
//! Only the request line and header block are parsed; bodies are relayed as
//! opaque bytes by [`crate::relay`].

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProxyError;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const MAX_LINE_LEN: usize = 8 * 1024;
pub const MAX_HEADERS: usize = 100;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_CONNECT_PORT: u16 = 443;

const HTTP_SCHEME: &str = "http://";
const PROXY_CONNECTION: &str = "proxy-connection";
const CONTENT_LENGTH: &str = "content-length";

// ============================================================================
// STATIC RESPONSES
// ============================================================================

pub const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Type: text/html\r\n\
Content-Length: 50\r\n\
Connection: close\r\n\
\r\n\
<html><body><h1>400 Bad Request</h1></body></html>";

pub const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Content-Type: text/html\r\n\
Content-Length: 50\r\n\
Connection: close\r\n\
\r\n\
<html><body><h1>502 Bad Gateway</h1></body></html>";

pub const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

// ============================================================================
// REQUEST
// ============================================================================

/// A parsed request head. Header names are stored lower-cased; a repeated
/// header keeps its last value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: String,
    headers: Vec<(String, String)>,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Declared body length; absent or unparsable counts as zero.
    pub fn content_length(&self) -> u64 {
        self.header(CONTENT_LENGTH)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Request head as sent upstream: origin-form `path`, every header except
    /// `proxy-connection`, terminated by a blank line.
    pub fn upstream_head(&self, path: &str) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", self.method, path, self.version);
        for (key, value) in self.headers() {
            if key == PROXY_CONNECTION {
                continue;
            }
            head.push_str(key);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        head.into_bytes()
    }

    fn set_header(&mut self, key: String, value: String) {
        match self.headers.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((key, value)),
        }
    }
}

/// Read one request head from `reader`.
///
/// Returns `Ok(None)` when the client closed the connection (or sent an empty
/// line) before any request line arrived.
pub async fn read_request<R>(reader: &mut R, idle: Duration) -> Result<Option<Request>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let request_line = match read_line(reader, idle).await? {
        Some(line) if !line.is_empty() => line,
        _ => return Ok(None),
    };

    let mut tokens = request_line.split(' ');
    let (method, target, version) = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(method), Some(target), Some(version)) => (method, target, version),
        _ => {
            return Err(ProxyError::parse(format!(
                "expected 3 tokens in request line {:?}",
                request_line
            )))
        }
    };

    let mut request = Request {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers: Vec::new(),
    };

    let mut count = 0;
    while let Some(line) = read_line(reader, idle).await? {
        if line.is_empty() {
            break;
        }

        count += 1;
        if count > MAX_HEADERS {
            return Err(ProxyError::parse("too many header lines"));
        }

        let Some((key, value)) = line.split_once(':') else {
            debug!("Skipping header line without colon: {:?}", line);
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            debug!("Skipping header line with empty name: {:?}", line);
            continue;
        }
        request.set_header(key, value.trim().to_string());
    }

    Ok(Some(request))
}

/// Read bytes up to `\n`, dropping the terminator and one trailing `\r`.
/// `Ok(None)` means end of stream with nothing read.
async fn read_line<R>(reader: &mut R, idle: Duration) -> Result<Option<String>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = (MAX_LINE_LEN + 1) as u64;
    let mut bounded = (&mut *reader).take(limit);

    let n = timeout(idle, bounded.read_until(b'\n', &mut line))
        .await
        .map_err(|_| {
            ProxyError::Client(io::Error::new(
                io::ErrorKind::TimedOut,
                "request read timed out",
            ))
        })?
        .map_err(ProxyError::Client)?;

    if n == 0 {
        return Ok(None);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
    } else if line.len() > MAX_LINE_LEN {
        return Err(ProxyError::parse("request line too long"));
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

// ============================================================================
// TARGETS
// ============================================================================

/// Upstream `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl Authority {
    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidTarget(input.to_string());

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            match after {
                "" => (host, None),
                _ => (host, Some(after.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else if input.matches(':').count() > 1 {
            // bare IPv6 literal, no room for a port
            (input, None)
        } else {
            match input.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (input, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Absolute-form target of a plain-HTTP proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTarget {
    pub authority: Authority,
    pub path: String,
}

impl HttpTarget {
    /// `http://host[:port]/path` or `host[:port]/path`; the path defaults to
    /// `/`. An origin-form target (`/path`) names no upstream and is rejected.
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let rest = target.strip_prefix(HTTP_SCHEME).unwrap_or(target);

        let (authority, path) = match rest.find('/') {
            Some(0) => return Err(ProxyError::InvalidTarget(target.to_string())),
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        Ok(Self {
            authority: Authority::parse(authority, DEFAULT_HTTP_PORT)?,
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(5);

    async fn parse(raw: &[u8]) -> Result<Option<Request>, ProxyError> {
        let mut reader = raw;
        read_request(&mut reader, IDLE).await
    }

    #[tokio::test]
    async fn test_parse_get_request() {
        let request = parse(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "http://example.com/");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.header("host"), Some("example.com"));
        assert_eq!(request.header("Host"), Some("example.com"));
        assert!(!request.is_connect());
    }

    #[tokio::test]
    async fn test_parse_connect_request() {
        let request = parse(b"connect example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(request.is_connect());
        assert_eq!(request.target, "example.com:443");
    }

    #[tokio::test]
    async fn test_headers_fold_case_and_last_wins() {
        let request = parse(
            b"GET / HTTP/1.1\r\nX-Token:  first \r\nx-token: second\r\nAccept: */*\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(request.header("x-token"), Some("second"));
        assert_eq!(request.headers().count(), 2);
    }

    #[tokio::test]
    async fn test_header_value_keeps_later_colons() {
        let request = parse(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.header("host"), Some("example.com:8080"));
    }

    #[tokio::test]
    async fn test_lf_only_line_endings() {
        let request = parse(b"GET / HTTP/1.0\nHost: a\n\n").await.unwrap().unwrap();
        assert_eq!(request.version, "HTTP/1.0");
        assert_eq!(request.header("host"), Some("a"));
    }

    #[tokio::test]
    async fn test_short_request_line_is_parse_error() {
        let err = parse(b"GET /\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::Parse(_)));

        let err = parse(b"GARBAGE\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::Parse(_)));
    }

    #[tokio::test]
    async fn test_malformed_header_lines_are_skipped() {
        let request = parse(b"GET / HTTP/1.1\r\nHost: x\r\nbogus-line\r\n: no-name\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(request.header("host"), Some("x"));
        assert_eq!(request.header("accept"), Some("*/*"));
        assert_eq!(request.headers().count(), 2);
    }

    #[tokio::test]
    async fn test_oversized_line_is_parse_error() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_LINE_LEN));
        raw.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        let err = parse(&raw).await.unwrap_err();
        assert!(matches!(err, ProxyError::Parse(_)));
    }

    #[tokio::test]
    async fn test_too_many_headers_is_parse_error() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            raw.extend_from_slice(format!("x-h{}: v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let err = parse(&raw).await.unwrap_err();
        assert!(matches!(err, ProxyError::Parse(_)));
    }

    #[tokio::test]
    async fn test_empty_stream_yields_none() {
        assert!(parse(b"").await.unwrap().is_none());
        assert!(parse(b"\r\n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_body_is_left_in_reader() {
        let mut reader: &[u8] = b"POST http://a/ HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyEXTRA";
        let request = read_request(&mut reader, IDLE).await.unwrap().unwrap();
        assert_eq!(request.content_length(), 4);
        assert_eq!(reader, b"bodyEXTRA");
    }

    #[tokio::test]
    async fn test_content_length_defaults_to_zero() {
        let request = parse(b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.content_length(), 0);
    }

    #[tokio::test]
    async fn test_upstream_head_strips_proxy_connection() {
        let request = parse(
            b"GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();

        let head = String::from_utf8(request.upstream_head("/x")).unwrap();
        assert_eq!(head, "GET /x HTTP/1.1\r\nhost: example.com\r\n\r\n");
    }

    #[test]
    fn test_http_target_parsing() {
        let t = HttpTarget::parse("http://example.com:8080/a/b?q=1").unwrap();
        assert_eq!(t.authority.host, "example.com");
        assert_eq!(t.authority.port, 8080);
        assert_eq!(t.path, "/a/b?q=1");

        let t = HttpTarget::parse("http://example.com").unwrap();
        assert_eq!(t.authority.port, 80);
        assert_eq!(t.path, "/");

        let t = HttpTarget::parse("example.com/index.html").unwrap();
        assert_eq!(t.authority.host, "example.com");
        assert_eq!(t.path, "/index.html");

        assert!(HttpTarget::parse("/index.html").is_err());
        assert!(HttpTarget::parse("http://example.com:http/").is_err());
        assert!(HttpTarget::parse("http:///").is_err());
    }

    #[test]
    fn test_authority_parsing() {
        let a = Authority::parse("example.com:8443", 443).unwrap();
        assert_eq!((a.host.as_str(), a.port), ("example.com", 8443));

        let a = Authority::parse("example.com", 443).unwrap();
        assert_eq!(a.port, 443);

        let a = Authority::parse("[::1]:8443", 443).unwrap();
        assert_eq!((a.host.as_str(), a.port), ("::1", 8443));
        assert_eq!(a.to_string(), "[::1]:8443");

        let a = Authority::parse("[::1]", 443).unwrap();
        assert_eq!(a.port, 443);

        assert!(Authority::parse(":443", 443).is_err());
        assert!(Authority::parse("host:99999", 443).is_err());
        assert!(Authority::parse("[::1", 443).is_err());
    }

    #[test]
    fn test_canned_response_lengths() {
        for response in [RESPONSE_400, RESPONSE_502] {
            let text = std::str::from_utf8(response).unwrap();
            let (head, body) = text.split_once("\r\n\r\n").unwrap();
            assert!(head.contains("Connection: close"));
            assert!(head.contains(&format!("Content-Length: {}", body.len())));
        }
        assert_eq!(RESPONSE_200_CONNECT, b"HTTP/1.1 200 Connection Established\r\n\r\n");
    }
}
