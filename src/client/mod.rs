//! HTTP client backends.
//!
//! Each backend executes one request and reports `(status, elapsed, error)`.
//! A failed request still carries the elapsed time; its status is zero and
//! must not reach the status-class counters as a real code. Backends share
//! the dialing and byte-counting plumbing in `conn` and are selected as
//! tagged variants so dispatch stays a plain match.

pub mod conn;
mod http1;
mod http2;
mod raw;

use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::Uri;
use http_body::{Frame, SizeHint};
use url::Url;

pub use conn::{CountingStream, Transport};

use crate::config::{ClientKind, Config, ConfigError};
use crate::metrics::ByteCounters;

/// Frame size used when producing a streamed (chunked) request body.
const BODY_CHUNK_SIZE: usize = 8 * 1024;

/// Where and how to reach the target, precomputed from the configured URL.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// `host` or `host:port` for non-default ports; the `Host` header value.
    pub authority: String,
    /// Origin-form request target: path plus optional query.
    pub path_and_query: String,
    /// Absolute-form URI, required by the HTTP/2 backend.
    pub absolute_uri: Uri,
    pub tls: bool,
}

impl Target {
    fn from_url(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw).map_err(|_| ConfigError::InvalidUrl(raw.to_owned()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUrl(raw.to_owned()))?
            .to_owned();
        let tls = url.scheme() == "https";
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ConfigError::InvalidUrl(raw.to_owned()))?;
        let authority = match url.port() {
            Some(p) => format!("{host}:{p}"),
            None => host.clone(),
        };
        let mut path_and_query = url.path().to_owned();
        if let Some(query) = url.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        let absolute_uri: Uri = url
            .as_str()
            .parse()
            .map_err(|_| ConfigError::InvalidUrl(raw.to_owned()))?;
        Ok(Self {
            host,
            port,
            authority,
            path_and_query,
            absolute_uri,
            tls,
        })
    }
}

/// Request body material, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Bytes,
    pub stream: bool,
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Everything a backend needs to execute requests.
pub struct ClientOpts {
    pub target: Target,
    pub method: http::Method,
    pub headers: Vec<(String, String)>,
    pub payload: Payload,
    pub timeout: Duration,
    pub max_conns: usize,
    pub tls: Option<Arc<rustls::ClientConfig>>,
    pub bytes: Arc<ByteCounters>,
}

impl ClientOpts {
    pub fn from_config(config: &Config, bytes: Arc<ByteCounters>) -> Result<Self, ConfigError> {
        let target = Target::from_url(&config.url)?;

        let body = match &config.body_file {
            Some(path) => {
                Bytes::from(std::fs::read(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?)
            }
            None => Bytes::from(config.body.clone().into_bytes()),
        };

        let tls = if target.tls {
            let alpn: &[&[u8]] = match config.client_kind {
                ClientKind::Http2 => &[b"h2"],
                _ => &[b"http/1.1"],
            };
            Some(conn::build_tls_config(config, alpn)?)
        } else {
            None
        };

        Ok(Self {
            target,
            method: config.method.clone(),
            headers: config.headers.clone(),
            payload: Payload {
                bytes: body,
                stream: config.stream,
            },
            timeout: config.timeout,
            max_conns: config.connections as usize,
            tls,
            bytes,
        })
    }

    /// Whether the user supplied their own `Host` header.
    fn has_user_host(&self) -> bool {
        self.headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("host"))
    }
}

/// One request's worth of results.
#[derive(Debug)]
pub struct RequestOutcome {
    pub status: u16,
    pub elapsed: Duration,
    pub error: Option<RequestError>,
}

/// Drive one request future under the per-request timeout, folding the
/// outcome into the uniform result shape. A timeout of zero disables the
/// deadline.
pub(crate) async fn timed_send<F>(timeout: Duration, fut: F) -> RequestOutcome
where
    F: Future<Output = Result<u16, RequestError>>,
{
    let start = std::time::Instant::now();
    if timeout.is_zero() {
        return match fut.await {
            Ok(status) => RequestOutcome {
                status,
                elapsed: start.elapsed(),
                error: None,
            },
            Err(error) => RequestOutcome {
                status: 0,
                elapsed: start.elapsed(),
                error: Some(error),
            },
        };
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(status)) => RequestOutcome {
            status,
            elapsed: start.elapsed(),
            error: None,
        },
        Ok(Err(error)) => RequestOutcome {
            status: 0,
            elapsed: start.elapsed(),
            error: Some(error),
        },
        Err(_) => RequestOutcome {
            status: 0,
            elapsed: start.elapsed(),
            error: Some(RequestError::Timeout),
        },
    }
}

/// Canonicalised transport errors. The `Display` form is the stable string
/// used as the error-map key.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request timeout")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("dns lookup failure")]
    DnsFailure,
    #[error("tls handshake failure")]
    TlsHandshake,
    #[error("connection closed before response")]
    ConnectionClosed,
    #[error("malformed response")]
    MalformedResponse,
    #[error("io error: {0}")]
    Io(String),
    #[error("http protocol error")]
    Http,
}

impl RequestError {
    pub(crate) fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Self::ConnectionReset
            }
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            _ => {
                // DNS failures surface as uncategorised io errors.
                if e.to_string().contains("lookup") {
                    Self::DnsFailure
                } else {
                    Self::Io(e.kind().to_string())
                }
            }
        }
    }

    pub(crate) fn from_hyper(e: &hyper::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        if e.is_incomplete_message() {
            return Self::ConnectionClosed;
        }
        if e.is_parse() {
            return Self::MalformedResponse;
        }
        if let Some(io_err) = io_source(e) {
            return Self::from_io(io_err);
        }
        Self::Http
    }
}

/// Find the first `io::Error` in an error's source chain.
fn io_source<'a>(e: &'a (dyn std::error::Error + 'static)) -> Option<&'a io::Error> {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        source = err.source();
    }
    None
}

/// Request body handed to the hyper backends.
///
/// Buffered payloads advertise an exact size, so HTTP/1 gets a
/// `Content-Length`. The producer variant re-chunks the payload per request
/// with an unknown size hint, which makes HTTP/1 use chunked transfer
/// encoding.
pub struct RequestBody(BodyInner);

enum BodyInner {
    Full(Option<Bytes>),
    Chunked(Bytes),
}

impl RequestBody {
    pub fn new(payload: &Payload) -> Self {
        if payload.stream {
            Self(BodyInner::Chunked(payload.bytes.clone()))
        } else if payload.bytes.is_empty() {
            Self(BodyInner::Full(None))
        } else {
            Self(BodyInner::Full(Some(payload.bytes.clone())))
        }
    }
}

impl http_body::Body for RequestBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().0 {
            BodyInner::Full(data) => Poll::Ready(data.take().map(|b| Ok(Frame::data(b)))),
            BodyInner::Chunked(rest) => {
                if rest.is_empty() {
                    Poll::Ready(None)
                } else {
                    let n = rest.len().min(BODY_CHUNK_SIZE);
                    Poll::Ready(Some(Ok(Frame::data(rest.split_to(n)))))
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.0 {
            BodyInner::Full(data) => data.is_none(),
            BodyInner::Chunked(rest) => rest.is_empty(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.0 {
            BodyInner::Full(Some(b)) => SizeHint::with_exact(b.len() as u64),
            BodyInner::Full(None) => SizeHint::with_exact(0),
            BodyInner::Chunked(_) => SizeHint::default(),
        }
    }
}

/// The selected backend behind a uniform `send` call.
pub enum HttpClient {
    Fast(raw::FastClient),
    Http1(http1::Http1Client),
    Http2(http2::Http2Client),
}

impl HttpClient {
    pub fn new(kind: ClientKind, opts: ClientOpts) -> Self {
        match kind {
            ClientKind::Fast => Self::Fast(raw::FastClient::new(opts)),
            ClientKind::Http1 => Self::Http1(http1::Http1Client::new(opts)),
            ClientKind::Http2 => Self::Http2(http2::Http2Client::new(opts)),
        }
    }

    /// Execute one request against the target.
    pub async fn send(&self) -> RequestOutcome {
        match self {
            Self::Fast(c) => c.send().await,
            Self::Http1(c) => c.send().await,
            Self::Http2(c) => c.send().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body::Body;
    use http_body_util::BodyExt;

    fn target(raw: &str) -> Target {
        Target::from_url(raw).unwrap()
    }

    #[test]
    fn target_splits_the_url() {
        let t = target("http://example.com:8080/status?q=1");
        assert_eq!(t.host, "example.com");
        assert_eq!(t.port, 8080);
        assert_eq!(t.authority, "example.com:8080");
        assert_eq!(t.path_and_query, "/status?q=1");
        assert!(!t.tls);
    }

    #[test]
    fn target_uses_known_default_ports() {
        let t = target("https://example.com/");
        assert_eq!(t.port, 443);
        assert_eq!(t.authority, "example.com");
        assert!(t.tls);
    }

    #[tokio::test]
    async fn buffered_body_is_a_single_exact_frame() {
        let payload = Payload {
            bytes: Bytes::from_static(b"abracadabra"),
            stream: false,
        };
        let mut body = RequestBody::new(&payload);
        assert_eq!(body.size_hint().exact(), Some(11));
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"abracadabra"));
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn streamed_body_produces_bounded_chunks() {
        let payload = Payload {
            bytes: Bytes::from(vec![7u8; BODY_CHUNK_SIZE * 2 + 5]),
            stream: true,
        };
        let mut body = RequestBody::new(&payload);
        assert_eq!(body.size_hint().exact(), None);

        let mut total = 0;
        let mut frames = 0;
        while let Some(frame) = body.frame().await {
            let data = frame.unwrap().into_data().unwrap();
            assert!(data.len() <= BODY_CHUNK_SIZE);
            total += data.len();
            frames += 1;
        }
        assert_eq!(total, BODY_CHUNK_SIZE * 2 + 5);
        assert_eq!(frames, 3);
    }

    #[test]
    fn io_errors_canonicalise_to_short_strings() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            RequestError::from_io(&refused).to_string(),
            "connection refused"
        );
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(RequestError::from_io(&reset).to_string(), "connection reset");
        let dns = io::Error::other("failed to lookup address information");
        assert_eq!(RequestError::from_io(&dns).to_string(), "dns lookup failure");
    }
}
