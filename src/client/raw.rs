//! Fast-path HTTP/1.1 backend.
//!
//! The request head is serialized once at construction and replayed for
//! every request; response framing is parsed by hand. Connections live in a
//! fixed pool of at most `max_conns` keep-alive streams, and a connection
//! that sees any error is dropped rather than repaired.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::conn::{self, Transport};
use super::{BODY_CHUNK_SIZE, ClientOpts, RequestError, RequestOutcome, timed_send};

/// Upper bound on the response header block.
const MAX_HEADER_BLOCK: usize = 64 * 1024;
/// Upper bound on a single chunk-size or trailer line.
const MAX_LINE: usize = 16 * 1024;

const READ_CHUNK: usize = 8 * 1024;

pub struct FastClient {
    opts: ClientOpts,
    head: Bytes,
    pool: std::sync::Mutex<Vec<Transport>>,
}

impl FastClient {
    pub fn new(opts: ClientOpts) -> Self {
        let head = build_request_head(&opts);
        Self {
            opts,
            head,
            pool: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn send(&self) -> RequestOutcome {
        timed_send(self.opts.timeout, self.dispatch()).await
    }

    async fn dispatch(&self) -> Result<u16, RequestError> {
        let mut stream = match self.checkout() {
            Some(stream) => stream,
            None => conn::dial(&self.opts.target, self.opts.tls.as_ref(), &self.opts.bytes).await?,
        };
        let (status, reusable) = self.roundtrip(&mut stream).await?;
        if reusable {
            self.checkin(stream);
        }
        Ok(status)
    }

    async fn roundtrip(&self, stream: &mut Transport) -> Result<(u16, bool), RequestError> {
        stream
            .write_all(&self.head)
            .await
            .map_err(|e| RequestError::from_io(&e))?;
        if self.opts.payload.stream {
            write_chunked(stream, &self.opts.payload.bytes)
                .await
                .map_err(|e| RequestError::from_io(&e))?;
        } else if !self.opts.payload.is_empty() {
            stream
                .write_all(&self.opts.payload.bytes)
                .await
                .map_err(|e| RequestError::from_io(&e))?;
        }
        stream.flush().await.map_err(|e| RequestError::from_io(&e))?;

        read_response(stream, self.opts.method == http::Method::HEAD).await
    }

    fn checkout(&self) -> Option<Transport> {
        self.pool.lock().unwrap().pop()
    }

    fn checkin(&self, stream: Transport) {
        let mut pool = self.pool.lock().unwrap();
        if pool.len() < self.opts.max_conns {
            pool.push(stream);
        }
    }
}

/// Serialize the fixed part of the request: request line, host, user
/// headers in their configured order, and body framing.
fn build_request_head(opts: &ClientOpts) -> Bytes {
    let mut head = String::with_capacity(256);
    head.push_str(opts.method.as_str());
    head.push(' ');
    head.push_str(&opts.target.path_and_query);
    head.push_str(" HTTP/1.1\r\n");

    // A user-supplied Host header overrides the derived one and keeps its
    // place in the header order.
    if !opts.has_user_host() {
        head.push_str("Host: ");
        head.push_str(&opts.target.authority);
        head.push_str("\r\n");
    }
    for (name, value) in &opts.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    if opts.payload.stream {
        head.push_str("Transfer-Encoding: chunked\r\n");
    } else if !opts.payload.is_empty() {
        head.push_str(&format!("Content-Length: {}\r\n", opts.payload.bytes.len()));
    }
    head.push_str("\r\n");
    Bytes::from(head.into_bytes())
}

async fn write_chunked<S: AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &Bytes,
) -> std::io::Result<()> {
    for chunk in payload.chunks(BODY_CHUNK_SIZE) {
        stream
            .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
            .await?;
        stream.write_all(chunk).await?;
        stream.write_all(b"\r\n").await?;
    }
    stream.write_all(b"0\r\n\r\n").await
}

#[derive(Debug, PartialEq, Eq)]
struct ResponseHead {
    status: u16,
    content_length: Option<u64>,
    chunked: bool,
    close: bool,
}

/// Read one response off the stream and consume its body. Returns the status
/// and whether the connection can be reused.
async fn read_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    head_request: bool,
) -> Result<(u16, bool), RequestError> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > MAX_HEADER_BLOCK {
            return Err(RequestError::MalformedResponse);
        }
        buf.reserve(READ_CHUNK);
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| RequestError::from_io(&e))?;
        if n == 0 {
            return Err(RequestError::ConnectionClosed);
        }
    };

    let head = parse_head(&buf[..header_end])?;
    buf.advance(header_end);

    if head_request || !has_body(head.status) {
        return Ok((head.status, !head.close));
    }

    if head.chunked {
        consume_chunked(stream, &mut buf).await?;
    } else if let Some(len) = head.content_length {
        discard(stream, &mut buf, len).await?;
    } else {
        // No framing: the body runs to end of stream and the connection is
        // spent.
        loop {
            buf.clear();
            buf.reserve(READ_CHUNK);
            let n = stream
                .read_buf(&mut buf)
                .await
                .map_err(|e| RequestError::from_io(&e))?;
            if n == 0 {
                return Ok((head.status, false));
            }
        }
    }
    Ok((head.status, !head.close))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn has_body(status: u16) -> bool {
    !((100..200).contains(&status) || status == 204 || status == 304)
}

fn parse_head(block: &[u8]) -> Result<ResponseHead, RequestError> {
    let text = std::str::from_utf8(block).map_err(|_| RequestError::MalformedResponse)?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or(RequestError::MalformedResponse)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(RequestError::MalformedResponse)?;
    if !version.starts_with("HTTP/1.") {
        return Err(RequestError::MalformedResponse);
    }
    let status: u16 = parts
        .next()
        .ok_or(RequestError::MalformedResponse)?
        .parse()
        .map_err(|_| RequestError::MalformedResponse)?;

    let mut content_length = None;
    let mut chunked = false;
    let mut connection = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(value.parse().map_err(|_| RequestError::MalformedResponse)?);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.to_ascii_lowercase().contains("chunked");
        } else if name.eq_ignore_ascii_case("connection") {
            connection = Some(value.to_ascii_lowercase());
        }
    }

    let close = match connection.as_deref() {
        Some(v) if v.contains("close") => true,
        Some(v) if v.contains("keep-alive") => false,
        _ => version == "HTTP/1.0",
    };

    Ok(ResponseHead {
        status,
        content_length,
        chunked,
        close,
    })
}

/// Discard exactly `len` body bytes, starting with whatever is already
/// buffered. Buffered bytes beyond `len` are preserved.
async fn discard<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
    len: u64,
) -> Result<(), RequestError> {
    let mut remaining = len;
    loop {
        let have = buf.len() as u64;
        if have >= remaining {
            buf.advance(remaining as usize);
            return Ok(());
        }
        remaining -= have;
        buf.clear();
        buf.reserve(READ_CHUNK);
        let n = stream
            .read_buf(buf)
            .await
            .map_err(|e| RequestError::from_io(&e))?;
        if n == 0 {
            return Err(RequestError::ConnectionClosed);
        }
    }
}

async fn read_line<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<String, RequestError> {
    loop {
        if let Some(pos) = find_crlf(buf) {
            let line = buf.split_to(pos + 2);
            let text = std::str::from_utf8(&line[..pos])
                .map_err(|_| RequestError::MalformedResponse)?
                .to_owned();
            return Ok(text);
        }
        if buf.len() > MAX_LINE {
            return Err(RequestError::MalformedResponse);
        }
        buf.reserve(READ_CHUNK);
        let n = stream
            .read_buf(buf)
            .await
            .map_err(|e| RequestError::from_io(&e))?;
        if n == 0 {
            return Err(RequestError::ConnectionClosed);
        }
    }
}

/// Consume a chunked body: size line, data, trailing CRLF, repeated until
/// the zero chunk, then any trailers up to the final empty line.
async fn consume_chunked<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<(), RequestError> {
    loop {
        let line = read_line(stream, buf).await?;
        let size_text = line.split(';').next().unwrap_or("").trim();
        let size =
            u64::from_str_radix(size_text, 16).map_err(|_| RequestError::MalformedResponse)?;
        if size == 0 {
            loop {
                let trailer = read_line(stream, buf).await?;
                if trailer.is_empty() {
                    return Ok(());
                }
            }
        }
        // Chunk data plus its trailing CRLF.
        discard(stream, buf, size + 2).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Payload, Target};
    use crate::metrics::ByteCounters;
    use std::sync::Arc;
    use std::time::Duration;

    fn opts(method: http::Method, payload: Payload, headers: Vec<(String, String)>) -> ClientOpts {
        ClientOpts {
            target: Target::from_url("http://example.com:8080/path?x=1").unwrap(),
            method,
            headers,
            payload,
            timeout: Duration::from_secs(2),
            max_conns: 4,
            tls: None,
            bytes: Arc::new(ByteCounters::default()),
        }
    }

    fn empty_payload() -> Payload {
        Payload {
            bytes: Bytes::new(),
            stream: false,
        }
    }

    #[test]
    fn head_includes_request_line_and_host() {
        let head = build_request_head(&opts(http::Method::GET, empty_payload(), vec![]));
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.starts_with("GET /path?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:8080\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn head_preserves_header_order_and_duplicates() {
        let headers = vec![
            ("X-One".to_owned(), "1".to_owned()),
            ("X-Two".to_owned(), "2".to_owned()),
            ("X-One".to_owned(), "3".to_owned()),
        ];
        let head = build_request_head(&opts(http::Method::GET, empty_payload(), headers));
        let text = std::str::from_utf8(&head).unwrap();
        let one = text.find("X-One: 1\r\n").unwrap();
        let two = text.find("X-Two: 2\r\n").unwrap();
        let dup = text.find("X-One: 3\r\n").unwrap();
        assert!(one < two && two < dup);
    }

    #[test]
    fn head_honours_user_host_override() {
        let headers = vec![("Host".to_owned(), "web".to_owned())];
        let head = build_request_head(&opts(http::Method::GET, empty_payload(), headers));
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.contains("Host: web\r\n"));
        assert!(!text.contains("Host: example.com"));
    }

    #[test]
    fn head_frames_buffered_and_streamed_bodies() {
        let buffered = Payload {
            bytes: Bytes::from_static(b"abracadabra"),
            stream: false,
        };
        let head = build_request_head(&opts(http::Method::POST, buffered, vec![]));
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.contains("Content-Length: 11\r\n"));

        let streamed = Payload {
            bytes: Bytes::from_static(b"abracadabra"),
            stream: true,
        };
        let head = build_request_head(&opts(http::Method::POST, streamed, vec![]));
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn parses_a_plain_response_head() {
        let head = parse_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            head,
            ResponseHead {
                status: 200,
                content_length: Some(5),
                chunked: false,
                close: false,
            }
        );
    }

    #[test]
    fn parses_nonstandard_status_codes() {
        let head = parse_head(b"HTTP/1.1 707 Whatever\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(head.status, 707);
    }

    #[test]
    fn connection_close_and_http10_disable_reuse() {
        let head = parse_head(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n").unwrap();
        assert!(head.close);
        let head = parse_head(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert!(head.close);
        let head = parse_head(b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert!(!head.close);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_head(b"SIP/2.0 200 OK\r\n\r\n").is_err());
        assert!(parse_head(b"HTTP/1.1 abc OK\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn reads_a_content_length_response() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        far.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();

        let (status, reusable) = read_response(&mut near, false).await.unwrap();
        assert_eq!(status, 200);
        assert!(reusable);
    }

    #[tokio::test]
    async fn reads_a_chunked_response() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        far.write_all(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

        let (status, reusable) = read_response(&mut near, false).await.unwrap();
        assert_eq!(status, 200);
        assert!(reusable);
    }

    #[tokio::test]
    async fn informational_responses_have_no_body() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        far.write_all(b"HTTP/1.1 102 Processing\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        let (status, reusable) = read_response(&mut near, false).await.unwrap();
        assert_eq!(status, 102);
        assert!(reusable);
    }

    #[tokio::test]
    async fn unframed_body_reads_to_eof_and_spends_the_connection() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        far.write_all(b"HTTP/1.1 200 OK\r\n\r\nsome body without framing")
            .await
            .unwrap();
        drop(far);

        let (status, reusable) = read_response(&mut near, false).await.unwrap();
        assert_eq!(status, 200);
        assert!(!reusable);
    }

    #[tokio::test]
    async fn eof_before_any_response_is_an_error() {
        let (mut near, far) = tokio::io::duplex(64);
        drop(far);
        let err = read_response(&mut near, false).await.unwrap_err();
        assert_eq!(err.to_string(), "connection closed before response");
    }

    #[tokio::test]
    async fn chunked_writer_emits_terminated_frames() {
        let mut out = Vec::new();
        write_chunked(&mut out, &Bytes::from_static(b"abracadabra"))
            .await
            .unwrap();
        assert_eq!(out, b"b\r\nabracadabra\r\n0\r\n\r\n");
    }
}
