//! HTTP/2 backend: one connection, up to `max_conns` concurrent streams.
//!
//! The `SendRequest` handle is cheaply cloneable and multiplexes streams
//! over the single counted connection. When the connection dies the stored
//! handle is invalidated and the next request performs a fresh handshake.

use http_body_util::BodyExt;
use hyper::client::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::Mutex;

use super::conn;
use super::{ClientOpts, RequestBody, RequestError, RequestOutcome, timed_send};

type Sender = http2::SendRequest<RequestBody>;

pub struct Http2Client {
    opts: ClientOpts,
    sender: Mutex<Option<Sender>>,
}

impl Http2Client {
    pub fn new(opts: ClientOpts) -> Self {
        Self {
            opts,
            sender: Mutex::new(None),
        }
    }

    pub async fn send(&self) -> RequestOutcome {
        timed_send(self.opts.timeout, self.dispatch()).await
    }

    async fn dispatch(&self) -> Result<u16, RequestError> {
        let mut sender = self.current_sender().await?;

        sender
            .ready()
            .await
            .map_err(|e| RequestError::from_hyper(&e))?;

        let request = self.build_request()?;
        let result = sender.send_request(request).await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.invalidate().await;
                return Err(RequestError::from_hyper(&e));
            }
        };
        let status = response.status().as_u16();

        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            frame.map_err(|e| RequestError::from_hyper(&e))?;
        }
        Ok(status)
    }

    /// Clone the live multiplexing handle, establishing the connection first
    /// if there is none.
    async fn current_sender(&self) -> Result<Sender, RequestError> {
        let mut guard = self.sender.lock().await;
        if let Some(sender) = guard.as_ref()
            && !sender.is_closed()
        {
            return Ok(sender.clone());
        }

        let stream = conn::dial(&self.opts.target, self.opts.tls.as_ref(), &self.opts.bytes).await?;
        let (sender, connection) = http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .map_err(|e| RequestError::from_hyper(&e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("http/2 connection ended: {e}");
            }
        });
        *guard = Some(sender.clone());
        Ok(sender)
    }

    async fn invalidate(&self) {
        let mut guard = self.sender.lock().await;
        if let Some(sender) = guard.as_ref()
            && sender.is_closed()
        {
            *guard = None;
        }
    }

    fn build_request(&self) -> Result<http::Request<RequestBody>, RequestError> {
        let mut builder = http::Request::builder()
            .method(self.opts.method.clone())
            .uri(self.opts.target.absolute_uri.clone());
        // Authority travels in the URI; a literal Host header is not valid
        // on this protocol, so a user-supplied one is dropped here.
        for (name, value) in &self.opts.headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(RequestBody::new(&self.opts.payload))
            .map_err(|e| {
                tracing::debug!("invalid request parts: {e}");
                RequestError::Http
            })
    }
}
