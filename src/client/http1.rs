//! Standard HTTP/1.1 backend over hyper's connection-level client.
//!
//! Each pooled entry is a `SendRequest` handle whose connection task runs in
//! the background; the stream underneath is the counting transport, so byte
//! accounting works the same as for the fast path. One request at a time per
//! connection, at most `max_conns` connections.

use http::header::HOST;
use http_body_util::BodyExt;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;

use super::conn::{self, Transport};
use super::{ClientOpts, RequestBody, RequestError, RequestOutcome, timed_send};

type Sender = http1::SendRequest<RequestBody>;

pub struct Http1Client {
    opts: ClientOpts,
    pool: std::sync::Mutex<Vec<Sender>>,
}

impl Http1Client {
    pub fn new(opts: ClientOpts) -> Self {
        Self {
            opts,
            pool: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn send(&self) -> RequestOutcome {
        timed_send(self.opts.timeout, self.dispatch()).await
    }

    async fn dispatch(&self) -> Result<u16, RequestError> {
        let mut sender = match self.checkout() {
            Some(sender) => sender,
            None => self.handshake().await?,
        };

        sender
            .ready()
            .await
            .map_err(|e| RequestError::from_hyper(&e))?;

        let request = self.build_request()?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| RequestError::from_hyper(&e))?;
        let status = response.status().as_u16();

        // Drain the body so the connection is clean for the next request.
        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            frame.map_err(|e| RequestError::from_hyper(&e))?;
        }

        self.checkin(sender);
        Ok(status)
    }

    async fn handshake(&self) -> Result<Sender, RequestError> {
        let stream: Transport =
            conn::dial(&self.opts.target, self.opts.tls.as_ref(), &self.opts.bytes).await?;
        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| RequestError::from_hyper(&e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("http/1.1 connection ended: {e}");
            }
        });
        Ok(sender)
    }

    fn build_request(&self) -> Result<http::Request<RequestBody>, RequestError> {
        let mut builder = http::Request::builder()
            .method(self.opts.method.clone())
            .uri(self.opts.target.path_and_query.as_str());
        if !self.opts.has_user_host() {
            builder = builder.header(HOST, self.opts.target.authority.as_str());
        }
        for (name, value) in &self.opts.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(RequestBody::new(&self.opts.payload))
            .map_err(|e| {
                tracing::debug!("invalid request parts: {e}");
                RequestError::Http
            })
    }

    fn checkout(&self) -> Option<Sender> {
        let mut pool = self.pool.lock().unwrap();
        while let Some(sender) = pool.pop() {
            if !sender.is_closed() {
                return Some(sender);
            }
        }
        None
    }

    fn checkin(&self, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        let mut pool = self.pool.lock().unwrap();
        if pool.len() < self.opts.max_conns {
            pool.push(sender);
        }
    }
}
