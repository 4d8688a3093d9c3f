//! Connection plumbing shared by every backend: dialing, the byte-counting
//! stream wrapper, and TLS client configuration.
//!
//! The counting wrapper sits directly on the TCP stream, beneath TLS, so the
//! byte counters reflect what actually crossed the wire.

use std::io::{self, BufReader};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::client::{RequestError, Target};
use crate::config::{Config, ConfigError};
use crate::metrics::ByteCounters;

/// Stream wrapper that credits successfully transferred bytes to the shared
/// counters. Errored operations contribute nothing.
pub struct CountingStream<S> {
    inner: S,
    bytes: Arc<ByteCounters>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, bytes: Arc<ByteCounters>) -> Self {
        Self { inner, bytes }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.bytes.add_read(n as i64);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.bytes.add_written(n as i64);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.bytes.add_written(n as i64);
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// A dialed connection: counted TCP, optionally wrapped in TLS.
pub enum Transport {
    Plain(CountingStream<TcpStream>),
    Tls(Box<TlsStream<CountingStream<TcpStream>>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dial the target, wrap the stream in the byte counter, and perform the TLS
/// handshake when the scheme asks for it.
pub async fn dial(
    target: &Target,
    tls: Option<&Arc<rustls::ClientConfig>>,
    bytes: &Arc<ByteCounters>,
) -> Result<Transport, RequestError> {
    let stream = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|e| RequestError::from_io(&e))?;
    let _ = stream.set_nodelay(true);
    let counted = CountingStream::new(stream, Arc::clone(bytes));

    match tls {
        None => Ok(Transport::Plain(counted)),
        Some(config) => {
            let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())
                .map_err(|_| RequestError::TlsHandshake)?;
            let connector = TlsConnector::from(Arc::clone(config));
            let stream = connector
                .connect(server_name, counted)
                .await
                .map_err(|e| {
                    tracing::debug!("tls handshake failed: {e}");
                    RequestError::TlsHandshake
                })?;
            Ok(Transport::Tls(Box::new(stream)))
        }
    }
}

/// Build the rustls client configuration: webpki roots, optional client
/// certificate, optional verification bypass, and the backend's ALPN list.
pub fn build_tls_config(
    config: &Config,
    alpn: &[&[u8]],
) -> Result<Arc<rustls::ClientConfig>, ConfigError> {
    let client_auth = load_client_cert(config)?;

    let builder = rustls::ClientConfig::builder();
    let mut tls = if config.insecure {
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));
        match client_auth {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ConfigError::Tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        }
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let builder = builder.with_root_certificates(roots);
        match client_auth {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ConfigError::Tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        }
    };
    tls.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(tls))
}

type ClientAuth = (
    Vec<rustls::pki_types::CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
);

/// Read the client certificate chain and key from PEM files, when both are
/// configured. Pairing is enforced by config validation.
fn load_client_cert(config: &Config) -> Result<Option<ClientAuth>, ConfigError> {
    let (Some(cert_path), Some(key_path)) = (&config.cert_path, &config.key_path) else {
        return Ok(None);
    };

    let open = |path: &std::path::PathBuf| {
        std::fs::File::open(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })
    };

    let certs = rustls_pemfile::certs(&mut BufReader::new(open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("bad certificate in {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(open(key_path)?))
        .map_err(|e| ConfigError::Tls(format!("bad key in {}: {e}", key_path.display())))?
        .ok_or_else(|| {
            ConfigError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    Ok(Some((certs, key)))
}

/// Verifier behind the insecure flag: every server certificate passes, for
/// targets with self-signed or otherwise untrusted chains. Signature checks
/// are waved through as well; only the scheme list is real, so the
/// handshake still negotiates a sane algorithm.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counts_successful_reads_and_writes() {
        let bytes = Arc::new(ByteCounters::default());
        let (near, mut far) = tokio::io::duplex(1024);
        let mut counted = CountingStream::new(near, Arc::clone(&bytes));

        counted.write_all(b"ping pong").await.unwrap();
        counted.flush().await.unwrap();
        assert_eq!(bytes.written(), 9);

        far.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        counted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(bytes.read(), 4);
    }

    #[tokio::test]
    async fn read_at_eof_adds_nothing() {
        let bytes = Arc::new(ByteCounters::default());
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let mut counted = CountingStream::new(near, Arc::clone(&bytes));

        let mut buf = [0u8; 16];
        let n = counted.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(bytes.read(), 0);
    }

    #[test]
    fn insecure_verifier_accepts_arbitrary_certificates() {
        use rustls::client::danger::ServerCertVerifier as _;

        let verifier = AcceptAnyServerCert;
        // Not even valid DER; the verifier must still wave it through.
        let cert = rustls::pki_types::CertificateDer::from(vec![0xde, 0xad, 0xbe, 0xef]);
        let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let verdict =
            verifier.verify_server_cert(&cert, &[], &name, &[], rustls::pki_types::UnixTime::now());
        assert!(verdict.is_ok());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn tls_config_carries_the_backend_alpn() {
        let insecure = build_tls_config(
            &Config {
                insecure: true,
                ..Config::default()
            },
            &[b"h2"],
        )
        .unwrap();
        assert_eq!(insecure.alpn_protocols, vec![b"h2".to_vec()]);

        let verifying = build_tls_config(&Config::default(), &[b"http/1.1"]).unwrap();
        assert_eq!(verifying.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn missing_client_cert_files_fail_before_the_run() {
        let config = Config {
            cert_path: Some("/does/not/exist.cert".into()),
            key_path: Some("/does/not/exist.key".into()),
            ..Config::default()
        };
        assert!(matches!(
            build_tls_config(&config, &[]),
            Err(ConfigError::Io { .. })
        ));
    }
}
