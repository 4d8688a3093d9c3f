//! Run configuration and its validation.
//!
//! A `Config` is assembled by the CLI layer (or directly by tests) and must
//! pass `validate` before a run is constructed. Validation normalizes the
//! URL, picks the default timed mode when neither a request count nor a
//! duration is given, and rejects every malformed combination up front so
//! the run itself never has to fail.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use http::Method;
use url::Url;

use crate::output::OutputFormat;

pub const DEFAULT_CONNECTIONS: u64 = 125;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_TEST_DURATION: Duration = Duration::from_secs(10);

/// Methods the generator will emit.
const ALLOWED_METHODS: [&str; 9] = [
    "CONNECT", "DELETE", "GET", "HEAD", "OPTIONS", "PATCH", "POST", "PUT", "TRACE",
];

/// Methods that must not carry a request body.
const BODYLESS_METHODS: [&str; 2] = ["GET", "HEAD"];

/// Which HTTP backend executes the requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientKind {
    /// Hand-framed HTTP/1.1 over a fixed connection pool.
    #[default]
    Fast,
    /// Standard HTTP/1.1 client, one request per connection at a time.
    Http1,
    /// HTTP/2 client multiplexing streams over a single connection.
    Http2,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKind::Fast => write!(f, "fasthttp"),
            ClientKind::Http1 => write!(f, "http/1.1"),
            ClientKind::Http2 => write!(f, "http/2"),
        }
    }
}

/// How the run terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Counted(u64),
    Timed(Duration),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub url: String,
    pub method: Method,
    /// Ordered header list; duplicates are preserved.
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub body_file: Option<PathBuf>,
    /// Send the body with chunked transfer encoding from a producer.
    pub stream: bool,
    pub connections: u64,
    pub num_reqs: Option<u64>,
    pub duration: Option<Duration>,
    pub timeout: Duration,
    /// Target request rate; enables the token bucket.
    pub rate: Option<u64>,
    pub client_kind: ClientKind,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub insecure: bool,
    pub print_intro: bool,
    pub print_progress: bool,
    pub print_result: bool,
    pub print_latencies: bool,
    pub format: OutputFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: Method::GET,
            headers: Vec::new(),
            body: String::new(),
            body_file: None,
            stream: false,
            connections: DEFAULT_CONNECTIONS,
            num_reqs: None,
            duration: None,
            timeout: DEFAULT_TIMEOUT,
            rate: None,
            client_kind: ClientKind::default(),
            cert_path: None,
            key_path: None,
            insecure: false,
            print_intro: false,
            print_progress: false,
            print_result: false,
            print_latencies: false,
            format: OutputFormat::PlainText,
        }
    }
}

impl Config {
    /// Run the full check chain, normalizing the URL and defaulting to a
    /// timed run when no termination mode was chosen.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.num_reqs.is_none() && self.duration.is_none() {
            self.duration = Some(DEFAULT_TEST_DURATION);
        }
        self.check_url()?;
        self.check_rate()?;
        self.check_run_parameters()?;
        self.check_http_parameters()?;
        self.check_cert_paths()?;
        Ok(())
    }

    pub fn test_kind(&self) -> TestKind {
        match self.num_reqs {
            Some(n) => TestKind::Counted(n),
            None => TestKind::Timed(self.duration.unwrap_or(DEFAULT_TEST_DURATION)),
        }
    }

    fn check_url(&mut self) -> Result<(), ConfigError> {
        let candidate = if self.url.contains("://") {
            self.url.clone()
        } else {
            format!("http://{}", self.url)
        };
        let parsed =
            Url::parse(&candidate).map_err(|_| ConfigError::InvalidUrl(self.url.clone()))?;
        let scheme_ok = parsed.scheme() == "http" || parsed.scheme() == "https";
        if !scheme_ok || parsed.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidUrl(self.url.clone()));
        }
        self.url = parsed.to_string();
        Ok(())
    }

    fn check_rate(&self) -> Result<(), ConfigError> {
        if let Some(rate) = self.rate
            && rate < 1
        {
            return Err(ConfigError::ZeroRate);
        }
        Ok(())
    }

    fn check_run_parameters(&self) -> Result<(), ConfigError> {
        if self.connections < 1 {
            return Err(ConfigError::InvalidNumberOfConns);
        }
        match self.test_kind() {
            TestKind::Counted(n) if n < 1 => Err(ConfigError::InvalidNumberOfRequests),
            TestKind::Timed(d) if d < Duration::from_secs(1) => {
                Err(ConfigError::InvalidTestDuration)
            }
            _ => Ok(()),
        }
    }

    fn check_http_parameters(&self) -> Result<(), ConfigError> {
        let method = self.method.as_str();
        if !ALLOWED_METHODS.contains(&method) {
            return Err(ConfigError::UnknownMethod(method.to_owned()));
        }
        let has_body = !self.body.is_empty() || self.body_file.is_some();
        if BODYLESS_METHODS.contains(&method) && has_body {
            return Err(ConfigError::BodyNotAllowed(method.to_owned()));
        }
        if !self.body.is_empty() && self.body_file.is_some() {
            return Err(ConfigError::BodyProvidedTwice);
        }
        Ok(())
    }

    fn check_cert_paths(&self) -> Result<(), ConfigError> {
        match (&self.cert_path, &self.key_path) {
            (Some(_), None) => Err(ConfigError::NoPathToKey),
            (None, Some(_)) => Err(ConfigError::NoPathToCert),
            _ => Ok(()),
        }
    }
}

/// Fatal configuration problems, reported before any worker starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid url: {0:?}")]
    InvalidUrl(String),
    #[error("rate must be at least one request per second")]
    ZeroRate,
    #[error("connection count must be at least one")]
    InvalidNumberOfConns,
    #[error("request count must be at least one")]
    InvalidNumberOfRequests,
    #[error("test duration must be at least one second")]
    InvalidTestDuration,
    #[error("unknown HTTP method: {0}")]
    UnknownMethod(String),
    #[error("{0} requests cannot carry a body")]
    BodyNotAllowed(String),
    #[error("both an inline body and a body file are specified")]
    BodyProvidedTwice,
    #[error("client certificate is specified without a key")]
    NoPathToKey,
    #[error("client key is specified without a certificate")]
    NoPathToCert,
    #[error("invalid header {0:?}, expected \"key: value\"")]
    InvalidHeader(String),
    #[error("invalid print spec {0:?}, expected a subset of \"intro,progress,result\"")]
    InvalidPrintSpec(String),
    #[error("unknown output format {0:?}")]
    UnknownFormat(String),
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("tls setup failed: {0}")]
    Tls(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            url: "http://localhost:8080".into(),
            num_reqs: Some(10),
            connections: 2,
            ..Config::default()
        }
    }

    #[test]
    fn accepts_a_minimal_config() {
        let mut c = valid();
        assert!(c.validate().is_ok());
        assert_eq!(c.test_kind(), TestKind::Counted(10));
    }

    #[test]
    fn defaults_to_a_timed_run() {
        let mut c = Config {
            url: "localhost:8080".into(),
            ..Config::default()
        };
        c.validate().unwrap();
        assert_eq!(c.test_kind(), TestKind::Timed(DEFAULT_TEST_DURATION));
        // Scheme defaulted to http during normalization.
        assert!(c.url.starts_with("http://localhost:8080"));
    }

    #[test]
    fn rejects_bad_urls() {
        for url in ["", "ftp://host/file", "http://"] {
            let mut c = Config {
                url: url.into(),
                ..valid()
            };
            assert!(
                matches!(c.validate(), Err(ConfigError::InvalidUrl(_))),
                "url: {url:?}"
            );
        }
    }

    #[test]
    fn rejects_zero_rate() {
        let mut c = Config {
            rate: Some(0),
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::ZeroRate)));
    }

    #[test]
    fn rejects_degenerate_run_parameters() {
        let mut c = Config {
            connections: 0,
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::InvalidNumberOfConns)));

        let mut c = Config {
            num_reqs: Some(0),
            ..valid()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::InvalidNumberOfRequests)
        ));

        let mut c = Config {
            num_reqs: None,
            duration: Some(Duration::from_millis(500)),
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::InvalidTestDuration)));
    }

    #[test]
    fn rejects_unknown_methods() {
        let mut c = Config {
            method: Method::from_bytes(b"gET").unwrap(),
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::UnknownMethod(_))));
    }

    #[test]
    fn rejects_bodies_on_bodyless_methods() {
        let mut c = Config {
            method: Method::GET,
            body: "payload".into(),
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::BodyNotAllowed(_))));

        let mut c = Config {
            method: Method::HEAD,
            body_file: Some("body.txt".into()),
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::BodyNotAllowed(_))));
    }

    #[test]
    fn rejects_body_provided_twice() {
        let mut c = Config {
            method: Method::POST,
            body: "inline".into(),
            body_file: Some("body.txt".into()),
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::BodyProvidedTwice)));
    }

    #[test]
    fn rejects_unpaired_tls_material() {
        let mut c = Config {
            cert_path: Some("client.cert".into()),
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::NoPathToKey)));

        let mut c = Config {
            key_path: Some("client.key".into()),
            ..valid()
        };
        assert!(matches!(c.validate(), Err(ConfigError::NoPathToCert)));
    }

    #[test]
    fn post_with_inline_body_is_fine() {
        let mut c = Config {
            method: Method::POST,
            body: "abracadabra".into(),
            ..valid()
        };
        assert!(c.validate().is_ok());
    }
}
