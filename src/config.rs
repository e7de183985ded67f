//! Token provider configuration.

use std::{fmt, fs, time::Duration};

use reqwest::Url;
use tracing::warn;

pub const DEFAULT_EXPIRY_BUFFER: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const ENV_TOKEN_ENDPOINT_URI: &str = "OAUTH_TOKEN_ENDPOINT_URI";
pub const ENV_CLIENT_ID: &str = "OAUTH_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "OAUTH_CLIENT_SECRET";
pub const ENV_SCOPE: &str = "OAUTH_SCOPE";
pub const ENV_SSL_CA_LOCATION: &str = "OAUTH_SSL_CA_LOCATION";
pub const ENV_SSL_REJECT_UNAUTHORIZED: &str = "OAUTH_SSL_REJECT_UNAUTHORIZED";
pub const ENV_TOKEN_EXPIRY_BUFFER: &str = "OAUTH_TOKEN_EXPIRY_BUFFER";
pub const ENV_TOKEN_REQUEST_TIMEOUT: &str = "OAUTH_TOKEN_REQUEST_TIMEOUT";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid token endpoint {uri:?}: {reason}")]
    InvalidEndpoint { uri: String, reason: String },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("unable to read CA certificate {path}: {source}")]
    ReadCertificate {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CA certificate: {0}")]
    InvalidCertificate(#[source] reqwest::Error),
    #[error("http client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Everything needed to run the client credentials flow against one
/// authorization server. Immutable once built.
#[derive(Clone)]
pub struct TokenProviderConfig {
    token_endpoint: Url,
    client_id: String,
    client_secret: String,
    scope: Option<String>,
    tls_trust_anchor: Option<Vec<u8>>,
    tls_verify: bool,
    expiry_buffer: u64,
    request_timeout: Duration,
}

impl TokenProviderConfig {
    pub fn new(
        token_endpoint: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, Error> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();

        if token_endpoint.trim().is_empty() {
            return Err(Error::Missing("token endpoint"));
        }
        if client_id.is_empty() {
            return Err(Error::Missing("client id"));
        }
        if client_secret.is_empty() {
            return Err(Error::Missing("client secret"));
        }

        Ok(Self {
            token_endpoint: parse_endpoint(token_endpoint)?,
            client_id,
            client_secret,
            scope: None,
            tls_trust_anchor: None,
            tls_verify: true,
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Load the configuration from `OAUTH_*` environment variables.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration from an arbitrary key/value source, using the
    /// same keys as [`TokenProviderConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let token_endpoint = get(ENV_TOKEN_ENDPOINT_URI).ok_or(Error::Missing("token endpoint"))?;
        let client_id = get(ENV_CLIENT_ID).ok_or(Error::Missing("client id"))?;
        let client_secret = get(ENV_CLIENT_SECRET).ok_or(Error::Missing("client secret"))?;

        let mut config = Self::new(&token_endpoint, client_id, client_secret)?;

        if let Some(scope) = get(ENV_SCOPE) {
            config = config.with_scope(scope);
        }
        if let Some(path) = get(ENV_SSL_CA_LOCATION) {
            let pem = fs::read(&path).map_err(|source| Error::ReadCertificate { path, source })?;
            config = config.with_trust_anchor(pem);
        }
        if let Some(reject_unauthorized) = get(ENV_SSL_REJECT_UNAUTHORIZED) {
            config = config.with_tls_verify(!reject_unauthorized.eq_ignore_ascii_case("false"));
        }
        if let Some(buffer) = get(ENV_TOKEN_EXPIRY_BUFFER) {
            config = config.with_expiry_buffer(parse_seconds(ENV_TOKEN_EXPIRY_BUFFER, buffer)?);
        }
        if let Some(timeout) = get(ENV_TOKEN_REQUEST_TIMEOUT) {
            let timeout = parse_seconds(ENV_TOKEN_REQUEST_TIMEOUT, timeout)?;
            config = config.with_request_timeout(Duration::from_secs(timeout));
        }

        Ok(config)
    }

    /// An empty scope is the same as no scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        self.scope = (!scope.is_empty()).then_some(scope);
        self
    }

    /// PEM encoded CA certificate trusted for the token endpoint, on top of
    /// the system roots.
    #[must_use]
    pub fn with_trust_anchor(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.tls_trust_anchor = Some(pem.into());
        self
    }

    /// Turning verification off makes the provider accept any certificate
    /// the token endpoint presents, including self-signed and expired ones,
    /// and leaves the client credentials open to interception. Only meant
    /// for throwaway test environments.
    #[must_use]
    pub fn with_tls_verify(mut self, tls_verify: bool) -> Self {
        self.tls_verify = tls_verify;
        self
    }

    #[must_use]
    pub fn with_expiry_buffer(mut self, seconds: u64) -> Self {
        self.expiry_buffer = seconds;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    pub fn expiry_buffer(&self) -> u64 {
        self.expiry_buffer
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Build the HTTP client used to reach the token endpoint, with the
    /// configured trust anchor, verification mode and timeout applied.
    pub fn http_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder().timeout(self.request_timeout);

        if let Some(pem) = &self.tls_trust_anchor {
            let certificate =
                reqwest::Certificate::from_pem(pem).map_err(Error::InvalidCertificate)?;
            builder = builder.add_root_certificate(certificate);
        }

        if !self.tls_verify {
            warn!(
                message = "TLS certificate verification is disabled for the token endpoint",
                token_endpoint = %self.token_endpoint,
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().map_err(Error::HttpClient)
    }
}

impl fmt::Debug for TokenProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProviderConfig")
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .field("tls_trust_anchor", &self.tls_trust_anchor.is_some())
            .field("tls_verify", &self.tls_verify)
            .field("expiry_buffer", &self.expiry_buffer)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn parse_endpoint(uri: &str) -> Result<Url, Error> {
    let invalid = |reason: String| Error::InvalidEndpoint {
        uri: uri.to_owned(),
        reason,
    };

    let url = Url::parse(uri).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_owned()));
    }
    Ok(url)
}

fn parse_seconds(key: &'static str, value: String) -> Result<u64, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidValue { key, value })
}
