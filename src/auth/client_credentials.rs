//! Authorize using the client credentials flow.

use serde::{de, Deserialize, Deserializer};
use tracing::debug;

use crate::{
    auth::utils::{check_status, ServerError},
    config::{self, TokenProviderConfig},
};

/// Lifetime assumed when the authorization server does not send `expires_in`.
pub const DEFAULT_EXPIRES_IN: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The token endpoint could not be reached: DNS, connect, TLS handshake,
    /// timeout or a broken response body.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The authorization server answered with a non-2xx status.
    #[error("rejected with {status}: {body}")]
    Rejected { status: u16, body: String },
    /// A 2xx answer that is not a usable token response.
    #[error("malformed token response: {0}")]
    Malformed(String),
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        let ServerError { status_code, body } = err;
        Self::Rejected {
            status: status_code,
            body,
        }
    }
}

pub struct ClientCredentials {
    pub client: reqwest::Client,
    pub config: TokenProviderConfig,
}

impl ClientCredentials {
    /// Set up the flow with an HTTP client built from `config`.
    pub fn new(config: TokenProviderConfig) -> Result<Self, config::Error> {
        let client = config.http_client()?;
        Ok(Self { client, config })
    }

    fn form(&self) -> String {
        let mut params = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id()),
            ("client_secret", self.config.client_secret()),
        ];
        if let Some(scope) = self.config.scope() {
            params.push(("scope", scope));
        }
        // Serializing a flat list of string pairs cannot fail.
        serde_urlencoded::to_string(params).unwrap_or_default()
    }

    /// Perform the client credentials flow.
    pub async fn perform(&self) -> Result<AuthResponse, Error> {
        let req = self
            .client
            .post(self.config.token_endpoint().clone())
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(self.form())
            .build()?;

        debug!(
            message = "Requesting access token",
            token_endpoint = %self.config.token_endpoint(),
            client_id = self.config.client_id(),
        );

        let res = self.client.execute(req).await?;
        let status = res.status();
        let body = res.text().await?;
        let body = check_status(status, body)?;

        parse_response(&body)
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    /// The requested access token.
    access_token: Option<String>,
    /// The amount of time that an access token is valid (in seconds).
    #[serde(default, deserialize_with = "lenient_seconds")]
    expires_in: Option<u64>,
}

/// Some authorization servers send `expires_in` as a string or a float.
#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Integer(u64),
    Float(f64),
    Text(String),
}

fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let from_float = |secs: f64| -> Result<u64, D::Error> {
        (secs.is_finite() && secs >= 0.0)
            .then(|| secs.trunc() as u64)
            .ok_or_else(|| de::Error::custom(format!("invalid expires_in {secs}")))
    };

    match Option::<Seconds>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Seconds::Integer(secs)) => Ok(Some(secs)),
        Some(Seconds::Float(secs)) => from_float(secs).map(Some),
        Some(Seconds::Text(text)) => match text.trim().parse::<u64>() {
            Ok(secs) => Ok(Some(secs)),
            Err(_) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| de::Error::custom(format!("invalid expires_in {text:?}")))
                .and_then(from_float)
                .map(Some),
        },
    }
}

fn parse_response(body: &str) -> Result<AuthResponse, Error> {
    let response: AuthResponse =
        serde_json::from_str(body).map_err(|err| Error::Malformed(err.to_string()))?;
    match response.access_token.as_deref() {
        Some(token) if !token.is_empty() => Ok(response),
        _ => Err(Error::Malformed("no access_token in response".to_owned())),
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: String,
    pub expires_in: u64,
}

impl From<AuthResponse> for Token {
    fn from(auth: AuthResponse) -> Self {
        let AuthResponse {
            access_token,
            expires_in,
        } = auth;
        Self {
            access_token: access_token.unwrap_or_default(),
            expires_in: expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        }
    }
}

#[async_trait::async_trait]
impl super::TokenProvider for ClientCredentials {
    type Token = Token;
    type Error = Error;

    async fn get_auth_token(&self) -> Result<Self::Token, Self::Error> {
        let auth_response = self.perform().await?;
        let token = auth_response.into();
        Ok(token)
    }
}

impl super::Token for Token {
    fn access_token(&self) -> &str {
        self.access_token.as_str()
    }
}

impl super::ExpiringToken for Token {
    fn expires_in(&self) -> u64 {
        self.expires_in
    }
}
