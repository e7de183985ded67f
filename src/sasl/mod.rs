//! SASL credential selection for broker connections.
//!
//! Static username/password mechanisms and OAUTHBEARER both sit behind
//! [`CredentialProvider`], so the transport asks for credentials the same way
//! regardless of how they are produced.

use std::{fmt, str::FromStr};

use crate::{
    auth::{
        bearer::{BearerAdapter, OAuth2TokenProvider, OAuthBearerToken},
        token_manager::Diagnostics,
        ExpiringToken, TokenProvider,
    },
    config::{self, TokenProviderConfig},
};

pub const ENV_SASL_MECHANISM: &str = "KAFKA_SASL_MECHANISM";
pub const ENV_OAUTH_ENABLED: &str = "OAUTH_ENABLED";
pub const ENV_USERNAME: &str = "KAFKA_USERNAME";
pub const ENV_PASSWORD: &str = "KAFKA_PASSWORD";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported SASL mechanism {0:?}")]
    UnsupportedMechanism(String),
    #[error("SASL mechanism oauthbearer requires OAUTH_ENABLED=true")]
    OAuthDisabled,
    #[error("oauth configuration: {0}")]
    Config(#[from] config::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    ScramSha256,
    ScramSha512,
    OAuthBearer,
}

impl Mechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::ScramSha256 => "scram-sha-256",
            Self::ScramSha512 => "scram-sha-512",
            Self::OAuthBearer => "oauthbearer",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "scram-sha-256" => Ok(Self::ScramSha256),
            "scram-sha-512" => Ok(Self::ScramSha512),
            "oauthbearer" => Ok(Self::OAuthBearer),
            _ => Err(Error::UnsupportedMechanism(s.to_owned())),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Static { username: String, password: String },
    Bearer(OAuthBearerToken),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static { username, .. } => f
                .debug_struct("Static")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer(token) => f.debug_tuple("Bearer").field(token).finish(),
        }
    }
}

#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    fn mechanism(&self) -> Mechanism;

    /// Credentials for the next connection or re-authentication.
    async fn credentials(&self) -> Result<Credentials, anyhow::Error>;

    /// Token cache state, for providers that cache anything.
    fn diagnostics(&self) -> Option<Diagnostics> {
        None
    }
}

pub struct StaticCredentials {
    pub mechanism: Mechanism,
    pub username: String,
    pub password: String,
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredentials {
    fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    async fn credentials(&self) -> Result<Credentials, anyhow::Error> {
        Ok(Credentials::Static {
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }
}

#[async_trait::async_trait]
impl<Provider> CredentialProvider for BearerAdapter<Provider>
where
    Provider: TokenProvider,
    <Provider as TokenProvider>::Token: ExpiringToken,
    <Provider as TokenProvider>::Error: std::error::Error + 'static,
{
    fn mechanism(&self) -> Mechanism {
        Mechanism::OAuthBearer
    }

    async fn credentials(&self) -> Result<Credentials, anyhow::Error> {
        let token = self.generate_token().await?;
        Ok(Credentials::Bearer(token))
    }

    fn diagnostics(&self) -> Option<Diagnostics> {
        Some(BearerAdapter::diagnostics(self))
    }
}

/// Pick the credential provider described by the environment, if any.
pub fn from_env() -> Result<Option<Box<dyn CredentialProvider>>, Error> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Selection rules, with keys looked up through `lookup`:
///
/// * `KAFKA_SASL_MECHANISM` (default `plain`) names the mechanism;
/// * `oauthbearer` with `OAUTH_ENABLED=true` builds an OAuth2 token provider
///   from the `OAUTH_*` keys;
/// * any other mechanism uses `KAFKA_USERNAME` and `KAFKA_PASSWORD`, and no
///   SASL at all when either is missing.
pub fn from_lookup<F>(lookup: F) -> Result<Option<Box<dyn CredentialProvider>>, Error>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

    let mechanism = match get(ENV_SASL_MECHANISM) {
        Some(mechanism) => mechanism.parse()?,
        None => Mechanism::Plain,
    };

    if mechanism == Mechanism::OAuthBearer {
        if get(ENV_OAUTH_ENABLED).as_deref() != Some("true") {
            return Err(Error::OAuthDisabled);
        }
        let config = TokenProviderConfig::from_lookup(&lookup)?;
        let provider = OAuth2TokenProvider::from_config(config)?;
        return Ok(Some(Box::new(provider)));
    }

    match (get(ENV_USERNAME), get(ENV_PASSWORD)) {
        (Some(username), Some(password)) => Ok(Some(Box::new(StaticCredentials {
            mechanism,
            username,
            password,
        }))),
        _ => Ok(None),
    }
}
