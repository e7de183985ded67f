//! Entry point for SASL/OAUTHBEARER callbacks.
//!
//! Broker clients ask for a bearer token on every new connection and again
//! whenever the SASL session needs to re-authenticate. [`BearerAdapter`] hands
//! them the cached token while it is fresh and refreshes it otherwise.

use std::sync::Arc;

use super::{
    client_credentials::{self, ClientCredentials},
    clock::Clock,
    token_manager::{self, Diagnostics, Record, TokenManager},
    ExpiringToken, TokenProvider,
};
use crate::config::{self, TokenProviderConfig};

/// What a SASL/OAUTHBEARER callback hands back to the broker client.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthBearerToken {
    /// The bearer token itself.
    pub value: String,
    pub principal_name: String,
    /// Milliseconds until the authorization server stops accepting the token.
    pub lifetime_ms: i64,
}

impl std::fmt::Debug for OAuthBearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthBearerToken")
            .field("value", &"<redacted>")
            .field("principal_name", &self.principal_name)
            .field("lifetime_ms", &self.lifetime_ms)
            .finish()
    }
}

pub struct BearerAdapter<Provider>
where
    Provider: TokenProvider,
{
    manager: TokenManager<Provider>,
    principal_name: String,
}

/// Bearer adapter backed by the OAuth2 client credentials flow.
pub type OAuth2TokenProvider = BearerAdapter<ClientCredentials>;

pub type Error = token_manager::Error<client_credentials::Error>;

impl BearerAdapter<ClientCredentials> {
    /// Wire the client credentials flow, the token cache and the adapter
    /// together from one configuration.
    pub fn from_config(config: TokenProviderConfig) -> Result<Self, config::Error> {
        let expiry_buffer = config.expiry_buffer();
        let principal_name = config.client_id().to_owned();
        let flow = ClientCredentials::new(config)?;
        let manager = TokenManager::new(flow).with_expiry_buffer(expiry_buffer);
        Ok(Self::new(manager, principal_name))
    }

    /// Same as [`BearerAdapter::from_config`] with the configuration read
    /// from the environment.
    pub fn from_env() -> Result<Self, config::Error> {
        Self::from_config(TokenProviderConfig::from_env()?)
    }
}

impl<Provider> BearerAdapter<Provider>
where
    Provider: TokenProvider,
    <Provider as TokenProvider>::Token: ExpiringToken,
{
    pub fn new(manager: TokenManager<Provider>, principal_name: impl Into<String>) -> Self {
        Self {
            manager,
            principal_name: principal_name.into(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.manager = self.manager.with_clock(clock);
        self
    }

    pub fn token_manager(&self) -> &TokenManager<Provider> {
        &self.manager
    }

    pub fn principal_name(&self) -> &str {
        &self.principal_name
    }

    /// Produce the token for a SASL/OAUTHBEARER handshake.
    ///
    /// Errors are returned as-is: without a token the connection attempt
    /// has to fail rather than go on unauthenticated.
    pub async fn generate_token(
        &self,
    ) -> Result<OAuthBearerToken, token_manager::Error<Provider::Error>> {
        let record = self.manager.get_token().await?;
        Ok(self.wrap(record))
    }

    fn wrap(&self, record: Record) -> OAuthBearerToken {
        let lifetime_ms = record.expires_in(self.manager.now()).saturating_mul(1000);
        OAuthBearerToken {
            value: record.access_token,
            principal_name: self.principal_name.clone(),
            lifetime_ms,
        }
    }

    pub async fn get_token(&self) -> Result<String, token_manager::Error<Provider::Error>> {
        let record = self.manager.get_token().await?;
        Ok(record.access_token)
    }

    pub fn is_valid(&self, now: u64) -> bool {
        self.manager.is_valid(now)
    }

    pub fn clear_cache(&self) {
        self.manager.clear_cache();
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.manager.diagnostics()
    }
}
