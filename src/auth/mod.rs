//! Authorization logic.

pub mod bearer;
pub mod client_credentials;
pub mod clock;
pub mod token_manager;
mod utils;

#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    type Token: Token;
    type Error: Send + Sync;

    async fn get_auth_token(&self) -> Result<Self::Token, Self::Error>;
}

pub trait Token: Send {
    fn access_token(&self) -> &str;
}

/// A token whose lifetime is known relative to the moment it was issued.
pub trait ExpiringToken: Token {
    /// Seconds the authorization server will keep accepting the token.
    fn expires_in(&self) -> u64;
}
