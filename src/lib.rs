//! OAuth2 client credentials tokens for SASL/OAUTHBEARER broker connections.

pub mod auth;
pub mod config;
pub mod sasl;

pub use auth::bearer::{OAuth2TokenProvider, OAuthBearerToken};
pub use config::TokenProviderConfig;
