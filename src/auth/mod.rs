//! Azure AD authentication module.
//!
//! Provides the OAuth2 client, access token model, token persistence and the
//! broker that hands out cached delegated and application-only tokens.

pub mod broker;
pub mod credentials;
pub mod oauth;
pub mod secure;
pub mod store;
pub mod token;

pub use broker::TokenBroker;
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use token::{AccessToken, TokenKind};
