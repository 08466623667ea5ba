//! Access-token broker, permission validator, Graph request executor and
//! configuration self-test for Microsoft 365 / Azure AD integrations.

pub mod auth;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod permissions;
pub mod rest;

pub use config::Config;
pub use context::{Capabilities, Capability, Principal, RequestContext};
pub use error::{BrokerError, StoreError};
