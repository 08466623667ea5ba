//! Microsoft Graph integration.
//!
//! Endpoint allowlisting, request/response types and the request executor.

pub mod client;
pub mod endpoint;
pub mod request;

pub use client::GraphClient;
pub use endpoint::{EndpointAccess, EndpointPolicy};
pub use request::{GraphRequest, GraphResponse, HttpMethod};
