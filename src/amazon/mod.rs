//! Amazon SP-API integration: credentials, request pacing, and the
//! catalog/pricing client.

pub mod config;
pub mod rate_limit;
pub mod sp_api;

pub use config::SpApiCredentials;
pub use rate_limit::{EndpointClass, RateLimiter};
pub use sp_api::{SpApiClient, MARKETPLACE_ID_JP};
