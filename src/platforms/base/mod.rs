//! BASE marketplace integration.

pub mod adapter;
pub mod auth;
pub mod client;

pub use adapter::BaseAdapter;
pub use client::{is_hour_api_limit, BaseApiClient};
