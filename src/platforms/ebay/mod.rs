//! eBay marketplace integration.

pub mod adapter;
pub mod auth;
pub mod category;
pub mod client;

pub use adapter::EbayAdapter;
pub use auth::{EbayAuthClient, EbayTokenManager, Environment};
pub use category::CategoryMapper;
pub use client::EbayApiClient;
