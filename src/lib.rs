pub mod auth;
pub mod client;
pub mod config;
pub mod models;
pub mod operations;

pub use client::{ClientConfig, ClientError, RedditApiError, RedditClient};
