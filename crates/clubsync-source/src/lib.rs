//! # ClubSync Source
//!
//! Client for the rate-limited external platforms a collection task polls.
//! Responses are cached per (key, platform[, task type]) for a fixed TTL to
//! keep call volume against upstream bounded.

pub mod cache;
pub mod client;

pub use cache::ResponseCache;
pub use client::HttpDataSource;
