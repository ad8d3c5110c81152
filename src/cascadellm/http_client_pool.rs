//! Shared HTTP clients, one per provider base URL.
//!
//! Sibling agents hit the same provider endpoint concurrently; reusing a
//! pooled `reqwest::Client` per base URL keeps connections warm instead of
//! paying DNS/TLS setup on every inference call.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::time::Duration;

static CLIENT_POOL: Lazy<DashMap<String, reqwest::Client>> = Lazy::new(DashMap::new);

/// Get the shared client for `base_url`, creating it on first use. The
/// returned clone shares the underlying connection pool.
pub fn get_or_create_client(base_url: &str) -> reqwest::Client {
    CLIENT_POOL
        .entry(base_url.to_string())
        .or_insert_with(create_pooled_client)
        .clone()
}

fn create_pooled_client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build HTTP client")
}
