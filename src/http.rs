//! Shared reqwest client construction. Every outbound collaborator (search,
//! LLM providers, store) goes through the same timeout policy.

use reqwest::Client;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

pub fn build_client() -> Client {
    let (timeout, connect) = timeouts_from_env();
    Client::builder()
        .user_agent(concat!("argus-api/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .connect_timeout(connect)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn timeouts_from_env() -> (Duration, Duration) {
    let secs = |name: &str, default: u64| {
        std::env::var(name)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(default)
    };
    (
        Duration::from_secs(secs("HTTP_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)),
        Duration::from_secs(secs("HTTP_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)),
    )
}
