//! Redis-backed idempotency replay for `/scans`. A completed response is
//! stored under the caller's `Idempotency-Key` and served back verbatim on
//! retries until the TTL lapses. Redis being down degrades to re-running the
//! scan, never to an error.

use crate::models::ScanResponse;
use redis::AsyncCommands;
use tracing::debug;

fn storage_key(key: &str) -> String {
    format!("argus:idem:{key}")
}

pub async fn redis_get(client: &redis::Client, key: &str) -> Option<ScanResponse> {
    let mut conn = client.get_multiplexed_async_connection().await.ok()?;
    let stored: Option<String> = conn.get(storage_key(key)).await.ok()?;
    let response = stored.and_then(|raw| serde_json::from_str(&raw).ok());
    if response.is_some() {
        debug!(target = "argus.api", key = key, "idempotent replay");
    }
    response
}

pub async fn redis_set(client: &redis::Client, key: &str, value: &ScanResponse, ttl_secs: usize) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(storage_key(key), json, ttl_secs as u64).await;
    }
}
