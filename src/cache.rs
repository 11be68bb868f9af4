//! Shared research cache keyed by (brand, normalized style code). Decoded
//! style info never expires; market-data snapshots go stale after seven days.
//! Reads are concurrent; writes are per-key upserts with last-writer-wins on
//! market data and never-downgrade on decodes.

use crate::decoder;
use crate::models::{DecodedStyleInfo, MarketDataSnapshot};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

pub const MARKET_DATA_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub decoded: Option<DecodedStyleInfo>,
    pub market_data: Option<MarketDataSnapshot>,
    pub hit_count: u64,
    pub last_hit_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub decoded: Option<DecodedStyleInfo>,
    pub market_data: Option<MarketDataSnapshot>,
    pub cache_hit: bool,
    pub market_data_fresh: bool,
}

#[derive(Default)]
pub struct ResearchCache {
    entries: RwLock<HashMap<(String, String), CacheEntry>>,
}

fn cache_key(brand: &str, code: &str) -> (String, String) {
    (
        brand.trim().to_lowercase(),
        decoder::normalize_code(code),
    )
}

fn is_fresh(snapshot: &MarketDataSnapshot, now: DateTime<Utc>) -> bool {
    now - snapshot.updated_at < Duration::days(MARKET_DATA_TTL_DAYS)
}

impl ResearchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode info is computed on the fly on a miss, so first-time lookups are
    /// never cold with respect to decoding; only market-data freshness is a
    /// true cache concern. Stale market data is still returned, flagged.
    pub fn lookup(&self, brand: &str, code: &str) -> CacheLookup {
        let key = cache_key(brand, code);
        let now = Utc::now();

        if let Ok(guard) = self.entries.read()
            && let Some(entry) = guard.get(&key)
        {
            let market_data_fresh = entry
                .market_data
                .as_ref()
                .map(|snapshot| is_fresh(snapshot, now))
                .unwrap_or(false);
            let decoded = entry
                .decoded
                .clone()
                .or_else(|| decoder::decode(brand, code));
            return CacheLookup {
                decoded,
                market_data: entry.market_data.clone(),
                cache_hit: true,
                market_data_fresh,
            };
        }

        let decoded = decoder::decode(brand, code);
        if let Some(info) = decoded.clone()
            && let Ok(mut guard) = self.entries.write()
        {
            let entry = guard.entry(key).or_default();
            if entry.decoded.is_none() {
                entry.decoded = Some(info);
            }
        }
        CacheLookup {
            decoded,
            market_data: None,
            cache_hit: false,
            market_data_fresh: false,
        }
    }

    /// Upsert a market snapshot, merging `decoded` only if no decode exists
    /// yet. A decode, once recorded, is never overwritten by a later, possibly
    /// absent or lower-confidence one.
    pub fn cache_market_data(
        &self,
        brand: &str,
        code: &str,
        decoded: Option<DecodedStyleInfo>,
        snapshot: MarketDataSnapshot,
    ) {
        let key = cache_key(brand, code);
        match self.entries.write() {
            Ok(mut guard) => {
                let entry = guard.entry(key).or_default();
                if entry.decoded.is_none() {
                    entry.decoded = decoded;
                }
                entry.market_data = Some(snapshot);
            }
            Err(err) => {
                warn!(target = "argus.cache", error = %err, "cache write lock poisoned");
            }
        }
    }

    /// Analytics-only counter; must never fail the calling operation.
    pub fn record_hit(&self, brand: &str, code: &str) {
        let key = cache_key(brand, code);
        if let Ok(mut guard) = self.entries.write() {
            let entry = guard.entry(key).or_default();
            entry.hit_count += 1;
            entry.last_hit_at = Some(Utc::now());
        }
    }

    /// Clear market data (not the whole entry) for up to `batch_limit` entries
    /// whose snapshot is past the TTL. Decode info survives indefinitely.
    pub fn sweep_stale(&self, batch_limit: usize) -> usize {
        let now = Utc::now();
        let Ok(mut guard) = self.entries.write() else {
            return 0;
        };
        let stale: Vec<(String, String)> = guard
            .iter()
            .filter(|(_, entry)| {
                entry
                    .market_data
                    .as_ref()
                    .map(|snapshot| !is_fresh(snapshot, now))
                    .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .take(batch_limit)
            .collect();
        for key in &stale {
            if let Some(entry) = guard.get_mut(key) {
                entry.market_data = None;
            }
        }
        if !stale.is_empty() {
            debug!(
                target = "argus.cache",
                cleared = stale.len(),
                "swept stale market data"
            );
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn entry(&self, brand: &str, code: &str) -> Option<CacheEntry> {
        let key = cache_key(brand, code);
        self.entries.read().ok()?.get(&key).cloned()
    }
}
