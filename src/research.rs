//! Research orchestration: walks the sold-listings cascade from narrow to
//! broad, runs platform and general queries through the search provider,
//! scores and filters candidates, and merges everything into one
//! `ResearchResult`. A single failed query is logged and skipped; only a scan
//! where every query failed surfaces an error.

use crate::cache::ResearchCache;
use crate::models::{
    DecodedStyleInfo, ExtractedItem, Listing, MarketActivity, MarketDataSnapshot, ResearchResult,
};
use crate::query;
use crate::relevance::{self, CategoryDef, Gender, ScoringConfig};
use crate::search::{SearchClient, SearchError};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("all search queries failed; last error: {0}")]
    AllQueriesFailed(String),
}

#[derive(Debug, Clone)]
pub struct ResearchConfig {
    /// Cascade fallback stops once this many post-filter results exist.
    pub target_relevant: usize,
    /// Fixed inter-query throttle; deliberate, not accidental serialization.
    pub inter_query_delay: Duration,
    pub max_sources: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            target_relevant: 5,
            inter_query_delay: Duration::from_millis(300),
            max_sources: 20,
        }
    }
}

impl ResearchConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(delay) = std::env::var("RESEARCH_QUERY_DELAY_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
        {
            config.inter_query_delay = Duration::from_millis(delay);
        }
        if let Some(target) = std::env::var("RESEARCH_TARGET_RESULTS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
        {
            config.target_relevant = target;
        }
        config
    }
}

pub struct Researcher {
    search: Arc<SearchClient>,
    cache: Arc<ResearchCache>,
    scoring: ScoringConfig,
    config: ResearchConfig,
}

impl Researcher {
    pub fn new(
        search: Arc<SearchClient>,
        cache: Arc<ResearchCache>,
        scoring: ScoringConfig,
        config: ResearchConfig,
    ) -> Self {
        Self {
            search,
            cache,
            scoring,
            config,
        }
    }

    pub async fn run(
        &self,
        item: &ExtractedItem,
        decoded: Option<&DecodedStyleInfo>,
    ) -> Result<ResearchResult, ResearchError> {
        let category = category_for(item, decoded);
        let gender = gender_for_item(item);
        let plan = query::build_queries(&planner_item(item, decoded), category);
        self.run_plan(item, decoded, &plan, category, gender).await
    }

    /// Execute a prebuilt query plan. Callers that already planned (and put
    /// the plan in a transcript) use this to avoid planning twice.
    pub async fn run_plan(
        &self,
        item: &ExtractedItem,
        decoded: Option<&DecodedStyleInfo>,
        plan: &query::QueryPlan,
        mut category: Option<&'static CategoryDef>,
        gender: Option<Gender>,
    ) -> Result<ResearchResult, ResearchError> {
        if plan.is_empty() {
            // Data insufficiency is a low-confidence result, not an error.
            debug!(target = "argus.research", "no queries buildable for item");
            return Ok(ResearchResult::default());
        }

        let mut result = ResearchResult::default();
        let mut inferred: Option<&'static CategoryDef> = None;
        let mut attempted = 0usize;
        let mut succeeded = 0usize;
        let mut last_error = String::new();

        // Primary cascade: narrowest sold-listings query first, broaden only
        // while fewer than the target number of relevant results are on hand.
        for (round, sold_query) in plan.sold_cascade.iter().enumerate() {
            if relevant_count(&result) >= self.config.target_relevant {
                break;
            }
            if round > 0 {
                sleep(self.config.inter_query_delay).await;
            }
            attempted += 1;
            result.search_queries.push(sold_query.clone());
            match self.search.sold_listings(sold_query).await {
                Ok(payload) => {
                    succeeded += 1;
                    let raw = parse_search_payload(&payload, true);
                    let outcome = assess_round(
                        raw,
                        item,
                        category.or(inferred),
                        gender,
                        &self.scoring,
                        true,
                    );
                    if inferred.is_none() && category.is_none() {
                        inferred = outcome.inferred;
                        if let Some(def) = inferred {
                            info!(
                                target = "argus.research",
                                category = def.name,
                                "category inferred from exact style match"
                            );
                        }
                    }
                    merge_round(&mut result, outcome);
                }
                Err(err) => {
                    last_error = err.to_string();
                    log_query_failure(sold_query, &err);
                }
            }
        }
        // A category inferred during the cascade applies to every later round.
        if category.is_none() {
            category = inferred;
        }

        for search_query in plan.platform_specific.iter().chain(plan.general.iter()) {
            sleep(self.config.inter_query_delay).await;
            attempted += 1;
            result.search_queries.push(search_query.clone());
            match self.search.web_search(search_query).await {
                Ok(payload) => {
                    succeeded += 1;
                    let raw = parse_search_payload(&payload, false);
                    let outcome =
                        assess_round(raw, item, category, gender, &self.scoring, false);
                    merge_round(&mut result, outcome);
                }
                Err(err) => {
                    last_error = err.to_string();
                    log_query_failure(search_query, &err);
                }
            }
        }

        if attempted > 0 && succeeded == 0 {
            return Err(ResearchError::AllQueriesFailed(last_error));
        }

        finalize(&mut result, inferred, self.config.max_sources);
        result.brand_info = brand_summary(decoded);

        if let (Some(brand), Some(style)) = (item.brand_trimmed(), item.style_number_trimmed())
            && let Some(snapshot) = snapshot_from(&result)
        {
            self.cache
                .cache_market_data(brand, style, decoded.cloned(), snapshot);
        }

        info!(
            target = "argus.research",
            listings = result.listings.len(),
            sold = result.sold_listings.len(),
            queries = result.search_queries.len(),
            "research complete"
        );
        Ok(result)
    }
}

fn log_query_failure(query: &str, err: &SearchError) {
    warn!(
        target = "argus.research",
        query = query,
        error = %err,
        "query failed, continuing with remaining queries"
    );
}

/// Category from extraction first, decoder output second.
pub fn category_for(
    item: &ExtractedItem,
    decoded: Option<&DecodedStyleInfo>,
) -> Option<&'static CategoryDef> {
    relevance::category_for_item(item).or_else(|| {
        decoded
            .and_then(|info| info.category.as_deref())
            .and_then(|name| relevance::detect_category(&[name]))
    })
}

/// Decoder-derived search terms feed the planner alongside the AI suggestions
/// from extraction.
pub fn planner_item(item: &ExtractedItem, decoded: Option<&DecodedStyleInfo>) -> ExtractedItem {
    let mut enriched = item.clone();
    if let Some(info) = decoded {
        for term in &info.search_terms {
            if !enriched.search_suggestions.contains(term) {
                enriched.search_suggestions.push(term.clone());
            }
        }
    }
    enriched
}

pub fn gender_for_item(item: &ExtractedItem) -> Option<Gender> {
    item.gender
        .as_deref()
        .and_then(relevance::detect_gender)
        .or_else(|| item.raw_text.as_deref().and_then(relevance::detect_gender))
}

fn relevant_count(result: &ResearchResult) -> usize {
    result.listings.len() + result.sold_listings.len()
}

/// One query round: optionally infer a category from an exact style hit, then
/// score and keep listings at or above the relevance threshold.
pub struct RoundOutcome {
    pub kept_active: Vec<Listing>,
    pub kept_sold: Vec<Listing>,
    pub inferred: Option<&'static CategoryDef>,
}

pub fn assess_round(
    raw: Vec<Listing>,
    item: &ExtractedItem,
    category: Option<&'static CategoryDef>,
    gender: Option<Gender>,
    scoring: &ScoringConfig,
    assume_sold: bool,
) -> RoundOutcome {
    let inferred = if category.is_none() {
        item.style_number_trimmed()
            .and_then(|style| relevance::infer_category_from_listings(style, &raw))
    } else {
        None
    };
    let effective = category.or(inferred);

    let mut kept_active = Vec::new();
    let mut kept_sold = Vec::new();
    for mut listing in raw {
        let scored = relevance::score_listing(&listing, item, effective, gender, scoring);
        if scored.score < scoring.min_relevance {
            continue;
        }
        listing.relevance_score = Some(scored.score);
        if assume_sold || is_sold_listing(&listing) {
            kept_sold.push(listing);
        } else {
            kept_active.push(listing);
        }
    }
    RoundOutcome {
        kept_active,
        kept_sold,
        inferred,
    }
}

fn merge_round(result: &mut ResearchResult, outcome: RoundOutcome) {
    result.listings.extend(outcome.kept_active);
    result.sold_listings.extend(outcome.kept_sold);
}

/// Dedup by URL (keeping the best score), sort by relevance then price, and
/// collect the capped source list.
pub fn finalize(result: &mut ResearchResult, inferred: Option<&CategoryDef>, max_sources: usize) {
    result.listings = dedupe_by_url(std::mem::take(&mut result.listings));
    result.sold_listings = dedupe_by_url(std::mem::take(&mut result.sold_listings));
    sort_listings(&mut result.listings);
    sort_listings(&mut result.sold_listings);

    let mut sources = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for listing in result.sold_listings.iter().chain(result.listings.iter()) {
        if seen.insert(listing.url.clone()) {
            sources.push(listing.url.clone());
            if sources.len() >= max_sources {
                break;
            }
        }
    }
    result.sources = sources;
    result.inferred_category = inferred.map(|def| def.name.to_string());
}

fn dedupe_by_url(listings: Vec<Listing>) -> Vec<Listing> {
    let mut best: HashMap<String, Listing> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for listing in listings {
        match best.get(&listing.url) {
            Some(existing)
                if existing.relevance_score.unwrap_or(0.0)
                    >= listing.relevance_score.unwrap_or(0.0) => {}
            Some(_) => {
                best.insert(listing.url.clone(), listing);
            }
            None => {
                order.push(listing.url.clone());
                best.insert(listing.url.clone(), listing);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|url| best.remove(&url))
        .collect()
}

fn sort_listings(listings: &mut [Listing]) {
    listings.sort_by(|a, b| {
        let by_score = b
            .relevance_score
            .unwrap_or(0.0)
            .total_cmp(&a.relevance_score.unwrap_or(0.0));
        by_score.then_with(|| b.price.total_cmp(&a.price))
    });
}

fn brand_summary(decoded: Option<&DecodedStyleInfo>) -> Option<String> {
    let info = decoded?;
    let line = info.product_line.as_deref()?;
    match info.category.as_deref() {
        Some(category) => Some(format!("{} {line} ({category})", info.brand)),
        None => Some(format!("{} {line}", info.brand)),
    }
}

// ---------------------------------------------------------------------------
// Provider payload parsing. The search API is untyped JSON; take structured
// price fields first and fall back to a currency-symbol scan over free text.

static PRICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([$£€])\s*([0-9][0-9,]*(?:\.[0-9]{1,2})?)").expect("price regex"));

pub fn parse_search_payload(payload: &Value, assume_sold: bool) -> Vec<Listing> {
    let mut listings = Vec::new();
    for key in ["organic_results", "shopping_results", "completed_results"] {
        let Some(entries) = payload.get(key).and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            if let Some(listing) = parse_result_entry(entry, assume_sold) {
                listings.push(listing);
            }
        }
    }
    listings
}

fn parse_result_entry(entry: &Value, assume_sold: bool) -> Option<Listing> {
    let title = entry
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?
        .to_string();
    let url = entry
        .get("link")
        .or_else(|| entry.get("url"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?
        .to_string();

    let (price, currency) = entry
        .get("price")
        .or_else(|| entry.get("extracted_price"))
        .and_then(price_from_value)
        .or_else(|| {
            entry
                .get("snippet")
                .and_then(Value::as_str)
                .and_then(price_from_text)
        })
        .unwrap_or((0.0, "USD".to_string()));

    let condition = entry
        .get("condition")
        .and_then(Value::as_str)
        .map(str::to_string);
    let sold_date = entry
        .get("sold_date")
        .or_else(|| entry.get("date"))
        .and_then(Value::as_str)
        .filter(|_| assume_sold)
        .map(str::to_string);

    Some(Listing {
        platform: platform_from_url(&url),
        title,
        price: price.max(0.0),
        currency,
        url,
        condition,
        sold_date,
        relevance_score: None,
    })
}

fn price_from_value(value: &Value) -> Option<(f64, String)> {
    match value {
        Value::Number(number) => number.as_f64().map(|price| (price, "USD".to_string())),
        Value::String(text) => price_from_text(text),
        Value::Object(map) => {
            for key in ["extracted_value", "extracted", "value", "from"] {
                if let Some(inner) = map.get(key)
                    && let Some(parsed) = price_from_value(inner)
                {
                    return Some(parsed);
                }
            }
            map.get("raw").and_then(price_from_value)
        }
        _ => None,
    }
}

pub fn price_from_text(text: &str) -> Option<(f64, String)> {
    let captures = PRICE_RE.captures(text)?;
    let currency = match &captures[1] {
        "£" => "GBP",
        "€" => "EUR",
        _ => "USD",
    };
    let amount: f64 = captures[2].replace(',', "").parse().ok()?;
    Some((amount, currency.to_string()))
}

pub fn platform_from_url(url: &str) -> String {
    let lowered = url.to_lowercase();
    for (needle, name) in [
        ("ebay.", "eBay"),
        ("poshmark.", "Poshmark"),
        ("mercari.", "Mercari"),
        ("grailed.", "Grailed"),
        ("depop.", "Depop"),
        ("therealreal.", "The RealReal"),
        ("vestiairecollective.", "Vestiaire Collective"),
        ("fashionphile.", "Fashionphile"),
        ("etsy.", "Etsy"),
    ] {
        if lowered.contains(needle) {
            return name.to_string();
        }
    }
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| "web".to_string())
}

/// Title/URL heuristics for completed sales found via general search.
pub fn is_sold_listing(listing: &Listing) -> bool {
    if listing.sold_date.is_some() {
        return true;
    }
    let title = listing.title.to_lowercase();
    let url = listing.url.to_lowercase();
    title.starts_with("sold")
        || title.contains("(sold)")
        || title.contains("sold ")
        || url.contains("lh_sold")
        || url.contains("lh_complete")
        || url.contains("/sold/")
}

/// Build the cacheable snapshot from priced results, preferring sold prices.
pub fn snapshot_from(result: &ResearchResult) -> Option<MarketDataSnapshot> {
    let sold_prices: Vec<f64> = priced(&result.sold_listings);
    let prices = if sold_prices.is_empty() {
        priced(&result.listings)
    } else {
        sold_prices
    };
    if prices.is_empty() {
        return None;
    }
    let low = prices.iter().cloned().fold(f64::INFINITY, f64::min);
    let high = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = prices.iter().sum::<f64>() / prices.len() as f64;
    let currency = result
        .sold_listings
        .iter()
        .chain(result.listings.iter())
        .find(|listing| listing.price > 0.0)
        .map(|listing| listing.currency.clone())
        .unwrap_or_else(|| "USD".to_string());
    Some(MarketDataSnapshot {
        avg_price: avg,
        price_low: low,
        price_high: high,
        currency,
        listings_found: result.listings.len(),
        sold_listings_found: result.sold_listings.len(),
        market_activity: market_activity_for(result.sold_listings.len() + result.listings.len()),
        sources: result.sources.clone(),
        updated_at: Utc::now(),
    })
}

fn priced(listings: &[Listing]) -> Vec<f64> {
    listings
        .iter()
        .map(|listing| listing.price)
        .filter(|price| *price > 0.0)
        .collect()
}

/// Coarse activity label from comparable-listing volume.
pub fn market_activity_for(count: usize) -> MarketActivity {
    match count {
        0..=2 => MarketActivity::Rare,
        3..=5 => MarketActivity::Slow,
        6..=9 => MarketActivity::Moderate,
        _ => MarketActivity::Hot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing(title: &str, url: &str, price: f64, score: Option<f64>) -> Listing {
        Listing {
            title: title.into(),
            price,
            currency: "USD".into(),
            platform: "eBay".into(),
            url: url.into(),
            condition: None,
            sold_date: None,
            relevance_score: score,
        }
    }

    #[test]
    fn parses_structured_and_text_prices() {
        let payload = json!({
            "organic_results": [
                {"title": "Patagonia Better Sweater 25455", "link": "https://www.ebay.com/itm/1", "price": {"extracted_value": 64.0}},
                {"title": "Patagonia fleece", "link": "https://poshmark.com/listing/2", "price": "$45.50"},
                {"title": "Patagonia jacket", "link": "https://www.mercari.com/item/3", "snippet": "Great condition, £30 shipped"},
                {"title": "No price here", "link": "https://example.com/4"},
                {"link": "https://example.com/untitled"}
            ]
        });
        let listings = parse_search_payload(&payload, false);
        assert_eq!(listings.len(), 4, "untitled entries are dropped");
        assert_eq!(listings[0].price, 64.0);
        assert_eq!(listings[1].price, 45.5);
        assert_eq!(listings[2].price, 30.0);
        assert_eq!(listings[2].currency, "GBP");
        assert_eq!(listings[3].price, 0.0, "unknown price is zero");
    }

    #[test]
    fn price_text_handles_thousands_separators() {
        assert_eq!(
            price_from_text("listed at $1,250.00 obo"),
            Some((1250.0, "USD".into()))
        );
        assert_eq!(price_from_text("no price"), None);
    }

    #[test]
    fn platform_is_derived_from_url() {
        assert_eq!(platform_from_url("https://www.ebay.com/itm/1"), "eBay");
        assert_eq!(platform_from_url("https://poshmark.com/listing/2"), "Poshmark");
        assert_eq!(
            platform_from_url("https://shop.example.org/item"),
            "shop.example.org"
        );
    }

    #[test]
    fn sold_detection_uses_title_and_url() {
        assert!(is_sold_listing(&listing(
            "SOLD Patagonia fleece",
            "https://poshmark.com/a",
            40.0,
            None
        )));
        assert!(is_sold_listing(&listing(
            "Patagonia fleece",
            "https://www.ebay.com/sch/i.html?LH_Sold=1",
            40.0,
            None
        )));
        assert!(!is_sold_listing(&listing(
            "Patagonia fleece",
            "https://www.ebay.com/itm/9",
            40.0,
            None
        )));
    }

    #[test]
    fn dedup_keeps_best_scored_entry_per_url() {
        let mut result = ResearchResult {
            listings: vec![
                listing("a", "https://x/1", 10.0, Some(0.5)),
                listing("a better", "https://x/1", 10.0, Some(0.8)),
                listing("b", "https://x/2", 20.0, Some(0.6)),
            ],
            ..Default::default()
        };
        finalize(&mut result, None, 10);
        assert_eq!(result.listings.len(), 2);
        assert_eq!(result.listings[0].title, "a better");
        let urls: Vec<&str> = result.listings.iter().map(|l| l.url.as_str()).collect();
        let mut unique = urls.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(urls.len(), unique.len());
    }

    #[test]
    fn listings_sort_by_relevance_then_price() {
        let mut result = ResearchResult {
            sold_listings: vec![
                listing("cheap exact", "https://x/1", 25.0, Some(0.9)),
                listing("pricey exact", "https://x/2", 60.0, Some(0.9)),
                listing("weak", "https://x/3", 100.0, Some(0.5)),
            ],
            ..Default::default()
        };
        finalize(&mut result, None, 10);
        assert_eq!(result.sold_listings[0].url, "https://x/2");
        assert_eq!(result.sold_listings[1].url, "https://x/1");
        assert_eq!(result.sold_listings[2].url, "https://x/3");
    }

    #[test]
    fn sources_are_deduped_and_capped() {
        let mut result = ResearchResult {
            listings: (0..30)
                .map(|i| listing("t", &format!("https://x/{i}"), 1.0, Some(0.5)))
                .collect(),
            ..Default::default()
        };
        finalize(&mut result, None, 20);
        assert_eq!(result.sources.len(), 20);
    }

    #[test]
    fn narrow_round_infers_category_and_it_carries_forward() {
        let item = ExtractedItem {
            brand: Some("Patagonia".into()),
            style_number: Some("25455".into()),
            ..Default::default()
        };
        let scoring = ScoringConfig::default();

        // Narrow pass: an exact style hit reveals the product is a fleece.
        let narrow = vec![listing(
            "Patagonia Better Sweater 25455 fleece full zip",
            "https://www.ebay.com/itm/1",
            55.0,
            None,
        )];
        let outcome = assess_round(narrow, &item, None, None, &scoring, true);
        let inferred = outcome.inferred.expect("category inferred");
        assert_eq!(inferred.name, "fleece");
        assert_eq!(outcome.kept_sold.len(), 1);

        // Broad pass with the carried category: the wrong product type is now
        // excluded even though extraction never supplied a category.
        let broad = vec![
            listing(
                "Patagonia Down Sweater Jacket Men's L",
                "https://www.ebay.com/itm/2",
                90.0,
                None,
            ),
            listing(
                "Patagonia Better Sweater 25455 navy",
                "https://www.ebay.com/itm/3",
                48.0,
                None,
            ),
        ];
        let outcome = assess_round(broad, &item, Some(inferred), None, &scoring, true);
        assert_eq!(outcome.kept_sold.len(), 1);
        assert!(outcome.kept_sold[0].title.contains("25455"));
        assert!(outcome.inferred.is_none(), "no re-inference once known");
    }

    #[test]
    fn snapshot_prefers_sold_prices() {
        let result = ResearchResult {
            listings: vec![listing("active", "https://x/1", 200.0, Some(0.6))],
            sold_listings: vec![
                listing("sold a", "https://x/2", 40.0, Some(0.9)),
                listing("sold b", "https://x/3", 60.0, Some(0.8)),
                listing("sold unknown price", "https://x/4", 0.0, Some(0.8)),
            ],
            ..Default::default()
        };
        let snapshot = snapshot_from(&result).expect("snapshot");
        assert_eq!(snapshot.price_low, 40.0);
        assert_eq!(snapshot.price_high, 60.0);
        assert_eq!(snapshot.avg_price, 50.0);
        assert_eq!(snapshot.sold_listings_found, 3);
    }

    #[test]
    fn snapshot_absent_without_priced_listings() {
        let result = ResearchResult {
            sold_listings: vec![listing("unknown", "https://x/1", 0.0, Some(0.9))],
            ..Default::default()
        };
        assert!(snapshot_from(&result).is_none());
    }

    #[test]
    fn activity_scale_matches_listing_volume() {
        assert_eq!(market_activity_for(0), MarketActivity::Rare);
        assert_eq!(market_activity_for(2), MarketActivity::Rare);
        assert_eq!(market_activity_for(4), MarketActivity::Slow);
        assert_eq!(market_activity_for(7), MarketActivity::Moderate);
        assert_eq!(market_activity_for(12), MarketActivity::Hot);
    }
}
