//! Findings refinement: turns raw research output into a price range, market
//! read, and insights. The language model gets the first shot; any failure
//! drops to a statistical summary of the comparable prices, so refinement
//! itself never fails a scan.

use crate::llm::{LlmClient, LlmMessage};
use crate::models::{
    DemandLevel, ExtractedItem, Listing, MarketActivity, MarketDataSnapshot, PriceRange,
    RefinedFindings, ResearchResult,
};
use crate::research::market_activity_for;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Confidence multiplier applied when the statistical fallback stands in for a
/// language-model call that was attempted and failed.
const FALLBACK_CONFIDENCE_PENALTY: f64 = 0.85;
const COMPARABLE_LIMIT: usize = 5;
const PROMPT_LISTING_LIMIT: usize = 10;

pub struct Refiner {
    llm: Arc<LlmClient>,
}

impl Refiner {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// Synthesize findings from research output. Infallible: a missing or
    /// broken model response falls back to price statistics.
    pub async fn refine(&self, item: &ExtractedItem, research: &ResearchResult) -> RefinedFindings {
        if !self.llm.is_configured() {
            info!(
                target = "argus.refine",
                "no model configured, using statistical summary"
            );
            return statistical_findings(research, false);
        }

        let messages = build_prompt(item, research);
        match self.llm.chat(&messages).await {
            Ok(text) => match parse_model_findings(&text, research) {
                Some(findings) => findings,
                None => {
                    warn!(
                        target = "argus.refine",
                        "model response not parseable, falling back to statistics"
                    );
                    statistical_findings(research, true)
                }
            },
            Err(err) => {
                warn!(
                    target = "argus.refine",
                    error = %err,
                    "model call failed, falling back to statistics"
                );
                statistical_findings(research, true)
            }
        }
    }
}

fn build_prompt(item: &ExtractedItem, research: &ResearchResult) -> Vec<LlmMessage> {
    let mut lines = vec![
        "Estimate the resale value of this garment from comparable listings.".to_string(),
        String::new(),
        format!("Brand: {}", item.brand_trimmed().unwrap_or("unknown")),
        format!(
            "Style number: {}",
            item.style_number_trimmed().unwrap_or("unknown")
        ),
    ];
    if let Some(category) = item
        .category
        .as_deref()
        .or(research.inferred_category.as_deref())
    {
        lines.push(format!("Category: {category}"));
    }
    if let Some(size) = item.size.as_deref() {
        lines.push(format!("Size: {size}"));
    }
    if let Some(info) = research.brand_info.as_deref() {
        lines.push(format!("Identified as: {info}"));
    }

    lines.push(String::new());
    lines.push("Sold listings:".to_string());
    push_listing_lines(&mut lines, &research.sold_listings);
    lines.push("Active listings:".to_string());
    push_listing_lines(&mut lines, &research.listings);

    lines.push(String::new());
    lines.push(
        "Respond with a single JSON object, no prose: \
         {\"price_low\": number, \"price_recommended\": number, \"price_high\": number, \
         \"currency\": string, \"market_activity\": \"hot|moderate|slow|rare\", \
         \"demand_level\": \"high|medium|low\", \"insights\": [string], \
         \"confidence\": number between 0 and 1}"
            .to_string(),
    );

    vec![
        LlmMessage {
            role: "system".into(),
            content: "You are a secondhand-clothing pricing analyst. Base every number on the \
                      provided listings; never invent comparables."
                .into(),
        },
        LlmMessage {
            role: "user".into(),
            content: lines.join("\n"),
        },
    ]
}

fn push_listing_lines(lines: &mut Vec<String>, listings: &[Listing]) {
    if listings.is_empty() {
        lines.push("  (none)".to_string());
        return;
    }
    for listing in listings.iter().take(PROMPT_LISTING_LIMIT) {
        let price = if listing.price > 0.0 {
            format!("{:.2} {}", listing.price, listing.currency)
        } else {
            "price unknown".to_string()
        };
        lines.push(format!(
            "  - [{}] {} ({price})",
            listing.platform, listing.title
        ));
    }
}

#[derive(Debug, Deserialize)]
struct ModelFindings {
    price_low: f64,
    price_recommended: f64,
    price_high: f64,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    market_activity: Option<String>,
    #[serde(default)]
    demand_level: Option<String>,
    #[serde(default)]
    insights: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

fn parse_model_findings(text: &str, research: &ResearchResult) -> Option<RefinedFindings> {
    let json = extract_json_object(text)?;
    let raw: ModelFindings = serde_json::from_str(json).ok()?;
    if raw.price_low < 0.0 || raw.price_high < 0.0 {
        return None;
    }

    // Re-order defensively; models occasionally swap the bounds.
    let low = raw.price_low.min(raw.price_high);
    let high = raw.price_low.max(raw.price_high);
    let recommended = raw.price_recommended.clamp(low, high);

    let activity = raw
        .market_activity
        .as_deref()
        .and_then(parse_activity)
        .unwrap_or_else(|| market_activity_for(comparable_count(research)));
    let demand = raw
        .demand_level
        .as_deref()
        .and_then(parse_demand)
        .unwrap_or_else(|| demand_for_activity(activity));

    Some(RefinedFindings {
        price_range: PriceRange {
            low,
            high,
            recommended,
            currency: raw.currency.unwrap_or_else(|| dominant_currency(research)),
        },
        market_activity: activity,
        demand_level: demand,
        comparable_listings: comparables(research),
        insights: raw.insights,
        confidence: raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
    })
}

/// Find the first balanced `{...}` in possibly-chatty model output. Braces
/// inside JSON strings are skipped.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_activity(value: &str) -> Option<MarketActivity> {
    match value.trim().to_lowercase().as_str() {
        "hot" => Some(MarketActivity::Hot),
        "moderate" => Some(MarketActivity::Moderate),
        "slow" => Some(MarketActivity::Slow),
        "rare" => Some(MarketActivity::Rare),
        _ => None,
    }
}

fn parse_demand(value: &str) -> Option<DemandLevel> {
    match value.trim().to_lowercase().as_str() {
        "high" => Some(DemandLevel::High),
        "medium" => Some(DemandLevel::Medium),
        "low" => Some(DemandLevel::Low),
        _ => None,
    }
}

fn demand_for_activity(activity: MarketActivity) -> DemandLevel {
    match activity {
        MarketActivity::Hot => DemandLevel::High,
        MarketActivity::Moderate => DemandLevel::Medium,
        MarketActivity::Slow | MarketActivity::Rare => DemandLevel::Low,
    }
}

fn comparable_count(research: &ResearchResult) -> usize {
    research.sold_listings.len() + research.listings.len()
}

/// Top comparables across sold and active listings, best relevance first.
fn comparables(research: &ResearchResult) -> Vec<Listing> {
    let mut merged: Vec<Listing> = research
        .sold_listings
        .iter()
        .chain(research.listings.iter())
        .cloned()
        .collect();
    merged.sort_by(|a, b| {
        b.relevance_score
            .unwrap_or(0.0)
            .total_cmp(&a.relevance_score.unwrap_or(0.0))
    });
    merged.truncate(COMPARABLE_LIMIT);
    merged
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn dominant_currency(research: &ResearchResult) -> String {
    research
        .sold_listings
        .iter()
        .chain(research.listings.iter())
        .find(|listing| listing.price > 0.0)
        .map(|listing| listing.currency.clone())
        .unwrap_or_else(|| "USD".to_string())
}

/// Price statistics over the comparables. `after_model_failure` marks the case
/// where a model call was attempted and failed, which costs extra confidence.
pub fn statistical_findings(research: &ResearchResult, after_model_failure: bool) -> RefinedFindings {
    let mut prices: Vec<f64> = research
        .sold_listings
        .iter()
        .chain(research.listings.iter())
        .map(|listing| listing.price)
        .filter(|price| *price > 0.0)
        .collect();
    prices.sort_by(f64::total_cmp);

    let mut findings = if prices.is_empty() {
        RefinedFindings {
            price_range: PriceRange {
                low: 0.0,
                high: 0.0,
                recommended: 0.0,
                currency: "USD".into(),
            },
            market_activity: MarketActivity::Rare,
            demand_level: DemandLevel::Low,
            comparable_listings: Vec::new(),
            insights: vec!["No comparable listings with known prices were found.".into()],
            confidence: 0.05,
        }
    } else {
        let low = prices[0];
        let high = prices[prices.len() - 1];
        let recommended = median(&prices);
        let activity = market_activity_for(comparable_count(research));
        let confidence = (0.2 + 0.05 * prices.len() as f64).min(0.7);
        RefinedFindings {
            price_range: PriceRange {
                low,
                high,
                recommended,
                currency: dominant_currency(research),
            },
            market_activity: activity,
            demand_level: demand_for_activity(activity),
            comparable_listings: comparables(research),
            insights: vec![format!(
                "Price range derived from {} comparable listing(s) with known prices.",
                prices.len()
            )],
            confidence,
        }
    };

    findings
        .insights
        .insert(0, "Statistical estimate; no analyst model output.".into());
    if after_model_failure {
        findings.confidence *= FALLBACK_CONFIDENCE_PENALTY;
    }
    findings
}

/// Findings synthesized straight from a fresh cached snapshot, used when a
/// scan short-circuits research entirely.
pub fn findings_from_snapshot(snapshot: &MarketDataSnapshot) -> RefinedFindings {
    RefinedFindings {
        price_range: PriceRange {
            low: snapshot.price_low,
            high: snapshot.price_high,
            recommended: snapshot.avg_price,
            currency: snapshot.currency.clone(),
        },
        market_activity: snapshot.market_activity,
        demand_level: demand_for_activity(snapshot.market_activity),
        comparable_listings: Vec::new(),
        insights: vec![format!(
            "Based on cached market data from {} ({} sold, {} active comparables).",
            snapshot.updated_at.format("%Y-%m-%d"),
            snapshot.sold_listings_found,
            snapshot.listings_found
        )],
        confidence: 0.6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sold(title: &str, price: f64, score: f64) -> Listing {
        Listing {
            title: title.into(),
            price,
            currency: "USD".into(),
            platform: "eBay".into(),
            url: format!("https://www.ebay.com/itm/{title}"),
            condition: None,
            sold_date: Some("2026-08-01".into()),
            relevance_score: Some(score),
        }
    }

    fn research_with_prices(prices: &[f64]) -> ResearchResult {
        ResearchResult {
            sold_listings: prices
                .iter()
                .enumerate()
                .map(|(i, p)| sold(&format!("comp {i}"), *p, 0.8))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn extracts_json_from_chatty_output() {
        let text = "Here you go:\n```json\n{\"a\": 1, \"b\": {\"c\": \"}\"}}\n```\nHope that helps!";
        let json = extract_json_object(text).expect("object");
        assert_eq!(json, "{\"a\": 1, \"b\": {\"c\": \"}\"}}");
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("{truncated").is_none());
    }

    #[test]
    fn model_findings_are_clamped_into_order() {
        let research = research_with_prices(&[40.0, 60.0]);
        let text = r#"{"price_low": 80.0, "price_recommended": 200.0, "price_high": 30.0,
                       "currency": "USD", "market_activity": "moderate",
                       "demand_level": "medium", "insights": ["swapped bounds"],
                       "confidence": 1.4}"#;
        let findings = parse_model_findings(text, &research).expect("parsed");
        assert_eq!(findings.price_range.low, 30.0);
        assert_eq!(findings.price_range.high, 80.0);
        assert_eq!(findings.price_range.recommended, 80.0, "clamped to high");
        assert_eq!(findings.confidence, 1.0, "confidence clamped to unit range");
    }

    #[test]
    fn unparseable_activity_falls_back_to_listing_volume() {
        let research = research_with_prices(&[40.0; 12]);
        let text = r#"{"price_low": 30, "price_recommended": 45, "price_high": 60,
                       "market_activity": "blazing"}"#;
        let findings = parse_model_findings(text, &research).expect("parsed");
        assert_eq!(findings.market_activity, MarketActivity::Hot);
        assert_eq!(findings.demand_level, DemandLevel::High);
    }

    #[test]
    fn negative_prices_reject_the_model_output() {
        let research = research_with_prices(&[40.0]);
        let text = r#"{"price_low": -5, "price_recommended": 10, "price_high": 20}"#;
        assert!(parse_model_findings(text, &research).is_none());
    }

    #[test]
    fn statistical_fallback_uses_min_median_max() {
        let research = research_with_prices(&[30.0, 45.0, 52.0, 60.0, 90.0]);
        let findings = statistical_findings(&research, false);
        assert_eq!(findings.price_range.low, 30.0);
        assert_eq!(findings.price_range.high, 90.0);
        assert_eq!(findings.price_range.recommended, 52.0);
        assert_eq!(findings.market_activity, MarketActivity::Slow);
        assert_eq!(findings.demand_level, DemandLevel::Low);
        assert!(findings.insights[0].contains("Statistical estimate"));
    }

    #[test]
    fn model_failure_costs_extra_confidence() {
        let research = research_with_prices(&[30.0, 45.0, 60.0]);
        let plain = statistical_findings(&research, false);
        let after_failure = statistical_findings(&research, true);
        assert!(after_failure.confidence < plain.confidence);
        assert!(
            (after_failure.confidence - plain.confidence * FALLBACK_CONFIDENCE_PENALTY).abs()
                < 1e-9
        );
    }

    #[test]
    fn no_priced_comparables_means_floor_confidence() {
        let mut research = research_with_prices(&[]);
        research.sold_listings.push(sold("unknown price", 0.0, 0.9));
        let findings = statistical_findings(&research, false);
        assert_eq!(findings.confidence, 0.05);
        assert_eq!(findings.market_activity, MarketActivity::Rare);
        assert_eq!(findings.price_range.recommended, 0.0);
        assert!(
            findings
                .insights
                .iter()
                .any(|insight| insight.contains("No comparable listings"))
        );
    }

    #[test]
    fn comparables_are_capped_at_five_by_relevance() {
        let mut research = research_with_prices(&[10.0, 20.0, 30.0, 40.0]);
        research.listings = vec![sold("active one", 50.0, 0.7), sold("active two", 55.0, 0.6)];
        let findings = statistical_findings(&research, false);
        assert_eq!(findings.comparable_listings.len(), 5);
        assert_eq!(findings.comparable_listings[4].title, "active one");
    }

    #[test]
    fn comparables_rank_a_stronger_active_listing_above_a_weaker_sold_one() {
        let mut research = ResearchResult {
            sold_listings: vec![sold("weak sold comp", 35.0, 0.5)],
            ..Default::default()
        };
        research.listings = vec![sold("strong active comp", 48.0, 0.9)];
        let findings = statistical_findings(&research, false);
        assert_eq!(findings.comparable_listings[0].title, "strong active comp");
        let scores: Vec<f64> = findings
            .comparable_listings
            .iter()
            .filter_map(|listing| listing.relevance_score)
            .collect();
        assert!(
            scores.windows(2).all(|pair| pair[0] >= pair[1]),
            "comparables must be sorted by relevance desc, got {scores:?}"
        );
    }

    #[test]
    fn snapshot_findings_carry_the_cached_range() {
        let snapshot = MarketDataSnapshot {
            avg_price: 55.0,
            price_low: 30.0,
            price_high: 90.0,
            currency: "USD".into(),
            listings_found: 4,
            sold_listings_found: 6,
            market_activity: MarketActivity::Moderate,
            sources: vec![],
            updated_at: Utc::now(),
        };
        let findings = findings_from_snapshot(&snapshot);
        assert_eq!(findings.price_range.recommended, 55.0);
        assert_eq!(findings.demand_level, DemandLevel::Medium);
        assert!(findings.insights[0].contains("cached market data"));
    }
}
