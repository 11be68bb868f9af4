use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Attribute-extraction output for one scanned garment. Produced upstream,
/// consumed read-only by the research pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExtractedItem {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub style_number: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub materials: Vec<String>,
    #[serde(default)]
    pub country_of_origin: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub estimated_era: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub rn_number: Option<String>,
    /// AI-suggested search phrases from the extraction stage.
    #[serde(default)]
    pub search_suggestions: Vec<String>,
    /// Raw tag/label text captured by on-device recognition.
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

impl ExtractedItem {
    /// Brand with empty strings treated as absent.
    pub fn brand_trimmed(&self) -> Option<&str> {
        self.brand
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn style_number_trimmed(&self) -> Option<&str> {
        self.style_number
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Result of decoding a brand style code. Immutable once produced; a fresher
/// decode for the same key supersedes, never mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedStyleInfo {
    pub brand: String,
    pub raw_code: String,
    pub normalized_code: String,
    #[serde(default)]
    pub product_line: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub gender: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub search_terms: Vec<String>,
    /// Which pattern in the decoder chain matched, for debugging.
    pub matched_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    pub avg_price: f64,
    pub price_low: f64,
    pub price_high: f64,
    pub currency: String,
    pub listings_found: usize,
    pub sold_listings_found: usize,
    pub market_activity: MarketActivity,
    #[serde(default)]
    pub sources: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// One candidate listing found during research. `url` is the dedup key;
/// a price of 0 means unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub platform: String,
    pub url: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub sold_date: Option<String>,
    /// Attached after scoring; absent pre-scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchResult {
    pub listings: Vec<Listing>,
    pub sold_listings: Vec<Listing>,
    /// Every query executed, kept for audit.
    pub search_queries: Vec<String>,
    pub sources: Vec<String>,
    #[serde(default)]
    pub brand_info: Option<String>,
    /// Category inferred during research when extraction had none.
    #[serde(default)]
    pub inferred_category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRange {
    pub low: f64,
    pub high: f64,
    pub recommended: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketActivity {
    Hot,
    Moderate,
    Slow,
    Rare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemandLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinedFindings {
    pub price_range: PriceRange,
    pub market_activity: MarketActivity,
    pub demand_level: DemandLevel,
    /// Top comparable listings, at most five, sorted by relevance.
    pub comparable_listings: Vec<Listing>,
    pub insights: Vec<String>,
    pub confidence: f64,
}

/// Scan lifecycle owned by the orchestrating caller. The research core only
/// reports where in the lifecycle it handed back control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Uploaded,
    Extracting,
    AwaitingClarification,
    Researching,
    Refining,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub scan_id: Option<Uuid>,
    pub item: ExtractedItem,
    /// Question the extraction stage wants answered before research.
    #[serde(default)]
    pub pending_clarification: Option<String>,
    /// User's answer; folded into the item text before research resumes.
    #[serde(default)]
    pub clarification_answer: Option<String>,
    /// Stop after research, skipping refinement.
    #[serde(default)]
    pub research_only: bool,
    /// Ignore fresh cached market data and re-research.
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub scan_id: Uuid,
    pub status: ScanStatus,
    pub stages: Vec<StageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research: Option<ResearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub findings: Option<RefinedFindings>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
