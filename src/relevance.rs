//! Listing relevance scoring. Additive point budget normalized by the maximum
//! achievable for the attributes actually present, so a listing is never
//! penalized for a dimension the extraction has no data for.

use crate::decoder;
use crate::models::{ExtractedItem, Listing};
use serde::Serialize;

/// Ordered category table, most specific first ("down jacket" must win over
/// plain "jacket"). Exclusion terms mark adjacent-but-wrong product types.
#[derive(Debug, Clone, Copy)]
pub struct CategoryDef {
    pub name: &'static str,
    pub match_terms: &'static [&'static str],
    pub exclude_terms: &'static [&'static str],
    pub related_terms: &'static [&'static str],
}

pub static CATEGORY_DEFS: &[CategoryDef] = &[
    CategoryDef {
        name: "down jacket",
        match_terms: &["down jacket", "down sweater", "puffer", "puffy jacket"],
        exclude_terms: &["fleece"],
        related_terms: &["jacket", "parka", "coat"],
    },
    CategoryDef {
        name: "rain jacket",
        match_terms: &["rain jacket", "rain shell", "raincoat", "torrentshell"],
        exclude_terms: &["down"],
        related_terms: &["jacket", "shell", "windbreaker"],
    },
    CategoryDef {
        name: "denim jacket",
        match_terms: &["denim jacket", "trucker jacket", "jean jacket", "type iii"],
        exclude_terms: &[],
        related_terms: &["jacket"],
    },
    CategoryDef {
        name: "fleece",
        match_terms: &["fleece", "better sweater", "synchilla", "retro-x", "pile jacket"],
        exclude_terms: &["down sweater", "down jacket", "puffer"],
        related_terms: &["jacket", "pullover", "sweater"],
    },
    CategoryDef {
        name: "hoodie",
        match_terms: &["hoodie", "hooded sweatshirt"],
        exclude_terms: &[],
        related_terms: &["sweatshirt", "pullover"],
    },
    CategoryDef {
        name: "jeans",
        match_terms: &["jeans", "denim pants", "501", "511"],
        exclude_terms: &["jacket", "shirt", "shorts"],
        related_terms: &["pants", "denim"],
    },
    CategoryDef {
        name: "t-shirt",
        match_terms: &["t-shirt", "t shirt", "tee"],
        exclude_terms: &["long sleeve"],
        related_terms: &["shirt", "top"],
    },
    CategoryDef {
        name: "shorts",
        match_terms: &["shorts", "baggies"],
        exclude_terms: &[],
        related_terms: &["pants", "trunks"],
    },
    CategoryDef {
        name: "sweater",
        match_terms: &["sweater", "cardigan", "knit pullover"],
        exclude_terms: &["better sweater", "down sweater", "sweatshirt"],
        related_terms: &["fleece", "pullover"],
    },
    CategoryDef {
        name: "dress",
        match_terms: &["dress", "gown"],
        exclude_terms: &["dress shirt", "dress pants"],
        related_terms: &["skirt"],
    },
    CategoryDef {
        name: "jacket",
        match_terms: &["jacket", "coat", "parka", "windbreaker", "anorak"],
        exclude_terms: &[],
        related_terms: &["vest", "shell"],
    },
    CategoryDef {
        name: "pants",
        match_terms: &["pants", "trousers", "chinos"],
        exclude_terms: &[],
        related_terms: &["jeans", "shorts"],
    },
    CategoryDef {
        name: "shirt",
        match_terms: &["shirt", "button-down", "flannel", "blouse"],
        exclude_terms: &["t-shirt", "sweatshirt"],
        related_terms: &["top"],
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Mens,
    Womens,
}

// Tokenized comparison, same as size matching: "recommend" must not read as
// "men", and a bare trailing "Men" still counts. Apostrophes split, so
// "women's" yields the "women" token.
const WOMENS_TOKENS: &[&str] = &["womens", "women", "woman", "ladies", "wmns", "female"];
const MENS_TOKENS: &[&str] = &["mens", "men", "man", "male"];

pub fn detect_gender(text: &str) -> Option<Gender> {
    let lowered = text.to_lowercase();
    let mut saw_mens = false;
    for token in lowered.split(|ch: char| !ch.is_ascii_alphanumeric()) {
        if WOMENS_TOKENS.contains(&token) {
            return Some(Gender::Womens);
        }
        saw_mens |= MENS_TOKENS.contains(&token);
    }
    saw_mens.then_some(Gender::Mens)
}

/// Scan all available item text against the ordered table; the first category
/// whose match terms hit (and whose exclusion terms do not) wins. Runs once
/// per scan.
pub fn detect_category(texts: &[&str]) -> Option<&'static CategoryDef> {
    let combined = texts
        .iter()
        .map(|text| text.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    if combined.trim().is_empty() {
        return None;
    }
    CATEGORY_DEFS.iter().find(|def| {
        def.match_terms.iter().any(|term| combined.contains(term))
            && !def.exclude_terms.iter().any(|term| combined.contains(term))
    })
}

pub fn category_for_item(item: &ExtractedItem) -> Option<&'static CategoryDef> {
    let mut texts: Vec<&str> = Vec::new();
    if let Some(category) = item.category.as_deref() {
        texts.push(category);
    }
    if let Some(style) = item.style.as_deref() {
        texts.push(style);
    }
    for suggestion in &item.search_suggestions {
        texts.push(suggestion);
    }
    if let Some(raw) = item.raw_text.as_deref() {
        texts.push(raw);
    }
    detect_category(&texts)
}

/// Retroactive category inference: an exact style-number hit found during a
/// broad search lets category-aware filtering apply on later rounds even when
/// extraction provided no category.
pub fn infer_category_from_listings<'a>(
    style_number: &str,
    listings: &'a [Listing],
) -> Option<&'static CategoryDef> {
    let needle = decoder::normalize_code(style_number);
    if needle.len() < 3 {
        return None;
    }
    listings
        .iter()
        .find(|listing| decoder::normalize_code(&listing.title).contains(&needle))
        .and_then(|listing| detect_category(&[&listing.title]))
}

/// Empirically tuned defaults; treat as configuration, not invariants.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub min_relevance: f64,
    pub brand_full: f64,
    pub brand_partial: f64,
    pub style_full: f64,
    pub style_prefix: f64,
    pub style_missing_penalty: f64,
    pub category_full: f64,
    pub category_related: f64,
    pub category_excluded_penalty: f64,
    pub category_unknown: f64,
    pub gender_match: f64,
    pub gender_mismatch_penalty: f64,
    pub size_bonus: f64,
}

/// An exclusion-term hit is disqualifying regardless of how well the other
/// dimensions match; the additive penalty alone cannot guarantee that once
/// brand, style, gender and size all line up.
pub const EXCLUDED_SCORE_CEILING: f64 = 0.35;

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_relevance: 0.45,
            brand_full: 25.0,
            brand_partial: 12.0,
            style_full: 35.0,
            style_prefix: 20.0,
            style_missing_penalty: 10.0,
            category_full: 25.0,
            category_related: 15.0,
            category_excluded_penalty: 30.0,
            category_unknown: 5.0,
            gender_match: 10.0,
            gender_mismatch_penalty: 15.0,
            size_bonus: 5.0,
        }
    }
}

impl ScoringConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(threshold) = std::env::var("MIN_RELEVANCE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| (0.0..=1.0).contains(value))
        {
            config.min_relevance = threshold;
        }
        config
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreComponent {
    pub dimension: &'static str,
    pub points: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingScore {
    pub score: f64,
    pub breakdown: Vec<ScoreComponent>,
}

pub fn score_listing(
    listing: &Listing,
    item: &ExtractedItem,
    category: Option<&CategoryDef>,
    gender: Option<Gender>,
    config: &ScoringConfig,
) -> ListingScore {
    let title = listing.title.to_lowercase();
    let title_code = decoder::normalize_code(&listing.title);

    let mut earned = 0.0;
    let mut max = 0.0;
    let mut excluded = false;
    let mut breakdown = Vec::new();

    // Brand: substring match, partial credit when extraction has no brand.
    max += config.brand_full;
    match item.brand_trimmed() {
        Some(brand) => {
            let points = if title.contains(&brand.to_lowercase()) {
                config.brand_full
            } else {
                0.0
            };
            earned += points;
            breakdown.push(ScoreComponent {
                dimension: "brand",
                points,
            });
        }
        None => {
            earned += config.brand_partial;
            breakdown.push(ScoreComponent {
                dimension: "brand_unknown",
                points: config.brand_partial,
            });
        }
    }

    // Style number: the missing-style penalty is what makes exact matches
    // stand out against noise.
    if let Some(style) = item.style_number_trimmed() {
        let needle = decoder::normalize_code(style);
        max += config.style_full;
        let points = if !needle.is_empty() && title_code.contains(&needle) {
            config.style_full
        } else if needle.len() >= 4 && title_code.contains(&needle[..4]) {
            config.style_prefix
        } else {
            -config.style_missing_penalty
        };
        earned += points;
        breakdown.push(ScoreComponent {
            dimension: "style_number",
            points,
        });
    }

    // Category: exclusion term for the wrong product type outweighs a match.
    match category {
        Some(def) => {
            max += config.category_full;
            let points = if def.exclude_terms.iter().any(|term| title.contains(term)) {
                excluded = true;
                -config.category_excluded_penalty
            } else if def.match_terms.iter().any(|term| title.contains(term)) {
                config.category_full
            } else if def.related_terms.iter().any(|term| title.contains(term)) {
                config.category_related
            } else {
                0.0
            };
            earned += points;
            breakdown.push(ScoreComponent {
                dimension: "category",
                points,
            });
        }
        None => {
            max += config.category_unknown;
            earned += config.category_unknown;
            breakdown.push(ScoreComponent {
                dimension: "category_unknown",
                points: config.category_unknown,
            });
        }
    }

    // Gender: only scored when the extraction detected one.
    if let Some(wanted) = gender {
        max += config.gender_match;
        let points = match detect_gender(&listing.title) {
            Some(found) if found == wanted => config.gender_match,
            Some(_) => -config.gender_mismatch_penalty,
            None => 0.0,
        };
        earned += points;
        breakdown.push(ScoreComponent {
            dimension: "gender",
            points,
        });
    }

    // Size: pure bonus, not part of the achievable maximum.
    if let Some(size) = item.size.as_deref().map(str::trim).filter(|s| !s.is_empty())
        && size_matches(&title, size)
    {
        earned += config.size_bonus;
        breakdown.push(ScoreComponent {
            dimension: "size",
            points: config.size_bonus,
        });
    }

    let mut score = if max > 0.0 {
        (earned / max).clamp(0.0, 1.0)
    } else {
        0.0
    };
    if excluded {
        score = score.min(EXCLUDED_SCORE_CEILING);
    }

    ListingScore { score, breakdown }
}

fn size_matches(title_lower: &str, size: &str) -> bool {
    let size = size.to_lowercase();
    if size.len() <= 2 {
        // Short sizes ("l", "xl", "32") need word boundaries to avoid matching
        // inside other words.
        title_lower
            .split(|ch: char| !ch.is_ascii_alphanumeric())
            .any(|token| token == size)
    } else {
        title_lower.contains(&size)
    }
}
