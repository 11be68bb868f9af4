//! Search-query planning. Produces a bounded, deduplicated set of general and
//! platform-specific queries per scan, plus the marketplace sold-listings
//! cascade the orchestrator walks from specific to broad.

use crate::models::ExtractedItem;
use crate::relevance::CategoryDef;
use once_cell::sync::Lazy;
use std::collections::HashMap;

pub const GENERAL_QUERY_CAP: usize = 3;
pub const PLATFORM_QUERY_CAP: usize = 4;
pub const SUGGESTION_CAP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrandTier {
    Luxury,
    Premium,
    Mid,
    Budget,
    Unknown,
}

static BRAND_TIERS: Lazy<HashMap<&'static str, BrandTier>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for brand in [
        "gucci",
        "prada",
        "chanel",
        "louis vuitton",
        "hermes",
        "burberry",
        "saint laurent",
    ] {
        map.insert(brand, BrandTier::Luxury);
    }
    for brand in [
        "patagonia",
        "arc'teryx",
        "arcteryx",
        "the north face",
        "canada goose",
        "stone island",
        "filson",
    ] {
        map.insert(brand, BrandTier::Premium);
    }
    for brand in [
        "nike",
        "adidas",
        "levi's",
        "levis",
        "carhartt",
        "ralph lauren",
        "tommy hilfiger",
    ] {
        map.insert(brand, BrandTier::Mid);
    }
    for brand in ["old navy", "h&m", "uniqlo", "gap", "shein", "forever 21"] {
        map.insert(brand, BrandTier::Budget);
    }
    map
});

pub fn tier_for_brand(brand: Option<&str>) -> BrandTier {
    brand
        .map(|name| name.trim().to_lowercase())
        .and_then(|name| BRAND_TIERS.get(name.as_str()).copied())
        .unwrap_or(BrandTier::Unknown)
}

/// Luxury resale goes to consignment/authentication platforms first; budget
/// brands to the high-volume marketplaces; unknown tiers default to the three
/// largest general marketplaces.
pub fn platforms_for_tier(tier: BrandTier) -> &'static [&'static str] {
    match tier {
        BrandTier::Luxury => &[
            "therealreal.com",
            "vestiairecollective.com",
            "fashionphile.com",
            "grailed.com",
        ],
        BrandTier::Premium => &["poshmark.com", "grailed.com", "ebay.com", "depop.com"],
        BrandTier::Mid => &["ebay.com", "poshmark.com", "mercari.com", "depop.com"],
        BrandTier::Budget => &["ebay.com", "mercari.com", "poshmark.com"],
        BrandTier::Unknown => &["ebay.com", "poshmark.com", "mercari.com"],
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    pub general: Vec<String>,
    pub platform_specific: Vec<String>,
    /// Sold-listings queries, narrowest first.
    pub sold_cascade: Vec<String>,
}

impl QueryPlan {
    pub fn primary_query(&self) -> Option<&str> {
        self.sold_cascade.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.general.is_empty() && self.platform_specific.is_empty() && self.sold_cascade.is_empty()
    }

    pub fn query_count(&self) -> usize {
        self.general.len() + self.platform_specific.len() + self.sold_cascade.len()
    }
}

pub fn build_queries(item: &ExtractedItem, category: Option<&CategoryDef>) -> QueryPlan {
    let brand = item.brand_trimmed();
    let style = item.style_number_trimmed();

    let mut general: Vec<String> = Vec::new();

    // AI-suggested phrases are trusted most.
    for suggestion in item
        .search_suggestions
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .take(SUGGESTION_CAP)
    {
        general.push(suggestion.to_string());
    }

    if let Some(brand) = brand {
        if let Some(sku) = item.sku.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            general.push(format!("{brand} \"{sku}\""));
        }
    }

    if let Some(rn) = item
        .rn_number
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        general.push(format!("\"RN{}\" clothing manufacturer", rn.replace(' ', "")));
    }

    // With no brand at all, fall back to garment-attribute queries.
    if brand.is_none() {
        if let Some(query) = attribute_query(item, category) {
            general.push(query);
        }
    }

    let general = dedup_capped(general, GENERAL_QUERY_CAP);

    let platform_specific = dedup_capped(
        platform_queries(item, category, brand, style),
        PLATFORM_QUERY_CAP,
    );

    let sold_cascade = sold_query_cascade(item, category);

    QueryPlan {
        general,
        platform_specific,
        sold_cascade,
    }
}

/// The primary sold-listings cascade: brand+style, then brand+category with
/// exclusion terms to suppress adjacent-but-wrong product types, then
/// brand+category bare, then brand alone.
pub fn sold_query_cascade(item: &ExtractedItem, category: Option<&CategoryDef>) -> Vec<String> {
    let mut cascade = Vec::new();
    let category_name = category
        .map(|def| def.name)
        .or(item.category.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty());

    if let Some(brand) = item.brand_trimmed() {
        if let Some(style) = item.style_number_trimmed() {
            cascade.push(format!("{brand} {style}"));
        }
        if let Some(name) = category_name {
            if let Some(def) = category
                && !def.exclude_terms.is_empty()
            {
                cascade.push(format!(
                    "{brand} {name} {}",
                    exclusion_suffix(def.exclude_terms)
                ));
            }
            cascade.push(format!("{brand} {name}"));
        }
        cascade.push(brand.to_string());
    } else if let Some(name) = category_name {
        if let Some(query) = attribute_query(item, category) {
            cascade.push(query);
        }
        cascade.push(name.to_string());
    }

    dedup_capped(cascade, usize::MAX)
}

fn exclusion_suffix(terms: &[&str]) -> String {
    terms
        .iter()
        .map(|term| {
            if term.contains(' ') {
                format!("-\"{term}\"")
            } else {
                format!("-{term}")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn platform_queries(
    item: &ExtractedItem,
    category: Option<&CategoryDef>,
    brand: Option<&str>,
    style: Option<&str>,
) -> Vec<String> {
    let terms = match (brand, style) {
        (Some(brand), Some(style)) => format!("{brand} {style}"),
        (Some(brand), None) => match category.map(|def| def.name).or(item.category.as_deref()) {
            Some(name) => format!("{brand} {name}"),
            None => brand.to_string(),
        },
        (None, _) => match attribute_query(item, category) {
            Some(query) => query,
            None => return Vec::new(),
        },
    };

    let tier = tier_for_brand(brand);
    platforms_for_tier(tier)
        .iter()
        .take(PLATFORM_QUERY_CAP)
        .map(|domain| format!("site:{domain} {terms}"))
        .collect()
}

fn attribute_query(item: &ExtractedItem, category: Option<&CategoryDef>) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(era) = item
        .estimated_era
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        parts.push(era.to_string());
    }
    if let Some(name) = category
        .map(|def| def.name)
        .or(item.category.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        parts.push(name.to_string());
    } else if let Some(style) = item.style.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        parts.push(style.to_string());
    }
    if let Some(material) = item.materials.first().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        parts.push(material.to_string());
    }
    if let Some(origin) = item
        .country_of_origin
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        parts.push(format!("made in {origin}"));
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join(" "))
}

fn dedup_capped(values: Vec<String>, cap: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();
    for value in values {
        let key = value.to_lowercase();
        if seen.insert(key) {
            result.push(value);
            if result.len() >= cap {
                break;
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relevance;

    fn patagonia_item() -> ExtractedItem {
        ExtractedItem {
            brand: Some("Patagonia".into()),
            style_number: Some("25455".into()),
            category: Some("fleece".into()),
            ..Default::default()
        }
    }

    #[test]
    fn cascade_goes_specific_to_broad() {
        let item = patagonia_item();
        let category = relevance::category_for_item(&item).expect("fleece");
        let cascade = sold_query_cascade(&item, Some(category));
        assert_eq!(cascade[0], "Patagonia 25455");
        assert!(cascade[1].starts_with("Patagonia fleece -"));
        assert_eq!(cascade[2], "Patagonia fleece");
        assert_eq!(cascade[3], "Patagonia");
    }

    #[test]
    fn exclusion_terms_are_negated_and_quoted() {
        let item = patagonia_item();
        let category = relevance::category_for_item(&item).unwrap();
        let cascade = sold_query_cascade(&item, Some(category));
        assert!(cascade[1].contains("-\"down sweater\""));
        assert!(cascade[1].contains("-puffer"));
    }

    #[test]
    fn premium_brand_prioritizes_consignment_style_platforms() {
        let item = patagonia_item();
        let plan = build_queries(&item, relevance::category_for_item(&item));
        assert!(plan.platform_specific.len() <= PLATFORM_QUERY_CAP);
        assert!(plan.platform_specific[0].starts_with("site:poshmark.com"));
        assert!(
            plan.platform_specific
                .iter()
                .all(|q| q.contains("Patagonia 25455"))
        );
    }

    #[test]
    fn luxury_tier_hits_authentication_platforms() {
        let platforms = platforms_for_tier(tier_for_brand(Some("Gucci")));
        assert_eq!(platforms[0], "therealreal.com");
    }

    #[test]
    fn unknown_brand_defaults_to_largest_marketplaces() {
        assert_eq!(tier_for_brand(Some("Some Tiny Label")), BrandTier::Unknown);
        assert_eq!(tier_for_brand(None), BrandTier::Unknown);
        assert_eq!(
            platforms_for_tier(BrandTier::Unknown),
            &["ebay.com", "poshmark.com", "mercari.com"]
        );
    }

    #[test]
    fn suggestions_lead_the_general_list_and_are_capped() {
        let mut item = patagonia_item();
        item.sku = Some("STY-25455-BLK".into());
        item.search_suggestions = vec![
            "patagonia better sweater full zip".into(),
            "patagonia fleece 25455".into(),
            "a third suggestion that must be dropped".into(),
        ];
        let plan = build_queries(&item, relevance::category_for_item(&item));
        assert_eq!(plan.general.len(), GENERAL_QUERY_CAP);
        assert_eq!(plan.general[0], "patagonia better sweater full zip");
        assert_eq!(plan.general[1], "patagonia fleece 25455");
        assert!(plan.general[2].contains("STY-25455-BLK"));
    }

    #[test]
    fn rn_number_produces_lookup_query() {
        let item = ExtractedItem {
            rn_number: Some("51884".into()),
            ..Default::default()
        };
        let plan = build_queries(&item, None);
        assert!(plan.general.iter().any(|q| q.contains("RN51884")));
    }

    #[test]
    fn brandless_item_builds_attribute_queries() {
        let item = ExtractedItem {
            category: Some("fleece".into()),
            materials: vec!["polyester".into()],
            estimated_era: Some("90s".into()),
            country_of_origin: Some("USA".into()),
            ..Default::default()
        };
        let plan = build_queries(&item, relevance::category_for_item(&item));
        assert!(plan.general.iter().any(|q| q.contains("90s")
            && q.contains("fleece")
            && q.contains("polyester")
            && q.contains("made in USA")));
        assert!(!plan.sold_cascade.is_empty());
    }

    #[test]
    fn queries_are_deduplicated() {
        let mut item = patagonia_item();
        item.search_suggestions = vec!["Patagonia 25455".into(), "patagonia 25455".into()];
        let plan = build_queries(&item, None);
        let lowered: Vec<String> = plan.general.iter().map(|q| q.to_lowercase()).collect();
        let mut unique = lowered.clone();
        unique.dedup();
        assert_eq!(lowered.len(), unique.len());
    }

    #[test]
    fn empty_item_builds_no_queries() {
        let plan = build_queries(&ExtractedItem::default(), None);
        assert!(plan.is_empty());
        assert!(plan.primary_query().is_none());
    }
}
