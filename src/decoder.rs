//! Brand style-code decoders. Each brand is one variant in a tagged registry;
//! a decoder is a chain of pattern matchers tried most-specific-first, where
//! the first structural match wins and assigns the confidence. Adding a brand
//! means adding a variant and its alias rows, nothing else.

use crate::models::DecodedStyleInfo;
use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrandDecoder {
    Patagonia,
    Nike,
    TheNorthFace,
    Levis,
    Carhartt,
}

static BRAND_ALIASES: Lazy<HashMap<&'static str, BrandDecoder>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("patagonia", BrandDecoder::Patagonia);
    map.insert("nike", BrandDecoder::Nike);
    map.insert("the north face", BrandDecoder::TheNorthFace);
    map.insert("north face", BrandDecoder::TheNorthFace);
    map.insert("tnf", BrandDecoder::TheNorthFace);
    map.insert("levi's", BrandDecoder::Levis);
    map.insert("levis", BrandDecoder::Levis);
    map.insert("levi strauss", BrandDecoder::Levis);
    map.insert("levi strauss & co", BrandDecoder::Levis);
    map.insert("carhartt", BrandDecoder::Carhartt);
    map
});

/// Returns `None` for unknown brands; callers treat that as "no decode
/// available", not an error.
pub fn get_decoder(brand: &str) -> Option<BrandDecoder> {
    BRAND_ALIASES
        .get(brand.trim().to_lowercase().as_str())
        .copied()
}

pub fn decode(brand: &str, code: &str) -> Option<DecodedStyleInfo> {
    get_decoder(brand)?.decode(code)
}

/// Canonical cache/lookup key form: uppercase, separators stripped.
pub fn normalize_code(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

impl BrandDecoder {
    pub fn brand_name(&self) -> &'static str {
        match self {
            BrandDecoder::Patagonia => "Patagonia",
            BrandDecoder::Nike => "Nike",
            BrandDecoder::TheNorthFace => "The North Face",
            BrandDecoder::Levis => "Levi's",
            BrandDecoder::Carhartt => "Carhartt",
        }
    }

    pub fn decode(&self, raw_code: &str) -> Option<DecodedStyleInfo> {
        let raw = raw_code.trim();
        let normalized = normalize_code(raw);
        if normalized.len() < 3 {
            return None;
        }
        let decoded = match self {
            BrandDecoder::Patagonia => decode_patagonia(&normalized),
            BrandDecoder::Nike => decode_nike(&normalized),
            BrandDecoder::TheNorthFace => decode_north_face(&normalized),
            BrandDecoder::Levis => decode_levis(&normalized),
            BrandDecoder::Carhartt => decode_carhartt(&normalized),
        };
        let partial = decoded.unwrap_or_else(|| PartialDecode::fallback());
        Some(partial.into_info(self.brand_name(), raw, &normalized))
    }
}

/// Decoder-internal result before brand/raw/normalized are attached.
struct PartialDecode {
    product_line: Option<&'static str>,
    category: Option<&'static str>,
    season: Option<&'static str>,
    year: Option<u16>,
    confidence: f64,
    matched_pattern: &'static str,
}

impl PartialDecode {
    fn fallback() -> Self {
        Self {
            product_line: None,
            category: None,
            season: None,
            year: None,
            confidence: 0.3,
            matched_pattern: "fallback",
        }
    }

    fn into_info(self, brand: &str, raw: &str, normalized: &str) -> DecodedStyleInfo {
        let mut search_terms = vec![format!("{brand} {raw}")];
        if let Some(line) = self.product_line {
            search_terms.push(format!("{brand} {line}"));
        }
        DecodedStyleInfo {
            brand: brand.to_string(),
            raw_code: raw.to_string(),
            normalized_code: normalized.to_string(),
            product_line: self.product_line.map(str::to_string),
            category: self.category.map(str::to_string),
            season: self.season.map(str::to_string),
            year: self.year,
            gender: None,
            confidence: self.confidence,
            search_terms,
            matched_pattern: self.matched_pattern.to_string(),
        }
    }
}

fn all_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

fn all_alpha(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_alphabetic())
}

// ---------------------------------------------------------------------------
// Patagonia
//
// Style numbers are five digits, optionally followed by a season code and a
// two-digit year ("25455-F21"). The leading digits map to a product line.

const PATAGONIA_LINES: &[(u32, u32, &str, &str)] = &[
    (23000, 23999, "Synchilla", "fleece"),
    (25000, 25999, "Better Sweater", "fleece"),
    (26000, 26999, "Retro-X", "fleece"),
    (57000, 57999, "Baggies", "shorts"),
    (84600, 84799, "Down Sweater", "down jacket"),
    (85200, 85299, "Torrentshell", "rain jacket"),
];

fn patagonia_line(style: u32) -> Option<(&'static str, &'static str)> {
    PATAGONIA_LINES
        .iter()
        .find(|(low, high, _, _)| (*low..=*high).contains(&style))
        .map(|(_, _, line, category)| (*line, *category))
}

fn patagonia_season(letters: &str) -> Option<&'static str> {
    match letters {
        "F" | "FA" => Some("fall"),
        "S" | "SP" => Some("spring"),
        "W" | "WI" => Some("winter"),
        "SU" => Some("summer"),
        _ => None,
    }
}

fn decode_patagonia(code: &str) -> Option<PartialDecode> {
    // Five digits + season letters + two-digit year, e.g. 25455F21.
    if code.len() >= 8 && code.len() <= 9 && all_digits(&code[..5]) {
        let tail = &code[5..];
        let (letters, year) = tail.split_at(tail.len() - 2);
        if all_alpha(letters) && all_digits(year) {
            if let Some(season) = patagonia_season(letters) {
                let style: u32 = code[..5].parse().ok()?;
                let (line, category) = match patagonia_line(style) {
                    Some((line, category)) => (Some(line), Some(category)),
                    None => (None, None),
                };
                return Some(PartialDecode {
                    product_line: line,
                    category,
                    season: Some(season),
                    year: year.parse::<u16>().ok().map(|y| 2000 + y),
                    confidence: 0.9,
                    matched_pattern: "style_season_year",
                });
            }
        }
    }

    // Bare five-digit style number.
    if code.len() == 5 && all_digits(code) {
        let style: u32 = code.parse().ok()?;
        return Some(match patagonia_line(style) {
            Some((line, category)) => PartialDecode {
                product_line: Some(line),
                category: Some(category),
                season: None,
                year: None,
                confidence: 0.85,
                matched_pattern: "five_digit_known_line",
            },
            None => PartialDecode {
                product_line: None,
                category: None,
                season: None,
                year: None,
                confidence: 0.6,
                matched_pattern: "five_digit",
            },
        });
    }

    None
}

// ---------------------------------------------------------------------------
// Nike
//
// Modern codes are two letters + four digits with a three-digit colorway
// ("DV1234-010"); older codes use six digits + colorway.

fn decode_nike(code: &str) -> Option<PartialDecode> {
    if code.len() == 9
        && all_alpha(&code[..2])
        && all_digits(&code[2..6])
        && all_digits(&code[6..])
    {
        return Some(PartialDecode {
            product_line: None,
            category: None,
            season: None,
            year: None,
            confidence: 0.9,
            matched_pattern: "style_colorway",
        });
    }
    if code.len() == 9 && all_digits(code) {
        return Some(PartialDecode {
            product_line: None,
            category: None,
            season: None,
            year: None,
            confidence: 0.8,
            matched_pattern: "legacy_style_colorway",
        });
    }
    if code.len() == 6 && (all_digits(code) || (all_alpha(&code[..2]) && all_digits(&code[2..]))) {
        return Some(PartialDecode {
            product_line: None,
            category: None,
            season: None,
            year: None,
            confidence: 0.6,
            matched_pattern: "bare_style",
        });
    }
    None
}

// ---------------------------------------------------------------------------
// The North Face
//
// Current SKUs start NF0A followed by a base-36 style id; older ones just NF.

fn decode_north_face(code: &str) -> Option<PartialDecode> {
    if code.starts_with("NF0A") && code.len() >= 8 {
        return Some(PartialDecode {
            product_line: None,
            category: None,
            season: None,
            year: None,
            confidence: 0.9,
            matched_pattern: "nf0a_style",
        });
    }
    if code.starts_with("NF") && code.len() >= 8 {
        return Some(PartialDecode {
            product_line: None,
            category: None,
            season: None,
            year: None,
            confidence: 0.7,
            matched_pattern: "nf_style",
        });
    }
    None
}

// ---------------------------------------------------------------------------
// Levi's
//
// Lot numbers (501, 511, ...) identify the fit; PC9 codes are the 5-digit lot
// padded left plus a 4-digit finish.

const LEVIS_LOTS: &[(&str, &str, &str)] = &[
    ("501", "501 Original Fit", "jeans"),
    ("505", "505 Regular Fit", "jeans"),
    ("511", "511 Slim Fit", "jeans"),
    ("517", "517 Bootcut", "jeans"),
    ("550", "550 Relaxed Fit", "jeans"),
    ("560", "560 Comfort Fit", "jeans"),
];

fn levis_lot(lot: &str) -> Option<(&'static str, &'static str)> {
    LEVIS_LOTS
        .iter()
        .find(|(candidate, _, _)| *candidate == lot)
        .map(|(_, line, category)| (*line, *category))
}

fn decode_levis(code: &str) -> Option<PartialDecode> {
    // PC9: 5-digit zero-padded lot + 4-digit finish, e.g. 005010114.
    if code.len() == 9 && all_digits(code) {
        let lot = code[..5].trim_start_matches('0');
        if let Some((line, category)) = levis_lot(lot) {
            return Some(PartialDecode {
                product_line: Some(line),
                category: Some(category),
                season: None,
                year: None,
                confidence: 0.85,
                matched_pattern: "pc9",
            });
        }
        return Some(PartialDecode {
            product_line: None,
            category: None,
            season: None,
            year: None,
            confidence: 0.5,
            matched_pattern: "pc9_unknown_lot",
        });
    }
    // Trucker jacket lots are five digits starting 705 (70505 = Type III).
    if code.len() == 5 && code.starts_with("705") && all_digits(code) {
        return Some(PartialDecode {
            product_line: Some("Type III Trucker"),
            category: Some("denim jacket"),
            season: None,
            year: None,
            confidence: 0.85,
            matched_pattern: "trucker_lot",
        });
    }
    if code.len() == 3 && all_digits(code) {
        return Some(match levis_lot(code) {
            Some((line, category)) => PartialDecode {
                product_line: Some(line),
                category: Some(category),
                season: None,
                year: None,
                confidence: 0.9,
                matched_pattern: "lot",
            },
            None => PartialDecode {
                product_line: None,
                category: None,
                season: None,
                year: None,
                confidence: 0.5,
                matched_pattern: "lot_unknown",
            },
        });
    }
    None
}

// ---------------------------------------------------------------------------
// Carhartt
//
// One style letter (K = knits, J = jackets, B = bottoms) plus a short number.

const CARHARTT_STYLES: &[(&str, &str, &str)] = &[
    ("K87", "Workwear Pocket T-Shirt", "t-shirt"),
    ("K121", "Midweight Hooded Sweatshirt", "hoodie"),
    ("J130", "Duck Active Jac", "jacket"),
    ("J140", "Duck Active Jac Quilted", "jacket"),
    ("B01", "Double-Front Work Pant", "pants"),
    ("B136", "Double Front Work Pant Washed", "pants"),
];

fn decode_carhartt(code: &str) -> Option<PartialDecode> {
    let mut chars = code.chars();
    let first = chars.next()?;
    let rest = chars.as_str();
    if !first.is_ascii_alphabetic() || rest.len() < 2 || rest.len() > 4 || !all_digits(rest) {
        return None;
    }
    if let Some((line, category)) = CARHARTT_STYLES
        .iter()
        .find(|(style, _, _)| *style == code)
        .map(|(_, line, category)| (*line, *category))
    {
        return Some(PartialDecode {
            product_line: Some(line),
            category: Some(category),
            season: None,
            year: None,
            confidence: 0.85,
            matched_pattern: "known_style",
        });
    }
    Some(PartialDecode {
        product_line: None,
        category: None,
        season: None,
        year: None,
        confidence: 0.55,
        matched_pattern: "letter_style",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patagonia_better_sweater_decodes_with_high_confidence() {
        let info = decode("PATAGONIA", "25455").expect("decode");
        assert_eq!(info.product_line.as_deref(), Some("Better Sweater"));
        assert_eq!(info.category.as_deref(), Some("fleece"));
        assert!(info.confidence >= 0.7);
        assert_eq!(info.normalized_code, "25455");
    }

    #[test]
    fn patagonia_season_suffix_decodes_season_and_year() {
        let info = decode("patagonia", "25455-F21").expect("decode");
        assert_eq!(info.normalized_code, "25455F21");
        assert_eq!(info.season.as_deref(), Some("fall"));
        assert_eq!(info.year, Some(2021));
        assert_eq!(info.matched_pattern, "style_season_year");
        assert_eq!(info.confidence, 0.9);
    }

    #[test]
    fn decode_is_deterministic() {
        let a = decode("Patagonia", "25455").unwrap();
        let b = decode("Patagonia", "25455").unwrap();
        assert_eq!(a.normalized_code, b.normalized_code);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.matched_pattern, b.matched_pattern);
    }

    #[test]
    fn unknown_brand_returns_none() {
        assert!(get_decoder("Totally Unknown Brand Co").is_none());
        assert!(decode("Totally Unknown Brand Co", "25455").is_none());
    }

    #[test]
    fn brand_aliases_are_case_insensitive() {
        assert_eq!(get_decoder("The North Face"), Some(BrandDecoder::TheNorthFace));
        assert_eq!(get_decoder("  tnf "), Some(BrandDecoder::TheNorthFace));
        assert_eq!(get_decoder("LEVIS"), Some(BrandDecoder::Levis));
        assert_eq!(get_decoder("Levi's"), Some(BrandDecoder::Levis));
    }

    #[test]
    fn nike_modern_style_colorway() {
        let info = decode("Nike", "DV1234-010").expect("decode");
        assert_eq!(info.normalized_code, "DV1234010");
        assert_eq!(info.matched_pattern, "style_colorway");
        assert_eq!(info.confidence, 0.9);
    }

    #[test]
    fn north_face_modern_sku() {
        let info = decode("north face", "NF0A3C8D").expect("decode");
        assert_eq!(info.matched_pattern, "nf0a_style");
        assert!(info.confidence >= 0.9);
    }

    #[test]
    fn levis_lot_number_maps_to_fit() {
        let info = decode("Levi's", "501").expect("decode");
        assert_eq!(info.product_line.as_deref(), Some("501 Original Fit"));
        assert_eq!(info.category.as_deref(), Some("jeans"));
        assert_eq!(info.confidence, 0.9);
    }

    #[test]
    fn levis_pc9_resolves_lot_through_padding() {
        let info = decode("levis", "005010114").expect("decode");
        assert_eq!(info.product_line.as_deref(), Some("501 Original Fit"));
        assert_eq!(info.matched_pattern, "pc9");
    }

    #[test]
    fn carhartt_known_style() {
        let info = decode("Carhartt", "K87").expect("decode");
        assert_eq!(info.product_line.as_deref(), Some("Workwear Pocket T-Shirt"));
        assert_eq!(info.category.as_deref(), Some("t-shirt"));
    }

    #[test]
    fn unstructured_code_falls_back_to_low_confidence() {
        let info = decode("Patagonia", "XYZ-99-ABC").expect("decode");
        assert_eq!(info.matched_pattern, "fallback");
        assert_eq!(info.confidence, 0.3);
    }

    #[test]
    fn too_short_code_is_rejected() {
        assert!(decode("Patagonia", "ab").is_none());
        assert!(decode("Patagonia", "--").is_none());
    }

    #[test]
    fn search_terms_include_brand_and_line() {
        let info = decode("Patagonia", "25455").unwrap();
        assert!(info.search_terms.contains(&"Patagonia 25455".to_string()));
        assert!(
            info.search_terms
                .contains(&"Patagonia Better Sweater".to_string())
        );
    }
}
