//! Free-text extraction for listing titles and search snippets (French listing conventions).

use std::sync::LazyLock;

use estate_core::EnergyRating;
use regex::Regex;

const MIN_PRICE_EUR: u64 = 30_000;
const MAX_PRICE_EUR: u64 = 5_000_000;
const MIN_SIZE_M2: f64 = 8.0;
const MAX_SIZE_M2: f64 = 500.0;

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid built-in pattern {pattern}: {err}"))
}

static PRICE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        compile(r"(?i)(\d[\d\s.]{2,})\s*(?:eur\b|euros?\b|€)"),
        compile(r"(?i)(?:eur\b|€)\s*(\d[\d\s.]{2,})"),
        compile(r"(?i)(\d{5,})\s*(?:eur\b|euros?\b|€)"),
    ]
});

static SIZE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        compile(r"(?i)(\d+(?:[.,]\d+)?)\s*m[2²]"),
        compile(r"(?i)(\d+(?:[.,]\d+)?)\s*m\b"),
    ]
});

static AREA_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        compile(r"(?i)lyon\s*(\d{1,2})\s*(?:er|e|eme|ème)\b"),
        compile(r"\b690(\d{2})\b"),
        compile(r"(?i)lyon\s+(\d)\b"),
    ]
});

static ROOMS_LABEL: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)\b[tf](\d)\b"));
static ROOMS_PIECES: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)(\d)\s*pi[eè]ces?\b"));

static ENERGY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        compile(r"(?i)\bdpe\s*[:\s]*([a-g])\b"),
        compile(r"(?i)\bclasse\s+(?:[ée]nergie\s*[:\s]*)?([a-g])\b"),
    ]
});

/// Asking price in EUR. Thousands separators (spaces, dots, commas) are ignored.
pub fn parse_price(text: &str) -> Option<f64> {
    PRICE_PATTERNS.iter().find_map(|re| {
        re.captures_iter(text).find_map(|caps| {
            let digits: String = caps[1].chars().filter(char::is_ascii_digit).collect();
            let price: u64 = digits.parse().ok()?;
            (MIN_PRICE_EUR < price && price < MAX_PRICE_EUR).then_some(price as f64)
        })
    })
}

/// Living area in m²; a decimal comma is accepted.
pub fn parse_size(text: &str) -> Option<f64> {
    SIZE_PATTERNS.iter().find_map(|re| {
        re.captures_iter(text).find_map(|caps| {
            let size: f64 = caps[1].replace(',', ".").parse().ok()?;
            (MIN_SIZE_M2 < size && size < MAX_SIZE_M2).then_some(size)
        })
    })
}

/// Lyon arrondissement ("Lyon 1er" .. "Lyon 9e") from a label or a 6900x postal code.
pub fn parse_area(text: &str) -> Option<String> {
    AREA_PATTERNS.iter().find_map(|re| {
        re.captures_iter(text).find_map(|caps| {
            let n: u8 = caps[1].parse().ok()?;
            arrondissement_label(n)
        })
    })
}

pub fn arrondissement_label(n: u8) -> Option<String> {
    match n {
        1 => Some("Lyon 1er".to_string()),
        2..=9 => Some(format!("Lyon {n}e")),
        _ => None,
    }
}

/// Room count from "T3"/"F3" or "3 pièces".
pub fn parse_rooms(text: &str) -> Option<u32> {
    ROOMS_LABEL
        .captures(text)
        .or_else(|| ROOMS_PIECES.captures(text))
        .and_then(|caps| caps[1].parse().ok())
}

pub fn parse_energy_rating(text: &str) -> Option<EnergyRating> {
    ENERGY_PATTERNS
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| EnergyRating::parse(&caps[1]))
}

/// Truncates to at most `max_chars` characters, trimming surrounding whitespace.
pub fn clip(text: &str, max_chars: usize) -> String {
    text.trim().chars().take(max_chars).collect::<String>().trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prices_in_common_french_formats() {
        assert_eq!(parse_price("Appartement 250 000 € Lyon"), Some(250_000.0));
        assert_eq!(parse_price("prix: 189.000 EUR"), Some(189_000.0));
        assert_eq!(parse_price("€ 320 500 frais inclus"), Some(320_500.0));
        assert_eq!(parse_price("vendu 415000 euros"), Some(415_000.0));
        assert_eq!(parse_price("charges 1 200 € / an"), None);
        assert_eq!(parse_price("aucun prix"), None);
    }

    #[test]
    fn sizes_with_units_and_bounds() {
        assert_eq!(parse_size("T2 de 45 m² lumineux"), Some(45.0));
        assert_eq!(parse_size("surface 62,5 m2"), Some(62.5));
        assert_eq!(parse_size("72 m traversant"), Some(72.0));
        assert_eq!(parse_size("cave de 4 m²"), None);
    }

    #[test]
    fn arrondissements_from_labels_and_postcodes() {
        assert_eq!(parse_area("Vente appartement Lyon 3ème"), Some("Lyon 3e".into()));
        assert_eq!(parse_area("LYON 1ER - Terreaux"), Some("Lyon 1er".into()));
        assert_eq!(parse_area("69007 Lyon"), Some("Lyon 7e".into()));
        assert_eq!(parse_area("Lyon 8 Monplaisir"), Some("Lyon 8e".into()));
        assert_eq!(parse_area("Villeurbanne 69100"), None);
        assert_eq!(parse_area("Paris 11e"), None);
    }

    #[test]
    fn rooms_and_energy_ratings() {
        assert_eq!(parse_rooms("Appartement T3 Croix-Rousse"), Some(3));
        assert_eq!(parse_rooms("Bel appartement 4 pièces"), Some(4));
        assert_eq!(parse_rooms("Studio"), None);
        assert_eq!(parse_energy_rating("DPE : F, à rénover"), Some(EnergyRating::F));
        assert_eq!(parse_energy_rating("classe énergie C"), Some(EnergyRating::C));
        assert_eq!(parse_energy_rating("dpe en cours"), None);
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("  Très bel appartement  ", 5), "Très");
        assert_eq!(clip("abc", 10), "abc");
    }
}
