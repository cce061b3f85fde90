//! Plate taxonomy.
//!
//! A recognized string is only reported when it has the shape of exactly one
//! regional plate layout. Letters are restricted to the twelve glyphs shared by
//! the Cyrillic and Latin alphabets (A B C E H K M O P T X Y), so visually
//! ambiguous letters can never form a valid plate.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Plate layouts known to the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlateKind {
    /// `A123BC77`: letter, 3 digits, 2 letters, 2-3 digit region.
    Car,
    /// `AB12377`: 2 letters, 3 digits, 2-3 digit region.
    PublicTransport,
    /// `1234AB77`: 4 digits, 2 letters, 2-3 digit region.
    Military,
    /// `123D45677`: 3 digits, `D`, 3 digits, 2 digit region.
    Diplomatic,
    /// `A123477`: letter, 4 digits, 2-3 digit region.
    Police,
}

impl PlateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlateKind::Car => "car",
            PlateKind::PublicTransport => "public",
            PlateKind::Military => "military",
            PlateKind::Diplomatic => "diplomatic",
            PlateKind::Police => "police",
        }
    }
}

impl fmt::Display for PlateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A string accepted by the taxonomy, normalized to uppercase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedPlate {
    pub text: String,
    pub kind: PlateKind,
    /// Capture groups of the matching layout (series, number, region, ...).
    pub parts: Vec<String>,
}

fn patterns() -> &'static [(Regex, PlateKind)] {
    static PATTERNS: OnceLock<Vec<(Regex, PlateKind)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                r"^([abcehkmoptxy])(\d{3})([abcehkmoptxy]{2})(\d{2,3})$",
                PlateKind::Car,
            ),
            (
                r"^([abcehkmoptxy]{2})(\d{3})(\d{2,3})$",
                PlateKind::PublicTransport,
            ),
            (
                r"^(\d{4})([abcehkmoptxy]{2})(\d{2,3})$",
                PlateKind::Military,
            ),
            (r"^(\d{3})(d)(\d{3})(\d{2})$", PlateKind::Diplomatic),
            (r"^([abcehkmoptxy])(\d{4})(\d{2,3})$", PlateKind::Police),
        ]
        .into_iter()
        .map(|(pattern, kind)| {
            // Literal patterns; compilation cannot fail.
            let regex = Regex::new(pattern).expect("static plate pattern");
            (regex, kind)
        })
        .collect()
    })
}

/// Classify a candidate string. Case-insensitive.
///
/// Returns `None` unless exactly one layout matches.
pub fn parse(candidate: &str) -> Option<ParsedPlate> {
    let lowered = candidate.trim().to_lowercase();
    let mut found: Option<ParsedPlate> = None;
    for (regex, kind) in patterns() {
        let Some(caps) = regex.captures(&lowered) else {
            continue;
        };
        if found.is_some() {
            return None;
        }
        found = Some(ParsedPlate {
            text: lowered.to_uppercase(),
            kind: *kind,
            parts: caps
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str().to_uppercase())
                .collect(),
        });
    }
    found
}

/// Layout of a string, if it is a valid plate.
pub fn classify(candidate: &str) -> Option<PlateKind> {
    parse(candidate).map(|parsed| parsed.kind)
}

pub fn is_valid(candidate: &str) -> bool {
    parse(candidate).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_each_layout() {
        assert_eq!(classify("A123BC77"), Some(PlateKind::Car));
        assert_eq!(classify("a123bc777"), Some(PlateKind::Car));
        assert_eq!(classify("AB12377"), Some(PlateKind::PublicTransport));
        assert_eq!(classify("1234AB77"), Some(PlateKind::Military));
        assert_eq!(classify("123D45677"), Some(PlateKind::Diplomatic));
        assert_eq!(classify("A1234777"), Some(PlateKind::Police));
    }

    #[test]
    fn rejects_ambiguous_letters() {
        // D, F, G, I, J, L, N, Q, R, S, U, V, W, Z never appear on plates.
        assert_eq!(classify("D123BC77"), None);
        assert_eq!(classify("A123SZ77"), None);
        assert_eq!(classify("R123BC77"), None);
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert_eq!(classify(""), None);
        assert_eq!(classify("A123BC7"), None);
        assert_eq!(classify("A123BC7777"), None);
        assert_eq!(classify("123D4567"), None);
    }

    #[test]
    fn parse_normalizes_and_splits_groups() {
        let parsed = parse("a123bc77").unwrap();
        assert_eq!(parsed.text, "A123BC77");
        assert_eq!(parsed.kind, PlateKind::Car);
        assert_eq!(parsed.parts, vec!["A", "123", "BC", "77"]);
    }

    #[test]
    fn classification_is_idempotent() {
        for candidate in [
            "A123BC77",
            "AB12377",
            "1234AB777",
            "123D45677",
            "A1234777",
            "x999yy199",
        ] {
            let first = parse(candidate).unwrap();
            let second = parse(&first.text).unwrap();
            assert_eq!(first.kind, second.kind, "{}", candidate);
            assert_eq!(first.text, second.text, "{}", candidate);
        }
    }
}
