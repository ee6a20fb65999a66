//! Classification ordinals and national marking tables
//!
//! Coalition partners issue clearances in their own vocabulary (`GEHEIM`,
//! `SECRET DEFENSE`, `ALTO SECRETO`, ...). Everything past the credential
//! boundary works with the single [`Clearance`] ordinal defined here.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Normalized classification / clearance ordinal
///
/// The derived `Ord` follows declaration order, so
/// `UNCLASSIFIED < CONFIDENTIAL < SECRET < TOP_SECRET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Clearance {
    Unclassified,
    Confidential,
    Secret,
    TopSecret,
}

impl Clearance {
    /// All levels in ascending order
    pub const ALL: [Clearance; 4] = [
        Clearance::Unclassified,
        Clearance::Confidential,
        Clearance::Secret,
        Clearance::TopSecret,
    ];

    /// Numeric ordinal (0 = UNCLASSIFIED)
    pub fn ordinal(self) -> u8 {
        match self {
            Clearance::Unclassified => 0,
            Clearance::Confidential => 1,
            Clearance::Secret => 2,
            Clearance::TopSecret => 3,
        }
    }

    /// Canonical wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Clearance::Unclassified => "UNCLASSIFIED",
            Clearance::Confidential => "CONFIDENTIAL",
            Clearance::Secret => "SECRET",
            Clearance::TopSecret => "TOP_SECRET",
        }
    }

    /// Parse a canonical (US/NATO-neutral) level name
    ///
    /// Accepts `TOP_SECRET`, `TOP SECRET` and `TOP-SECRET` spellings in any case.
    pub fn parse(s: &str) -> Option<Self> {
        match normalize_marking(s).as_str() {
            "UNCLASSIFIED" | "U" => Some(Clearance::Unclassified),
            "CONFIDENTIAL" | "C" => Some(Clearance::Confidential),
            "SECRET" | "S" => Some(Clearance::Secret),
            "TOP SECRET" | "TS" => Some(Clearance::TopSecret),
            _ => None,
        }
    }

    /// Resolve a marking issued by `country` (ISO 3166 alpha-3, or `NATO`)
    ///
    /// Falls back to the canonical names when the country has no table or the
    /// marking is not in it.
    pub fn from_national(country: &str, marking: &str) -> Option<Self> {
        let normalized = normalize_marking(marking);
        if let Some(table) = NATIONAL_TABLES.get(country.trim().to_uppercase().as_str()) {
            if let Some((_, level)) = table.iter().find(|(name, _)| *name == normalized) {
                return Some(*level);
            }
        }
        if let Some((_, level)) = NATIONAL_TABLES
            .get("NATO")
            .and_then(|table| table.iter().find(|(name, _)| *name == normalized))
        {
            return Some(*level);
        }
        Self::parse(marking)
    }
}

impl fmt::Display for Clearance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uppercase, fold `_`/`-` into spaces and collapse whitespace
pub fn normalize_marking(marking: &str) -> String {
    marking
        .to_uppercase()
        .replace(|c: char| c == '_' || c == '-', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

lazy_static! {
    /// Per-nation marking tables, keys already normalized
    static ref NATIONAL_TABLES: HashMap<&'static str, Vec<(&'static str, Clearance)>> = {
        use Clearance::*;
        let anglo = vec![
            ("UNCLASSIFIED", Unclassified),
            ("CONFIDENTIAL", Confidential),
            ("SECRET", Secret),
            ("TOP SECRET", TopSecret),
        ];
        let mut m = HashMap::new();
        m.insert("USA", anglo.clone());
        m.insert("CAN", {
            let mut t = anglo.clone();
            t.push(("PROTECTED A", Unclassified));
            t.push(("PROTECTED B", Confidential));
            t
        });
        m.insert("AUS", {
            let mut t = anglo.clone();
            t.push(("OFFICIAL", Unclassified));
            t.push(("PROTECTED", Confidential));
            t
        });
        m.insert("NZL", {
            let mut t = anglo.clone();
            t.push(("RESTRICTED", Confidential));
            t
        });
        m.insert("GBR", vec![
            ("OFFICIAL", Unclassified),
            ("OFFICIAL SENSITIVE", Confidential),
            ("CONFIDENTIAL", Confidential),
            ("SECRET", Secret),
            ("TOP SECRET", TopSecret),
        ]);
        m.insert("FRA", vec![
            ("NON PROTEGE", Unclassified),
            ("DIFFUSION RESTREINTE", Unclassified),
            ("CONFIDENTIEL DEFENSE", Confidential),
            ("SECRET DEFENSE", Secret),
            ("SECRET", Secret),
            ("TRES SECRET DEFENSE", TopSecret),
            ("TRES SECRET", TopSecret),
        ]);
        m.insert("DEU", vec![
            ("OFFEN", Unclassified),
            ("VS NUR FUR DEN DIENSTGEBRAUCH", Unclassified),
            ("VS VERTRAULICH", Confidential),
            ("GEHEIM", Secret),
            ("STRENG GEHEIM", TopSecret),
        ]);
        m.insert("ESP", vec![
            ("NO CLASIFICADO", Unclassified),
            ("DIFUSION LIMITADA", Unclassified),
            ("CONFIDENCIAL", Confidential),
            ("SECRETO", Secret),
            ("ALTO SECRETO", TopSecret),
        ]);
        m.insert("ITA", vec![
            ("NON CLASSIFICATO", Unclassified),
            ("RISERVATO", Confidential),
            ("RISERVATISSIMO", Confidential),
            ("SEGRETO", Secret),
            ("SEGRETISSIMO", TopSecret),
        ]);
        m.insert("NLD", vec![
            ("NIET GERUBRICEERD", Unclassified),
            ("DEPARTEMENTAAL VERTROUWELIJK", Unclassified),
            ("VERTROUWELIJK", Confidential),
            ("GEHEIM", Secret),
            ("ZEER GEHEIM", TopSecret),
        ]);
        m.insert("POL", vec![
            ("NIEJAWNE", Unclassified),
            ("ZASTRZEZONE", Unclassified),
            ("POUFNE", Confidential),
            ("TAJNE", Secret),
            ("SCISLE TAJNE", TopSecret),
        ]);
        m.insert("NATO", vec![
            ("NATO UNCLASSIFIED", Unclassified),
            ("NATO RESTRICTED", Unclassified),
            ("NATO CONFIDENTIAL", Confidential),
            ("NATO SECRET", Secret),
            ("COSMIC TOP SECRET", TopSecret),
        ]);
        m
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Clearance::Unclassified < Clearance::Confidential);
        assert!(Clearance::Confidential < Clearance::Secret);
        assert!(Clearance::Secret < Clearance::TopSecret);
        assert_eq!(Clearance::TopSecret.ordinal(), 3);
    }

    #[test]
    fn test_canonical_parse() {
        assert_eq!(Clearance::parse("top_secret"), Some(Clearance::TopSecret));
        assert_eq!(Clearance::parse("Top Secret"), Some(Clearance::TopSecret));
        assert_eq!(Clearance::parse("SECRET"), Some(Clearance::Secret));
        assert_eq!(Clearance::parse("restricted"), None);
    }

    #[test]
    fn test_national_markings() {
        assert_eq!(
            Clearance::from_national("DEU", "VS-VERTRAULICH"),
            Some(Clearance::Confidential)
        );
        assert_eq!(Clearance::from_national("deu", "GEHEIM"), Some(Clearance::Secret));
        assert_eq!(
            Clearance::from_national("FRA", "TRES SECRET DEFENSE"),
            Some(Clearance::TopSecret)
        );
        assert_eq!(Clearance::from_national("ESP", "Alto Secreto"), Some(Clearance::TopSecret));
        assert_eq!(Clearance::from_national("POL", "POUFNE"), Some(Clearance::Confidential));
        assert_eq!(Clearance::from_national("GBR", "OFFICIAL"), Some(Clearance::Unclassified));
    }

    #[test]
    fn test_nato_markings_accepted_from_any_country() {
        assert_eq!(
            Clearance::from_national("ITA", "COSMIC TOP SECRET"),
            Some(Clearance::TopSecret)
        );
        assert_eq!(Clearance::from_national("XYZ", "NATO SECRET"), Some(Clearance::Secret));
    }

    #[test]
    fn test_unknown_country_falls_back_to_canonical() {
        assert_eq!(Clearance::from_national("XYZ", "SECRET"), Some(Clearance::Secret));
        assert_eq!(Clearance::from_national("XYZ", "GEHEIM"), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Clearance::TopSecret).unwrap();
        assert_eq!(json, "\"TOP_SECRET\"");
        let parsed: Clearance = serde_json::from_str("\"CONFIDENTIAL\"").unwrap();
        assert_eq!(parsed, Clearance::Confidential);
    }
}
