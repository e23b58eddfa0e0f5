//! Trial identifier normalization and registry detection.
//!
//! Three registries are recognized by the shape of the identifier:
//!   NCT########     → ClinicalTrials.gov
//!   ####-######-##  → EU Clinical Trials Register (EudraCT number)
//!   DRKS########    → Deutsches Register Klinischer Studien

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Registry {
    Ctgov,
    Euctr,
    Drks,
}

impl Registry {
    pub fn as_str(&self) -> &'static str {
        match self {
            Registry::Ctgov => "ctgov",
            Registry::Euctr => "euctr",
            Registry::Drks  => "drks",
        }
    }
}

impl std::fmt::Display for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static NCT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^NCT\d{8}$").unwrap());
static EUCTR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}-\d{6}-\d{2}$").unwrap());
static DRKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^DRKS\d{8}$").unwrap());

/// Trim surrounding whitespace and uppercase the prefixed forms so that
/// `nct01234567` and `NCT01234567` are the same trial.
pub fn normalize_trial_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("NCT") || upper.starts_with("DRKS") {
        upper
    } else {
        trimmed.to_string()
    }
}

/// Total over all input strings: every string maps to exactly one
/// registry or to `None`. Unknown identifiers never reach an adapter.
pub fn detect_registry(trial_id: &str) -> Option<Registry> {
    if NCT_RE.is_match(trial_id) {
        Some(Registry::Ctgov)
    } else if EUCTR_RE.is_match(trial_id) {
        Some(Registry::Euctr)
    } else if DRKS_RE.is_match(trial_id) {
        Some(Registry::Drks)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_ctgov() {
        assert_eq!(detect_registry("NCT00000001"), Some(Registry::Ctgov));
        assert_eq!(detect_registry("NCT12345678"), Some(Registry::Ctgov));
    }

    #[test]
    fn test_detect_euctr() {
        assert_eq!(detect_registry("2004-000446-20"), Some(Registry::Euctr));
    }

    #[test]
    fn test_detect_drks() {
        assert_eq!(detect_registry("DRKS00004744"), Some(Registry::Drks));
    }

    #[test]
    fn test_detect_is_total() {
        for junk in ["", "NCT123", "nct00000001", "2004-0004-20", "ISRCTN49919664", "DRKS1"] {
            assert_eq!(detect_registry(junk), None, "{junk} should be unknown");
        }
    }

    #[test]
    fn test_normalize_uppercases_prefixes() {
        assert_eq!(normalize_trial_id("  nct01234567 "), "NCT01234567");
        assert_eq!(normalize_trial_id("drks00004744"), "DRKS00004744");
        // EudraCT numbers have no prefix and keep their shape
        assert_eq!(normalize_trial_id(" 2004-000446-20"), "2004-000446-20");
    }

    #[test]
    fn test_normalize_then_detect() {
        assert_eq!(
            detect_registry(&normalize_trial_id("nct01234567")),
            Some(Registry::Ctgov)
        );
    }
}
