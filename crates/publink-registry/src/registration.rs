//! The canonical, registry-agnostic trial registration record.

use chrono::NaiveDate;
use publink_common::{FetchKind, PublinkError, Registry, Result};
use serde::{Deserialize, Serialize};

/// A literature reference attached to the registration itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reference {
    pub pmid: Option<String>,
    pub citation: Option<String>,
}

/// Immutable after fetch; every adapter normalizes into this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub trial_id: String,
    pub registry: Registry,

    pub brief_title: Option<String>,
    pub official_title: Option<String>,
    pub acronym: Option<String>,

    pub brief_summary: Option<String>,
    pub detailed_description: Option<String>,

    pub overall_status: Option<String>,
    /// Partial ISO dates (`YYYY`, `YYYY-MM`, or `YYYY-MM-DD`).
    pub start_date: Option<String>,
    pub completion_date: Option<String>,

    /// Lead sponsor or responsible organization.
    pub organization: Option<String>,
    pub investigator_full_name: Option<String>,
    pub principal_investigators: Vec<String>,

    pub study_type: Option<String>,
    pub phase: Option<String>,
    pub sex: Option<String>,
    pub conditions: Vec<String>,
    pub interventions: Vec<String>,

    /// The registry's own results claim; kept for provenance only and
    /// never shown to the classifier.
    pub has_results: Option<bool>,

    pub references: Vec<Reference>,
    /// PMIDs scraped from the EUCTR results page.
    pub linked_pubmed_ids: Vec<String>,
}

impl Registration {
    pub fn new(trial_id: impl Into<String>, registry: Registry) -> Self {
        Self {
            trial_id: trial_id.into(),
            registry,
            brief_title: None,
            official_title: None,
            acronym: None,
            brief_summary: None,
            detailed_description: None,
            overall_status: None,
            start_date: None,
            completion_date: None,
            organization: None,
            investigator_full_name: None,
            principal_investigators: Vec::new(),
            study_type: None,
            phase: None,
            sex: None,
            conditions: Vec::new(),
            interventions: Vec::new(),
            has_results: None,
            references: Vec::new(),
            linked_pubmed_ids: Vec::new(),
        }
    }

    /// The best display title available.
    pub fn title(&self) -> Option<&str> {
        self.brief_title.as_deref().or(self.official_title.as_deref())
    }

    /// Adapter-side sanity check: at least one title, and the date pair
    /// in order when both are present.
    pub fn validate(&self) -> Result<()> {
        if self.brief_title.is_none() && self.official_title.is_none() {
            return Err(PublinkError::RegistryFetch {
                trial_id: self.trial_id.clone(),
                kind: FetchKind::Parse,
                message: "record has neither brief nor official title".to_string(),
            });
        }
        if let (Some(start), Some(end)) = (&self.start_date, &self.completion_date) {
            // ISO-prefix strings compare correctly as strings.
            if start.as_str() > end.as_str() {
                return Err(PublinkError::RegistryFetch {
                    trial_id: self.trial_id.clone(),
                    kind: FetchKind::Parse,
                    message: format!("start date {start} after completion date {end}"),
                });
            }
        }
        Ok(())
    }
}

/// Normalize the date spellings the registries use into an ISO prefix.
/// Accepts `YYYY[-MM[-DD]]` as-is, `DD.MM.YYYY` (DRKS), and
/// `Month DD, YYYY` / `Month YYYY` (older CTGov exports).
pub fn normalize_date(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let iso_shape = |t: &str| {
        let bytes = t.as_bytes();
        match t.len() {
            4 => bytes.iter().all(u8::is_ascii_digit),
            7 => t[..4].bytes().all(|b| b.is_ascii_digit())
                && bytes[4] == b'-'
                && t[5..].bytes().all(|b| b.is_ascii_digit()),
            10 => NaiveDate::parse_from_str(t, "%Y-%m-%d").is_ok(),
            _ => false,
        }
    };
    if iso_shape(s) {
        return Some(s.to_string());
    }

    if let Ok(d) = NaiveDate::parse_from_str(s, "%d.%m.%Y") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%B %d, %Y") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    // "June 2005" has no day; chrono needs one to parse.
    if let Ok(d) = NaiveDate::parse_from_str(&format!("{s} 1"), "%B %Y %d") {
        return Some(d.format("%Y-%m").to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_a_title() {
        let mut reg = Registration::new("NCT00000001", Registry::Ctgov);
        assert!(reg.validate().is_err());
        reg.brief_title = Some("X".to_string());
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_dates() {
        let mut reg = Registration::new("NCT00000001", Registry::Ctgov);
        reg.brief_title = Some("X".to_string());
        reg.start_date = Some("2012-01".to_string());
        reg.completion_date = Some("2010".to_string());
        assert!(reg.validate().is_err());

        reg.completion_date = Some("2012-05-01".to_string());
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn test_normalize_date_shapes() {
        assert_eq!(normalize_date("2005"), Some("2005".to_string()));
        assert_eq!(normalize_date("2005-06"), Some("2005-06".to_string()));
        assert_eq!(normalize_date("2005-06-01"), Some("2005-06-01".to_string()));
        assert_eq!(normalize_date("17.05.2004"), Some("2004-05-17".to_string()));
        assert_eq!(normalize_date("June 1, 2005"), Some("2005-06-01".to_string()));
        assert_eq!(normalize_date("June 2005"), Some("2005-06".to_string()));
        assert_eq!(normalize_date("not a date"), None);
        assert_eq!(normalize_date(""), None);
    }

    #[test]
    fn test_title_prefers_brief() {
        let mut reg = Registration::new("NCT00000001", Registry::Ctgov);
        reg.official_title = Some("Official".to_string());
        assert_eq!(reg.title(), Some("Official"));
        reg.brief_title = Some("Brief".to_string());
        assert_eq!(reg.title(), Some("Brief"));
    }
}
