//! Date-window filters applied between enrichment and classification.
//!
//! Partial ISO dates compare correctly as strings: "2020" < "2020-01"
//! < "2020-01-01". Both filters keep publications without a usable date
//! rather than over-filter; the max filter additionally treats a
//! syntactically invalid date as ineligible.

use std::sync::LazyLock;

use regex::Regex;

use crate::publication::Publication;

static ISO_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}(-\d{2}(-\d{2})?)?$").unwrap());

pub fn is_iso_prefix(s: &str) -> bool {
    ISO_PREFIX_RE.is_match(s)
}

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub eligible: Vec<Publication>,
    pub filtered: Vec<Publication>,
}

/// Keep publications published strictly before `cutoff`, plus those with
/// no date. Used to simulate a point-in-time run for validation.
pub fn max_date_filter(publications: Vec<Publication>, cutoff: &str) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    for publication in publications {
        let keep = match publication.publication_date.as_deref() {
            None => true,
            Some(date) if !is_iso_prefix(date) => false,
            Some(date) => date < cutoff,
        };
        if keep {
            outcome.eligible.push(publication);
        } else {
            outcome.filtered.push(publication);
        }
    }
    outcome
}

/// Drop publications that clearly predate the trial start. Missing or
/// unusable dates are kept, as is everything when the registration has
/// no start date.
pub fn min_date_filter(publications: Vec<Publication>, start_date: Option<&str>) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    let Some(start) = start_date else {
        outcome.eligible = publications;
        return outcome;
    };

    for publication in publications {
        let keep = match publication.publication_date.as_deref() {
            None => true,
            Some(date) if !is_iso_prefix(date) => true,
            Some(date) => date >= start,
        };
        if keep {
            outcome.eligible.push(publication);
        } else {
            outcome.filtered.push(publication);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publication(pmid: &str, date: Option<&str>) -> Publication {
        let mut p = Publication::from_pmid(pmid);
        p.publication_date = date.map(String::from);
        p
    }

    fn pmids(pubs: &[Publication]) -> Vec<&str> {
        pubs.iter().map(|p| p.pmid.as_str()).collect()
    }

    #[test]
    fn test_iso_prefix_string_order() {
        // The property the whole comparison scheme rests on.
        assert!("2020" < "2020-01");
        assert!("2020-01" < "2020-01-01");
        assert!("2020-01-01" < "2020-02");
        assert!("2019-12-31" < "2020");
    }

    #[test]
    fn test_min_date_filter_keeps_unknowns() {
        let pubs = vec![
            publication("A", Some("2009-12")),
            publication("B", Some("2012")),
            publication("C", None),
        ];
        let outcome = min_date_filter(pubs, Some("2010-01-01"));
        assert_eq!(pmids(&outcome.eligible), vec!["B", "C"]);
        assert_eq!(pmids(&outcome.filtered), vec!["A"]);
    }

    #[test]
    fn test_min_date_filter_without_start_keeps_all() {
        let pubs = vec![publication("A", Some("1990")), publication("B", None)];
        let outcome = min_date_filter(pubs, None);
        assert_eq!(outcome.eligible.len(), 2);
        assert!(outcome.filtered.is_empty());
    }

    #[test]
    fn test_min_date_filter_keeps_invalid_dates() {
        let pubs = vec![publication("A", Some("Spring 2009"))];
        let outcome = min_date_filter(pubs, Some("2010-01-01"));
        assert_eq!(pmids(&outcome.eligible), vec!["A"]);
    }

    #[test]
    fn test_max_date_filter_cutoff_is_exclusive() {
        let pubs = vec![
            publication("A", Some("2020-11-16")),
            publication("B", Some("2020-11-17")),
            publication("C", Some("2021")),
            publication("D", None),
        ];
        let outcome = max_date_filter(pubs, "2020-11-17");
        assert_eq!(pmids(&outcome.eligible), vec!["A", "D"]);
        assert_eq!(pmids(&outcome.filtered), vec!["B", "C"]);
    }

    #[test]
    fn test_max_date_filter_drops_invalid_dates() {
        let pubs = vec![publication("A", Some("17.11.2020"))];
        let outcome = max_date_filter(pubs, "2023-02-15");
        assert!(outcome.eligible.is_empty());
        assert_eq!(pmids(&outcome.filtered), vec!["A"]);
    }

    #[test]
    fn test_partial_dates_flow_through_both_filters() {
        let pubs = vec![
            publication("Y", Some("2020")),
            publication("YM", Some("2020-06")),
            publication("YMD", Some("2020-06-15")),
        ];
        let outcome = max_date_filter(pubs, "2023-02-15");
        assert_eq!(outcome.eligible.len(), 3);
        let outcome = min_date_filter(outcome.eligible, Some("2020-06"));
        assert_eq!(pmids(&outcome.eligible), vec!["YM", "YMD"]);
        assert_eq!(pmids(&outcome.filtered), vec!["Y"]);
    }
}
