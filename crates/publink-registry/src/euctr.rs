//! EU Clinical Trials Register adapter.
//!
//! EUCTR serves a plain-text protocol dump with numbered field headers
//! ("A.3 Full title of the trial: …") and, separately, an HTML results
//! page. Both are fetched in parallel; the results page contributes the
//! `has_results` flag and any PubMed links posted with the results.

use std::sync::LazyLock;

use publink_common::{FetchKind, PublinkError, Registry, Result};
use regex::Regex;
use tracing::{instrument, warn};

use crate::registration::{normalize_date, Registration};

const EUCTR_DOWNLOAD_URL: &str =
    "https://www.clinicaltrialsregister.eu/ctr-search/rest/download/full";
const EUCTR_TRIAL_URL: &str = "https://www.clinicaltrialsregister.eu/ctr-search/trial";

static FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z](?:\.\d+)*)\s+([^:]{3,}):\s*(.*)$").unwrap());
static PUBMED_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ncbi\.nlm\.nih\.gov/pubmed/(\d+)").unwrap());

pub struct EuctrAdapter {
    client: reqwest::Client,
}

impl EuctrAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self, trial_id: &str) -> Result<Registration> {
        let (protocol, results_page) = tokio::join!(
            self.fetch_protocol(trial_id),
            self.fetch_results_page(trial_id),
        );

        let protocol = protocol?;
        let mut reg = parse_protocol(trial_id, &protocol)?;

        match results_page {
            Ok(Some(html)) => {
                reg.has_results = Some(page_has_results(&html));
                reg.linked_pubmed_ids = scrape_pubmed_ids(&html);
            }
            Ok(None) => reg.has_results = Some(false),
            Err(e) => {
                warn!(trial_id, error = %e, "EUCTR results page unavailable");
                reg.has_results = None;
            }
        }

        reg.validate()?;
        Ok(reg)
    }

    async fn fetch_protocol(&self, trial_id: &str) -> Result<String> {
        let resp = self
            .client
            .get(EUCTR_DOWNLOAD_URL)
            .query(&[("query", trial_id), ("mode", "current_page")])
            .send()
            .await
            .map_err(|e| transport(trial_id, e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PublinkError::RegistryFetch {
                trial_id: trial_id.to_string(),
                kind: FetchKind::NotFound,
                message: "no such EudraCT record".to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(transport(trial_id, format!("HTTP {}", resp.status())));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| transport(trial_id, e.to_string()))?;
        if text.trim().is_empty() {
            return Err(PublinkError::RegistryFetch {
                trial_id: trial_id.to_string(),
                kind: FetchKind::NotFound,
                message: "empty protocol dump".to_string(),
            });
        }
        Ok(text)
    }

    async fn fetch_results_page(&self, trial_id: &str) -> Result<Option<String>> {
        let url = format!("{EUCTR_TRIAL_URL}/{trial_id}/results");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport(trial_id, e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(transport(trial_id, format!("HTTP {}", resp.status())));
        }
        Ok(Some(resp.text().await.map_err(|e| transport(trial_id, e.to_string()))?))
    }
}

fn transport(trial_id: &str, message: String) -> PublinkError {
    PublinkError::RegistryFetch {
        trial_id: trial_id.to_string(),
        kind: FetchKind::Transport,
        message,
    }
}

/// Split the protocol dump into (code, value) pairs. Codes repeat when a
/// trial has several products, so the result keeps every occurrence in
/// document order. Lines that match no header continue the previous value.
fn parse_fields(text: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if let Some(caps) = FIELD_RE.captures(line) {
            fields.push((caps[1].to_string(), caps[3].trim().to_string()));
        } else if let Some(last) = fields.last_mut() {
            let cont = line.trim();
            if !cont.is_empty() {
                if !last.1.is_empty() {
                    last.1.push(' ');
                }
                last.1.push_str(cont);
            }
        }
    }
    fields
}

fn first<'a>(fields: &'a [(String, String)], code: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(c, v)| c == code && !v.is_empty())
        .map(|(_, v)| v.as_str())
}

fn all(fields: &[(String, String)], code: &str) -> Vec<String> {
    fields
        .iter()
        .filter(|(c, v)| c == code && !v.is_empty())
        .map(|(_, v)| v.clone())
        .collect()
}

fn parse_protocol(trial_id: &str, text: &str) -> Result<Registration> {
    let fields = parse_fields(text);
    if fields.is_empty() {
        return Err(PublinkError::RegistryFetch {
            trial_id: trial_id.to_string(),
            kind: FetchKind::Parse,
            message: "no numbered fields found in protocol dump".to_string(),
        });
    }

    let mut reg = Registration::new(trial_id, Registry::Euctr);

    reg.official_title = first(&fields, "A.3").map(String::from);
    reg.brief_title = first(&fields, "A.3.1").map(String::from);
    reg.acronym = first(&fields, "A.3.2").map(String::from);

    reg.brief_summary = first(&fields, "E.2.1").map(String::from);
    reg.detailed_description = first(&fields, "E.2.2").map(String::from);

    reg.organization = first(&fields, "B.1.1").map(String::from);

    reg.conditions = first(&fields, "E.1.1")
        .map(|c| c.split(';').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let mut interventions = all(&fields, "D.3.1");
    interventions.dedup();
    reg.interventions = interventions;

    reg.phase = phase_from_flags(&fields);
    reg.sex = sex_from_flags(&fields);
    reg.study_type = Some("Interventional".to_string());

    reg.overall_status = first(&fields, "P").map(String::from);
    reg.start_date = first(&fields, "N")
        .and_then(normalize_date)
        .or_else(|| first(&fields, "X.4").and_then(normalize_date));
    reg.completion_date = first(&fields, "P.1").and_then(normalize_date);

    Ok(reg)
}

/// E.7.1–E.7.4 carry yes/no flags for phases I–IV.
fn phase_from_flags(fields: &[(String, String)]) -> Option<String> {
    let names = [("E.7.1", "Phase I"), ("E.7.2", "Phase II"), ("E.7.3", "Phase III"), ("E.7.4", "Phase IV")];
    let set: Vec<&str> = names
        .iter()
        .filter(|(code, _)| {
            first(fields, code).map(|v| v.eq_ignore_ascii_case("yes")).unwrap_or(false)
        })
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() { None } else { Some(set.join("/")) }
}

/// F.2.1 (female) and F.2.2 (male) carry yes/no flags.
fn sex_from_flags(fields: &[(String, String)]) -> Option<String> {
    let female = first(fields, "F.2.1").map(|v| v.eq_ignore_ascii_case("yes"));
    let male = first(fields, "F.2.2").map(|v| v.eq_ignore_ascii_case("yes"));
    match (female, male) {
        (Some(true), Some(true)) => Some("All".to_string()),
        (Some(true), _) => Some("Female".to_string()),
        (_, Some(true)) => Some("Male".to_string()),
        _ => None,
    }
}

fn page_has_results(html: &str) -> bool {
    ["Results information", "End points reported", "Adverse events reported"]
        .iter()
        .any(|marker| html.contains(marker))
}

fn scrape_pubmed_ids(html: &str) -> Vec<String> {
    let mut ids: Vec<String> = PUBMED_LINK_RE
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTOCOL: &str = "\
A.2 EudraCT number: 2004-000446-20
A.3 Full title of the trial: A Randomised Trial of Something\n\
    Continued Across Lines
A.3.1 Title of the trial for lay people, in easily understood language: Something Trial
A.3.2 Name or abbreviated title of the trial where available: SOME
B.1.1 Name of Sponsor: University Hospital
D.3.1 Product name: Drugamab
D.3.1 Product name: Placebo
E.1.1 Medical condition(s) being investigated: Chronic headache; Migraine
E.2.1 Main objective of the trial: To compare X with Y.
E.7.3 Therapeutic confirmatory (Phase III): Yes
E.7.4 Therapeutic use (Phase IV): No
F.2.1 Female: Yes
F.2.2 Male: Yes
N Date on which this record was first entered in the EudraCT database: 2004-10-14
P End of Trial Status: Completed
P.1 Date of the global end of the trial: 2008-03-02
";

    #[test]
    fn test_parse_protocol_fields() {
        let reg = parse_protocol("2004-000446-20", PROTOCOL).unwrap();
        assert_eq!(
            reg.official_title.as_deref(),
            Some("A Randomised Trial of Something Continued Across Lines")
        );
        assert_eq!(reg.brief_title.as_deref(), Some("Something Trial"));
        assert_eq!(reg.acronym.as_deref(), Some("SOME"));
        assert_eq!(reg.organization.as_deref(), Some("University Hospital"));
        assert_eq!(reg.conditions, vec!["Chronic headache", "Migraine"]);
        assert_eq!(reg.interventions, vec!["Drugamab", "Placebo"]);
        assert_eq!(reg.phase.as_deref(), Some("Phase III"));
        assert_eq!(reg.sex.as_deref(), Some("All"));
        assert_eq!(reg.overall_status.as_deref(), Some("Completed"));
        assert_eq!(reg.start_date.as_deref(), Some("2004-10-14"));
        assert_eq!(reg.completion_date.as_deref(), Some("2008-03-02"));
    }

    #[test]
    fn test_scrape_pubmed_ids_dedups() {
        let html = r#"
            <a href="https://www.ncbi.nlm.nih.gov/pubmed/555">paper</a>
            <a href="http://ncbi.nlm.nih.gov/pubmed/666">other</a>
            <a href="https://www.ncbi.nlm.nih.gov/pubmed/555">again</a>
        "#;
        assert_eq!(scrape_pubmed_ids(html), vec!["555", "666"]);
    }

    #[test]
    fn test_results_markers() {
        assert!(page_has_results("<h2>Results information</h2>"));
        assert!(!page_has_results("<h2>Protocol only</h2>"));
    }

    #[test]
    fn test_empty_dump_is_parse_error() {
        let err = parse_protocol("2004-000446-20", "no fields here").unwrap_err();
        assert!(matches!(
            err,
            PublinkError::RegistryFetch { kind: FetchKind::Parse, .. }
        ));
    }
}
