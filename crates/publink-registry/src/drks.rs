//! DRKS (Deutsches Register Klinischer Studien) adapter.
//!
//! DRKS has no machine API; the trial page is scraped. The record is a
//! sequence of `<dt>label</dt><dd>value</dd>` pairs, and the reference
//! section carries DOI / PubMed / NCBI links.

use std::sync::LazyLock;

use publink_common::{FetchKind, PublinkError, Registry, Result};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::instrument;

use crate::registration::{normalize_date, Reference, Registration};

const DRKS_TRIAL_URL: &str = "https://drks.de/search/en/trial";

static PUBMED_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ncbi\.nlm\.nih\.gov/(?:pubmed|pmc)/(?:articles/)?(\d+)").unwrap());
static DOI_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"doi\.org/(10\.\S+)").unwrap());

pub struct DrksAdapter {
    client: reqwest::Client,
}

impl DrksAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self, trial_id: &str) -> Result<Registration> {
        let url = format!("{DRKS_TRIAL_URL}/{trial_id}");
        let resp = self.client.get(&url).send().await.map_err(|e| transport(trial_id, e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PublinkError::RegistryFetch {
                trial_id: trial_id.to_string(),
                kind: FetchKind::NotFound,
                message: "no such DRKS trial".to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(transport(trial_id, format!("HTTP {}", resp.status())));
        }

        let html = resp.text().await.map_err(|e| transport(trial_id, e.to_string()))?;
        let reg = parse_trial_page(trial_id, &html)?;
        reg.validate()?;
        Ok(reg)
    }
}

fn transport(trial_id: &str, message: String) -> PublinkError {
    PublinkError::RegistryFetch {
        trial_id: trial_id.to_string(),
        kind: FetchKind::Transport,
        message,
    }
}

/// Pull every `<dt>/<dd>` pair out of the page, keyed by the lowercased
/// label text.
fn definition_pairs(doc: &Html) -> Vec<(String, String)> {
    let dt_sel = Selector::parse("dt").unwrap();
    let dd_sel = Selector::parse("dd").unwrap();

    let labels: Vec<String> = doc
        .select(&dt_sel)
        .map(|dt| dt.text().collect::<String>().trim().to_lowercase())
        .collect();
    let values: Vec<String> = doc
        .select(&dd_sel)
        .map(|dd| {
            dd.text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();

    labels.into_iter().zip(values).collect()
}

fn lookup<'a>(pairs: &'a [(String, String)], label: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(l, v)| l.starts_with(label) && !v.is_empty())
        .map(|(_, v)| v.as_str())
}

fn lookup_all(pairs: &[(String, String)], label: &str) -> Vec<String> {
    pairs
        .iter()
        .filter(|(l, v)| l.starts_with(label) && !v.is_empty())
        .map(|(_, v)| v.clone())
        .collect()
}

fn parse_trial_page(trial_id: &str, html: &str) -> Result<Registration> {
    let doc = Html::parse_document(html);
    let pairs = definition_pairs(&doc);
    if pairs.is_empty() {
        return Err(PublinkError::RegistryFetch {
            trial_id: trial_id.to_string(),
            kind: FetchKind::Parse,
            message: "no definition list found on trial page".to_string(),
        });
    }

    let mut reg = Registration::new(trial_id, Registry::Drks);

    reg.brief_title = lookup(&pairs, "title of the study").map(String::from);
    reg.official_title = lookup(&pairs, "scientific title").map(String::from);
    reg.acronym = lookup(&pairs, "acronym").map(String::from);
    reg.brief_summary = lookup(&pairs, "brief summary").map(String::from);
    reg.detailed_description = lookup(&pairs, "detailed description").map(String::from);

    reg.overall_status = lookup(&pairs, "recruitment status").map(String::from);
    reg.start_date = lookup(&pairs, "study start date").and_then(normalize_date);
    reg.completion_date = lookup(&pairs, "study closing date")
        .or_else(|| lookup(&pairs, "last study visit"))
        .and_then(normalize_date);

    reg.organization = lookup(&pairs, "primary sponsor")
        .or_else(|| lookup(&pairs, "sponsor"))
        .map(String::from);
    reg.investigator_full_name = lookup(&pairs, "principal investigator").map(String::from);
    reg.principal_investigators = lookup_all(&pairs, "principal investigator");

    reg.study_type = lookup(&pairs, "study type").map(String::from);
    reg.phase = lookup(&pairs, "phase").map(String::from);
    reg.sex = lookup(&pairs, "gender").map(String::from);
    reg.conditions = lookup_all(&pairs, "health condition");
    reg.interventions = lookup_all(&pairs, "intervention");

    reg.references = collect_reference_links(&doc);

    Ok(reg)
}

/// DOI / PubMed / NCBI anchors anywhere in the publication section become
/// references; PubMed links carry the PMID directly.
fn collect_reference_links(doc: &Html) -> Vec<Reference> {
    let a_sel = Selector::parse("a[href]").unwrap();
    let mut refs = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for a in doc.select(&a_sel) {
        let href = a.value().attr("href").unwrap_or_default();
        let text = a.text().collect::<String>().trim().to_string();

        if let Some(caps) = PUBMED_LINK_RE.captures(href) {
            let pmid = caps[1].to_string();
            if seen.insert(format!("pmid:{pmid}")) {
                refs.push(Reference {
                    pmid: Some(pmid),
                    citation: if text.is_empty() { None } else { Some(text) },
                });
            }
        } else if let Some(caps) = DOI_LINK_RE.captures(href) {
            let doi = caps[1].trim_end_matches('/').to_string();
            if seen.insert(format!("doi:{doi}")) {
                refs.push(Reference {
                    pmid: None,
                    citation: Some(if text.is_empty() { doi } else { text }),
                });
            }
        }
    }

    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <dl>
          <dt>Title of the study</dt><dd>A Study of Things</dd>
          <dt>Scientific title</dt><dd>A Scientific Study of Things in Adults</dd>
          <dt>Acronym</dt><dd>AST</dd>
          <dt>Brief summary in English</dt><dd>  We study   things. </dd>
          <dt>Recruitment status</dt><dd>Recruiting complete, study complete</dd>
          <dt>Study start date</dt><dd>17.05.2010</dd>
          <dt>Study closing date (LPLV)</dt><dd>01.12.2013</dd>
          <dt>Primary sponsor</dt><dd>Universitätsklinikum Freiburg</dd>
          <dt>Principal investigator</dt><dd>Prof. Dr. Erika Musterfrau</dd>
          <dt>Study type</dt><dd>Interventional</dd>
          <dt>Phase</dt><dd>III</dd>
          <dt>Gender</dt><dd>Both, male and female</dd>
          <dt>Health condition or problem studied</dt><dd>Migraine</dd>
          <dt>Intervention</dt><dd>Acupuncture</dd>
        </dl>
        <div class="publications">
          <a href="https://www.ncbi.nlm.nih.gov/pubmed/777">Results paper</a>
          <a href="https://doi.org/10.1000/xyz123">Protocol</a>
          <a href="https://www.ncbi.nlm.nih.gov/pubmed/777">duplicate</a>
        </div>
        </body></html>
    "#;

    #[test]
    fn test_parse_trial_page() {
        let reg = parse_trial_page("DRKS00004744", PAGE).unwrap();
        assert_eq!(reg.brief_title.as_deref(), Some("A Study of Things"));
        assert_eq!(
            reg.official_title.as_deref(),
            Some("A Scientific Study of Things in Adults")
        );
        assert_eq!(reg.brief_summary.as_deref(), Some("We study things."));
        assert_eq!(reg.start_date.as_deref(), Some("2010-05-17"));
        assert_eq!(reg.completion_date.as_deref(), Some("2013-12-01"));
        assert_eq!(reg.organization.as_deref(), Some("Universitätsklinikum Freiburg"));
        assert_eq!(reg.principal_investigators, vec!["Prof. Dr. Erika Musterfrau"]);
        assert_eq!(reg.conditions, vec!["Migraine"]);
        assert_eq!(reg.phase.as_deref(), Some("III"));
    }

    #[test]
    fn test_reference_links_dedup() {
        let reg = parse_trial_page("DRKS00004744", PAGE).unwrap();
        assert_eq!(reg.references.len(), 2);
        assert_eq!(reg.references[0].pmid.as_deref(), Some("777"));
        assert_eq!(reg.references[1].pmid, None);
        assert_eq!(reg.references[1].citation.as_deref(), Some("Protocol"));
    }

    #[test]
    fn test_page_without_dl_is_parse_error() {
        let err = parse_trial_page("DRKS00004744", "<html><body>nope</body></html>").unwrap_err();
        assert!(matches!(
            err,
            PublinkError::RegistryFetch { kind: FetchKind::Parse, .. }
        ));
    }
}
