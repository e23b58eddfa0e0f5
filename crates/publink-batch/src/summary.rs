//! Per-trial summary computation and the run outputs: one CSV row per
//! trial plus a JSON sidecar with the full record.
//!
//! The sidecar is always written before its CSV row, so a crash can
//! leave an orphan sidecar but never a summary row without backing JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use publink_common::{detect_registry, Registry, Result};
use publink_llm::Classification;
use publink_registry::Registration;
use serde::{Deserialize, Serialize};

use crate::progress::TrialPublications;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSummary {
    pub nct_id: String,
    pub trial_id: String,
    pub tool_results: bool,
    pub has_error: bool,
    pub tool_prompted_pmids: Vec<String>,
    pub tool_result_pmids: Vec<String>,
    pub tool_ident_steps: Vec<String>,
    pub earliest_result_publication: Option<String>,
    pub earliest_result_publication_date: Option<String>,
    pub failed_publication_discoveries: Vec<String>,
    pub failed_result_discoveries: Vec<String>,
    /// (pmid, reason) pairs in PMID order.
    pub reasons: Vec<(String, String)>,
}

/// Join the registration, its candidate publications, and their
/// classifications into the summary record.
pub fn compute_summary(
    trial_id: &str,
    publications: &TrialPublications,
    classifications: &BTreeMap<String, Classification>,
) -> TrialSummary {
    let nct_id = match detect_registry(trial_id) {
        Some(Registry::Ctgov) => trial_id.to_string(),
        _ => String::new(),
    };

    let tool_prompted_pmids: Vec<String> = publications
        .candidates
        .iter()
        .map(|p| p.pmid.clone())
        .collect();

    let mut tool_result_pmids = Vec::new();
    let mut failed_result_discoveries = Vec::new();
    let mut ident_steps: BTreeSet<String> = BTreeSet::new();
    let mut earliest: Option<(String, String)> = None; // (date, pmid)
    let mut reasons = Vec::new();
    let mut missing_classification = false;

    for publication in &publications.candidates {
        match classifications.get(&publication.pmid) {
            Some(classification) if classification.success => {
                if !classification.reason.is_empty() {
                    reasons.push((publication.pmid.clone(), classification.reason.clone()));
                }
                if classification.has_results {
                    tool_result_pmids.push(publication.pmid.clone());
                    for source in &publication.sources {
                        ident_steps.insert(source.as_str().to_string());
                    }
                    if let Some(date) = &publication.publication_date {
                        let entry = (date.clone(), publication.pmid.clone());
                        if earliest.as_ref().map(|cur| entry < *cur).unwrap_or(true) {
                            earliest = Some(entry);
                        }
                    }
                }
            }
            Some(classification) => {
                failed_result_discoveries.push(publication.pmid.clone());
                if let Some(error) = &classification.error {
                    reasons.push((publication.pmid.clone(), format!("classification failed: {error}")));
                }
                missing_classification = true;
            }
            None => {
                failed_result_discoveries.push(publication.pmid.clone());
                missing_classification = true;
            }
        }
    }

    let failed_publication_discoveries: Vec<String> = publications
        .errors
        .iter()
        .map(|e| e.strategy.clone())
        .collect();

    let has_error = !failed_publication_discoveries.is_empty() || missing_classification;

    TrialSummary {
        nct_id,
        trial_id: trial_id.to_string(),
        tool_results: !tool_result_pmids.is_empty(),
        has_error,
        tool_prompted_pmids,
        tool_result_pmids,
        tool_ident_steps: ident_steps.into_iter().collect(),
        earliest_result_publication: earliest.as_ref().map(|(_, pmid)| pmid.clone()),
        earliest_result_publication_date: earliest.map(|(date, _)| date),
        failed_publication_discoveries,
        failed_result_discoveries,
        reasons,
    }
}

fn join_list(items: &[String]) -> String {
    items.join(",")
}

fn join_reasons(reasons: &[(String, String)]) -> String {
    reasons
        .iter()
        .map(|(pmid, reason)| format!("PMID{pmid}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub const CSV_COLUMNS: [&str; 12] = [
    "nct_id",
    "trial_id",
    "tool_results",
    "has_error",
    "tool_prompted_pmids",
    "tool_result_pmids",
    "tool_ident_steps",
    "earliest_result_publication",
    "earliest_result_publication_date",
    "failed_publication_discoveries",
    "failed_result_discoveries",
    "reasons",
];

/// Streaming writer for the tabular summary.
pub struct SummaryWriter {
    writer: csv::Writer<std::fs::File>,
}

impl SummaryWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(CSV_COLUMNS)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    pub fn append(&mut self, summary: &TrialSummary) -> Result<()> {
        let record = [
            summary.nct_id.clone(),
            summary.trial_id.clone(),
            summary.tool_results.to_string(),
            summary.has_error.to_string(),
            join_list(&summary.tool_prompted_pmids),
            join_list(&summary.tool_result_pmids),
            join_list(&summary.tool_ident_steps),
            summary.earliest_result_publication.clone().unwrap_or_default(),
            summary
                .earliest_result_publication_date
                .clone()
                .unwrap_or_default(),
            join_list(&summary.failed_publication_discoveries),
            join_list(&summary.failed_result_discoveries),
            join_reasons(&summary.reasons),
        ];
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// The full per-trial record written next to the CSV.
#[derive(Serialize)]
struct Sidecar<'a> {
    registration: Option<&'a Registration>,
    publications: &'a TrialPublications,
    classifications: &'a BTreeMap<String, Classification>,
    summary: &'a TrialSummary,
    written_at: chrono::DateTime<Utc>,
}

pub fn write_sidecar(
    dir: &Path,
    registration: Option<&Registration>,
    publications: &TrialPublications,
    classifications: &BTreeMap<String, Classification>,
    summary: &TrialSummary,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", summary.trial_id));
    let sidecar = Sidecar {
        registration,
        publications,
        classifications,
        summary,
        written_at: Utc::now(),
    };
    std::fs::write(&path, serde_json::to_vec_pretty(&sidecar)?)?;
    Ok(path)
}
