//! The live driver: one trial at a time, synchronous LLM calls, same
//! summary outputs as the batch runner.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use publink_batch::input::{cutoff_for_dataset, read_input};
use publink_batch::progress::{RowState, RowStatus, TrialPublications};
use publink_batch::summary::{compute_summary, write_sidecar, SummaryWriter, TrialSummary};
use publink_common::cache::FileCache;
use publink_common::{Config, Result};
use publink_discovery::filters::{max_date_filter, min_date_filter};
use publink_discovery::DiscoveryEngine;
use publink_llm::classifier::custom_id;
use publink_llm::{Classification, Classifier};
use publink_registry::{Registration, RegistryHub};
use tracing::{info, warn};

const CLASSIFICATION_STORE: &str = "classifications";

pub struct LiveOptions {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub delimiter: u8,
    pub validation_run: bool,
    pub retry_errors: bool,
}

pub struct LiveServices {
    pub registry: Arc<RegistryHub>,
    pub engine: Arc<DiscoveryEngine>,
    pub classifier: Arc<Classifier>,
    pub stores: Arc<FileCache>,
}

fn progress_path(output_dir: &Path) -> PathBuf {
    output_dir.join("live_progress.json")
}

fn load_row_states(path: &Path) -> BTreeMap<String, RowState> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn save_row_states(path: &Path, rows: &BTreeMap<String, RowState>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(rows)?)?;
    Ok(())
}

/// A prior run's summary, replayed from its sidecar so untouched rows
/// keep their CSV line on --retry-errors reruns.
fn sidecar_summary(trials_dir: &Path, trial_id: &str) -> Option<TrialSummary> {
    let raw = std::fs::read_to_string(trials_dir.join(format!("{trial_id}.json"))).ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    serde_json::from_value(value.get("summary")?.clone()).ok()
}

pub async fn run_live(_config: &Config, services: LiveServices, options: LiveOptions) -> Result<()> {
    std::fs::create_dir_all(&options.output_dir)?;
    let rows = read_input(&options.input, options.delimiter)?;
    let started = std::time::Instant::now();

    let state_path = progress_path(&options.output_dir);
    let mut row_states = load_row_states(&state_path);
    let trials_dir = options.output_dir.join("trials");
    let mut writer = SummaryWriter::create(&options.output_dir.join("summary.csv"))?;

    let mut seen = BTreeSet::new();
    let mut success = 0u64;
    let mut error = 0u64;
    let mut skipped = 0u64;
    let mut replayed = 0u64;

    for row in &rows {
        let Some(trial_id) = &row.trial_id else {
            skipped += 1;
            continue;
        };
        if !seen.insert(trial_id.clone()) {
            continue;
        }

        let prior_ok = row_states
            .get(trial_id)
            .map(|r| r.status == RowStatus::Success)
            .unwrap_or(false);
        if options.retry_errors && prior_ok {
            if let Some(summary) = sidecar_summary(&trials_dir, trial_id) {
                writer.append(&summary)?;
                success += 1;
                replayed += 1;
                continue;
            }
        }

        let summary = process_trial(
            &services,
            trial_id,
            row.dataset.as_deref(),
            options.validation_run,
            &trials_dir,
        )
        .await?;
        writer.append(&summary)?;

        let status = if summary.has_error { RowStatus::Error } else { RowStatus::Success };
        if status == RowStatus::Success {
            success += 1;
        } else {
            error += 1;
        }
        row_states.insert(
            trial_id.clone(),
            RowState { status, error: None, dataset: row.dataset.clone() },
        );
        save_row_states(&state_path, &row_states)?;
    }

    info!(
        success,
        error,
        skipped,
        replayed,
        elapsed_s = started.elapsed().as_secs(),
        "Live run complete"
    );
    Ok(())
}

async fn process_trial(
    services: &LiveServices,
    trial_id: &str,
    dataset: Option<&str>,
    validation_run: bool,
    trials_dir: &Path,
) -> Result<TrialSummary> {
    let registration = match services.registry.fetch(trial_id).await {
        Ok(registration) => registration,
        Err(e) => {
            warn!(trial_id, error = %e, "Registration fetch failed");
            let publications = TrialPublications::default();
            let classifications = BTreeMap::new();
            let mut summary = compute_summary(trial_id, &publications, &classifications);
            summary.has_error = true;
            summary
                .failed_publication_discoveries
                .push(format!("registration: {e}"));
            write_sidecar(trials_dir, None, &publications, &classifications, &summary)?;
            return Ok(summary);
        }
    };

    let outcome = services.engine.discover(&registration).await;
    let (eligible, mut filtered) = if validation_run {
        let out = max_date_filter(outcome.publications, cutoff_for_dataset(dataset));
        (out.eligible, out.filtered)
    } else {
        (outcome.publications, Vec::new())
    };
    let min_out = min_date_filter(eligible, registration.start_date.as_deref());
    filtered.extend(min_out.filtered);

    let publications = TrialPublications {
        candidates: min_out.eligible,
        filtered,
        errors: outcome.errors,
    };

    let classifications = classify_all(services, &registration, &publications).await?;
    let summary = compute_summary(trial_id, &publications, &classifications);
    write_sidecar(
        trials_dir,
        Some(&registration),
        &publications,
        &classifications,
        &summary,
    )?;
    info!(
        trial_id,
        candidates = publications.candidates.len(),
        positives = summary.tool_result_pmids.len(),
        "Trial processed"
    );
    Ok(summary)
}

/// Classify every candidate pair concurrently, reading the store first
/// so reruns and resumes never pay for the same pair twice.
async fn classify_all(
    services: &LiveServices,
    registration: &Registration,
    publications: &TrialPublications,
) -> Result<BTreeMap<String, Classification>> {
    let lookups = publications.candidates.iter().map(|publication| {
        let key = custom_id(&registration.trial_id, &publication.pmid);
        async move {
            if let Some(cached) = services
                .stores
                .get::<Classification>(CLASSIFICATION_STORE, &key)
            {
                return (publication.pmid.clone(), key, cached, false);
            }
            let classification = services.classifier.classify(registration, publication).await;
            (publication.pmid.clone(), key, classification, true)
        }
    });

    let mut classifications = BTreeMap::new();
    for (pmid, key, classification, fresh) in join_all(lookups).await {
        if fresh {
            services
                .stores
                .put(CLASSIFICATION_STORE, &key, &classification)?;
        }
        classifications.insert(pmid, classification);
    }
    Ok(classifications)
}
