//! The staged batch runner.
//!
//! Drives Progress through the stage machine:
//! PREP → QUERY_GEN_UPLOAD → QUERY_GEN_POLL → QUERY_GEN_PROCESS →
//! PUB_DISCOVERY → RESULT_GEN_PREPARATION → RESULT_GEN_UPLOAD →
//! RESULT_GEN_POLL → RESULT_GEN_PROCESS → (UPLOAD again while chunks
//! remain) → FINALIZE → COST_CALCULATION → COMPLETE.
//!
//! Every stage is idempotent: re-entry skips sub-tasks whose output
//! already exists, and Progress is persisted after each observable
//! state change before the next external call.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use publink_common::cache::FileCache;
use publink_common::{Config, PublinkError, Result};
use publink_discovery::filters::{max_date_filter, min_date_filter};
use publink_discovery::DiscoveryEngine;
use publink_llm::classifier::{build_user_prompt, custom_id};
use publink_llm::querygen;
use publink_llm::schema;
use publink_llm::{BatchApi, BatchStatus, Classification, Classifier};
use publink_registry::RegistryHub;
use tracing::{info, warn};

use crate::budget::{roll_window, select_uploadable, today_utc};
use crate::chunking::{estimate_tokens, pack_chunks, PreparedRequest};
use crate::input::{cutoff_for_dataset, read_input, InputRow};
use crate::progress::{
    Chunk, ChunkStatus, DailyTokens, Progress, QueryGenJob, ResultDetection, RowState, RowStatus,
    Stage, TrialPublications,
};
use crate::summary::{compute_summary, write_sidecar, SummaryWriter};

const CLASSIFICATION_STORE: &str = "classifications";
const BATCH_ENDPOINT: &str = "/v1/chat/completions";

#[derive(Clone, Copy, PartialEq)]
enum QueryVariant {
    V1,
    V2,
}

impl QueryVariant {
    fn name(&self) -> &'static str {
        match self {
            QueryVariant::V1 => "v1",
            QueryVariant::V2 => "v2",
        }
    }
}

pub struct OrchestratorServices {
    pub registry: Arc<RegistryHub>,
    pub engine: Arc<DiscoveryEngine>,
    pub batch_api: Arc<dyn BatchApi>,
    pub classifier: Arc<Classifier>,
    pub stores: Arc<FileCache>,
}

pub struct RunOptions {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub delimiter: u8,
    pub poll_interval: Duration,
    pub validation_run: bool,
    pub step_by_step: bool,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub stage: Stage,
    pub success: u64,
    pub error: u64,
    pub skipped_no_trial_id: u64,
    pub skipped_no_registration: u64,
    pub elapsed: Duration,
}

pub struct Orchestrator {
    config: Config,
    services: OrchestratorServices,
    options: RunOptions,
    rows: Vec<InputRow>,
    progress: Progress,
    progress_path: PathBuf,
    query_prompt_v1: String,
    query_prompt_v2: String,
}

fn load_prompt(path: &Option<String>, fallback: &str) -> Result<String> {
    match path {
        Some(p) => Ok(std::fs::read_to_string(p)
            .map_err(|e| PublinkError::Config(format!("system prompt {p}: {e}")))?),
        None => Ok(fallback.to_string()),
    }
}

impl Orchestrator {
    pub fn new(config: Config, services: OrchestratorServices, options: RunOptions) -> Result<Self> {
        config.validate()?;
        let rows = read_input(&options.input, options.delimiter)?;
        let progress_path = options.output_dir.join("progress.json");
        let progress =
            Progress::load_or_new(&progress_path, &options.input.to_string_lossy())?;
        if progress.stage != Stage::Prep {
            info!(stage = progress.stage.as_str(), "Resuming prior run");
        }
        let query_prompt_v1 = load_prompt(
            &config.system_prompts.query_v1,
            querygen::QUERY_V1_SYSTEM_PROMPT,
        )?;
        let query_prompt_v2 = load_prompt(
            &config.system_prompts.query_v2,
            querygen::QUERY_V2_SYSTEM_PROMPT,
        )?;
        std::fs::create_dir_all(&options.output_dir)?;
        Ok(Self {
            config,
            services,
            options,
            rows,
            progress,
            progress_path,
            query_prompt_v1,
            query_prompt_v2,
        })
    }

    pub fn query_pool_dir(&self, variant_v2: bool) -> PathBuf {
        self.options
            .output_dir
            .join(if variant_v2 { "queries_v2" } else { "queries" })
    }

    fn save(&self) -> Result<()> {
        self.progress.save(&self.progress_path)
    }

    fn advance(&mut self, next: Stage) -> Result<()> {
        info!(from = self.progress.stage.as_str(), to = next.as_str(), "Stage transition");
        self.progress.stage = next;
        self.save()
    }

    fn strategy_enabled(&self, id: &str) -> bool {
        self.config.batch.strategies.iter().any(|s| s == id)
    }

    fn report(&self) -> RunReport {
        let success = self
            .progress
            .rows
            .values()
            .filter(|r| r.status == RowStatus::Success)
            .count() as u64;
        let error = self
            .progress
            .rows
            .values()
            .filter(|r| r.status == RowStatus::Error)
            .count() as u64;
        RunReport {
            stage: self.progress.stage,
            success,
            error,
            skipped_no_trial_id: self.progress.skipped.no_trial_id,
            skipped_no_registration: self.progress.skipped.no_registration,
            elapsed: (chrono::Utc::now() - self.progress.started_at)
                .to_std()
                .unwrap_or_default(),
        }
    }

    /// Run until COMPLETE, a fatal error, or (in step-by-step mode) the
    /// next stage transition.
    pub async fn run(&mut self) -> Result<RunReport> {
        loop {
            let stage = self.progress.stage;
            match stage {
                Stage::Prep => self.stage_prep().await?,
                Stage::QueryGenUpload => self.stage_query_gen_upload().await?,
                Stage::QueryGenPoll => self.stage_query_gen_poll().await?,
                Stage::QueryGenProcess => self.stage_query_gen_process().await?,
                Stage::PubDiscovery => self.stage_pub_discovery().await?,
                Stage::ResultGenPreparation => self.stage_result_gen_preparation()?,
                Stage::ResultGenUpload => self.stage_result_gen_upload().await?,
                Stage::ResultGenPoll => self.stage_result_gen_poll().await?,
                Stage::ResultGenProcess => self.stage_result_gen_process().await?,
                Stage::Finalize => self.stage_finalize()?,
                Stage::CostCalculation => self.stage_cost_calculation()?,
                Stage::Complete => {
                    let report = self.report();
                    info!(
                        success = report.success,
                        error = report.error,
                        skipped_no_trial_id = report.skipped_no_trial_id,
                        skipped_no_registration = report.skipped_no_registration,
                        elapsed_s = report.elapsed.as_secs(),
                        "Run complete"
                    );
                    return Ok(report);
                }
            }
            if self.options.step_by_step && self.progress.stage != Stage::Complete {
                info!(
                    next = self.progress.stage.as_str(),
                    "Step-by-step mode: stopping before next stage"
                );
                return Ok(self.report());
            }
        }
    }

    // ── PREP ──────────────────────────────────────────────────────────────────

    async fn stage_prep(&mut self) -> Result<()> {
        self.progress.skipped.no_trial_id = 0;
        let rows = self.rows.clone();
        for row in &rows {
            let Some(trial_id) = &row.trial_id else {
                self.progress.skipped.no_trial_id += 1;
                continue;
            };
            self.progress
                .rows
                .entry(trial_id.clone())
                .or_insert_with(|| RowState {
                    status: RowStatus::Processing,
                    error: None,
                    dataset: row.dataset.clone(),
                });
            if self.progress.registrations.contains_key(trial_id) {
                continue;
            }
            match self.services.registry.fetch(trial_id).await {
                Ok(registration) => {
                    self.progress
                        .registrations
                        .insert(trial_id.clone(), registration);
                    self.save()?;
                }
                Err(e) => {
                    warn!(trial_id, error = %e, "Registration fetch failed");
                    self.progress.record_row_error(trial_id, e.to_string());
                    self.save()?;
                }
            }
        }
        self.advance(Stage::QueryGenUpload)
    }

    // ── QUERY_GEN ─────────────────────────────────────────────────────────────

    fn query_job(&self, variant: QueryVariant) -> Option<&QueryGenJob> {
        match variant {
            QueryVariant::V1 => self.progress.batch_jobs.query_gen_v1.as_ref(),
            QueryVariant::V2 => self.progress.batch_jobs.query_gen_v2.as_ref(),
        }
    }

    fn query_job_slot(&mut self, variant: QueryVariant) -> &mut Option<QueryGenJob> {
        match variant {
            QueryVariant::V1 => &mut self.progress.batch_jobs.query_gen_v1,
            QueryVariant::V2 => &mut self.progress.batch_jobs.query_gen_v2,
        }
    }

    fn enabled_variants(&self) -> Vec<QueryVariant> {
        let mut variants = Vec::new();
        if self.strategy_enabled("pubmed_gpt_v1") {
            variants.push(QueryVariant::V1);
        }
        if self.strategy_enabled("pubmed_gpt_v2") {
            variants.push(QueryVariant::V2);
        }
        variants
    }

    async fn stage_query_gen_upload(&mut self) -> Result<()> {
        let variants = self.enabled_variants();
        if variants.is_empty() {
            return self.advance(Stage::PubDiscovery);
        }

        for variant in variants {
            if self.query_job(variant).is_some() {
                continue;
            }

            let lines: Vec<String> = self
                .progress
                .registrations
                .values()
                .map(|registration| match variant {
                    QueryVariant::V1 => querygen::batch_request(
                        registration,
                        &self.query_prompt_v1,
                        "pubmed_query",
                        schema::query_v1_schema(),
                        &self.config.models.query_v1,
                        self.config.reasoning.query_v1,
                        self.config.batch.max_tokens_query_v1,
                    ),
                    QueryVariant::V2 => querygen::batch_request(
                        registration,
                        &self.query_prompt_v2,
                        "pubmed_query_bundle",
                        schema::query_v2_schema(),
                        &self.config.models.query_v2,
                        self.config.reasoning.query_v2,
                        self.config.batch.max_tokens_query_v2,
                    ),
                })
                .map(|v| v.to_string())
                .collect();

            if lines.is_empty() {
                continue;
            }
            if lines.len() > self.config.batch.max_requests_per_batch {
                return Err(PublinkError::Config(format!(
                    "{} query-generation requests exceed batch.max_requests_per_batch ({})",
                    lines.len(),
                    self.config.batch.max_requests_per_batch
                )));
            }

            let filename = format!("query_gen_{}.jsonl", variant.name());
            let path = self.options.output_dir.join(&filename);
            std::fs::write(&path, lines.join("\n") + "\n")?;

            let input_file_id = self
                .services
                .batch_api
                .upload_file(&filename, std::fs::read(&path)?)
                .await?;
            let job = self
                .services
                .batch_api
                .create_batch(
                    &input_file_id,
                    BATCH_ENDPOINT,
                    &self.config.batch.completion_window,
                )
                .await?;
            info!(variant = variant.name(), batch_id = %job.id, n = lines.len(),
                  "Query-generation batch submitted");

            *self.query_job_slot(variant) = Some(QueryGenJob {
                id: job.id,
                status: job.status.as_str().to_string(),
                input_file_id: Some(input_file_id),
                output_file_id: None,
            });
            self.save()?;
        }

        self.advance(Stage::QueryGenPoll)
    }

    async fn stage_query_gen_poll(&mut self) -> Result<()> {
        loop {
            let mut pending = false;
            for variant in [QueryVariant::V1, QueryVariant::V2] {
                let Some(job) = self.query_job(variant).cloned() else {
                    continue;
                };
                if job.status == "completed" {
                    continue;
                }

                let batch = self.services.batch_api.retrieve_batch(&job.id).await?;
                if batch.status.is_terminal_failure() {
                    return Err(PublinkError::LlmBatchFailed {
                        batch_id: job.id,
                        status: batch.status.as_str().to_string(),
                    });
                }

                let mut updated = job.clone();
                updated.status = batch.status.as_str().to_string();
                if batch.status == BatchStatus::Completed {
                    let output = batch.output_file_id.ok_or_else(|| {
                        PublinkError::LlmBatchFailed {
                            batch_id: job.id.clone(),
                            status: "completed without output_file_id".to_string(),
                        }
                    })?;
                    updated.output_file_id = Some(output);
                } else {
                    pending = true;
                }
                *self.query_job_slot(variant) = Some(updated);
                self.save()?;
            }

            if !pending {
                break;
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
        self.advance(Stage::QueryGenProcess)
    }

    async fn stage_query_gen_process(&mut self) -> Result<()> {
        for variant in [QueryVariant::V1, QueryVariant::V2] {
            let Some(job) = self.query_job(variant).cloned() else {
                continue;
            };
            let Some(output_file_id) = job.output_file_id else {
                continue;
            };

            let bytes = self.services.batch_api.download_file(&output_file_id).await?;
            let raw_path = self
                .options
                .output_dir
                .join(format!("query_gen_{}_output.jsonl", variant.name()));
            std::fs::write(&raw_path, &bytes)?;

            let pool_dir = self.query_pool_dir(variant == QueryVariant::V2);
            std::fs::create_dir_all(&pool_dir)?;

            let text = String::from_utf8_lossy(&bytes);
            let mut written = 0usize;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                let Some((trial_id, parsed)) = querygen::parse_query_batch_line(line) else {
                    warn!(variant = variant.name(), "Unparseable batch output line");
                    continue;
                };
                match parsed {
                    Ok(value) => {
                        let pool_value = match variant {
                            QueryVariant::V1 => match schema::parse_query_v1(&value) {
                                Ok(query) => serde_json::json!({ "query": query }),
                                Err(e) => {
                                    warn!(trial_id, error = %e, "Bad v1 query output");
                                    continue;
                                }
                            },
                            QueryVariant::V2 => match schema::parse_query_v2(&value) {
                                Ok(bundle) => serde_json::to_value(bundle)?,
                                Err(e) => {
                                    warn!(trial_id, error = %e, "Bad v2 bundle output");
                                    continue;
                                }
                            },
                        };
                        std::fs::write(
                            pool_dir.join(format!("{trial_id}.json")),
                            serde_json::to_vec_pretty(&pool_value)?,
                        )?;
                        written += 1;
                    }
                    Err(e) => {
                        warn!(trial_id, variant = variant.name(), error = %e,
                              "Query generation failed for trial");
                    }
                }
            }
            info!(variant = variant.name(), written, "Query pool updated");
            self.save()?;
        }
        self.advance(Stage::PubDiscovery)
    }

    // ── PUB_DISCOVERY ─────────────────────────────────────────────────────────

    async fn stage_pub_discovery(&mut self) -> Result<()> {
        self.progress.skipped.no_registration = 0;
        let rows = self.rows.clone();
        for row in &rows {
            let Some(trial_id) = &row.trial_id else { continue };
            if self.progress.publications.contains_key(trial_id) {
                continue;
            }
            let Some(registration) = self.progress.registrations.get(trial_id).cloned() else {
                self.progress.skipped.no_registration += 1;
                continue;
            };

            let outcome = self.services.engine.discover(&registration).await;

            let (eligible, mut filtered) = if self.options.validation_run {
                let cutoff = cutoff_for_dataset(row.dataset.as_deref());
                let out = max_date_filter(outcome.publications, cutoff);
                (out.eligible, out.filtered)
            } else {
                (outcome.publications, Vec::new())
            };
            let min_out = min_date_filter(eligible, registration.start_date.as_deref());
            filtered.extend(min_out.filtered);

            info!(
                trial_id,
                candidates = min_out.eligible.len(),
                filtered = filtered.len(),
                errors = outcome.errors.len(),
                "Discovery finished"
            );
            self.progress.publications.insert(
                trial_id.clone(),
                TrialPublications {
                    candidates: min_out.eligible,
                    filtered,
                    errors: outcome.errors,
                },
            );
            self.save()?;
        }
        self.advance(Stage::ResultGenPreparation)
    }

    // ── RESULT_GEN ────────────────────────────────────────────────────────────

    fn stage_result_gen_preparation(&mut self) -> Result<()> {
        if !self.progress.batch_jobs.result_detection.chunks.is_empty() {
            return self.advance(Stage::ResultGenUpload);
        }

        let mut requests = Vec::new();
        for (trial_id, publications) in &self.progress.publications {
            let Some(registration) = self.progress.registrations.get(trial_id) else {
                continue;
            };
            for publication in &publications.candidates {
                if publication.pmid.is_empty() {
                    continue;
                }
                let key = custom_id(trial_id, &publication.pmid);
                if self
                    .services
                    .stores
                    .get::<Classification>(CLASSIFICATION_STORE, &key)
                    .is_some()
                {
                    continue;
                }
                let body = self.services.classifier.batch_request(registration, publication);
                let estimated = estimate_tokens(
                    self.services.classifier.system_prompt(),
                    &build_user_prompt(registration, publication),
                    self.config.batch.system_tokens_per_request,
                );
                requests.push(PreparedRequest::new(key, &body, estimated));
            }
        }

        if requests.is_empty() {
            info!("No classification requests to prepare");
            return self.advance(Stage::Finalize);
        }

        let plans = pack_chunks(
            requests,
            self.config.batch.max_requests_per_batch,
            self.config.batch.effective_max_bytes(),
        )?;

        let chunk_dir = self.options.output_dir.join("chunks");
        std::fs::create_dir_all(&chunk_dir)?;
        let mut chunks = Vec::with_capacity(plans.len());
        let mut total_estimated_tokens = 0;
        for (index, plan) in plans.iter().enumerate() {
            let path = chunk_dir.join(format!("chunk_{index:04}.jsonl"));
            std::fs::write(&path, plan.jsonl())?;
            total_estimated_tokens += plan.estimated_tokens;
            chunks.push(Chunk::new(
                index,
                path.to_string_lossy().into_owned(),
                plan.request_count,
                plan.estimated_tokens,
                plan.size_bytes,
            ));
        }

        info!(
            chunks = chunks.len(),
            total_estimated_tokens, "Classification chunks prepared"
        );
        self.progress.batch_jobs.result_detection = ResultDetection {
            chunks,
            daily_tokens_used: DailyTokens { date: today_utc(), tokens: 0 },
            total_estimated_tokens,
        };
        self.advance(Stage::ResultGenUpload)
    }

    async fn stage_result_gen_upload(&mut self) -> Result<()> {
        let today = today_utc();
        roll_window(
            &mut self.progress.batch_jobs.result_detection.daily_tokens_used,
            &today,
        );
        self.save()?;

        let selected = select_uploadable(
            &self.progress.batch_jobs.result_detection.chunks,
            &self.progress.batch_jobs.result_detection.daily_tokens_used,
            self.config.batch.max_tokens_per_day,
        )?;

        if !selected.is_empty() {
            let api = self.services.batch_api.clone();
            let window = self.config.batch.completion_window.clone();

            let mut uploads: FuturesUnordered<_> = selected
                .iter()
                .map(|&index| {
                    let chunk = self.progress.batch_jobs.result_detection.chunks[index].clone();
                    let api = api.clone();
                    let window = window.clone();
                    async move {
                        let filename = format!("chunk_{index:04}.jsonl");
                        let bytes = tokio::fs::read(&chunk.input_file).await?;
                        let input_file_id = api.upload_file(&filename, bytes).await?;
                        let job = api.create_batch(&input_file_id, BATCH_ENDPOINT, &window).await?;
                        Ok::<_, PublinkError>((index, input_file_id, job))
                    }
                })
                .collect();

            while let Some(upload) = uploads.next().await {
                let (index, input_file_id, job) = upload?;
                let detection = &mut self.progress.batch_jobs.result_detection;
                let chunk = &mut detection.chunks[index];
                chunk.advance(ChunkStatus::Uploaded)?;
                chunk.batch_id = Some(job.id.clone());
                chunk.input_file_id = Some(input_file_id);
                detection.daily_tokens_used.tokens += chunk.estimated_tokens;
                info!(chunk = index, batch_id = %job.id,
                      daily_tokens = detection.daily_tokens_used.tokens,
                      "Chunk uploaded");
                self.save()?;
            }
        }

        self.advance(Stage::ResultGenPoll)
    }

    fn polling_set(&self) -> Vec<(usize, String)> {
        self.progress
            .batch_jobs
            .result_detection
            .chunks
            .iter()
            .filter(|c| {
                matches!(
                    c.status,
                    ChunkStatus::Uploaded
                        | ChunkStatus::Validating
                        | ChunkStatus::InProgress
                        | ChunkStatus::Finalizing
                )
            })
            .filter_map(|c| c.batch_id.clone().map(|id| (c.index, id)))
            .collect()
    }

    async fn stage_result_gen_poll(&mut self) -> Result<()> {
        loop {
            let polling = self.polling_set();
            if polling.is_empty() {
                break;
            }

            let api = self.services.batch_api.clone();
            let lookups = polling.into_iter().map(|(index, batch_id)| {
                let api = api.clone();
                async move { (index, batch_id.clone(), api.retrieve_batch(&batch_id).await) }
            });

            for (index, batch_id, outcome) in futures::future::join_all(lookups).await {
                let job = outcome?;
                if job.status.is_terminal_failure() {
                    return Err(PublinkError::LlmBatchFailed {
                        batch_id,
                        status: format!("{} (chunk {index})", job.status.as_str()),
                    });
                }

                let chunk = &mut self.progress.batch_jobs.result_detection.chunks[index];
                match job.status {
                    BatchStatus::Completed => {
                        let output = job.output_file_id.ok_or_else(|| {
                            PublinkError::LlmBatchFailed {
                                batch_id: batch_id.clone(),
                                status: "completed without output_file_id".to_string(),
                            }
                        })?;
                        chunk.advance(ChunkStatus::Completed)?;
                        chunk.output_file_id = Some(output);
                    }
                    BatchStatus::Validating => chunk.advance(ChunkStatus::Validating)?,
                    BatchStatus::InProgress => chunk.advance(ChunkStatus::InProgress)?,
                    BatchStatus::Finalizing => chunk.advance(ChunkStatus::Finalizing)?,
                    _ => {}
                }
                self.save()?;
            }

            if self.polling_set().is_empty() {
                break;
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
        self.advance(Stage::ResultGenProcess)
    }

    async fn stage_result_gen_process(&mut self) -> Result<()> {
        let completed: Vec<usize> = self
            .progress
            .batch_jobs
            .result_detection
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .map(|c| c.index)
            .collect();

        for index in completed {
            let (output_file_id, input_file) = {
                let chunk = &self.progress.batch_jobs.result_detection.chunks[index];
                (
                    chunk.output_file_id.clone().ok_or_else(|| {
                        PublinkError::Parse(format!("chunk {index} completed without output file"))
                    })?,
                    chunk.input_file.clone(),
                )
            };

            let bytes = self.services.batch_api.download_file(&output_file_id).await?;
            let output_path = PathBuf::from(input_file.replace(".jsonl", "_output.jsonl"));
            std::fs::write(&output_path, &bytes)?;

            let text = String::from_utf8_lossy(&bytes);
            let mut stored = 0usize;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                let Some((key, classification)) =
                    publink_llm::classifier::parse_batch_output_line(line)
                else {
                    warn!(chunk = index, "Unparseable batch output line");
                    continue;
                };
                self.progress.cost.prompt_tokens += classification.prompt_tokens;
                self.progress.cost.completion_tokens += classification.completion_tokens;
                self.services
                    .stores
                    .put(CLASSIFICATION_STORE, &key, &classification)?;
                stored += 1;
            }

            let chunk = &mut self.progress.batch_jobs.result_detection.chunks[index];
            chunk.advance(ChunkStatus::Processed)?;
            info!(chunk = index, stored, "Chunk processed");
            self.save()?;
        }

        let pending_remain = self
            .progress
            .batch_jobs
            .result_detection
            .chunks
            .iter()
            .any(|c| c.status == ChunkStatus::Pending);
        if pending_remain {
            // Next day's budget picks these up.
            self.advance(Stage::ResultGenUpload)
        } else {
            self.advance(Stage::Finalize)
        }
    }

    // ── FINALIZE / COST ───────────────────────────────────────────────────────

    fn stage_finalize(&mut self) -> Result<()> {
        let csv_path = self.options.output_dir.join("summary.csv");
        let trials_dir = self.options.output_dir.join("trials");
        let mut writer = SummaryWriter::create(&csv_path)?;

        let mut seen = std::collections::BTreeSet::new();
        let rows = self.rows.clone();
        for row in &rows {
            let Some(trial_id) = &row.trial_id else { continue };
            if !seen.insert(trial_id.clone()) {
                continue;
            }

            let publications = self
                .progress
                .publications
                .get(trial_id)
                .cloned()
                .unwrap_or_default();
            let classifications: BTreeMap<String, Classification> = publications
                .candidates
                .iter()
                .filter_map(|p| {
                    self.services
                        .stores
                        .get::<Classification>(CLASSIFICATION_STORE, &custom_id(trial_id, &p.pmid))
                        .map(|c| (p.pmid.clone(), c))
                })
                .collect();

            let mut summary = compute_summary(trial_id, &publications, &classifications);
            let row_state = self.progress.rows.get(trial_id);
            if row_state.map(|r| r.status == RowStatus::Error).unwrap_or(false) {
                summary.has_error = true;
            }

            // Sidecar first; the CSV row is only appended once its
            // backing JSON exists.
            write_sidecar(
                &trials_dir,
                self.progress.registrations.get(trial_id),
                &publications,
                &classifications,
                &summary,
            )?;
            writer.append(&summary)?;

            let prior_error = row_state.and_then(|r| r.error.clone());
            let status = if summary.has_error { RowStatus::Error } else { RowStatus::Success };
            self.progress.rows.insert(
                trial_id.clone(),
                RowState {
                    status,
                    error: prior_error,
                    dataset: row.dataset.clone(),
                },
            );
            self.save()?;
        }

        self.advance(Stage::CostCalculation)
    }

    fn stage_cost_calculation(&mut self) -> Result<()> {
        info!(
            prompt_tokens = self.progress.cost.prompt_tokens,
            completion_tokens = self.progress.cost.completion_tokens,
            total_estimated_tokens = self
                .progress
                .batch_jobs
                .result_detection
                .total_estimated_tokens,
            "Token usage totals"
        );
        self.advance(Stage::Complete)
    }
}
