//! The durable state of a batch run.
//!
//! Progress is the only checkpoint: it is rewritten (atomically, via a
//! temp file and rename) after every observable state change and before
//! the next external call. A restart reads it back and re-enters the
//! stored stage; anything already done is skipped.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use publink_common::{PublinkError, Result};
use publink_discovery::{Publication, StrategyError};
use publink_registry::Registration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Prep,
    QueryGenUpload,
    QueryGenPoll,
    QueryGenProcess,
    PubDiscovery,
    ResultGenPreparation,
    ResultGenUpload,
    ResultGenPoll,
    ResultGenProcess,
    Finalize,
    CostCalculation,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Prep                 => "PREP",
            Stage::QueryGenUpload       => "QUERY_GEN_UPLOAD",
            Stage::QueryGenPoll         => "QUERY_GEN_POLL",
            Stage::QueryGenProcess      => "QUERY_GEN_PROCESS",
            Stage::PubDiscovery         => "PUB_DISCOVERY",
            Stage::ResultGenPreparation => "RESULT_GEN_PREPARATION",
            Stage::ResultGenUpload      => "RESULT_GEN_UPLOAD",
            Stage::ResultGenPoll        => "RESULT_GEN_POLL",
            Stage::ResultGenProcess     => "RESULT_GEN_PROCESS",
            Stage::Finalize             => "FINALIZE",
            Stage::CostCalculation      => "COST_CALCULATION",
            Stage::Complete             => "COMPLETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Uploaded,
    InProgress,
    Validating,
    Finalizing,
    Completed,
    Processed,
    Failed,
}

impl ChunkStatus {
    /// Position in the monotone lifecycle; the three in-service states
    /// share a rank.
    fn rank(&self) -> u8 {
        match self {
            ChunkStatus::Pending => 0,
            ChunkStatus::Uploaded => 1,
            ChunkStatus::InProgress | ChunkStatus::Validating | ChunkStatus::Finalizing => 2,
            ChunkStatus::Completed => 3,
            ChunkStatus::Processed => 4,
            ChunkStatus::Failed => 5,
        }
    }
}

/// One bounded group of classification requests submitted as a single
/// batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub input_file: String,
    pub request_count: usize,
    pub estimated_tokens: u64,
    pub size_bytes: usize,
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Chunk {
    pub fn new(index: usize, input_file: String, request_count: usize, estimated_tokens: u64, size_bytes: usize) -> Self {
        Self {
            index,
            input_file,
            request_count,
            estimated_tokens,
            size_bytes,
            status: ChunkStatus::Pending,
            batch_id: None,
            input_file_id: None,
            output_file_id: None,
            uploaded_at: None,
            completed_at: None,
            processed_at: None,
        }
    }

    /// Move the chunk forward through its lifecycle; moving backwards is
    /// a logic error and is rejected. Re-asserting the current status
    /// (as repeated polls do) is allowed.
    pub fn advance(&mut self, next: ChunkStatus) -> Result<()> {
        if next == self.status {
            return Ok(());
        }
        if next != ChunkStatus::Failed && next.rank() < self.status.rank() {
            return Err(PublinkError::Parse(format!(
                "chunk {} cannot move from {:?} back to {next:?}",
                self.index, self.status
            )));
        }
        match next {
            ChunkStatus::Uploaded => self.uploaded_at = Some(Utc::now()),
            ChunkStatus::Completed => self.completed_at = Some(Utc::now()),
            ChunkStatus::Processed => self.processed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }
}

/// Token spend attributed to the current calendar day (UTC).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DailyTokens {
    pub date: String,
    pub tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryGenJob {
    pub id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResultDetection {
    pub chunks: Vec<Chunk>,
    pub daily_tokens_used: DailyTokens,
    pub total_estimated_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchJobs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_gen_v1: Option<QueryGenJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_gen_v2: Option<QueryGenJob>,
    #[serde(default)]
    pub result_detection: ResultDetection,
}

/// Per-trial discovery output kept in Progress.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrialPublications {
    /// Survived both date filters; these are classified.
    pub candidates: Vec<Publication>,
    /// Removed by a date filter; kept for the audit trail.
    pub filtered: Vec<Publication>,
    pub errors: Vec<StrategyError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Processing,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowState {
    pub status: RowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkippedCounts {
    pub no_trial_id: u64,
    pub no_registration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CostTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub input: String,
    pub stage: Stage,
    pub registrations: BTreeMap<String, Registration>,
    pub publications: BTreeMap<String, TrialPublications>,
    pub batch_jobs: BatchJobs,
    pub rows: BTreeMap<String, RowState>,
    pub started_at: DateTime<Utc>,
    pub skipped: SkippedCounts,
    #[serde(default)]
    pub cost: CostTotals,
}

impl Progress {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            stage: Stage::Prep,
            registrations: BTreeMap::new(),
            publications: BTreeMap::new(),
            batch_jobs: BatchJobs::default(),
            rows: BTreeMap::new(),
            started_at: Utc::now(),
            skipped: SkippedCounts::default(),
            cost: CostTotals::default(),
        }
    }

    /// Load a prior run's progress, or start fresh when none exists.
    pub fn load_or_new(path: &Path, input: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(input));
        }
        let raw = std::fs::read_to_string(path)?;
        let progress: Progress = serde_json::from_str(&raw)
            .map_err(|e| PublinkError::Parse(format!("progress file {}: {e}", path.display())))?;
        Ok(progress)
    }

    /// Atomic write: temp file in the same directory, then rename, so a
    /// crash mid-write can never corrupt the checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(self)?)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| PublinkError::Cache(e.error))?;
        Ok(())
    }

    pub fn record_row_error(&mut self, trial_id: &str, message: impl Into<String>) {
        self.rows.insert(
            trial_id.to_string(),
            RowState {
                status: RowStatus::Error,
                error: Some(message.into()),
                dataset: self.rows.get(trial_id).and_then(|r| r.dataset.clone()),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&Stage::ResultGenPreparation).unwrap(),
            "\"RESULT_GEN_PREPARATION\""
        );
        assert_eq!(
            serde_json::from_str::<Stage>("\"QUERY_GEN_POLL\"").unwrap(),
            Stage::QueryGenPoll
        );
    }

    #[test]
    fn test_chunk_status_is_monotone() {
        let mut chunk = Chunk::new(0, "chunk_0000.jsonl".to_string(), 10, 100, 512);
        chunk.advance(ChunkStatus::Uploaded).unwrap();
        chunk.advance(ChunkStatus::InProgress).unwrap();
        // In-service statuses may flap between one another.
        chunk.advance(ChunkStatus::Finalizing).unwrap();
        chunk.advance(ChunkStatus::Completed).unwrap();
        chunk.advance(ChunkStatus::Processed).unwrap();
        assert!(chunk.uploaded_at.is_some());
        assert!(chunk.completed_at.is_some());
        assert!(chunk.processed_at.is_some());

        // Backwards is rejected.
        assert!(chunk.advance(ChunkStatus::Pending).is_err());
        assert!(chunk.advance(ChunkStatus::Uploaded).is_err());
    }

    #[test]
    fn test_chunk_can_fail_from_any_state() {
        let mut chunk = Chunk::new(1, "chunk_0001.jsonl".to_string(), 1, 1, 1);
        chunk.advance(ChunkStatus::Uploaded).unwrap();
        chunk.advance(ChunkStatus::Failed).unwrap();
        assert_eq!(chunk.status, ChunkStatus::Failed);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let mut progress = Progress::new("trials.csv");
        progress.stage = Stage::PubDiscovery;
        progress.skipped.no_trial_id = 3;
        progress
            .batch_jobs
            .result_detection
            .chunks
            .push(Chunk::new(0, "chunk_0000.jsonl".to_string(), 2, 20, 128));
        progress.save(&path).unwrap();

        let loaded = Progress::load_or_new(&path, "trials.csv").unwrap();
        assert_eq!(loaded.stage, Stage::PubDiscovery);
        assert_eq!(loaded.skipped.no_trial_id, 3);
        assert_eq!(loaded.batch_jobs.result_detection.chunks.len(), 1);
        assert_eq!(loaded.input, "trials.csv");
    }

    #[test]
    fn test_load_missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let progress =
            Progress::load_or_new(&dir.path().join("missing.json"), "trials.csv").unwrap();
        assert_eq!(progress.stage, Stage::Prep);
        assert!(progress.registrations.is_empty());
    }
}
