//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "publink",
    version,
    about = "Link clinical-trial registrations to their result publications",
    long_about = "Fetches trial registrations (ClinicalTrials.gov, EUCTR, DRKS),\n\
                  discovers candidate publications through several strategies, and\n\
                  asks an LLM whether each publication reports the trial's results."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the resumable batch pipeline over an input table.
    Batch(BatchArgs),
    /// Process trials one at a time with synchronous LLM calls.
    Live(LiveArgs),
}

#[derive(Parser)]
pub struct BatchArgs {
    /// Input table with a trial-id column (nct_id, nctid, trial_id, trialid).
    #[arg(long = "input", value_name = "FILE")]
    pub input: PathBuf,

    /// Where progress, chunk files, and outputs are written.
    #[arg(long = "output-dir", value_name = "DIR", default_value = "publink-run")]
    pub output_dir: PathBuf,

    /// Field delimiter of the input table.
    #[arg(long = "delimiter", value_name = "CHAR", default_value = ",")]
    pub delimiter: char,

    /// Seconds between batch status polls.
    #[arg(long = "poll-interval", value_name = "SEC", default_value_t = 60)]
    pub poll_interval: u64,

    /// Cap publication dates per dataset to simulate a point-in-time run.
    #[arg(long = "validation-run")]
    pub validation_run: bool,

    /// Directory of pre-fetched {trialId}.json used by the ctgov adapter.
    #[arg(long = "local-registrations", value_name = "DIR")]
    pub local_registrations: Option<PathBuf>,

    /// Stop after each stage transition instead of running to completion.
    #[arg(long = "step-by-step")]
    pub step_by_step: bool,
}

#[derive(Parser)]
pub struct LiveArgs {
    /// Input table with a trial-id column (nct_id, nctid, trial_id, trialid).
    #[arg(long = "input", value_name = "FILE")]
    pub input: PathBuf,

    /// Where outputs are written.
    #[arg(long = "output-dir", value_name = "DIR", default_value = "publink-live")]
    pub output_dir: PathBuf,

    /// Field delimiter of the input table.
    #[arg(long = "delimiter", value_name = "CHAR", default_value = ",")]
    pub delimiter: char,

    /// Cap publication dates per dataset to simulate a point-in-time run.
    #[arg(long = "validation-run")]
    pub validation_run: bool,

    /// Directory of pre-fetched {trialId}.json used by the ctgov adapter.
    #[arg(long = "local-registrations", value_name = "DIR")]
    pub local_registrations: Option<PathBuf>,

    /// Re-run only the rows that ended in error last time.
    #[arg(long = "retry-errors")]
    pub retry_errors: bool,
}
