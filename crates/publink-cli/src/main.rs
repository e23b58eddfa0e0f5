//! Publink — trial-registration → publication linking.
//! Entry point for the CLI binary.

mod cli;
mod live;
mod setup;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use publink_batch::orchestrator::{Orchestrator, OrchestratorServices, RunOptions};
use publink_common::{Config, PublinkError, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("publink=info,info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_budget_exhausted() => {
            // Clean exit: progress is consistent, tomorrow's restart continues.
            eprintln!("daily token budget exhausted, re-run tomorrow to continue: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn delimiter_byte(delimiter: char) -> Result<u8> {
    u8::try_from(delimiter)
        .map_err(|_| PublinkError::Config(format!("delimiter '{delimiter}' is not a single byte")))
}

async fn run() -> Result<()> {
    let args = cli::Cli::parse();
    let config = Config::load()?;
    info!(version = env!("CARGO_PKG_VERSION"), "Publink starting");

    match args.command {
        cli::Command::Batch(batch) => {
            let shared = setup::build_shared(&config, batch.local_registrations.clone());
            let classifier = setup::build_classifier(&config, &shared)?;
            // Batch mode reads LLM-derived queries from the pools the
            // query-generation stages maintain under the output dir.
            let engine = setup::build_engine(
                &config,
                &shared,
                setup::GptQueries::Pools {
                    v1: batch.output_dir.join("queries"),
                    v2: batch.output_dir.join("queries_v2"),
                },
            )?;

            let services = OrchestratorServices {
                registry: shared.registry.clone(),
                engine,
                batch_api: shared.llm.clone(),
                classifier,
                stores: shared.stores.clone(),
            };
            let options = RunOptions {
                input: batch.input,
                output_dir: batch.output_dir,
                delimiter: delimiter_byte(batch.delimiter)?,
                poll_interval: Duration::from_secs(batch.poll_interval),
                validation_run: batch.validation_run,
                step_by_step: batch.step_by_step,
            };

            let mut orchestrator = Orchestrator::new(config, services, options)?;
            let report = orchestrator.run().await?;
            info!(
                stage = report.stage.as_str(),
                success = report.success,
                error = report.error,
                "Batch driver finished"
            );
        }
        cli::Command::Live(live_args) => {
            let shared = setup::build_shared(&config, live_args.local_registrations.clone());
            let classifier = setup::build_classifier(&config, &shared)?;
            let generator = setup::build_live_query_generator(&config, &shared)?;
            let engine =
                setup::build_engine(&config, &shared, setup::GptQueries::Live(generator))?;

            let services = live::LiveServices {
                registry: shared.registry.clone(),
                engine,
                classifier,
                stores: shared.stores.clone(),
            };
            let options = live::LiveOptions {
                input: live_args.input,
                output_dir: live_args.output_dir,
                delimiter: delimiter_byte(live_args.delimiter)?,
                validation_run: live_args.validation_run,
                retry_errors: live_args.retry_errors,
            };
            live::run_live(&config, services, options).await?;
        }
    }

    Ok(())
}
