mod cli;
mod layers;

use std::ffi::OsString;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use crate::cli::{fallback_output, Cli};
use crate::layers::artifact;
use crate::layers::discovery::ArxivClient;
use crate::layers::pipeline::{Pipeline, RunError};
use crate::layers::scoring::{ChatCompletionClient, Endpoint};
use crate::layers::validation::validate_request;

const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    // 0. Load Configuration
    dotenv().ok();

    // Logs go to stderr; the results file is the only output channel.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<OsString> = std::env::args_os().collect();
    let cli = match Cli::try_parse_from(&args) {
        Ok(cli) => cli,
        Err(err) => {
            // A rejected invocation must not leave the previous run's results behind either.
            let output = fallback_output(&args, std::env::var_os("ARXIV_READER_OUTPUT"));
            if let Err(e) = artifact::clear(&output).await {
                tracing::warn!("Could not remove stale results at {:?}: {}", output, e);
            }
            err.exit();
        }
    };

    if let Err(source) = artifact::clear(&cli.output).await {
        return failure(&anyhow::Error::from(RunError::ArtifactWrite {
            path: cli.output.clone(),
            source,
        }));
    }

    tokio::select! {
        outcome = run(&cli) => match outcome {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => failure(&e),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, abandoning in-flight requests");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}

fn failure(e: &anyhow::Error) -> ExitCode {
    eprintln!("error: {e:#}");
    ExitCode::from(e.downcast_ref::<RunError>().map_or(1, RunError::exit_code))
}

async fn run(cli: &Cli) -> Result<()> {
    // 1. Validate the invocation before touching the network
    let request = validate_request(&cli.raw_request()).map_err(RunError::from)?;
    tracing::info!(
        "Received inputs: topic={}, subjects={:?}, interests={:?}, max_results={}",
        request.topic.name,
        request.subjects.iter().map(|s| s.name).collect::<Vec<_>>(),
        request.interests,
        request.budget
    );

    // 2. Wire up the source and the scoring model
    let source = ArxivClient::new(cli.arxiv_url.clone(), cli.timeout()).context("failed to build the arXiv client")?;
    let endpoint = Endpoint::resolve(&request.credential, cli.llm_base_url.clone(), cli.llm_model.clone());
    tracing::info!("Scoring with {} at {}", endpoint.model, endpoint.base_url);
    let model = ChatCompletionClient::new(endpoint, request.credential.clone(), cli.requests_per_minute, cli.timeout())
        .context("failed to build the language-model client")?;

    // 3. Fetch, score, rank
    let pipeline = Pipeline::new(Arc::new(source), Arc::new(model), cli.retry_policy(), cli.pipeline_config());
    let results = pipeline.run(&request).await?;

    // 4. Persist for the caller, and make sure it reads back before reporting success
    let persisted = match artifact::write(&cli.output, &results).await {
        Ok(()) => artifact::read(&cli.output).await,
        Err(e) => Err(e),
    };
    let written = persisted.map_err(|source| RunError::ArtifactWrite {
        path: cli.output.clone(),
        source,
    })?;
    if written.len() != results.len() {
        return Err(RunError::ArtifactWrite {
            path: cli.output.clone(),
            source: std::io::Error::other("results file does not match the ranked papers"),
        }
        .into());
    }

    match results.len() {
        0 => tracing::info!("No papers matched; wrote an empty result list"),
        n if n < request.budget => tracing::info!("Only {} of {} requested papers could be ranked", n, request.budget),
        n => tracing::info!("Ranked {} papers", n),
    }
    Ok(())
}
