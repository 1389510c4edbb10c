//! Conclave CLI — run or resume a debate from a JSON configuration.
//!
//! Exit codes: 0 when consensus was reached, 2 on deadlock, 1 on any fatal
//! error (invalid config, checkpoint integrity, limit breach).
//!
//! ```bash
//! conclave --config debate.json --output verdict.json
//! conclave --config debate.json --resume checkpoints/<session>.checkpoint.json
//! conclave --config debate.json --validate-only
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use conclave::{exit_code_for, AdapterRegistry, DebateConfig, DebateOutput, Orchestrator};

#[derive(Parser, Debug)]
#[command(
    name = "conclave",
    version,
    about = "Adversarial multi-model debate orchestration with judge-panel fallback"
)]
struct Args {
    /// Path to the debate configuration (JSON).
    #[arg(long, env = "CONCLAVE_CONFIG")]
    config: PathBuf,

    /// Write the output document here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Resume from a checkpoint file instead of starting fresh.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Validate the configuration, print the resolved form, and exit.
    #[arg(long, default_value_t = false)]
    validate_only: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let code = match run(Args::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config {}", args.config.display()))?;
    let config = DebateConfig::from_json(&raw).map_err(anyhow::Error::msg)?;

    if args.validate_only {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(0);
    }

    let mut orchestrator = match &args.resume {
        Some(path) => Orchestrator::resume(path, AdapterRegistry::global())
            .with_context(|| format!("resuming from {}", path.display()))?,
        None => Orchestrator::new(config)?,
    };

    info!(session = %orchestrator.session().id, "debate starting");
    let output: DebateOutput = orchestrator.run().await?;

    let document = serde_json::to_string_pretty(&output)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, &document)
                .with_context(|| format!("writing output {}", path.display()))?;
            info!(path = %path.display(), "output document written");
        }
        None => println!("{document}"),
    }

    Ok(exit_code_for(output.session.phase))
}
