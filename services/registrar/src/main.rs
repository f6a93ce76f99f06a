//! amiforge-register
//!
//! Runs the image registration step of a build pipeline on its own:
//!
//! - **Plan**: reads the TOML build plan written by the earlier steps
//! - **Step**: merges device mappings, registers the image, waits for it
//! - **Cleanup**: always runs; deregisters the image if the run was aborted
//! - **Outputs**: prints the published ids for the next step

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use amiforge_id::Region;
use amiforge_registrar::{
    BuildPlan, CleanupOutcome, HttpImageService, ImageService, ImageWaiter, MockImageService,
    RegisterImageStep, RunOutcome, ServiceConfig, StepAction, StepContext, StepOutputs, TracingUi,
};

/// Register a machine image from prepared snapshots.
#[derive(Debug, Parser)]
#[command(name = "amiforge-register", version)]
struct Cli {
    /// Path to the TOML build plan.
    #[arg(long, env = "AMIFORGE_PLAN")]
    plan: PathBuf,

    /// Region to register in (overrides AMIFORGE_REGION).
    #[arg(long)]
    region: Option<String>,

    /// Image service URL (overrides AMIFORGE_ENDPOINT).
    #[arg(long)]
    endpoint: Option<String>,

    /// Use an in-memory image service instead of the real one.
    #[arg(long)]
    dry_run: bool,

    /// Print outputs as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = ServiceConfig::from_env()?;
    if let Some(region) = &cli.region {
        config.region = Region::parse(region).context("invalid --region")?;
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let contents = std::fs::read_to_string(&cli.plan)
        .with_context(|| format!("failed to read build plan: {}", cli.plan.display()))?;
    let plan = BuildPlan::from_toml_str(&contents)
        .with_context(|| format!("invalid build plan: {}", cli.plan.display()))?;

    info!(
        region = %config.region,
        endpoint = %config.endpoint,
        ami_name = %plan.image.ami_name,
        dry_run = cli.dry_run,
        "Configuration loaded"
    );

    let service: Box<dyn ImageService> = if cli.dry_run {
        Box::new(MockImageService::new(config.region.clone()))
    } else {
        Box::new(HttpImageService::new(&config).context("failed to build image client")?)
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let waiter = ImageWaiter::new(config.polling.clone());
    let ui = TracingUi;
    let ctx = StepContext {
        config: &plan.image,
        snapshot_ids: &plan.snapshot_ids,
        service: service.as_ref(),
        waiter: &waiter,
        ui: &ui,
        shutdown: shutdown_rx.clone(),
    };

    let mut step = RegisterImageStep::new();
    let mut outputs = StepOutputs::default();
    let action = step.run(&ctx, &mut outputs).await;

    let outcome = if *shutdown_rx.borrow() {
        RunOutcome::Cancelled
    } else if action == StepAction::Halt {
        RunOutcome::Halted
    } else {
        RunOutcome::Continuing
    };

    match step.cleanup(&ctx, outcome).await {
        CleanupOutcome::Skipped => {}
        CleanupOutcome::Deregistered(id) => info!(image_id = %id, "Image rolled back"),
        CleanupOutcome::Warning(warning) => warn!(warning = %warning, "Rollback incomplete"),
    }

    print_outputs(&outputs, cli.json)?;

    if let Some(err) = outputs.error {
        anyhow::bail!(err);
    }
    if outcome == RunOutcome::Cancelled {
        anyhow::bail!("build cancelled");
    }

    Ok(())
}

fn print_outputs(outputs: &StepOutputs, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outputs)?);
        return Ok(());
    }

    for (region, image_id) in outputs.amis.iter().flatten() {
        println!("{region}: {image_id}");
    }
    for (region, snapshots) in outputs.snapshots.iter().flatten() {
        let ids: Vec<_> = snapshots.iter().map(|s| s.as_str()).collect();
        println!("{region} snapshots: {}", ids.join(", "));
    }
    if outputs.intermediary_image == Some(true) {
        println!("intermediary image: yes");
    }
    Ok(())
}
