/// Tandem Agent - drives the OTA engine against simulated devices
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tandem_agent::{AgentConfig, SimCompanion, SimPartition, SimSystem};
use tandem_core::{ArtifactKind, OtaJob, UpdateManifest, VersionGate, VersionOrdering};
use tandem_ota::{Collaborators, OtaEngine, OtaEvent, ReqwestTransport};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tandem-agent")]
#[command(about = "Tandem OTA orchestrator host agent", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare an offered version against an installed one
    Compare {
        /// Offered version
        offered: String,
        /// Installed version
        installed: String,
        /// Apply the version-check override
        #[arg(long)]
        force: bool,
    },
    /// Update a single artifact from a URL
    Update {
        /// main-firmware, companion-firmware or ai-model
        #[arg(short, long)]
        kind: ArtifactKind,
        /// Image URL
        #[arg(short, long)]
        url: String,
        /// Skip the version check
        #[arg(long)]
        force: bool,
    },
    /// Run a JSON update manifest
    Manifest {
        /// Manifest file path
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_agent=info,tandem_ota=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compare {
            offered,
            installed,
            force,
        } => {
            compare(&offered, &installed, force);
            Ok(())
        }
        Commands::Update { kind, url, force } => {
            let config = load_config(cli.config.as_deref())?;
            update(config, kind, &url, force).await
        }
        Commands::Manifest { path } => {
            let config = load_config(cli.config.as_deref())?;
            run_manifest(config, &path).await
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<AgentConfig> {
    let config = AgentConfig::load(path)?;
    config.validate()?;
    Ok(config)
}

fn compare(offered: &str, installed: &str, force: bool) {
    let gate = VersionGate::new();
    gate.set_override(force);

    let verdict = match gate.compare(offered, installed) {
        VersionOrdering::Newer => "newer",
        VersionOrdering::OlderOrEqual => "older-or-equal",
    };
    println!("{verdict}");
}

fn start_engine(config: &AgentConfig) -> anyhow::Result<(OtaEngine, Arc<SimSystem>)> {
    let sim = &config.simulator;
    let system = Arc::new(SimSystem::new());

    let engine = OtaEngine::start(
        config.engine.clone(),
        Collaborators {
            http: Arc::new(ReqwestTransport::new()),
            companion: Arc::new(SimCompanion::new(
                sim.companion_version.clone(),
                sim.companion_flash_path.clone(),
                sim.spi_available,
            )),
            partition: Box::new(SimPartition::new(
                sim.main_version.clone(),
                sim.ota_slot_path.clone(),
            )),
            system: system.clone(),
        },
    )?;
    engine.set_network_available(true);

    tracing::info!(
        companion = %sim.companion_version,
        main = %sim.main_version,
        "Simulated device ready"
    );
    Ok((engine, system))
}

/// Log status and report events until the engine goes away
fn spawn_progress_log(engine: &OtaEngine) -> JoinHandle<()> {
    let mut events = engine.events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                OtaEvent::Status(record) => tracing::info!(
                    stage = %record.stage,
                    kind = ?record.kind,
                    percent = record.percentage,
                    error = ?record.error,
                    "Status"
                ),
                OtaEvent::Report(report) => tracing::info!(
                    kind = ?report.kind,
                    percent = report.percentage,
                    error = ?report.error,
                    "Update report"
                ),
                OtaEvent::RebootScheduled { delay_ms } => {
                    tracing::info!(delay_ms, "Reboot scheduled");
                }
                _ => {}
            }
        }
    })
}

async fn update(config: AgentConfig, kind: ArtifactKind, url: &str, force: bool) -> anyhow::Result<()> {
    let (engine, system) = start_engine(&config)?;
    let progress = spawn_progress_log(&engine);

    let result = if force {
        engine.force_update(kind, url).await
    } else {
        let mut events = engine.events();
        let job = OtaJob::new(kind, url);
        let id = job.id.clone();
        match engine.submit(job).await {
            Err(e) => Err(e),
            // Firmware submissions return before the transfer ends
            Ok(()) => loop {
                match events.recv().await {
                    Some(OtaEvent::JobFinished { job_id, error, .. }) if job_id == id => {
                        break error.map_or(Ok(()), Err);
                    }
                    Some(_) => {}
                    None => break Err(tandem_core::OtaError::EngineStopped),
                }
            },
        }
    };

    finish(engine, &config, system, progress).await;
    match result {
        Ok(()) => {
            println!("{kind}: updated");
            Ok(())
        }
        Err(tandem_core::OtaError::VersionTooOld) => {
            println!("{kind}: already up to date");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("{kind} update from {url} failed")),
    }
}

async fn run_manifest(config: AgentConfig, path: &std::path::Path) -> anyhow::Result<()> {
    let payload = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let manifest = UpdateManifest::from_json(&payload)?;

    let (engine, system) = start_engine(&config)?;
    let progress = spawn_progress_log(&engine);

    let result = engine.handle_manifest(&manifest).await;

    finish(engine, &config, system, progress).await;
    result.with_context(|| format!("manifest {} failed", path.display()))?;
    println!("manifest applied");
    Ok(())
}

/// Let a scheduled restart fire, then stop the engine
async fn finish(engine: OtaEngine, config: &AgentConfig, system: Arc<SimSystem>, progress: JoinHandle<()>) {
    if engine.aggregator_state() == tandem_ota::AggregatorState::Complete {
        tokio::time::sleep(config.engine.reboot_delay() + std::time::Duration::from_millis(100)).await;
    }
    engine.shutdown().await;
    progress.abort();

    if system.restarts() > 0 {
        tracing::info!("Simulated device would now boot the new firmware");
    }
}
