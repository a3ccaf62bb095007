//! vla-serve - action chunk server and debugging tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vla_serve::action::read_action_log;
use vla_serve::observation::ImageStats;
use vla_serve::trajectory::{Arrow, ARROW_LENGTH};
use vla_serve::wire::ActRequest;
use vla_serve::{
    integrate, ActionService, ChunkJournal, Config, InferenceBackend, Pose, RemotePolicy,
    ReplayBackend, StatisticsTable, StubBackend,
};

/// Serve and inspect robot action chunks
#[derive(Parser, Debug)]
#[command(name = "vla-serve")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the REST action server
    Serve {
        /// Model backend
        #[arg(long, value_enum, default_value = "stub")]
        backend: BackendKind,

        /// Action log replayed by the `replay` backend
        #[arg(long, required_if_eq("backend", "replay"))]
        replay_log: Option<PathBuf>,

        /// The replay log holds raw [-1,1] model outputs, not physical actions
        #[arg(long, requires = "replay_log")]
        normalized: bool,

        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send an observation bundle to a running server
    Act {
        /// Server base URL
        #[arg(short, long, default_value = "http://localhost:8000")]
        server: String,

        /// Observation bundle (request JSON)
        #[arg(short, long)]
        observation: PathBuf,

        /// Write the returned chunk as an action log
        #[arg(long)]
        output: Option<PathBuf>,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Integrate an action log into a trajectory
    Replay {
        /// Action log to integrate
        #[arg(short, long)]
        actions: PathBuf,

        /// Observation bundle providing the initial state
        #[arg(short, long)]
        observation: Option<PathBuf>,

        /// Write poses and orientation arrows as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print pixel statistics of an observation bundle
    Inspect {
        /// Observation bundle (request JSON)
        #[arg(short, long)]
        observation: PathBuf,
    },

    /// List chunks recorded in the journal
    History {
        /// Journal path (defaults to deploy.journal_path)
        #[arg(long)]
        journal: Option<PathBuf>,

        /// Only entries at or after this unix time (ms)
        #[arg(long, default_value = "0")]
        since: u64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendKind {
    Stub,
    Replay,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Serve {
            backend,
            replay_log,
            normalized,
            port,
        } => run_serve(config, backend, replay_log, normalized, port).await,
        Commands::Act {
            server,
            observation,
            output,
            timeout,
        } => run_act(&server, &observation, output, timeout).await,
        Commands::Replay {
            actions,
            observation,
            output,
        } => run_replay(&actions, observation.as_deref(), output.as_deref()),
        Commands::Inspect { observation } => run_inspect(&observation),
        Commands::History { journal, since } => {
            let path = journal
                .or(config.deploy.journal_path)
                .context("no journal path given and deploy.journal_path is unset")?;
            run_history(&path, since)
        }
    }
}

async fn run_serve(
    mut config: Config,
    kind: BackendKind,
    replay_log: Option<PathBuf>,
    normalized: bool,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.deploy.port = port;
    }

    let stats = match &config.service.statistics_path {
        Some(path) => StatisticsTable::load(path)
            .with_context(|| format!("failed to load statistics {}", path.display()))?,
        None => StatisticsTable::builtin(),
    };

    let backend: Arc<dyn InferenceBackend> = match kind {
        BackendKind::Stub => Arc::new(StubBackend::zeros(
            config.service.chunk_horizon,
            config.service.action_dim,
        )),
        BackendKind::Replay => {
            let path = replay_log.context("--replay-log is required for the replay backend")?;
            let chunk = read_action_log(&path)
                .with_context(|| format!("failed to read replay log {}", path.display()))?;
            info!(path = %path.display(), steps = chunk.len(), normalized, "replaying action log");
            if normalized {
                Arc::new(ReplayBackend::normalized(chunk))
            } else {
                Arc::new(ReplayBackend::new(chunk))
            }
        }
    };

    let mut service = ActionService::new(config.service.clone(), &stats, backend)?;
    if let Some(path) = &config.deploy.journal_path {
        service = service.with_journal(ChunkJournal::open(path)?);
        info!(journal = %path.display(), "recording served chunks");
    }

    vla_serve::server::serve(&config.deploy, Arc::new(service)).await
}

async fn run_act(
    server: &str,
    observation: &Path,
    output: Option<PathBuf>,
    timeout: u64,
) -> anyhow::Result<()> {
    let request = ActRequest::load(observation)
        .with_context(|| format!("failed to read observation {}", observation.display()))?;
    let policy = RemotePolicy::with_timeout(server, std::time::Duration::from_secs(timeout))?;

    let chunk = policy.act_request(&request).await?;
    println!("Generated action chunk:");
    for step in chunk.steps() {
        println!("{:?}", step.values());
    }

    if let Some(path) = output {
        chunk.write_log(&path)?;
        info!(path = %path.display(), "wrote action log");
    }
    Ok(())
}

#[derive(Serialize)]
struct TrajectoryDump<'a> {
    poses: &'a [Pose],
    arrows: Vec<Arrow>,
}

fn run_replay(
    actions: &Path,
    observation: Option<&Path>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let chunk = read_action_log(actions)?;

    let state = match observation {
        Some(path) => ActRequest::load(path)?.into_raw_observation()?.proprio_state,
        None => None,
    };
    let initial = match state.as_deref().and_then(Pose::from_state) {
        Some(pose) => pose,
        None => {
            warn!("no usable state in observation; starting from the origin");
            Pose::origin()
        }
    };

    let trajectory = integrate(initial, &chunk)?;
    let range = trajectory.position_range();
    println!("Trajectory length: {} points", trajectory.len());
    println!("Position range: [{:.6} {:.6} {:.6}]", range.x, range.y, range.z);

    if let Some(path) = output {
        let dump = TrajectoryDump {
            poses: trajectory.poses(),
            arrows: trajectory.orientation_arrows(ARROW_LENGTH),
        };
        std::fs::write(path, serde_json::to_string_pretty(&dump)?)?;
        info!(path = %path.display(), "wrote trajectory");
    }
    Ok(())
}

fn run_inspect(observation: &Path) -> anyhow::Result<()> {
    let raw = ActRequest::load(observation)?.into_raw_observation()?;
    if let Some(task) = &raw.task_description {
        println!("Task: {task}");
    }

    for (name, image) in [("full_image", &raw.primary_image), ("wrist_image", &raw.wrist_image)] {
        let Some(image) = image else {
            println!("{name}: absent");
            continue;
        };
        let stats = ImageStats::of(image);
        println!(
            "{name}: shape {:?}, dtype {}, min {}, max {}, mean {:.4}, detected range {:?}",
            stats.shape, stats.dtype, stats.min, stats.max, stats.mean, stats.range
        );
    }

    if let Some(state) = &raw.proprio_state {
        println!("state: {state:?}");
    }
    Ok(())
}

fn run_history(path: &Path, since: u64) -> anyhow::Result<()> {
    let journal = ChunkJournal::open(path)?;
    let entries = journal.since(since);
    println!("{} chunk(s) in {}", entries.len(), path.display());
    for entry in entries {
        println!(
            "{} [{}] {:?}: {} steps",
            entry.timestamp,
            entry.unnorm_key,
            entry.task_description,
            entry.actions.len()
        );
    }
    Ok(())
}
