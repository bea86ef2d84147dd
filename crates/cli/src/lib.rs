use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobrow_cache::PipelineConfig;
use jobrow_core::{
    AssetUrlBuilder, DataUrlLoader, PreviewUrlBuilder, ProgressConfig, ProgressInput,
    ProgressSmoother,
};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobrow-cli")]
#[command(about = "Job row live-update pipeline tools")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replay a progress trace through the smoother and print frames as JSON lines.
    ReplayProgress {
        #[arg(value_name = "TRACE")]
        trace: PathBuf,
        /// Backend reporting interval; overrides the trace and environment.
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Spacing of the emitted frames.
        #[arg(long, default_value_t = 50)]
        frame_ms: u64,
    },
    /// Print the display URL for a preview path.
    PreviewUrl {
        #[arg(value_name = "PATH")]
        path: String,
        #[arg(long, default_value_t = 0)]
        revision: u64,
        /// Inline the file as a data: URL, reading only under this directory.
        #[arg(long, value_name = "DIR")]
        inline_root: Option<PathBuf>,
    },
    /// Print the resolved pipeline configuration as JSON.
    Config {
        /// Read a TOML file instead of JOBROW_* environment variables.
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

/// Recorded job snapshots, in the order the host observed them
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressTrace {
    #[serde(default)]
    interval_ms: Option<u64>,
    events: Vec<TraceEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceEvent {
    at_ms: u64,
    #[serde(flatten)]
    input: ProgressInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FrameOutput {
    t_ms: u64,
    displayed: f64,
    rendered: f64,
    transition_ms: u64,
}

/// Install the stderr log subscriber, filtered by `JOBROW_LOG` or `RUST_LOG`
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("JOBROW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::ReplayProgress { trace, interval_ms, frame_ms } => {
            run_replay_progress(&trace, interval_ms, frame_ms)
        }
        Commands::PreviewUrl { path, revision, inline_root } => {
            run_preview_url(&path, revision, inline_root.as_deref())
        }
        Commands::Config { file } => run_config(file.as_deref()),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn run_replay_progress(trace_path: &Path, interval_ms: Option<u64>, frame_ms: u64) -> Result<()> {
    if frame_ms == 0 {
        anyhow::bail!("--frame-ms must be >= 1");
    }

    let raw = fs::read_to_string(trace_path)
        .with_context(|| format!("failed to read trace {}", trace_path.display()))?;
    let mut trace: ProgressTrace = serde_json::from_str(&raw).context("invalid progress trace")?;
    if trace.events.is_empty() {
        anyhow::bail!("trace has no events");
    }
    trace.events.sort_by_key(|event| event.at_ms);

    let base = PipelineConfig::from_env().context("invalid JOBROW_* configuration")?;
    let mut config = ProgressConfig::from(&base);
    if let Some(ms) = interval_ms.or(trace.interval_ms) {
        config.report_interval_ms = ms;
    }
    debug!(?config, events = trace.events.len(), "replaying progress trace");

    let start = trace.events[0].at_ms;
    let last = trace.events[trace.events.len() - 1].at_ms;
    let mut smoother = ProgressSmoother::new(config);
    let mut pending = trace.events.iter().peekable();
    let mut end = last;
    let mut t = start;

    while t <= end {
        while let Some(event) = pending.next_if(|event| event.at_ms <= t) {
            smoother.observe(&event.input, event.at_ms);
        }
        let displayed = smoother.tick(t);
        if pending.peek().is_none() {
            // Let the final transition play out
            end = end.max(t + smoother.transition_ms());
        }

        let frame = FrameOutput {
            t_ms: t,
            displayed,
            rendered: smoother.rendered_at(t),
            transition_ms: smoother.transition_ms(),
        };
        println!("{}", serde_json::to_string(&frame)?);
        t += frame_ms;
    }

    Ok(())
}

fn run_preview_url(path: &str, revision: u64, inline_root: Option<&Path>) -> Result<()> {
    let url = match inline_root {
        Some(root) => DataUrlLoader::new(root)
            .read_data_url(path)
            .with_context(|| format!("failed to inline {path}"))?,
        None => AssetUrlBuilder::default()
            .build(path, revision)
            .context("preview path is empty")?,
    };
    println!("{url}");
    Ok(())
}

fn run_config(file: Option<&Path>) -> Result<()> {
    let config = match file {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::from_env().context("invalid JOBROW_* configuration")?,
    };
    config.validate()?;

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
