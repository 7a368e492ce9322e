use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use habitat_merge::{run, DatasetMode, MergeConfig, PartitionStrategy, RunStatus, ShutdownToken};
use habitat_store::geojson::{read_candidates_file, write_habitats_file};
use habitat_store::MemoryStore;
use log::{info, warn};
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

/// How to interpret incoming polygon coordinates.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputCs {
    /// Try to decide automatically from ranges.
    Auto,
    /// `[lon, lat]` in degrees (CRS:84).
    Geodetic,
    /// Planar metres in an arbitrary projected frame.
    Planar,
}

impl From<InputCs> for habitat_store::InputCs {
    fn from(cs: InputCs) -> Self {
        match cs {
            InputCs::Auto => habitat_store::InputCs::Auto,
            InputCs::Geodetic => habitat_store::InputCs::Geodetic,
            InputCs::Planar => habitat_store::InputCs::Planar,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Cluster and consolidate raw habitat polygons")]
struct Args {
    /// GeoJSON FeatureCollection of candidate polygons (`polygon_id`, `h_type`).
    #[arg(long)]
    input: PathBuf,

    /// Where to write the consolidated habitats.
    #[arg(long)]
    output: PathBuf,

    /// Optional JSON file replacing the built-in thresholds and limits.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source dataset; `lcm` tightens merge distances.
    #[arg(long, value_enum, default_value_t = DatasetMode::Corine)]
    mode: DatasetMode,

    /// Either auto-detect or force the input coordinate system.
    #[arg(long, value_enum, default_value_t = InputCs::Auto)]
    input_cs: InputCs,

    /// Neighbour search workers (phase 1).
    #[arg(long, env = "HABITAT_GRAPH_WORKERS")]
    graph_workers: Option<usize>,

    /// Consolidation workers (phase 2).
    #[arg(long, env = "HABITAT_MERGE_WORKERS")]
    merge_workers: Option<usize>,

    #[arg(long, value_enum)]
    partition: Option<PartitionStrategy>,

    /// Minimum habitat area in m².
    #[arg(long)]
    min_size: Option<f64>,

    /// Neighbour query radius in metres.
    #[arg(long)]
    search_distance: Option<f64>,

    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

impl Args {
    fn merge_config(&self) -> Result<MergeConfig> {
        let base = match &self.config {
            Some(path) => MergeConfig::load(path)?,
            None => MergeConfig::default(),
        };
        let mut config = base.with_mode(self.mode);

        if let Some(n) = self.graph_workers {
            config.graph_workers = n;
        }
        if let Some(n) = self.merge_workers {
            config.merge_workers = n;
        }
        if let Some(p) = self.partition {
            config.partition = p;
        }
        if let Some(v) = self.min_size {
            config.min_size = v;
        }
        if let Some(v) = self.search_distance {
            config.search_distance = v;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Cancel `token` on Ctrl-C. The thread is detached and dies with the process.
fn spawn_signal_listener(token: ShutdownToken) -> Result<()> {
    thread::Builder::new()
        .name("signal".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("signal listener unavailable: {e}");
                    return;
                }
            };

            rt.block_on(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("interrupt received, finishing items in flight");
                        token.cancel();
                    }
                    Err(e) => warn!("cannot listen for Ctrl-C: {e}"),
                }
            });
        })
        .context("failed to spawn the signal thread")?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = args.merge_config()?;

    // Fail before doing any work.
    if args.output.exists() && !args.overwrite {
        bail!(
            "{} already exists (pass --overwrite to replace it)",
            args.output.display()
        );
    }

    let token = ShutdownToken::new();
    spawn_signal_listener(token.clone())?;

    let t = Instant::now();
    let dataset = read_candidates_file(&args.input, args.input_cs.into())
        .with_context(|| format!("reading {}", args.input.display()))?;
    info!(
        "read {} candidates from {} ({} coordinates) in {:.2?}",
        dataset.candidates.len(),
        args.input.display(),
        dataset.input_cs,
        t.elapsed()
    );

    let store = MemoryStore::new(dataset.candidates).context("building the candidate store")?;

    info!(
        "graph workers: {}, merge workers: {}, partition: {:?}",
        config.graph_workers, config.merge_workers, config.partition
    );
    let report = run(&store, &config, &token)?;
    report.log();

    if report.status == RunStatus::Cancelled {
        bail!("run cancelled; nothing written");
    }

    let habitats = store.habitats();
    write_habitats_file(&args.output, &habitats, &dataset.frame, args.overwrite)
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!("wrote {} habitats to {}", habitats.len(), args.output.display());

    Ok(())
}
