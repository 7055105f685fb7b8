use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use animate_rs_core::dist::{
    pick_rendezvous_port, spawn_workers, validate_world_size, wait_workers, DistContext,
};
use animate_rs_core::{
    best_device, AnimationConfig, AnimationPipeline, DType, SampleDriver,
};

#[derive(Parser)]
struct Args {
    /// Path to the YAML run configuration.
    #[arg(long)]
    config: PathBuf,

    /// Launch one worker process per rank and wait for all of them.
    #[arg(long)]
    dist: bool,

    /// Rank of this process.
    #[arg(long, default_value_t = 0)]
    rank: usize,

    /// Total number of ranks.
    #[arg(long = "world_size", default_value_t = 1)]
    world_size: usize,

    /// Rendezvous port, set by the launcher when re-executing workers.
    #[arg(long, hide = true)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match (args.dist, args.port) {
        // Launcher: fan out one process per rank, then wait.
        (true, None) => {
            let world_size = args.world_size;
            validate_world_size(world_size)?;
            let port = pick_rendezvous_port();
            info!("launching {world_size} worker(s), rendezvous on port {port}");
            let children = spawn_workers(&args.config, world_size, port)?;
            wait_workers(children)
        }
        // Re-executed worker.
        (true, Some(port)) => {
            let ctx = DistContext::bootstrap(args.rank, args.world_size, port)?;
            run(&args.config, args.rank, Some(ctx))
        }
        (false, _) => run(&args.config, 0, None),
    }
}

fn run(config_path: &Path, rank: usize, mut dist: Option<DistContext>) -> anyhow::Result<()> {
    let config = AnimationConfig::load(config_path)?;

    // Rank 0 decides the output directory (it may be timestamped) and shares
    // it before anyone starts working.
    let save_dir = config.save_dir(config_path);
    let save_dir = match dist.as_mut() {
        Some(ctx) => PathBuf::from(ctx.broadcast_string(&save_dir.to_string_lossy())?),
        None => save_dir,
    };
    if rank == 0 {
        fs::create_dir_all(&save_dir)?;
        info!("writing outputs to {}", save_dir.display());
    }
    if let Some(ctx) = dist.as_mut() {
        ctx.barrier()?;
    }

    let device = best_device(rank)?;
    info!("rank {rank}: loading pipeline on {device:?}");
    let pipeline = AnimationPipeline::load(&config, &device, DType::F32)?;

    let mut driver = SampleDriver::new(config, save_dir, pipeline);
    if let Some(ctx) = dist.take() {
        driver = driver.with_dist(ctx);
    }
    let record = driver.run()?;
    if rank == 0 {
        info!("done; seeds used: {:?}", record.realized);
    }
    Ok(())
}
