use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use adagan::logging::init_logging;
use adagan::training::{
    ClosureCallbacks, Dataset, LocalProcessGroup, ProcessGroup, TensorDataset, TrainingConfig,
    TrainingLoop, TrainingResult,
};
use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing::{error, info};

/// Creating this file inside the run directory stops training at the next tick
const ABORT_FILE: &str = "abort";

#[derive(Parser)]
#[command(name = "adagan")]
#[command(about = "Data-parallel StyleGAN2 training with adaptive differentiable augmentation", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a generator/discriminator pair
    Train {
        /// Configuration file (JSON or YAML)
        #[arg(short, long, env = "ADAGAN_CONFIG")]
        config: Option<PathBuf>,

        /// Training set in safetensors format (`images` u8 [N,C,H,W], optional `labels` u32 [N])
        #[arg(short, long, required_unless_present = "synthetic")]
        data: Option<PathBuf>,

        /// Train on a random dataset of this many samples instead
        #[arg(long)]
        synthetic: Option<usize>,

        /// Output directory, overrides the configuration
        #[arg(long)]
        run_dir: Option<PathBuf>,

        /// Number of replicas, overrides the configuration
        #[arg(long)]
        replicas: Option<usize>,

        /// Snapshot to resume network weights from
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show build information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs)?;

    match cli.command {
        Commands::Train {
            config,
            data,
            synthetic,
            run_dir,
            replicas,
            resume,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(run_dir) = run_dir {
                config.run.run_dir = run_dir;
            }
            if let Some(replicas) = replicas {
                config.distributed.num_replicas = replicas;
            }
            if resume.is_some() {
                config.run.resume_from = resume;
            }
            config.validate().context("Invalid training configuration")?;

            let dataset: Arc<dyn Dataset> = match (data, synthetic) {
                (Some(path), _) => Arc::new(
                    TensorDataset::from_safetensors(&path, &Device::Cpu)
                        .with_context(|| format!("Failed to load training set {}", path.display()))?,
                ),
                (None, Some(n)) => Arc::new(TensorDataset::synthetic(
                    n,
                    3,
                    16,
                    0,
                    config.run.random_seed,
                    &Device::Cpu,
                )?),
                (None, None) => return Err(anyhow!("either --data or --synthetic is required")),
            };

            let result = train(config, dataset)?;
            info!(
                kimg = result.final_state.kimg(),
                snapshots = result.snapshots.len(),
                seconds = result.training_duration_secs,
                "Training finished with status {:?}",
                result.final_state.status
            );
        }

        Commands::Config { file } => {
            validate_config(&file)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<TrainingConfig> {
    match path {
        Some(path) => TrainingConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display())),
        None => Ok(TrainingConfig::default()),
    }
}

fn train(config: TrainingConfig, dataset: Arc<dyn Dataset>) -> Result<TrainingResult> {
    let replicas = config.distributed.num_replicas;
    let groups = LocalProcessGroup::create(replicas)?;
    info!(replicas, run_dir = %config.run.run_dir.display(), "Launching training");

    let handles: Vec<_> = groups
        .into_iter()
        .map(|group| {
            let config = config.clone();
            let dataset = dataset.clone();
            thread::Builder::new()
                .name(format!("rank{}", group.rank()))
                .spawn(move || run_replica(config, dataset, group))
        })
        .collect::<std::io::Result<_>>()
        .context("Failed to spawn replica threads")?;

    let mut coordinator_result = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        let result = handle
            .join()
            .map_err(|_| anyhow!("replica {rank} panicked"))?;
        match result {
            Ok(result) if rank == 0 => coordinator_result = Some(result),
            Ok(_) => {}
            Err(e) => {
                error!(rank, "Replica failed: {e:#}");
                return Err(e);
            }
        }
    }
    coordinator_result.ok_or_else(|| anyhow!("coordinator produced no result"))
}

fn run_replica(
    config: TrainingConfig,
    dataset: Arc<dyn Dataset>,
    group: LocalProcessGroup,
) -> Result<TrainingResult> {
    let rank = group.rank();
    let device = Device::cuda_if_available(rank).context("Failed to select device")?;
    let abort_file = config.run.run_dir.join(ABORT_FILE);
    let callbacks = ClosureCallbacks::new().with_abort(move || abort_file.exists());

    let mut trainer = TrainingLoop::new(config, dataset, Arc::new(group), &device, Box::new(callbacks))
        .with_context(|| format!("Failed to set up rank {rank}"))?;
    trainer
        .train()
        .with_context(|| format!("Training failed on rank {rank}"))
}

fn validate_config(config_path: &Path) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    // from_file already validates
    let config = TrainingConfig::from_file(config_path).context("Failed to load configuration file")?;

    info!("Configuration is valid");
    info!("Configuration summary:");
    info!(
        "  - Budget: {} kimg, {} kimg per tick",
        config.run.total_kimg, config.run.kimg_per_tick
    );
    info!(
        "  - Batch: {} total, {} per replica, {} replicas",
        config.batch.batch_size,
        config.batch_gpu(),
        config.distributed.num_replicas
    );
    info!(
        "  - Loss: r1_gamma={}, pl_weight={}, style_mixing_prob={}, DiffAugment={:?}",
        config.loss.r1_gamma, config.loss.pl_weight, config.loss.style_mixing_prob, config.loss.diffaugment
    );
    info!(
        "  - Lazy regularization: G={:?}, D={:?}",
        config.regularization.g_reg_interval, config.regularization.d_reg_interval
    );
    info!(
        "  - ADA: enabled={}, p={}, target={:?}",
        config.augment.enabled, config.augment.augment_p, config.augment.ada_target
    );

    Ok(())
}

fn show_system_info() {
    println!("adagan - StyleGAN2 training with adaptive differentiable augmentation");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  + NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  - CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  + Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  - Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  + Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  - Accelerate support (not compiled)");

    println!("  + CPU training");
    println!();
    println!("Usage:");
    println!("  adagan train -c train.yaml -d data.safetensors --replicas 2");
    println!("  adagan train --synthetic 64         # Smoke run on random data");
    println!("  adagan config -f train.yaml         # Validate configuration");
    println!("  adagan info                         # Show this information");
    println!();
    println!("Create `<run_dir>/{ABORT_FILE}` to stop training at the next tick.");
}
