//! Training loop driver
//!
//! [`TrainingLoop`] owns every component of a run on one replica. Each
//! iteration fetches real batches, samples latents and labels, runs the due
//! phases through the loss engine, reduces gradients, steps optimizers and
//! updates EMA and augmentation state. Tick boundaries report progress, save
//! snapshots and poll the abort predicate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, instrument, warn};

use super::ada::AdaController;
use super::callbacks::{NoopCallbacks, TrainingCallbacks};
use super::checkpoints::{Snapshot, SnapshotManager, D_PREFIX, G_EMA_PREFIX, G_PREFIX};
use super::config::TrainingConfig;
use super::data::{Dataset, DistributedSampler, InfiniteLoader};
use super::distributed::{DeviceFence, ProcessGroup, SingleProcess};
use super::ema::{ema_beta, EmaTracker};
use super::loss::{Loss, LossState, StyleGAN2Loss, StyleGAN2LossConfig};
use super::metrics::{JsonlStatsWriter, StatsCollector, StatsHub, TickReport};
use super::phase::{build_phases, ModuleRole, TrainingPhase};
use super::state::{TrainingResult, TrainingState, TrainingStatus};
use crate::augment::{AugmentPipe, BasicAugmentPipe, DiffAugment};
use crate::error::{Error, Result};
use crate::networks::mlp::{MlpDiscriminator, MlpDiscriminatorConfig, MlpGenerator, MlpGeneratorConfig};
use crate::networks::{Discriminator, Generator};
use crate::utils::sample;

/// Real and generated inputs of one accumulation round
struct RoundInputs {
    gen_z: Tensor,
    gen_c: Tensor,
}

/// Training loop for one replica
pub struct TrainingLoop {
    config: TrainingConfig,
    device: Device,
    group: Arc<dyn ProcessGroup>,
    dataset: Arc<dyn Dataset>,
    loader: InfiniteLoader,
    g: Arc<dyn Generator>,
    d: Arc<dyn Discriminator>,
    g_ema: Box<dyn Generator>,
    ema: EmaTracker,
    augment_pipe: Option<Arc<dyn AugmentPipe>>,
    ada: Option<AdaController>,
    loss: Box<dyn Loss>,
    phases: Vec<TrainingPhase>,
    stats: Arc<StatsHub>,
    tick_stats: Arc<StatsCollector>,
    snapshots: Option<SnapshotManager>,
    stats_writer: Option<JsonlStatsWriter>,
    fence: DeviceFence,
    callbacks: Box<dyn TrainingCallbacks>,
    rng: StdRng,
    tick_start_time: Instant,
    written_snapshots: Vec<PathBuf>,
    last_report: Option<TickReport>,
}

impl TrainingLoop {
    /// Single-process loop with the reference networks and no callbacks
    pub fn single(config: TrainingConfig, dataset: Arc<dyn Dataset>, device: &Device) -> Result<Self> {
        Self::new(
            config,
            dataset,
            Arc::new(SingleProcess),
            device,
            Box::new(NoopCallbacks),
        )
    }

    /// Loop with the reference MLP networks sized from the config and dataset
    pub fn new(
        config: TrainingConfig,
        dataset: Arc<dyn Dataset>,
        group: Arc<dyn ProcessGroup>,
        device: &Device,
        callbacks: Box<dyn TrainingCallbacks>,
    ) -> Result<Self> {
        // Identical initialization on every rank
        let seed = config.run.random_seed;
        let (c_dim, channels, res) = (dataset.label_dim(), dataset.num_channels(), dataset.resolution());
        let g = MlpGenerator::new(
            MlpGeneratorConfig::from_network(&config.network, c_dim, channels, res, seed),
            device,
        )?;
        let d = MlpDiscriminator::new(
            MlpDiscriminatorConfig::from_network(&config.network, c_dim, channels, res, seed.wrapping_add(1)),
            device,
        )?;
        Self::with_networks(config, dataset, Arc::new(g), Arc::new(d), group, device, callbacks)
    }

    /// Loop around caller-provided networks
    #[instrument(skip_all, fields(rank = group.rank(), world = group.world_size()))]
    pub fn with_networks(
        config: TrainingConfig,
        dataset: Arc<dyn Dataset>,
        g: Arc<dyn Generator>,
        d: Arc<dyn Discriminator>,
        group: Arc<dyn ProcessGroup>,
        device: &Device,
        callbacks: Box<dyn TrainingCallbacks>,
    ) -> Result<Self> {
        config.validate()?;
        let (rank, world) = (group.rank(), group.world_size());
        if world != config.distributed.num_replicas {
            return Err(Error::config(format!(
                "process group has {world} ranks but num_replicas is {}",
                config.distributed.num_replicas
            )));
        }
        check_geometry(dataset.as_ref(), g.as_ref(), d.as_ref())?;
        let rank_seed = config.run.random_seed.wrapping_mul(world as u64).wrapping_add(rank as u64);

        info!("Loading training set...");
        let sampler = DistributedSampler::new(dataset.len(), rank, world, config.run.random_seed, true)?;
        let loader = InfiniteLoader::new(dataset.clone(), sampler, config.batch_gpu(), device)?;
        if group.is_coordinator() {
            info!(
                images = dataset.len(),
                resolution = dataset.resolution(),
                labels = dataset.label_dim(),
                "Training set ready"
            );
        }

        info!("Constructing networks...");
        let g_ema = g.deep_copy()?;
        let ema = EmaTracker::new(g.as_ref(), g_ema.as_ref())?;
        debug!(
            g_params = g.num_parameters(),
            d_params = d.num_parameters(),
            "Networks constructed"
        );

        if let Some(path) = &config.run.resume_from {
            info!(path = %path.display(), "Resuming from snapshot");
            let snapshot = Snapshot::load(path, device)?;
            snapshot.copy_params_and_buffers(G_PREFIX, g.as_ref(), false)?;
            snapshot.copy_params_and_buffers(D_PREFIX, d.as_ref(), false)?;
            snapshot.copy_params_and_buffers(G_EMA_PREFIX, g_ema.as_ref(), false)?;
        }

        info!("Setting up augmentation...");
        let stats = Arc::new(StatsHub::new());
        let tick_stats = stats.collector(None);
        let augment_pipe: Option<Arc<dyn AugmentPipe>> = if config.augment_pipe_enabled() {
            Some(Arc::new(BasicAugmentPipe::from_config(
                &config.augment,
                rank_seed.wrapping_add(2),
            )))
        } else {
            None
        };
        let ada = augment_pipe
            .as_ref()
            .map(|pipe| AdaController::new(pipe.clone(), &config.augment, config.batch.batch_size, &stats));

        let diffaugment = DiffAugment::parse(&config.loss.diffaugment)?.with_seed(rank_seed.wrapping_add(3));
        let loss: Box<dyn Loss> = Box::new(StyleGAN2Loss::new(
            g.clone(),
            d.clone(),
            diffaugment,
            augment_pipe.clone(),
            StyleGAN2LossConfig::from_config(&config.loss, rank_seed.wrapping_add(4)),
            stats.clone(),
        ));

        info!("Setting up training phases...");
        let phases = build_phases(&config, &g.named_parameters(), &d.named_parameters());
        debug!(phases = ?phases.iter().map(|p| p.name()).collect::<Vec<_>>(), "Phases built");

        let (snapshots, stats_writer) = if group.is_coordinator() {
            let writer = if config.logging.stats_jsonl {
                Some(JsonlStatsWriter::create(&config.run.run_dir)?)
            } else {
                None
            };
            let snapshots = match config.run.network_snapshot_ticks {
                Some(_) => Some(SnapshotManager::new(&config.run.run_dir)?),
                None => None,
            };
            (snapshots, writer)
        } else {
            (None, None)
        };

        Ok(Self {
            config,
            device: device.clone(),
            group,
            dataset,
            loader,
            g,
            d,
            g_ema,
            ema,
            augment_pipe,
            ada,
            loss,
            phases,
            stats,
            tick_stats,
            snapshots,
            stats_writer,
            fence: DeviceFence::new(device),
            callbacks,
            rng: StdRng::seed_from_u64(rank_seed),
            tick_start_time: Instant::now(),
            written_snapshots: Vec::new(),
            last_report: None,
        })
    }

    /// Replace the loss engine; it should report into [`TrainingLoop::stats_hub`]
    pub fn set_loss(&mut self, loss: Box<dyn Loss>) {
        self.loss = loss;
    }

    /// Statistics hub shared with the loss engine
    pub fn stats_hub(&self) -> &Arc<StatsHub> {
        &self.stats
    }

    /// Training configuration
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Live generator
    pub fn generator(&self) -> &Arc<dyn Generator> {
        &self.g
    }

    /// Live discriminator
    pub fn discriminator(&self) -> &Arc<dyn Discriminator> {
        &self.d
    }

    /// Generator weight average
    pub fn generator_ema(&self) -> &dyn Generator {
        self.g_ema.as_ref()
    }

    /// Phase schedule
    pub fn phases(&self) -> &[TrainingPhase] {
        &self.phases
    }

    /// Current augmentation probability, 0 without a pipe
    pub fn augment_probability(&self) -> f64 {
        self.augment_pipe.as_ref().map_or(0.0, |p| p.probability())
    }

    /// Fresh counters for this run
    pub fn initial_state(&self) -> TrainingState {
        TrainingState::new(self.augment_probability())
    }

    /// Run until the image budget is exhausted or the abort predicate fires
    #[instrument(skip(self), fields(rank = self.group.rank()))]
    pub fn train(&mut self) -> Result<TrainingResult> {
        let total_nimg = self.config.total_nimg();
        let mut state = self.initial_state();
        state.status = TrainingStatus::Running;
        info!(total_kimg = self.config.run.total_kimg, "Training for {} kimg...", self.config.run.total_kimg);

        self.tick_start_time = Instant::now();
        self.callbacks.on_progress(0, total_nimg);

        while !state.is_finished() {
            self.run_iteration(&mut state)?;
            self.end_tick(&mut state)?;
        }

        let training_duration_secs = (Utc::now() - state.start_time).num_milliseconds() as f64 / 1000.0;
        info!(
            kimg = state.kimg(),
            ticks = state.cur_tick,
            status = ?state.status,
            "Exiting..."
        );

        Ok(TrainingResult {
            final_state: state,
            snapshots: self.written_snapshots.clone(),
            last_report: self.last_report.clone(),
            training_duration_secs,
        })
    }

    fn sample_round_inputs(&mut self) -> Result<Vec<Vec<RoundInputs>>> {
        let rounds = self.config.accumulation_rounds();
        let batch_gpu = self.config.batch_gpu();
        let z_dim = self.g.z_dim();
        let len = self.dataset.len();

        let mut all = Vec::with_capacity(self.phases.len());
        for _ in 0..self.phases.len() {
            let mut per_round = Vec::with_capacity(rounds);
            for _ in 0..rounds {
                let gen_z = sample::randn(&mut self.rng, &[batch_gpu, z_dim], &self.device)?;
                let indices: Vec<usize> = (0..batch_gpu).map(|_| self.rng.random_range(0..len)).collect();
                let gen_c = self.dataset.get_labels(&indices, &self.device)?;
                per_round.push(RoundInputs { gen_z, gen_c });
            }
            all.push(per_round);
        }
        Ok(all)
    }

    /// One full iteration: every due phase, then EMA, counters and ADA
    pub fn run_iteration(&mut self, state: &mut TrainingState) -> Result<()> {
        let rounds = self.config.accumulation_rounds();

        let mut real = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            let (img, c) = self.loader.next_batch()?;
            let img = img.to_dtype(DType::F32)?.affine(1.0 / 127.5, -1.0)?;
            real.push((img, c));
        }
        let gen_inputs = self.sample_round_inputs()?;

        let is_coordinator = self.group.is_coordinator();
        for (phase, inputs) in self.phases.iter_mut().zip(&gen_inputs) {
            if !phase.is_due(state.batch_idx) {
                continue;
            }
            let kind = phase.kind();
            let gain = phase.interval() as f64;

            let buffer = phase.buffer_mut();
            buffer.zero();
            buffer.enable();
            let mut loss_sum = 0.0;
            for (round, ((real_img, real_c), gen)) in real.iter().zip(inputs).enumerate() {
                let loss_state = LossState {
                    real_img,
                    real_c,
                    gen_z: &gen.gen_z,
                    gen_c: &gen.gen_c,
                    sync: is_coordinator && round + 1 == rounds,
                    gain,
                };
                loss_sum += self.loss.accumulate_gradients(kind, &loss_state, buffer)?;
                self.fence.enqueue();
            }
            buffer.disable();
            if is_coordinator && !buffer.is_empty() && !buffer.synced() {
                warn!(phase = %kind, "Final accumulation round was not marked for sync");
            }

            buffer.all_reduce(self.group.as_ref())?;
            if self.config.gradient_clipping.enabled {
                let norm = buffer.clip_global_norm(self.config.gradient_clipping.max_norm)?;
                if !norm.is_finite() {
                    warn!(phase = %kind, norm, "Non-finite gradient norm");
                }
            }
            phase.step()?;
            self.fence.enqueue();
            self.fence.flush()?;

            if kind.runs_main() {
                let mean = loss_sum / rounds as f64;
                match kind.role() {
                    ModuleRole::Generator => state.last_loss_g = Some(mean),
                    ModuleRole::Discriminator => state.last_loss_d = Some(mean),
                }
            }
        }

        let beta = ema_beta(
            self.config.batch.batch_size,
            self.config.ema.ema_kimg,
            self.config.ema.ema_rampup,
            state.cur_nimg,
        );
        self.ema.update(beta)?;

        state.cur_nimg += self.config.batch.batch_size as u64;
        state.batch_idx += 1;

        if let Some(ada) = &self.ada {
            if ada.is_due(state.batch_idx) {
                ada.update(self.group.as_ref())?;
            }
        }
        state.augment_p = self.augment_probability();

        if self.config.logging.log_iterations {
            debug!(
                batch_idx = state.batch_idx,
                cur_nimg = state.cur_nimg,
                loss_g = ?state.last_loss_g,
                loss_d = ?state.last_loss_d,
                "Iteration complete"
            );
        }
        Ok(())
    }

    /// Close the tick if due: abort poll, report, snapshot and progress
    ///
    /// Sets `state.status` to `Completed` or `Aborted` when training stops.
    pub fn end_tick(&mut self, state: &mut TrainingState) -> Result<()> {
        let total_nimg = self.config.total_nimg();
        let mut done = state.budget_exhausted(total_nimg);
        if !done && !state.tick_complete(self.config.run.kimg_per_tick) {
            return Ok(());
        }

        let local_abort = !done && self.callbacks.should_abort();
        let aborted = self.group.all_reduce_or(local_abort)? && !done;
        done |= aborted;

        let sec_per_tick = self.tick_start_time.elapsed().as_secs_f64();
        let tick_kimg = (state.cur_nimg - state.tick_start_nimg) as f64 / 1000.0;
        let report = TickReport {
            timestamp: Utc::now(),
            tick: state.cur_tick,
            kimg: state.kimg(),
            sec_per_tick,
            sec_per_kimg: if tick_kimg > 0.0 { sec_per_tick / tick_kimg } else { 0.0 },
            augment_p: state.augment_p,
            stats: TickReport::summarize(&self.tick_stats.drain()),
        };

        if self.group.is_coordinator() {
            info!(
                tick = report.tick,
                kimg = report.kimg,
                sec_per_tick = report.sec_per_tick,
                augment_p = report.augment_p,
                loss_g = report.mean("Loss/G/loss").unwrap_or(f64::NAN),
                loss_d = report.mean("Loss/D/loss").unwrap_or(f64::NAN),
                "tick"
            );
            if let Some(writer) = self.stats_writer.as_mut() {
                writer.write(&report)?;
            }
        }

        if let (Some(interval), Some(manager)) = (self.config.run.network_snapshot_ticks, &self.snapshots) {
            if done || state.cur_tick % interval == 0 {
                let path = manager.save(state, self.g.as_ref(), self.d.as_ref(), self.g_ema.as_ref())?;
                self.written_snapshots.push(path);
            }
        }

        self.callbacks.on_progress(state.cur_nimg, total_nimg);
        self.last_report = Some(report);

        state.advance_tick();
        self.tick_start_time = Instant::now();
        if done {
            state.status = if aborted {
                TrainingStatus::Aborted
            } else {
                TrainingStatus::Completed
            };
        }
        Ok(())
    }

    /// Save a snapshot of the current networks regardless of the tick cadence
    pub fn save_snapshot(&mut self, state: &TrainingState) -> Result<PathBuf> {
        let manager = match &self.snapshots {
            Some(manager) => manager.clone(),
            None => SnapshotManager::new(&self.config.run.run_dir)?,
        };
        let path = manager.save(state, self.g.as_ref(), self.d.as_ref(), self.g_ema.as_ref())?;
        self.written_snapshots.push(path.clone());
        Ok(path)
    }
}

fn check_geometry(dataset: &dyn Dataset, g: &dyn Generator, d: &dyn Discriminator) -> Result<()> {
    if dataset.is_empty() {
        return Err(Error::data("training set is empty"));
    }
    let expected = (dataset.num_channels(), dataset.resolution(), dataset.label_dim());
    for (what, actual) in [
        ("generator", (g.img_channels(), g.img_resolution(), g.c_dim())),
        ("discriminator", (d.img_channels(), d.img_resolution(), d.c_dim())),
    ] {
        if actual != expected {
            return Err(Error::shape_mismatch(
                format!("{what} (channels, resolution, c_dim)"),
                expected,
                actual,
            ));
        }
    }
    Ok(())
}
