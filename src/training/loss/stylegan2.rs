//! StyleGAN2 non-saturating loss with R1 and path length regularization

use std::sync::Arc;

use candle_core::{DType, Tensor, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, instrument};

use super::{Loss, LossState};
use crate::augment::{AugmentPipe, DiffAugment};
use crate::error::{Error, Result};
use crate::networks::{check_dims, Discriminator, Generator};
use crate::training::config::LossConfig;
use crate::training::gradients::GradientBuffer;
use crate::training::metrics::StatsHub;
use crate::training::phase::{ModuleRole, PhaseKind};
use crate::utils::math::softplus;
use crate::utils::sample;

/// Environment switch that keeps candle gradients differentiable
const GRAD_DO_NOT_DETACH: &str = "CANDLE_GRAD_DO_NOT_DETACH";

/// Loss hyperparameters
#[derive(Debug, Clone)]
pub struct StyleGAN2LossConfig {
    /// Probability of style mixing
    pub style_mixing_prob: f64,
    /// R1 weight
    pub r1_gamma: f64,
    /// Batch shrink of the path length pass
    pub pl_batch_shrink: usize,
    /// Running path length mean decay
    pub pl_decay: f64,
    /// Path length weight
    pub pl_weight: f64,
    /// Seed of the loss random stream
    pub seed: u64,
}

impl StyleGAN2LossConfig {
    /// Build from the loss section
    pub fn from_config(config: &LossConfig, seed: u64) -> Self {
        Self {
            style_mixing_prob: config.style_mixing_prob,
            r1_gamma: config.r1_gamma,
            pl_batch_shrink: config.pl_batch_shrink,
            pl_decay: config.pl_decay,
            pl_weight: config.pl_weight,
            seed,
        }
    }
}

/// StyleGAN2 loss engine
pub struct StyleGAN2Loss {
    g: Arc<dyn Generator>,
    d: Arc<dyn Discriminator>,
    diffaugment: DiffAugment,
    augment_pipe: Option<Arc<dyn AugmentPipe>>,
    config: StyleGAN2LossConfig,
    pl_mean: f64,
    rng: StdRng,
    stats: Arc<StatsHub>,
}

impl StyleGAN2Loss {
    /// Create the loss engine
    pub fn new(
        g: Arc<dyn Generator>,
        d: Arc<dyn Discriminator>,
        diffaugment: DiffAugment,
        augment_pipe: Option<Arc<dyn AugmentPipe>>,
        config: StyleGAN2LossConfig,
        stats: Arc<StatsHub>,
    ) -> Self {
        // R1 and path length differentiate through gradients
        if config.r1_gamma != 0.0 || config.pl_weight != 0.0 {
            std::env::set_var(GRAD_DO_NOT_DETACH, "1");
        }
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            g,
            d,
            diffaugment,
            augment_pipe,
            config,
            pl_mean: 0.0,
            rng,
            stats,
        }
    }

    /// Running path length mean
    pub fn pl_mean(&self) -> f64 {
        self.pl_mean
    }

    /// Splice styles from a second latent after a random cutoff
    ///
    /// With probability `1 - style_mixing_prob` the styles pass through
    /// unchanged.
    pub fn mix_styles(&mut self, ws: Tensor, z: &Tensor, c: &Tensor) -> Result<Tensor> {
        let num_ws = ws.dim(1)?;
        if self.config.style_mixing_prob <= 0.0 || num_ws < 2 {
            return Ok(ws);
        }
        let cutoff = self.rng.random_range(1..num_ws);
        if self.rng.random::<f64>() >= self.config.style_mixing_prob {
            return Ok(ws);
        }
        let z2 = sample::randn(&mut self.rng, z.dims(), z.device())?;
        let ws2 = self.g.mapping(&z2, c, true)?;
        Ok(Tensor::cat(
            &[ws.narrow(1, 0, cutoff)?, ws2.narrow(1, cutoff, num_ws - cutoff)?],
            1,
        )?)
    }

    fn run_g(&mut self, z: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let ws = self.g.mapping(z, c, false)?;
        let ws = self.mix_styles(ws, z, c)?;
        let img = self.g.synthesis(&ws)?;
        Ok((img, ws))
    }

    fn run_d(&self, img: &Tensor, c: &Tensor) -> Result<Tensor> {
        let mut img = img.clone();
        if !self.diffaugment.is_empty() {
            img = self.diffaugment.apply(&img)?;
        }
        if let Some(pipe) = &self.augment_pipe {
            img = pipe.augment(&img)?;
        }
        self.d.forward(&img, c)
    }

    fn check_inputs(&self, state: &LossState<'_>) -> Result<()> {
        let n = state.real_img.dim(0)?;
        let res = self.d.img_resolution();
        check_dims("real_img", state.real_img, &[n, self.d.img_channels(), res, res])?;
        check_dims("real_c", state.real_c, &[n, self.d.c_dim()])?;
        let m = state.gen_z.dim(0)?;
        check_dims("gen_z", state.gen_z, &[m, self.g.z_dim()])?;
        check_dims("gen_c", state.gen_c, &[m, self.g.c_dim()])?;
        Ok(())
    }

    fn report_logits(&self, kind: &str, logits: &Tensor) -> Result<()> {
        self.stats.report(&format!("Loss/scores/{kind}"), logits)?;
        self.stats.report(&format!("Loss/signs/{kind}"), &logits.sign()?)?;
        Ok(())
    }

    fn generator_main(&mut self, state: &LossState<'_>, grads: &mut GradientBuffer) -> Result<f64> {
        let (gen_img, _gen_ws) = self.run_g(state.gen_z, state.gen_c)?;
        let gen_logits = self.run_d(&gen_img, state.gen_c)?;
        self.report_logits("fake", &gen_logits)?;

        let loss = softplus(&gen_logits.neg()?)?;
        self.stats.report("Loss/G/loss", &loss)?;

        let loss_mean = loss.mean_all()?;
        let store = loss_mean.affine(state.gain, 0.0)?.backward()?;
        grads.accumulate(&store, state.sync)?;
        scalar(&loss_mean)
    }

    fn generator_pl(&mut self, state: &LossState<'_>, grads: &mut GradientBuffer) -> Result<()> {
        let n = state.gen_z.dim(0)?;
        let batch = (n / self.config.pl_batch_shrink).max(1);
        let z = state.gen_z.narrow(0, 0, batch)?;
        let c = state.gen_c.narrow(0, 0, batch)?;

        let ws = self.g.mapping(&z, &c, false)?;
        let ws = self.mix_styles(ws, &z, &c)?;
        let ws = Var::from_tensor(&ws.detach())?;
        let img = self.g.synthesis(ws.as_tensor())?;

        let (_, _, h, w) = img.dims4()?;
        let pl_noise = sample::randn(&mut self.rng, img.dims(), img.device())?
            .affine(1.0 / ((h * w) as f64).sqrt(), 0.0)?;
        let pl_store = img.mul(&pl_noise)?.sum_all()?.backward()?;
        let pl_grads = pl_store
            .get(ws.as_tensor())
            .ok_or_else(|| Error::internal("path length gradient w.r.t. ws is missing"))?;
        require_graph(pl_grads, "path length")?;

        let pl_lengths = pl_grads.sqr()?.sum(2)?.mean(1)?.sqrt()?;
        let batch_mean = scalar(&pl_lengths.mean_all()?)?;
        self.pl_mean += (batch_mean - self.pl_mean) * self.config.pl_decay;

        let pl_penalty = pl_lengths.affine(1.0, -self.pl_mean)?.sqr()?;
        self.stats.report("Loss/pl_penalty", &pl_penalty)?;
        let loss_gpl = pl_penalty.affine(self.config.pl_weight, 0.0)?;
        self.stats.report("Loss/G/reg", &loss_gpl)?;

        let anchor = img
            .narrow(1, 0, 1)?
            .narrow(2, 0, 1)?
            .narrow(3, 0, 1)?
            .flatten_all()?
            .affine(0.0, 0.0)?;
        let total = anchor.add(&loss_gpl)?.mean_all()?.affine(state.gain, 0.0)?;
        let store = total.backward()?;
        grads.accumulate(&store, state.sync)?;
        Ok(())
    }

    fn discriminator(
        &mut self,
        phase: PhaseKind,
        state: &LossState<'_>,
        grads: &mut GradientBuffer,
    ) -> Result<f64> {
        let do_main = phase.runs_main();
        let do_r1 = phase.runs_reg() && self.config.r1_gamma != 0.0;

        // Dmain: minimize logits for generated images
        let mut loss_dgen = 0.0;
        if do_main {
            let (gen_img, _gen_ws) = self.run_g(state.gen_z, state.gen_c)?;
            let gen_logits = self.run_d(&gen_img.detach(), state.gen_c)?;
            self.report_logits("fake", &gen_logits)?;

            let loss = softplus(&gen_logits)?.mean_all()?;
            let store = loss.affine(state.gain, 0.0)?.backward()?;
            grads.accumulate(&store, false)?;
            loss_dgen = scalar(&loss)?;
        }

        if !(do_main || do_r1) {
            return Ok(0.0);
        }

        // Dmain: maximize logits for real images. Dr1: R1 regularization
        let real_leaf = if do_r1 {
            Some(Var::from_tensor(&state.real_img.detach())?)
        } else {
            None
        };
        let real_img = match &real_leaf {
            Some(v) => v.as_tensor().clone(),
            None => state.real_img.detach(),
        };
        let real_logits = self.run_d(&real_img, state.real_c)?;
        self.report_logits("real", &real_logits)?;

        let mut total = real_logits.affine(0.0, 0.0)?;
        let mut loss_dreal = 0.0;
        if do_main {
            let loss = softplus(&real_logits.neg()?)?;
            loss_dreal = scalar(&loss.mean_all()?)?;
            self.stats.report_values("Loss/D/loss", &[loss_dgen + loss_dreal]);
            total = total.add(&loss)?;
        }

        if let Some(leaf) = &real_leaf {
            let r1_store = real_logits.sum_all()?.backward()?;
            let r1_grads = r1_store
                .get(leaf.as_tensor())
                .ok_or_else(|| Error::internal("R1 gradient w.r.t. real images is missing"))?;
            require_graph(r1_grads, "R1")?;
            let r1_penalty = r1_grads.sqr()?.flatten_from(1)?.sum(1)?;
            self.stats.report("Loss/r1_penalty", &r1_penalty)?;
            let loss_dr1 = r1_penalty.affine(self.config.r1_gamma / 2.0, 0.0)?;
            self.stats.report("Loss/D/reg", &loss_dr1)?;
            total = total.add(&loss_dr1)?;
        }

        let store = total.mean_all()?.affine(state.gain, 0.0)?.backward()?;
        grads.accumulate(&store, state.sync)?;

        Ok(if do_main { loss_dreal } else { 0.0 })
    }
}

impl Loss for StyleGAN2Loss {
    #[instrument(level = "trace", skip_all, fields(phase = %phase))]
    fn accumulate_gradients(
        &mut self,
        phase: PhaseKind,
        state: &LossState<'_>,
        grads: &mut GradientBuffer,
    ) -> Result<f64> {
        self.check_inputs(state)?;

        let loss = match phase.role() {
            ModuleRole::Generator => {
                let mut loss = 0.0;
                if phase.runs_main() {
                    loss = self.generator_main(state, grads)?;
                }
                if phase.runs_reg() && self.config.pl_weight != 0.0 {
                    self.generator_pl(state, grads)?;
                }
                loss
            }
            ModuleRole::Discriminator => self.discriminator(phase, state, grads)?,
        };

        debug!(phase = %phase, loss, "Accumulated gradients");
        Ok(loss)
    }
}

/// Fail when a first-order gradient came back detached
///
/// candle reads the detach switch once per thread, on its first backward
/// pass. A thread that ran backward before this loss was created returns
/// constant gradients and the penalty would silently contribute nothing.
fn require_graph(grads: &Tensor, penalty: &str) -> Result<()> {
    if grads.track_op() {
        return Ok(());
    }
    Err(Error::internal(format!(
        "{penalty} gradients are detached: {GRAD_DO_NOT_DETACH} was not set before the first \
         backward pass on this thread; create the loss before any backward pass"
    )))
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
