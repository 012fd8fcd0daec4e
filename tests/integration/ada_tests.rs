//! Adaptive augmentation driven by a scripted discriminator statistic

use std::sync::Arc;

use adagan::training::{
    GradientBuffer, Loss, LossState, ModuleRole, PhaseKind, StatsHub, TrainingLoop,
};
use adagan::Result;
use approx::assert_relative_eq;
use candle_core::Device;

use super::fixtures::*;
use super::init_test_logging;

/// Reports a constant real-logit sign from every discriminator main pass
struct ScriptedSigns {
    stats: Arc<StatsHub>,
    sign: f64,
}

impl Loss for ScriptedSigns {
    fn accumulate_gradients(
        &mut self,
        phase: PhaseKind,
        state: &LossState<'_>,
        _grads: &mut GradientBuffer,
    ) -> Result<f64> {
        if phase.role() == ModuleRole::Discriminator && phase.runs_main() {
            let n = state.real_img.dim(0)?;
            self.stats.report_values("Loss/signs/real", &vec![self.sign; n]);
        }
        Ok(0.0)
    }
}

fn ada_trainer(sign: f64) -> Result<(TrainingLoop, tempfile::TempDir)> {
    let dir = create_test_dir();
    let mut config = test_config(dir.path());
    config.run.total_kimg = 1.0;
    config.augment.enabled = true;
    config.augment.augment_p = 0.0;
    config.augment.ada_target = Some(0.6);
    config.augment.ada_interval = 4;
    config.augment.ada_kimg = 500.0;

    let mut trainer = TrainingLoop::single(config, stub_dataset(), &Device::Cpu)?;
    let stats = trainer.stats_hub().clone();
    trainer.set_loss(Box::new(ScriptedSigns { stats, sign }));
    Ok((trainer, dir))
}

#[test]
fn test_probability_rises_once_per_interval() -> Result<()> {
    init_test_logging();
    let (mut trainer, _dir) = ada_trainer(0.8)?;
    let mut state = trainer.initial_state();
    let step = 4.0 * 4.0 / 500_000.0;

    let mut history = Vec::new();
    for _ in 0..8 {
        trainer.run_iteration(&mut state)?;
        history.push(trainer.augment_probability());
    }

    for p in &history[..3] {
        assert_eq!(*p, 0.0);
    }
    for p in &history[3..7] {
        assert_relative_eq!(*p, step);
    }
    assert_relative_eq!(history[7], 2.0 * step);
    assert_relative_eq!(state.augment_p, 2.0 * step);
    Ok(())
}

#[test]
fn test_probability_never_negative() -> Result<()> {
    init_test_logging();
    let (mut trainer, _dir) = ada_trainer(0.2)?;
    let mut state = trainer.initial_state();

    for _ in 0..8 {
        trainer.run_iteration(&mut state)?;
        assert_eq!(trainer.augment_probability(), 0.0);
    }
    Ok(())
}
