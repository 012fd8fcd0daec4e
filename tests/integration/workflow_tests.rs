//! Full training workflows: budget, resume and configuration round trips

use std::sync::Arc;

use adagan::training::{
    Dataset, GradientBuffer, Loss, LossState, PhaseKind, Snapshot, StyleGAN2Loss,
    StyleGAN2LossConfig, TrainingConfig, TrainingLoop, TrainingStatus,
};
use adagan::utils::sample;
use adagan::{DiffAugment, Discriminator, Generator, Network, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::fixtures::*;
use super::init_test_logging;

#[test]
fn test_full_budget_runs_exact_iterations() -> Result<()> {
    init_test_logging();
    let dir = create_test_dir();
    let mut config = test_config(dir.path());
    config.run.total_kimg = 1.0;

    let mut trainer = TrainingLoop::single(config, stub_dataset(), &Device::Cpu)?;
    let result = trainer.train()?;

    assert!(result.completed());
    assert_eq!(result.final_state.status, TrainingStatus::Completed);
    assert_eq!(result.final_state.batch_idx, 250);
    assert_eq!(result.final_state.cur_nimg, 1000);
    assert!(result.final_state.last_loss_d.unwrap().is_finite());
    Ok(())
}

#[test]
fn test_run_directory_outputs() -> Result<()> {
    init_test_logging();
    let dir = create_test_dir();
    let mut config = test_config(dir.path());
    config.run.network_snapshot_ticks = Some(1);
    config.logging.stats_jsonl = true;

    let mut trainer = TrainingLoop::single(config, stub_dataset(), &Device::Cpu)?;
    let result = trainer.train()?;

    assert!(!result.snapshots.is_empty());
    assert!(result.snapshots.iter().all(|p| p.exists()));
    assert!(dir.path().join("stats.jsonl").exists());
    let report = result.last_report.unwrap();
    assert!(report.mean("Loss/D/loss").is_some());
    assert!(report.kimg > 0.0);
    Ok(())
}

fn g_gradients(g: Arc<dyn Generator>, d: Arc<dyn Discriminator>, dataset: &dyn Dataset) -> Result<Vec<Vec<f32>>> {
    let mut rng = StdRng::seed_from_u64(5);
    let (real_img, real_c) = dataset.get_batch(&[0, 1, 2, 3])?;
    let real_img = real_img.to_dtype(DType::F32)?.affine(1.0 / 127.5, -1.0)?;
    let gen_z = sample::randn(&mut rng, &[4, g.z_dim()], &Device::Cpu)?;
    let gen_c = real_c.clone();

    let mut buffer = GradientBuffer::new(g.named_parameters());
    buffer.enable();
    let mut loss = StyleGAN2Loss::new(
        g,
        d,
        DiffAugment::parse("")?,
        None,
        StyleGAN2LossConfig {
            style_mixing_prob: 0.9,
            r1_gamma: 0.0,
            pl_batch_shrink: 2,
            pl_decay: 0.01,
            pl_weight: 0.0,
            seed: 9,
        },
        Arc::new(Default::default()),
    );
    let state = LossState {
        real_img: &real_img,
        real_c: &real_c,
        gen_z: &gen_z,
        gen_c: &gen_c,
        sync: true,
        gain: 1.0,
    };
    loss.accumulate_gradients(PhaseKind::Gmain, &state, &mut buffer)?;

    buffer
        .iter()
        .map(|(_, g)| Ok(g.flatten_all()?.to_vec1::<f32>()?))
        .collect()
}

#[test]
fn test_resume_restores_networks_exactly() -> Result<()> {
    init_test_logging();
    let dir = create_test_dir();
    let dataset = stub_dataset();
    let config = test_config(dir.path());

    let mut first = TrainingLoop::single(config.clone(), dataset.clone(), &Device::Cpu)?;
    let mut state = first.initial_state();
    for _ in 0..3 {
        first.run_iteration(&mut state)?;
    }
    let path = first.save_snapshot(&state)?;

    let fresh = TrainingLoop::single(config.clone(), dataset.clone(), &Device::Cpu)?;
    assert_ne!(
        network_values(fresh.generator().as_ref()),
        network_values(first.generator().as_ref())
    );

    let mut resumed_config = config;
    resumed_config.run.resume_from = Some(path.clone());
    let resumed = TrainingLoop::single(resumed_config, dataset.clone(), &Device::Cpu)?;

    assert_eq!(
        network_values(resumed.generator().as_ref()),
        network_values(first.generator().as_ref())
    );
    assert_eq!(
        network_values(resumed.discriminator().as_ref()),
        network_values(first.discriminator().as_ref())
    );
    assert_eq!(
        network_values(resumed.generator_ema()),
        network_values(first.generator_ema())
    );

    let original = g_gradients(first.generator().clone(), first.discriminator().clone(), dataset.as_ref())?;
    let restored = g_gradients(resumed.generator().clone(), resumed.discriminator().clone(), dataset.as_ref())?;
    assert!(!original.is_empty());
    assert_eq!(original, restored);

    let snapshot = Snapshot::load(&path, &Device::Cpu)?;
    assert_eq!(snapshot.state().unwrap().cur_nimg, 12);
    Ok(())
}

#[test]
fn test_config_file_round_trip() -> Result<()> {
    let dir = create_test_dir();
    let mut config = test_config(dir.path());
    config.augment.enabled = true;
    config.augment.ada_target = Some(0.6);
    config.regularization.d_reg_interval = Some(16);

    for name in ["train.yaml", "train.json"] {
        let path = dir.path().join(name);
        config.to_file(&path)?;
        let loaded = TrainingConfig::from_file(&path)?;
        assert_eq!(loaded.augment.ada_target, Some(0.6));
        assert_eq!(loaded.regularization.d_reg_interval, Some(16));
        assert_eq!(loaded.network.num_ws, 2);
        assert_eq!(loaded.run.run_dir, config.run.run_dir);
    }
    Ok(())
}

#[test]
fn test_unlabeled_dataset_trains() -> Result<()> {
    let dir = create_test_dir();
    let dataset = Arc::new(adagan::training::TensorDataset::new(
        Tensor::zeros((8, 1, 4, 4), DType::U8, &Device::Cpu)?,
        None,
    )?);
    let mut trainer = TrainingLoop::single(test_config(dir.path()), dataset, &Device::Cpu)?;

    assert_eq!(trainer.generator().c_dim(), 0);
    let result = trainer.train()?;
    assert!(result.completed());
    Ok(())
}
