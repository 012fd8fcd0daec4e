//! Tests for the StyleGAN2 loss engine against the reference networks

use approx::assert_relative_eq;
use candle_core::Tensor;

use super::fixtures::{buffer_values, plain_loss_config, LossFixture};
use crate::error::Error;
use crate::training::loss::{Loss, LossState, StyleGAN2LossConfig};
use crate::training::phase::PhaseKind;

fn state<'a>(f: &'a LossFixture, gain: f64) -> LossState<'a> {
    LossState {
        real_img: &f.real_img,
        real_c: &f.real_c,
        gen_z: &f.gen_z,
        gen_c: &f.gen_c,
        sync: true,
        gain,
    }
}

fn count(f: &LossFixture, name: &str) -> f64 {
    f.collector.get(name).map_or(0.0, |m| m.count)
}

#[test]
fn test_gmain_updates_generator() {
    let f = LossFixture::new();
    let mut loss = f.loss(plain_loss_config());
    let mut g_buf = f.g_buffer();

    let value = loss
        .accumulate_gradients(PhaseKind::Gmain, &state(&f, 1.0), &mut g_buf)
        .unwrap();

    assert!(value.is_finite() && value > 0.0);
    assert!(g_buf.synced());
    for (name, _) in g_buf.named_vars() {
        assert!(g_buf.grad_by_name(name).is_some(), "no gradient for {name}");
    }
    assert_eq!(count(&f, "Loss/G/loss"), 4.0);
    assert_eq!(count(&f, "Loss/signs/fake"), 4.0);
    assert_eq!(count(&f, "Loss/signs/real"), 0.0);
}

#[test]
fn test_dmain_leaves_generator_untouched() {
    let f = LossFixture::new();
    let mut loss = f.loss(plain_loss_config());

    let mut g_buf = f.g_buffer();
    let value = loss
        .accumulate_gradients(PhaseKind::Dmain, &state(&f, 1.0), &mut g_buf)
        .unwrap();
    assert!(value.is_finite());
    assert!(g_buf.is_empty());

    let mut d_buf = f.d_buffer();
    loss.accumulate_gradients(PhaseKind::Dmain, &state(&f, 1.0), &mut d_buf)
        .unwrap();
    assert!(!d_buf.is_empty());
    assert!(count(&f, "Loss/D/loss") > 0.0);
    assert!(count(&f, "Loss/signs/real") > 0.0);
}

#[test]
fn test_dreg_without_r1_is_a_no_op() {
    let f = LossFixture::new();
    let mut loss = f.loss(plain_loss_config());
    let mut d_buf = f.d_buffer();

    let value = loss
        .accumulate_gradients(PhaseKind::Dreg, &state(&f, 16.0), &mut d_buf)
        .unwrap();

    assert_eq!(value, 0.0);
    assert!(d_buf.is_empty());
    assert_eq!(count(&f, "Loss/signs/real"), 0.0);
}

#[test]
fn test_dboth_without_r1_matches_dmain() {
    let f = LossFixture::new();

    let mut main_loss = f.loss(plain_loss_config());
    let mut main_buf = f.d_buffer();
    let main_value = main_loss
        .accumulate_gradients(PhaseKind::Dmain, &state(&f, 1.0), &mut main_buf)
        .unwrap();

    let mut both_loss = f.loss(plain_loss_config());
    let mut both_buf = f.d_buffer();
    let both_value = both_loss
        .accumulate_gradients(PhaseKind::Dboth, &state(&f, 1.0), &mut both_buf)
        .unwrap();

    assert_eq!(main_value, both_value);
    assert_eq!(buffer_values(&main_buf).unwrap(), buffer_values(&both_buf).unwrap());
}

fn r1_round(f: &LossFixture, r1_gamma: f64) -> crate::error::Result<f64> {
    let mut loss = f.loss(StyleGAN2LossConfig {
        r1_gamma,
        ..plain_loss_config()
    });
    let mut d_buf = f.d_buffer();
    let value = loss.accumulate_gradients(PhaseKind::Dreg, &state(f, 1.0), &mut d_buf)?;
    assert_eq!(value, 0.0);
    d_buf.global_norm()
}

#[test]
fn test_dreg_applies_r1() {
    let f = LossFixture::new();
    let norm = r1_round(&f, 10.0).unwrap();
    let doubled = r1_round(&f, 20.0).unwrap();

    // Only the penalty reaches D, so its gradient is linear in gamma
    assert!(norm > 1e-6, "R1 contributed no gradient");
    assert_relative_eq!(doubled, 2.0 * norm, max_relative = 1e-4);

    assert_eq!(count(&f, "Loss/r1_penalty"), 8.0);
    assert_eq!(count(&f, "Loss/D/reg"), 8.0);
    assert_eq!(count(&f, "Loss/D/loss"), 0.0);
    let penalty = f.collector.get("Loss/r1_penalty").unwrap();
    assert!(penalty.mean().unwrap() > 0.0);
}

#[test]
fn test_r1_after_earlier_backward_never_silently_vanishes() {
    let f = LossFixture::new();
    // A backward pass before any R1 loss exists on this thread
    let mut plain = f.loss(plain_loss_config());
    plain
        .accumulate_gradients(PhaseKind::Dmain, &state(&f, 1.0), &mut f.d_buffer())
        .unwrap();

    match r1_round(&f, 10.0) {
        Ok(norm) => assert!(norm > 1e-6, "R1 contributed no gradient"),
        Err(err) => assert!(matches!(err, Error::Internal(_)), "{err}"),
    }
}

#[test]
fn test_gain_scales_gradients() {
    let f = LossFixture::new();

    let mut unit = f.loss(plain_loss_config());
    let mut unit_buf = f.d_buffer();
    unit.accumulate_gradients(PhaseKind::Dmain, &state(&f, 1.0), &mut unit_buf)
        .unwrap();

    let mut doubled = f.loss(plain_loss_config());
    let mut doubled_buf = f.d_buffer();
    doubled
        .accumulate_gradients(PhaseKind::Dmain, &state(&f, 2.0), &mut doubled_buf)
        .unwrap();

    let unit = buffer_values(&unit_buf).unwrap();
    let doubled = buffer_values(&doubled_buf).unwrap();
    assert_eq!(unit.len(), doubled.len());
    for ((name, a), (_, b)) in unit.iter().zip(&doubled) {
        for (x, y) in a.iter().zip(b) {
            assert_relative_eq!(2.0 * x, *y, epsilon = 1e-6, max_relative = 1e-5);
        }
        assert!(!a.is_empty(), "{name}");
    }
}

#[test]
fn test_greg_without_pl_is_a_no_op() {
    let f = LossFixture::new();
    let mut loss = f.loss(plain_loss_config());
    let mut g_buf = f.g_buffer();

    let value = loss
        .accumulate_gradients(PhaseKind::Greg, &state(&f, 4.0), &mut g_buf)
        .unwrap();

    assert_eq!(value, 0.0);
    assert!(g_buf.is_empty());
}

#[test]
fn test_greg_path_length() {
    let f = LossFixture::new();
    let mut loss = f.loss(StyleGAN2LossConfig {
        pl_weight: 2.0,
        ..plain_loss_config()
    });
    let mut g_buf = f.g_buffer();

    loss.accumulate_gradients(PhaseKind::Greg, &state(&f, 4.0), &mut g_buf)
        .unwrap();

    assert!(!g_buf.is_empty());
    assert!(loss.pl_mean() > 0.0);
    // Batch 4 shrunk by 2
    assert_eq!(count(&f, "Loss/pl_penalty"), 2.0);
    assert_eq!(count(&f, "Loss/G/loss"), 0.0);
}

#[test]
fn test_gboth_runs_main_and_path_length() {
    let f = LossFixture::new();
    let mut loss = f.loss(StyleGAN2LossConfig {
        pl_weight: 2.0,
        ..plain_loss_config()
    });
    let mut g_buf = f.g_buffer();

    let value = loss
        .accumulate_gradients(PhaseKind::Gboth, &state(&f, 1.0), &mut g_buf)
        .unwrap();

    assert!(value > 0.0);
    assert_eq!(count(&f, "Loss/G/loss"), 4.0);
    assert_eq!(count(&f, "Loss/pl_penalty"), 2.0);
}

#[test]
fn test_shape_mismatch_is_rejected() {
    let f = LossFixture::new();
    let mut loss = f.loss(plain_loss_config());
    let mut g_buf = f.g_buffer();

    let bad_z = Tensor::zeros((4, 5), candle_core::DType::F32, &candle_core::Device::Cpu).unwrap();
    let bad = LossState {
        gen_z: &bad_z,
        ..state(&f, 1.0)
    };
    let err = loss
        .accumulate_gradients(PhaseKind::Gmain, &bad, &mut g_buf)
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { ref what, .. } if what == "gen_z"));
    assert!(err.is_configuration());
    assert!(g_buf.is_empty());

    let small = f.real_img.narrow(2, 0, 2).unwrap();
    let bad = LossState {
        real_img: &small,
        ..state(&f, 1.0)
    };
    let err = loss
        .accumulate_gradients(PhaseKind::Dmain, &bad, &mut f.d_buffer())
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { ref what, .. } if what == "real_img"));
}

#[test]
fn test_style_mixing() {
    let f = LossFixture::new();
    let ws = f.g.mapping(&f.gen_z, &f.gen_c, true).unwrap();

    let mut never = f.loss(plain_loss_config());
    let unchanged = never.mix_styles(ws.clone(), &f.gen_z, &f.gen_c).unwrap();
    assert_eq!(
        unchanged.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
        ws.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    );

    let mut always = f.loss(StyleGAN2LossConfig {
        style_mixing_prob: 1.0,
        ..plain_loss_config()
    });
    let mixed = always.mix_styles(ws.clone(), &f.gen_z, &f.gen_c).unwrap();
    assert_eq!(mixed.dims(), ws.dims());

    let slot = |t: &Tensor, i: usize| t.narrow(1, i, 1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    // The cutoff is at least 1 and at most num_ws - 1
    assert_eq!(slot(&mixed, 0), slot(&ws, 0));
    assert_ne!(slot(&mixed, 2), slot(&ws, 2));
}
