//! Shared configurations and helpers for integration tests

use std::path::Path;
use std::sync::Arc;

use adagan::training::{NetworkConfig, TensorDataset, TrainingConfig};
use adagan::Network;
use candle_core::Device;
use tempfile::TempDir;

/// Create a temporary run directory
pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Fast configuration: tiny networks, no snapshots, no stats file
pub fn test_config(run_dir: &Path) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.run.run_dir = run_dir.to_path_buf();
    config.run.total_kimg = 0.02;
    config.run.kimg_per_tick = 1.0;
    config.run.network_snapshot_ticks = None;
    config.batch.batch_size = 4;
    config.ema.ema_kimg = 0.01;
    config.loss.diffaugment = String::new();
    config.network = NetworkConfig {
        z_dim: 8,
        w_dim: 8,
        num_ws: 2,
        mapping_layers: 1,
        hidden_dim: 8,
        discriminator_layers: 1,
        w_avg_beta: 0.995,
    };
    config.logging.stats_jsonl = false;
    config
}

/// Stub dataset: 8 samples, 2 classes, 3x4x4 images
pub fn stub_dataset() -> Arc<TensorDataset> {
    Arc::new(
        TensorDataset::synthetic(8, 3, 4, 2, 42, &Device::Cpu).expect("Failed to build dataset"),
    )
}

/// Flattened parameter and buffer values of a network, by name
pub fn network_values<N: Network + ?Sized>(net: &N) -> Vec<(String, Vec<f32>)> {
    net.named_parameters()
        .into_iter()
        .chain(net.named_buffers())
        .map(|(name, var)| {
            let values = var
                .as_tensor()
                .flatten_all()
                .and_then(|t| t.to_vec1::<f32>())
                .expect("Failed to read tensor");
            (name, values)
        })
        .collect()
}
