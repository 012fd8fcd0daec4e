//! Network snapshots
//!
//! A snapshot is one safetensors file holding every parameter and buffer of
//! the generator (`G.*`), discriminator (`D.*`) and generator EMA
//! (`G_ema.*`), plus a JSON sidecar with the [`TrainingState`] at save time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use tracing::{info, warn};

use super::state::TrainingState;
use crate::error::{Error, Result};
use crate::networks::{Discriminator, Generator, Network};

/// Tensor name prefix of the generator
pub const G_PREFIX: &str = "G";
/// Tensor name prefix of the discriminator
pub const D_PREFIX: &str = "D";
/// Tensor name prefix of the generator EMA
pub const G_EMA_PREFIX: &str = "G_ema";

/// Writes snapshots into a run directory
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    run_dir: PathBuf,
}

impl SnapshotManager {
    /// Create the manager, creating the run directory if needed
    pub fn new<P: AsRef<Path>>(run_dir: P) -> Result<Self> {
        let run_dir = run_dir.as_ref().to_path_buf();
        crate::utils::io::ensure_dir_exists(&run_dir)?;
        Ok(Self { run_dir })
    }

    /// Run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Snapshot file for a given image count
    pub fn snapshot_path(&self, cur_nimg: u64) -> PathBuf {
        self.run_dir
            .join(format!("network-snapshot-{:06}.safetensors", cur_nimg / 1000))
    }

    /// Save all three networks and the training state
    pub fn save(
        &self,
        state: &TrainingState,
        g: &dyn Generator,
        d: &dyn Discriminator,
        g_ema: &dyn Generator,
    ) -> Result<PathBuf> {
        let mut tensors = HashMap::new();
        insert_all(&mut tensors, G_PREFIX, g)?;
        insert_all(&mut tensors, D_PREFIX, d)?;
        insert_all(&mut tensors, G_EMA_PREFIX, g_ema)?;

        let path = self.snapshot_path(state.cur_nimg);
        candle_core::safetensors::save(&tensors, &path)
            .map_err(|e| Error::checkpoint(format!("failed to write {}: {e}", path.display())))?;
        std::fs::write(sidecar_path(&path), serde_json::to_string_pretty(state)?)?;

        info!(path = %path.display(), tensors = tensors.len(), "Saved network snapshot");
        Ok(path)
    }
}

fn insert_all<N: Network + ?Sized>(
    tensors: &mut HashMap<String, Tensor>,
    prefix: &str,
    net: &N,
) -> Result<()> {
    for (name, var) in net.named_parameters().into_iter().chain(net.named_buffers()) {
        tensors.insert(format!("{prefix}.{name}"), var.as_tensor().detach().copy()?);
    }
    Ok(())
}

/// JSON sidecar next to a snapshot file
pub fn sidecar_path(snapshot: &Path) -> PathBuf {
    snapshot.with_extension("json")
}

/// A loaded snapshot
pub struct Snapshot {
    tensors: HashMap<String, Tensor>,
    state: Option<TrainingState>,
}

impl Snapshot {
    /// Load a snapshot and, when present, its state sidecar
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::checkpoint(format!("snapshot {} does not exist", path.display())));
        }
        let tensors = candle_core::safetensors::load(path, device)
            .map_err(|e| Error::checkpoint(format!("failed to read {}: {e}", path.display())))?;

        let sidecar = sidecar_path(path);
        let state = if sidecar.exists() {
            Some(serde_json::from_str(&std::fs::read_to_string(&sidecar)?)?)
        } else {
            None
        };
        Ok(Self { tensors, state })
    }

    /// Training state saved with the snapshot
    pub fn state(&self) -> Option<&TrainingState> {
        self.state.as_ref()
    }

    /// Tensor by full name
    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Number of stored tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the snapshot holds no tensors
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Copy `prefix.*` tensors into the matching parameters and buffers of `dst`
    ///
    /// Returns the names of entries of `dst` not found in the snapshot. With
    /// `require_all` any missing entry is an error.
    pub fn copy_params_and_buffers<N: Network + ?Sized>(
        &self,
        prefix: &str,
        dst: &N,
        require_all: bool,
    ) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for (name, var) in dst.named_parameters().into_iter().chain(dst.named_buffers()) {
            match self.tensors.get(&format!("{prefix}.{name}")) {
                Some(t) => {
                    if t.dims() != var.as_tensor().dims() {
                        return Err(Error::shape_mismatch(
                            format!("{prefix}.{name}"),
                            var.as_tensor().dims(),
                            t.dims(),
                        ));
                    }
                    var.set(&t.to_dtype(var.as_tensor().dtype())?)?;
                }
                None => missing.push(name),
            }
        }
        if !missing.is_empty() {
            if require_all {
                return Err(Error::checkpoint(format!(
                    "snapshot is missing {prefix} tensors: {missing:?}"
                )));
            }
            warn!(module = prefix, ?missing, "Snapshot is missing tensors");
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::mlp::{MlpDiscriminator, MlpDiscriminatorConfig, MlpGenerator, MlpGeneratorConfig};
    use tempfile::TempDir;

    fn g(seed: u64) -> MlpGenerator {
        MlpGenerator::new(
            MlpGeneratorConfig {
                z_dim: 4,
                c_dim: 0,
                w_dim: 4,
                num_ws: 2,
                mapping_layers: 1,
                hidden_dim: 8,
                img_channels: 1,
                img_resolution: 2,
                w_avg_beta: 0.995,
                seed,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    fn d(seed: u64) -> MlpDiscriminator {
        MlpDiscriminator::new(
            MlpDiscriminatorConfig {
                c_dim: 0,
                img_channels: 1,
                img_resolution: 2,
                hidden_dim: 8,
                num_layers: 1,
                seed,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    fn flat(net: &dyn Network) -> Vec<Vec<f32>> {
        net.named_parameters()
            .iter()
            .map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_snapshot_naming() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path()).unwrap();
        let path = manager.snapshot_path(12_345);
        assert!(path.ends_with("network-snapshot-000012.safetensors"));
        assert!(sidecar_path(&path).ends_with("network-snapshot-000012.json"));
    }

    #[test]
    fn test_save_and_restore() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path()).unwrap();
        let (g1, d1) = (g(1), d(2));
        let g_ema = g1.deep_copy().unwrap();

        let mut state = TrainingState::default();
        state.cur_nimg = 4000;
        let path = manager.save(&state, &g1, &d1, g_ema.as_ref()).unwrap();

        let snapshot = Snapshot::load(&path, &Device::Cpu).unwrap();
        assert_eq!(snapshot.state().unwrap().cur_nimg, 4000);
        assert!(snapshot.tensor("G.mapping.w_avg").is_some());
        assert!(snapshot.tensor("G_ema.mapping.fc0.weight").is_some());

        let (g2, d2) = (g(9), d(10));
        assert_ne!(flat(&g1), flat(&g2));
        assert!(snapshot.copy_params_and_buffers(G_PREFIX, &g2, true).unwrap().is_empty());
        snapshot.copy_params_and_buffers(D_PREFIX, &d2, true).unwrap();
        assert_eq!(flat(&g1), flat(&g2));
        assert_eq!(flat(&d1), flat(&d2));
    }

    #[test]
    fn test_missing_tensors() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path()).unwrap();
        let (g1, d1) = (g(1), d(2));
        let path = manager
            .save(&TrainingState::default(), &g1, &d1, &g1)
            .unwrap();
        let snapshot = Snapshot::load(&path, &Device::Cpu).unwrap();

        // Discriminator names looked up under the generator prefix
        let missing = snapshot.copy_params_and_buffers(G_PREFIX, &d(3), false).unwrap();
        assert!(!missing.is_empty());
        assert!(snapshot.copy_params_and_buffers(G_PREFIX, &d(3), true).is_err());
        assert!(Snapshot::load(dir.path().join("nope.safetensors"), &Device::Cpu).is_err());
    }
}
