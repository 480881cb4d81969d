//! Single-slot checkpoints for training resumption
//!
//! One file holds model parameters (`model.<name>`), AdamW moments
//! (`optim.m.<name>`, `optim.v.<name>`) and two metadata entries:
//! `training_state` (JSON [`TrainingState`]) and `model_config` (the model's
//! architecture string). Only the leader writes; the file is replaced
//! atomically through `<path>.tmp`.
//!
//! Loading distinguishes three situations:
//! - no file: fresh start;
//! - file written for a different architecture: fresh start with a warning,
//!   nothing modified;
//! - file present but undecodable: `Error::CheckpointCorrupt`, fatal.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::model::LanguageModel;
use crate::optimizer::{AdamW, Moments, Optimizer};
use crate::trainer::container::{Container, HostTensor};
use crate::trainer::state::{CHECKPOINT_VERSION, TrainingState};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Tensor, TensorId};

const META_TRAINING_STATE: &str = "training_state";
const META_MODEL_CONFIG: &str = "model_config";

/// Why a run starts from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreshStart {
    NotFound,
    /// Checkpoint belongs to another architecture.
    ShapeMismatch { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Model, optimizer and RNG were restored; training continues from here.
    Restored(TrainingState),
    Fresh(FreshStart),
}

pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut s = self.path.as_os_str().to_owned();
        s.push(".tmp");
        PathBuf::from(s)
    }

    fn corrupt(&self, reason: impl Into<String>) -> Error {
        Error::CheckpointCorrupt {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Write a checkpoint. Non-leaders return `Ok(false)` without touching
    /// the filesystem.
    pub fn save<R, M>(
        &self,
        model: &M,
        optimizer: &AdamW<R>,
        state: &TrainingState,
        is_leader: bool,
    ) -> Result<bool>
    where
        R: Runtime<DType = DType>,
        M: LanguageModel<R>,
    {
        if !is_leader {
            return Ok(false);
        }

        let mut container = Container::new();
        let params = model.params();
        for (name, id) in params.names() {
            let Some(tensor) = params.get(id) else {
                continue;
            };
            container.insert(format!("model.{name}"), HostTensor::from_tensor(tensor));
            if let Some(moments) = optimizer.moments(id) {
                container.insert(format!("optim.m.{name}"), HostTensor::from_tensor(&moments.m));
                container.insert(format!("optim.v.{name}"), HostTensor::from_tensor(&moments.v));
            }
        }

        let state = TrainingState {
            format_version: CHECKPOINT_VERSION,
            rng_state: model.rng_state(),
            optimizer_timestep: optimizer.timestep(),
            ..state.clone()
        };
        let state_json = serde_json::to_string(&state).map_err(|e| Error::TrainingError {
            reason: format!("cannot serialize training state: {e}"),
        })?;
        container.set_metadata(META_TRAINING_STATE, state_json);
        container.set_metadata(META_MODEL_CONFIG, model.architecture());

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        container.write_to(&mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;

        tracing::info!(
            path = %self.path.display(),
            step = state.global_step,
            tensors = container.len(),
            "checkpoint saved"
        );
        Ok(true)
    }

    /// Restore model, optimizer and RNG in place if a compatible checkpoint
    /// exists. Tensors are materialized on the model's device.
    pub fn load<R, M>(&self, model: &mut M, optimizer: &mut AdamW<R>) -> Result<LoadOutcome>
    where
        R: Runtime<DType = DType>,
        M: LanguageModel<R>,
    {
        if !self.path.exists() {
            return Ok(LoadOutcome::Fresh(FreshStart::NotFound));
        }
        let bytes = fs::read(&self.path)?;
        let container = Container::decode(&bytes).map_err(|reason| self.corrupt(reason))?;

        let state_json = container
            .metadata(META_TRAINING_STATE)
            .ok_or_else(|| self.corrupt("missing training_state metadata"))?;
        let state: TrainingState = serde_json::from_str(state_json)
            .map_err(|e| self.corrupt(format!("bad training_state: {e}")))?;
        if state.format_version > CHECKPOINT_VERSION {
            return Err(self.corrupt(format!(
                "format version {} is newer than supported {CHECKPOINT_VERSION}",
                state.format_version
            )));
        }

        let saved_arch = container
            .metadata(META_MODEL_CONFIG)
            .ok_or_else(|| self.corrupt("missing model_config metadata"))?;
        let current_arch = model.architecture();
        if saved_arch != current_arch {
            return Ok(mismatch(format!(
                "saved model {saved_arch} differs from current {current_arch}"
            )));
        }

        // Stage everything first; nothing is modified on a mismatch.
        let device = model.device().clone();
        let params = model.params();
        let mut staged_params: Vec<(String, Tensor<R>)> = Vec::with_capacity(params.len());
        let mut staged_moments: HashMap<TensorId, Moments<R>> = HashMap::new();
        for (name, id) in params.names() {
            let Some(current) = params.get(id) else {
                continue;
            };
            let Some(saved) = container.get(&format!("model.{name}")) else {
                return Ok(mismatch(format!("parameter {name} missing from checkpoint")));
            };
            if saved.shape != current.shape() {
                return Ok(mismatch(format!(
                    "parameter {name}: checkpoint shape {:?}, model shape {:?}",
                    saved.shape,
                    current.shape()
                )));
            }
            staged_params.push((name.to_string(), saved.to_tensor::<R>(&device)));

            match (
                container.get(&format!("optim.m.{name}")),
                container.get(&format!("optim.v.{name}")),
            ) {
                (Some(m), Some(v)) => {
                    if m.shape != current.shape() || v.shape != current.shape() {
                        return Ok(mismatch(format!("optimizer moments for {name} have the wrong shape")));
                    }
                    staged_moments.insert(
                        id,
                        Moments {
                            m: m.to_tensor::<R>(&device),
                            v: v.to_tensor::<R>(&device),
                        },
                    );
                }
                (None, None) => {}
                _ => return Err(self.corrupt(format!("only one optimizer moment stored for {name}"))),
            }
        }
        let known = params.len();
        let saved_params = container.names().filter(|n| n.starts_with("model.")).count();
        if saved_params != known {
            return Ok(mismatch(format!(
                "checkpoint has {saved_params} parameters, model has {known}"
            )));
        }

        let params = model.params_mut();
        for (name, tensor) in staged_params {
            params.replace(&name, tensor)?;
        }
        optimizer.restore(state.optimizer_timestep, staged_moments);
        model.set_rng_state(state.rng_state);

        tracing::info!(
            path = %self.path.display(),
            step = state.global_step,
            elapsed_seconds = state.elapsed_seconds,
            "checkpoint restored"
        );
        Ok(LoadOutcome::Restored(state))
    }
}

fn mismatch(reason: String) -> LoadOutcome {
    tracing::warn!(%reason, "checkpoint does not fit this model, starting fresh");
    LoadOutcome::Fresh(FreshStart::ShapeMismatch { reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GptConfig, GptModel};
    use crate::optimizer::AdamWConfig;
    use crate::test_utils::{cpu_setup, tiny_config};
    use numr::autograd::GradStore;
    use numr::runtime::cpu::CpuRuntime;
    use tempfile::TempDir;

    fn model(seed: u64) -> GptModel<CpuRuntime> {
        let (_, device) = cpu_setup();
        GptModel::new(tiny_config(), seed, &device).unwrap()
    }

    /// One optimizer step with constant gradients so moments are non-zero.
    fn stepped(m: &mut GptModel<CpuRuntime>) -> AdamW<CpuRuntime> {
        let (client, device) = cpu_setup();
        let mut grads = GradStore::new();
        for (_, id) in m.params().names() {
            let shape = m.params().get(id).unwrap().shape().to_vec();
            let n: usize = shape.iter().product();
            grads.insert(id, Tensor::<CpuRuntime>::from_slice(&vec![0.01f32; n], &shape, &device));
        }
        let mut opt = AdamW::new(AdamWConfig::default());
        opt.step(&client, m.params_mut(), &grads).unwrap();
        opt
    }

    #[test]
    fn test_missing_file_is_fresh() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().join("ckpt.bin"));
        let mut m = model(0);
        let mut opt = AdamW::new(AdamWConfig::default());
        assert_eq!(
            mgr.load(&mut m, &mut opt).unwrap(),
            LoadOutcome::Fresh(FreshStart::NotFound)
        );
    }

    #[test]
    fn test_save_load_restores_everything() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().join("ckpt.bin"));
        let mut src = model(1);
        let opt = stepped(&mut src);
        src.set_rng_state(0xDEAD_BEEF);
        let state = TrainingState {
            global_step: 7,
            elapsed_seconds: 12.5,
            ..TrainingState::new(0)
        };
        assert!(mgr.save(&src, &opt, &state, true).unwrap());
        assert!(!mgr.tmp_path().exists());

        let mut dst = model(2);
        let mut dst_opt = AdamW::new(AdamWConfig::default());
        let LoadOutcome::Restored(loaded) = mgr.load(&mut dst, &mut dst_opt).unwrap() else {
            panic!("expected restore");
        };
        assert_eq!(loaded.global_step, 7);
        assert_eq!(loaded.elapsed_seconds, 12.5);
        assert_eq!(loaded.optimizer_timestep, 1);
        assert_eq!(dst.rng_state(), 0xDEAD_BEEF);
        assert_eq!(dst_opt.timestep(), 1);

        for ((name, a), (_, b)) in src.params().named_tensors().zip(dst.params().named_tensors()) {
            assert_eq!(a.to_vec::<f32>(), b.to_vec::<f32>(), "{name}");
        }
        for (name, id) in dst.params().names() {
            let src_id = src.params().id_of(name).unwrap();
            let (a, b) = (opt.moments(src_id).unwrap(), dst_opt.moments(id).unwrap());
            assert_eq!(a.m.to_vec::<f32>(), b.m.to_vec::<f32>());
            assert_eq!(a.v.to_vec::<f32>(), b.v.to_vec::<f32>());
        }
    }

    #[test]
    fn test_non_leader_does_not_write() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().join("ckpt.bin"));
        let m = model(0);
        let opt = AdamW::new(AdamWConfig::default());
        assert!(!mgr.save(&m, &opt, &TrainingState::new(0), false).unwrap());
        assert!(!mgr.path().exists());
    }

    #[test]
    fn test_architecture_mismatch_leaves_model_untouched() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().join("ckpt.bin"));
        let src = model(1);
        mgr.save(&src, &AdamW::new(AdamWConfig::default()), &TrainingState::new(0), true)
            .unwrap();

        let (_, device) = cpu_setup();
        let wider = GptConfig {
            emb_dim: tiny_config().emb_dim * 2,
            ..tiny_config()
        };
        let mut other = GptModel::<CpuRuntime>::new(wider, 5, &device).unwrap();
        let before: Vec<Vec<f32>> = other.params().named_tensors().map(|(_, t)| t.to_vec::<f32>()).collect();
        let rng_before = other.rng_state();

        let outcome = mgr.load(&mut other, &mut AdamW::new(AdamWConfig::default())).unwrap();
        assert!(matches!(outcome, LoadOutcome::Fresh(FreshStart::ShapeMismatch { .. })));
        let after: Vec<Vec<f32>> = other.params().named_tensors().map(|(_, t)| t.to_vec::<f32>()).collect();
        assert_eq!(before, after);
        assert_eq!(other.rng_state(), rng_before);
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.bin");
        let mgr = CheckpointManager::new(&path);
        let src = model(1);
        mgr.save(&src, &AdamW::new(AdamWConfig::default()), &TrainingState::new(0), true)
            .unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = mgr
            .load(&mut model(1), &mut AdamW::new(AdamWConfig::default()))
            .unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupt { .. }));
    }

    #[test]
    fn test_second_save_replaces_first() {
        let dir = TempDir::new().unwrap();
        let mgr = CheckpointManager::new(dir.path().join("nested").join("ckpt.bin"));
        let m = model(3);
        let opt = AdamW::new(AdamWConfig::default());
        for step in [1, 2] {
            let state = TrainingState {
                global_step: step,
                ..TrainingState::new(0)
            };
            mgr.save(&m, &opt, &state, true).unwrap();
        }
        let outcome = mgr.load(&mut model(4), &mut AdamW::new(AdamWConfig::default())).unwrap();
        let LoadOutcome::Restored(state) = outcome else {
            panic!("expected restore");
        };
        assert_eq!(state.global_step, 2);
    }
}
