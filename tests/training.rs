use std::cell::Cell;
use std::path::Path;
use std::thread;

use ddptrain::data::{ByteTokenizer, TokenStream};
use ddptrain::distributed::{CommProcessGroup, ProcessGroup};
use ddptrain::model::{GptConfig, GptModel, LanguageModel};
use ddptrain::trainer::{Orchestrator, RunConfig, RunSummary, build_loaders};
use ddptrain::{Error, Result};
use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use tempfile::TempDir;

fn small_config(checkpoint: &Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.model = GptConfig {
        vocab_size: 257,
        context_length: 8,
        emb_dim: 8,
        n_heads: 2,
        n_layers: 1,
        drop_rate: 0.1,
        qkv_bias: false,
    };
    config.train.batch_size = 4;
    config.train.micro_batch_size = 2;
    config.train.num_epochs = 2;
    config.train.learning_rate = 1e-2;
    config.train.eval_freq = 4;
    config.train.checkpoint_every = 3;
    config.train.max_new_tokens = 2;
    config.train.checkpoint_path = checkpoint.to_path_buf();
    config
}

/// `n` tokens of a repeating byte pattern.
fn corpus(n: usize) -> TokenStream {
    TokenStream::from((0..n as u32).map(|t| (t * 31 + 7) % 256).collect::<Vec<_>>())
}

fn train<P: ProcessGroup>(config: RunConfig, group: P, val_tokens: usize) -> Result<(RunSummary, Vec<Vec<f32>>)> {
    let device = CpuDevice::new();
    // 16 windows of 8 -> 8 micro-batches of 2 -> 4 steps per epoch
    let (train_loader, val_loader) = build_loaders::<CpuRuntime>(
        &config,
        corpus(136),
        corpus(val_tokens),
        group.rank(),
        group.world_size(),
        &device,
    )?;
    let model = GptModel::<CpuRuntime>::new(config.model.clone(), config.train.seed, &device)?;
    let mut orchestrator = Orchestrator::new(config, model, ByteTokenizer, group)?;
    let summary = orchestrator.run(&train_loader, &val_loader)?;
    let params = orchestrator
        .model()
        .params()
        .named_tensors()
        .map(|(_, t)| t.to_vec::<f32>())
        .collect();
    Ok((summary, params))
}

/// Group member whose `n`-th gradient all-reduce fails before reaching the
/// wire. Wrapping every rank with the same `fail_at` stands in for a crash
/// partway through a run.
struct FailingGroup {
    inner: CommProcessGroup,
    fail_at: usize,
    calls: Cell<usize>,
}

impl ProcessGroup for FailingGroup {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        if self.calls.get() == self.fail_at {
            return Err(Error::DistributedError {
                reason: "peer lost".into(),
            });
        }
        self.inner.all_reduce_mean(buf)
    }

    fn reduce_mean_to_leader(&self, value: f64) -> Result<Option<f64>> {
        self.inner.reduce_mean_to_leader(value)
    }

    fn barrier(&self) -> Result<()> {
        self.inner.barrier()
    }
}

type WorkerResult = Result<(RunSummary, Vec<Vec<f32>>)>;

/// Two workers over a loopback mesh; `wrap` decorates each member.
fn train_pair<P, F>(config: &RunConfig, wrap: F) -> Vec<WorkerResult>
where
    P: ProcessGroup + 'static,
    F: Fn(CommProcessGroup) -> P,
{
    let mut config = config.clone();
    config.dist.world_size = 2;
    let handles: Vec<_> = CommProcessGroup::bootstrap_local(2)
        .expect("group")
        .into_iter()
        .map(|member| {
            let config = config.clone();
            let group = wrap(member);
            thread::spawn(move || train(config, group, 40))
        })
        .collect();
    handles.into_iter().map(|h| h.join().expect("join")).collect()
}

#[test]
fn test_full_run_step_count() {
    let dir = TempDir::new().expect("tempdir");
    let config = small_config(&dir.path().join("ckpt.bin"));
    let (summary, _) = train(config, CommProcessGroup::single(), 40).expect("run");
    assert_eq!(summary.max_steps, 8);
    assert_eq!(summary.steps_taken, 8);
    assert_eq!(summary.state.global_step, 8);
    assert_eq!(summary.state.optimizer_timestep, 8);
    // micro-batches 0 and 4 of each epoch
    assert_eq!(summary.history.len(), 4);
    assert!(summary.history.records().iter().all(|r| r.train_loss.is_finite()));
}

#[test]
fn test_training_lowers_loss() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = small_config(&dir.path().join("ckpt.bin"));
    config.train.num_epochs = 6;
    config.train.learning_rate = 5e-2;
    let (summary, _) = train(config, CommProcessGroup::single(), 40).expect("run");
    let records = summary.history.records();
    let first = records.first().expect("first eval").train_loss;
    let last = records.last().expect("last eval").train_loss;
    assert!(last < first, "loss did not drop: {first} -> {last}");
}

#[test]
fn test_empty_validation_loader_reports_nan() {
    let dir = TempDir::new().expect("tempdir");
    let config = small_config(&dir.path().join("ckpt.bin"));
    // shorter than one window
    let (summary, _) = train(config, CommProcessGroup::single(), 5).expect("run");
    assert!(!summary.history.is_empty());
    assert!(summary.history.records().iter().all(|r| r.val_loss.is_nan()));
    assert!(summary.history.records().iter().all(|r| r.train_loss.is_finite()));
}

#[test]
fn test_resume_matches_uninterrupted_run() {
    let dir = TempDir::new().expect("tempdir");
    // 8 windows per rank -> 4 micro-batches -> 2 steps per epoch, 8 in all
    let mut base = small_config(&dir.path().join("reference.bin"));
    base.train.num_epochs = 4;

    let reference = train_pair(&base, |g| g);
    let (expected, expected_params) = reference.into_iter().next().expect("leader").expect("reference run");
    assert_eq!(expected.state.global_step, 8);

    // both ranks fail at the 5th synchronization: last checkpoint is step 3,
    // i.e. micro-batch 2 of epoch 1
    let mut config = base.clone();
    config.train.checkpoint_path = dir.path().join("resumed.bin");
    let crashed = train_pair(&config, |inner| FailingGroup {
        inner,
        fail_at: 5,
        calls: Cell::new(0),
    });
    for result in crashed {
        assert!(matches!(result, Err(Error::DistributedError { .. })));
    }
    assert!(config.train.checkpoint_path.exists());

    let resumed = train_pair(&config, |g| g);
    let mut replicas = Vec::new();
    for result in resumed {
        let (summary, params) = result.expect("resumed run");
        assert_eq!(summary.resumed_from, Some(3));
        assert_eq!(summary.steps_taken, 5);
        assert_eq!(summary.state.global_step, expected.state.global_step);
        assert_eq!(summary.state.rng_state, expected.state.rng_state);
        assert_eq!(summary.state.optimizer_timestep, expected.state.optimizer_timestep);
        replicas.push(params);
    }
    assert_eq!(replicas[0], expected_params);
    assert_eq!(replicas[1], expected_params);

    let device = CpuDevice::new();
    let fresh = GptModel::<CpuRuntime>::new(base.model.clone(), base.train.seed, &device).expect("model");
    let initial: Vec<Vec<f32>> = fresh.params().named_tensors().map(|(_, t)| t.to_vec::<f32>()).collect();
    assert_ne!(initial, expected_params);
}

#[test]
fn test_failing_group_reaches_sync_point() {
    let dir = TempDir::new().expect("tempdir");
    let config = small_config(&dir.path().join("ckpt.bin"));
    let results = train_pair(&config, |inner| FailingGroup {
        inner,
        fail_at: 1,
        calls: Cell::new(0),
    });
    for result in results {
        assert!(matches!(result, Err(Error::DistributedError { .. })));
    }
    assert!(!dir.path().join("ckpt.bin").exists());
}

#[test]
fn test_corrupt_checkpoint_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("ckpt.bin");
    std::fs::write(&path, b"definitely not a checkpoint").expect("write");
    let err = train(small_config(&path), CommProcessGroup::single(), 40).expect_err("corrupt");
    assert!(matches!(err, Error::CheckpointCorrupt { .. }));
}

#[test]
fn test_checkpoint_from_other_architecture_starts_fresh() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("ckpt.bin");

    let mut wide = small_config(&path);
    wide.model.emb_dim = 16;
    wide.train.num_epochs = 1;
    train(wide, CommProcessGroup::single(), 40).expect("wide run");
    assert!(path.exists());

    let (summary, _) = train(small_config(&path), CommProcessGroup::single(), 40).expect("narrow run");
    assert_eq!(summary.resumed_from, None);
    assert_eq!(summary.steps_taken, 8);
}

#[test]
fn test_eval_mode_restored_after_run() {
    let dir = TempDir::new().expect("tempdir");
    let config = small_config(&dir.path().join("ckpt.bin"));
    let device = CpuDevice::new();
    let (train_loader, val_loader) =
        build_loaders::<CpuRuntime>(&config, corpus(136), corpus(40), 0, 1, &device).expect("loaders");
    let model = GptModel::<CpuRuntime>::new(config.model.clone(), 1, &device).expect("model");
    let mut orchestrator =
        Orchestrator::new(config, model, ByteTokenizer, CommProcessGroup::single()).expect("orchestrator");
    orchestrator.run(&train_loader, &val_loader).expect("run");
    assert!(orchestrator.model().is_training());
}
