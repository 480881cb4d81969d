//! Per-worker training loop
//!
//! Every rank runs one [`Orchestrator`] over its own shard. Ranks only
//! interact through the process group: gradient all-reduce at the end of each
//! accumulation group, loss reduction at evaluations and the final barrier.
//! Since all ranks see the same number of micro-batches, they take the same
//! steps at the same learning rates and hold bit-identical parameters.
//!
//! ```ignore
//! let (train, val) = build_loaders::<CpuRuntime>(&config, train_tokens, val_tokens, rank, world, &device)?;
//! let mut orchestrator = Orchestrator::new(config, model, ByteTokenizer, group)?;
//! let summary = orchestrator.run(&train, &val)?;
//! ```

use std::time::Instant;

use crate::data::{
    DataLoader, Dataset, DistributedSampler, LoaderCursor, SequenceDataset, TokenStream, Tokenizer,
};
use crate::distributed::ProcessGroup;
use crate::error::{Error, Result};
use crate::model::{LanguageModel, ModelClient};
use crate::nn::cross_entropy_loss;
use crate::optimizer::{AdamW, GradSyncController, LrSchedule};
use crate::trainer::checkpoint::{CheckpointManager, LoadOutcome};
use crate::trainer::config::RunConfig;
use crate::trainer::evaluate::{EvalHistory, Evaluator, Progress};
use crate::trainer::state::{ResumePoint, TrainingState};
use numr::autograd::backward;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::TensorId;

/// Build this rank's train and validation loaders.
///
/// Training windows are shuffled per epoch and the uneven tail is dropped so
/// every rank runs the same number of micro-batches. Validation is read in
/// order and padded to equal shards.
pub fn build_loaders<R: Runtime<DType = DType>>(
    config: &RunConfig,
    train_tokens: TokenStream,
    val_tokens: TokenStream,
    rank: usize,
    world_size: usize,
    device: &R::Device,
) -> Result<(DataLoader<R, SequenceDataset>, DataLoader<R, SequenceDataset>)> {
    let context = config.model.context_length;
    let stride = config.stride();
    let micro = config.train.micro_batch_size;

    let train = SequenceDataset::new(train_tokens, context, stride)?;
    let sampler = DistributedSampler::new(train.len(), rank, world_size, true, config.train.seed, true)?;
    let train = DataLoader::new(train, sampler, micro, device.clone())?;

    let val = SequenceDataset::new(val_tokens, context, stride)?;
    let sampler = DistributedSampler::new(val.len(), rank, world_size, false, config.train.seed, false)?;
    let val = DataLoader::new(val, sampler, micro, device.clone())?;

    Ok((train, val))
}

/// Outcome of [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub state: TrainingState,
    /// Populated on the leader only.
    pub history: EvalHistory,
    /// Optimizer steps taken in this session.
    pub steps_taken: u64,
    /// Global step restored from a checkpoint, if any.
    pub resumed_from: Option<u64>,
    pub max_steps: u64,
    /// Tokens consumed by this rank in this session.
    pub tokens_seen: u64,
}

pub struct Orchestrator<R: Runtime, M, T, P> {
    config: RunConfig,
    client: R::Client,
    model: M,
    tokenizer: T,
    group: P,
}

impl<R, M, T, P> Orchestrator<R, M, T, P>
where
    R: Runtime<DType = DType>,
    R::Client: ModelClient<R>,
    M: LanguageModel<R>,
    T: Tokenizer,
    P: ProcessGroup,
{
    pub fn new(config: RunConfig, model: M, tokenizer: T, group: P) -> Result<Self> {
        config.validate()?;
        if tokenizer.vocab_size() > config.model.vocab_size {
            return Err(Error::ConfigError {
                reason: format!(
                    "tokenizer produces {} ids but the model vocabulary has {}",
                    tokenizer.vocab_size(),
                    config.model.vocab_size
                ),
            });
        }
        if group.world_size() != config.dist.world_size {
            return Err(Error::ConfigError {
                reason: format!(
                    "process group has {} workers, config expects {}",
                    group.world_size(),
                    config.dist.world_size
                ),
            });
        }
        let client = R::default_client(model.device());
        Ok(Self {
            config,
            client,
            model,
            tokenizer,
            group,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn group(&self) -> &P {
        &self.group
    }

    /// Train for the configured number of epochs, resuming from the
    /// checkpoint if a compatible one exists.
    pub fn run<DT, DV>(
        &mut self,
        train_loader: &DataLoader<R, DT>,
        val_loader: &DataLoader<R, DV>,
    ) -> Result<RunSummary>
    where
        DT: Dataset,
        DV: Dataset,
    {
        let span = tracing::info_span!("worker", rank = self.group.rank());
        let _guard = span.enter();

        let settings = self.config.train.clone();
        let schedule = settings.accumulation()?;
        let g = schedule.grad_accum_steps();
        let train_batches = train_loader.num_batches();
        let per_epoch_steps = (train_batches / g) as u64;
        if per_epoch_steps == 0 {
            return Err(Error::TrainingError {
                reason: format!(
                    "{train_batches} micro-batches per epoch cannot fill one accumulation group of {g}"
                ),
            });
        }
        let max_steps = per_epoch_steps * settings.num_epochs;
        let lr_schedule = LrSchedule::for_run(settings.learning_rate, max_steps);

        let mut optimizer = AdamW::<R>::new(settings.adamw());
        let no_decay: Vec<TensorId> = self
            .model
            .params()
            .names()
            .filter(|(name, _)| !self.model.decays(name))
            .map(|(_, id)| id)
            .collect();
        optimizer.exclude_from_decay(no_decay);
        let mut sync = GradSyncController::<R>::new(&schedule, settings.grad_clip)?;

        let checkpoints = CheckpointManager::new(settings.checkpoint_path.clone());
        let mut state = match checkpoints.load(&mut self.model, &mut optimizer)? {
            LoadOutcome::Restored(state) => {
                tracing::info!(step = state.global_step, "resuming from checkpoint");
                state
            }
            LoadOutcome::Fresh(reason) => {
                tracing::info!(?reason, "starting from scratch");
                TrainingState::new(self.model.rng_state())
            }
        };
        let resumed_from = (state.global_step > 0).then_some(state.global_step);
        let start_step = state.global_step;
        let resume = ResumePoint::from_global_step(state.global_step, per_epoch_steps, g)?;

        tracing::info!(
            world_size = self.group.world_size(),
            micro_batches_per_epoch = train_batches,
            grad_accum_steps = g,
            per_epoch_steps,
            max_steps,
            parameters = self.model.params().num_parameters(),
            "training"
        );

        let evaluator = Evaluator::new(settings.eval_iter, max_steps)
            .with_prompt(settings.start_context.clone(), settings.max_new_tokens);
        let mut history = EvalHistory::default();
        let micro_per_epoch = per_epoch_steps as usize * g;
        let prior_elapsed = state.elapsed_seconds;
        let session = Instant::now();
        let mut tokens_seen = 0u64;

        self.model.set_training(true);
        for epoch in resume.epoch..settings.num_epochs {
            let cursor = if epoch == resume.epoch {
                resume.cursor()
            } else {
                LoaderCursor { epoch, batch: 0 }
            };
            let mut batches = train_loader.iter_from(cursor);

            for i in cursor.batch..micro_per_epoch {
                let Some(batch) = batches.next() else {
                    break;
                };
                let batch = batch?;
                let logits = self.model.forward(&self.client, &batch.inputs)?;
                let loss = cross_entropy_loss(&self.client, &logits, &batch.targets)?;
                let grads = backward(&loss, &self.client)?;
                tokens_seen += batch.inputs.numel() as u64;

                let i = i as u64;
                sync.accumulate(
                    &self.client,
                    self.model.params(),
                    grads,
                    schedule.sync_gradients(i),
                    &self.group,
                )?;

                if schedule.opens_group(i + 1) {
                    let report = sync.step(
                        &self.client,
                        self.model.params_mut(),
                        &mut optimizer,
                        &lr_schedule,
                        &mut state,
                    )?;
                    state.elapsed_seconds = prior_elapsed + session.elapsed().as_secs_f64();
                    tracing::debug!(
                        step = report.step,
                        lr = report.lr,
                        grad_norm = report.grad_norm,
                        "optimizer step"
                    );
                    if state.global_step % settings.checkpoint_every == 0 {
                        checkpoints.save(&self.model, &optimizer, &state, self.group.is_leader())?;
                    }
                }

                if i % settings.eval_freq as u64 == 0 {
                    let progress = Progress {
                        epoch,
                        global_step: state.global_step,
                        elapsed_seconds: prior_elapsed + session.elapsed().as_secs_f64(),
                        tokens_seen,
                    };
                    if let Some(record) = evaluator.evaluate(
                        &mut self.model,
                        &self.client,
                        train_loader,
                        val_loader,
                        &self.group,
                        progress,
                    )? {
                        history.push(record);
                    }
                }
            }

            if self.group.is_leader() {
                evaluator.sample(&mut self.model, &self.client, &self.tokenizer)?;
            }
        }

        state.elapsed_seconds = prior_elapsed + session.elapsed().as_secs_f64();
        state.rng_state = self.model.rng_state();
        self.group.barrier()?;
        tracing::info!(
            step = state.global_step,
            elapsed_seconds = state.elapsed_seconds,
            "training finished"
        );

        Ok(RunSummary {
            steps_taken: state.global_step - start_step,
            state,
            history,
            resumed_from,
            max_steps,
            tokens_seen,
        })
    }
}
