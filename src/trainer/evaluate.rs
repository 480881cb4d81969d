//! Periodic loss estimates and text samples.

use crate::data::{DataLoader, Dataset, Tokenizer};
use crate::distributed::ProcessGroup;
use crate::error::Result;
use crate::model::{LanguageModel, ModelClient, generate_greedy};
use crate::nn::cross_entropy_loss;
use numr::autograd::Var;
use numr::dtype::DType;
use numr::runtime::Runtime;
use serde::Serialize;

/// Mean cross-entropy over the first `num_batches` batches of `loader` in
/// `epoch`'s order (all of them when `None`). NaN when the loader yields
/// nothing.
///
/// Runs in whatever mode the model is in.
pub fn calc_loss_loader<R, C, M, D>(
    model: &mut M,
    client: &C,
    loader: &DataLoader<R, D>,
    epoch: u64,
    num_batches: Option<usize>,
) -> Result<f64>
where
    R: Runtime<DType = DType>,
    C: ModelClient<R>,
    R::Client: ModelClient<R>,
    M: LanguageModel<R>,
    D: Dataset,
{
    let available = loader.num_batches();
    let n = num_batches.map_or(available, |n| n.min(available));
    if n == 0 {
        return Ok(f64::NAN);
    }

    let mut total = 0.0;
    for batch in loader.iter(epoch).take(n) {
        let batch = batch?;
        let logits = model.forward(client, &batch.inputs)?;
        let loss = cross_entropy_loss(client, &logits, &batch.targets)?;
        total += scalar(&loss);
    }
    Ok(total / n as f64)
}

fn scalar<R: Runtime>(v: &Var<R>) -> f64 {
    v.tensor()
        .to_vec::<f32>()
        .first()
        .map_or(f64::NAN, |&x| x as f64)
}

/// Remaining wall-clock hours, extrapolated from the average step time.
pub fn eta_hours(elapsed_seconds: f64, global_step: u64, max_steps: u64) -> Option<f64> {
    if global_step == 0 {
        return None;
    }
    let remaining = max_steps.saturating_sub(global_step) as f64;
    Some(elapsed_seconds / global_step as f64 * remaining / 3600.0)
}

/// Where the run is when an evaluation fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub epoch: u64,
    pub global_step: u64,
    pub elapsed_seconds: f64,
    pub tokens_seen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalRecord {
    pub epoch: u64,
    pub step: u64,
    pub train_loss: f64,
    pub val_loss: f64,
    pub tokens_seen: u64,
}

/// Loss curve collected on the leader.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvalHistory {
    records: Vec<EvalRecord>,
}

impl EvalHistory {
    pub fn push(&mut self, record: EvalRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[EvalRecord] {
        &self.records
    }

    pub fn last(&self) -> Option<&EvalRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Loss reporting and sampling for one run.
#[derive(Debug, Clone)]
pub struct Evaluator {
    eval_iter: usize,
    max_steps: u64,
    start_context: String,
    max_new_tokens: usize,
}

impl Evaluator {
    pub fn new(eval_iter: usize, max_steps: u64) -> Self {
        Self {
            eval_iter,
            max_steps,
            start_context: "Every effort moves you".to_string(),
            max_new_tokens: 50,
        }
    }

    pub fn with_prompt(mut self, start_context: impl Into<String>, max_new_tokens: usize) -> Self {
        self.start_context = start_context.into();
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Estimate train and validation loss and average them onto the leader.
    ///
    /// Collective: every rank must call it at the same point. Returns the
    /// record on the leader and `None` elsewhere. The model's train/eval mode
    /// is restored on every path out.
    pub fn evaluate<R, C, M, DT, DV, P>(
        &self,
        model: &mut M,
        client: &C,
        train_loader: &DataLoader<R, DT>,
        val_loader: &DataLoader<R, DV>,
        group: &P,
        progress: Progress,
    ) -> Result<Option<EvalRecord>>
    where
        R: Runtime<DType = DType>,
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
        M: LanguageModel<R>,
        DT: Dataset,
        DV: Dataset,
        P: ProcessGroup + ?Sized,
    {
        let was_training = model.is_training();
        model.set_training(false);
        let epoch = progress.epoch;
        let limit = Some(self.eval_iter);
        let local = calc_loss_loader(model, client, train_loader, epoch, limit)
            .and_then(|train| Ok((train, calc_loss_loader(model, client, val_loader, epoch, limit)?)));
        model.set_training(was_training);
        let (train_loss, val_loss) = local?;

        let train_loss = group.reduce_mean_to_leader(train_loss)?;
        let val_loss = group.reduce_mean_to_leader(val_loss)?;
        let (Some(train_loss), Some(val_loss)) = (train_loss, val_loss) else {
            return Ok(None);
        };

        let eta = eta_hours(progress.elapsed_seconds, progress.global_step, self.max_steps);
        tracing::info!(
            epoch = progress.epoch + 1,
            step = progress.global_step,
            train_loss = format_args!("{train_loss:.3}"),
            val_loss = format_args!("{val_loss:.3}"),
            eta_hours = ?eta.map(|h| (h * 100.0).round() / 100.0),
            "evaluation"
        );
        Ok(Some(EvalRecord {
            epoch: progress.epoch,
            step: progress.global_step,
            train_loss,
            val_loss,
            tokens_seen: progress.tokens_seen,
        }))
    }

    /// Greedy continuation of the configured prompt, logged on one line.
    ///
    /// An empty prompt produces an empty sample and a warning.
    pub fn sample<R, C, M, T>(&self, model: &mut M, client: &C, tokenizer: &T) -> Result<String>
    where
        R: Runtime<DType = DType>,
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
        M: LanguageModel<R>,
        T: Tokenizer + ?Sized,
    {
        let prompt = tokenizer.encode(&self.start_context)?;
        if prompt.is_empty() {
            tracing::warn!("start context encodes to no tokens; skipping sample");
            return Ok(String::new());
        }

        let was_training = model.is_training();
        model.set_training(false);
        let context = model.context_length();
        let ids = generate_greedy(model, client, &prompt, self.max_new_tokens, context);
        model.set_training(was_training);

        let text = tokenizer.decode(&ids?)?.replace('\n', " ");
        tracing::info!(sample = %text, "generated");
        Ok(text)
    }
}
