//! ddptrain - data-parallel GPT pretraining
//!
//! ```text
//! # four workers as threads of this process, joined by a nexar mesh
//! ddptrain --config run.yaml --world-size 4
//! ```

use std::path::PathBuf;
use std::thread;

use clap::Parser;
use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ddptrain::data::{ByteTokenizer, CorpusFormat, TokenStream, load_corpus};
use ddptrain::distributed::{ProcessGroup, init_process_groups};
use ddptrain::model::GptModel;
use ddptrain::trainer::{Orchestrator, RunConfig, RunSummary, build_loaders};
use ddptrain::{Error, Result};

#[derive(Parser, Debug)]
#[command(name = "ddptrain", version, about = "Data-parallel GPT pretraining")]
struct Cli {
    /// Run configuration (.yaml, .yml or .json); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Training corpus
    #[arg(short, long)]
    data: Option<PathBuf>,

    #[arg(long, value_enum)]
    format: Option<CorpusFormat>,

    #[arg(long)]
    epochs: Option<u64>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    micro_batch_size: Option<usize>,

    /// Worker threads; gradients are averaged across all of them
    #[arg(long)]
    world_size: Option<usize>,

    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,
}

impl Cli {
    fn into_config(self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        let train = &mut config.train;
        if let Some(v) = self.epochs {
            train.num_epochs = v;
        }
        if let Some(v) = self.lr {
            train.learning_rate = v;
        }
        if let Some(v) = self.batch_size {
            train.batch_size = v;
        }
        if let Some(v) = self.micro_batch_size {
            train.micro_batch_size = v;
        }
        if let Some(v) = self.checkpoint {
            train.checkpoint_path = v;
        }
        if let Some(v) = self.seed {
            train.seed = v;
        }

        if let Some(v) = self.world_size {
            config.dist.world_size = v;
        }

        if self.data.is_some() {
            config.data.path = self.data;
        }
        if let Some(v) = self.format {
            config.data.format = v;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ddptrain=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = Cli::parse().into_config().and_then(run) {
        error!(error = %e, "training failed");
        std::process::exit(1);
    }
}

fn run(config: RunConfig) -> Result<()> {
    let path = config.data.path.clone().ok_or_else(|| Error::ConfigError {
        reason: "no corpus given; set data.path or pass --data".into(),
    })?;
    let (train, val) = load_corpus(&path, config.data.format, config.data.train_ratio, &ByteTokenizer)?;

    let groups = init_process_groups(&config.dist)?;
    thread::scope(|s| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let config = config.clone();
                let (train, val) = (train.clone(), val.clone());
                s.spawn(move || train_worker(config, group, train, val))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(Error::DistributedError {
                        reason: "worker thread panicked".into(),
                    })
                })
            })
            .collect::<Result<Vec<RunSummary>>>()
    })?;
    Ok(())
}

fn train_worker<P: ProcessGroup>(
    config: RunConfig,
    group: P,
    train: TokenStream,
    val: TokenStream,
) -> Result<RunSummary> {
    let device = CpuDevice::new();
    let (rank, world_size) = (group.rank(), group.world_size());
    let (train_loader, val_loader) =
        build_loaders::<CpuRuntime>(&config, train, val, rank, world_size, &device)?;
    let model = GptModel::<CpuRuntime>::new(config.model.clone(), config.train.seed, &device)?;

    let mut orchestrator = Orchestrator::new(config, model, ByteTokenizer, group)?;
    let summary = orchestrator.run(&train_loader, &val_loader)?;
    if orchestrator.group().is_leader() {
        let last = summary.history.last();
        info!(
            steps = summary.steps_taken,
            global_step = summary.state.global_step,
            train_loss = ?last.map(|r| r.train_loss),
            val_loss = ?last.map(|r| r.val_loss),
            "run complete"
        );
    }
    Ok(summary)
}
