use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nanolm::{
    ByteTokenizer, CheckpointStore, DataLoader, FileCheckpointStore, ModelConfig,
    PositionEncoding, TokenWindows, Tokenizer, TrainConfig, Trainer, Transformer,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Train a byte-level language model on a text file",
    long_about = None
)]
struct Args {
    /// UTF-8 training text
    #[arg(short, long)]
    data: PathBuf,

    /// checkpoint directory
    #[arg(short, long, default_value = "checkpoints")]
    out_dir: PathBuf,

    /// model config JSON, flags below override it
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// training config JSON, flags below override it
    #[arg(long)]
    train_config: Option<PathBuf>,

    #[arg(long)]
    dim: Option<usize>,

    #[arg(long)]
    n_layers: Option<usize>,

    #[arg(long)]
    n_heads: Option<usize>,

    #[arg(long)]
    seq_len: Option<usize>,

    #[arg(long)]
    learned_positions: bool,

    #[arg(short, long)]
    steps: Option<usize>,

    #[arg(short, long)]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f32>,

    #[arg(long)]
    seed: Option<u64>,

    /// share of the text held out for evaluation
    #[arg(long, default_value_t = 0.1)]
    eval_fraction: f32,

    /// continue from the latest checkpoint in `out_dir`
    #[arg(long)]
    resume: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nanolm=info,nanolm_train=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut model_conf = match &args.model_config {
        Some(path) => ModelConfig::from_json_file(path)?,
        None => ModelConfig::default(),
    };
    model_conf.vocab_size = ByteTokenizer::VOCAB_SIZE;
    if let Some(dim) = args.dim {
        model_conf.dim = dim;
        model_conf.hidden_dim = 4 * dim;
    }
    if let Some(n_layers) = args.n_layers {
        model_conf.n_layers = n_layers;
    }
    if let Some(n_heads) = args.n_heads {
        model_conf.n_heads = n_heads;
        model_conf.n_kv_heads = n_heads;
    }
    if let Some(seq_len) = args.seq_len {
        model_conf.seq_len = seq_len;
    }
    if args.learned_positions {
        model_conf.position = PositionEncoding::Learned;
    }

    let mut train_conf = match &args.train_config {
        Some(path) => TrainConfig::from_json_file(path)?,
        None => TrainConfig::default(),
    };
    if let Some(steps) = args.steps {
        train_conf.max_steps = steps;
        train_conf.decay_steps = steps;
        train_conf.warmup_steps = train_conf.warmup_steps.min(steps);
    }
    if let Some(batch_size) = args.batch_size {
        train_conf.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        train_conf.peak_lr = lr;
        train_conf.min_lr = train_conf.min_lr.min(lr);
    }
    if let Some(seed) = args.seed {
        train_conf.seed = seed;
    }

    let text = std::fs::read_to_string(&args.data)
        .with_context(|| format!("reading {}", args.data.display()))?;
    let tokens = ByteTokenizer.encode(&text);
    let split = ((tokens.len() as f32) * (1.0 - args.eval_fraction.clamp(0.0, 1.0))) as usize;
    let (train_tokens, eval_tokens) = tokens.split_at(split);

    let store = FileCheckpointStore::new(&args.out_dir)?;
    let mut trainer = match store.latest()?.filter(|_| args.resume) {
        Some(handle) => {
            info!(step = handle.step, path = %handle.path.display(), "resuming");
            Trainer::resume(store.load(&handle)?, train_conf.clone())?
        }
        None => Trainer::new(Transformer::new(model_conf, train_conf.seed)?, train_conf.clone())?,
    };
    let seq_len = trainer.model().config().seq_len;

    let train = DataLoader::new(
        TokenWindows::new(train_tokens.to_vec(), seq_len)?,
        train_conf.batch_size,
    )
    .shuffle(train_conf.seed)
    .drop_last(true);
    if train.num_batches() == 0 {
        bail!(
            "{} training tokens do not fill one batch of {} x {}",
            train_tokens.len(),
            train_conf.batch_size,
            seq_len
        );
    }
    let eval = DataLoader::new(
        TokenWindows::new(eval_tokens.to_vec(), seq_len)?,
        train_conf.batch_size,
    );
    let eval = (eval.num_batches() > 0).then_some(&eval);

    let summary = trainer.fit(&train, eval, &store)?;
    if let Some(last) = summary.last {
        info!(step = last.step, loss = last.loss, best_eval_loss = summary.best_eval_loss, "done");
    }
    Ok(())
}
