use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nanolm::{start_session, ByteTokenizer, Checkpoint, SamplingPolicy, Tokenizer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate text from a trained checkpoint", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "checkpoints/best.ckpt")]
    checkpoint: PathBuf,

    #[arg(short, long, default_value = "\n")]
    prompt: String,

    /// new tokens, 0 means up to the context length
    #[arg(short, long, default_value_t = 256)]
    steps: usize,

    /// [0, inf)
    #[arg(short = 'T', long, default_value_t = 0.0)]
    temperature: f32,

    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// (0, 1]
    #[arg(short = 'P', long)]
    top_p: Option<f32>,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nanolm=info,nanolm_generate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let model = Checkpoint::load(&args.checkpoint)?.to_model()?;
    info!(
        parameters = model.num_parameters(),
        path = %args.checkpoint.display(),
        "loaded model"
    );

    let tokenizer = ByteTokenizer;
    let prompt = tokenizer.encode(&args.prompt);
    let seq_len = model.config().seq_len;
    let steps = if args.steps == 0 || args.steps > seq_len {
        seq_len
    } else {
        args.steps
    };
    let policy = SamplingPolicy {
        temperature: args.temperature,
        top_k: args.top_k,
        top_p: args.top_p,
        seed: args.seed,
    };

    let mut session = start_session(&model, &prompt, steps, policy)?.with_eos(tokenizer.eos_id());
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{}", args.prompt)?;

    // ids whose bytes do not yet form complete characters
    let mut pending = Vec::new();
    for token in session.by_ref() {
        pending.push(token?);
        let (text, used) = tokenizer.decode_prefix(&pending)?;
        write!(stdout, "{text}")?;
        stdout.flush()?;
        pending.drain(..used);
    }
    writeln!(stdout)?;

    info!(
        generated = session.generated().len(),
        reason = ?session.stop_reason(),
        "finished"
    );
    Ok(())
}
