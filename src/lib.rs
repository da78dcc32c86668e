//! A small decoder-only transformer language model on the CPU: training with
//! manual backward passes and AdamW, and cached autoregressive decoding.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod generate;
pub mod kv_cache;
pub mod loss;
pub mod model;
pub mod operator;
pub mod optim;
pub mod params;
pub mod sampler;
pub mod schedule;
pub mod tensor;
pub mod tokenizer;
pub mod train;

mod error;

pub use checkpoint::{Checkpoint, CheckpointHandle, CheckpointStore, FileCheckpointStore};
pub use config::{ModelConfig, NonFinitePolicy, PositionEncoding, TrainConfig};
pub use data::{Batch, DataLoader, Dataset, Sample, TokenWindows};
pub use error::{LmError, Result};
pub use generate::{generate, start_session, Session, StopReason};
pub use kv_cache::KvCache;
pub use model::Transformer;
pub use sampler::{Sampler, SamplingPolicy};
pub use tokenizer::{ByteTokenizer, Tokenizer};
pub use train::{StepStats, TrainState, Trainer};
