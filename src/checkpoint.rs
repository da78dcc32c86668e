//! Training snapshots and their on-disk store.
//!
//! File layout, all integers little-endian:
//!
//! ```text
//! "NANOLM_CKPT" | version u8 | header len u32 | header json
//! | tensor count u32
//! | per parameter: name len u32, name, rank u32, dims u32.., f32 values
//! | per parameter: first moment f32 values, second moment f32 values
//! | "END_CKPT"
//! ```
//!
//! Files are written to a temporary name, synced and then renamed, so a reader
//! only ever sees complete files. Anything that ends before the trailer is rejected.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::ModelConfig, model::Transformer, optim::OptimizerState, tensor::Tensor, LmError,
    Result,
};

const MAGIC: &[u8] = b"NANOLM_CKPT";
const TRAILER: &[u8] = b"END_CKPT";
const VERSION: u8 = 1;
const MAX_NAME_LEN: usize = 1 << 12;
const MAX_RANK: usize = 8;

/// Parameters, optimizer state and progress counters of one training step.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub config: ModelConfig,
    pub step: usize,
    pub best_eval_loss: Option<f32>,
    /// in registration order
    pub params: Vec<(String, Tensor)>,
    pub optimizer: OptimizerState,
}

#[derive(Serialize, Deserialize)]
struct Header {
    config: ModelConfig,
    step: usize,
    best_eval_loss: Option<f32>,
    optimizer_step: u64,
}

impl Checkpoint {
    /// Rebuilds the model stored in this checkpoint.
    pub fn to_model(&self) -> Result<Transformer> {
        Transformer::from_parameters(self.config.clone(), self.params.clone())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let header = serde_json::to_vec(&Header {
            config: self.config.clone(),
            step: self.step,
            best_eval_loss: self.best_eval_loss,
            optimizer_step: self.optimizer.step,
        })?;
        w.write_all(MAGIC)?;
        w.write_all(&[VERSION])?;
        write_u32(w, header.len())?;
        w.write_all(&header)?;

        write_u32(w, self.params.len())?;
        for (name, tensor) in &self.params {
            write_u32(w, name.len())?;
            w.write_all(name.as_bytes())?;
            write_u32(w, tensor.ndim())?;
            for &dim in tensor.shape() {
                write_u32(w, dim)?;
            }
            write_values(w, tensor)?;
        }
        for (m, v) in self.optimizer.m.iter().zip(&self.optimizer.v) {
            write_values(w, m)?;
            write_values(w, v)?;
        }
        w.write_all(TRAILER)?;
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        if r.take(MAGIC.len())? != MAGIC {
            return Err(LmError::Checkpoint("not a checkpoint file".into()));
        }
        let version = r.take(1)?[0];
        if version != VERSION {
            return Err(LmError::Checkpoint(format!(
                "unsupported version {version}, expected {VERSION}"
            )));
        }
        let header_len = r.u32()?;
        let header: Header = serde_json::from_slice(r.take(header_len)?)?;

        let count = r.u32()?;
        let mut params = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let name_len = r.u32()?;
            if name_len > MAX_NAME_LEN {
                return Err(LmError::Checkpoint(format!("tensor name of {name_len} bytes")));
            }
            let name = String::from_utf8(r.take(name_len)?.to_vec())
                .map_err(|_| LmError::Checkpoint("tensor name is not utf-8".into()))?;
            let rank = r.u32()?;
            if rank > MAX_RANK {
                return Err(LmError::Checkpoint(format!("{name} has rank {rank}")));
            }
            let shape = (0..rank).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
            let tensor = r.tensor(&shape)?;
            params.push((name, tensor));
        }

        let mut m = Vec::with_capacity(params.len());
        let mut v = Vec::with_capacity(params.len());
        for (_, p) in &params {
            m.push(r.tensor(p.shape())?);
            v.push(r.tensor(p.shape())?);
        }
        if r.take(TRAILER.len())? != TRAILER || !r.is_done() {
            return Err(LmError::Checkpoint("missing end marker".into()));
        }

        Ok(Self {
            config: header.config,
            step: header.step,
            best_eval_loss: header.best_eval_loss,
            params,
            optimizer: OptimizerState {
                m,
                v,
                step: header.optimizer_step,
            },
        })
    }

    /// Writes `path` atomically: temp file, fsync, rename, then fsync of the
    /// parent directory. A failed save leaves no temp file behind.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let written = self
            .write_synced(&tmp)
            .and_then(|()| fs::rename(&tmp, path).map_err(LmError::from));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                debug!(path = %tmp.display(), %cleanup, "temp checkpoint not removed");
            }
            return Err(e);
        }
        sync_parent(path)
    }

    fn write_synced(&self, tmp: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(tmp)?);
        self.write_to(&mut w)?;
        let file = w.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Writes on a separate thread; the join handle yields the write result.
    pub fn save_background(self, path: PathBuf) -> JoinHandle<Result<()>> {
        thread::spawn(move || self.save(path))
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}

fn write_u32<W: Write>(w: &mut W, value: usize) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| LmError::Checkpoint(format!("{value} does not fit in 32 bits")))?;
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_values<W: Write>(w: &mut W, tensor: &Tensor) -> Result<()> {
    for v in tensor.iter() {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| LmError::Checkpoint("file is truncated".into()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<usize> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf) as usize)
    }

    fn tensor(&mut self, shape: &[usize]) -> Result<Tensor> {
        let numel = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| LmError::Checkpoint(format!("shape {shape:?} overflows")))?;
        let data = self
            .take(numel)?
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Tensor::from_vec(data, shape)
    }

    fn is_done(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

/// Where a saved checkpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHandle {
    pub step: usize,
    pub path: PathBuf,
}

/// Persists checkpoints. Saves are atomic: a handle is only returned for a
/// complete, loadable checkpoint.
pub trait CheckpointStore {
    /// Periodic checkpoint of `checkpoint.step`.
    fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointHandle>;

    /// Checkpoint with the best evaluation loss so far.
    fn save_best(&self, checkpoint: &Checkpoint) -> Result<CheckpointHandle>;

    fn load(&self, handle: &CheckpointHandle) -> Result<Checkpoint>;

    /// Most recent periodic checkpoint, if any.
    fn latest(&self) -> Result<Option<CheckpointHandle>>;
}

/// Checkpoints as `step-{N:08}.ckpt` files plus `best.ckpt` in one directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn step_path(&self, step: usize) -> PathBuf {
        self.dir.join(format!("step-{step:08}.ckpt"))
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join("best.ckpt")
    }
}

fn parse_step(name: &str) -> Option<usize> {
    name.strip_prefix("step-")?.strip_suffix(".ckpt")?.parse().ok()
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointHandle> {
        let path = self.step_path(checkpoint.step);
        checkpoint.save(&path)?;
        info!(step = checkpoint.step, path = %path.display(), "saved checkpoint");
        Ok(CheckpointHandle {
            step: checkpoint.step,
            path,
        })
    }

    fn save_best(&self, checkpoint: &Checkpoint) -> Result<CheckpointHandle> {
        let path = self.best_path();
        checkpoint.save(&path)?;
        info!(
            step = checkpoint.step,
            eval_loss = checkpoint.best_eval_loss,
            "saved best checkpoint"
        );
        Ok(CheckpointHandle {
            step: checkpoint.step,
            path,
        })
    }

    fn load(&self, handle: &CheckpointHandle) -> Result<Checkpoint> {
        Checkpoint::load(&handle.path)
    }

    fn latest(&self) -> Result<Option<CheckpointHandle>> {
        let mut latest: Option<CheckpointHandle> = None;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(step) = path.file_name().and_then(|n| n.to_str()).and_then(parse_step) else {
                continue;
            };
            if latest.as_ref().map_or(true, |h| step > h.step) {
                latest = Some(CheckpointHandle { step, path });
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(step: usize) -> Checkpoint {
        let model = Transformer::new(ModelConfig::new(8, 1, 2, 12, 4), 1).unwrap();
        let mut optimizer = OptimizerState::zeros_like(model.params());
        optimizer.step = step as u64;
        optimizer.m[0].fill(0.25);
        Checkpoint {
            config: model.config().clone(),
            step,
            best_eval_loss: Some(2.5),
            params: model
                .params()
                .iter()
                .map(|(name, t)| (name.to_string(), t.clone()))
                .collect(),
            optimizer,
        }
    }

    #[test]
    fn bytes_round_trip_exactly() {
        let ckpt = checkpoint(7);
        let mut bytes = Vec::new();
        ckpt.write_to(&mut bytes).unwrap();
        assert_eq!(Checkpoint::from_bytes(&bytes).unwrap(), ckpt);
    }

    #[test]
    fn every_truncation_is_rejected() {
        let mut bytes = Vec::new();
        checkpoint(1).write_to(&mut bytes).unwrap();
        for len in (0..bytes.len()).step_by(97).chain([bytes.len() - 1]) {
            assert!(matches!(
                Checkpoint::from_bytes(&bytes[..len]),
                Err(LmError::Checkpoint(_)) | Err(LmError::Json(_))
            ));
        }
    }

    #[test]
    fn wrong_magic_and_version_are_rejected() {
        let mut bytes = Vec::new();
        checkpoint(1).write_to(&mut bytes).unwrap();
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(Checkpoint::from_bytes(&bad), Err(LmError::Checkpoint(_))));
        bad = bytes;
        bad[MAGIC.len()] = VERSION + 1;
        assert!(matches!(Checkpoint::from_bytes(&bad), Err(LmError::Checkpoint(_))));
    }

    #[test]
    fn latest_picks_the_highest_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        assert_eq!(store.latest().unwrap(), None);
        store.save(&checkpoint(20)).unwrap();
        store.save(&checkpoint(100)).unwrap();
        store.save_best(&checkpoint(5)).unwrap();
        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.step, 100);
        assert_eq!(store.load(&latest).unwrap().step, 100);
        assert!(!dir.path().join("step-00000100.tmp").exists());
    }

    #[test]
    fn failed_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("taken.ckpt");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("inside"), b"x").unwrap();
        assert!(checkpoint(2).save(&target).is_err());
        assert!(!dir.path().join("taken.tmp").exists());
        assert!(target.is_dir());
    }

    #[test]
    fn background_save_is_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg.ckpt");
        let ckpt = checkpoint(3);
        ckpt.clone().save_background(path.clone()).join().unwrap().unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap(), ckpt);
    }
}
