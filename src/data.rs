//! Training examples and batching.

use std::sync::Arc;

use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};

use crate::{LmError, Result};

/// One sequence: input ids and, per position, the id that should follow.
/// `None` targets are padding and are left out of the loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub input: Vec<usize>,
    pub target: Vec<Option<usize>>,
}

impl Sample {
    pub fn new(input: Vec<usize>, target: Vec<Option<usize>>) -> Result<Self> {
        if input.len() != target.len() {
            return Err(LmError::Shape(format!(
                "{} input ids but {} targets",
                input.len(),
                target.len()
            )));
        }
        Ok(Self { input, target })
    }

    /// Next-token sample from a run of ids: input `tokens[..n-1]`, target `tokens[1..]`.
    pub fn from_tokens(tokens: &[usize]) -> Result<Self> {
        if tokens.len() < 2 {
            return Err(LmError::Shape(
                "a next-token sample needs at least two ids".into(),
            ));
        }
        let n = tokens.len() - 1;
        Ok(Self {
            input: tokens[..n].to_vec(),
            target: tokens[1..].iter().copied().map(Some).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Positions that contribute to the loss.
    pub fn num_targets(&self) -> usize {
        self.target.iter().flatten().count()
    }
}

/// Sequences processed together in one forward/backward micro-batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub samples: Vec<Sample>,
}

impl Batch {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_targets(&self) -> usize {
        self.samples.iter().map(Sample::num_targets).sum()
    }

    pub fn num_tokens(&self) -> usize {
        self.samples.iter().map(Sample::len).sum()
    }
}

/// Index-addressed collection of samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at `index`; `index < len()`.
    fn get(&self, index: usize) -> Sample;
}

impl Dataset for Vec<Sample> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn get(&self, index: usize) -> Sample {
        self[index].clone()
    }
}

/// Fixed-length next-token windows over one token stream.
#[derive(Debug, Clone)]
pub struct TokenWindows {
    tokens: Arc<[usize]>,
    seq_len: usize,
    stride: usize,
}

impl TokenWindows {
    /// Non-overlapping windows of `seq_len` inputs.
    pub fn new(tokens: impl Into<Arc<[usize]>>, seq_len: usize) -> Result<Self> {
        if seq_len == 0 {
            return Err(LmError::Configuration("window length must be positive".into()));
        }
        Ok(Self {
            tokens: tokens.into(),
            seq_len,
            stride: seq_len,
        })
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride.max(1);
        self
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }
}

impl Dataset for TokenWindows {
    fn len(&self) -> usize {
        // each window needs seq_len inputs plus the final target
        match self.tokens.len().checked_sub(self.seq_len + 1) {
            Some(rest) => rest / self.stride + 1,
            None => 0,
        }
    }

    fn get(&self, index: usize) -> Sample {
        let start = index * self.stride;
        let window = &self.tokens[start..start + self.seq_len + 1];
        Sample {
            input: window[..self.seq_len].to_vec(),
            target: window[1..].iter().copied().map(Some).collect(),
        }
    }
}

/// Groups dataset samples into batches, optionally shuffled per epoch.
#[derive(Clone)]
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    drop_last: bool,
}

impl DataLoader {
    pub fn new(dataset: impl Dataset + 'static, batch_size: usize) -> Self {
        Self {
            dataset: Arc::new(dataset),
            batch_size: batch_size.max(1),
            shuffle_seed: None,
            drop_last: false,
        }
    }

    /// Shuffles every epoch with a generator seeded from `seed` and the epoch number.
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn dataset(&self) -> &dyn Dataset {
        self.dataset.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        let len = self.dataset.len();
        if self.drop_last {
            len / self.batch_size
        } else {
            len.div_ceil(self.batch_size)
        }
    }

    pub fn iter(&self) -> DataLoaderIter {
        self.epoch(0)
    }

    /// Batches of one pass over the dataset.
    pub fn epoch(&self, epoch: u64) -> DataLoaderIter {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(epoch));
            indices.shuffle(&mut rng);
        }
        DataLoaderIter {
            dataset: Arc::clone(&self.dataset),
            indices,
            batch_size: self.batch_size,
            current: 0,
            drop_last: self.drop_last,
        }
    }

    /// Endless stream of batches, epoch after epoch. Empty when no full batch exists.
    pub fn cycle(&self) -> impl Iterator<Item = Batch> + '_ {
        let has_batches = self.num_batches() > 0;
        (0..)
            .take_while(move |_| has_batches)
            .flat_map(move |epoch| self.epoch(epoch))
    }
}

pub struct DataLoaderIter {
    dataset: Arc<dyn Dataset>,
    indices: Vec<usize>,
    batch_size: usize,
    current: usize,
    drop_last: bool,
}

impl Iterator for DataLoaderIter {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.indices.len() - self.current;
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }
        let take = remaining.min(self.batch_size);
        let samples = self.indices[self.current..self.current + take]
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect();
        self.current += take;
        Some(Batch::new(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_shift_targets_by_one() {
        let windows = TokenWindows::new((0..10).collect::<Vec<_>>(), 4).unwrap();
        assert_eq!(windows.len(), 2);
        let s = windows.get(1);
        assert_eq!(s.input, vec![4, 5, 6, 7]);
        assert_eq!(s.target, vec![Some(5), Some(6), Some(7), Some(8)]);
    }

    #[test]
    fn strided_windows_overlap() {
        let windows = TokenWindows::new((0..10).collect::<Vec<_>>(), 4)
            .unwrap()
            .with_stride(1);
        assert_eq!(windows.len(), 6);
        assert_eq!(windows.get(5).input, vec![5, 6, 7, 8]);
    }

    #[test]
    fn short_stream_has_no_windows() {
        let windows = TokenWindows::new(vec![1, 2, 3], 3).unwrap();
        assert!(windows.is_empty());
    }

    #[test]
    fn sample_lengths_must_agree() {
        assert!(Sample::new(vec![1, 2], vec![Some(2)]).is_err());
        let s = Sample::new(vec![1, 2], vec![Some(2), None]).unwrap();
        assert_eq!(s.num_targets(), 1);
    }

    fn samples(n: usize) -> Vec<Sample> {
        (0..n).map(|i| Sample::from_tokens(&[i, i + 1]).unwrap()).collect()
    }

    #[test]
    fn loader_keeps_the_tail_unless_dropped() {
        let loader = DataLoader::new(samples(5), 2);
        let sizes: Vec<usize> = loader.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let loader = loader.drop_last(true);
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(loader.iter().count(), 2);
    }

    #[test]
    fn shuffle_is_seeded_and_a_permutation() {
        let order = |seed| -> Vec<usize> {
            DataLoader::new(samples(16), 16)
                .shuffle(seed)
                .iter()
                .flat_map(|b| b.samples)
                .map(|s| s.input[0])
                .collect()
        };
        assert_eq!(order(3), order(3));
        let mut sorted = order(3);
        sorted.sort_unstable();
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn cycle_runs_past_one_epoch() {
        let loader = DataLoader::new(samples(3), 2).drop_last(true);
        assert_eq!(loader.cycle().take(5).count(), 5);
        let empty = DataLoader::new(samples(1), 2).drop_last(true);
        assert_eq!(empty.cycle().count(), 0);
    }
}
