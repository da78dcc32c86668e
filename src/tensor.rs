use std::ops::{Deref, DerefMut, Index, IndexMut};

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::{LmError, Result};

pub type Float = f32;

/// A dense row-major buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<Float>,
    // from outer to inner: ..., row, col
    shape: Vec<usize>,
}

impl Deref for Tensor {
    type Target = [Float];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Tensor {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

/// Rows of the innermost dimension; rank-1 tensors are a single row.
impl Index<usize> for Tensor {
    type Output = [Float];

    fn index(&self, index: usize) -> &Self::Output {
        let cols = self.cols();
        debug_assert!(index < self.rows());
        &self.data[index * cols..(index + 1) * cols]
    }
}

impl IndexMut<usize> for Tensor {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        let cols = self.cols();
        debug_assert!(index < self.rows());
        &mut self.data[index * cols..(index + 1) * cols]
    }
}

impl Tensor {
    /// Zero-filled tensor.
    pub fn new(shape: &[usize]) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: &[usize], value: Float) -> Self {
        Self {
            data: vec![value; shape.iter().product()],
            shape: shape.to_vec(),
        }
    }

    pub fn from_vec(data: Vec<Float>, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(LmError::Shape(format!(
                "{} values cannot fill shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
        })
    }

    /// Gaussian init with mean 0.
    pub fn randn<R: Rng>(shape: &[usize], std: Float, rng: &mut R) -> Self {
        let data = (0..shape.iter().product::<usize>())
            .map(|_| {
                let z: Float = StandardNormal.sample(rng);
                z * std
            })
            .collect();
        Self {
            data,
            shape: shape.to_vec(),
        }
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self::new(&other.shape)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn cols(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    pub fn rows(&self) -> usize {
        self.data.len() / self.cols().max(1)
    }

    pub fn as_slice(&self) -> &[Float] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [Float] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<Float> {
        self.data
    }

    pub fn fill(&mut self, value: Float) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Fails with a shape error unless `self` has exactly `shape`.
    pub fn expect_shape(&self, shape: &[usize], what: &str) -> Result<()> {
        if self.shape != shape {
            return Err(LmError::Shape(format!(
                "{what}: expected {:?}, got {:?}",
                shape, self.shape
            )));
        }
        Ok(())
    }
}
