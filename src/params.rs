//! Named parameter storage and the matching gradient buffers.
//!
//! Model blocks keep [`ParamId`] handles instead of owning tensors, so one tensor
//! can serve several roles (tied embeddings) and the optimizer, clipping and
//! checkpointing all walk a single flat list.

use std::ops::{Index, IndexMut};

use rayon::prelude::*;

use crate::{tensor::Tensor, LmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    names: Vec<String>,
    tensors: Vec<Tensor>,
}

impl Index<ParamId> for Parameters {
    type Output = Tensor;

    fn index(&self, id: ParamId) -> &Self::Output {
        &self.tensors[id.0]
    }
}

impl IndexMut<ParamId> for Parameters {
    fn index_mut(&mut self, id: ParamId) -> &mut Self::Output {
        &mut self.tensors[id.0]
    }
}

impl Parameters {
    pub fn register(&mut self, name: impl Into<String>, tensor: Tensor) -> ParamId {
        self.names.push(name.into());
        self.tensors.push(tensor);
        ParamId(self.tensors.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn name(&self, id: ParamId) -> &str {
        &self.names[id.0]
    }

    pub fn find(&self, name: &str) -> Option<ParamId> {
        self.names.iter().position(|n| n == name).map(ParamId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.names.iter().map(String::as_str).zip(self.tensors.iter())
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut [Tensor] {
        &mut self.tensors
    }

    /// Total scalar count.
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(Tensor::numel).sum()
    }

    /// Replaces every tensor with the one of the same name in `loaded`.
    /// Names, order and shapes must all match the registered layout.
    pub fn replace_all(&mut self, loaded: Vec<(String, Tensor)>) -> Result<()> {
        if loaded.len() != self.tensors.len() {
            return Err(LmError::Shape(format!(
                "expected {} parameter tensors, got {}",
                self.tensors.len(),
                loaded.len()
            )));
        }
        for ((name, slot), (loaded_name, tensor)) in
            self.names.iter().zip(self.tensors.iter_mut()).zip(loaded)
        {
            if *name != loaded_name {
                return Err(LmError::Shape(format!(
                    "expected parameter {name}, found {loaded_name}"
                )));
            }
            tensor.expect_shape(slot.shape(), name)?;
            *slot = tensor;
        }
        Ok(())
    }
}

/// One gradient tensor per parameter, same shapes and order.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    tensors: Vec<Tensor>,
}

impl Index<ParamId> for Gradients {
    type Output = Tensor;

    fn index(&self, id: ParamId) -> &Self::Output {
        &self.tensors[id.0]
    }
}

impl IndexMut<ParamId> for Gradients {
    fn index_mut(&mut self, id: ParamId) -> &mut Self::Output {
        &mut self.tensors[id.0]
    }
}

impl Gradients {
    pub fn zeros_like(params: &Parameters) -> Self {
        Self {
            tensors: params.tensors.iter().map(Tensor::zeros_like).collect(),
        }
    }

    /// Two distinct gradient tensors borrowed mutably at once.
    pub fn pair_mut(&mut self, a: ParamId, b: ParamId) -> (&mut Tensor, &mut Tensor) {
        assert_ne!(a, b, "pair_mut needs two distinct parameters");
        if a.0 < b.0 {
            let (lo, hi) = self.tensors.split_at_mut(b.0);
            (&mut lo[a.0], &mut hi[0])
        } else {
            let (lo, hi) = self.tensors.split_at_mut(a.0);
            (&mut hi[0], &mut lo[b.0])
        }
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut [Tensor] {
        &mut self.tensors
    }

    pub fn zero(&mut self) {
        self.tensors.iter_mut().for_each(|t| t.fill(0.0));
    }

    /// self += other
    pub fn accumulate(&mut self, other: &Gradients) {
        debug_assert_eq!(self.tensors.len(), other.tensors.len());
        self.tensors
            .par_iter_mut()
            .zip(other.tensors.par_iter())
            .for_each(|(a, b)| crate::operator::add_inplace(a, b));
    }

    pub fn scale(&mut self, factor: f32) {
        self.tensors
            .par_iter_mut()
            .for_each(|t| t.iter_mut().for_each(|v| *v *= factor));
    }

    /// L2 norm over every gradient element.
    pub fn global_norm(&self) -> f32 {
        self.tensors
            .par_iter()
            .map(|t| t.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>())
            .sum::<f64>()
            .sqrt() as f32
    }

    /// Rescales all gradients so the global norm is at most `max_norm`.
    /// Returns the norm before clipping. `max_norm <= 0` disables clipping.
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        if max_norm > 0.0 && norm > max_norm {
            self.scale(max_norm / norm);
        }
        norm
    }

    pub fn is_finite(&self) -> bool {
        self.tensors.iter().all(Tensor::is_finite)
    }
}
