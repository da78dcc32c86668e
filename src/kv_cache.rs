use crate::{config::ModelConfig, tensor::Tensor, LmError, Result};

/// Keys and values of every layer for the positions seen so far.
///
/// Storage is allocated once for `capacity` positions; `len` is the live length.
/// Rows for a forward pass are written layer by layer and only become part of
/// the live length once [`KvCache::advance`] runs after the last layer.
#[derive(Debug, Clone)]
pub struct KvCache {
    /// (layer, capacity, kv_dim)
    key_cache: Tensor,
    /// (layer, capacity, kv_dim)
    value_cache: Tensor,
    n_layers: usize,
    capacity: usize,
    kv_dim: usize,
    len: usize,
}

impl KvCache {
    /// Cache spanning the full context length of `conf`.
    pub fn new(conf: &ModelConfig) -> Self {
        Self::with_capacity(conf, conf.seq_len)
    }

    /// Cache for at most `capacity` positions (clamped to the context length).
    pub fn with_capacity(conf: &ModelConfig, capacity: usize) -> Self {
        let capacity = capacity.min(conf.seq_len);
        let kv_dim = conf.kv_dim();
        Self {
            key_cache: Tensor::new(&[conf.n_layers, capacity, kv_dim]),
            value_cache: Tensor::new(&[conf.n_layers, capacity, kv_dim]),
            n_layers: conf.n_layers,
            capacity,
            kv_dim,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fails unless the cache was laid out for a model shaped like `conf`.
    pub fn check_layout(&self, conf: &ModelConfig) -> Result<()> {
        if self.n_layers != conf.n_layers || self.kv_dim != conf.kv_dim() {
            return Err(LmError::Shape(format!(
                "cache holds {} layers of width {}, model has {} layers of width {}",
                self.n_layers,
                self.kv_dim,
                conf.n_layers,
                conf.kv_dim()
            )));
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    /// Fails unless `n` more positions fit.
    pub fn reserve(&self, n: usize) -> Result<()> {
        if self.len + n > self.capacity {
            return Err(LmError::CacheExhausted {
                len: self.len + n,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn offset(&self, layer: usize, pos: usize) -> usize {
        (layer * self.capacity + pos) * self.kv_dim
    }

    pub(crate) fn write(&mut self, layer: usize, pos: usize, k: &[f32], v: &[f32]) {
        debug_assert!(pos < self.capacity);
        debug_assert!(pos >= self.len, "cached positions are never rewritten");
        let off = self.offset(layer, pos);
        self.key_cache.as_mut_slice()[off..off + self.kv_dim].copy_from_slice(k);
        self.value_cache.as_mut_slice()[off..off + self.kv_dim].copy_from_slice(v);
    }

    /// Keys of positions `0..upto` for `layer`, as (upto, kv_dim).
    pub fn keys(&self, layer: usize, upto: usize) -> &[f32] {
        let off = self.offset(layer, 0);
        &self.key_cache.as_slice()[off..off + upto * self.kv_dim]
    }

    /// Values of positions `0..upto` for `layer`, as (upto, kv_dim).
    pub fn values(&self, layer: usize, upto: usize) -> &[f32] {
        let off = self.offset(layer, 0);
        &self.value_cache.as_slice()[off..off + upto * self.kv_dim]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.capacity);
        self.len += n;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> ModelConfig {
        ModelConfig::new(8, 2, 2, 16, 4)
    }

    #[test]
    fn capacity_is_bounded_by_context() {
        let cache = KvCache::with_capacity(&conf(), 100);
        assert_eq!(cache.capacity(), 4);
        assert!(cache.is_empty());
    }

    #[test]
    fn reserve_beyond_capacity_is_an_error() {
        let mut cache = KvCache::new(&conf());
        assert!(cache.reserve(4).is_ok());
        cache.advance(3);
        assert!(matches!(
            cache.reserve(2),
            Err(LmError::CacheExhausted { len: 5, capacity: 4 })
        ));
        assert_eq!(cache.remaining(), 1);
    }

    #[test]
    fn layout_must_match_the_model() {
        let cache = KvCache::new(&conf());
        assert!(cache.check_layout(&conf()).is_ok());
        assert!(matches!(
            cache.check_layout(&ModelConfig::new(8, 3, 2, 16, 4)),
            Err(LmError::Shape(_))
        ));
        let gqa = ModelConfig {
            n_kv_heads: 1,
            ..conf()
        };
        assert!(matches!(cache.check_layout(&gqa), Err(LmError::Shape(_))));
    }

    #[test]
    fn rows_are_kept_per_layer() {
        let mut cache = KvCache::new(&conf());
        cache.write(0, 0, &[1.0; 8], &[2.0; 8]);
        cache.write(1, 0, &[3.0; 8], &[4.0; 8]);
        cache.write(1, 1, &[5.0; 8], &[6.0; 8]);
        cache.advance(2);
        assert_eq!(cache.keys(1, 2)[..8], [3.0; 8]);
        assert_eq!(cache.values(1, 2)[8..], [6.0; 8]);
        assert_eq!(cache.keys(0, 1), &[1.0; 8]);
    }
}
