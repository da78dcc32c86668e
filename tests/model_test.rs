use nanolm::{KvCache, LmError, ModelConfig, PositionEncoding, Transformer};

fn config(position: PositionEncoding) -> ModelConfig {
    ModelConfig {
        position,
        ..ModelConfig::new(8, 2, 2, 16, 12)
    }
}

fn max_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

#[test]
fn tiny_model_produces_finite_logits() {
    let model = Transformer::new(config(PositionEncoding::Rotary), 0).unwrap();
    let logits = model.forward(&[3, 1, 4]).unwrap();
    assert_eq!(logits.shape(), &[3, 16]);
    assert!(logits.is_finite());
}

#[test]
fn width_not_divisible_by_heads_is_a_configuration_error() {
    let conf = ModelConfig::new(10, 2, 4, 16, 12);
    assert!(matches!(
        Transformer::new(conf, 0),
        Err(LmError::Configuration(_))
    ));
}

#[test]
fn later_tokens_do_not_change_earlier_outputs() {
    for position in [PositionEncoding::Rotary, PositionEncoding::Learned] {
        let model = Transformer::new(config(position), 1).unwrap();
        let a = model.forward(&[5, 9, 2, 7, 7, 1]).unwrap();
        let b = model.forward(&[5, 9, 2, 0, 15, 3]).unwrap();
        for i in 0..3 {
            assert!(max_diff(&a[i], &b[i]) <= 1e-6, "{position:?} row {i}");
        }
        assert!(max_diff(&a[3], &b[3]) > 0.0);
    }
}

#[test]
fn prefill_then_decode_matches_full_forward() {
    for position in [PositionEncoding::Rotary, PositionEncoding::Learned] {
        let model = Transformer::new(config(position), 2).unwrap();
        let tokens = [4, 8, 15, 1, 6, 2];
        let full = model.forward(&tokens).unwrap();

        let mut cache = KvCache::new(model.config());
        let prefill = model.forward_cached(&tokens[..4], &mut cache).unwrap();
        assert_eq!(cache.len(), 4);
        for i in 0..4 {
            assert!(max_diff(&prefill[i], &full[i]) < 1e-5);
        }
        for (pos, &token) in tokens.iter().enumerate().skip(4) {
            let step = model.forward_cached(&[token], &mut cache).unwrap();
            assert_eq!(step.shape(), &[1, 16]);
            assert!(max_diff(&step[0], &full[pos]) < 1e-5, "{position:?} pos {pos}");
        }
        assert_eq!(cache.len(), tokens.len());
    }
}

#[test]
fn grouped_query_attention_decodes_consistently() {
    let conf = ModelConfig {
        n_kv_heads: 1,
        ..ModelConfig::new(8, 1, 4, 16, 8)
    };
    let model = Transformer::new(conf, 3).unwrap();
    let full = model.forward(&[1, 2, 3]).unwrap();
    let mut cache = KvCache::new(model.config());
    model.forward_cached(&[1, 2], &mut cache).unwrap();
    let last = model.forward_cached(&[3], &mut cache).unwrap();
    assert!(max_diff(&last[0], &full[2]) < 1e-5);
}

#[test]
fn sequence_longer_than_context_is_rejected_not_truncated() {
    let model = Transformer::new(config(PositionEncoding::Rotary), 0).unwrap();
    assert!(matches!(
        model.forward(&[1; 13]),
        Err(LmError::SequenceTooLong { len: 13, max: 12 })
    ));

    let mut cache = KvCache::new(model.config());
    model.forward_cached(&[1; 12], &mut cache).unwrap();
    assert!(matches!(
        model.forward_cached(&[1], &mut cache),
        Err(LmError::SequenceTooLong { len: 13, max: 12 })
    ));
    assert_eq!(cache.len(), 12);
}

#[test]
fn cache_built_for_another_model_is_a_shape_error() {
    let model = Transformer::new(config(PositionEncoding::Rotary), 0).unwrap();
    let mut cache = KvCache::new(&ModelConfig::new(8, 1, 2, 16, 12));
    assert!(matches!(model.forward_cached(&[1, 2], &mut cache), Err(LmError::Shape(_))));
    assert!(cache.is_empty());
}

#[test]
fn small_cache_reports_exhaustion() {
    let model = Transformer::new(config(PositionEncoding::Rotary), 0).unwrap();
    let mut cache = KvCache::with_capacity(model.config(), 2);
    model.forward_cached(&[1, 2], &mut cache).unwrap();
    assert!(matches!(
        model.forward_cached(&[3], &mut cache),
        Err(LmError::CacheExhausted { len: 3, capacity: 2 })
    ));
}

#[test]
fn parameter_count_reflects_weight_tying() {
    let tied = Transformer::new(config(PositionEncoding::Rotary), 0).unwrap();
    let untied = Transformer::new(
        ModelConfig {
            shared_weights: false,
            ..config(PositionEncoding::Rotary)
        },
        0,
    )
    .unwrap();
    assert_eq!(untied.num_parameters() - tied.num_parameters(), 16 * 8);
}
