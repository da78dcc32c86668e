use crate::{operator, LmError, Result};

/// Summed cross-entropy of the positions that have a target.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossSum {
    pub total: f64,
    pub count: usize,
}

impl LossSum {
    pub fn add(&mut self, other: LossSum) {
        self.total += other.total;
        self.count += other.count;
    }

    /// Mean over counted positions, 0 when nothing was counted.
    pub fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.total / self.count as f64) as f32
        }
    }
}

fn check(logits: &[f32], targets: &[Option<usize>], vocab: usize) -> Result<()> {
    if logits.len() != targets.len() * vocab {
        return Err(LmError::Shape(format!(
            "{} logits for {} targets over a vocabulary of {}",
            logits.len(),
            targets.len(),
            vocab
        )));
    }
    if let Some(bad) = targets.iter().flatten().find(|&&t| t >= vocab) {
        return Err(LmError::Shape(format!(
            "target id {bad} outside vocabulary of {vocab}"
        )));
    }
    Ok(())
}

/// Cross-entropy of (t, vocab) `logits` against `targets`; `None` marks padding.
pub fn cross_entropy(logits: &[f32], targets: &[Option<usize>], vocab: usize) -> Result<LossSum> {
    check(logits, targets, vocab)?;
    let mut sum = LossSum::default();
    for (row, target) in logits.chunks_exact(vocab).zip(targets) {
        if let Some(&target) = target.as_ref() {
            sum.total += operator::log_sum_exp(row) - row[target] as f64;
            sum.count += 1;
        }
    }
    Ok(sum)
}

/// Cross-entropy together with its gradient with respect to `logits`.
///
/// The gradient of every counted row is `(softmax(row) - onehot) * scale`;
/// padding rows get zero. Callers pick `scale` so that the gradients of all
/// sequences of an optimizer step add up to the gradient of the step's mean loss.
pub fn cross_entropy_backward(
    logits: &[f32],
    targets: &[Option<usize>],
    vocab: usize,
    scale: f32,
) -> Result<(LossSum, Vec<f32>)> {
    check(logits, targets, vocab)?;
    let mut sum = LossSum::default();
    let mut dlogits = vec![0.0; logits.len()];
    for ((row, drow), target) in logits
        .chunks_exact(vocab)
        .zip(dlogits.chunks_exact_mut(vocab))
        .zip(targets)
    {
        let Some(&target) = target.as_ref() else {
            continue;
        };
        let lse = operator::log_sum_exp(row);
        sum.total += lse - row[target] as f64;
        sum.count += 1;
        for (d, &z) in drow.iter_mut().zip(row) {
            *d = ((z as f64 - lse).exp() as f32) * scale;
        }
        drow[target] -= scale;
    }
    Ok((sum, dlogits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_logits_cost_log_vocab() {
        let loss = cross_entropy(&[0.0; 8], &[Some(1), Some(3)], 4).unwrap();
        assert_eq!(loss.count, 2);
        assert!((loss.mean() - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn padding_is_ignored() {
        let logits = [2.0, 0.0, -1.0, 5.0, 5.0, 5.0];
        let with_pad = cross_entropy(&logits, &[Some(0), None], 3).unwrap();
        let alone = cross_entropy(&logits[..3], &[Some(0)], 3).unwrap();
        assert_eq!(with_pad, alone);

        let (_, dlogits) = cross_entropy_backward(&logits, &[Some(0), None], 3, 1.0).unwrap();
        assert_eq!(&dlogits[3..], &[0.0; 3]);
    }

    #[test]
    fn all_padding_has_zero_mean() {
        let loss = cross_entropy(&[1.0; 6], &[None, None], 3).unwrap();
        assert_eq!(loss.mean(), 0.0);
    }

    #[test]
    fn gradient_rows_sum_to_zero() {
        let logits = [0.3, -1.2, 2.0, 0.1];
        let (_, d) = cross_entropy_backward(&logits, &[Some(2)], 4, 0.5).unwrap();
        assert!(d.iter().sum::<f32>().abs() < 1e-6);
        assert!(d[2] < 0.0);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let logits = vec![0.5, -0.25, 1.5, 0.0, 1.0, -2.0];
        let targets = [Some(2), Some(0)];
        let (_, d) = cross_entropy_backward(&logits, &targets, 3, 1.0).unwrap();
        let h = 1e-3;
        for i in 0..logits.len() {
            let mut plus = logits.clone();
            plus[i] += h;
            let mut minus = logits.clone();
            minus[i] -= h;
            let numeric = (cross_entropy(&plus, &targets, 3).unwrap().total
                - cross_entropy(&minus, &targets, 3).unwrap().total)
                / (2.0 * h as f64);
            assert!((numeric as f32 - d[i]).abs() < 1e-3);
        }
    }

    #[test]
    fn out_of_range_target_is_rejected() {
        assert!(matches!(
            cross_entropy(&[0.0; 3], &[Some(3)], 3),
            Err(LmError::Shape(_))
        ));
    }
}
