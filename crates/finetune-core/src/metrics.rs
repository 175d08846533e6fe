//! Running averages and top-k accuracy.

use serde::{Deserialize, Serialize};

/// Running weighted average of a scalar, reset every epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AverageMeter {
    /// Most recent value
    pub val: f64,
    /// Weighted sum of all values
    pub sum: f64,
    /// Total weight
    pub count: usize,
    /// `sum / count`
    pub avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Records `val` observed over `n` samples.
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

/// Per-sample flags telling whether the target is among the `k` best scores.
///
/// `logits` is row-major `[n, num_classes]`. `k` is clamped to the class
/// count, so top-5 on a 3-class problem is always a hit.
pub fn topk_hits(logits: &[f32], num_classes: usize, targets: &[i64], k: usize) -> Vec<bool> {
    if num_classes == 0 {
        return vec![false; targets.len()];
    }
    let k = k.min(num_classes);
    logits
        .chunks(num_classes)
        .zip(targets)
        .map(|(row, &target)| {
            let Some(&target_score) = usize::try_from(target).ok().and_then(|t| row.get(t)) else {
                return false;
            };
            // Ties are broken by index, like a stable sort would.
            let better = row
                .iter()
                .enumerate()
                .filter(|&(i, &s)| s > target_score || (s == target_score && (i as i64) < target))
                .count();
            better < k
        })
        .collect()
}

/// Top-k accuracy in percent for each `k` in `topk`.
pub fn accuracy(logits: &[f32], num_classes: usize, targets: &[i64], topk: &[usize]) -> Vec<f64> {
    let n = targets.len();
    topk.iter()
        .map(|&k| {
            if n == 0 {
                return 0.0;
            }
            let hits = topk_hits(logits, num_classes, targets, k)
                .into_iter()
                .filter(|h| *h)
                .count();
            hits as f64 * 100.0 / n as f64
        })
        .collect()
}

/// Top-1 accuracy in percent of a mixed batch against both target sets.
pub fn mixup_top1(logits: &[f32], num_classes: usize, targets_a: &[i64], targets_b: &[i64], lam: f64) -> f64 {
    let n = targets_a.len();
    if n == 0 {
        return 0.0;
    }
    let count = |targets: &[i64]| {
        topk_hits(logits, num_classes, targets, 1)
            .into_iter()
            .filter(|h| *h)
            .count() as f64
    };
    (lam * count(targets_a) + (1.0 - lam) * count(targets_b)) * 100.0 / n as f64
}
