//! Mixup: convex blending of a batch with a permutation of itself.

use burn::prelude::*;
use finetune_core::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};

/// A blended batch and the two target sets it mixes.
#[derive(Clone, Debug)]
pub struct MixedBatch<B: Backend> {
    /// `lam * x + (1 - lam) * x[perm]`
    pub images: Tensor<B, 4>,
    /// Original targets
    pub targets_a: Tensor<B, 1, Int>,
    /// Permuted targets
    pub targets_b: Tensor<B, 1, Int>,
    /// Blend weight of the original batch
    pub lam: f64,
    /// Permutation applied to the batch
    pub perm: Vec<usize>,
}

/// Draws the blend weight: `Beta(alpha, alpha)` for `alpha > 0`, else 1.
pub fn sample_lambda<R: Rng>(alpha: f64, rng: &mut R) -> Result<f64> {
    if alpha <= 0.0 {
        return Ok(1.0);
    }
    let beta = Beta::new(alpha, alpha)
        .map_err(|e| Error::InvalidArgument(format!("mixup alpha {alpha}: {e}")))?;
    Ok(beta.sample(rng))
}

pub fn mixup_batch<B: Backend, R: Rng>(
    images: Tensor<B, 4>,
    targets: Tensor<B, 1, Int>,
    alpha: f64,
    rng: &mut R,
) -> Result<MixedBatch<B>> {
    let lam = sample_lambda(alpha, rng)?;
    let n = targets.dims()[0];
    let device = images.device();

    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(rng);

    let index = Tensor::<B, 1, Int>::from_data(
        TensorData::new(perm.iter().map(|&i| i as i64).collect::<Vec<_>>(), [n]),
        &device,
    );

    let shuffled = images.clone().select(0, index.clone());
    let images = images.mul_scalar(lam) + shuffled.mul_scalar(1.0 - lam);
    let targets_b = targets.clone().select(0, index);

    Ok(MixedBatch {
        images,
        targets_a: targets,
        targets_b,
        lam,
        perm,
    })
}
