//! Epoch loader: shuffling, parallel preprocessing and batching.
//!
//! Each item is transformed on a dedicated rayon pool with its own RNG
//! derived from `(seed, epoch, position)`, so a run is reproducible no matter
//! how many workers are used. Deterministic transforms are applied once and
//! cached for every later epoch.

use std::sync::{Arc, OnceLock};

use burn::data::dataset::Dataset;
use finetune_core::{Error, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::batcher::ImageItem;
use crate::dataset::ImageDataset;
use crate::transform::Transform;

/// Builds a preprocessing pool with `n_worker` threads (at least one).
pub fn worker_pool(n_worker: usize) -> Result<Arc<ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_worker.max(1))
        .thread_name(|i| format!("preprocess-{i}"))
        .build()
        .map(Arc::new)
        .map_err(|e| Error::Dataset(format!("Failed to start worker pool: {e}")))
}

fn item_seed(seed: u64, epoch: usize, position: usize) -> u64 {
    let mut z = seed
        .wrapping_add((epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add((position as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

pub struct EpochLoader {
    dataset: Arc<ImageDataset>,
    transform: Transform,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    pool: Arc<ThreadPool>,
    cache: OnceLock<Vec<ImageItem>>,
}

impl EpochLoader {
    pub fn new(
        dataset: Arc<ImageDataset>,
        transform: Transform,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        pool: Arc<ThreadPool>,
    ) -> Self {
        Self {
            dataset,
            transform,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
            pool,
            cache: OnceLock::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batches per epoch; the last batch may be short.
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Dataset order for `epoch`.
    pub fn order(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        indices
    }

    fn preprocess(&self, epoch: usize, positions: &[(usize, usize)]) -> Result<Vec<ImageItem>> {
        self.pool.install(|| {
            positions
                .par_iter()
                .map(|&(position, index)| -> Result<ImageItem> {
                    let sample = self.dataset.get(index).ok_or_else(|| {
                        Error::Dataset(format!("sample {index} could not be decoded"))
                    })?;
                    let mut rng = ChaCha8Rng::seed_from_u64(item_seed(self.seed, epoch, position));
                    Ok(ImageItem {
                        image: self.transform.apply(&sample.image, &mut rng),
                        label: sample.label,
                    })
                })
                .collect()
        })
    }

    fn cached_items(&self) -> Result<&[ImageItem]> {
        if let Some(items) = self.cache.get() {
            return Ok(items);
        }
        let positions: Vec<(usize, usize)> = (0..self.len()).map(|i| (i, i)).collect();
        let items = self.preprocess(0, &positions)?;
        Ok(self.cache.get_or_init(|| items))
    }

    /// Batches of preprocessed items for one epoch.
    pub fn iter(&self, epoch: usize) -> EpochIter<'_> {
        EpochIter {
            loader: self,
            epoch,
            order: self.order(epoch),
            cursor: 0,
        }
    }
}

pub struct EpochIter<'a> {
    loader: &'a EpochLoader,
    epoch: usize,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for EpochIter<'_> {
    type Item = Result<Vec<ImageItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let slice = &self.order[self.cursor..end];
        let start = self.cursor;
        self.cursor = end;

        if self.loader.transform.is_deterministic() {
            return Some(self.loader.cached_items().map(|items| {
                slice.iter().map(|&i| items[i].clone()).collect()
            }));
        }

        let positions: Vec<(usize, usize)> =
            slice.iter().enumerate().map(|(k, &i)| (start + k, i)).collect();
        Some(self.loader.preprocess(self.epoch, &positions))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.cursor).div_ceil(self.loader.batch_size);
        (left, Some(left))
    }
}
