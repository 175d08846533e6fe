//! Data pipeline for the fine-tune harness.
//!
//! Images and labels are read from safetensors arrays, preprocessed on a
//! worker pool and batched into burn tensors.

pub mod arrays;
pub mod batcher;
pub mod dataset;
pub mod loader;
pub mod mixup;
pub mod transform;

pub use arrays::{load_images, load_labels, save_images, save_labels, DataSplit, ImageArray};
pub use batcher::{ImageBatch, ImageBatcher, ImageItem};
pub use dataset::{ImageDataset, RawSample};
pub use loader::{worker_pool, EpochIter, EpochLoader};
pub use mixup::{mixup_batch, sample_lambda, MixedBatch};
pub use transform::{Transform, IMAGENET_MEAN, IMAGENET_STD};
