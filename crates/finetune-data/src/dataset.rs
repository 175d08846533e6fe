//! In-memory labelled image dataset backed by safetensors arrays.

use std::path::Path;

use burn::data::dataset::Dataset;
use finetune_core::{Error, Result};
use image::RgbImage;

use crate::arrays::{load_images, load_labels, DataSplit, ImageArray};

/// A raw sample before preprocessing
#[derive(Debug, Clone)]
pub struct RawSample {
    pub image: RgbImage,
    pub label: i64,
}

#[derive(Debug, Clone)]
pub struct ImageDataset {
    images: ImageArray,
    labels: Vec<i64>,
}

impl ImageDataset {
    /// Pairs images with labels, checking counts and label range.
    pub fn new(images: ImageArray, labels: Vec<i64>, num_classes: usize) -> Result<Self> {
        if images.len != labels.len() {
            return Err(Error::Dataset(format!(
                "{} images but {} labels",
                images.len,
                labels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|l| **l < 0 || **l as usize >= num_classes) {
            return Err(Error::Dataset(format!(
                "label {bad} outside [0, {num_classes})"
            )));
        }
        Ok(Self { images, labels })
    }

    /// Loads one split from a data root.
    pub fn load(root: &Path, split: DataSplit, num_classes: usize) -> Result<Self> {
        let images = load_images(&split.images_path(root))?;
        let labels = load_labels(&split.labels_path(root))?;
        let dataset = Self::new(images, labels, num_classes)?;
        tracing::info!(
            "Loaded {} split: {} images of {}x{}",
            split,
            dataset.labels.len(),
            dataset.images.width,
            dataset.images.height
        );
        Ok(dataset)
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    /// Samples per class
    pub fn class_distribution(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0usize; num_classes];
        for &label in &self.labels {
            if let Some(c) = counts.get_mut(label as usize) {
                *c += 1;
            }
        }
        counts
    }
}

impl Dataset<RawSample> for ImageDataset {
    fn get(&self, index: usize) -> Option<RawSample> {
        let label = *self.labels.get(index)?;
        let bytes = self.images.image(index)?;
        let image = RgbImage::from_raw(
            self.images.width as u32,
            self.images.height as u32,
            bytes.to_vec(),
        )?;
        Some(RawSample { image, label })
    }

    fn len(&self) -> usize {
        self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::{save_images, save_labels};

    fn tiny_array(len: usize) -> ImageArray {
        let data = (0..len * 2 * 2 * 3).map(|i| i as u8).collect();
        ImageArray::new(data, len, 2, 2).unwrap()
    }

    #[test]
    fn test_get_sample() {
        let dataset = ImageDataset::new(tiny_array(3), vec![0, 2, 1], 3).unwrap();
        assert_eq!(dataset.len(), 3);

        let sample = dataset.get(1).unwrap();
        assert_eq!(sample.label, 2);
        assert_eq!(sample.image.get_pixel(0, 0).0, [12, 13, 14]);
        assert!(dataset.get(3).is_none());
    }

    #[test]
    fn test_label_out_of_range() {
        let result = ImageDataset::new(tiny_array(2), vec![0, 5], 3);
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_count_mismatch() {
        let result = ImageDataset::new(tiny_array(2), vec![0], 3);
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_class_distribution() {
        let dataset = ImageDataset::new(tiny_array(4), vec![0, 2, 2, 1], 3).unwrap();
        assert_eq!(dataset.class_distribution(3), vec![1, 1, 2]);
    }

    #[test]
    fn test_load_split() -> Result<()> {
        let dir = tempfile::tempdir()?;
        save_images(&DataSplit::Val.images_path(dir.path()), &tiny_array(2))?;
        save_labels(&DataSplit::Val.labels_path(dir.path()), &[1, 0])?;

        let dataset = ImageDataset::load(dir.path(), DataSplit::Val, 2)?;
        assert_eq!(dataset.labels(), &[1, 0]);
        Ok(())
    }
}
