//! Loading image and label arrays from safetensors files.
//!
//! A data root holds one file per array:
//!
//! ```text
//! <root>/train_images.safetensors   [N, H, W, 3]  u8 or f32 in [0, 1]
//! <root>/train_labels.safetensors   [N]           i64, i32 or u8
//! <root>/val_images.safetensors
//! <root>/val_labels.safetensors
//! ```
//!
//! Each file carries a single tensor; its name is not significant.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use finetune_core::{Error, Result};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;

/// Which half of the data a file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSplit {
    Train,
    Val,
}

impl DataSplit {
    pub fn images_path(&self, root: &Path) -> PathBuf {
        root.join(format!("{}_images.safetensors", self.prefix()))
    }

    pub fn labels_path(&self, root: &Path) -> PathBuf {
        root.join(format!("{}_labels.safetensors", self.prefix()))
    }

    fn prefix(&self) -> &'static str {
        match self {
            DataSplit::Train => "train",
            DataSplit::Val => "val",
        }
    }
}

impl std::fmt::Display for DataSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// A stack of HWC RGB images stored contiguously as bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray {
    pub data: Vec<u8>,
    pub len: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageArray {
    pub fn new(data: Vec<u8>, len: usize, height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(Error::Dataset(format!(
                "images must be at least 1x1, got {height}x{width}"
            )));
        }
        if data.len() != len * height * width * 3 {
            return Err(Error::Dataset(format!(
                "image buffer holds {} bytes, expected {}x{}x{}x3",
                data.len(),
                len,
                height,
                width
            )));
        }
        Ok(Self { data, len, height, width })
    }

    /// Raw HWC bytes of image `index`.
    pub fn image(&self, index: usize) -> Option<&[u8]> {
        let stride = self.height * self.width * 3;
        self.data.get(index * stride..(index + 1) * stride)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Dataset(format!("Failed to read {}: {e}", path.display())))
}

fn single_tensor<'a>(tensors: &'a SafeTensors<'a>, path: &Path) -> Result<TensorView<'a>> {
    let names = tensors.names();
    match names.as_slice() {
        [name] => tensors
            .tensor(name)
            .map_err(|e| Error::Dataset(format!("{}: {e}", path.display()))),
        _ => Err(Error::Dataset(format!(
            "{} must hold exactly one tensor, found {}",
            path.display(),
            names.len()
        ))),
    }
}

/// Loads an `[N, H, W, 3]` image array.
///
/// Float images are expected in [0, 1] and are quantised to bytes.
pub fn load_images(path: &Path) -> Result<ImageArray> {
    let buffer = read_file(path)?;
    let tensors = SafeTensors::deserialize(&buffer)
        .map_err(|e| Error::Dataset(format!("Failed to parse {}: {e}", path.display())))?;
    let view = single_tensor(&tensors, path)?;

    let [len, height, width, 3] = view.shape() else {
        return Err(Error::Dataset(format!(
            "{}: expected shape [N, H, W, 3], got {:?}",
            path.display(),
            view.shape()
        )));
    };
    let (len, height, width) = (*len, *height, *width);

    let data = match view.dtype() {
        Dtype::U8 => view.data().to_vec(),
        Dtype::F32 => view
            .data()
            .chunks_exact(4)
            .map(|b| {
                let v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                (v * 255.0).round().clamp(0.0, 255.0) as u8
            })
            .collect(),
        other => {
            return Err(Error::Dataset(format!(
                "{}: unsupported image dtype {other:?}",
                path.display()
            )))
        }
    };

    ImageArray::new(data, len, height, width)
}

/// Loads an `[N]` label vector.
pub fn load_labels(path: &Path) -> Result<Vec<i64>> {
    let buffer = read_file(path)?;
    let tensors = SafeTensors::deserialize(&buffer)
        .map_err(|e| Error::Dataset(format!("Failed to parse {}: {e}", path.display())))?;
    let view = single_tensor(&tensors, path)?;

    if view.shape().len() != 1 {
        return Err(Error::Dataset(format!(
            "{}: expected shape [N], got {:?}",
            path.display(),
            view.shape()
        )));
    }

    let data = view.data();
    let labels = match view.dtype() {
        Dtype::I64 => data
            .chunks_exact(8)
            .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect(),
        Dtype::I32 => data
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
            .collect(),
        Dtype::U8 => data.iter().map(|&b| b as i64).collect(),
        other => {
            return Err(Error::Dataset(format!(
                "{}: unsupported label dtype {other:?}",
                path.display()
            )))
        }
    };

    Ok(labels)
}

fn write_tensor(path: &Path, dtype: Dtype, shape: Vec<usize>, bytes: &[u8]) -> Result<()> {
    let view = TensorView::new(dtype, shape, bytes)
        .map_err(|e| Error::Dataset(format!("Invalid tensor for {}: {e}", path.display())))?;
    let metadata: Option<HashMap<String, String>> = None;
    let encoded = safetensors::serialize([("data", view)], &metadata)
        .map_err(|e| Error::Dataset(format!("Failed to encode {}: {e}", path.display())))?;
    fs::write(path, encoded)?;
    Ok(())
}

/// Writes an image array as `[N, H, W, 3]` u8.
pub fn save_images(path: &Path, images: &ImageArray) -> Result<()> {
    write_tensor(
        path,
        Dtype::U8,
        vec![images.len, images.height, images.width, 3],
        &images.data,
    )
}

/// Writes labels as `[N]` i64.
pub fn save_labels(path: &Path, labels: &[i64]) -> Result<()> {
    let bytes: Vec<u8> = labels.iter().flat_map(|l| l.to_le_bytes()).collect();
    write_tensor(path, Dtype::I64, vec![labels.len()], &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_paths() {
        let root = Path::new("/data");
        assert_eq!(
            DataSplit::Train.images_path(root),
            PathBuf::from("/data/train_images.safetensors")
        );
        assert_eq!(
            DataSplit::Val.labels_path(root),
            PathBuf::from("/data/val_labels.safetensors")
        );
    }

    #[test]
    fn test_images_save_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("images.safetensors");
        let data: Vec<u8> = (0..2 * 4 * 5 * 3).map(|i| (i % 256) as u8).collect();
        let images = ImageArray::new(data, 2, 4, 5)?;

        save_images(&path, &images)?;
        let loaded = load_images(&path)?;
        assert_eq!(loaded, images);
        assert_eq!(loaded.image(1).map(|s| s.len()), Some(60));
        assert!(loaded.image(2).is_none());
        Ok(())
    }

    #[test]
    fn test_float_images_quantised() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("images.safetensors");
        let values = [0.0f32, 0.5, 1.0];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        write_tensor(&path, Dtype::F32, vec![1, 1, 1, 3], &bytes)?;

        let loaded = load_images(&path)?;
        assert_eq!(loaded.data, vec![0, 128, 255]);
        Ok(())
    }

    #[test]
    fn test_i32_labels() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("labels.safetensors");
        let bytes: Vec<u8> = [3i32, 0, 9].iter().flat_map(|v| v.to_le_bytes()).collect();
        write_tensor(&path, Dtype::I32, vec![3], &bytes)?;

        assert_eq!(load_labels(&path)?, vec![3, 0, 9]);
        Ok(())
    }

    #[test]
    fn test_bad_shape_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("images.safetensors");
        write_tensor(&path, Dtype::U8, vec![2, 6], &[0u8; 12])?;

        assert!(matches!(load_images(&path), Err(Error::Dataset(_))));
        Ok(())
    }

    #[test]
    fn test_zero_sized_images_rejected() -> Result<()> {
        assert!(matches!(ImageArray::new(Vec::new(), 4, 0, 8), Err(Error::Dataset(_))));
        assert!(matches!(ImageArray::new(Vec::new(), 4, 8, 0), Err(Error::Dataset(_))));

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("images.safetensors");
        write_tensor(&path, Dtype::U8, vec![2, 0, 5, 3], &[])?;
        assert!(matches!(load_images(&path), Err(Error::Dataset(_))));
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let result = load_labels(Path::new("/nonexistent/labels.safetensors"));
        assert!(matches!(result, Err(Error::Dataset(_))));
    }
}
