//! Configuration structures for fine-tuning runs and pruning.

use crate::types::{DatasetKind, LayerKind, LrPolicy, ModelArch};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hyperparameters and paths for one fine-tune or evaluation run.
///
/// Names are kept as strings so a TOML file and the command line can feed
/// the same struct; [`RunConfig::validate`] resolves them before any data
/// is touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Model architecture name
    pub model: String,
    /// Dataset name
    pub dataset: String,
    /// Base learning rate
    pub lr: f64,
    /// Number of GPUs requested
    pub n_gpu: usize,
    /// Batch size
    pub batch_size: usize,
    /// Number of preprocessing workers
    pub n_worker: usize,
    /// Learning rate policy name
    pub lr_type: String,
    /// Number of training epochs
    pub n_epoch: usize,
    /// Weight decay
    pub wd: f64,
    /// SGD momentum
    pub momentum: f64,
    /// Random seed
    pub seed: Option<u64>,
    /// Directory holding the input arrays
    pub data_root: PathBuf,
    /// Checkpoint to resume from
    pub ckpt_path: Option<PathBuf>,
    /// Evaluate only
    pub eval: bool,
    /// Blend training batches with mixup
    pub mixup: bool,
    /// Beta distribution parameter for mixup
    pub mixup_alpha: f64,
    /// Conv layers whose channel sparsity is reported after each epoch
    pub prune_layer: Option<Vec<String>>,
    /// Parent directory for run folders
    pub log_root: PathBuf,
    /// Restore epoch, best accuracy and optimizer state on resume
    pub resume_state: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ModelArch::Vgg16Bn.name().to_string(),
            dataset: DatasetKind::Imagenet.name().to_string(),
            lr: 0.1,
            n_gpu: 1,
            batch_size: 128,
            n_worker: 4,
            lr_type: LrPolicy::Exp.to_string(),
            n_epoch: 150,
            wd: 4e-5,
            momentum: 0.9,
            seed: None,
            data_root: PathBuf::from("data"),
            ckpt_path: None,
            eval: false,
            mixup: false,
            mixup_alpha: 0.086,
            prune_layer: None,
            log_root: PathBuf::from("./logs"),
            resume_state: false,
        }
    }
}

impl RunConfig {
    /// Resolves the model name
    pub fn model_arch(&self) -> Result<ModelArch> {
        self.model.parse()
    }

    /// Resolves the dataset name
    pub fn dataset_kind(&self) -> Result<DatasetKind> {
        self.dataset.parse()
    }

    /// Resolves the learning rate policy name
    pub fn lr_policy(&self) -> Result<LrPolicy> {
        self.lr_type.parse()
    }

    /// Name of the run folder prefix, e.g. `vgg16_bn_imagenet_finetune`
    pub fn run_name(&self) -> String {
        format!("{}_{}_finetune", self.model, self.dataset)
    }

    /// Checks every field that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<()> {
        self.model_arch()?;
        self.dataset_kind()?;
        self.lr_policy()?;

        if self.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be > 0".to_string()));
        }
        if !self.eval && self.n_epoch == 0 {
            return Err(Error::InvalidArgument("n_epoch must be > 0".to_string()));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::InvalidArgument(format!("lr must be > 0, got {}", self.lr)));
        }
        if !(self.wd.is_finite() && self.wd >= 0.0) {
            return Err(Error::InvalidArgument(format!("wd must be >= 0, got {}", self.wd)));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::InvalidArgument(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        Ok(())
    }
}

/// Parameters shared by every pruning procedure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PruneConfig {
    /// Sampled points per layer during calibration
    pub n_points_per_layer: usize,
    /// Layer kinds eligible for pruning
    pub prunable_layer_types: Vec<LayerKind>,
    /// Batches used for calibration
    pub calib_batch: usize,
    /// Device the pruner runs on
    pub device: String,
    /// Per-layer keep ratios
    pub policy: Option<Vec<f64>>,
    /// Save feature maps during calibration
    pub fmap_save: bool,
    /// Where feature maps are saved
    pub fmap_save_path: PathBuf,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            n_points_per_layer: 1,
            prunable_layer_types: vec![LayerKind::Conv2d, LayerKind::Linear],
            calib_batch: 20,
            device: "cuda".to_string(),
            policy: None,
            fmap_save: true,
            fmap_save_path: PathBuf::from("./"),
        }
    }
}

/// Configuration of a lasso channel-pruning pass.
///
/// The fine-tune driver reads the checkpoint and policy out of this to
/// rebuild the pruned network it is asked to recover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LassoPruneConfig {
    #[serde(flatten)]
    pub base: PruneConfig,
    /// Model architecture name
    pub model: String,
    /// Checkpoint of the model being pruned
    pub ckpt: PathBuf,
    /// Calibration data root
    pub train_data: PathBuf,
    /// Validation data root
    #[serde(default)]
    pub val_data: Option<PathBuf>,
    /// Loss used during reconstruction
    #[serde(default)]
    pub criterion: Option<String>,
    /// Pruner name
    #[serde(default = "default_pruner")]
    pub pruner: String,
}

fn default_pruner() -> String {
    "lasso".to_string()
}

impl LassoPruneConfig {
    pub fn new(model: impl Into<String>, ckpt: impl Into<PathBuf>, train_data: impl Into<PathBuf>) -> Self {
        Self {
            base: PruneConfig::default(),
            model: model.into(),
            ckpt: ckpt.into(),
            train_data: train_data.into(),
            val_data: None,
            criterion: None,
            pruner: default_pruner(),
        }
    }

    pub fn with_policy(mut self, policy: Vec<f64>) -> Self {
        self.base.policy = Some(policy);
        self
    }

    /// Keep ratios, validated to lie in (0, 1].
    pub fn policy(&self) -> Result<Option<&[f64]>> {
        let Some(policy) = self.base.policy.as_deref() else {
            return Ok(None);
        };
        if let Some(bad) = policy.iter().find(|r| !(**r > 0.0 && **r <= 1.0)) {
            return Err(Error::Config(format!(
                "prune policy ratio {bad} outside (0, 1]"
            )));
        }
        Ok(Some(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.lr, 0.1);
        assert_eq!(config.n_gpu, 1);
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.n_worker, 4);
        assert_eq!(config.lr_type, "exp");
        assert_eq!(config.n_epoch, 150);
        assert_eq!(config.wd, 4e-5);
        assert_eq!(config.mixup_alpha, 0.086);
        assert_eq!(config.log_root, PathBuf::from("./logs"));
        assert!(!config.eval && !config.mixup && !config.resume_state);
    }

    #[test]
    fn test_run_config_validate() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());

        let config = RunConfig {
            lr_type: "step3".to_string(),
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::UnsupportedPolicy(_))));

        let config = RunConfig {
            model: "mobilenet".to_string(),
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::UnsupportedModel(_))));

        let config = RunConfig {
            batch_size: 0,
            ..RunConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let config = RunConfig {
            eval: true,
            n_epoch: 0,
            ..RunConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_name() {
        let config = RunConfig {
            dataset: "cifar10".to_string(),
            ..RunConfig::default()
        };
        assert_eq!(config.run_name(), "vgg16_bn_cifar10_finetune");
    }

    #[test]
    fn test_run_config_partial_toml() {
        let config: RunConfig = toml::from_str("lr = 0.01\nlr_type = \"cos\"\nmixup = true\n").unwrap();
        assert_eq!(config.lr, 0.01);
        assert_eq!(config.lr_policy().unwrap(), LrPolicy::Cos);
        assert!(config.mixup);
        assert_eq!(config.batch_size, 128);
    }

    #[test]
    fn test_prune_config_defaults() {
        let config = PruneConfig::default();
        assert_eq!(config.n_points_per_layer, 1);
        assert_eq!(config.prunable_layer_types, vec![LayerKind::Conv2d, LayerKind::Linear]);
        assert_eq!(config.calib_batch, 20);
        assert_eq!(config.device, "cuda");
        assert!(config.policy.is_none());
        assert!(config.fmap_save);
        assert_eq!(config.fmap_save_path, PathBuf::from("./"));
    }

    #[test]
    fn test_lasso_config_from_toml() {
        let text = r#"
            model = "vgg16_bn"
            ckpt = "ckpt.pth.tar"
            train_data = "data"
            calib_batch = 8
            policy = [1.0, 0.5]
        "#;
        let config: LassoPruneConfig = toml::from_str(text).unwrap();
        assert_eq!(config.pruner, "lasso");
        assert_eq!(config.base.calib_batch, 8);
        assert_eq!(config.base.n_points_per_layer, 1);
        assert_eq!(config.policy().unwrap(), Some(&[1.0, 0.5][..]));
    }

    #[test]
    fn test_lasso_policy_out_of_range() {
        let config = LassoPruneConfig::new("vgg16_bn", "a", "b").with_policy(vec![0.5, 0.0]);
        assert!(matches!(config.policy(), Err(Error::Config(_))));
    }
}
