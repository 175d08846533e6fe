//! Core type definitions for the fine-tune harness.
//!
//! Names coming from the command line or a config file are resolved into
//! these enums once, before any data is loaded, so that an unsupported model,
//! dataset or policy fails the run immediately.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// Supported model architectures
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ModelArch {
    /// VGG-16 with batch norm, full channel plan
    Vgg16Bn,
    /// VGG-16 with batch norm, pruned channel plan
    Vgg16BnX,
}

impl ModelArch {
    /// All registered architectures
    pub const ALL: [ModelArch; 2] = [ModelArch::Vgg16Bn, ModelArch::Vgg16BnX];

    /// Name used on the command line and in checkpoints
    pub fn name(&self) -> &'static str {
        match self {
            ModelArch::Vgg16Bn => "vgg16_bn",
            ModelArch::Vgg16BnX => "vgg16_bn_x",
        }
    }
}

impl std::fmt::Display for ModelArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ModelArch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ModelArch::ALL
            .into_iter()
            .find(|arch| arch.name() == s)
            .ok_or_else(|| Error::UnsupportedModel(s.to_string()))
    }
}

/// Supported datasets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    /// ImageNet (1000 classes, 224x224 inputs)
    Imagenet,
    /// CIFAR-10 (10 classes, 32x32 inputs)
    Cifar10,
    /// CIFAR-100 (100 classes, 32x32 inputs)
    Cifar100,
}

impl DatasetKind {
    /// Number of output classes
    pub fn num_classes(&self) -> usize {
        match self {
            DatasetKind::Imagenet => 1000,
            DatasetKind::Cifar10 => 10,
            DatasetKind::Cifar100 => 100,
        }
    }

    /// Square input resolution fed to the model
    pub fn image_size(&self) -> usize {
        match self {
            DatasetKind::Imagenet => 224,
            DatasetKind::Cifar10 | DatasetKind::Cifar100 => 32,
        }
    }

    /// Name used on the command line and in checkpoints
    pub fn name(&self) -> &'static str {
        match self {
            DatasetKind::Imagenet => "imagenet",
            DatasetKind::Cifar10 => "cifar10",
            DatasetKind::Cifar100 => "cifar100",
        }
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "imagenet" => Ok(DatasetKind::Imagenet),
            "cifar10" => Ok(DatasetKind::Cifar10),
            "cifar100" => Ok(DatasetKind::Cifar100),
            other => Err(Error::UnsupportedDataset(other.to_string())),
        }
    }
}

/// Learning rate policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LrPolicy {
    /// Half-cosine decay to zero over the schedule
    Cos,
    /// Exponential decay by 0.96 every epoch
    Exp,
    /// Constant learning rate
    Fixed,
}

impl std::fmt::Display for LrPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LrPolicy::Cos => write!(f, "cos"),
            LrPolicy::Exp => write!(f, "exp"),
            LrPolicy::Fixed => write!(f, "fixed"),
        }
    }
}

impl FromStr for LrPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cos" => Ok(LrPolicy::Cos),
            "exp" => Ok(LrPolicy::Exp),
            "fixed" => Ok(LrPolicy::Fixed),
            other => Err(Error::UnsupportedPolicy(other.to_string())),
        }
    }
}

/// Layer kinds a pruner may operate on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// 2D convolution
    Conv2d,
    /// Fully connected layer
    Linear,
}

/// Which side of an epoch a metric belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    /// Training pass
    Train,
    /// Validation pass
    Test,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Train => write!(f, "train"),
            Phase::Test => write!(f, "test"),
        }
    }
}
