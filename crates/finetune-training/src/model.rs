//! VGG-16 with batch norm, at full or pruned width.
//!
//! Both variants share one module: thirteen 3x3 conv blocks with a 2x2 max
//! pool after blocks 1, 3, 6, 9 and 12, followed by global average pooling
//! and a single linear classifier. Only the per-layer channel counts differ.

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use finetune_core::{Error, ModelArch, Result};
use serde::{Deserialize, Serialize};

/// Number of conv layers in VGG-16
pub const VGG16_CONV_LAYERS: usize = 13;

/// Conv layers followed by a max pool
const POOL_AFTER: [usize; 5] = [1, 3, 6, 9, 12];

/// Output channels of the unpruned network
pub const VGG16_WIDTHS: [usize; VGG16_CONV_LAYERS] =
    [64, 64, 128, 128, 256, 256, 256, 512, 512, 512, 512, 512, 512];

/// Output channels after 5x channel pruning of the first four stages
pub const VGG16_X_WIDTHS: [usize; VGG16_CONV_LAYERS] =
    [24, 22, 41, 51, 108, 89, 111, 184, 276, 228, 512, 512, 512];

/// Channel plan of a VGG-16 network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VggPlan {
    pub widths: Vec<usize>,
}

impl VggPlan {
    pub fn standard() -> Self {
        Self { widths: VGG16_WIDTHS.to_vec() }
    }

    pub fn pruned() -> Self {
        Self { widths: VGG16_X_WIDTHS.to_vec() }
    }

    /// Scales the standard widths by per-layer keep ratios.
    pub fn from_policy(policy: &[f64]) -> Result<Self> {
        if policy.len() != VGG16_CONV_LAYERS {
            return Err(Error::Config(format!(
                "prune policy has {} ratios, expected {}",
                policy.len(),
                VGG16_CONV_LAYERS
            )));
        }
        let widths = VGG16_WIDTHS
            .iter()
            .zip(policy)
            .map(|(&full, &ratio)| ((full as f64 * ratio).round() as usize).clamp(1, full))
            .collect();
        Ok(Self { widths })
    }

    /// Plan for an architecture, with an optional keep-ratio policy for
    /// the pruned variant.
    pub fn for_arch(arch: ModelArch, policy: Option<&[f64]>) -> Result<Self> {
        match (arch, policy) {
            (ModelArch::Vgg16Bn, None) => Ok(Self::standard()),
            (ModelArch::Vgg16Bn, Some(_)) => {
                tracing::warn!("Prune policy ignored for {}", arch);
                Ok(Self::standard())
            }
            (ModelArch::Vgg16BnX, None) => Ok(Self::pruned()),
            (ModelArch::Vgg16BnX, Some(policy)) => Self::from_policy(policy),
        }
    }

    /// `(in_channels, out_channels, pooled)` for each conv layer.
    pub fn layers(&self) -> impl Iterator<Item = (usize, usize, bool)> + '_ {
        let inputs = std::iter::once(3).chain(self.widths.iter().copied());
        inputs
            .zip(self.widths.iter().copied())
            .enumerate()
            .map(|(i, (c_in, c_out))| (c_in, c_out, POOL_AFTER.contains(&i)))
    }

    pub fn last_width(&self) -> usize {
        self.widths.last().copied().unwrap_or(3)
    }
}

/// Name of conv layer `index`, as accepted by `--prune_layer`.
pub fn conv_layer_name(index: usize) -> String {
    format!("conv{index}")
}

/// Resolves a conv layer name to its index.
pub fn conv_layer_index(name: &str) -> Result<usize> {
    name.strip_prefix("conv")
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|i| *i < VGG16_CONV_LAYERS)
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "unknown layer '{name}', expected conv0..conv{}",
                VGG16_CONV_LAYERS - 1
            ))
        })
}

/// Conv + BN + ReLU, optionally followed by a 2x2 max pool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    pool: Option<MaxPool2d>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(c_in: usize, c_out: usize, pooled: bool, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([c_in, c_out], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let bn = BatchNormConfig::new(c_out).init(device);
        let pool = pooled.then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init());

        Self {
            conv,
            bn,
            pool,
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.bn.forward(self.conv.forward(x)));
        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }

    /// Fraction of output channels whose kernels are entirely zero.
    pub fn zero_channel_fraction(&self) -> f64 {
        let weight = self.conv.weight.val();
        let [c_out, c_in, kh, kw] = weight.dims();
        let per_channel = c_in * kh * kw;
        let values: Vec<f32> = weight
            .into_data()
            .convert::<f32>()
            .to_vec()
            .unwrap_or_default();
        if c_out == 0 || values.len() != c_out * per_channel {
            return 0.0;
        }
        let zero = values
            .chunks(per_channel)
            .filter(|kernel| kernel.iter().all(|v| *v == 0.0))
            .count();
        zero as f64 / c_out as f64
    }
}

#[derive(Module, Debug)]
pub struct Vgg<B: Backend> {
    features: Vec<ConvBlock<B>>,
    pool: AdaptiveAvgPool2d,
    fc: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> Vgg<B> {
    pub fn new(plan: &VggPlan, num_classes: usize, device: &B::Device) -> Self {
        let features = plan
            .layers()
            .map(|(c_in, c_out, pooled)| ConvBlock::new(c_in, c_out, pooled, device))
            .collect();
        let pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let fc = LinearConfig::new(plan.last_width(), num_classes).init(device);

        Self {
            features,
            pool,
            fc,
            num_classes,
        }
    }

    /// Builds the registered architecture `arch`.
    pub fn for_arch(
        arch: ModelArch,
        num_classes: usize,
        policy: Option<&[f64]>,
        device: &B::Device,
    ) -> Result<Self> {
        let plan = VggPlan::for_arch(arch, policy)?;
        Ok(Self::new(&plan, num_classes, device))
    }

    /// Images `[batch, 3, H, W]` to logits `[batch, num_classes]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .features
            .iter()
            .fold(input, |x, block| block.forward(x));
        let x = self.pool.forward(x);
        let x = x.flatten::<2>(1, 3);
        self.fc.forward(x)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Zeroed-channel fraction of conv layer `index`.
    pub fn channel_sparsity(&self, index: usize) -> Option<f64> {
        self.features.get(index).map(ConvBlock::zero_channel_fraction)
    }
}
