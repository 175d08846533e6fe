//! Parameter and FLOP counts for a VGG plan.

use burn::module::Module;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::model::{Vgg, VggPlan};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Values held by the module, as counted by burn
    pub params: usize,
    /// Multiply-accumulates for one image
    pub flops: u64,
}

impl ModelProfile {
    pub fn measure<B: Backend>(model: &Vgg<B>, plan: &VggPlan, image_size: usize) -> Self {
        Self {
            params: model.num_params(),
            flops: count_flops(plan, image_size, model.num_classes()),
        }
    }

    pub fn params_millions(&self) -> f64 {
        self.params as f64 / 1e6
    }

    pub fn flops_millions(&self) -> f64 {
        self.flops as f64 / 1e6
    }
}

impl std::fmt::Display for ModelProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#Params: {:.3}M, #FLOPs: {:.3}M",
            self.params_millions(),
            self.flops_millions()
        )
    }
}

/// Conv and linear MACs plus bias adds, two ops per batch-norm output.
pub fn count_flops(plan: &VggPlan, image_size: usize, num_classes: usize) -> u64 {
    let mut side = image_size as u64;
    let mut flops = 0u64;

    for (c_in, c_out, pooled) in plan.layers() {
        let outputs = c_out as u64 * side * side;
        flops += outputs * (c_in as u64 * 9) + outputs;
        flops += 2 * outputs;
        if pooled {
            side /= 2;
        }
    }

    let features = plan.last_width() as u64;
    flops + features * num_classes as u64 + num_classes as u64
}
