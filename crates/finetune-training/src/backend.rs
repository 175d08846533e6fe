//! Concrete burn backends used by the `finetune` tool.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use finetune_core::Device;

#[cfg(not(feature = "cuda"))]
pub type InnerBackend = burn::backend::NdArray<f32>;

#[cfg(feature = "cuda")]
pub type InnerBackend = burn_cuda::Cuda;

/// Backend with autodiff, used for training
pub type TrainBackend = Autodiff<InnerBackend>;

/// Whether this build can run on a GPU
pub const GPU_BACKEND: bool = cfg!(feature = "cuda");

/// Human-readable name of the compiled backend
pub fn backend_name() -> &'static str {
    if GPU_BACKEND {
        "CUDA (GPU)"
    } else {
        "NdArray (CPU)"
    }
}

/// Maps a selected device onto the compiled backend.
#[cfg(not(feature = "cuda"))]
pub fn backend_device(_device: Device) -> <TrainBackend as Backend>::Device {
    burn::backend::ndarray::NdArrayDevice::Cpu
}

#[cfg(feature = "cuda")]
pub fn backend_device(device: Device) -> <TrainBackend as Backend>::Device {
    match device {
        Device::Gpu(id) => burn_cuda::CudaDevice::new(id),
        Device::Cpu => burn_cuda::CudaDevice::default(),
    }
}
