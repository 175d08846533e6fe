//! Device selection.
//!
//! Training runs on one device. A GPU count above one is accepted so that
//! existing launch scripts keep working, but only device 0 is used.

use serde::{Deserialize, Serialize};

/// Device a run executes on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Device {
    /// CPU backend
    Cpu,
    /// GPU backend
    Gpu(usize),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu(id) => write!(f, "GPU:{}", id),
        }
    }
}

/// Picks the device for a run from the requested GPU count.
///
/// `gpu_backend` tells whether the binary was built with a GPU backend at all.
pub fn select_device(n_gpu: usize, gpu_backend: bool) -> Device {
    if n_gpu > 1 {
        tracing::warn!("{} GPUs requested; data parallelism is not supported, using one device", n_gpu);
    }

    if n_gpu == 0 {
        return Device::Cpu;
    }

    if !gpu_backend {
        tracing::info!("Built without a GPU backend, running on CPU");
        return Device::Cpu;
    }

    if is_gpu_available() {
        Device::Gpu(0)
    } else {
        tracing::warn!("GPU requested but not available, falling back to CPU");
        Device::Cpu
    }
}

/// Check if an NVIDIA GPU is visible
pub fn is_gpu_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
            || std::process::Command::new("nvidia-smi")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("nvidia-smi.exe")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "CPU");
        assert_eq!(Device::Gpu(0).to_string(), "GPU:0");
    }

    #[test]
    fn test_select_device_cpu() {
        assert_eq!(select_device(0, true), Device::Cpu);
        assert_eq!(select_device(1, false), Device::Cpu);
        assert_eq!(select_device(4, false), Device::Cpu);
    }

    #[test]
    fn test_select_device_gpu() {
        let device = select_device(2, true);
        assert!(matches!(device, Device::Cpu | Device::Gpu(0)));
    }
}
