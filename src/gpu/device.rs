// Location: src/gpu/device.rs

use std::fmt;

use candle_core::Device;
use sysinfo::System;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::gpu::placement::DeviceTarget;

/// Upper bound on CUDA ordinals probed during detection.
#[cfg(feature = "cuda")]
const MAX_PROBED_GPUS: usize = 8;

/// Host capabilities consulted by the placement resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareInfo {
    pub gpu_count: usize,
    pub system_memory_bytes: u64,
}

impl HardwareInfo {
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let info = Self {
            gpu_count: detect_cuda_devices(),
            system_memory_bytes: system.available_memory(),
        };
        info!(gpu_count = info.gpu_count, memory = info.system_memory_bytes, "Detected hardware");
        info
    }

    pub fn cpu_only(system_memory_bytes: u64) -> Self {
        Self {
            gpu_count: 0,
            system_memory_bytes,
        }
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_count > 0
    }
}

#[cfg(feature = "cuda")]
fn detect_cuda_devices() -> usize {
    (0..MAX_PROBED_GPUS)
        .take_while(|&ordinal| Device::new_cuda(ordinal).is_ok())
        .count()
}

#[cfg(not(feature = "cuda"))]
fn detect_cuda_devices() -> usize {
    0
}

impl fmt::Display for HardwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CUDA devices: {}", self.gpu_count)?;
        write!(
            f,
            "Available memory: {:.1} GiB",
            self.system_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
        )
    }
}

/// Open the candle device for a placement target. `Cuda` means the first
/// visible device.
pub fn device_for(target: DeviceTarget) -> Result<Device> {
    let ordinal = match target {
        DeviceTarget::Cpu => return Ok(Device::Cpu),
        DeviceTarget::Cuda => 0,
        DeviceTarget::Gpu(ordinal) => ordinal,
    };
    Device::new_cuda(ordinal).map_err(|err| {
        warn!(ordinal, error = %err, "CUDA device unavailable");
        EngineError::DeviceError {
            message: format!("cuda:{ordinal}: {err}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_reports_memory() {
        let info = HardwareInfo::detect();
        #[cfg(not(feature = "cuda"))]
        assert_eq!(info.gpu_count, 0);
        assert!(info.to_string().contains("CUDA devices"));
    }

    #[test]
    fn test_cpu_target_always_opens() {
        let device = device_for(DeviceTarget::Cpu).unwrap();
        assert!(matches!(device, Device::Cpu));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_gpu_target_without_cuda_is_device_error() {
        let err = device_for(DeviceTarget::Gpu(0)).unwrap_err();
        assert!(matches!(err, EngineError::DeviceError { .. }));
    }
}
