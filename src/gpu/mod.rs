//! Hardware detection, device/quantization placement and accelerator cache
//! release

mod device;
pub mod placement;
mod pool;

pub use device::{device_for, HardwareInfo};
pub use placement::{
    infer_auto_device_map, resolve_placement, DeviceMap, DeviceTarget, PlacementPlan, PlacementRequest, QuantMode,
};
pub use pool::{AcceleratorPool, ReleaseGuard};
