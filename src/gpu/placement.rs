// Location: src/gpu/placement.rs

use std::collections::BTreeMap;
use std::fmt;

use candle_core::DType;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::gpu::device::HardwareInfo;
use crate::model::metadata::{LayerSpec, ModelMetadata};
use crate::processing::MemoryRestriction;

/// Architectures whose weights break under 8/4-bit loading.
const QUANTIZATION_BROKEN: &[&str] = &["gpt2", "mbart-", "mpt-"];
const REWARD_MODEL_FAMILY: &str = "openassistant/reward-model";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantMode {
    #[default]
    None,
    Int8,
    Int4,
}

/// Where one model section lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceTarget {
    Cpu,
    /// Unified placement across every visible GPU.
    Cuda,
    Gpu(usize),
}

impl DeviceTarget {
    fn to_json(self) -> Value {
        match self {
            DeviceTarget::Cpu => json!("cpu"),
            DeviceTarget::Cuda => json!("cuda"),
            DeviceTarget::Gpu(ordinal) => json!(ordinal),
        }
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTarget::Cpu => f.write_str("cpu"),
            DeviceTarget::Cuda => f.write_str("cuda"),
            DeviceTarget::Gpu(ordinal) => write!(f, "{ordinal}"),
        }
    }
}

/// Section name to device. The empty section name covers the whole model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMap {
    Auto,
    Sections(BTreeMap<String, DeviceTarget>),
}

impl DeviceMap {
    pub fn whole(target: DeviceTarget) -> Self {
        DeviceMap::Sections(BTreeMap::from([(String::new(), target)]))
    }

    fn to_json(&self) -> Value {
        match self {
            DeviceMap::Auto => json!("auto"),
            DeviceMap::Sections(sections) => Value::Object(
                sections
                    .iter()
                    .map(|(name, target)| (name.clone(), target.to_json()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Inputs to placement, gathered once before weights are loaded.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub base_model: String,
    pub gpu_count: usize,
    pub quantization: QuantMode,
    /// `-1` places the model across all GPUs as one unit.
    pub gpu_id: i32,
    pub reward_model: bool,
    /// Per-GPU budget for the dry-run map; `None` means unbounded.
    pub gpu_memory_bytes: Option<u64>,
    pub load_half: bool,
    pub infer_devices: bool,
    pub compile_model: bool,
}

impl PlacementRequest {
    pub fn from_config(config: &EngineConfig, hardware: &HardwareInfo, reward_model: bool) -> Self {
        let restricted = MemoryRestriction::try_from(config.runtime.memory_restriction_level)
            .map(|level| level >= MemoryRestriction::Low)
            .unwrap_or(true);
        let quantization = if restricted || config.gpu.load_8bit {
            // Constrained tiers always trade 4-bit for 8-bit.
            QuantMode::Int8
        } else if config.gpu.load_4bit {
            QuantMode::Int4
        } else {
            QuantMode::None
        };

        Self {
            base_model: config.model.base_model.clone(),
            gpu_count: hardware.gpu_count,
            quantization,
            gpu_id: config.gpu.gpu_id,
            reward_model,
            gpu_memory_bytes: None,
            load_half: config.gpu.load_half,
            infer_devices: config.gpu.infer_devices,
            compile_model: config.gpu.compile_model,
        }
    }
}

/// Immutable result of placement.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementPlan {
    pub device_map: DeviceMap,
    /// Dry-run map before the single-device override, for diagnostics.
    pub inferred_map: Option<BTreeMap<String, DeviceTarget>>,
    pub quantization: QuantMode,
    pub dtype: DType,
    pub compile: bool,
    /// CPU execution with full precision and no kernel autotuning.
    pub relaxed_cpu_numerics: bool,
}

impl PlacementPlan {
    pub fn cpu() -> Self {
        Self {
            device_map: DeviceMap::whole(DeviceTarget::Cpu),
            inferred_map: None,
            quantization: QuantMode::None,
            dtype: DType::F32,
            compile: false,
            relaxed_cpu_numerics: true,
        }
    }

    /// Device that receives inputs for the model.
    pub fn primary_target(&self) -> DeviceTarget {
        match &self.device_map {
            DeviceMap::Auto => DeviceTarget::Cuda,
            DeviceMap::Sections(sections) => sections
                .get("")
                .or_else(|| sections.values().next())
                .copied()
                .unwrap_or(DeviceTarget::Cpu),
        }
    }

    /// Loader keyword arguments. Disabled quantization flags are left out.
    pub fn load_kwargs(&self) -> Map<String, Value> {
        let mut kwargs = Map::new();
        kwargs.insert("device_map".into(), self.device_map.to_json());
        kwargs.insert("torch_dtype".into(), json!(dtype_name(self.dtype)));
        kwargs.insert("load_in_8bit".into(), json!(self.quantization == QuantMode::Int8));
        kwargs.insert("load_in_4bit".into(), json!(self.quantization == QuantMode::Int4));
        pop_unused(&mut kwargs);
        kwargs
    }
}

fn pop_unused(kwargs: &mut Map<String, Value>) {
    for key in ["load_in_8bit", "load_in_4bit"] {
        if kwargs.get(key) == Some(&Value::Bool(false)) {
            kwargs.remove(key);
        }
    }
}

fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "float16",
        DType::BF16 => "bfloat16",
        DType::F64 => "float64",
        _ => "float32",
    }
}

/// Greedy dry-run map: fill each GPU in order, spill the rest to CPU.
pub fn infer_auto_device_map(
    layers: &[LayerSpec],
    dtype: DType,
    gpu_budgets: &[u64],
) -> BTreeMap<String, DeviceTarget> {
    let mut map = BTreeMap::new();
    let mut gpu = 0;
    let mut used = 0u64;
    for layer in layers {
        let bytes = layer.parameters.saturating_mul(dtype.size_in_bytes() as u64);
        while gpu < gpu_budgets.len() && used.saturating_add(bytes) > gpu_budgets[gpu] {
            gpu += 1;
            used = 0;
        }
        let target = if gpu < gpu_budgets.len() {
            used += bytes;
            DeviceTarget::Gpu(gpu)
        } else {
            DeviceTarget::Cpu
        };
        map.insert(layer.name.clone(), target);
    }
    map
}

/// Decide device map, quantization and dtype. Never fails.
pub fn resolve_placement(request: &PlacementRequest, metadata: Option<&ModelMetadata>) -> PlacementPlan {
    let model_lower = request.base_model.to_lowercase();
    let mut quantization = request.quantization;
    if quantization != QuantMode::None && QUANTIZATION_BROKEN.iter().any(|arch| model_lower.contains(arch)) {
        debug!(model = %request.base_model, "Dropping quantization for unsupported architecture");
        quantization = QuantMode::None;
    }

    if request.gpu_count == 0 {
        let plan = PlacementPlan::cpu();
        info!(device_map = %plan.device_map, "No GPU detected, placing model on CPU");
        return plan;
    }

    let reward_family = model_lower.contains(REWARD_MODEL_FAMILY);
    let dtype = if request.load_half && !reward_family {
        DType::F16
    } else {
        DType::F32
    };
    let last_gpu = request.gpu_count - 1;

    let (device_map, inferred_map) = if request.infer_devices {
        let inferred = metadata.filter(|meta| !meta.layers.is_empty()).map(|meta| {
            let budget = request.gpu_memory_bytes.unwrap_or(u64::MAX);
            infer_auto_device_map(&meta.layers, dtype, &vec![budget; request.gpu_count])
        });
        let device_map = match request.gpu_id {
            -1 => DeviceMap::whole(DeviceTarget::Cuda),
            id if id >= 0 => {
                let target = if request.reward_model {
                    last_gpu
                } else {
                    last_gpu.min(id as usize)
                };
                DeviceMap::whole(DeviceTarget::Gpu(target))
            }
            _ => inferred.clone().map(DeviceMap::Sections).unwrap_or(DeviceMap::Auto),
        };
        (device_map, inferred)
    } else {
        let device_map = if reward_family {
            DeviceMap::whole(DeviceTarget::Gpu(0))
        } else if model_lower.contains("mpt-") && request.gpu_id >= 0 {
            DeviceMap::whole(DeviceTarget::Gpu(request.gpu_id as usize))
        } else if quantization != QuantMode::None {
            DeviceMap::whole(DeviceTarget::Gpu(0))
        } else {
            DeviceMap::Auto
        };
        (device_map, None)
    };

    let plan = PlacementPlan {
        device_map,
        inferred_map,
        quantization,
        dtype,
        compile: request.compile_model,
        relaxed_cpu_numerics: false,
    };
    info!(
        device_map = %plan.device_map,
        quantization = ?plan.quantization,
        dtype = ?plan.dtype,
        "Resolved model placement"
    );
    plan
}
