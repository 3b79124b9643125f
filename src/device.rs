//! # Device Selection
//!
//! Picks the compute device the speech engine runs on. Detection for `auto`
//! runs once per process and is cached, since every engine reload asks again.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    #[default]
    Auto,
    Cpu,
    /// CUDA GPU, falling back to CPU if not available
    Cuda,
    /// Metal GPU, falling back to CPU if not available
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

impl DevicePreference {
    /// Parse a configured value, treating unknown strings as `Auto`.
    pub fn from_config(value: &str) -> Self {
        value.parse().unwrap_or_else(|e| {
            warn!("{}, using auto", e);
            DevicePreference::Auto
        })
    }

    pub fn select(self) -> Device {
        match self {
            DevicePreference::Auto => BEST_DEVICE.get_or_init(detect_best_device).clone(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => cuda_device().unwrap_or(Device::Cpu),
            DevicePreference::Metal => metal_device().unwrap_or(Device::Cpu),
        }
    }
}

fn detect_best_device() -> Device {
    info!("Detecting best available compute device...");

    if let Some(device) = cuda_device() {
        info!("Selected CUDA GPU for inference");
        return device;
    }
    if let Some(device) = metal_device() {
        info!("Selected Metal GPU for inference");
        return device;
    }

    info!("Using CPU for inference (no GPU acceleration available)");
    Device::Cpu
}

fn cuda_device() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("CUDA not available: {}", e);
            None
        }
    }
}

fn metal_device() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("Metal not available: {}", e);
            None
        }
    }
}

/// Human-readable device name for logs and the metrics endpoint.
pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "CUDA"
    } else if device.is_metal() {
        "Metal"
    } else {
        "CPU"
    }
}
