//! Device selection and topology detection
//!
//! The compute topology is resolved once at model construction and exposed as
//! an immutable descriptor: the list of devices the model is replicated
//! across, with the primary device first. Multiple CUDA devices mean
//! data-parallel replication; Metal and CPU are always a single device.

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Upper bound on enumerated CUDA devices.
#[cfg(feature = "cuda")]
const MAX_CUDA_DEVICES: usize = 8;

/// Device preference for model placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevicePreference {
    Cuda,
    Metal,
    Cpu,
    Auto,
}

impl Default for DevicePreference {
    fn default() -> Self {
        Self::Auto
    }
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            _ => Err(anyhow::anyhow!(
                "Invalid device preference: {}. Valid options: cuda, metal, cpu, auto",
                s
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Immutable description of the devices a model runs on.
///
/// Invariant: `devices` is non-empty and the primary device is first.
#[derive(Debug, Clone)]
pub struct DeviceTopology {
    devices: Vec<Device>,
}

impl DeviceTopology {
    /// Detect the topology for a preference. Never fails to CPU-only.
    pub fn detect(preference: DevicePreference) -> Result<Self> {
        let devices = match preference {
            DevicePreference::Cpu => {
                tracing::info!("CPU device selected");
                vec![Device::Cpu]
            }
            DevicePreference::Cuda => {
                let found = enumerate_cuda();
                if found.is_empty() {
                    tracing::warn!("CUDA requested but unavailable, falling back to CPU");
                    vec![Device::Cpu]
                } else {
                    found
                }
            }
            DevicePreference::Metal => match new_metal() {
                Some(device) => vec![device],
                None => {
                    tracing::warn!("Metal requested but unavailable, falling back to CPU");
                    vec![Device::Cpu]
                }
            },
            DevicePreference::Auto => {
                let cuda = enumerate_cuda();
                if !cuda.is_empty() {
                    cuda
                } else if let Some(metal) = new_metal() {
                    vec![metal]
                } else {
                    tracing::info!("Auto-selected: CPU");
                    vec![Device::Cpu]
                }
            }
        };

        tracing::info!("{} device(s) in use", devices.len());
        Ok(Self { devices })
    }

    /// All devices, primary first.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The primary device.
    pub fn primary(&self) -> &Device {
        &self.devices[0]
    }

    /// Number of devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Whether the model is replicated across more than one device.
    pub fn is_replicated(&self) -> bool {
        self.devices.len() > 1
    }
}

#[cfg(feature = "cuda")]
fn enumerate_cuda() -> Vec<Device> {
    let mut devices = Vec::new();
    for ordinal in 0..MAX_CUDA_DEVICES {
        match Device::new_cuda(ordinal) {
            Ok(device) => {
                tracing::info!("CUDA device {} available", ordinal);
                devices.push(device);
            }
            Err(_) => break,
        }
    }
    devices
}

#[cfg(not(feature = "cuda"))]
fn enumerate_cuda() -> Vec<Device> {
    Vec::new()
}

fn new_metal() -> Option<Device> {
    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                tracing::info!("Metal device selected");
                return Some(device);
            }
            Err(e) => {
                tracing::warn!("Metal initialization failed: {}", e);
            }
        }
    }
    None
}
