//! Device selection for the execution context.

use candle_core::Device;
use tracing::info;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cuda => "cuda",
            DeviceKind::Metal => "metal",
            DeviceKind::Cpu => "cpu",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub device: Device,
    pub kind: DeviceKind,
}

impl DeviceProfile {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
        }
    }
}

pub struct DeviceSelector;

impl DeviceSelector {
    fn try_metal() -> Option<DeviceProfile> {
        let device = std::panic::catch_unwind(|| Device::metal_if_available(0))
            .ok()?
            .ok()?;
        device.is_metal().then_some(DeviceProfile {
            device,
            kind: DeviceKind::Metal,
        })
    }

    fn try_cuda() -> Option<DeviceProfile> {
        let device = std::panic::catch_unwind(|| Device::cuda_if_available(0))
            .ok()?
            .ok()?;
        device.is_cuda().then_some(DeviceProfile {
            device,
            kind: DeviceKind::Cuda,
        })
    }

    pub fn detect() -> Result<DeviceProfile> {
        if cfg!(target_os = "macos") {
            if let Some(profile) = Self::try_metal() {
                info!("Using Metal device for scheduling");
                return Ok(profile);
            }
        } else if let Some(profile) = Self::try_cuda() {
            info!("Using CUDA device for scheduling");
            return Ok(profile);
        }

        info!("Falling back to CPU for scheduling");
        Ok(DeviceProfile::cpu())
    }

    /// Honor `cpu`, `cuda` or `metal`/`mps`; anything else auto-detects.
    pub fn detect_with_preference(preference: Option<&str>) -> Result<DeviceProfile> {
        match preference.unwrap_or("") {
            "cuda" => match Self::try_cuda() {
                Some(profile) => Ok(profile),
                None => Self::detect(),
            },
            "metal" | "mps" => match Self::try_metal() {
                Some(profile) => Ok(profile),
                None => Self::detect(),
            },
            "cpu" => Ok(DeviceProfile::cpu()),
            _ => Self::detect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_preference_returns_cpu() {
        let profile = DeviceSelector::detect_with_preference(Some("cpu")).unwrap();
        assert_eq!(profile.kind, DeviceKind::Cpu);
        assert!(profile.device.is_cpu());
    }

    #[test]
    fn detected_kind_matches_device() {
        let profile = DeviceSelector::detect().unwrap();
        match profile.kind {
            DeviceKind::Cpu => assert!(profile.device.is_cpu()),
            DeviceKind::Metal => assert!(profile.device.is_metal()),
            DeviceKind::Cuda => assert!(profile.device.is_cuda()),
        }
    }
}
