//! Device and precision selection for loading calibration checkpoints.
//!
//! Unlike inference, calibration must see the weights at the precision the
//! caller asks for, so explicit precision requests are honoured on every
//! device. Only `auto` falls back to a device-specific choice.

use candle_core::{DType, Device};
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl DeviceKind {
    pub fn is_cpu(&self) -> bool {
        matches!(self, DeviceKind::Cpu)
    }

    pub fn is_metal(&self) -> bool {
        matches!(self, DeviceKind::Metal)
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, DeviceKind::Cuda)
    }
}

/// Device capabilities relevant to precision selection
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Whether the device supports bfloat16 kernels
    pub supports_bf16: bool,
    /// Whether the device has unified memory (Apple Silicon)
    pub has_unified_memory: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub device: Device,
    pub kind: DeviceKind,
    pub capabilities: DeviceCapabilities,
}

impl DeviceProfile {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
            capabilities: DeviceCapabilities::default(),
        }
    }

    /// Resolve a precision request.
    ///
    /// `requested` follows the usual spellings (`float16`/`f16`,
    /// `bfloat16`/`bf16`, `float32`/`f32`, `auto`). For `auto` the
    /// checkpoint's own `torch_dtype` wins when present, otherwise the
    /// device's preferred precision is used.
    pub fn select_dtype(&self, requested: Option<&str>, checkpoint: Option<&str>) -> Result<DType> {
        let requested = requested.map(str::trim).unwrap_or("auto");
        let dtype = match parse_dtype(requested) {
            Some(dtype) => dtype,
            None if requested.eq_ignore_ascii_case("auto") || requested.is_empty() => checkpoint
                .and_then(parse_dtype)
                .unwrap_or_else(|| self.optimal_dtype()),
            None => {
                return Err(Error::ConfigError(format!(
                    "Unsupported precision '{requested}'"
                )))
            }
        };

        debug!(
            "Selected dtype {:?} for device {:?} (requested: {}, checkpoint: {:?})",
            dtype, self.kind, requested, checkpoint
        );

        Ok(dtype)
    }

    /// Preferred precision when nothing was requested.
    pub fn optimal_dtype(&self) -> DType {
        match self.kind {
            DeviceKind::Cpu | DeviceKind::Metal => DType::F32,
            DeviceKind::Cuda => {
                if self.capabilities.supports_bf16 {
                    DType::BF16
                } else {
                    DType::F16
                }
            }
        }
    }

    pub fn has_unified_memory(&self) -> bool {
        self.capabilities.has_unified_memory
    }
}

pub fn parse_dtype(raw: &str) -> Option<DType> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "float32" | "f32" | "fp32" => Some(DType::F32),
        "float16" | "f16" | "fp16" | "half" => Some(DType::F16),
        "bfloat16" | "bf16" => Some(DType::BF16),
        _ => None,
    }
}

pub struct DeviceSelector;

impl DeviceSelector {
    fn try_metal() -> Option<DeviceProfile> {
        let device = std::panic::catch_unwind(|| Device::new_metal(0)).ok()?.ok()?;
        if device.is_metal() {
            Some(DeviceProfile {
                device,
                kind: DeviceKind::Metal,
                capabilities: DeviceCapabilities {
                    supports_bf16: false,
                    has_unified_memory: true,
                },
            })
        } else {
            None
        }
    }

    fn try_cuda(ordinal: usize) -> Option<DeviceProfile> {
        let device = std::panic::catch_unwind(|| Device::new_cuda(ordinal))
            .ok()?
            .ok()?;
        if device.is_cuda() {
            Some(DeviceProfile {
                device,
                kind: DeviceKind::Cuda,
                capabilities: DeviceCapabilities {
                    // Ampere and newer; older cards fall back to f16 via `auto`.
                    supports_bf16: true,
                    has_unified_memory: false,
                },
            })
        } else {
            None
        }
    }

    pub fn detect() -> DeviceProfile {
        if cfg!(target_os = "macos") {
            if let Some(profile) = Self::try_metal() {
                info!("Using Metal device for calibration");
                return profile;
            }
        } else if let Some(profile) = Self::try_cuda(0) {
            info!("Using CUDA device for calibration");
            return profile;
        }

        info!("Falling back to CPU for calibration");
        DeviceProfile::cpu()
    }

    /// Resolve a device placement directive.
    ///
    /// Unavailable accelerators are an error here rather than a silent
    /// fallback: calibration statistics depend on where weights live.
    pub fn detect_with_preference(preference: Option<&str>) -> Result<DeviceProfile> {
        let preference = preference.map(str::trim).unwrap_or("auto").to_ascii_lowercase();
        match preference.as_str() {
            "" | "auto" => Ok(Self::detect()),
            "cpu" => Ok(DeviceProfile::cpu()),
            "metal" | "mps" => Self::try_metal().ok_or_else(|| {
                Error::ConfigError("Metal device requested but not available".to_string())
            }),
            other => {
                let ordinal = match other.strip_prefix("cuda") {
                    Some("") => 0,
                    Some(rest) => rest
                        .strip_prefix(':')
                        .and_then(|idx| idx.parse::<usize>().ok())
                        .ok_or_else(|| {
                            Error::ConfigError(format!("Invalid device directive '{other}'"))
                        })?,
                    None => {
                        return Err(Error::ConfigError(format!(
                            "Invalid device directive '{other}'"
                        )))
                    }
                };
                Self::try_cuda(ordinal).ok_or_else(|| {
                    Error::ConfigError(format!("CUDA device {ordinal} requested but not available"))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_with_cpu_preference_returns_cpu() {
        let profile = DeviceSelector::detect_with_preference(Some("cpu")).unwrap();
        assert_eq!(profile.kind, DeviceKind::Cpu);
        assert!(profile.device.is_cpu());
        assert!(!profile.has_unified_memory());
    }

    #[test]
    fn test_detect_kind_matches_device() {
        let profile = DeviceSelector::detect();
        match profile.kind {
            DeviceKind::Cpu => assert!(profile.device.is_cpu()),
            DeviceKind::Metal => {
                assert!(profile.device.is_metal());
                assert!(profile.has_unified_memory());
            }
            DeviceKind::Cuda => assert!(profile.device.is_cuda()),
        }
    }

    #[test]
    fn test_invalid_directive_is_config_error() {
        let err = DeviceSelector::detect_with_preference(Some("tpu")).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
        let err = DeviceSelector::detect_with_preference(Some("cuda:x")).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_explicit_requests_are_honoured_on_cpu() {
        let cpu = DeviceProfile::cpu();
        assert_eq!(cpu.select_dtype(Some("bf16"), None).unwrap(), DType::BF16);
        assert_eq!(cpu.select_dtype(Some("float16"), None).unwrap(), DType::F16);
        assert_eq!(cpu.select_dtype(Some("f32"), Some("bfloat16")).unwrap(), DType::F32);
    }

    #[test]
    fn test_auto_prefers_checkpoint_dtype() {
        let cpu = DeviceProfile::cpu();
        assert_eq!(cpu.select_dtype(Some("auto"), Some("bfloat16")).unwrap(), DType::BF16);
        assert_eq!(cpu.select_dtype(None, None).unwrap(), DType::F32);
    }

    #[test]
    fn test_cuda_auto_selection() {
        let cuda_profile = DeviceProfile {
            device: Device::Cpu,
            kind: DeviceKind::Cuda,
            capabilities: DeviceCapabilities {
                supports_bf16: true,
                ..Default::default()
            },
        };
        assert_eq!(cuda_profile.select_dtype(None, None).unwrap(), DType::BF16);
        assert_eq!(cuda_profile.select_dtype(Some("f16"), None).unwrap(), DType::F16);
    }

    #[test]
    fn test_unknown_precision_rejected() {
        let err = DeviceProfile::cpu().select_dtype(Some("int3"), None).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
