use candle_core::{ DType, Device };
use std::fmt;
use std::str::FromStr;

use super::GenerationError;

/// Where the checkpoint is placed; fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    pub fn to_device(self) -> Result<Device, GenerationError> {
        let device = match self {
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }

    /// Half precision on accelerators, full precision on the CPU.
    pub fn default_dtype(self) -> DType {
        match self {
            DeviceSpec::Cpu => DType::F32,
            DeviceSpec::Cuda(_) | DeviceSpec::Metal(_) => DType::F16,
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| GenerationError::UnsupportedDevice(s.to_string()))?;
                (kind, ordinal)
            }
            None => (lower.as_str(), 0),
        };
        match kind {
            "cpu" if ordinal == 0 => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(ordinal)),
            "metal" | "mps" => Ok(DeviceSpec::Metal(ordinal)),
            _ => Err(GenerationError::UnsupportedDevice(s.to_string())),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DeviceSpec::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

pub fn parse_dtype(s: &str) -> Result<DType, GenerationError> {
    match s.trim().to_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        _ => Err(GenerationError::UnsupportedDtype(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_strings() {
        assert_eq!("cuda".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(0));
        assert_eq!("CUDA:1".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(1));
        assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
        assert_eq!("mps".parse::<DeviceSpec>().unwrap(), DeviceSpec::Metal(0));
        assert!("tpu".parse::<DeviceSpec>().is_err());
        assert!("cuda:x".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn accelerators_default_to_half_precision() {
        assert_eq!(DeviceSpec::Cpu.default_dtype(), DType::F32);
        assert_eq!(DeviceSpec::Cuda(0).default_dtype(), DType::F16);
        assert_eq!(parse_dtype("bf16").unwrap(), DType::BF16);
        assert!(parse_dtype("int4").is_err());
    }
}
