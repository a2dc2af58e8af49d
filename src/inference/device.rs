use anyhow::{anyhow, Result};
use candle::Device;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Cpu,
    Cuda(usize),
}

impl DevicePreference {
    /// Accepts `cpu`, `cuda`, `cuda:N`, `gpu`, `gpu:N`. Anything else falls
    /// back to the CPU with a warning.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.is_empty() || lower == "cpu" {
            DevicePreference::Cpu
        } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
            let ordinal = trimmed
                .split(':')
                .nth(1)
                .and_then(|part| part.trim().parse::<usize>().ok())
                .unwrap_or(0);
            DevicePreference::Cuda(ordinal)
        } else {
            warn!("unrecognized device value '{}', defaulting to cpu", trimmed);
            DevicePreference::Cpu
        }
    }

    pub fn build(self) -> Result<Device> {
        match self {
            DevicePreference::Cpu => Ok(Device::Cpu),
            DevicePreference::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|err| {
                anyhow!(
                    "failed to initialize CUDA device {ordinal} ({err}). Build with the `cuda` \
                     feature and ensure CUDA libraries are available."
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_strings() {
        assert_eq!(DevicePreference::parse("cpu"), DevicePreference::Cpu);
        assert_eq!(DevicePreference::parse(" CPU "), DevicePreference::Cpu);
        assert_eq!(DevicePreference::parse("cuda"), DevicePreference::Cuda(0));
        assert_eq!(DevicePreference::parse("cuda:1"), DevicePreference::Cuda(1));
        assert_eq!(DevicePreference::parse("gpu:2"), DevicePreference::Cuda(2));
        assert_eq!(DevicePreference::parse("tpu"), DevicePreference::Cpu);
    }

    #[test]
    fn cpu_always_builds() {
        assert!(DevicePreference::Cpu.build().unwrap().is_cpu());
    }
}
