//! Dispatch tuning and device limits.

use crate::error::{DispatchError, Result};

/// Environment variable overriding the convolution block sizes, formatted
/// as `"width,height,depth"`.
pub const BLOCK_ENV: &str = "GPGPU_CONV_BLOCK";

/// Group-count ceiling of the reference hardware profile.
pub const REFERENCE_MAX_GROUPS: u32 = 65_535;

/// Work assigned to a single invocation along each dispatch axis.
///
/// The reserved fields are carried so that an auto-tuner can extend the
/// record without changing its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningConfig {
    pub block_width: u32,
    pub block_height: u32,
    pub block_depth: u32,
    pub reserved: [u32; 3],
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self::conv_default()
    }
}

impl TuningConfig {
    /// `(1, 16, 1, 1, 1, 1)`, matching the tiling of the convolution kernel.
    pub const fn conv_default() -> Self {
        TuningConfig {
            block_width: 1,
            block_height: 16,
            block_depth: 1,
            reserved: [1, 1, 1],
        }
    }

    pub fn blocks(&self) -> [u32; 3] {
        [self.block_width, self.block_height, self.block_depth]
    }

    pub fn validate(&self) -> Result<()> {
        if self.blocks().contains(&0) {
            return Err(DispatchError::Configuration(format!(
                "block sizes must be non-zero, got {:?}",
                self.blocks()
            )));
        }
        Ok(())
    }

    /// Parse `"w,h,d"`.
    pub fn parse_blocks(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split(',').map(str::trim).collect();
        let parsed: Vec<u32> = parts
            .iter()
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| DispatchError::Configuration(format!("bad block size in '{text}': {e}")))?;
        let [block_width, block_height, block_depth] = parsed[..] else {
            return Err(DispatchError::Configuration(format!(
                "expected three block sizes, got '{text}'"
            )));
        };
        let config = TuningConfig {
            block_width,
            block_height,
            block_depth,
            ..Self::conv_default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overridden by [`BLOCK_ENV`] when it parses.
    pub fn from_env() -> Self {
        match std::env::var(BLOCK_ENV) {
            Ok(value) => match Self::parse_blocks(&value) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("ignoring {BLOCK_ENV}: {e}");
                    Self::conv_default()
                }
            },
            Err(_) => Self::conv_default(),
        }
    }
}

/// Compute limits relevant to dispatch sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum workgroup count along any single dispatch axis.
    pub max_groups_per_dimension: u32,
    pub max_workgroup_size: [u32; 3],
    pub max_invocations_per_workgroup: u32,
}

impl DeviceLimits {
    /// Profile used when no device is available to ask.
    pub const fn reference() -> Self {
        DeviceLimits {
            max_groups_per_dimension: REFERENCE_MAX_GROUPS,
            max_workgroup_size: [256, 256, 64],
            max_invocations_per_workgroup: 256,
        }
    }

    /// Check a local workgroup size against the per-axis and total limits.
    pub fn check_local_size(&self, local: [u32; 3]) -> Result<()> {
        let within_axes = local
            .iter()
            .zip(self.max_workgroup_size.iter())
            .all(|(size, max)| *size >= 1 && size <= max);
        let invocations: u64 = local.iter().map(|&s| s as u64).product();
        if !within_axes || invocations > self.max_invocations_per_workgroup as u64 {
            return Err(DispatchError::Configuration(format!(
                "local size {local:?} exceeds device workgroup limits {:?} / {}",
                self.max_workgroup_size, self.max_invocations_per_workgroup
            )));
        }
        Ok(())
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::reference()
    }
}

impl From<&wgpu::Limits> for DeviceLimits {
    fn from(limits: &wgpu::Limits) -> Self {
        DeviceLimits {
            max_groups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_workgroup_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tuning_matches_conv_tiling() {
        let config = TuningConfig::default();
        assert_eq!(config.blocks(), [1, 16, 1]);
        assert_eq!(config.reserved, [1, 1, 1]);
    }

    #[test]
    fn block_override_parses_three_sizes() {
        let config = TuningConfig::parse_blocks("2, 8,1").unwrap();
        assert_eq!(config.blocks(), [2, 8, 1]);
        assert!(TuningConfig::parse_blocks("2,8").is_err());
        assert!(TuningConfig::parse_blocks("2,x,1").is_err());
        assert!(TuningConfig::parse_blocks("0,8,1").is_err());
    }

    #[test]
    fn local_size_limits() {
        let limits = DeviceLimits::reference();
        assert!(limits.check_local_size([1, 16, 4]).is_ok());
        assert!(limits.check_local_size([16, 16, 2]).is_err());
        assert!(limits.check_local_size([1, 1, 65]).is_err());
        assert!(limits.check_local_size([0, 1, 1]).is_err());
    }

    #[test]
    fn wgpu_downlevel_limits_translate() {
        let limits = DeviceLimits::from(&wgpu::Limits::downlevel_defaults());
        assert_eq!(limits.max_groups_per_dimension, REFERENCE_MAX_GROUPS);
        assert_eq!(limits, DeviceLimits::reference());
    }
}
