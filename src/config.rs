//! Engine configuration and block layout derivation.

use crate::block::MAX_BLOCK_SIZE;
use crate::error::{Error, Result};

/// Fraction of the requested latency reserved for scheduling jitter.
const LATENCY_JITTER: f64 = 0.25;

/// User-facing engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Desired latency in milliseconds.
    pub latency_ms: u32,
    /// Sample frequency in Hz.
    pub sample_freq: u32,
    /// Control frequency in Hz (rate of control-value updates).
    pub control_freq: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            latency_ms: 50,
            sample_freq: 44100,
            control_freq: 50,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.sample_freq < 1000 {
            return Err(Error::InvalidConfig(format!(
                "sample_freq {} below 1000 Hz",
                self.sample_freq
            )));
        }
        if self.latency_ms == 0 {
            return Err(Error::InvalidConfig("latency_ms must be > 0".into()));
        }
        if self.control_freq == 0 || self.control_freq > self.sample_freq {
            return Err(Error::InvalidConfig(format!(
                "control_freq {} out of range (1..={})",
                self.control_freq, self.sample_freq
            )));
        }
        Ok(())
    }
}

/// Derived per-configuration block layout, fixed between reconfigurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: usize,
    pub control_raster: usize,
    pub sample_freq: u32,
}

impl BlockLayout {
    /// Derive block size and control raster from a validated configuration.
    ///
    /// `block_size` covers the requested latency minus a jitter reserve,
    /// clamped to `[8, min(MAX_BLOCK_SIZE / 2, sample_freq / 6)]` and
    /// aligned down to a multiple of 4. `control_raster` is the
    /// sample/control frequency ratio rounded to a power of two no larger
    /// than the block size.
    pub fn derive(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let raw = config.latency_ms as f64 * config.sample_freq as f64 / 1000.0
            / (1.0 + LATENCY_JITTER);
        let upper = (MAX_BLOCK_SIZE / 2).min(config.sample_freq as usize / 6);
        let mut block_size = (raw as usize).clamp(8, upper);
        block_size &= !3;
        debug_assert!(block_size >= 8);

        let ratio =
            (config.sample_freq as f64 / config.control_freq as f64).round() as usize;
        let mut control_raster = ratio.max(1).next_power_of_two();
        while control_raster > block_size {
            control_raster /= 2;
        }

        Ok(Self {
            block_size,
            control_raster,
            sample_freq: config.sample_freq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.sample_freq = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.latency_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.control_freq = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_layout_50ms_44100_50() {
        let layout = BlockLayout::derive(&EngineConfig {
            latency_ms: 50,
            sample_freq: 44100,
            control_freq: 50,
        })
        .unwrap();
        assert!(layout.block_size >= 8 && layout.block_size <= 7350);
        assert_eq!(layout.block_size % 4, 0);
        assert!(layout.control_raster.is_power_of_two());
        assert!(layout.control_raster <= layout.block_size);
    }

    #[test]
    fn test_layout_clamps_tiny_latency() {
        let layout = BlockLayout::derive(&EngineConfig {
            latency_ms: 1,
            sample_freq: 8000,
            control_freq: 50,
        })
        .unwrap();
        assert!(layout.block_size >= 8);
        assert_eq!(layout.block_size % 4, 0);
    }

    #[test]
    fn test_layout_clamps_huge_latency() {
        let layout = BlockLayout::derive(&EngineConfig {
            latency_ms: 10_000,
            sample_freq: 48000,
            control_freq: 100,
        })
        .unwrap();
        assert!(layout.block_size <= MAX_BLOCK_SIZE / 2);
        assert!(layout.control_raster <= layout.block_size);
    }
}
