//! Pool configuration types
//!
//! This module contains the pool configuration and presets for common
//! container sizes. All byte-granularity knobs must be powers of two; the
//! external address range must be able to hold one aliased view per format.

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Number of aliased format views in the external address range.
pub const FORMAT_VIEWS: u32 = 4;

/// Configuration for a tile pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Container width in slots
    pub grid_width: u16,
    /// Container height in slots
    pub grid_height: u16,
    /// Physical page size in bytes (power of two, one page backs one slot)
    pub page_size: u32,
    /// Alignment applied when the caller passes zero (bytes, power of two)
    pub default_align: u32,
    /// Minimum packing granularity (bytes, power of two)
    pub granularity: u32,
    /// Derive external block ids from the block address instead of the
    /// cyclic id generator
    pub ssptr_id: bool,
    /// Base of the external aliased address range
    pub alias_base: u32,
}

/// Preset container sizes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum GridPreset {
    /// 256x128 slots, the full-size container
    Standard,
    /// 128x64 slots, for constrained hosts and tests
    Compact,
    /// Explicit dimensions
    Custom { grid_width: u16, grid_height: u16 },
}

impl GridPreset {
    pub fn grid_width(self) -> u16 {
        match self {
            GridPreset::Standard => 256,
            GridPreset::Compact => 128,
            GridPreset::Custom { grid_width, .. } => grid_width,
        }
    }

    pub fn grid_height(self) -> u16 {
        match self {
            GridPreset::Standard => 128,
            GridPreset::Compact => 64,
            GridPreset::Custom { grid_height, .. } => grid_height,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            grid_width: 256,
            grid_height: 128,
            page_size: 4096,
            default_align: 4096,
            granularity: 128,
            ssptr_id: true,
            alias_base: 0x6000_0000,
        }
    }
}

impl PoolConfig {
    /// Build a configuration from a container preset, leaving the byte
    /// granularity knobs at their defaults.
    pub fn from_preset(preset: GridPreset) -> Self {
        PoolConfig {
            grid_width: preset.grid_width(),
            grid_height: preset.grid_height(),
            ..PoolConfig::default()
        }
    }

    /// Total number of slots in the container.
    pub fn total_slots(&self) -> u32 {
        self.grid_width as u32 * self.grid_height as u32
    }

    /// Size in bytes of one aliased format view.
    pub fn view_size(&self) -> u32 {
        self.total_slots() * self.page_size
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// `InvalidConfiguration` naming the offending field.
    pub fn validate(&self) -> PoolResult<()> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(PoolError::InvalidConfiguration(
                "container dimensions must be nonzero".to_string(),
            ));
        }
        if !self.page_size.is_power_of_two() || self.page_size < 256 {
            return Err(PoolError::InvalidConfiguration(format!(
                "page size {} must be a power of two of at least 256 bytes",
                self.page_size
            )));
        }
        if self.default_align == 0
            || !self.default_align.is_power_of_two()
            || self.default_align > self.page_size
        {
            return Err(PoolError::InvalidConfiguration(format!(
                "default alignment {} must be a power of two no larger than the page size",
                self.default_align
            )));
        }
        if self.granularity == 0
            || !self.granularity.is_power_of_two()
            || self.granularity > self.page_size
        {
            return Err(PoolError::InvalidConfiguration(format!(
                "granularity {} must be a power of two between 1 and the page size",
                self.granularity
            )));
        }
        let span = self.total_slots() as u64 * self.page_size as u64 * FORMAT_VIEWS as u64;
        if self.alias_base as u64 + span > u32::MAX as u64 + 1 {
            return Err(PoolError::InvalidConfiguration(format!(
                "aliased views do not fit above base {:#x}",
                self.alias_base
            )));
        }
        Ok(())
    }
}
