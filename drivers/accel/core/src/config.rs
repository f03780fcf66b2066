//! # Configuration
//!
//! Tunables for the DMA page pool and the inference service.

use crate::error::{Error, Result};
use crate::types::{DmaAddr, PAGE_SIZE};

/// Largest pool the 8-bit page handle can address
pub const MAX_POOL_PAGES: usize = 256;

/// Most pages ever lent to the host as response pages
pub const MAX_RESPONSE_PAGES: usize = 32;

/// Refill the host once fewer response pages than this are outstanding
pub const MIN_RESPONSE_PAGES: usize = 8;

// =============================================================================
// POOL CONFIGURATION
// =============================================================================

/// DMA page pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of pages
    pub capacity: usize,
    /// Bus address of page 0; page `n` lives at `base + n * PAGE_SIZE`
    pub base: DmaAddr,
    /// Most pages lent out as response pages at once
    pub response_max: usize,
    /// Low-water mark of outstanding response pages
    pub response_low_water: usize,
    /// Pool name for debugging
    pub name: &'static str,
}

impl PoolConfig {
    /// Pool of `capacity` pages at `base`
    pub const fn new(capacity: usize, base: DmaAddr) -> Self {
        Self {
            capacity,
            base,
            response_max: MAX_RESPONSE_PAGES,
            response_low_water: MIN_RESPONSE_PAGES,
            name: "dma_page_pool",
        }
    }

    /// Check limits
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.capacity > MAX_POOL_PAGES {
            return Err(Error::InvalidParameter);
        }
        if self.base.raw() % PAGE_SIZE as u64 != 0 {
            return Err(Error::InvalidParameter);
        }
        if self.response_max > self.capacity || self.response_low_water > self.response_max {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(64, DmaAddr::new(0x1_0000_0000))
    }
}

// =============================================================================
// SERVICE CONFIGURATION
// =============================================================================

/// Inference service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Page pool used for staging host payloads
    pub pool: PoolConfig,
    /// Bytes of an execution error message kept in the error list
    pub max_error_message: usize,
    /// Largest packed error list sent to the host
    pub max_error_list_bytes: usize,
    /// Largest number of items in one command list
    pub max_cmdlist_items: usize,
}

impl ServiceConfig {
    /// Check limits
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.max_error_list_bytes > u16::MAX as usize || self.max_error_list_bytes == 0 {
            return Err(Error::InvalidParameter);
        }
        if self.max_cmdlist_items == 0 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            max_error_message: 2 * PAGE_SIZE,
            max_error_list_bytes: u16::MAX as usize,
            max_cmdlist_items: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_pool_limits() {
        let mut config = PoolConfig::new(0, DmaAddr::null());
        assert_eq!(config.validate(), Err(Error::InvalidParameter));
        config.capacity = MAX_POOL_PAGES + 1;
        assert_eq!(config.validate(), Err(Error::InvalidParameter));
        config.capacity = MAX_POOL_PAGES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_misaligned_base() {
        let config = PoolConfig::new(16, DmaAddr::new(0x1001));
        assert_eq!(config.validate(), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_response_marks() {
        let mut config = PoolConfig::new(16, DmaAddr::null());
        assert_eq!(config.validate(), Err(Error::InvalidParameter));
        config.response_max = 8;
        config.response_low_water = 4;
        assert!(config.validate().is_ok());
    }
}
