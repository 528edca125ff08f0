//! Compile-time defaults and runtime configuration for the page store.

use core::fmt;

use crate::addr::Ppn;
use crate::log::LogLevel;

/// Default verbosity threshold for the kernel log.
pub const MAX_LOG_LEVEL: LogLevel = LogLevel::Debug;

/// Default number of physical pages a store manages.
pub const DEFAULT_MAX_PAGES: usize = 4096;

/// Default frame number of page index 0 (physical `0x8000_0000`, the usual
/// start of DRAM on RISC-V boards).
pub const DEFAULT_BASE_PPN: u64 = 0x8_0000;

/// Configuration of a physical page store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Number of physical pages, i.e. `MAX_PAGES`.
    pub max_pages: usize,
    /// Frame number of page index 0; page `i` has frame `base_ppn + i`.
    pub base_ppn: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            base_ppn: DEFAULT_BASE_PPN,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_pages` is zero.
    NoPages,
    /// The highest frame number does not fit in a page-table entry.
    PpnOverflow,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoPages => write!(f, "store must manage at least one page"),
            ConfigError::PpnOverflow => write!(f, "frame numbers exceed the PTE frame field"),
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with the default frame base.
    pub const fn with_pages(max_pages: usize) -> Self {
        Self {
            max_pages,
            base_ppn: DEFAULT_BASE_PPN,
        }
    }

    /// Checks that every page index maps to a representable frame number.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pages == 0 {
            return Err(ConfigError::NoPages);
        }
        let last = self
            .base_ppn
            .checked_add(self.max_pages as u64 - 1)
            .ok_or(ConfigError::PpnOverflow)?;
        if !Ppn::fits(last) {
            return Err(ConfigError::PpnOverflow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(StoreConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_pages_rejected() {
        assert_eq!(StoreConfig::with_pages(0).validate(), Err(ConfigError::NoPages));
    }

    #[test]
    fn frame_overflow_rejected() {
        let config = StoreConfig {
            max_pages: 2,
            base_ppn: (1 << 44) - 1,
        };
        assert_eq!(config.validate(), Err(ConfigError::PpnOverflow));

        let config = StoreConfig {
            max_pages: 2,
            base_ppn: u64::MAX,
        };
        assert_eq!(config.validate(), Err(ConfigError::PpnOverflow));
    }
}
