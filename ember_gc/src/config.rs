//! Heap configuration parameters.
//!
//! The collector itself lives outside ember; these knobs describe the
//! contract the runtime and the code generator agree on with it: TLAB
//! geometry, card granularity, which read barrier the emitted code uses
//! and whether references are poisoned in the heap.

use std::fmt;
use std::str::FromStr;

/// Read-barrier scheme chosen by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadBarrierKind {
    /// Baker-style: test the holder's gray bit and mark the referent on gray.
    #[default]
    Baker,
    /// Call a runtime entry for every reference load.
    Slow,
    /// No read barrier.
    None,
}

impl ReadBarrierKind {
    /// Whether reference loads need any barrier at all.
    #[inline]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, ReadBarrierKind::None)
    }
}

impl fmt::Display for ReadBarrierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadBarrierKind::Baker => "baker",
            ReadBarrierKind::Slow => "slow",
            ReadBarrierKind::None => "none",
        })
    }
}

impl FromStr for ReadBarrierKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "baker" => Ok(ReadBarrierKind::Baker),
            "slow" | "table" => Ok(ReadBarrierKind::Slow),
            "none" | "off" => Ok(ReadBarrierKind::None),
            _ => Err(ConfigError::UnknownReadBarrier),
        }
    }
}

/// Configuration for the managed heap.
///
/// # Example
///
/// ```
/// use ember_gc::{GcConfig, ReadBarrierKind};
///
/// let config = GcConfig {
///     tlab_size: 64 * 1024,
///     read_barrier: ReadBarrierKind::None,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    // =========================================================================
    // Allocation
    // =========================================================================
    /// Total heap capacity in bytes.
    ///
    /// Default: 64MB
    pub heap_capacity: usize,

    /// Size of each thread-local allocation buffer handed out on refill.
    ///
    /// Default: 32KB
    pub tlab_size: usize,

    /// Allocate from TLABs; when false every allocation takes the shared path.
    ///
    /// Default: true
    pub use_tlab: bool,

    /// Alignment of every object in bytes.
    ///
    /// Default: 8
    pub object_alignment: usize,

    // =========================================================================
    // Barriers
    // =========================================================================
    /// Log2 of the card size used by the write barrier.
    ///
    /// Default: 10 (1KB cards)
    pub card_shift: u32,

    /// Read barrier scheme.
    ///
    /// Default: Baker
    pub read_barrier: ReadBarrierKind,

    /// Store references in the heap xor-poisoned.
    ///
    /// Default: false
    pub heap_poisoning: bool,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Check TLAB and heap invariants on every allocation.
    ///
    /// Default: enabled in debug builds
    pub verify_heap: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            heap_capacity: 64 * 1024 * 1024,
            tlab_size: 32 * 1024,
            use_tlab: true,
            object_alignment: 8,
            card_shift: 10,
            read_barrier: ReadBarrierKind::Baker,
            heap_poisoning: false,
            verify_heap: cfg!(debug_assertions),
        }
    }
}

impl GcConfig {
    /// Small heap suited to unit tests.
    pub fn testing() -> Self {
        Self {
            heap_capacity: 4 * 1024 * 1024,
            tlab_size: 4 * 1024,
            verify_heap: true,
            ..Default::default()
        }
    }

    /// Configuration without read barriers, for a non-concurrent collector.
    pub fn non_concurrent() -> Self {
        Self {
            read_barrier: ReadBarrierKind::None,
            ..Default::default()
        }
    }

    /// Card size in bytes.
    #[inline]
    pub const fn card_size(&self) -> usize {
        1 << self.card_shift
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_capacity < 64 * 1024 {
            return Err(ConfigError::HeapTooSmall);
        }
        if self.use_tlab && (self.tlab_size < 256 || self.tlab_size > self.heap_capacity / 4) {
            return Err(ConfigError::InvalidTlabSize);
        }
        if !self.object_alignment.is_power_of_two() || self.object_alignment < 4 {
            return Err(ConfigError::InvalidAlignment);
        }
        if !(7..=16).contains(&self.card_shift) {
            return Err(ConfigError::InvalidCardShift);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Heap capacity is below 64KB.
    HeapTooSmall,
    /// TLAB size is outside `[256, heap_capacity / 4]`.
    InvalidTlabSize,
    /// Alignment must be a power of two, minimum 4.
    InvalidAlignment,
    /// Card shift must be in `7..=16`.
    InvalidCardShift,
    /// Unrecognized read barrier name.
    UnknownReadBarrier,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::HeapTooSmall => write!(f, "heap capacity must be at least 64KB"),
            ConfigError::InvalidTlabSize => {
                write!(f, "tlab size must be between 256 bytes and a quarter of the heap")
            }
            ConfigError::InvalidAlignment => {
                write!(f, "object alignment must be a power of two, minimum 4")
            }
            ConfigError::InvalidCardShift => write!(f, "card shift must be between 7 and 16"),
            ConfigError::UnknownReadBarrier => {
                write!(f, "read barrier must be one of baker, slow, none")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GcConfig::default().validate().is_ok());
        assert!(GcConfig::testing().validate().is_ok());
        assert!(GcConfig::non_concurrent().validate().is_ok());
    }

    #[test]
    fn test_card_size() {
        let config = GcConfig::default();
        assert_eq!(config.card_size(), 1024);
    }

    #[test]
    fn test_invalid_card_shift() {
        let config = GcConfig {
            card_shift: 3,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidCardShift));
    }

    #[test]
    fn test_invalid_tlab_size() {
        let config = GcConfig {
            tlab_size: 16,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidTlabSize));

        let no_tlab = GcConfig {
            tlab_size: 16,
            use_tlab: false,
            ..Default::default()
        };
        assert!(no_tlab.validate().is_ok());
    }

    #[test]
    fn test_read_barrier_parse() {
        assert_eq!("baker".parse::<ReadBarrierKind>(), Ok(ReadBarrierKind::Baker));
        assert_eq!("SLOW".parse::<ReadBarrierKind>(), Ok(ReadBarrierKind::Slow));
        assert_eq!("off".parse::<ReadBarrierKind>(), Ok(ReadBarrierKind::None));
        assert_eq!(
            "brooks".parse::<ReadBarrierKind>(),
            Err(ConfigError::UnknownReadBarrier)
        );
        assert!(!ReadBarrierKind::None.is_enabled());
        assert_eq!(ReadBarrierKind::Slow.to_string(), "slow");
    }
}
