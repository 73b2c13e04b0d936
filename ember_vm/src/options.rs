//! Runtime options resolved once at startup.
//!
//! Defaults come from [`RuntimeOptions::default`]; [`RuntimeOptions::from_env`]
//! overlays `EMBER_*` environment variables on top. Nothing reads the
//! environment after the runtime is created.

use crate::thread::ThreadConfig;
use ember_gc::{GcConfig, ReadBarrierKind};
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Options
// =============================================================================

/// Configuration of one runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Heap configuration handed to the collector.
    pub gc: GcConfig,

    /// Back-edges and invocations a method accumulates before the JIT hook
    /// is told it is hot.
    ///
    /// Default: 10000
    pub hotness_threshold: u32,

    /// Interpreter frames allowed on one thread before `StackOverflowError`.
    ///
    /// Default: 1024
    pub max_stack_depth: usize,

    /// How long suspend-all and single-thread suspension wait for targets.
    ///
    /// Default: 10s
    pub suspend_timeout: Duration,

    /// Abort on lock-order violations.
    ///
    /// Default: enabled in debug builds
    pub check_lock_order: bool,

    /// Abort when a safepoint is reached inside a no-suspension region.
    ///
    /// Default: enabled in debug builds
    pub verify_no_suspension: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            hotness_threshold: 10_000,
            max_stack_depth: 1024,
            suspend_timeout: Duration::from_secs(10),
            check_lock_order: cfg!(debug_assertions),
            verify_no_suspension: cfg!(debug_assertions),
        }
    }
}

impl RuntimeOptions {
    /// Small heap, short timeouts and every debug check on.
    pub fn testing() -> Self {
        Self {
            gc: GcConfig::testing(),
            hotness_threshold: 100,
            max_stack_depth: 256,
            suspend_timeout: Duration::from_secs(5),
            check_lock_order: true,
            verify_no_suspension: true,
        }
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::default().overlay(|name| std::env::var(name).ok())
    }

    /// Overlay variables looked up through `lookup`. Unparsable values are
    /// logged and ignored.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_var::<u32>(&lookup, "EMBER_HOTNESS_THRESHOLD") {
            self.hotness_threshold = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, "EMBER_MAX_STACK_DEPTH") {
            self.max_stack_depth = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "EMBER_SUSPEND_TIMEOUT_MS") {
            self.suspend_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<ReadBarrierKind>(&lookup, "EMBER_READ_BARRIER") {
            self.gc.read_barrier = v;
        }
        if let Some(v) = lookup("EMBER_HEAP_POISONING") {
            self.gc.heap_poisoning = env_truthy(&v);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "EMBER_TLAB_SIZE") {
            self.gc.tlab_size = v;
        }
        self
    }

    pub(crate) fn thread_config(&self) -> ThreadConfig {
        ThreadConfig {
            check_lock_order: self.check_lock_order,
            verify_no_suspension: self.verify_no_suspension,
        }
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable option");
            None
        }
    }
}

#[inline]
fn env_truthy(value: &str) -> bool {
    !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs.iter().map(|&(k, v)| (k.to_owned(), v.to_owned())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let options = RuntimeOptions::default().overlay(env(&[]));
        assert_eq!(options.hotness_threshold, 10_000);
        assert_eq!(options.max_stack_depth, 1024);
        assert_eq!(options.gc.read_barrier, ReadBarrierKind::Baker);
    }

    #[test]
    fn test_overlay_all_variables() {
        let options = RuntimeOptions::default().overlay(env(&[
            ("EMBER_HOTNESS_THRESHOLD", "50"),
            ("EMBER_MAX_STACK_DEPTH", "32"),
            ("EMBER_SUSPEND_TIMEOUT_MS", "250"),
            ("EMBER_READ_BARRIER", "none"),
            ("EMBER_HEAP_POISONING", "1"),
            ("EMBER_TLAB_SIZE", "8192"),
        ]));
        assert_eq!(options.hotness_threshold, 50);
        assert_eq!(options.max_stack_depth, 32);
        assert_eq!(options.suspend_timeout, Duration::from_millis(250));
        assert_eq!(options.gc.read_barrier, ReadBarrierKind::None);
        assert!(options.gc.heap_poisoning);
        assert_eq!(options.gc.tlab_size, 8192);
    }

    #[test]
    fn test_bad_values_are_ignored() {
        let options = RuntimeOptions::default().overlay(env(&[
            ("EMBER_HOTNESS_THRESHOLD", "lots"),
            ("EMBER_READ_BARRIER", "brooks"),
            ("EMBER_HEAP_POISONING", "0"),
        ]));
        assert_eq!(options.hotness_threshold, 10_000);
        assert_eq!(options.gc.read_barrier, ReadBarrierKind::Baker);
        assert!(!options.gc.heap_poisoning);
    }
}
