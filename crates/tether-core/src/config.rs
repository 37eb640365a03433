use crate::next_tick::Boundary;
use crate::scheduler::MAX_UPDATE_COUNT;

/// Per-runtime configuration.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Count re-queues per watcher during a flush and halt watchers that
    /// exceed `max_update_count`. On by default in debug builds.
    pub detect_update_loops: bool,
    pub max_update_count: usize,
    /// Boundary used for scheduled flushes outside `with_macro_task`.
    pub default_boundary: Boundary,
    /// Suppress misuse warnings.
    pub silent: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            detect_update_loops: cfg!(debug_assertions),
            max_update_count: MAX_UPDATE_COUNT,
            default_boundary: Boundary::Micro,
            silent: false,
        }
    }
}

impl RuntimeConfig {
    pub fn with_update_loop_detection(mut self, enabled: bool) -> Self {
        self.detect_update_loops = enabled;
        self
    }

    pub fn with_max_update_count(mut self, count: usize) -> Self {
        self.max_update_count = count;
        self
    }

    pub fn with_default_boundary(mut self, boundary: Boundary) -> Self {
        self.default_boundary = boundary;
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}
