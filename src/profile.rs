//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::env;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Environment variable consulted for the default optimization profile.
pub const PROFILE_ENV_VAR: &str = "FIBERLOOP_PROFILE";

//======================================================================================================================
// Structures
//======================================================================================================================

/// A named bundle of scheduling tunables, swappable at any time between `run()` invocations or from within a callback.
/// A swap takes effect starting at the next iteration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OptimizationLevel {
    /// Consecutive empty iterations tolerated before the loop starts idling.
    pub empty_iteration_threshold: usize,
    /// Whether idle sleeps back off adaptively with the time since the last productive cycle. When disabled, the loop
    /// falls back to a fixed two-step back-off.
    pub adaptive_idle: bool,
    /// Upper bound on connections accepted per listener per iteration, so one busy listener cannot starve a scan.
    pub max_accepts_per_iteration: usize,
    /// Default I/O buffer and chunk size, also applied to socket send/receive buffers.
    pub io_buffer_size: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl OptimizationLevel {
    /// Tight loop: never idles, trading 100% CPU for minimum latency.
    pub fn latency() -> Self {
        Self {
            empty_iteration_threshold: usize::MAX,
            adaptive_idle: true,
            max_accepts_per_iteration: 64,
            io_buffer_size: 8192,
        }
    }

    /// Large buffers and accept batches for bulk transfer workloads.
    pub fn throughput() -> Self {
        Self {
            empty_iteration_threshold: 100,
            adaptive_idle: true,
            max_accepts_per_iteration: 128,
            io_buffer_size: 65536,
        }
    }

    /// Aggressive idling and small buffers for near-zero idle CPU.
    pub fn efficient() -> Self {
        Self {
            empty_iteration_threshold: 10,
            adaptive_idle: true,
            max_accepts_per_iteration: 16,
            io_buffer_size: 4096,
        }
    }

    /// Default middle ground.
    pub fn balanced() -> Self {
        Self {
            empty_iteration_threshold: 50,
            adaptive_idle: true,
            max_accepts_per_iteration: 32,
            io_buffer_size: 8192,
        }
    }

    /// Fixed two-step back-off instead of the adaptive policy, for run-to-run comparable measurements.
    pub fn benchmark() -> Self {
        Self {
            empty_iteration_threshold: 20,
            adaptive_idle: false,
            max_accepts_per_iteration: 256,
            io_buffer_size: 65536,
        }
    }

    /// Resolves a profile by name. Unknown names fall back to `balanced` without error.
    pub fn from_name(name: &str) -> Self {
        match name {
            "latency" => Self::latency(),
            "throughput" => Self::throughput(),
            "efficient" => Self::efficient(),
            "balanced" => Self::balanced(),
            "benchmark" => Self::benchmark(),
            other => {
                warn!("from_name(): unknown profile {:?}, falling back to balanced", other);
                Self::balanced()
            },
        }
    }

    /// Resolves the default profile from the environment. Missing or unknown values map to `balanced`.
    pub fn from_env() -> Self {
        match env::var(PROFILE_ENV_VAR) {
            Ok(name) => Self::from_name(&name),
            Err(_) => Self::balanced(),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for OptimizationLevel {
    fn default() -> Self {
        Self::balanced()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
