//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::time::Duration;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduling counters for one reactor instance. Mutated exclusively by the reactor core at the end of each iteration
/// and reset only by constructing a new instance. Snapshots are handed out by [crate::SharedReactor::get_metrics].
#[derive(Clone, Copy, Debug, Default)]
pub struct Metrics {
    /// Total loop iterations performed.
    pub iterations: u64,
    /// Iterations in which no phase reported work.
    pub empty_iterations: u64,
    /// Iterations in which at least one phase reported work.
    pub work_cycles: u64,
    /// Wall-clock cost of the most recent productive scan.
    pub last_work_duration: Duration,
}
