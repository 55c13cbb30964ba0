#![deny(clippy::all)]

#[macro_use]
extern crate log;

mod fail;
mod metrics;
mod profile;
mod reactor;
mod registry;
mod scheduler;
mod shared;
mod stream;
mod timer;

pub mod logging;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    fail::Fail,
    metrics::Metrics,
    profile::OptimizationLevel,
    reactor::SharedReactor,
    registry::OpId,
    scheduler::yielder::{
        Yielder,
        YielderHandle,
    },
    shared::SharedObject,
    timer::UtilityMethods,
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Asserts equality between two expressions, bailing with [anyhow] instead of panicking. Intended for tests that
/// return `anyhow::Result<()>`.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure_eq() failed: left=`{:?}` right=`{:?}`",
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}

/// Asserts inequality between two expressions, bailing with [anyhow] instead of panicking.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    ::anyhow::bail!(
                        "ensure_neq() failed: left=`{:?}` right=`{:?}`",
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}
