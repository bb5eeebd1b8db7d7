//! Library half of the routing command line tool. The scenario loader lives
//! here so tests and the fuzzer can reach it.

pub mod scenario;

#[cfg(feature = "fuzzing")]
pub use scenario::fuzz_parse_scenario;
pub use scenario::{Action, Report, Scenario};
