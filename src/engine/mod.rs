//! Deviation and stop analysis for a single trip.
//!
//! [`Analyzer::evaluate`] is the only code path that mutates a
//! [`TripMonitoringState`]. It is synchronous and free of I/O; callers
//! serialize evaluations per trip.

mod analysis;
mod state;

pub use analysis::{Analyzer, Evaluation};
pub use state::TripMonitoringState;
