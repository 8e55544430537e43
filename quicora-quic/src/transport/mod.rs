//! Transport parameters and resumption state.

pub mod parameters;

pub use parameters::{ResumptionState, TransportParameters};
