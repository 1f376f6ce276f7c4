//! Real-time monitoring of in-progress trips: route deviation and stop
//! detection on a fixed cadence, with alerts persisted and pushed to
//! subscribers.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod geometry;
pub mod hub;
pub mod model;
pub mod monitor;
pub mod output;
pub mod parser;
pub mod scheduler;
pub mod simulate;
pub mod sink;
pub mod source;
pub mod stats;
pub mod store;
