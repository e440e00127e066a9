//! # Fieldgate Engine
//!
//! The per-schedule execution pipeline: a [`ScheduleReader`] fans one read
//! cycle out to every configured source adapter and combines the results
//! through a fan-in barrier, an optional [`ScheduleAggregator`] batches
//! successive cycle outputs, and a [`ScheduleWriter`] fans each finalized
//! batch out to every delivery target. A [`ScheduleController`] owns the
//! channel wiring and the lifecycle of the three stages.
//!
//! Failures are contained at the smallest possible scope: a failing source
//! is dropped from its cycle, a failing target from its batch, a timed-out
//! cycle is abandoned — the pipeline itself keeps running.

mod aggregator;
mod controller;
mod reader;
mod stage;
mod writer;

pub use aggregator::ScheduleAggregator;
pub use controller::{ScheduleController, ScheduleEnvironment};
pub use reader::ScheduleReader;
pub use writer::ScheduleWriter;
