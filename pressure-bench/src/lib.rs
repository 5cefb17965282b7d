//! Pressure sensor calibration bench.
//!
//! Drives a pressure reference through an ascending then descending sweep while reading a
//! set of wireless pressure sensors at every settled setpoint.
//!
//! - [`sweep`]: sweep profile and step scheduling
//! - [`session`]: the calibration state machine, its events and hardware release
//! - [`report`]: per-sensor calibration records and result sinks

pub mod report;
pub mod session;
pub mod sweep;
