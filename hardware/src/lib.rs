//! Hardware drivers for the pressure calibration bench.
//!
//! - [`scpi`]: line-oriented SCPI transport to the pressure reference over TCP
//! - [`pace`]: command vocabulary, prerequisite enforcement and setpoint control for the
//!   pressure reference, behind the [`pace::InstrumentDriver`] capability
//! - [`sensor`]: discovery and sequential connection of wireless pressure sensors

pub mod pace;
pub mod scpi;
pub mod sensor;

/// Predicate answering "is the owning session still active".
///
/// Long-running hardware operations sample it between sub-steps and stop scheduling new
/// work once it turns false.
pub type ActivePredicate = dyn Fn() -> bool + Send + Sync;
