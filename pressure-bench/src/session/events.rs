use hardware::sensor::PeripheralEvent;
use tokio::sync::broadcast;

use super::SessionState;
use crate::report::CalibrationRecord;
use crate::sweep::{Phase, SweepStep};

const EVENT_CAPACITY: usize = 256;

/// Progress notifications published by a calibration session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Peripheral connection progress, forwarded in order
    Peripheral(PeripheralEvent),
    InstrumentConnected {
        identity: String,
    },
    PrerequisiteEnforced {
        name: String,
    },
    /// The sweep entered a new phase
    PhaseChanged {
        phase: Phase,
    },
    /// A setpoint settled and every sensor was read
    StepReady {
        step: SweepStep,
        reference: f64,
        /// Sensor id and reading, `None` if the sensor did not answer
        readings: Vec<(String, Option<f64>)>,
    },
    SweepCompleted {
        records: Vec<CalibrationRecord>,
    },
    SessionAborted {
        reason: String,
    },
    SessionFailed {
        error: String,
    },
}

/// Fan-out of [`SessionEvent`]s to any number of subscribers.
///
/// Publishing never blocks and never fails; events sent with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_dropped() {
        let bus = EventBus::default();
        bus.emit(SessionEvent::PhaseChanged {
            phase: Phase::Decreasing,
        });

        let mut events = bus.subscribe();
        bus.emit(SessionEvent::PrerequisiteEnforced {
            name: "Output State".to_string(),
        });
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::PrerequisiteEnforced {
                name: "Output State".to_string()
            }
        );
        assert!(events.try_recv().is_err());
    }
}
