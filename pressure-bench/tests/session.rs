//! Calibration sessions against the simulated pressure reference and sensors.

use std::sync::Arc;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use async_trait::async_trait;
use hardware::pace::{InstrumentDriver, PaceError, SimulatedInstrument, SimulatedManifold};
use hardware::sensor::{PeripheralEvent, SimulatedTransport};
use pressure_bench::report::{CalibrationRecord, MemorySink, ReportError, ResultSink};
use pressure_bench::session::{
    CalibrationSession, PartialConnectionPolicy, SessionConfig, SessionError, SessionEvent,
    SessionState, StartRequest,
};
use pressure_bench::sweep::{Phase, SweepConfig};
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

struct Bench {
    instrument: SimulatedInstrument,
    transport: SimulatedTransport,
    session: CalibrationSession,
}

impl Bench {
    fn new(instrument: SimulatedInstrument, ids: &[&str]) -> Self {
        let transport = SimulatedTransport::with_devices(instrument.manifold().clone(), ids);
        let session = CalibrationSession::new(
            Arc::new(instrument.clone()),
            Arc::new(transport.clone()),
            SessionConfig::default(),
        );
        Self {
            instrument,
            transport,
            session,
        }
    }

    fn simulated(ids: &[&str]) -> Self {
        Self::new(SimulatedInstrument::new(SimulatedManifold::default()), ids)
    }

    fn setpoints(&self) -> Vec<String> {
        self.instrument
            .command_log()
            .into_iter()
            .filter(|c| c.starts_with("SOURce:PRESsure:LEVel"))
            .collect()
    }

    fn assert_released(&self, ids: &[&str]) {
        assert!(!self.instrument.is_connected());
        for id in ids {
            assert!(!self.transport.is_connected(id), "{id} still connected");
        }
        assert!(self.session.devices().is_empty());
    }
}

fn request(ids: &[&str]) -> StartRequest {
    StartRequest::new(
        ids.iter().map(|id| id.to_string()).collect(),
        SweepConfig::default(),
    )
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

struct FailingSink;

#[async_trait]
impl ResultSink for FailingSink {
    async fn store(&self, record: &CalibrationRecord) -> Result<(), ReportError> {
        Err(ReportError::Io {
            path: format!("/readonly/{}.json", record.device_id).into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_session_completes_and_releases_hardware() {
    let mut bench = Bench::simulated(&["A", "B"]);
    bench.transport.set_reading_offset("B", 0.2);
    let mut events = bench.session.subscribe();
    let sink = MemorySink::new();

    let outcome = bench.session.run(request(&["A", "B"]), &sink).await;

    assert_eq!(outcome.state, SessionState::Completed, "{:?}", outcome.error);
    assert!(outcome.error.is_none());
    assert_eq!(bench.session.state(), SessionState::Completed);
    assert_eq!(bench.session.total_steps(), 9);
    assert_eq!(bench.session.current_step_index(), 9);
    assert!(!bench.session.is_increasing_phase());

    let seen = drain(&mut events);
    assert_eq!(
        states(&seen),
        [
            SessionState::Connecting,
            SessionState::ConfiguringInstrument,
            SessionState::ZeroCheck,
            SessionState::Sweeping,
            SessionState::Completed,
        ]
    );

    // Every prerequisite differs from the simulator's power-on state
    let enforced: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::PrerequisiteEnforced { name } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        enforced,
        ["Output State", "Pressure Mode", "Static Mode", "Tolerance"]
    );

    let phases: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::PhaseChanged { phase } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(phases, [Phase::Increasing, Phase::Decreasing]);

    let steps: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StepReady { step, readings, .. } => Some((step.pressure, readings.len())),
            _ => None,
        })
        .collect();
    assert_eq!(steps.len(), 9);
    assert!(steps.iter().all(|(_, sensors)| *sensors == 2));
    assert!(matches!(seen.last(), Some(SessionEvent::StateChanged { to: SessionState::Completed, .. })));

    assert_eq!(bench.setpoints().len(), 9);
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(sink.records(), outcome.records);

    let a = &outcome.records[0];
    assert_eq!(a.device_id, "A");
    assert_eq!(a.display_name, "PS-A");
    assert_eq!(a.firmware_version.as_deref(), Some(SimulatedTransport::FIRMWARE));
    assert_eq!(a.steps.len(), 9);
    for step in &a.steps {
        assert_abs_diff_eq!(step.reference, step.nominal, epsilon = 1e-3);
        assert_abs_diff_eq!(step.sensor.unwrap(), step.nominal, epsilon = 1e-3);
    }

    let b = &outcome.records[1];
    assert_abs_diff_eq!(b.max_deviation().unwrap(), 0.2, epsilon = 1e-3);
    assert_eq!(b.hysteresis().len(), 4);

    bench.assert_released(&["A", "B"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_settle_aborts_before_next_step() {
    let instrument =
        SimulatedInstrument::new(SimulatedManifold::default()).with_slew_per_poll(1.0);
    let mut bench = Bench::new(instrument, &["A"]);
    let handle = bench.session.handle();
    let mut events = bench.session.subscribe();
    let mut watch = bench.session.subscribe();

    let canceller = tokio::spawn(async move {
        loop {
            match watch.recv().await {
                Ok(SessionEvent::StateChanged {
                    to: SessionState::Sweeping,
                    ..
                }) => break,
                Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            }
        }
        // One poll into a five-poll settle
        sleep(Duration::from_secs(3)).await;
        handle.cancel();
        Instant::now()
    });

    let sink = MemorySink::new();
    let outcome = bench.session.run(request(&["A"]), &sink).await;
    let finished = Instant::now();
    let cancelled_at = canceller.await.unwrap();

    assert_eq!(outcome.state, SessionState::Aborted);
    let err = outcome.error.unwrap();
    assert!(err.is_cancelled(), "{err}");
    assert!(finished - cancelled_at <= Duration::from_secs(2));

    assert_eq!(
        bench.setpoints(),
        ["SOURce:PRESsure:LEVel:IMMediate:AMPLitude 5"]
    );
    let seen = drain(&mut events);
    assert!(!seen.iter().any(|e| matches!(e, SessionEvent::StepReady { .. })));
    assert!(seen.iter().any(|e| matches!(e, SessionEvent::SessionAborted { .. })));
    assert!(!seen.iter().any(|e| matches!(e, SessionEvent::SessionFailed { .. })));
    assert!(sink.records().is_empty());
    bench.assert_released(&["A"]);
}

#[tokio::test(start_paused = true)]
async fn test_busy_instrument_while_settling_does_not_fail_session() {
    let mut bench = Bench::simulated(&["A"]);
    let instrument = bench.instrument.clone();
    let mut watch = bench.session.subscribe();

    tokio::spawn(async move {
        loop {
            match watch.recv().await {
                Ok(SessionEvent::StateChanged {
                    to: SessionState::Sweeping,
                    ..
                }) => break,
                Err(broadcast::error::RecvError::Closed) => return,
                _ => {}
            }
        }
        // The first settle poll of the first step goes unanswered
        instrument.set_unresponsive(true);
        sleep(Duration::from_secs(3)).await;
        instrument.set_unresponsive(false);
    });

    let outcome = bench.session.run(request(&["A"]), &MemorySink::new()).await;

    assert_eq!(outcome.state, SessionState::Completed, "{:?}", outcome.error);
    assert_eq!(outcome.records[0].steps.len(), 9);
    bench.assert_released(&["A"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_connects_nothing() {
    let mut bench = Bench::simulated(&["A"]);
    bench.session.handle().cancel();

    let outcome = bench.session.run(request(&["A"]), &MemorySink::new()).await;

    assert_eq!(outcome.state, SessionState::Aborted);
    assert!(bench.transport.connect_attempts().is_empty());
    assert!(bench.instrument.command_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_connecting_starts_no_further_attempt() {
    let mut bench = Bench::simulated(&["A", "B", "C"]);
    bench.transport.fail_connects("B", u32::MAX);
    bench.transport.set_connect_latency(Duration::from_secs(10));
    let handle = bench.session.handle();
    let mut watch = bench.session.subscribe();
    let transport = bench.transport.clone();

    let canceller = tokio::spawn(async move {
        loop {
            match watch.recv().await {
                Ok(SessionEvent::Peripheral(PeripheralEvent::ConnectionSucceeded { device }))
                    if device.id == "A" =>
                {
                    break
                }
                Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            }
        }
        handle.cancel();
        (Instant::now(), transport.connect_attempts().len())
    });

    let outcome = bench
        .session
        .run(request(&["A", "B", "C"]), &MemorySink::new())
        .await;
    let finished = Instant::now();
    let (cancelled_at, attempts_at_cancel) = canceller.await.unwrap();

    assert_eq!(outcome.state, SessionState::Aborted);
    let err = outcome.error.unwrap();
    assert!(err.is_cancelled(), "{err}");
    assert_eq!(attempts_at_cancel, 1);
    assert_eq!(bench.transport.connect_attempts(), ["A"]);
    assert!(finished - cancelled_at <= Duration::from_secs(1));
    assert!(bench.instrument.command_log().is_empty());
    bench.assert_released(&["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_static_mode_that_will_not_clear_fails_session() {
    let instrument = SimulatedInstrument::new(SimulatedManifold::default())
        .with_stuck_setting("SOURce:PRESsure:STATic");
    let mut bench = Bench::new(instrument, &["A"]);
    let mut events = bench.session.subscribe();

    let outcome = bench.session.run(request(&["A"]), &MemorySink::new()).await;

    assert_eq!(outcome.state, SessionState::Failed);
    match outcome.error {
        Some(SessionError::Instrument(PaceError::Prerequisite {
            name,
            expected,
            observed,
            ..
        })) => {
            assert_eq!(name, "Static Mode");
            assert_eq!(expected, "0");
            assert_eq!(observed, "1");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let seen = drain(&mut events);
    assert_eq!(
        states(&seen),
        [
            SessionState::Connecting,
            SessionState::ConfiguringInstrument,
            SessionState::Failed,
        ]
    );
    assert!(seen.iter().any(|e| matches!(e, SessionEvent::SessionFailed { .. })));
    assert!(bench.setpoints().is_empty());
    bench.assert_released(&["A"]);
}

#[tokio::test(start_paused = true)]
async fn test_partial_connection_proceeds_by_default() {
    let mut bench = Bench::simulated(&["A", "B", "C"]);
    bench.transport.fail_connects("B", u32::MAX);
    let mut events = bench.session.subscribe();

    let outcome = bench
        .session
        .run(request(&["A", "B", "C"]), &MemorySink::new())
        .await;

    assert_eq!(outcome.state, SessionState::Completed);
    let ids: Vec<_> = outcome.records.iter().map(|r| r.device_id.as_str()).collect();
    assert_eq!(ids, ["A", "C"]);
    assert_eq!(
        bench.transport.connect_attempts(),
        ["A", "B", "B", "B", "C"]
    );

    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::Peripheral(PeripheralEvent::ConnectionFailed { id, .. }) if id == "B"
    )));
    bench.assert_released(&["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_partial_connection_can_abort() {
    let mut bench = Bench::simulated(&["A", "B"]);
    bench.transport.fail_connects("B", u32::MAX);
    let mut request = request(&["A", "B"]);
    request.policy = PartialConnectionPolicy::AbortOnPartial;

    let outcome = bench.session.run(request, &MemorySink::new()).await;

    assert_eq!(outcome.state, SessionState::Aborted);
    assert!(matches!(
        outcome.error,
        Some(SessionError::PartialConnection { ref failed }) if failed == &["B".to_string()]
    ));
    assert!(bench.instrument.command_log().is_empty());
    bench.assert_released(&["A", "B"]);
}

#[tokio::test(start_paused = true)]
async fn test_no_connected_sensor_fails() {
    let mut bench = Bench::simulated(&["A", "B"]);
    bench.transport.fail_connects("A", u32::MAX);
    bench.transport.fail_connects("B", u32::MAX);

    let outcome = bench
        .session
        .run(request(&["A", "B"]), &MemorySink::new())
        .await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(matches!(
        outcome.error,
        Some(SessionError::NoPeripherals { failed: 2 })
    ));
    assert!(bench.instrument.command_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_vents_before_sweeping_when_not_at_zero() {
    let mut bench = Bench::new(SimulatedInstrument::new(SimulatedManifold::new(3.0)), &["A"]);

    let outcome = bench.session.run(request(&["A"]), &MemorySink::new()).await;

    assert_eq!(outcome.state, SessionState::Completed, "{:?}", outcome.error);
    let setpoints = bench.setpoints();
    assert_eq!(setpoints.len(), 10);
    assert_eq!(setpoints[0], "SOURce:PRESsure:LEVel:IMMediate:AMPLitude 0");
}

#[tokio::test(start_paused = true)]
async fn test_out_of_tolerance_step_fails_session() {
    let instrument = SimulatedInstrument::new(SimulatedManifold::default()).with_reading_offset(0.08);
    let mut bench = Bench::new(instrument, &["A"]);
    let mut request = request(&["A"]);
    request.sweep.tolerance_absolute = 0.05;

    let outcome = bench.session.run(request, &MemorySink::new()).await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(matches!(
        outcome.error,
        Some(SessionError::Instrument(PaceError::PressureSet { .. }))
    ));
    assert_eq!(bench.setpoints().len(), 1);
    bench.assert_released(&["A"]);
}

#[tokio::test(start_paused = true)]
async fn test_sink_failure_fails_session() {
    let mut bench = Bench::simulated(&["A"]);

    let outcome = bench.session.run(request(&["A"]), &FailingSink).await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(matches!(outcome.error, Some(SessionError::Report(_))));
    bench.assert_released(&["A"]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_sweep_fails_without_touching_hardware() {
    let mut bench = Bench::simulated(&["A"]);
    let mut request = request(&["A"]);
    request.sweep.increasing_steps.clear();

    let outcome = bench.session.run(request, &MemorySink::new()).await;

    assert_eq!(outcome.state, SessionState::Failed);
    assert!(matches!(outcome.error, Some(SessionError::InvalidConfig(_))));
    assert!(bench.transport.connect_attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_session_runs_only_once() {
    let mut bench = Bench::simulated(&["A"]);
    let sink = MemorySink::new();
    bench.session.run(request(&["A"]), &sink).await;

    let again = bench.session.run(request(&["A"]), &sink).await;
    assert_eq!(again.state, SessionState::Completed);
    assert!(matches!(
        again.error,
        Some(SessionError::NotIdle(SessionState::Completed))
    ));
    assert_eq!(sink.records().len(), 1);
}
