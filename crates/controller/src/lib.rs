use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hazard::{HazardPolicy, HazardReason, PolicyError};
use perception::{PerceptionSnapshot, PpeFlags};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("actuator command failed: {reason}")]
pub struct ActuatorError {
    pub reason: String,
}

/// Physical machine link, modeled as a single idempotent coil write.
/// The controller never retries on failure, only logs it.
pub trait Actuator {
    fn set_running(&mut self, running: bool) -> Result<(), ActuatorError>;
}

#[derive(Debug, Error)]
#[error("event sink rejected record: {reason}")]
pub struct SinkError {
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EventKind {
    SessionStarted,
    /// Routine per-snapshot audit record while Running.
    Status,
    MachineStopped,
    MachineStarted,
    /// Throttled audible/log alert while a hazard persists.
    Alert,
    RestartScheduled,
    SessionSummary,
}

/// Structured audit record handed to the `EventSink`.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub frame_index: Option<u64>,
    pub kind: EventKind,
    pub message: String,
    pub machine_stopped: bool,
    pub temperature_c: Option<f64>,
    pub ppe: Option<PpeFlags>,
}

/// Receives audit events. Delivery is fire-and-forget from the controller's
/// perspective; implementations batch/retry on their own.
pub trait EventSink {
    fn emit(&mut self, event: Event) -> Result<(), SinkError>;
}

/// In-memory sink, mainly for tests and scenario inspection.
#[derive(Default)]
pub struct MemorySink {
    pub events: Vec<Event>,
}

impl MemorySink {
    pub fn of_kind(&self, kind: EventKind) -> Vec<&Event> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&mut self, event: Event) -> Result<(), SinkError> {
        self.events.push(event);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ControlConfig {
    /// Seconds of continuous safe observation before auto-restart.
    pub restart_delay_s: u32,
    /// Minimum spacing between repeated hazard alerts.
    pub alert_cooldown: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            restart_delay_s: 10,
            alert_cooldown: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCause {
    Hazard,
    Manual,
}

/// Countdown toward automatic restart. At most one instance per machine;
/// dropping it is cancellation.
#[derive(Clone, Copy, Debug)]
pub struct RestartSupervisor {
    remaining_s: u32,
    deadline: Instant,
}

impl RestartSupervisor {
    fn new(delay_s: u32, now: Instant) -> Self {
        Self {
            remaining_s: delay_s,
            deadline: now + Duration::from_secs(u64::from(delay_s)),
        }
    }

    /// Advance by one second-tick. Returns true when the countdown fires.
    fn tick(&mut self) -> bool {
        self.remaining_s = self.remaining_s.saturating_sub(1);
        self.remaining_s == 0
    }

    pub fn remaining_s(&self) -> u32 {
        self.remaining_s
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Authoritative run/stop state. Mutated exclusively by `MachineController`.
#[derive(Clone, Copy, Debug)]
pub struct MachineState {
    pub run_state: RunState,
    pub stopped_since: Option<Instant>,
    pub stop_cause: Option<StopCause>,
    pub last_alert_at: Option<Instant>,
    pub restart: Option<RestartSupervisor>,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            run_state: RunState::Running,
            stopped_since: None,
            stop_cause: None,
            last_alert_at: None,
            restart: None,
        }
    }
}

/// Outcome of an operator command: applied, or a reported no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    AlreadyInState,
}

#[derive(Clone, Copy, Debug, Default)]
struct SessionCounters {
    frames: u64,
    stops: u64,
    starts: u64,
    alerts: u64,
}

/// Converts per-frame observations into machine run/stop decisions and an
/// audit event stream. Single-threaded with respect to its `MachineState`.
pub struct MachineController<A: Actuator, S: EventSink> {
    policy: HazardPolicy,
    cfg: ControlConfig,
    state: MachineState,
    actuator: A,
    sink: S,
    last_frame: Option<u64>,
    counters: SessionCounters,
}

impl<A: Actuator, S: EventSink> MachineController<A, S> {
    /// Fails only on malformed policy; everything downstream recovers locally.
    pub fn new(
        policy: HazardPolicy,
        cfg: ControlConfig,
        actuator: A,
        sink: S,
    ) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self {
            policy,
            cfg,
            state: MachineState::default(),
            actuator,
            sink,
            last_frame: None,
            counters: SessionCounters::default(),
        })
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn run_state(&self) -> RunState {
        self.state.run_state
    }

    pub fn countdown_remaining_s(&self) -> Option<u32> {
        self.state.restart.map(|r| r.remaining_s())
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn begin_session(&mut self) {
        self.emit(Event {
            timestamp: Utc::now(),
            frame_index: None,
            kind: EventKind::SessionStarted,
            message: "session started, machine running".into(),
            machine_stopped: false,
            temperature_c: None,
            ppe: None,
        });
    }

    /// Feed one snapshot through classify -> transition -> side effects.
    pub fn on_snapshot(&mut self, snapshot: &PerceptionSnapshot, now: Instant) {
        if self.last_frame == Some(snapshot.frame_index) {
            // Re-delivered frame: never double-trigger a transition.
            tracing::debug!(frame = snapshot.frame_index, "duplicate frame dropped");
            return;
        }
        self.last_frame = Some(snapshot.frame_index);
        self.counters.frames += 1;

        if snapshot.temperature_c.is_none() {
            tracing::debug!(
                frame = snapshot.frame_index,
                "temperature reading unavailable, evaluating as not over threshold"
            );
        }

        let verdict = hazard::evaluate(&self.policy, snapshot);
        match verdict.reason {
            Some(reason) => self.on_hazard(snapshot, reason, now),
            None => self.on_safe(snapshot, now),
        }
    }

    fn on_hazard(&mut self, snapshot: &PerceptionSnapshot, reason: HazardReason, now: Instant) {
        // A fresh hazard always preempts a pending auto-restart.
        if let Some(restart) = self.state.restart.take() {
            tracing::info!(
                frame = snapshot.frame_index,
                remaining_s = restart.remaining_s(),
                "restart countdown cancelled by new hazard"
            );
        }

        match self.state.run_state {
            RunState::Running => {
                self.command_actuator(false);
                self.state.run_state = RunState::Stopped;
                self.state.stopped_since = Some(now);
                self.state.stop_cause = Some(StopCause::Hazard);
                self.counters.stops += 1;
                self.emit(Event {
                    timestamp: Utc::now(),
                    frame_index: Some(snapshot.frame_index),
                    kind: EventKind::MachineStopped,
                    message: format!("hazard: {}; machine stop command sent", reason_text(reason)),
                    machine_stopped: true,
                    temperature_c: snapshot.temperature_c,
                    ppe: Some(snapshot.ppe),
                });
            }
            RunState::Stopped => {
                // Already stopped: no second stop command, only a throttled alert.
                let due = match self.state.last_alert_at {
                    Some(last) => now.saturating_duration_since(last) >= self.cfg.alert_cooldown,
                    None => true,
                };
                if due {
                    self.state.last_alert_at = Some(now);
                    self.counters.alerts += 1;
                    self.emit(Event {
                        timestamp: Utc::now(),
                        frame_index: Some(snapshot.frame_index),
                        kind: EventKind::Alert,
                        message: format!("hazard persists: {}", reason_text(reason)),
                        machine_stopped: true,
                        temperature_c: snapshot.temperature_c,
                        ppe: Some(snapshot.ppe),
                    });
                }
            }
        }
    }

    fn on_safe(&mut self, snapshot: &PerceptionSnapshot, now: Instant) {
        match self.state.run_state {
            RunState::Stopped => {
                if self.state.restart.is_none() {
                    self.state.restart = Some(RestartSupervisor::new(self.cfg.restart_delay_s, now));
                    self.emit(Event {
                        timestamp: Utc::now(),
                        frame_index: Some(snapshot.frame_index),
                        kind: EventKind::RestartScheduled,
                        message: format!(
                            "conditions safe, restart countdown started ({}s)",
                            self.cfg.restart_delay_s
                        ),
                        machine_stopped: true,
                        temperature_c: snapshot.temperature_c,
                        ppe: Some(snapshot.ppe),
                    });
                }
                // An active countdown keeps running; ticking is external.
            }
            RunState::Running => {
                let message = match snapshot.temperature_c {
                    Some(t) => format!("normal, temperature ok ({t:.1}C)"),
                    None => "normal, temperature unavailable".into(),
                };
                self.emit(Event {
                    timestamp: Utc::now(),
                    frame_index: Some(snapshot.frame_index),
                    kind: EventKind::Status,
                    message,
                    machine_stopped: false,
                    temperature_c: snapshot.temperature_c,
                    ppe: Some(snapshot.ppe),
                });
            }
        }
    }

    /// Advance the restart countdown by one second-tick; an external scheduler
    /// calls this at 1 Hz while a countdown is active. Returns true when the
    /// countdown fired and the machine restarted.
    pub fn tick_restart(&mut self, now: Instant) -> bool {
        let fired = match self.state.restart.as_mut() {
            Some(restart) => restart.tick(),
            None => return false,
        };
        if !fired {
            return false;
        }
        self.state.restart = None;
        self.on_restart_deadline(now)
    }

    fn on_restart_deadline(&mut self, _now: Instant) -> bool {
        if self.state.run_state != RunState::Stopped {
            return false;
        }
        self.command_actuator(true);
        self.state.run_state = RunState::Running;
        self.state.stopped_since = None;
        self.state.stop_cause = None;
        self.counters.starts += 1;
        self.emit(Event {
            timestamp: Utc::now(),
            frame_index: None,
            kind: EventKind::MachineStarted,
            message: "machine auto-restarted".into(),
            machine_stopped: false,
            temperature_c: None,
            ppe: None,
        });
        true
    }

    /// Operator stop. A no-op (reported, not silently dropped) when already
    /// stopped.
    pub fn manual_stop(&mut self, now: Instant) -> CommandOutcome {
        if self.state.run_state == RunState::Stopped {
            return CommandOutcome::AlreadyInState;
        }
        self.command_actuator(false);
        self.state.run_state = RunState::Stopped;
        self.state.stopped_since = Some(now);
        self.state.stop_cause = Some(StopCause::Manual);
        self.state.restart = None;
        self.counters.stops += 1;
        self.emit(Event {
            timestamp: Utc::now(),
            frame_index: None,
            kind: EventKind::MachineStopped,
            message: "manual stop applied".into(),
            machine_stopped: true,
            temperature_c: None,
            ppe: None,
        });
        CommandOutcome::Applied
    }

    /// Operator start. Cancels any pending auto-restart countdown.
    pub fn manual_start(&mut self, _now: Instant) -> CommandOutcome {
        if self.state.run_state == RunState::Running {
            return CommandOutcome::AlreadyInState;
        }
        self.state.restart = None;
        self.command_actuator(true);
        self.state.run_state = RunState::Running;
        self.state.stopped_since = None;
        self.state.stop_cause = None;
        self.counters.starts += 1;
        self.emit(Event {
            timestamp: Utc::now(),
            frame_index: None,
            kind: EventKind::MachineStarted,
            message: "manual start applied".into(),
            machine_stopped: false,
            temperature_c: None,
            ppe: None,
        });
        CommandOutcome::Applied
    }

    /// Tear down the session: cancel any countdown, restart the machine if it
    /// was left stopped by detection logic (a manual stop survives), and flush
    /// a summary record.
    pub fn end_session(&mut self, _now: Instant) {
        self.state.restart = None;

        if self.state.run_state == RunState::Stopped
            && self.state.stop_cause == Some(StopCause::Hazard)
        {
            self.command_actuator(true);
            self.state.run_state = RunState::Running;
            self.state.stopped_since = None;
            self.state.stop_cause = None;
            self.counters.starts += 1;
            self.emit(Event {
                timestamp: Utc::now(),
                frame_index: None,
                kind: EventKind::MachineStarted,
                message: "machine auto-restarted (session ended)".into(),
                machine_stopped: false,
                temperature_c: None,
                ppe: None,
            });
        }

        let c = self.counters;
        let stopped = self.state.run_state == RunState::Stopped;
        self.emit(Event {
            timestamp: Utc::now(),
            frame_index: None,
            kind: EventKind::SessionSummary,
            message: format!(
                "session summary: {} frames, {} stops, {} starts, {} alerts",
                c.frames, c.stops, c.starts, c.alerts
            ),
            machine_stopped: stopped,
            temperature_c: None,
            ppe: None,
        });
    }

    /// Optimistic write: a failed command is logged and the state machine
    /// proceeds as if it had been accepted, since there is no independent way
    /// to verify physical state.
    fn command_actuator(&mut self, running: bool) {
        if let Err(e) = self.actuator.set_running(running) {
            tracing::warn!(running, error = %e, "actuator command failed, proceeding");
        }
    }

    fn emit(&mut self, event: Event) {
        if let Err(e) = self.sink.emit(event) {
            tracing::warn!(error = %e, "event sink failure, record dropped");
        }
    }
}

fn reason_text(reason: HazardReason) -> String {
    match reason {
        HazardReason::PersonAndOverTemperature => "person present with over-temperature".into(),
        HazardReason::PersonWithoutGear { missing } => {
            format!("person without required {}", missing.name())
        }
        HazardReason::OverTemperature => "over-temperature".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perception::PpeFlags;

    struct StubActuator {
        commands: Vec<bool>,
        fail: bool,
    }

    impl StubActuator {
        fn new() -> Self {
            Self {
                commands: Vec::new(),
                fail: false,
            }
        }
    }

    impl Actuator for StubActuator {
        fn set_running(&mut self, running: bool) -> Result<(), ActuatorError> {
            self.commands.push(running);
            if self.fail {
                Err(ActuatorError {
                    reason: "coil write refused".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn controller(actuator: StubActuator) -> MachineController<StubActuator, MemorySink> {
        MachineController::new(
            HazardPolicy::default(),
            ControlConfig::default(),
            actuator,
            MemorySink::default(),
        )
        .unwrap()
    }

    fn hazard_snap(frame: u64) -> PerceptionSnapshot {
        // Person without helmet.
        let mut ppe = PpeFlags::all_present();
        ppe.helmet = false;
        PerceptionSnapshot::new(frame, true, ppe, Some(30.0))
    }

    fn safe_snap(frame: u64) -> PerceptionSnapshot {
        PerceptionSnapshot::new(frame, false, PpeFlags::default(), Some(30.0))
    }

    #[test]
    fn repeated_hazards_are_throttled_to_one_alert() {
        let mut ctl = controller(StubActuator::new());
        let t0 = Instant::now();
        ctl.on_snapshot(&hazard_snap(1), t0);
        ctl.on_snapshot(&hazard_snap(2), t0 + Duration::from_secs(1));
        ctl.on_snapshot(&hazard_snap(3), t0 + Duration::from_secs(2));
        assert_eq!(ctl.sink().of_kind(EventKind::MachineStopped).len(), 1);
        assert_eq!(ctl.sink().of_kind(EventKind::Alert).len(), 1);

        // Past the cooldown a second alert fires.
        ctl.on_snapshot(&hazard_snap(4), t0 + Duration::from_secs(5));
        assert_eq!(ctl.sink().of_kind(EventKind::Alert).len(), 2);
    }

    #[test]
    fn safe_frames_while_stopped_start_exactly_one_countdown() {
        let mut ctl = controller(StubActuator::new());
        let t0 = Instant::now();
        ctl.on_snapshot(&hazard_snap(1), t0);
        for i in 0..5u64 {
            ctl.on_snapshot(&safe_snap(2 + i), t0 + Duration::from_secs(1 + i));
        }
        assert_eq!(ctl.sink().of_kind(EventKind::RestartScheduled).len(), 1);
        assert_eq!(ctl.countdown_remaining_s(), Some(10));
    }

    #[test]
    fn hazard_mid_countdown_cancels_it() {
        let mut ctl = controller(StubActuator::new());
        let t0 = Instant::now();
        ctl.on_snapshot(&hazard_snap(1), t0);
        ctl.on_snapshot(&safe_snap(2), t0 + Duration::from_secs(1));
        for k in 0..6 {
            ctl.tick_restart(t0 + Duration::from_secs(2 + k));
        }
        assert_eq!(ctl.countdown_remaining_s(), Some(4));

        let over = PerceptionSnapshot::new(3, false, PpeFlags::default(), Some(50.0));
        ctl.on_snapshot(&over, t0 + Duration::from_secs(8));
        assert_eq!(ctl.countdown_remaining_s(), None);
        assert_eq!(ctl.run_state(), RunState::Stopped);

        // Nothing left to fire.
        for k in 0..20 {
            assert!(!ctl.tick_restart(t0 + Duration::from_secs(9 + k)));
        }
        assert!(ctl.sink().of_kind(EventKind::MachineStarted).is_empty());
    }

    #[test]
    fn duplicate_frame_is_dropped() {
        let mut ctl = controller(StubActuator::new());
        let t0 = Instant::now();
        ctl.on_snapshot(&safe_snap(1), t0);
        ctl.on_snapshot(&safe_snap(1), t0 + Duration::from_millis(10));
        assert_eq!(ctl.sink().of_kind(EventKind::Status).len(), 1);
    }

    #[test]
    fn manual_commands_report_noops() {
        let mut ctl = controller(StubActuator::new());
        let t0 = Instant::now();
        assert_eq!(ctl.manual_start(t0), CommandOutcome::AlreadyInState);
        assert_eq!(ctl.manual_stop(t0), CommandOutcome::Applied);
        assert_eq!(ctl.manual_stop(t0), CommandOutcome::AlreadyInState);
        assert_eq!(ctl.sink().of_kind(EventKind::MachineStopped).len(), 1);
        assert_eq!(ctl.manual_start(t0), CommandOutcome::Applied);
        assert_eq!(ctl.run_state(), RunState::Running);
        // One stop coil write, one start coil write, no duplicates.
        assert_eq!(ctl.actuator().commands, vec![false, true]);
    }

    #[test]
    fn actuator_failure_is_optimistic() {
        let mut failing = StubActuator::new();
        failing.fail = true;
        let mut ctl = controller(failing);
        let t0 = Instant::now();
        ctl.on_snapshot(&hazard_snap(1), t0);
        // State advanced despite the failed coil write.
        assert_eq!(ctl.run_state(), RunState::Stopped);
        assert_eq!(ctl.sink().of_kind(EventKind::MachineStopped).len(), 1);
        assert_eq!(ctl.actuator().commands, vec![false]);
    }

    #[test]
    fn manual_stop_survives_session_end() {
        let mut ctl = controller(StubActuator::new());
        let t0 = Instant::now();
        ctl.manual_stop(t0);
        ctl.end_session(t0 + Duration::from_secs(1));
        assert_eq!(ctl.run_state(), RunState::Stopped);
        assert_eq!(ctl.sink().of_kind(EventKind::SessionSummary).len(), 1);
        assert!(ctl.sink().of_kind(EventKind::MachineStarted).is_empty());
    }

    #[test]
    fn hazard_stop_is_released_on_session_end() {
        let mut ctl = controller(StubActuator::new());
        let t0 = Instant::now();
        ctl.on_snapshot(&hazard_snap(1), t0);
        ctl.end_session(t0 + Duration::from_secs(1));
        assert_eq!(ctl.run_state(), RunState::Running);
        assert_eq!(ctl.sink().of_kind(EventKind::MachineStarted).len(), 1);
    }
}
