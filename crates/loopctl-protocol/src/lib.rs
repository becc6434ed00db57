//! The protocol engine: phases, the supervisor-side phase sequencer, and the
//! barrier-synchronized phase start (spec.md §3, §4.6).
//!
//! `loopctl-protocol` is deliberately clock-agnostic: every transition takes
//! `now` as an explicit argument rather than calling `SystemTime::now()`
//! itself, so the state machine can be driven by a fake clock in tests
//! (SPEC_FULL.md §8, scenarios 2 and 6) exactly as it is by real wall-clock
//! time in `loopctl-supervisor`.

use std::time::Duration;

use loopctl_state::{WorkerId, WorkerState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed propagation delay added to the first phase's `start` to absorb
/// worker wake-up jitter (spec.md §3, §4.6).
pub const PHASE_START_DELAY: Duration = Duration::from_millis(100);

/// One phase of a protocol (spec.md §3). Visual/action descriptors are left
/// as opaque identifiers + parameter maps here; resolving them to real
/// `VisualObject`/`IoDevice` behavior is a `loopctl-collab` concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub duration: Duration,
    pub visual: Option<VisualDescriptor>,
    pub action: Option<ActionDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualDescriptor {
    pub visual_class_id: String,
    pub parameters: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub action_id: String,
    pub parameters: std::collections::BTreeMap<String, String>,
}

impl Phase {
    pub fn new(duration: Duration) -> Self {
        Self { duration, visual: None, action: None }
    }

    pub fn with_visual(mut self, visual: VisualDescriptor) -> Self {
        self.visual = Some(visual);
        self
    }

    pub fn with_action(mut self, action: ActionDescriptor) -> Self {
        self.action = Some(action);
        self
    }
}

/// An ordered, finite list of phases (spec.md §3).
#[derive(Debug, Clone)]
pub struct Protocol {
    pub id: String,
    pub phases: Vec<Phase>,
}

impl Protocol {
    pub fn new(id: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self { id: id.into(), phases }
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    pub fn fetch_phase_duration(&self, phase_id: usize) -> Option<Duration> {
        self.phases.get(phase_id).map(|p| p.duration)
    }
}

/// The at-most-one active phase run (spec.md §3): `start < stop`, and every
/// worker observing `RUNNING` for this phase observes the same `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRun {
    pub phase_id: usize,
    pub start: std::time::Duration,
    pub stop: std::time::Duration,
}

/// High-level supervisor protocol state (spec.md §4.1's transition table).
/// Distinct from `loopctl_state::WorkerState`: this tracks the *protocol's*
/// progress, not any one worker's lifecycle, though the two share names by
/// design (the same enum of state names appears on both sides of the
/// handshake in spec.md §3/§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Idle,
    PrepareProtocol,
    PreparePhase,
    Running,
    PhaseEnd,
    ProtocolEnd,
}

impl From<ProtocolState> for WorkerState {
    fn from(state: ProtocolState) -> Self {
        match state {
            ProtocolState::Idle => WorkerState::Idle,
            ProtocolState::PrepareProtocol => WorkerState::PrepareProtocol,
            ProtocolState::PreparePhase => WorkerState::PreparePhase,
            ProtocolState::Running => WorkerState::Running,
            ProtocolState::PhaseEnd => WorkerState::PhaseEnd,
            ProtocolState::ProtocolEnd => WorkerState::ProtocolEnd,
        }
    }
}

impl TryFrom<WorkerState> for ProtocolState {
    type Error = WorkerState;

    /// The supervisor publishes its own `ProtocolState` into the shared
    /// state table at `WorkerId::Controller`'s slot using this same
    /// encoding (`loopctl-supervisor`'s `tick`), so any worker process can
    /// read it back without a dedicated message type. `Na`/`Stopped`/
    /// `Starting` never appear there and fail the conversion.
    fn try_from(state: WorkerState) -> Result<Self, Self::Error> {
        match state {
            WorkerState::Idle => Ok(ProtocolState::Idle),
            WorkerState::PrepareProtocol => Ok(ProtocolState::PrepareProtocol),
            WorkerState::PreparePhase => Ok(ProtocolState::PreparePhase),
            WorkerState::Running => Ok(ProtocolState::Running),
            WorkerState::PhaseEnd => Ok(ProtocolState::PhaseEnd),
            WorkerState::ProtocolEnd => Ok(ProtocolState::ProtocolEnd),
            other => Err(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("cannot start a protocol while participant {0} is not IDLE")]
    ParticipantNotIdle(WorkerId),
    #[error("no active protocol")]
    NoActiveProtocol,
    #[error("phase index {0} out of range for a protocol with {1} phases")]
    PhaseOutOfRange(usize, usize),
}

/// Drives a single protocol's phases in lockstep across participating
/// workers (spec.md §4.1, §4.6), grounded directly in
/// `mappapp/modules/controller.py::main()`'s
/// `PREPARE_PROTOCOL -> PREPARE_PHASE -> RUNNING -> PHASE_END -> PROTOCOL_END`
/// block.
///
/// This type owns only the *protocol's* bookkeeping (current state, current
/// phase, current `PhaseRun`); it does not own worker state cells. The
/// caller (`loopctl-supervisor`) reads participant state from a
/// `loopctl_state::StateTable` and feeds the unanimity checks in below as
/// plain booleans, keeping this crate free of any IPC/transport dependency.
pub struct ProtocolEngine {
    protocol: Option<Protocol>,
    state: ProtocolState,
    phase_id: Option<usize>,
    phase_run: Option<PhaseRun>,
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolEngine {
    pub fn new() -> Self {
        Self { protocol: None, state: ProtocolState::Idle, phase_id: None, phase_run: None }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn phase_id(&self) -> Option<usize> {
        self.phase_id
    }

    pub fn phase_run(&self) -> Option<PhaseRun> {
        self.phase_run
    }

    pub fn protocol(&self) -> Option<&Protocol> {
        self.protocol.as_ref()
    }

    /// The phase `phase_id` currently refers to, if a protocol is active.
    pub fn current_phase(&self) -> Option<&Phase> {
        let id = self.phase_id?;
        self.protocol.as_ref()?.phases.get(id)
    }

    /// `start_protocol` (spec.md §4.1): refuses unless every participant is
    /// IDLE. Caller supplies that check as `all_participants_idle` to avoid
    /// this crate depending on `loopctl-state`'s storage details directly.
    pub fn start_protocol(&mut self, protocol: Protocol, all_participants_idle: bool) -> Result<(), ProtocolError> {
        if !all_participants_idle {
            return Err(ProtocolError::ParticipantNotIdle(WorkerId::Worker));
        }
        self.protocol = Some(protocol);
        self.phase_id = None;
        self.phase_run = None;
        self.state = ProtocolState::PrepareProtocol;
        Ok(())
    }

    /// `abort_protocol` (spec.md §4.1): sets `stop = now` and jumps straight
    /// to `PROTOCOL_END` regardless of current state.
    pub fn abort_protocol(&mut self, now: Duration) {
        if let Some(run) = self.phase_run.as_mut() {
            run.stop = now;
        }
        self.state = ProtocolState::ProtocolEnd;
    }

    /// One supervisor-tick evaluation of the transition table (spec.md
    /// §4.1). `all_participants_in` is supplied by the caller for whichever
    /// state the current transition requires unanimity on.
    pub fn tick(&mut self, now: Duration, all_participants_in: impl Fn(ProtocolState) -> bool) -> Result<(), ProtocolError> {
        match self.state {
            ProtocolState::Idle => {}
            ProtocolState::PrepareProtocol => {
                if all_participants_in(ProtocolState::PreparePhase) {
                    self.advance_phase_counter()?;
                    self.state = ProtocolState::PreparePhase;
                }
            }
            ProtocolState::PreparePhase => {
                if all_participants_in(ProtocolState::Running) {
                    let phase_id = self.phase_id.ok_or(ProtocolError::NoActiveProtocol)?;
                    let protocol = self.protocol.as_ref().ok_or(ProtocolError::NoActiveProtocol)?;
                    let duration = protocol
                        .fetch_phase_duration(phase_id)
                        .ok_or(ProtocolError::PhaseOutOfRange(phase_id, protocol.phase_count()))?;
                    let start = now + PHASE_START_DELAY;
                    let stop = start + duration;
                    self.phase_run = Some(PhaseRun { phase_id, start, stop });
                    self.state = ProtocolState::Running;
                }
            }
            ProtocolState::Running => {
                if let Some(run) = self.phase_run {
                    if now > run.stop {
                        self.state = ProtocolState::PhaseEnd;
                    }
                }
            }
            ProtocolState::PhaseEnd => {
                let phase_id = self.phase_id.ok_or(ProtocolError::NoActiveProtocol)?;
                let phase_count = self.protocol.as_ref().map(|p| p.phase_count()).unwrap_or(0);
                if phase_id + 1 < phase_count {
                    self.advance_phase_counter()?;
                    self.state = ProtocolState::PreparePhase;
                } else {
                    self.state = ProtocolState::ProtocolEnd;
                }
            }
            ProtocolState::ProtocolEnd => {
                if all_participants_in(ProtocolState::Idle) {
                    self.protocol = None;
                    self.phase_id = None;
                    self.phase_run = None;
                    self.state = ProtocolState::Idle;
                }
            }
        }
        Ok(())
    }

    fn advance_phase_counter(&mut self) -> Result<(), ProtocolError> {
        self.phase_id = Some(match self.phase_id {
            None => 0,
            Some(id) => id + 1,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol_with_durations(durations: &[u64]) -> Protocol {
        Protocol::new(
            "test-protocol",
            durations.iter().map(|&s| Phase::new(Duration::from_secs(s))).collect(),
        )
    }

    #[test]
    fn start_protocol_requires_all_participants_idle() {
        let mut engine = ProtocolEngine::new();
        let err = engine.start_protocol(protocol_with_durations(&[1]), false).unwrap_err();
        assert!(matches!(err, ProtocolError::ParticipantNotIdle(_)));
        assert_eq!(engine.state(), ProtocolState::Idle);
    }

    #[test]
    fn two_phase_protocol_runs_back_to_back_with_fixed_delay() {
        // Scenario 2 (spec.md §8): protocol with phases [0.5s, 1.0s],
        // delta = 100ms, two participants.
        let mut engine = ProtocolEngine::new();
        let protocol = Protocol::new(
            "p",
            vec![Phase::new(Duration::from_millis(500)), Phase::new(Duration::from_secs(1))],
        );
        engine.start_protocol(protocol, true).unwrap();
        assert_eq!(engine.state(), ProtocolState::PrepareProtocol);

        let t0 = Duration::from_secs(0);
        engine.tick(t0, |_| true).unwrap();
        assert_eq!(engine.state(), ProtocolState::PreparePhase);
        assert_eq!(engine.phase_id(), Some(0));

        engine.tick(t0, |_| true).unwrap();
        assert_eq!(engine.state(), ProtocolState::Running);
        let run0 = engine.phase_run().unwrap();
        assert_eq!(run0.start, t0 + PHASE_START_DELAY);
        assert_eq!(run0.stop, t0 + PHASE_START_DELAY + Duration::from_millis(500));

        // Before stop: still running.
        engine.tick(run0.stop - Duration::from_millis(1), |_| true).unwrap();
        assert_eq!(engine.state(), ProtocolState::Running);

        // Past stop: PHASE_END.
        engine.tick(run0.stop + Duration::from_millis(1), |_| true).unwrap();
        assert_eq!(engine.state(), ProtocolState::PhaseEnd);

        // Second phase exists -> PREPARE_PHASE, no extra delay added between
        // phases (back-to-back, spec.md §4.6).
        engine.tick(run0.stop, |_| true).unwrap();
        assert_eq!(engine.state(), ProtocolState::PreparePhase);
        assert_eq!(engine.phase_id(), Some(1));

        engine.tick(run0.stop, |_| true).unwrap();
        assert_eq!(engine.state(), ProtocolState::Running);
        let run1 = engine.phase_run().unwrap();
        assert_eq!(run1.phase_id, 1);
        assert_eq!(run1.stop, run1.start + Duration::from_secs(1));

        engine.tick(run1.stop + Duration::from_millis(1), |_| true).unwrap();
        assert_eq!(engine.state(), ProtocolState::PhaseEnd);

        // No more phases -> PROTOCOL_END, then IDLE once all participants drain.
        engine.tick(run1.stop, |_| true).unwrap();
        assert_eq!(engine.state(), ProtocolState::ProtocolEnd);

        engine.tick(run1.stop, |state| state == ProtocolState::Idle).unwrap();
        assert_eq!(engine.state(), ProtocolState::Idle);
        assert!(engine.protocol().is_none());
    }

    #[test]
    fn abort_mid_phase_jumps_straight_to_protocol_end() {
        // Scenario 6 (spec.md §8): 5 phases of 1s each, abort at t=2.3s.
        let mut engine = ProtocolEngine::new();
        let phases: Vec<Phase> = (0..5).map(|_| Phase::new(Duration::from_secs(1))).collect();
        engine.start_protocol(Protocol::new("p", phases), true).unwrap();

        let t0 = Duration::from_secs(0);
        engine.tick(t0, |_| true).unwrap(); // -> PREPARE_PHASE, phase 0
        engine.tick(t0, |_| true).unwrap(); // -> RUNNING, phase 0

        // Walk to phase 2 by repeatedly completing phases.
        for expected_phase in 0..2 {
            let run = engine.phase_run().unwrap();
            assert_eq!(run.phase_id, expected_phase);
            engine.tick(run.stop + Duration::from_millis(1), |_| true).unwrap(); // PHASE_END
            engine.tick(run.stop, |_| true).unwrap(); // PREPARE_PHASE next
            engine.tick(run.stop, |_| true).unwrap(); // RUNNING next
        }
        assert_eq!(engine.phase_run().unwrap().phase_id, 2);

        let abort_time = Duration::from_millis(2300);
        engine.abort_protocol(abort_time);
        assert_eq!(engine.state(), ProtocolState::ProtocolEnd);
        assert_eq!(engine.phase_run().unwrap().stop, abort_time);
        // Final phase index observed at abort time is 2.
        assert_eq!(engine.phase_id(), Some(2));
    }

    #[test]
    fn phase_barrier_blocks_running_until_unanimous_ready() {
        let mut engine = ProtocolEngine::new();
        engine.start_protocol(protocol_with_durations(&[1]), true).unwrap();
        engine.tick(Duration::ZERO, |_| true).unwrap();
        assert_eq!(engine.state(), ProtocolState::PreparePhase);

        // Not unanimous yet: stays in PREPARE_PHASE.
        engine.tick(Duration::ZERO, |_| false).unwrap();
        assert_eq!(engine.state(), ProtocolState::PreparePhase);

        engine.tick(Duration::ZERO, |_| true).unwrap();
        assert_eq!(engine.state(), ProtocolState::Running);
    }

    #[test]
    fn protocol_state_and_worker_state_round_trip_through_the_shared_encoding() {
        for state in [
            ProtocolState::Idle,
            ProtocolState::PrepareProtocol,
            ProtocolState::PreparePhase,
            ProtocolState::Running,
            ProtocolState::PhaseEnd,
            ProtocolState::ProtocolEnd,
        ] {
            let worker_state: WorkerState = state.into();
            assert_eq!(ProtocolState::try_from(worker_state), Ok(state));
        }
        assert!(ProtocolState::try_from(WorkerState::Starting).is_err());
    }
}
