//! The supervisor (spec.md §4.1): owns every worker process, the shared
//! state table, the protocol sequencer, recording controls, and the
//! session log. Grounded directly in `mappapp/modules/controller.py`'s
//! `Controller` class — `__init__`'s calibration/setup sequence,
//! `start_recording`/`pause_recording`/`stop_recording`/`start_protocol`/
//! `abortProtocol`, and `main()`'s per-tick log drain + protocol step.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use loopctl_logging::{LogQueue, SessionLog};
use loopctl_proto::{ControlMessage, DuplexChannel, FanIn, FanInHandle, ProtoError, Signal};
use loopctl_protocol::{Protocol, ProtocolEngine, ProtocolError, ProtocolState};
use loopctl_state::{StateError, StateTable, WorkerId, WorkerState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("state table error: {0}")]
    State(#[from] StateError),
    #[error("control channel error: {0}")]
    Proto(#[from] ProtoError),
    #[error("failed to spawn worker process {0}: {1}")]
    Spawn(WorkerId, std::io::Error),
    #[error("one or more participating workers are busy: {0:?}")]
    ParticipantsBusy(Vec<WorkerId>),
}

/// Measures the tightest reliable sleep granularity this OS/host offers, by
/// sampling 100 minimal sleeps and taking the worst case — identical
/// calibration to `loopctl_worker::calibrate_min_sleep`, run once more here
/// because the supervisor's own tick loop needs the same number and the two
/// processes never share memory to compute it once (`Controller.__init__`'s
/// "avg. minimum sleep period" loop).
pub fn calibrate_min_sleep() -> Duration {
    loopctl_worker::calibrate_min_sleep()
}

/// Recording control block (spec.md §4.7): `enabled` is a standing user
/// preference, `active` toggles per start/pause/stop, `folder` is set once
/// per recording and cleared on stop.
#[derive(Debug, Clone, Default)]
pub struct RecordingControl {
    pub enabled: bool,
    pub active: bool,
    pub folder: Option<PathBuf>,
}

/// Result of a `Supervisor::shutdown` call (spec.md §4.1, §8 scenario 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Refused: some worker isn't `Idle`/`Na`, or a recording is active, and
    /// the caller didn't pass `confirmed`. No worker or recording state was
    /// touched; the UI should confirm and the caller should reissue.
    NotReady,
    /// Every worker reported `Stopped` within the grace period.
    Clean,
    /// At least one worker was unresponsive and had to be killed.
    Forced,
}

/// One spawned worker process: its OS handle plus its control channel.
pub struct WorkerHandle {
    pub child: Child,
    pub channel: DuplexChannel<std::process::ChildStdin>,
}

/// Workers that participate in protocol phase sequencing (spec.md §3):
/// every role except `Controller` and `Gui`, matching
/// `WorkerId::is_protocol_participant`.
pub const PROTOCOLIZED: [WorkerId; 4] = [WorkerId::Camera, WorkerId::Display, WorkerId::Io, WorkerId::Worker];

fn worker_state_for_protocol_target(target: ProtocolState) -> WorkerState {
    match target {
        ProtocolState::PreparePhase => WorkerState::WaitForPhase,
        ProtocolState::Running => WorkerState::Ready,
        ProtocolState::Idle => WorkerState::Idle,
        // Not queried by ProtocolEngine::tick for any other target today;
        // treated as "always satisfied" rather than panicking on a future
        // addition to the transition table.
        _ => return WorkerState::Na,
    }
}

pub struct Supervisor {
    pub state: StateTable,
    pub protocol: ProtocolEngine,
    pub recording: RecordingControl,
    pub log_queue: LogQueue,
    pub session_log: SessionLog,
    pub min_sleep: Duration,
    workers: HashMap<WorkerId, WorkerHandle>,
    fan_in: FanIn,
    fan_in_handle: FanInHandle,
}

impl Supervisor {
    pub fn new(state: StateTable, session_log: SessionLog) -> Self {
        let (fan_in, fan_in_handle) = FanIn::new();
        // Controller.__init__'s setup block measures both the minimum sleep
        // granularity and the wall clock's effective tick precision; the
        // latter logs itself at warn/info depending on whether it's worse
        // than 1ms (spec.md §4.1, §5).
        loopctl_worker::measure_timing_precision();
        Self {
            state,
            protocol: ProtocolEngine::new(),
            recording: RecordingControl::default(),
            log_queue: LogQueue::new(),
            session_log,
            min_sleep: calibrate_min_sleep(),
            workers: HashMap::new(),
            fan_in,
            fan_in_handle,
        }
    }

    pub fn fan_in(&self) -> FanIn {
        self.fan_in.clone()
    }

    /// Spawns `worker_exe --worker <id>` with piped stdio and wires its
    /// control channel, mirroring `initialize_process`'s `mp.Process(...)`
    /// + pipe setup.
    pub fn spawn_worker(&mut self, worker_exe: &std::path::Path, id: WorkerId) -> Result<(), SupervisorError> {
        let mut child = Command::new(worker_exe)
            .arg("--worker")
            .arg(id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| SupervisorError::Spawn(id, e))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let leaked_peer: &'static str = Box::leak(id.as_str().to_string().into_boxed_str());
        let channel = DuplexChannel::new(stdin, stdout, leaked_peer);

        self.state.store(id, WorkerState::Starting);
        self.workers.insert(id, WorkerHandle { child, channel });
        Ok(())
    }

    fn all_protocolized_in(&self, target: ProtocolState) -> bool {
        let expected = worker_state_for_protocol_target(target);
        PROTOCOLIZED.iter().all(|&id| self.state.in_state(id, expected))
    }

    /// `start_recording` (spec.md §4.7): refuses if already active; a no-op
    /// success if recording is disabled entirely; otherwise picks a
    /// timestamped folder if none is set yet and marks recording active.
    /// Returns `false` only when a recording was already in progress.
    pub fn start_recording(&mut self, base_folder: &std::path::Path, session_name: &str) -> bool {
        if self.recording.active {
            tracing::warn!("tried to start a new recording while one is already active");
            return false;
        }
        if !self.recording.enabled {
            tracing::warn!("recording not enabled; session will not be saved to disk");
            return true;
        }
        if self.recording.folder.is_none() {
            self.recording.folder = Some(base_folder.join(session_name));
        }
        tracing::info!(folder = ?self.recording.folder, "start recording");
        self.recording.active = true;
        true
    }

    pub fn pause_recording(&mut self) {
        if !self.recording.active {
            tracing::warn!("tried to pause an inactive recording");
            return;
        }
        tracing::info!("pause recording");
        self.recording.active = false;
    }

    /// `stop_recording` (spec.md §4.7): deactivates and clears the folder so
    /// the next `start_recording` picks a fresh one.
    pub fn stop_recording(&mut self) {
        self.recording.active = false;
        tracing::info!("stop recording");
        self.recording.folder = None;
    }

    /// `start_protocol` (spec.md §4.1): refuses unless every protocolized
    /// worker is `Idle`, starting recording first if it's enabled but not
    /// yet active.
    pub fn start_protocol(
        &mut self,
        protocol: Protocol,
        base_folder: &std::path::Path,
        session_name: &str,
    ) -> Result<(), SupervisorError> {
        let busy: Vec<WorkerId> =
            PROTOCOLIZED.iter().copied().filter(|&id| !self.state.in_state(id, WorkerState::Idle)).collect();
        if !busy.is_empty() {
            return Err(SupervisorError::ParticipantsBusy(busy));
        }

        if self.recording.enabled && !self.recording.active {
            self.start_recording(base_folder, session_name);
        }

        self.protocol.start_protocol(protocol, true)?;
        Ok(())
    }

    pub fn abort_protocol(&mut self, now: Duration) {
        self.protocol.abort_protocol(now);
    }

    /// One supervisor tick (spec.md §4.1's `main()`): drains the log queue,
    /// drains worker-to-supervisor messages (dispatching RPCs that target
    /// the supervisor itself, forwarding everything else), steps the
    /// protocol engine, and publishes the resulting protocol state/phase to
    /// every worker process.
    pub fn tick(&mut self, now: Duration) -> Result<(), SupervisorError> {
        let records = self.log_queue.drain();
        self.session_log.ingest(records);

        let inbound: Vec<ControlMessage> = self.workers.values().flat_map(|h| h.channel.drain()).collect();
        for msg in inbound {
            self.route_message(msg)?;
        }
        while let Ok(msg) = self.fan_in_handle.rx.try_recv() {
            self.route_message(msg)?;
        }

        let state_before = self.protocol.state();
        self.protocol.tick(now, |target| self.all_protocolized_in(target))?;
        self.publish_protocol_state(state_before)?;
        Ok(())
    }

    /// Writes the protocol engine's current state into the shared state
    /// table at `WorkerId::Controller`'s slot (no worker ever writes that
    /// slot itself), and broadcasts the active phase/phase-run to every
    /// protocolized worker whenever the state changed this tick. A worker
    /// process has no other way to observe the supervisor's protocol state
    /// across an OS process boundary (spec.md §4.2's transition table is
    /// driven entirely off these two signals).
    fn publish_protocol_state(&mut self, state_before: ProtocolState) -> Result<(), SupervisorError> {
        let state_now = self.protocol.state();
        self.state.store(WorkerId::Controller, state_now.into());
        if state_now == state_before {
            return Ok(());
        }

        let phase = self.protocol.current_phase().cloned();
        let phase_run = self.protocol.phase_run();
        for id in PROTOCOLIZED {
            if let Some(handle) = self.workers.get(&id) {
                if let Some(phase) = &phase {
                    let payload = bincode::serialize(phase).unwrap_or_default();
                    let msg = ControlMessage::new(
                        WorkerId::Controller,
                        id,
                        Signal::UpdateProperty { name: "loopctl.phase".to_string(), value: payload },
                    );
                    handle.channel.send(&msg)?;
                }
                if let Some(run) = phase_run {
                    let payload = bincode::serialize(&run).unwrap_or_default();
                    let msg = ControlMessage::new(
                        WorkerId::Controller,
                        id,
                        Signal::UpdateProperty { name: "loopctl.phase_run".to_string(), value: payload },
                    );
                    handle.channel.send(&msg)?;
                }
            }
        }
        Ok(())
    }

    fn route_message(&mut self, msg: ControlMessage) -> Result<(), SupervisorError> {
        match &msg.signal {
            Signal::ConfirmShutdown => {
                self.state.store(msg.sender, WorkerState::Stopped);
            }
            Signal::Rpc { .. } | Signal::UpdateProperty { .. } if msg.receiver != WorkerId::Controller => {
                if let Some(handle) = self.workers.get(&msg.receiver) {
                    handle.channel.send(&msg)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// "every worker is IDLE or NA and recording is not active" (spec.md
    /// §4.1's shutdown precondition).
    fn ready_for_shutdown(&self) -> bool {
        !self.recording.active
            && self
                .workers
                .keys()
                .all(|id| self.state.in_state(*id, WorkerState::Idle) || self.state.in_state(*id, WorkerState::Na))
    }

    /// Broadcasts `Shutdown` to every worker, then polls the state table for
    /// up to `grace_period` waiting for every worker to report `Stopped` via
    /// `ConfirmShutdown`, force-killing stragglers afterward (spec.md §4.1's
    /// `start()` shutdown loop, made bounded rather than looping forever).
    ///
    /// Unless `confirmed` is set, first checks `ready_for_shutdown`: if some
    /// worker is neither `Idle` nor `Na`, or a recording is active, refuses
    /// and returns `ShutdownOutcome::NotReady` without touching any worker or
    /// the recording state, deferring to the UI for confirmation (spec.md
    /// §4.1, §8 scenario 4). A caller that has obtained that confirmation
    /// reissues with `confirmed: true`, which stops any active recording
    /// (flushing it) before broadcasting.
    pub fn shutdown(&mut self, grace_period: Duration, poll_interval: Duration, confirmed: bool) -> ShutdownOutcome {
        if !confirmed && !self.ready_for_shutdown() {
            return ShutdownOutcome::NotReady;
        }
        if self.recording.active {
            self.stop_recording();
        }

        for (id, handle) in &self.workers {
            let msg = ControlMessage::new(WorkerId::Controller, *id, Signal::Shutdown);
            if let Err(err) = handle.channel.send(&msg) {
                tracing::warn!(worker = %id, error = %err, "failed to send shutdown signal");
            }
        }

        let deadline = std::time::Instant::now() + grace_period;
        loop {
            for handle in self.workers.values() {
                for msg in handle.channel.drain() {
                    if matches!(msg.signal, Signal::ConfirmShutdown) {
                        self.state.store(msg.sender, WorkerState::Stopped);
                    }
                }
            }
            while let Ok(msg) = self.fan_in_handle.rx.try_recv() {
                if matches!(msg.signal, Signal::ConfirmShutdown) {
                    self.state.store(msg.sender, WorkerState::Stopped);
                }
            }
            let all_stopped = self.workers.keys().all(|id| self.state.in_state(*id, WorkerState::Stopped));
            if all_stopped {
                break;
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(poll_interval);
        }

        let mut clean = true;
        for (id, handle) in self.workers.iter_mut() {
            if !self.state.in_state(*id, WorkerState::Stopped) {
                tracing::warn!(worker = %id, "worker unresponsive to shutdown; killing");
                let _ = handle.child.kill();
                clean = false;
            }
            let _ = handle.child.wait();
        }
        self.workers.clear();
        if clean {
            ShutdownOutcome::Clean
        } else {
            ShutdownOutcome::Forced
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_state_table() -> StateTable {
        let mut table = StateTable::in_memory();
        for id in WorkerId::ALL {
            table.store(id, WorkerState::Idle);
        }
        table
    }

    #[test]
    fn start_protocol_refuses_when_a_participant_is_busy() {
        let mut sup = Supervisor::new(StateTable::in_memory(), SessionLog::in_memory(10));
        sup.state.store(WorkerId::Display, WorkerState::Running);
        for id in [WorkerId::Camera, WorkerId::Io] {
            sup.state.store(id, WorkerState::Idle);
        }
        let protocol = Protocol::new("p", vec![]);
        let err = sup.start_protocol(protocol, std::path::Path::new("/tmp"), "s").unwrap_err();
        assert!(matches!(err, SupervisorError::ParticipantsBusy(ref busy) if busy == &vec![WorkerId::Display]));
    }

    #[test]
    fn start_protocol_starts_recording_when_enabled() {
        let mut sup = Supervisor::new(idle_state_table(), SessionLog::in_memory(10));
        sup.recording.enabled = true;
        let protocol = Protocol::new("p", vec![loopctl_protocol::Phase::new(Duration::from_secs(1))]);
        sup.start_protocol(protocol, std::path::Path::new("/tmp/data"), "rec_1").unwrap();
        assert!(sup.recording.active);
        assert_eq!(sup.recording.folder, Some(PathBuf::from("/tmp/data/rec_1")));
        assert_eq!(sup.protocol.state(), ProtocolState::PrepareProtocol);
    }

    #[test]
    fn recording_lifecycle_start_pause_stop() {
        let mut sup = Supervisor::new(StateTable::in_memory(), SessionLog::in_memory(10));
        sup.recording.enabled = true;
        assert!(sup.start_recording(std::path::Path::new("/tmp"), "rec"));
        assert!(sup.recording.active);

        // Starting again while active is refused.
        assert!(!sup.start_recording(std::path::Path::new("/tmp"), "rec"));

        sup.pause_recording();
        assert!(!sup.recording.active);

        sup.stop_recording();
        assert!(sup.recording.folder.is_none());
    }

    #[test]
    fn start_recording_is_a_no_op_success_when_disabled() {
        let mut sup = Supervisor::new(StateTable::in_memory(), SessionLog::in_memory(10));
        assert!(!sup.recording.enabled);
        assert!(sup.start_recording(std::path::Path::new("/tmp"), "rec"));
        assert!(!sup.recording.active);
    }

    #[test]
    fn tick_advances_protocol_once_workers_reach_wait_for_phase() {
        let mut sup = Supervisor::new(idle_state_table(), SessionLog::in_memory(10));
        let protocol = Protocol::new("p", vec![loopctl_protocol::Phase::new(Duration::from_millis(10))]);
        sup.start_protocol(protocol, std::path::Path::new("/tmp"), "s").unwrap();
        assert_eq!(sup.protocol.state(), ProtocolState::PrepareProtocol);

        sup.tick(Duration::ZERO).unwrap();
        assert_eq!(sup.protocol.state(), ProtocolState::PrepareProtocol);

        for id in PROTOCOLIZED {
            sup.state.store(id, WorkerState::WaitForPhase);
        }
        sup.tick(Duration::ZERO).unwrap();
        assert_eq!(sup.protocol.state(), ProtocolState::PreparePhase);
        assert_eq!(sup.protocol.phase_id(), Some(0));
    }

    #[test]
    fn abort_protocol_jumps_straight_to_protocol_end() {
        let mut sup = Supervisor::new(idle_state_table(), SessionLog::in_memory(10));
        let protocol = Protocol::new("p", vec![loopctl_protocol::Phase::new(Duration::from_secs(5))]);
        sup.start_protocol(protocol, std::path::Path::new("/tmp"), "s").unwrap();
        sup.abort_protocol(Duration::from_secs(1));
        assert_eq!(sup.protocol.state(), ProtocolState::ProtocolEnd);
    }

    #[test]
    fn tick_publishes_protocol_state_into_the_controller_slot() {
        let mut sup = Supervisor::new(idle_state_table(), SessionLog::in_memory(10));
        assert!(sup.state.in_state(WorkerId::Controller, WorkerState::Idle));

        let protocol = Protocol::new("p", vec![loopctl_protocol::Phase::new(Duration::from_millis(10))]);
        sup.start_protocol(protocol, std::path::Path::new("/tmp"), "s").unwrap();
        sup.tick(Duration::ZERO).unwrap();
        assert!(sup.state.in_state(WorkerId::Controller, WorkerState::PrepareProtocol));

        for id in PROTOCOLIZED {
            sup.state.store(id, WorkerState::WaitForPhase);
        }
        sup.tick(Duration::ZERO).unwrap();
        assert!(sup.state.in_state(WorkerId::Controller, WorkerState::PreparePhase));
    }

    #[test]
    fn shutdown_refuses_while_recording_is_active() {
        let mut sup = Supervisor::new(idle_state_table(), SessionLog::in_memory(10));
        sup.recording.enabled = true;
        sup.start_recording(std::path::Path::new("/tmp"), "rec");
        assert!(sup.recording.active);

        let outcome = sup.shutdown(Duration::from_millis(10), Duration::from_millis(1), false);
        assert_eq!(outcome, ShutdownOutcome::NotReady);
        // Refused means untouched: still recording, nothing broadcast.
        assert!(sup.recording.active);
    }

    #[test]
    fn confirmed_shutdown_stops_recording_and_proceeds() {
        let mut sup = Supervisor::new(idle_state_table(), SessionLog::in_memory(10));
        sup.recording.enabled = true;
        sup.start_recording(std::path::Path::new("/tmp"), "rec");

        let outcome = sup.shutdown(Duration::from_millis(10), Duration::from_millis(1), true);
        assert_eq!(outcome, ShutdownOutcome::Clean);
        assert!(!sup.recording.active);
    }

    #[test]
    fn shutdown_proceeds_directly_when_idle_and_not_recording() {
        let mut sup = Supervisor::new(idle_state_table(), SessionLog::in_memory(10));
        let outcome = sup.shutdown(Duration::from_millis(10), Duration::from_millis(1), false);
        assert_eq!(outcome, ShutdownOutcome::Clean);
    }
}
