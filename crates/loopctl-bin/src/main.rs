//! The `loopctl` executable: one binary playing two roles (spec.md §4.1,
//! §4.2). Started with no `--worker` flag it is the supervisor — it loads
//! the session config, creates the shared state table, re-execs itself once
//! per worker role with `--worker <id>`, and drives the protocol/recording
//! control surface from stdin. Started with `--worker <id>` (always by a
//! supervisor, never directly by a user) it is that worker: it attaches to
//! the state table its parent created and runs the generic tick loop from
//! `loopctl-worker` against a [`StubWorker`], since a real Camera/Display/Io
//! hardware adapter is collaborator territory this crate doesn't implement.
//!
//! Grounded in `ox-bin/src/main.rs`'s `configure_logging`/`install_panic_hook`
//! shape, generalized to the two roles above.

use std::io;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::mpsc;
use std::sync::Once;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use loopctl_attribute::{AttributeRegistry, Dtype};
use loopctl_logging::{LogSender, QueueLayer, SessionLog};
use loopctl_protocol::{ActionDescriptor, Phase, PhaseRun, Protocol, ProtocolState, VisualDescriptor};
use loopctl_proto::{ControlMessage, DuplexChannel, Signal};
use loopctl_state::{StateTable, WorkerId, WorkerState};
use loopctl_supervisor::Supervisor;
use loopctl_worker::{calibrate_min_sleep, idle_sleep_for, TickContext, Worker, WorkerRunner};

/// Target period of the supervisor's own tick loop and, absent a calibrated
/// value of its own, a worker's fallback. Workers use `calibrate_min_sleep`
/// for their sleep granularity but still tick on this fixed period.
const TICK_PERIOD: Duration = Duration::from_millis(20);
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How many consecutive stale watchdog checks (spaced roughly a second
/// apart) before a worker's heartbeat is logged as stuck (spec.md §5:
/// "a stuck worker is detected by its state not advancing").
const HEARTBEAT_STALE_AFTER: u32 = 3;

#[derive(Parser, Debug)]
#[command(name = "loopctl", version, about = "Closed-loop experiment control runtime")]
struct Args {
    /// Run as the named worker process rather than the supervisor. Set by
    /// the supervisor itself when it spawns each child; never pass this by hand.
    #[arg(long = "worker")]
    worker: Option<String>,

    /// Session config TOML. Falls back to `loopctl_config::discover()`.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Directory holding the shared state table, attribute backings, and
    /// session log for this run. Workers also read this from
    /// `LOOPCTL_RUNTIME_DIR`, inherited from the supervisor that spawned them.
    #[arg(long = "runtime-dir")]
    runtime_dir: Option<PathBuf>,

    /// A protocol file (TOML) to queue for an automatic start once every
    /// participant reaches IDLE.
    #[arg(long = "protocol")]
    protocol: Option<PathBuf>,

    /// Enable recording for the session.
    #[arg(long = "record")]
    record: bool,

    /// Shut down automatically once the `--protocol` run returns to IDLE,
    /// instead of waiting for an interactive `shutdown` command.
    #[arg(long = "once")]
    once: bool,
}

fn main() -> Result<()> {
    install_panic_hook();
    let args = Args::parse();

    let exit_code = match args.worker.clone() {
        Some(id) => {
            let runtime_dir = worker_runtime_dir(&args)?;
            let _guard = configure_logging(&args, &runtime_dir, None);
            run_worker(&id, &args, &runtime_dir)?;
            0
        }
        None => run_supervisor(&args)?,
    };
    exit(exit_code)
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "runtime.panic", %info, "panic");
            default_panic(info);
        }));
    });
}

/// Installs a `tracing` subscriber writing to a per-role rolling file under
/// `log_dir`, plus stderr for anything at `warn` or above. When `queue_sender`
/// is set (the supervisor only — see `run_supervisor`), events also feed the
/// in-process [`loopctl_logging::LogQueue`] that drains into the session log.
fn configure_logging(args: &Args, log_dir: &Path, queue_sender: Option<LogSender>) -> Option<WorkerGuard> {
    let file_name = match &args.worker {
        Some(id) => format!("loopctl-worker-{id}.log"),
        None => "loopctl-supervisor.log".to_string(),
    };
    let _ = std::fs::remove_file(log_dir.join(&file_name));
    let appender = tracing_appender::rolling::never(log_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
    let queue_layer = queue_sender.map(QueueLayer::new);

    match tracing_subscriber::registry().with(filter).with(file_layer).with(queue_layer).try_init() {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}

fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir().join(format!("loopctl-session-{}", std::process::id()))
}

fn worker_runtime_dir(args: &Args) -> Result<PathBuf> {
    args.runtime_dir
        .clone()
        .or_else(|| std::env::var_os("LOOPCTL_RUNTIME_DIR").map(PathBuf::from))
        .context("a worker process requires --runtime-dir or an inherited LOOPCTL_RUNTIME_DIR")
}

fn session_name() -> String {
    format!("rec_{}", chrono::Utc::now().format("%Y-%m-%d-%H-%M-%S"))
}

/// A TOML-deserializable protocol: `loopctl-protocol`'s `Protocol` doesn't
/// derive `Deserialize` itself (phases are built through `Phase::new` /
/// `with_visual` / `with_action`), so `--protocol` files are parsed into
/// this shape first and then converted.
#[derive(Debug, serde::Deserialize)]
struct ProtocolFile {
    id: String,
    #[serde(default)]
    phases: Vec<PhaseFile>,
}

#[derive(Debug, serde::Deserialize)]
struct PhaseFile {
    duration_secs: f64,
    #[serde(default)]
    visual: Option<VisualDescriptor>,
    #[serde(default)]
    action: Option<ActionDescriptor>,
}

fn load_protocol_file(path: &Path) -> Result<Protocol> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read protocol file {}", path.display()))?;
    let file: ProtocolFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse protocol file {}", path.display()))?;
    let phases = file
        .phases
        .into_iter()
        .map(|p| {
            let mut phase = Phase::new(Duration::from_secs_f64(p.duration_secs));
            if let Some(visual) = p.visual {
                phase = phase.with_visual(visual);
            }
            if let Some(action) = p.action {
                phase = phase.with_action(action);
            }
            phase
        })
        .collect();
    Ok(Protocol::new(file.id, phases))
}

/// Runs one fixed-period tick: whatever work `body` did this iteration, then
/// sleeps/busy-waits the remainder of `period` measured from `tick_start`
/// (spec.md §5's calibrated-sleep-then-busy-wait-tail strategy).
fn finish_tick(tick_start: Instant, period: Duration, min_sleep: Duration) {
    let remaining = period.saturating_sub(tick_start.elapsed());
    idle_sleep_for(remaining, min_sleep, std::thread::sleep);
    let deadline = tick_start + period;
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

// ---------------------------------------------------------------------
// Supervisor role
// ---------------------------------------------------------------------

enum CliCommand {
    StartProtocol(PathBuf),
    AbortProtocol,
    StartRecording,
    PauseRecording,
    StopRecording,
    Shutdown,
}

/// Reads whitespace-separated control commands from stdin on a background
/// thread so the tick loop's own non-blocking `try_recv` never waits on the
/// terminal (spec.md §6's CLI/GUI control surface, routed to the supervisor).
fn spawn_command_reader() -> mpsc::Receiver<CliCommand> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in io::BufRead::lines(io::stdin().lock()) {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let cmd = parts.next().unwrap_or_default();
            let rest = parts.next().unwrap_or_default().trim();
            let parsed = match cmd {
                "start_protocol" if !rest.is_empty() => Some(CliCommand::StartProtocol(PathBuf::from(rest))),
                "abort_protocol" => Some(CliCommand::AbortProtocol),
                "start_recording" => Some(CliCommand::StartRecording),
                "pause_recording" => Some(CliCommand::PauseRecording),
                "stop_recording" => Some(CliCommand::StopRecording),
                "shutdown" | "quit" => Some(CliCommand::Shutdown),
                _ => {
                    warn!(target: "runtime.cli", command = line, "unrecognized control command");
                    None
                }
            };
            if let Some(cmd) = parsed {
                if tx.send(cmd).is_err() {
                    break;
                }
            }
        }
    });
    rx
}

/// The supervisor process. Returns the process exit code to use (spec.md §6:
/// 0 clean, 1 config load failure, 2 worker spawn failure, 3 forced shutdown).
fn run_supervisor(args: &Args) -> Result<i32> {
    let config = match loopctl_config::load_from(args.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load session config: {err}");
            return Ok(1);
        }
    };

    let runtime_dir = args.runtime_dir.clone().unwrap_or_else(default_runtime_dir);
    std::fs::create_dir_all(runtime_dir.join("attrs"))
        .with_context(|| format!("failed to create runtime directory {}", runtime_dir.display()))?;
    // Re-exec'd worker children inherit this, so `spawn_worker` doesn't need
    // to thread `--runtime-dir` through explicitly.
    std::env::set_var("LOOPCTL_RUNTIME_DIR", &runtime_dir);

    let state = StateTable::create_file(&runtime_dir.join("state.bin"))
        .context("failed to create shared state table")?;
    let session_log = SessionLog::create(&runtime_dir.join("session.log"), loopctl_logging::DEFAULT_HISTORY_CAPACITY)
        .context("failed to open session log")?;

    let mut supervisor = Supervisor::new(state, session_log);
    supervisor.recording.enabled = args.record;

    let _guard = configure_logging(args, &runtime_dir, Some(supervisor.log_queue.sender.clone()));
    info!(target: "runtime", min_sleep_us = supervisor.min_sleep.as_micros() as u64, "supervisor startup");

    let exe = std::env::current_exe().context("failed to resolve current executable path")?;
    for id in WorkerId::ALL {
        if id == WorkerId::Controller {
            continue;
        }
        if let Err(err) = supervisor.spawn_worker(&exe, id) {
            error!(target: "runtime", worker = %id, error = %err, "failed to spawn worker process");
            return Ok(2);
        }
    }

    let heartbeats = AttributeRegistry::shared(runtime_dir.join("attrs"));
    let mut watchdog = Watchdog::new(&heartbeats);

    let output_root =
        config.file.recording.output_folder.clone().unwrap_or_else(|| PathBuf::from("recordings"));
    let mut pending_protocol = args.protocol.as_deref().map(load_protocol_file).transpose()?;
    let auto_shutdown = args.once && pending_protocol.is_some();
    let mut protocol_active = false;
    // Set once a shutdown request has been refused as not-ready and the
    // operator has been told to reissue to confirm (spec.md §4.1, §8
    // scenario 4). A second `shutdown`/`quit` while this is set proceeds
    // unconditionally.
    let mut shutdown_confirmed = false;

    let commands = spawn_command_reader();
    let start = Instant::now();

    loop {
        let tick_start = Instant::now();
        let now = start.elapsed();

        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                CliCommand::StartProtocol(path) => match load_protocol_file(&path) {
                    Ok(protocol) => pending_protocol = Some(protocol),
                    Err(err) => warn!(target: "runtime.cli", error = %err, "could not load protocol file"),
                },
                CliCommand::AbortProtocol => supervisor.abort_protocol(now),
                CliCommand::StartRecording => {
                    supervisor.start_recording(&output_root, &session_name());
                }
                CliCommand::PauseRecording => supervisor.pause_recording(),
                CliCommand::StopRecording => supervisor.stop_recording(),
                CliCommand::Shutdown => {
                    info!(target: "runtime.cli", "shutdown requested");
                    match supervisor.shutdown(SHUTDOWN_GRACE_PERIOD, SHUTDOWN_POLL_INTERVAL, shutdown_confirmed) {
                        loopctl_supervisor::ShutdownOutcome::NotReady => {
                            warn!(
                                target: "runtime.cli",
                                "not ready to shut down: a worker is busy or a recording is active; reissue shutdown to confirm"
                            );
                            shutdown_confirmed = true;
                        }
                        loopctl_supervisor::ShutdownOutcome::Clean => return Ok(0),
                        loopctl_supervisor::ShutdownOutcome::Forced => return Ok(3),
                    }
                }
            }
        }

        supervisor.tick(now)?;
        watchdog.check(now);

        if let Some(protocol) = pending_protocol.clone() {
            let name = session_name();
            match supervisor.start_protocol(protocol, &output_root, &name) {
                Ok(()) => pending_protocol = None,
                Err(loopctl_supervisor::SupervisorError::ParticipantsBusy(_)) => {
                    // Not every participant is IDLE yet (typical right after
                    // spawn, while workers are still in STARTING); retry next tick.
                }
                Err(err) => {
                    warn!(target: "runtime", error = %err, "protocol refused, discarding");
                    pending_protocol = None;
                }
            }
        }

        if supervisor.protocol.state() != ProtocolState::Idle {
            protocol_active = true;
        }
        if auto_shutdown && protocol_active && pending_protocol.is_none() && supervisor.protocol.state() == ProtocolState::Idle
        {
            info!(target: "runtime", "protocol run complete, shutting down");
            break;
        }

        finish_tick(tick_start, TICK_PERIOD, supervisor.min_sleep);
    }

    // `--once` has no interactive UI to defer a not-ready shutdown to;
    // having just observed the protocol return to IDLE, proceed directly.
    match supervisor.shutdown(SHUTDOWN_GRACE_PERIOD, SHUTDOWN_POLL_INTERVAL, true) {
        loopctl_supervisor::ShutdownOutcome::Clean => {
            info!(target: "runtime", "clean shutdown");
            Ok(0)
        }
        loopctl_supervisor::ShutdownOutcome::NotReady => unreachable!("confirmed shutdown never refuses"),
        loopctl_supervisor::ShutdownOutcome::Forced => {
            warn!(target: "runtime", "forced shutdown after unresponsive worker");
            Ok(3)
        }
    }
}

/// Watches each participating worker's heartbeat attribute (written every
/// tick by `run_worker`) and warns once one stops advancing for a few
/// checks in a row — the supervisor's only window into a worker wedged
/// somewhere other than its state cell (spec.md §5).
struct Watchdog<'a> {
    registry: &'a AttributeRegistry,
    handles: std::collections::HashMap<WorkerId, loopctl_attribute::ArrayHandle>,
    last_seen: std::collections::HashMap<WorkerId, (u64, u32)>,
    last_check: Option<Duration>,
}

impl<'a> Watchdog<'a> {
    fn new(registry: &'a AttributeRegistry) -> Self {
        Self {
            registry,
            handles: std::collections::HashMap::new(),
            last_seen: std::collections::HashMap::new(),
            last_check: None,
        }
    }

    fn check(&mut self, now: Duration) {
        if let Some(last) = self.last_check {
            if now.saturating_sub(last) < Duration::from_secs(1) {
                return;
            }
        }
        self.last_check = Some(now);

        for id in loopctl_supervisor::PROTOCOLIZED {
            if !self.handles.contains_key(&id) {
                // A worker creates its own heartbeat file on its first tick;
                // until then this attach simply fails and is retried next check.
                if let Ok(handle) = self.registry.attach_array(&format!("heartbeat.{id}"), vec![1], Dtype::U64, 64) {
                    self.handles.insert(id, handle);
                }
            }
        }

        for (id, handle) in &self.handles {
            let Ok(Some((idx, _ts, _))) = handle.latest() else { continue };
            let entry = self.last_seen.entry(*id).or_insert((idx, 0));
            if entry.0 == idx {
                entry.1 += 1;
                if entry.1 == HEARTBEAT_STALE_AFTER {
                    warn!(target: "runtime.watchdog", worker = %id, "heartbeat has not advanced, worker may be stuck");
                }
            } else {
                *entry = (idx, 0);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Worker role
// ---------------------------------------------------------------------

/// The generic worker body every role runs: no concrete Camera/Display/Io
/// hardware adapter (that's `loopctl-collab` territory, out of scope here),
/// just the protocol-responder handshake and a per-worker heartbeat.
struct StubWorker {
    id: WorkerId,
}

impl Worker for StubWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn participates_in_protocol(&self) -> bool {
        self.id.is_protocol_participant()
    }

    fn on_prepare_protocol(&mut self) -> anyhow::Result<()> {
        info!(target: "worker", worker = %self.id, "prepare protocol");
        Ok(())
    }

    fn on_prepare_phase(&mut self, phase: &Phase) -> anyhow::Result<()> {
        info!(target: "worker", worker = %self.id, duration_ms = phase.duration.as_millis() as u64, "prepare phase");
        Ok(())
    }

    fn on_cleanup_protocol(&mut self) -> anyhow::Result<()> {
        info!(target: "worker", worker = %self.id, "cleanup protocol");
        Ok(())
    }

    fn tick(&mut self, _ctx: &TickContext) -> anyhow::Result<()> {
        Ok(())
    }
}

fn run_worker(id_str: &str, _args: &Args, runtime_dir: &Path) -> Result<()> {
    let id: WorkerId = id_str.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(target: "runtime", worker = %id, "worker startup");

    let mut state =
        StateTable::open_file(&runtime_dir.join("state.bin")).context("failed to attach to shared state table")?;
    state.store(id, WorkerState::Starting);

    let peer: &'static str = Box::leak(id.as_str().to_string().into_boxed_str());
    let channel = DuplexChannel::new(io::stdout(), io::stdin(), peer);

    let attrs = AttributeRegistry::shared(runtime_dir.join("attrs"));
    let heartbeat = attrs
        .declare_array(&format!("heartbeat.{id}"), vec![1], Dtype::U64, 64)
        .context("failed to declare heartbeat attribute")?;
    let last_error = attrs
        .declare_object(&format!("last_error.{id}"), 16)
        .context("failed to declare last_error attribute")?;
    let mut callbacks = loopctl_proto::CallbackTable::new();

    let min_sleep = calibrate_min_sleep();
    state.store(id, WorkerState::Idle);

    let mut runner = WorkerRunner::new(StubWorker { id });
    let mut phase: Option<Phase> = None;
    let mut phase_run: Option<PhaseRun> = None;
    let mut tick_count: u64 = 0;

    let start = Instant::now();
    loop {
        let tick_start = Instant::now();
        let now = start.elapsed();
        let inbox = channel.drain();

        for msg in &inbox {
            match &msg.signal {
                Signal::UpdateProperty { name, value } => match name.as_str() {
                    "loopctl.phase" => {
                        if let Ok(p) = bincode::deserialize::<Phase>(value) {
                            phase = Some(p);
                        }
                    }
                    "loopctl.phase_run" => {
                        if let Ok(r) = bincode::deserialize::<PhaseRun>(value) {
                            phase_run = Some(r);
                        }
                    }
                    _ => {}
                },
                Signal::Rpc { key, payload } => {
                    if !callbacks.is_registered(key) {
                        let _ = last_error.write(&format!("unknown RPC callback: {key}"));
                    }
                    callbacks.dispatch(key, payload);
                }
                _ => {}
            }
        }

        let supervisor_state =
            ProtocolState::try_from(state.load(WorkerId::Controller)).unwrap_or(ProtocolState::Idle);

        let exited = runner.tick_once(&inbox, supervisor_state, phase.as_ref(), phase_run, now)?;
        if exited {
            state.store(id, WorkerState::Stopped);
            let confirm = ControlMessage::new(id, WorkerId::Controller, Signal::ConfirmShutdown);
            if let Err(err) = channel.send(&confirm) {
                warn!(target: "runtime", worker = %id, error = %err, "failed to send ConfirmShutdown");
            }
            break;
        }
        state.store(id, runner.responder.self_state());

        tick_count += 1;
        let _ = heartbeat.write(&tick_count.to_le_bytes());

        finish_tick(tick_start, TICK_PERIOD, min_sleep);
    }

    info!(target: "runtime", worker = %id, "worker exiting");
    Ok(())
}
