//! Worker identity and the process-shared state cell.
//!
//! Each worker in the runtime is represented by a [`WorkerId`] and carries a
//! single [`WorkerState`] value in a cell that every participating process
//! can read; only the owning worker (or the supervisor, during spawn / force
//! stop) writes to it. The cell is backed by a single byte inside a small
//! memory-mapped region shared by every worker process (see [`StateTable`]),
//! so the same code path that underlies the attribute store's shared ring
//! buffers (`loopctl-attribute`) also carries this much smaller piece of
//! process-shared state.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicI8, Ordering};

use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The fixed set of worker roles in a runtime session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerId {
    Controller,
    Camera,
    Display,
    Io,
    Gui,
    Worker,
}

impl WorkerId {
    pub const ALL: [WorkerId; 6] = [
        WorkerId::Controller,
        WorkerId::Camera,
        WorkerId::Display,
        WorkerId::Io,
        WorkerId::Gui,
        WorkerId::Worker,
    ];

    /// Slot index into the shared state table.
    pub fn slot(self) -> usize {
        match self {
            WorkerId::Controller => 0,
            WorkerId::Camera => 1,
            WorkerId::Display => 2,
            WorkerId::Io => 3,
            WorkerId::Gui => 4,
            WorkerId::Worker => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerId::Controller => "Controller",
            WorkerId::Camera => "Camera",
            WorkerId::Display => "Display",
            WorkerId::Io => "Io",
            WorkerId::Gui => "Gui",
            WorkerId::Worker => "Worker",
        }
    }

    /// Workers that implement the protocol-responder state machine
    /// (spec.md §4.2); the Gui never participates directly.
    pub fn is_protocol_participant(self) -> bool {
        !matches!(self, WorkerId::Controller | WorkerId::Gui)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerId {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Controller" => Ok(WorkerId::Controller),
            "Camera" => Ok(WorkerId::Camera),
            "Display" => Ok(WorkerId::Display),
            "Io" => Ok(WorkerId::Io),
            "Gui" => Ok(WorkerId::Gui),
            "Worker" => Ok(WorkerId::Worker),
            other => Err(StateError::UnknownWorker(other.to_string())),
        }
    }
}

/// Per-worker lifecycle / protocol state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum WorkerState {
    Na = 0,
    Stopped = 1,
    Starting = 2,
    Idle = 3,
    PrepareProtocol = 4,
    WaitForPhase = 5,
    PreparePhase = 6,
    Ready = 7,
    Running = 8,
    PhaseEnd = 9,
    ProtocolEnd = 10,
}

impl WorkerState {
    fn from_i8(v: i8) -> Self {
        match v {
            0 => WorkerState::Na,
            1 => WorkerState::Stopped,
            2 => WorkerState::Starting,
            3 => WorkerState::Idle,
            4 => WorkerState::PrepareProtocol,
            5 => WorkerState::WaitForPhase,
            6 => WorkerState::PreparePhase,
            7 => WorkerState::Ready,
            8 => WorkerState::Running,
            9 => WorkerState::PhaseEnd,
            10 => WorkerState::ProtocolEnd,
            // A corrupted or not-yet-initialized cell reads as Na rather than panicking;
            // readers never observe a state the writer didn't put there in practice.
            _ => WorkerState::Na,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown worker id: {0}")]
    UnknownWorker(String),
    #[error("failed to open state table at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

enum Storage {
    Mmap(MmapMut),
    Heap(Box<[u8]>),
}

impl Storage {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Storage::Mmap(m) => m.as_ptr(),
            Storage::Heap(b) => b.as_ptr(),
        }
    }
}

/// The table of [`WorkerState`] cells shared by every worker process.
///
/// One byte per [`WorkerId`] slot, laid out so [`WorkerId::slot`] indexes
/// directly into it. Backed either by an anonymous heap buffer (single
/// process, used by tests) or a memory-mapped file opened identically by
/// every worker process in a session.
pub struct StateTable {
    storage: Storage,
}

const TABLE_LEN: usize = WorkerId::ALL.len();

impl StateTable {
    /// Create a brand-new backing file sized for the state table and map it.
    /// Called once by the supervisor before any worker is spawned.
    pub fn create_file(path: &Path) -> Result<Self, StateError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| StateError::Open {
                path: path.display().to_string(),
                source,
            })?;
        file.set_len(TABLE_LEN as u64).map_err(|source| StateError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let mmap = unsafe { MmapOptions::new().len(TABLE_LEN).map_mut(&file) }.map_err(|source| {
            StateError::Open {
                path: path.display().to_string(),
                source,
            }
        })?;
        let mut table = StateTable {
            storage: Storage::Mmap(mmap),
        };
        for id in WorkerId::ALL {
            table.store(id, WorkerState::Na);
        }
        Ok(table)
    }

    /// Attach to an existing state table file created by [`StateTable::create_file`].
    /// Called by every spawned worker process.
    pub fn open_file(path: &Path) -> Result<Self, StateError> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(|source| {
            StateError::Open {
                path: path.display().to_string(),
                source,
            }
        })?;
        let mmap = unsafe { MmapOptions::new().len(TABLE_LEN).map_mut(&file) }.map_err(|source| {
            StateError::Open {
                path: path.display().to_string(),
                source,
            }
        })?;
        Ok(StateTable {
            storage: Storage::Mmap(mmap),
        })
    }

    /// A table usable only within a single process (unit tests, in-process
    /// simulations that don't exercise real OS process spawning).
    pub fn in_memory() -> Self {
        let mut table = StateTable {
            storage: Storage::Heap(vec![0u8; TABLE_LEN].into_boxed_slice()),
        };
        for id in WorkerId::ALL {
            table.store(id, WorkerState::Na);
        }
        table
    }

    fn cell(&self, id: WorkerId) -> &AtomicI8 {
        // SAFETY: `storage` is `TABLE_LEN` bytes, one per worker slot, and
        // every access goes through an `AtomicI8` so readers and writers
        // (including those in other OS processes mapping the same file)
        // observe updates via the atomic, never via a plain load/store.
        let base = self.storage.as_ptr();
        unsafe { &*(base.add(id.slot()) as *const AtomicI8) }
    }

    pub fn load(&self, id: WorkerId) -> WorkerState {
        WorkerState::from_i8(self.cell(id).load(Ordering::Acquire))
    }

    pub fn store(&mut self, id: WorkerId, state: WorkerState) {
        self.cell(id).store(state as i8, Ordering::Release);
        tracing::trace!(target: "state", worker = id.as_str(), ?state, "state transition");
    }

    pub fn in_state(&self, id: WorkerId, state: WorkerState) -> bool {
        self.load(id) == state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_na() {
        let table = StateTable::in_memory();
        for id in WorkerId::ALL {
            assert_eq!(table.load(id), WorkerState::Na);
        }
    }

    #[test]
    fn store_then_load_round_trips() {
        let mut table = StateTable::in_memory();
        table.store(WorkerId::Camera, WorkerState::Idle);
        assert_eq!(table.load(WorkerId::Camera), WorkerState::Idle);
        assert!(table.in_state(WorkerId::Camera, WorkerState::Idle));
        assert!(!table.in_state(WorkerId::Display, WorkerState::Idle));
    }

    #[test]
    fn slots_are_independent() {
        let mut table = StateTable::in_memory();
        table.store(WorkerId::Camera, WorkerState::Running);
        table.store(WorkerId::Display, WorkerState::PhaseEnd);
        assert_eq!(table.load(WorkerId::Camera), WorkerState::Running);
        assert_eq!(table.load(WorkerId::Display), WorkerState::PhaseEnd);
        assert_eq!(table.load(WorkerId::Io), WorkerState::Na);
    }

    #[test]
    fn file_backed_table_round_trips_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        {
            let mut writer = StateTable::create_file(&path).unwrap();
            writer.store(WorkerId::Io, WorkerState::Ready);
        }
        let reader = StateTable::open_file(&path).unwrap();
        assert_eq!(reader.load(WorkerId::Io), WorkerState::Ready);
    }

    #[test]
    fn worker_id_from_str_round_trips() {
        for id in WorkerId::ALL {
            let parsed: WorkerId = id.as_str().parse().unwrap();
            assert_eq!(parsed, id);
        }
        assert!("Bogus".parse::<WorkerId>().is_err());
    }
}
