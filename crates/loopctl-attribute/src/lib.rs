//! The attribute store: named, typed, shared-memory ring buffers — the data
//! plane of a running session (spec.md §4.4).
//!
//! An attribute is declared once (`declare_array` / `declare_object`),
//! written by exactly one producer, and read by any number of consumers,
//! possibly in other OS processes: the producer publishes a new entry by
//! copying into slot `w mod N`, then writes the incremented monotonic index
//! `w` into the shared header word; a reader loads `w` from that same shared
//! header (not a private copy), copies the slots it wants, then re-reads `w`
//! to detect whether the producer lapped it mid-copy. A lapped reader gets
//! `AttributeError::Lagged` rather than torn data.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::{MmapMut, MmapOptions};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Inline capacity for a single object-attribute slot. A payload that does
/// not bincode-encode within this many bytes is rejected rather than
/// silently truncated (spec.md Design Notes §9).
pub const OBJECT_INLINE_MAX: usize = 4096;

/// Numeric element types supported by array attributes (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
}

impl Dtype {
    pub fn byte_size(self) -> usize {
        match self {
            Dtype::I8 | Dtype::U8 | Dtype::Bool => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::I32 | Dtype::U32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::U64 | Dtype::F64 => 8,
        }
    }
}

/// The declared shape of an attribute; two declarations of the same name
/// must agree on this or `declare_*` fails (spec.md §4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum AttrDescriptor {
    Array { shape: Vec<usize>, dtype: Dtype },
    Object,
}

impl AttrDescriptor {
    fn record_len(&self) -> usize {
        match self {
            AttrDescriptor::Array { shape, dtype } => shape.iter().product::<usize>() * dtype.byte_size(),
            // u32 length prefix + the bounded inline payload.
            AttrDescriptor::Object => 4 + OBJECT_INLINE_MAX,
        }
    }
}

#[derive(Debug, Error)]
pub enum AttributeError {
    #[error("attribute \"{name}\" already declared with a different descriptor")]
    DescriptorMismatch { name: String },
    #[error("unknown attribute \"{0}\"")]
    UnknownAttribute(String),
    #[error("value of {got} bytes does not match the declared record size of {expected} bytes for \"{name}\"")]
    ShapeMismatch { name: String, expected: usize, got: usize },
    #[error("object payload of {got} bytes exceeds the inline limit of {max} bytes")]
    ObjectTooLarge { got: usize, max: usize },
    #[error("reader lagged behind the producer and lost entries older than {oldest_available}")]
    Lagged { oldest_available: u64 },
    #[error("failed to open attribute backing at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode object payload: {0}")]
    Encode(#[from] bincode::Error),
}

pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
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

    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Storage::Mmap(m) => m.as_mut_ptr(),
            Storage::Heap(b) => b.as_mut_ptr(),
        }
    }
}

/// The result of a `read` call (spec.md §4.4): parallel index/timestamp/value
/// vectors, oldest first, plus whether entries older than what's returned
/// were lost to the producer lapping the ring.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub indices: Vec<u64>,
    pub timestamps: Vec<u64>,
    pub values: Vec<Vec<u8>>,
    pub lost: bool,
}

/// A single named ring buffer: a write-index header word, a parallel
/// timestamp+sequence ring, and the data ring itself.
///
/// Layout: `[w: u64][ (ts: u64, seq: u64) * capacity ][ record * capacity ]`.
/// `seq` in the timestamp ring is the `w` value current at the time that
/// slot was last written, used by readers to detect a slot reused mid-copy
/// even when `w` itself has also moved (the "re-check after copy" rule in
/// spec.md §4.4).
///
/// `w` is kept in two places: the `AtomicU64` is the producer's own fast
/// local counter for choosing the next slot, and the header word at offset 0
/// of `storage` is the value every reader — including readers in other OS
/// processes, each with their own `RingBuffer` mapping the same file — must
/// consult. Readers therefore always load `w` through `storage` under the
/// lock rather than through `w`, since `w` is never updated by anyone but
/// the producer's own process.
struct RingBuffer {
    storage: Mutex<Storage>,
    w: AtomicU64,
    capacity: usize,
    record_len: usize,
}

const HEADER_LEN: usize = 8;
const TS_ENTRY_LEN: usize = 16;

impl RingBuffer {
    fn total_len(capacity: usize, record_len: usize) -> usize {
        HEADER_LEN + capacity * TS_ENTRY_LEN + capacity * record_len
    }

    fn ts_ring_offset() -> usize {
        HEADER_LEN
    }

    fn data_ring_offset(capacity: usize) -> usize {
        HEADER_LEN + capacity * TS_ENTRY_LEN
    }

    fn create_file(path: &Path, capacity: usize, record_len: usize) -> Result<Self, AttributeError> {
        let len = Self::total_len(capacity, record_len);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| AttributeError::Open { path: path.display().to_string(), source })?;
        file.set_len(len as u64)
            .map_err(|source| AttributeError::Open { path: path.display().to_string(), source })?;
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|source| AttributeError::Open { path: path.display().to_string(), source })?;
        Ok(Self {
            storage: Mutex::new(Storage::Mmap(mmap)),
            w: AtomicU64::new(0),
            capacity,
            record_len,
        })
    }

    fn open_file(path: &Path, capacity: usize, record_len: usize) -> Result<Self, AttributeError> {
        let len = Self::total_len(capacity, record_len);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| AttributeError::Open { path: path.display().to_string(), source })?;
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|source| AttributeError::Open { path: path.display().to_string(), source })?;
        // `w` lives inside the shared mapping; the in-process atomic mirrors
        // whatever the creator most recently published so a freshly attached
        // reader doesn't have to trust a stale zero.
        let w = u64::from_le_bytes(mmap[0..8].try_into().unwrap());
        Ok(Self {
            storage: Mutex::new(Storage::Mmap(mmap)),
            w: AtomicU64::new(w),
            capacity,
            record_len,
        })
    }

    fn in_memory(capacity: usize, record_len: usize) -> Self {
        let len = Self::total_len(capacity, record_len);
        Self {
            storage: Mutex::new(Storage::Heap(vec![0u8; len].into_boxed_slice())),
            w: AtomicU64::new(0),
            capacity,
            record_len,
        }
    }

    /// Writes `bytes` (already exactly `record_len`) as the next entry.
    /// Single-producer by contract: the registry hands out exactly one
    /// writer handle per attribute.
    fn write(&self, bytes: &[u8], ts: u64) {
        let idx = self.w.load(Ordering::Relaxed);
        let slot = (idx % self.capacity as u64) as usize;
        {
            let mut guard = self.storage.lock().expect("ring buffer storage mutex poisoned");
            let ptr = guard.as_mut_ptr();
            unsafe {
                let ts_off = Self::ts_ring_offset() + slot * TS_ENTRY_LEN;
                std::ptr::copy_nonoverlapping(ts.to_le_bytes().as_ptr(), ptr.add(ts_off), 8);
                std::ptr::copy_nonoverlapping((idx + 1).to_le_bytes().as_ptr(), ptr.add(ts_off + 8), 8);

                let data_off = Self::data_ring_offset(self.capacity) + slot * self.record_len;
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(data_off), bytes.len());

                // Publish the header word too, so a process that reopens this
                // same file later (a fresh `open_file`) sees the real index
                // rather than the zero it was created with.
                std::ptr::copy_nonoverlapping((idx + 1).to_le_bytes().as_ptr(), ptr, 8);
            }
        }
        self.w.store(idx + 1, Ordering::Release);
    }

    /// Reads the shared header word under the storage lock. This is the
    /// index every consumer must use: the `w` atomic only ever advances in
    /// the producer's own process, so a consumer attached from elsewhere
    /// reading `self.w` instead would see the value current at attach time
    /// forever, never the producer's later writes.
    fn load_w(&self) -> u64 {
        let guard = self.storage.lock().expect("ring buffer storage mutex poisoned");
        let base = guard.as_ptr();
        let mut buf = [0u8; 8];
        unsafe {
            std::ptr::copy_nonoverlapping(base, buf.as_mut_ptr(), 8);
        }
        u64::from_le_bytes(buf)
    }

    fn read_slot(&self, slot: usize) -> (u64, u64, Vec<u8>) {
        let guard = self.storage.lock().expect("ring buffer storage mutex poisoned");
        let base = guard.as_ptr();
        unsafe {
            let ts_off = Self::ts_ring_offset() + slot * TS_ENTRY_LEN;
            let mut ts_buf = [0u8; 8];
            let mut seq_buf = [0u8; 8];
            std::ptr::copy_nonoverlapping(base.add(ts_off), ts_buf.as_mut_ptr(), 8);
            std::ptr::copy_nonoverlapping(base.add(ts_off + 8), seq_buf.as_mut_ptr(), 8);

            let data_off = Self::data_ring_offset(self.capacity) + slot * self.record_len;
            let mut data = vec![0u8; self.record_len];
            std::ptr::copy_nonoverlapping(base.add(data_off), data.as_mut_ptr(), self.record_len);

            (u64::from_le_bytes(ts_buf), u64::from_le_bytes(seq_buf), data)
        }
    }

    /// Reads entries in `[from_idx, w-1]` (or the latest `count` if
    /// `from_idx` is `None`), oldest first. If part of the requested window
    /// has been overwritten, returns the largest still-available suffix and
    /// sets `lost`.
    fn read(&self, from_idx: Option<u64>, count: usize) -> Result<ReadResult, AttributeError> {
        let w_before = self.load_w();
        if w_before == 0 {
            return Ok(ReadResult { indices: vec![], timestamps: vec![], values: vec![], lost: false });
        }

        let requested_start = match from_idx {
            Some(i) => i,
            None => w_before.saturating_sub(count as u64),
        };
        let oldest_available = w_before.saturating_sub(self.capacity as u64);
        let lost = requested_start < oldest_available;
        let start = requested_start.max(oldest_available);

        let mut indices = Vec::new();
        let mut timestamps = Vec::new();
        let mut values = Vec::new();
        for idx in start..w_before {
            let slot = (idx % self.capacity as u64) as usize;
            let (ts, seq, data) = self.read_slot(slot);
            // `seq` is the `w` value as of that slot's last write; if it no
            // longer corresponds to this logical index, the producer lapped
            // us while we were copying and this entry is torn.
            if seq != idx + 1 {
                continue;
            }
            indices.push(idx);
            timestamps.push(ts);
            values.push(data);
        }

        let w_after = self.load_w();
        let lapped_during_read = w_after.saturating_sub(w_before) >= self.capacity as u64;

        Ok(ReadResult {
            indices,
            timestamps,
            values,
            lost: lost || lapped_during_read,
        })
    }

    fn latest(&self) -> Result<Option<(u64, u64, Vec<u8>)>, AttributeError> {
        let result = self.read(None, 1)?;
        Ok(result
            .indices
            .last()
            .copied()
            .map(|idx| (idx, *result.timestamps.last().unwrap(), result.values.last().unwrap().clone())))
    }
}

/// A write handle for an array attribute, obtained from `declare_array`.
pub struct ArrayHandle {
    name: String,
    shape: Vec<usize>,
    dtype: Dtype,
    ring: Arc<RingBuffer>,
}

impl ArrayHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Writes one element's raw bytes (row-major, `prod(shape) * dtype.byte_size()` long).
    pub fn write(&self, bytes: &[u8]) -> Result<(), AttributeError> {
        self.write_at(bytes, now_nanos())
    }

    pub fn write_at(&self, bytes: &[u8], ts: u64) -> Result<(), AttributeError> {
        if bytes.len() != self.ring.record_len {
            return Err(AttributeError::ShapeMismatch {
                name: self.name.clone(),
                expected: self.ring.record_len,
                got: bytes.len(),
            });
        }
        self.ring.write(bytes, ts);
        Ok(())
    }

    pub fn read(&self, from_idx: Option<u64>, count: usize) -> Result<ReadResult, AttributeError> {
        self.ring.read(from_idx, count)
    }

    pub fn latest(&self) -> Result<Option<(u64, u64, Vec<u8>)>, AttributeError> {
        self.ring.latest()
    }
}

/// A write handle for an object attribute, obtained from `declare_object`.
pub struct ObjectHandle {
    name: String,
    ring: Arc<RingBuffer>,
}

impl ObjectHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write<T: Serialize>(&self, value: &T) -> Result<(), AttributeError> {
        self.write_at(value, now_nanos())
    }

    pub fn write_at<T: Serialize>(&self, value: &T, ts: u64) -> Result<(), AttributeError> {
        let payload = bincode::serialize(value)?;
        if payload.len() > OBJECT_INLINE_MAX {
            return Err(AttributeError::ObjectTooLarge { got: payload.len(), max: OBJECT_INLINE_MAX });
        }
        let mut record = vec![0u8; self.ring.record_len];
        record[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        record[4..4 + payload.len()].copy_from_slice(&payload);
        self.ring.write(&record, ts);
        Ok(())
    }

    pub fn read<T: DeserializeOwned>(&self, from_idx: Option<u64>, count: usize) -> Result<(ReadResult, Vec<T>), AttributeError> {
        let raw = self.ring.read(from_idx, count)?;
        let mut decoded = Vec::with_capacity(raw.values.len());
        for record in &raw.values {
            let len = u32::from_le_bytes(record[0..4].try_into().unwrap()) as usize;
            decoded.push(bincode::deserialize(&record[4..4 + len])?);
        }
        Ok((raw, decoded))
    }

    pub fn latest<T: DeserializeOwned>(&self) -> Result<Option<(u64, u64, T)>, AttributeError> {
        let (raw, mut decoded) = self.read::<T>(None, 1)?;
        Ok(raw.indices.last().copied().map(|idx| {
            let ts = *raw.timestamps.last().unwrap();
            (idx, ts, decoded.pop().unwrap())
        }))
    }
}

struct RegistryEntry {
    descriptor: AttrDescriptor,
    capacity: usize,
    ring: Arc<RingBuffer>,
}

/// The per-session registry of declared attributes (spec.md §4.4).
///
/// Backed either by a runtime directory of mmap'd files (real multi-process
/// sessions) or purely in-memory (single-process tests and simulations).
pub struct AttributeRegistry {
    dir: Option<PathBuf>,
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl AttributeRegistry {
    /// A registry that memory-maps one file per attribute under `dir`.
    pub fn shared(dir: impl Into<PathBuf>) -> Self {
        Self { dir: Some(dir.into()), entries: Mutex::new(HashMap::new()) }
    }

    /// A registry usable only within a single process.
    pub fn in_process() -> Self {
        Self { dir: None, entries: Mutex::new(HashMap::new()) }
    }

    fn get_or_create(&self, name: &str, descriptor: AttrDescriptor, capacity: usize) -> Result<Arc<RingBuffer>, AttributeError> {
        let mut entries = self.entries.lock().expect("attribute registry mutex poisoned");
        if let Some(existing) = entries.get(name) {
            if existing.descriptor != descriptor || existing.capacity != capacity {
                return Err(AttributeError::DescriptorMismatch { name: name.to_string() });
            }
            return Ok(existing.ring.clone());
        }

        let record_len = descriptor.record_len();
        let ring = match &self.dir {
            Some(dir) => {
                let path = dir.join(format!("{name}.attr"));
                Arc::new(RingBuffer::create_file(&path, capacity, record_len)?)
            }
            None => Arc::new(RingBuffer::in_memory(capacity, record_len)),
        };
        entries.insert(name.to_string(), RegistryEntry { descriptor, capacity, ring: ring.clone() });
        Ok(ring)
    }

    /// Attaches to an attribute declared by another process sharing this
    /// registry's directory, without creating or truncating its backing file.
    pub fn attach(&self, name: &str, descriptor: AttrDescriptor, capacity: usize) -> Result<Arc<RingBuffer>, AttributeError> {
        let mut entries = self.entries.lock().expect("attribute registry mutex poisoned");
        if let Some(existing) = entries.get(name) {
            return Ok(existing.ring.clone());
        }
        let dir = self.dir.as_ref().ok_or_else(|| AttributeError::UnknownAttribute(name.to_string()))?;
        let path = dir.join(format!("{name}.attr"));
        let record_len = descriptor.record_len();
        let ring = Arc::new(RingBuffer::open_file(&path, capacity, record_len)?);
        entries.insert(name.to_string(), RegistryEntry { descriptor, capacity, ring: ring.clone() });
        Ok(ring)
    }

    pub fn declare_array(&self, name: &str, shape: Vec<usize>, dtype: Dtype, capacity: usize) -> Result<ArrayHandle, AttributeError> {
        let descriptor = AttrDescriptor::Array { shape: shape.clone(), dtype };
        let ring = self.get_or_create(name, descriptor, capacity)?;
        Ok(ArrayHandle { name: name.to_string(), shape, dtype, ring })
    }

    pub fn declare_object(&self, name: &str, capacity: usize) -> Result<ObjectHandle, AttributeError> {
        let ring = self.get_or_create(name, AttrDescriptor::Object, capacity)?;
        Ok(ObjectHandle { name: name.to_string(), ring })
    }

    /// A consumer-side counterpart to `declare_array`: attaches to an array
    /// another process already declared instead of creating it.
    pub fn attach_array(&self, name: &str, shape: Vec<usize>, dtype: Dtype, capacity: usize) -> Result<ArrayHandle, AttributeError> {
        let descriptor = AttrDescriptor::Array { shape: shape.clone(), dtype };
        let ring = self.attach(name, descriptor, capacity)?;
        Ok(ArrayHandle { name: name.to_string(), shape, dtype, ring })
    }

    /// A consumer-side counterpart to `declare_object`.
    pub fn attach_object(&self, name: &str, capacity: usize) -> Result<ObjectHandle, AttributeError> {
        let ring = self.attach(name, AttrDescriptor::Object, capacity)?;
        Ok(ObjectHandle { name: name.to_string(), ring })
    }

    pub fn descriptor_of(&self, name: &str) -> Option<AttrDescriptor> {
        self.entries.lock().expect("attribute registry mutex poisoned").get(name).map(|e| e.descriptor.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn array_round_trip_in_memory() {
        let registry = AttributeRegistry::in_process();
        let handle = registry.declare_array("frame", vec![2, 2], Dtype::U8, 3).unwrap();

        handle.write_at(&[1, 2, 3, 4], 0).unwrap();
        handle.write_at(&[5, 6, 7, 8], 10).unwrap();

        let (idx, ts, value) = handle.latest().unwrap().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(ts, 10);
        assert_eq!(value, vec![5, 6, 7, 8]);
    }

    #[test]
    fn declaring_same_name_with_same_descriptor_is_a_no_op() {
        let registry = AttributeRegistry::in_process();
        registry.declare_array("frame", vec![2], Dtype::F32, 4).unwrap();
        let second = registry.declare_array("frame", vec![2], Dtype::F32, 4);
        assert!(second.is_ok());
    }

    #[test]
    fn declaring_same_name_with_different_descriptor_fails() {
        let registry = AttributeRegistry::in_process();
        registry.declare_array("frame", vec![2], Dtype::F32, 4).unwrap();
        let second = registry.declare_array("frame", vec![3], Dtype::F32, 4);
        assert!(matches!(second, Err(AttributeError::DescriptorMismatch { .. })));
    }

    #[test]
    fn write_rejects_wrong_length() {
        let registry = AttributeRegistry::in_process();
        let handle = registry.declare_array("scalar", vec![1], Dtype::F64, 4).unwrap();
        let err = handle.write(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, AttributeError::ShapeMismatch { .. }));
    }

    #[test]
    fn read_reports_loss_once_producer_laps_the_ring() {
        let registry = AttributeRegistry::in_process();
        let handle = registry.declare_array("counter", vec![1], Dtype::U8, 3).unwrap();
        for i in 0..5u8 {
            handle.write_at(&[i], i as u64).unwrap();
        }
        // Capacity 3, 5 writes: indices 0,1 were overwritten; only 2,3,4 remain.
        let result = handle.read(Some(0), 0).unwrap();
        assert!(result.lost);
        assert_eq!(result.indices, vec![2, 3, 4]);
    }

    #[test]
    fn read_without_from_idx_returns_latest_count() {
        let registry = AttributeRegistry::in_process();
        let handle = registry.declare_array("counter", vec![1], Dtype::U8, 5).unwrap();
        for i in 0..4u8 {
            handle.write_at(&[i], i as u64).unwrap();
        }
        let result = handle.read(None, 2).unwrap();
        assert_eq!(result.indices, vec![2, 3]);
        assert!(!result.lost);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
        code: i32,
    }

    #[test]
    fn object_round_trip_in_memory() {
        let registry = AttributeRegistry::in_process();
        let handle = registry.declare_object("last_error", 4).unwrap();
        handle.write(&Note { text: "boom".into(), code: 7 }).unwrap();

        let (idx, _ts, note) = handle.latest::<Note>().unwrap().unwrap();
        assert_eq!(idx, 0);
        assert_eq!(note, Note { text: "boom".into(), code: 7 });
    }

    #[test]
    fn object_write_rejects_oversized_payload() {
        let registry = AttributeRegistry::in_process();
        let handle = registry.declare_object("blob", 2).unwrap();
        let huge = "x".repeat(OBJECT_INLINE_MAX + 1);
        let err = handle.write(&huge).unwrap_err();
        assert!(matches!(err, AttributeError::ObjectTooLarge { .. }));
    }

    #[test]
    fn file_backed_registry_shares_writes_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let writer_registry = AttributeRegistry::shared(dir.path());
        let writer = writer_registry.declare_array("shared", vec![1], Dtype::I32, 4).unwrap();
        writer.write_at(&11i32.to_le_bytes(), 42).unwrap();

        let reader_registry = AttributeRegistry::shared(dir.path());
        let reader = reader_registry
            .attach("shared", AttrDescriptor::Array { shape: vec![1], dtype: Dtype::I32 }, 4)
            .unwrap();
        let (ts, _seq, data) = reader.read_slot(0);
        assert_eq!(ts, 42);
        assert_eq!(i32::from_le_bytes(data.try_into().unwrap()), 11);
    }

    #[test]
    fn attached_handle_sees_writes_published_after_it_attached() {
        let dir = tempfile::tempdir().unwrap();
        let writer_registry = AttributeRegistry::shared(dir.path());
        let writer = writer_registry.declare_array("heartbeat.w", vec![1], Dtype::U64, 8).unwrap();

        // A fresh registry instance models a separate OS process: it has its
        // own RingBuffer with its own `w` atomic, seeded from the header at
        // attach time.
        let reader_registry = AttributeRegistry::shared(dir.path());
        let reader = reader_registry.attach_array("heartbeat.w", vec![1], Dtype::U64, 8).unwrap();
        assert!(reader.latest().unwrap().is_none());

        writer.write_at(&1u64.to_le_bytes(), 1).unwrap();
        let (idx, _, value) = reader.latest().unwrap().unwrap();
        assert_eq!(idx, 0);
        assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), 1);

        writer.write_at(&2u64.to_le_bytes(), 2).unwrap();
        let (idx, _, value) = reader.latest().unwrap().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), 2);
    }
}
