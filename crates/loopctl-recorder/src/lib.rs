//! The recorder (spec.md §4.7): one HDF5 file per producing worker, one
//! group per attribute, a resizable chunked dataset per attribute plus a
//! parallel `<name>_time` dataset, and `phase_<k>` markers recording when
//! each protocol phase began.
//!
//! Grounded on `Routine.py`'s `AbstractRoutine._appendData`/`streamToFile`
//! (`original_source/Routine.py`): a dataset is created lazily on first
//! write with `chunks=(1, *dshape)` and `maxshape=(None, *dshape)`, then
//! resized and appended to on every subsequent value; a matching
//! `{key}_time` dataset tracks per-sample wall-clock time. The `hdf5` crate
//! is the direct Rust analogue of `h5py` here, grounded on
//! `easternanemone-rust-daq`'s optional `storage_hdf5` feature — the only
//! place in the retrieval pack that depends on `hdf5` for the same
//! "append scientific time series to disk" need.
//!
//! Only array attributes are recorded; object attributes are control-plane
//! state blobs, not sampled time series, and are out of scope for the
//! on-disk layout (same split the original draws between `RingBuffer`
//! sample data and `IPC` control objects).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use loopctl_attribute::{AttributeError, Dtype};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to create recording output folder {path}: {source}")]
    FolderCreate { path: PathBuf, #[source] source: std::io::Error },
    #[error("hdf5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
    #[error("attribute error: {0}")]
    Attribute(#[from] AttributeError),
}

/// Requested compression for a worker's recording file, mirroring the
/// tradeoff called out in the original's `streamToFile` comment ("GZIP:
/// common, but slow. LZF: fast, but only natively implemented in h5py").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompressionMode {
    None,
    Gzip { level: u8, shuffle: bool },
    Lzf { shuffle: bool },
}

/// The mode actually used once `Lzf` has been resolved against the
/// filters this build links: the `hdf5` crate has no bundled LZF filter
/// plugin, so an `Lzf` request degrades to `None` with a logged warning
/// instead of writing a file HDF Viewer and most other readers can't open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedCompression {
    pub mode: CompressionMode,
    pub downgraded_from_lzf: bool,
}

impl CompressionMode {
    pub fn resolve(self) -> ResolvedCompression {
        match self {
            CompressionMode::Lzf { .. } => {
                tracing::warn!(
                    "lzf compression requested but no LZF filter plugin is available; falling back to uncompressed storage"
                );
                ResolvedCompression { mode: CompressionMode::None, downgraded_from_lzf: true }
            }
            other => ResolvedCompression { mode: other, downgraded_from_lzf: false },
        }
    }
}

fn decode_as_f64(bytes: &[u8], dtype: Dtype) -> Vec<f64> {
    let elem_size = dtype.byte_size();
    bytes
        .chunks_exact(elem_size)
        .map(|chunk| match dtype {
            Dtype::I8 => chunk[0] as i8 as f64,
            Dtype::I16 => i16::from_le_bytes(chunk.try_into().unwrap()) as f64,
            Dtype::I32 => i32::from_le_bytes(chunk.try_into().unwrap()) as f64,
            Dtype::I64 => i64::from_le_bytes(chunk.try_into().unwrap()) as f64,
            Dtype::U8 => chunk[0] as f64,
            Dtype::U16 => u16::from_le_bytes(chunk.try_into().unwrap()) as f64,
            Dtype::U32 => u32::from_le_bytes(chunk.try_into().unwrap()) as f64,
            Dtype::U64 => u64::from_le_bytes(chunk.try_into().unwrap()) as f64,
            Dtype::F32 => f32::from_le_bytes(chunk.try_into().unwrap()) as f64,
            Dtype::F64 => f64::from_le_bytes(chunk.try_into().unwrap()),
            Dtype::Bool => if chunk[0] != 0 { 1.0 } else { 0.0 },
        })
        .collect()
}

/// Accumulates every value written to one array attribute for one
/// recording session and flushes them into its HDF5 group. The in-memory
/// buffers grow for the lifetime of the recording (mirroring the
/// original's whole-session `h5py` file staying open); this trades memory
/// for the simplicity of resize-then-overwrite instead of hyperslab
/// appends.
struct AttributeRecorder {
    key: String,
    ncols: usize,
    values: Vec<f64>,
    times: Vec<f64>,
    rows_written: usize,
}

impl AttributeRecorder {
    fn new(key: String, ncols: usize) -> Self {
        Self { key, ncols, values: Vec::new(), times: Vec::new(), rows_written: 0 }
    }

    fn push(&mut self, timestamp_nanos: u64, row: &[f64]) {
        debug_assert_eq!(row.len(), self.ncols);
        self.values.extend_from_slice(row);
        self.times.push(timestamp_nanos as f64 / 1e9);
        self.rows_written += 1;
    }

    fn flush(&self, group: &hdf5::Group, compression: ResolvedCompression) -> Result<(), RecorderError> {
        if self.rows_written == 0 {
            return Ok(());
        }
        write_growing_dataset(group, &self.key, &self.values, self.ncols, self.rows_written, compression)?;
        write_growing_dataset(group, &format!("{}_time", self.key), &self.times, 1, self.rows_written, compression)?;
        Ok(())
    }
}

fn write_growing_dataset(
    group: &hdf5::Group,
    name: &str,
    flat_values: &[f64],
    ncols: usize,
    nrows: usize,
    compression: ResolvedCompression,
) -> Result<(), RecorderError> {
    let dataset = if group.link_exists(name) {
        group.dataset(name)?
    } else {
        tracing::info!(dataset = name, "creating recorder dataset");
        let mut builder = group.new_dataset::<f64>().shape((0.., ncols)).chunk((1, ncols));
        if let CompressionMode::Gzip { level, shuffle } = compression.mode {
            builder = builder.deflate(level as u8);
            if shuffle {
                builder = builder.shuffle();
            }
        }
        builder.create(name)?
    };
    dataset.resize((nrows, ncols))?;
    dataset.write_raw(flat_values)?;
    Ok(())
}

/// A single producing worker's recording: one HDF5 file, one group per
/// attribute, opened lazily on the first successful write (spec.md §4.7's
/// `handleFile` semantics: recording active + no file open yet -> create).
pub struct RecordingSession {
    worker_name: String,
    output_folder: PathBuf,
    compression: ResolvedCompression,
    file: Option<hdf5::File>,
    recorders: HashMap<String, AttributeRecorder>,
    disabled: bool,
}

impl RecordingSession {
    pub fn new(worker_name: impl Into<String>, output_folder: PathBuf, compression: CompressionMode) -> Self {
        Self {
            worker_name: worker_name.into(),
            output_folder,
            compression: compression.resolve(),
            file: None,
            recorders: HashMap::new(),
            disabled: false,
        }
    }

    /// True once a folder-creation failure has permanently disabled this
    /// session — the protocol keeps running, only recording stops (spec.md
    /// §4.7: a disabled recorder must never abort an in-progress protocol).
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn ensure_open(&mut self) -> Result<&hdf5::File, RecorderError> {
        if self.file.is_none() {
            if let Err(source) = std::fs::create_dir_all(&self.output_folder) {
                tracing::warn!(
                    path = %self.output_folder.display(),
                    error = %source,
                    "failed to create recording output folder; recording disabled for this worker"
                );
                self.disabled = true;
                return Err(RecorderError::FolderCreate { path: self.output_folder.clone(), source });
            }
            let path = self.output_folder.join(format!("{}.hdf5", self.worker_name));
            let file = hdf5::File::create(&path)?;
            file.create_group(&self.worker_name)?;
            self.file = Some(file);
        }
        Ok(self.file.as_ref().unwrap())
    }

    /// Records one value for `attribute` at `timestamp_nanos`. Failures are
    /// logged and swallowed per attribute rather than propagated: a broken
    /// dataset for one attribute must not stop every other attribute in the
    /// session from recording (spec.md §4.7).
    pub fn record(&mut self, attribute: &str, timestamp_nanos: u64, bytes: &[u8], dtype: Dtype) {
        if self.disabled {
            return;
        }
        let row = decode_as_f64(bytes, dtype);
        let ncols = row.len().max(1);
        self.recorders
            .entry(attribute.to_string())
            .or_insert_with(|| AttributeRecorder::new(attribute.to_string(), ncols))
            .push(timestamp_nanos, &row);
    }

    /// Flushes every attribute's accumulated buffer to its dataset. Called
    /// periodically by the supervisor (not on every single write, to avoid
    /// resizing HDF5 datasets one row at a time under load).
    pub fn flush(&mut self) {
        if self.disabled || self.recorders.is_empty() {
            return;
        }
        let compression = self.compression;
        let worker_name = self.worker_name.clone();
        let file = match self.ensure_open() {
            Ok(file) => file,
            Err(_) => return,
        };
        let group = match file.group(&worker_name) {
            Ok(group) => group,
            Err(err) => {
                tracing::warn!(error = %err, "failed to open recorder group");
                return;
            }
        };
        for recorder in self.recorders.values() {
            if let Err(err) = recorder.flush(&group, compression) {
                tracing::warn!(attribute = %recorder.key, error = %err, "failed to flush recorder attribute");
            }
        }
    }

    /// Marks the wall-clock start time of protocol phase `index`, stored as
    /// a scalar attribute `phase_<index>` on the worker's root group.
    pub fn mark_phase(&mut self, index: u32, timestamp_nanos: u64) -> Result<(), RecorderError> {
        if self.disabled {
            return Ok(());
        }
        let worker_name = self.worker_name.clone();
        let file = self.ensure_open()?;
        let group = file.group(&worker_name)?;
        let name = format!("phase_{index}");
        let attr = group.new_attr::<f64>().create(name.as_str())?;
        attr.write_scalar(&(timestamp_nanos as f64 / 1e9))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lzf_downgrades_to_none_with_a_flag() {
        let resolved = CompressionMode::Lzf { shuffle: true }.resolve();
        assert_eq!(resolved.mode, CompressionMode::None);
        assert!(resolved.downgraded_from_lzf);
    }

    #[test]
    fn gzip_resolves_unchanged() {
        let resolved = CompressionMode::Gzip { level: 4, shuffle: false }.resolve();
        assert_eq!(resolved.mode, CompressionMode::Gzip { level: 4, shuffle: false });
        assert!(!resolved.downgraded_from_lzf);
    }

    #[test]
    fn decode_as_f64_handles_every_dtype() {
        assert_eq!(decode_as_f64(&[42u8], Dtype::U8), vec![42.0]);
        assert_eq!(decode_as_f64(&1i32.to_le_bytes(), Dtype::I32), vec![1.0]);
        assert_eq!(decode_as_f64(&2.5f64.to_le_bytes(), Dtype::F64), vec![2.5]);
        assert_eq!(decode_as_f64(&[1u8], Dtype::Bool), vec![1.0]);
        assert_eq!(decode_as_f64(&[0u8], Dtype::Bool), vec![0.0]);
    }

    #[test]
    fn attribute_recorder_accumulates_rows_before_flush() {
        let mut recorder = AttributeRecorder::new("pos".into(), 2);
        assert_eq!(recorder.rows_written, 0);
        recorder.push(1_000_000_000, &[1.0, 2.0]);
        recorder.push(2_000_000_000, &[3.0, 4.0]);
        assert_eq!(recorder.rows_written, 2);
        assert_eq!(recorder.values, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(recorder.times, vec![1.0, 2.0]);
    }

    #[test]
    fn session_disables_itself_when_output_folder_cannot_be_created() {
        // A regular file in place of the intended directory makes
        // create_dir_all fail deterministically.
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let mut session =
            RecordingSession::new("camera", blocked.join("nested"), CompressionMode::None);
        session.record("frame_count", 0, &1u32.to_le_bytes(), Dtype::U32);
        session.flush();
        assert!(session.is_disabled());
    }

    #[test]
    fn record_is_a_no_op_once_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"x").unwrap();
        let mut session = RecordingSession::new("io", blocked.join("nested"), CompressionMode::None);

        session.record("pin0", 0, &1u8.to_le_bytes(), Dtype::U8);
        session.flush();
        assert!(session.is_disabled());

        let rows_before = session.recorders.get("pin0").unwrap().rows_written;
        session.record("pin0", 1, &2u8.to_le_bytes(), Dtype::U8);
        assert_eq!(session.recorders.get("pin0").unwrap().rows_written, rows_before);
    }
}
