//! The control-message plane: per-worker duplex channels, the supervisor's
//! fan-in queue, wire framing, and RPC dispatch (spec.md §4.3).
//!
//! Ordering guarantee: messages from a single sender to a single receiver
//! are delivered FIFO. This falls out of using one `crossbeam_channel` (or
//! one OS pipe) per sender/receiver pair rather than a single shared queue
//! with reordering; nothing here reorders a pair's messages relative to
//! each other.

use std::io::{self, Read, Write};
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use loopctl_state::WorkerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Signals carried by a [`ControlMessage`] (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Signal {
    Shutdown,
    ConfirmShutdown,
    /// Fire-and-forget remote call. `payload` is an opaque bincode-encoded
    /// argument blob the receiver's callback table knows how to decode.
    Rpc { key: String, payload: Vec<u8> },
    /// Broadcast of a mutable config value (spec.md §9 "Property propagation").
    UpdateProperty { name: String, value: Vec<u8> },
}

/// A tagged control-plane record: `{sender, receiver, signal}` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub sender: WorkerId,
    pub receiver: WorkerId,
    pub signal: Signal,
}

impl ControlMessage {
    pub fn new(sender: WorkerId, receiver: WorkerId, signal: Signal) -> Self {
        Self { sender, receiver, signal }
    }

    pub fn rpc(sender: WorkerId, receiver: WorkerId, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(sender, receiver, Signal::Rpc { key: key.into(), payload })
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("io error framing control message: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode control message: {0}")]
    Encode(#[from] bincode::Error),
    #[error("channel for peer was closed")]
    ChannelClosed,
}

/// Write one length-prefixed, bincode-encoded [`ControlMessage`] frame.
///
/// Frame layout: `u32` little-endian byte length, followed by the encoded
/// message. This is the wire format used over the stdin/stdout pipes that
/// back each worker's duplex channel (SPEC_FULL.md §4.3).
pub fn write_frame<W: Write>(mut w: W, msg: &ControlMessage) -> Result<(), ProtoError> {
    let bytes = bincode::serialize(msg)?;
    let len = bytes.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

/// Read one length-prefixed frame, blocking until a full frame (or EOF) is
/// available. Returns `Ok(None)` on clean EOF (peer closed its write end).
pub fn read_frame<R: Read>(mut r: R) -> Result<Option<ControlMessage>, ProtoError> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let msg = bincode::deserialize(&buf)?;
    Ok(Some(msg))
}

/// Spawn a background thread that blocks reading frames from `reader` and
/// forwards each decoded [`ControlMessage`] onto `tx`. Terminates when the
/// peer closes its write end (clean EOF) or `tx`'s receiver is dropped.
///
/// This is what keeps a worker's tick loop non-blocking (spec.md §5): the
/// tick loop only ever does a non-blocking `try_recv` on `tx`'s receiver,
/// never a blocking pipe read.
pub fn spawn_reader<R>(mut reader: R, tx: Sender<ControlMessage>, peer: &'static str) -> std::thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || loop {
        match read_frame(&mut reader) {
            Ok(Some(msg)) => {
                if tx.send(msg).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(target: "proto", peer, error = %e, "inbox reader exiting on error");
                break;
            }
        }
    })
}

/// One worker's endpoint of its duplex control channel: a blocking writer
/// to the peer, and the receiving half of the channel fed by [`spawn_reader`].
pub struct DuplexChannel<W: Write + Send + 'static> {
    writer: Mutex<W>,
    inbox_rx: Receiver<ControlMessage>,
    _reader_handle: std::thread::JoinHandle<()>,
}

impl<W: Write + Send + 'static> DuplexChannel<W> {
    pub fn new<R: Read + Send + 'static>(writer: W, reader: R, peer: &'static str) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = spawn_reader(reader, tx, peer);
        Self {
            writer: Mutex::new(writer),
            inbox_rx: rx,
            _reader_handle: handle,
        }
    }

    pub fn send(&self, msg: &ControlMessage) -> Result<(), ProtoError> {
        let mut w = self.writer.lock().expect("duplex writer mutex poisoned");
        write_frame(&mut *w, msg)
    }

    /// Non-blocking inbox drain: returns every message currently queued.
    pub fn drain(&self) -> Vec<ControlMessage> {
        self.inbox_rx.try_iter().collect()
    }

    /// Non-blocking single-message poll.
    pub fn try_recv(&self) -> Option<ControlMessage> {
        self.inbox_rx.try_recv().ok()
    }
}

/// Multi-producer, single-consumer fan-in queue used by the supervisor to
/// receive worker→supervisor and worker→worker (for forwarding) messages
/// (spec.md §4.3's "central fan-in queue").
#[derive(Clone)]
pub struct FanIn {
    tx: Sender<ControlMessage>,
}

pub struct FanInHandle {
    pub rx: Receiver<ControlMessage>,
}

impl FanIn {
    pub fn new() -> (Self, FanInHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, FanInHandle { rx })
    }

    pub fn push(&self, msg: ControlMessage) -> Result<(), ProtoError> {
        self.tx.send(msg).map_err(|_| ProtoError::ChannelClosed)
    }
}

/// RPC dispatch table keyed by stable callback name (spec.md §4.3, §9).
///
/// Registered at worker startup; an RPC whose key isn't registered is
/// logged and dropped rather than surfaced to the (fire-and-forget) caller.
pub struct CallbackTable {
    callbacks: std::collections::HashMap<String, Box<dyn FnMut(&[u8]) + Send>>,
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackTable {
    pub fn new() -> Self {
        Self { callbacks: std::collections::HashMap::new() }
    }

    /// Register a callback under a stable qualified name, e.g. `"Display.on_gate"`.
    /// Registering the same key twice replaces the previous callback and logs
    /// a warning (mirrors the Python source's single-registration intent).
    pub fn register(&mut self, key: impl Into<String>, callback: impl FnMut(&[u8]) + Send + 'static) {
        let key = key.into();
        if self.callbacks.contains_key(&key) {
            warn!(target: "proto.rpc", key = %key, "replacing already-registered callback");
        }
        self.callbacks.insert(key, Box::new(callback));
    }

    /// Resolve `key` and invoke it with `payload`. Unknown keys are logged
    /// and dropped (spec.md §4.3, §7).
    pub fn dispatch(&mut self, key: &str, payload: &[u8]) {
        match self.callbacks.get_mut(key) {
            Some(cb) => cb(payload),
            None => warn!(target: "proto.rpc", key, "unknown RPC callback, dropping"),
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.callbacks.contains_key(key)
    }
}
