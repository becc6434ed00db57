//! Collaborator interfaces (spec.md §6): the trait seams through which a
//! camera backend, a visual stimulus, or an I/O device plugs into the
//! runtime without the core crates knowing anything about specific
//! hardware. Modeled on the teacher's `PluginHost` trait scaffold
//! (`core-plugin`) and on the fine-grained capability-trait style used by
//! the daq examples pack — small, focused traits rather than one
//! monolithic `Device` trait.
//!
//! Nothing in `loopctl-supervisor` or `loopctl-worker` depends on this
//! crate directly: a `Worker` implementation built against a concrete
//! camera/display/io backend uses these traits to structure its own
//! internals, and only the mock implementations here are exercised by
//! tests.

use std::collections::BTreeMap;
use std::time::Duration;

use loopctl_attribute::Dtype;

/// Pixel/sample layout of a [`FrameSource`]'s output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub dtype: Dtype,
}

/// A single captured frame. `data` is row-major, channel-interleaved, and
/// its length must equal `format.width * format.height * format.channels *
/// format.dtype.byte_size()`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub format: FrameFormat,
    pub timestamp: Duration,
    pub data: Vec<u8>,
}

/// A camera (or camera-like) backend: advertises its fixed output format
/// and yields frames on demand. Mirrors `vxpy`'s camera device interface.
pub trait FrameSource: Send {
    fn format(&self) -> FrameFormat;
    fn next_frame(&mut self) -> anyhow::Result<Frame>;
}

/// Named, dynamically-typed parameters a [`VisualObject`] is updated with
/// each protocol phase, e.g. spatial frequency or contrast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterMap {
    values: BTreeMap<String, f64>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// A declarative trigger attached to a [`VisualObject`] — same shape as
/// `loopctl_trigger::ConditionKind` plus the attribute it watches, kept
/// here as a plain descriptor so collaborators can declare triggers
/// without depending on `loopctl-trigger` themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    pub attribute_name: String,
    pub description: String,
}

/// A visual stimulus driven through its lifecycle by the display worker's
/// protocol responder: `initialize` once per phase start, `update` whenever
/// parameters change, `draw` once per display tick, `end` once per phase
/// end.
pub trait VisualObject: Send {
    fn initialize(&mut self) -> anyhow::Result<()>;
    fn update(&mut self, params: &ParameterMap) -> anyhow::Result<()>;
    fn draw(&mut self, dt: Duration) -> anyhow::Result<()>;
    fn end(&mut self) -> anyhow::Result<()>;
    fn parameters(&self) -> &ParameterMap;
    fn triggers(&self) -> &[TriggerSpec] {
        &[]
    }
}

/// Identifies a single addressable pin on an [`IoDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PinId(pub u16);

/// A single analog or digital sample read from or written to a pin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Digital(bool),
    Analog(f64),
}

/// Requested pin roles, handed to [`IoDevice::configure_pins`] once at
/// worker startup.
#[derive(Debug, Clone, Default)]
pub struct PinConfig {
    pub inputs: Vec<PinId>,
    pub outputs: Vec<PinId>,
}

/// A digital/analog I/O backend (DAQ board, Arduino, etc). `read_all` is
/// called once per io-worker tick; only the pins configured as inputs are
/// expected to appear in the result.
pub trait IoDevice: Send {
    fn configure_pins(&mut self, cfg: &PinConfig) -> anyhow::Result<()>;
    fn read_all(&mut self) -> anyhow::Result<BTreeMap<PinId, Sample>>;
    fn write(&mut self, pin: PinId, value: Sample) -> anyhow::Result<()>;
}
