//! Edge-detect triggers layered on the attribute store (spec.md §4.5).
//!
//! A [`Trigger`] owns its own `last_read_idx` and polls an [`ArrayHandle`]
//! for everything published since the previous poll, evaluates a
//! [`ConditionKind`] over the returned slice, and for every index where the
//! condition holds, calls every registered callback with
//! `(index, timestamp, value)`. Triggers never block the producer: they
//! only ever call `read`, never `write`, on the attribute they watch.

use loopctl_attribute::{ArrayHandle, AttributeError, Dtype};
use loopctl_state::WorkerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger attribute error: {0}")]
    Attribute(#[from] AttributeError),
    #[error("trigger attribute \"{0}\" is not a scalar numeric attribute")]
    NotScalar(String),
}

/// Condition kinds over an attribute's value sequence (spec.md §4.5, ported
/// from `vxpy/core/event.py`'s `OnTrigger`/`RisingEdgeTrigger`/`FallingEdgeTrigger`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    LevelHigh,
    RisingEdge,
    FallingEdge,
}

impl ConditionKind {
    /// Evaluate the condition over a value sequence, oldest first.
    ///
    /// Fewer than two samples is a no-op (spec.md §4.5), matching
    /// `data.shape[0] < 2` in the original. Edge masks are a forward
    /// difference padded with `false` at the *front*: `mask[i]` reports
    /// whether `values[i]` is itself the post-transition sample, so a
    /// firing's reported index/timestamp/value is the sample the edge
    /// landed on (spec.md §8 scenario 3: writes `0,0,1,1,0,1` fire at
    /// indices 2 and 5 — the two samples that are `1` right after a `0`).
    fn mask(self, values: &[f64]) -> Vec<bool> {
        if values.len() < 2 {
            return vec![false; values.len()];
        }
        let mut mask = vec![false];
        match self {
            ConditionKind::LevelHigh => return values.iter().map(|&v| v != 0.0).collect(),
            ConditionKind::RisingEdge => mask.extend(values.windows(2).map(|w| w[1] - w[0] > 0.0)),
            ConditionKind::FallingEdge => mask.extend(values.windows(2).map(|w| w[1] - w[0] < 0.0)),
        }
        mask
    }
}

/// A single callback target: an RPC key dispatched to `target` (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct CallbackTarget {
    pub target: WorkerId,
    pub callback_key: String,
}

/// One firing event: the callback target plus the sample that satisfied the
/// condition. The caller (a worker's tick) turns these into
/// `ControlMessage::Rpc` sends; this crate has no dependency on the message
/// plane's transport so it stays testable in isolation.
#[derive(Debug, Clone)]
pub struct TriggerFiring {
    pub target: WorkerId,
    pub callback_key: String,
    pub index: u64,
    pub timestamp: u64,
    pub value: f64,
}

/// An edge/level detector installed on one attribute (spec.md §3, §4.5).
pub struct Trigger {
    attribute_name: String,
    kind: ConditionKind,
    callbacks: Vec<CallbackTarget>,
    last_read_idx: Option<u64>,
    active: bool,
}

impl Trigger {
    pub fn new(attribute_name: impl Into<String>, kind: ConditionKind) -> Self {
        Self {
            attribute_name: attribute_name.into(),
            kind,
            callbacks: Vec::new(),
            last_read_idx: None,
            active: true,
        }
    }

    pub fn add_callback(&mut self, target: WorkerId, callback_key: impl Into<String>) {
        self.callbacks.push(CallbackTarget { target, callback_key: callback_key.into() });
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn attribute_name(&self) -> &str {
        &self.attribute_name
    }

    /// `last_read_idx` only advances after a successful evaluation over
    /// every observed entry (spec.md §3's trigger invariant).
    pub fn last_read_idx(&self) -> Option<u64> {
        self.last_read_idx
    }

    /// Poll `handle` for everything published since the last call and fire
    /// callbacks for every index where the condition holds.
    ///
    /// A trigger that has just gone inactive still flushes whatever it read
    /// this call (spec.md §4.5 "pending emissions still flush"); it simply
    /// won't be polled again by the owning worker's tick once `is_active()`
    /// is false, since the worker skips inactive triggers entirely.
    pub fn poll(&mut self, handle: &ArrayHandle) -> Result<Vec<TriggerFiring>, TriggerError> {
        if !scalar_dtype(handle.dtype()) {
            return Err(TriggerError::NotScalar(self.attribute_name.clone()));
        }

        // A trigger that has never polled starts from the beginning of the
        // available window rather than only future writes, so it sees
        // whatever was already published before it was installed.
        let from_idx = self.last_read_idx.unwrap_or(0);
        let result = handle.read(Some(from_idx), 0)?;
        if result.lost {
            tracing::warn!(
                target: "trigger",
                attribute = %self.attribute_name,
                "trigger lagged behind producer, resyncing to oldest available window"
            );
        }
        if result.indices.len() < 2 {
            // spec.md §4.5: "If the sequence has fewer than 2 entries, the
            // trigger is a no-op." `last_read_idx` does not advance, so the
            // next poll re-reads this same short window.
            return Ok(Vec::new());
        }

        let values: Vec<f64> = result.values.iter().map(|bytes| decode_scalar(handle.dtype(), bytes)).collect();
        let mask = self.kind.mask(&values);

        let mut firings = Vec::new();
        for (i, &fired) in mask.iter().enumerate() {
            if !fired {
                continue;
            }
            for cb in &self.callbacks {
                firings.push(TriggerFiring {
                    target: cb.target,
                    callback_key: cb.callback_key.clone(),
                    index: result.indices[i],
                    timestamp: result.timestamps[i],
                    value: values[i],
                });
            }
        }

        self.last_read_idx = result.indices.last().map(|&i| i + 1);
        Ok(firings)
    }
}

fn scalar_dtype(dtype: Dtype) -> bool {
    // Trigger conditions operate on a single numeric channel per sample;
    // array attributes with a non-unit element count aren't addressed here.
    matches!(
        dtype,
        Dtype::I8
            | Dtype::I16
            | Dtype::I32
            | Dtype::I64
            | Dtype::U8
            | Dtype::U16
            | Dtype::U32
            | Dtype::U64
            | Dtype::F32
            | Dtype::F64
            | Dtype::Bool
    )
}

fn decode_scalar(dtype: Dtype, bytes: &[u8]) -> f64 {
    match dtype {
        Dtype::I8 => bytes[0] as i8 as f64,
        Dtype::U8 => bytes[0] as f64,
        Dtype::Bool => {
            if bytes[0] != 0 {
                1.0
            } else {
                0.0
            }
        }
        Dtype::I16 => i16::from_le_bytes(bytes.try_into().unwrap()) as f64,
        Dtype::U16 => u16::from_le_bytes(bytes.try_into().unwrap()) as f64,
        Dtype::I32 => i32::from_le_bytes(bytes.try_into().unwrap()) as f64,
        Dtype::U32 => u32::from_le_bytes(bytes.try_into().unwrap()) as f64,
        Dtype::I64 => i64::from_le_bytes(bytes.try_into().unwrap()) as f64,
        Dtype::U64 => u64::from_le_bytes(bytes.try_into().unwrap()) as f64,
        Dtype::F32 => f32::from_le_bytes(bytes.try_into().unwrap()) as f64,
        Dtype::F64 => f64::from_le_bytes(bytes.try_into().unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopctl_attribute::AttributeRegistry;

    fn bool_attr(registry: &AttributeRegistry, name: &str, capacity: usize) -> ArrayHandle {
        registry.declare_array(name, vec![1], Dtype::Bool, capacity).unwrap()
    }

    #[test]
    fn fewer_than_two_entries_is_a_no_op() {
        let registry = AttributeRegistry::in_process();
        let handle = bool_attr(&registry, "gate", 10);
        handle.write_at(&[1], 0).unwrap();

        let mut trigger = Trigger::new("gate", ConditionKind::RisingEdge);
        trigger.add_callback(WorkerId::Worker, "Worker.on_gate");
        let firings = trigger.poll(&handle).unwrap();
        assert!(firings.is_empty());
        assert_eq!(trigger.last_read_idx(), None);
    }

    #[test]
    fn rising_edge_fires_on_each_0_to_1_transition() {
        // Scenario 3: writes 0,0,1,1,0,1 -> rising edges at indices 2 and 5.
        let registry = AttributeRegistry::in_process();
        let handle = bool_attr(&registry, "gate", 100);
        for v in [0u8, 0, 1, 1, 0, 1] {
            handle.write_at(&[v], 0).unwrap();
        }

        let mut trigger = Trigger::new("gate", ConditionKind::RisingEdge);
        trigger.add_callback(WorkerId::Worker, "Worker.on_gate");
        let firings = trigger.poll(&handle).unwrap();

        let indices: Vec<u64> = firings.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![2, 5]);
        assert_eq!(trigger.last_read_idx(), Some(6));
    }

    #[test]
    fn falling_edge_fires_on_each_1_to_0_transition() {
        let registry = AttributeRegistry::in_process();
        let handle = bool_attr(&registry, "gate", 100);
        for v in [1u8, 1, 0, 0, 1, 0] {
            handle.write_at(&[v], 0).unwrap();
        }

        let mut trigger = Trigger::new("gate", ConditionKind::FallingEdge);
        trigger.add_callback(WorkerId::Worker, "Worker.on_gate");
        let firings = trigger.poll(&handle).unwrap();
        let indices: Vec<u64> = firings.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![2, 5]);
    }

    #[test]
    fn level_high_fires_on_every_nonzero_sample() {
        let registry = AttributeRegistry::in_process();
        let handle = bool_attr(&registry, "gate", 100);
        for v in [0u8, 1, 1, 0] {
            handle.write_at(&[v], 0).unwrap();
        }
        let mut trigger = Trigger::new("gate", ConditionKind::LevelHigh);
        trigger.add_callback(WorkerId::Worker, "Worker.on_gate");
        let firings = trigger.poll(&handle).unwrap();
        let indices: Vec<u64> = firings.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn idempotent_reevaluation_over_same_range_is_not_possible_after_advance() {
        // Trigger idempotence (spec.md §8): re-polling after `last_read_idx`
        // has advanced past a range never re-fires it.
        let registry = AttributeRegistry::in_process();
        let handle = bool_attr(&registry, "gate", 100);
        for v in [0u8, 1] {
            handle.write_at(&[v], 0).unwrap();
        }
        let mut trigger = Trigger::new("gate", ConditionKind::RisingEdge);
        trigger.add_callback(WorkerId::Worker, "Worker.on_gate");
        let first = trigger.poll(&handle).unwrap();
        assert_eq!(first.len(), 1);

        // No new data published; a second poll reads an empty window.
        let second = trigger.poll(&handle).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn fires_once_per_registered_callback() {
        let registry = AttributeRegistry::in_process();
        let handle = bool_attr(&registry, "gate", 100);
        for v in [0u8, 1] {
            handle.write_at(&[v], 0).unwrap();
        }
        let mut trigger = Trigger::new("gate", ConditionKind::RisingEdge);
        trigger.add_callback(WorkerId::Camera, "Camera.on_gate");
        trigger.add_callback(WorkerId::Display, "Display.on_gate");
        let firings = trigger.poll(&handle).unwrap();
        assert_eq!(firings.len(), 2);
    }

    #[test]
    fn inactive_trigger_flag_is_observable_by_owning_worker() {
        let mut trigger = Trigger::new("gate", ConditionKind::LevelHigh);
        assert!(trigger.is_active());
        trigger.set_active(false);
        assert!(!trigger.is_active());
    }
}
