use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;

use super::label::Slot;
use crate::tensor::TensorValue;

/// Identity of a call site inside one linear program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallSiteId(pub usize);

/// Position of a frame in the arena, returned by `push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FrameIndex(pub usize);

#[derive(Debug, Clone)]
struct Frame {
    site: CallSiteId,
    slot: Slot,
    value: Arc<TensorValue>,
    tag: u64,
}

/// A frame removed by `pop`.
#[derive(Debug, Clone)]
pub struct Popped {
    pub index: FrameIndex,
    pub value: Arc<TensorValue>,
    pub tag: u64,
}

/// Bounded LIFO store of values saved around recursive call sites.
///
/// Every push is tagged with a monotonically increasing number; a pop must
/// name the same call site and slot as the frame on top.
#[derive(Debug)]
pub struct CallFrameArena {
    frames: Vec<Frame>,
    capacity: usize,
    next_tag: u64,
}

impl CallFrameArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity.min(1024)),
            capacity,
            next_tag: 0,
        }
    }

    pub fn push(&mut self, site: CallSiteId, slot: Slot, value: Arc<TensorValue>) -> Result<(FrameIndex, u64)> {
        if self.frames.len() >= self.capacity {
            return Err(anyhow!(
                "call frame arena exhausted ({} frames) at site {} slot {}",
                self.capacity,
                site.0,
                slot
            ));
        }
        let tag = self.next_tag;
        self.next_tag += 1;
        let index = FrameIndex(self.frames.len());
        self.frames.push(Frame {
            site,
            slot,
            value,
            tag,
        });
        Ok((index, tag))
    }

    pub fn pop(&mut self, site: CallSiteId, slot: Slot) -> Result<Popped> {
        let top = self
            .frames
            .last()
            .ok_or_else(|| anyhow!("stack pop at site {} slot {} on empty arena", site.0, slot))?;
        if top.site != site || top.slot != slot {
            return Err(anyhow!(
                "stack imbalance: pop at site {} slot {} but top frame was pushed by site {} slot {}",
                site.0,
                slot,
                top.site.0,
                top.slot
            ));
        }
        let index = FrameIndex(self.frames.len() - 1);
        let frame = self.frames.pop().ok_or_else(|| anyhow!("arena emptied during pop"))?;
        Ok(Popped {
            index,
            value: frame.value,
            tag: frame.tag,
        })
    }

    pub fn tag(&self, index: FrameIndex) -> Option<u64> {
        self.frames.get(index.0).map(|frame| frame.tag)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StackEventKind {
    Push,
    Pop,
}

/// One push or pop observed while interpreting a linear program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackEvent {
    pub kind: StackEventKind,
    pub site: CallSiteId,
    pub slot: Slot,
    pub tag: u64,
    /// Arena depth after the event.
    pub depth: usize,
}
