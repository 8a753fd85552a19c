//! GC root descriptor table.
//!
//! Produced by GC root instrumentation and consumed by the run-time
//! collector. Every instrumented function owns one frame record; each
//! safe point names the frame slots that may hold live pointers there.

use serde::{Deserialize, Serialize};

/// Pointer layout of one root location.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotLayout {
    /// Exact byte offsets of pointer fields within `size` bytes.
    Precise { size: u32, offsets: Vec<u32> },
    /// Every word of the `size` bytes may be a pointer.
    Conservative { size: u32 },
}

impl SlotLayout {
    pub fn size(&self) -> u32 {
        match self {
            SlotLayout::Precise { size, .. } | SlotLayout::Conservative { size } => *size,
        }
    }

    pub fn is_conservative(&self) -> bool {
        matches!(self, SlotLayout::Conservative { .. })
    }
}

/// A global holding at least one pointer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRoot {
    pub name: String,
    pub layout: SlotLayout,
}

/// A root slot inside a frame record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSlot {
    /// Byte offset from the start of the frame record.
    pub offset: u32,
    pub layout: SlotLayout,
}

/// Frame record layout of one function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    /// Value stored in the frame's function-id field.
    pub id: u32,
    pub function: String,
    pub slots: Vec<FrameSlot>,
    /// Live slot indices per safe-point id.
    pub safe_points: Vec<Vec<u32>>,
}

/// Immutable whole-program root table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootTable {
    pub globals: Vec<GlobalRoot>,
    pub frames: Vec<FrameDescriptor>,
}

impl RootTable {
    pub fn frame(&self, function: &str) -> Option<&FrameDescriptor> {
        self.frames.iter().find(|f| f.function == function)
    }

    /// Drop descriptors for functions and globals rejected by `keep`.
    pub fn retain_symbols(&mut self, keep: impl Fn(&str) -> bool) {
        self.frames.retain(|f| keep(&f.function));
        self.globals.retain(|g| keep(&g.name));
    }

    /// Encode for the run-time collector.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
