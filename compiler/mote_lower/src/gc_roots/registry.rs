//! Accumulates frame and global descriptors before they are frozen into the
//! module's [`RootTable`].
//!
//! Per-function analysis runs in parallel; only the single merge loop in
//! [`instrument_gc_roots`](super::instrument_gc_roots) writes here, in
//! function order, so frame ids and safe-point ids are deterministic.

use mote_ir::{FrameDescriptor, FrameSlot, GlobalRoot, RootTable, SlotLayout};
use rustc_hash::FxHashMap;

/// Frame ids start at 1 so a zeroed frame record is recognisable.
const FIRST_FRAME_ID: u32 = 1;

#[derive(Debug, Default)]
pub struct RootRegistry {
    globals: Vec<GlobalRoot>,
    frames: Vec<FrameDescriptor>,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_global(&mut self, name: &str, layout: SlotLayout) {
        self.globals.push(GlobalRoot {
            name: name.to_owned(),
            layout,
        });
    }

    /// Commit the frame of `function`.
    ///
    /// `root_sets` holds the live slot indices of every safe point in
    /// program order. Identical sets share one safe-point id. Returns the
    /// frame id and the safe-point id assigned to each entry of `root_sets`.
    pub fn add_frame(
        &mut self,
        function: &str,
        slots: Vec<FrameSlot>,
        root_sets: &[Vec<u32>],
    ) -> (u32, Vec<u32>) {
        let id = FIRST_FRAME_ID + u32::try_from(self.frames.len()).unwrap_or(u32::MAX - 1);
        let mut distinct: Vec<Vec<u32>> = Vec::new();
        let mut ids: FxHashMap<&[u32], u32> = FxHashMap::default();
        let mut assigned = Vec::with_capacity(root_sets.len());
        for set in root_sets {
            let next = u32::try_from(distinct.len()).unwrap_or(u32::MAX);
            let safe_point = *ids.entry(set.as_slice()).or_insert_with(|| {
                distinct.push(set.clone());
                next
            });
            assigned.push(safe_point);
        }
        self.frames.push(FrameDescriptor {
            id,
            function: function.to_owned(),
            slots,
            safe_points: distinct,
        });
        (id, assigned)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Freeze into the table attached to the module.
    pub fn freeze(self) -> RootTable {
        RootTable {
            globals: self.globals,
            frames: self.frames,
        }
    }
}
