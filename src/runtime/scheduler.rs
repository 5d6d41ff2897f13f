//! Fan-out batch tracking.
//!
//! When a step returns a `Map` routing value it becomes the *owner* of a
//! batch: one invocation of the target per item. The scheduler tracks each
//! owner's batches in FIFO order and reports which batches drain as
//! completions arrive. Interleaved batches targeting the same step keep
//! FIFO semantics: only the oldest matching batch is decremented per
//! completion.

use std::collections::VecDeque;

use indexmap::IndexMap;
use uuid::Uuid;

/// One fan-out group.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MapBatch {
    /// Companion step invoked once per item.
    pub target: String,
    /// Number of items fanned out.
    pub item_count: usize,
    /// Children still outstanding.
    pub remaining: usize,
    /// Invocation that created the batch.
    pub owner_invocation_id: Option<Uuid>,
    /// Reserved for nested-map disambiguation; not consulted by matching.
    pub owner_scope: Vec<String>,
}

/// Batches keyed by owner step name, FIFO per owner.
#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    map_batches: IndexMap<String, VecDeque<MapBatch>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new batch at the tail of the owner's list. Zero-item
    /// batches are registered too; they drain the instant the owner step
    /// completes.
    pub fn register_batch(
        &mut self,
        owner: &str,
        target: &str,
        item_count: usize,
        owner_invocation_id: Option<Uuid>,
    ) {
        self.map_batches
            .entry(owner.to_string())
            .or_default()
            .push_back(MapBatch {
                target: target.to_string(),
                item_count,
                remaining: item_count,
                owner_invocation_id,
                owner_scope: Vec::new(),
            });
    }

    /// Account for a completed invocation under `owner` and return the
    /// batches it drained.
    ///
    /// Only the oldest batch whose target matches the completed step is
    /// decremented. A completion of the owner itself drains the oldest
    /// batch when that batch is empty.
    pub fn on_step_completed(&mut self, owner: &str, completed: &str) -> Vec<MapBatch> {
        let Some(batches) = self.map_batches.get_mut(owner) else {
            return Vec::new();
        };

        let mut drained = Vec::new();
        if let Some(idx) = batches.iter().position(|b| b.target == completed) {
            let batch = &mut batches[idx];
            batch.remaining = batch.remaining.saturating_sub(1);
            if batch.remaining == 0 {
                let was_front = idx == 0;
                drained.extend(batches.remove(idx));
                if was_front {
                    // Empty batches behind the front are owed a drain: their
                    // owner already completed while an older batch blocked
                    // them from being the oldest.
                    while batches.front().is_some_and(|b| b.item_count == 0) {
                        drained.extend(batches.pop_front());
                    }
                }
            }
        } else if completed == owner {
            while batches.front().is_some_and(|b| b.item_count == 0) {
                drained.extend(batches.pop_front());
            }
        }

        if batches.is_empty() {
            self.map_batches.shift_remove(owner);
        }
        drained
    }

    /// Whether the owner still has outstanding batches.
    pub fn has_owner(&self, owner: &str) -> bool {
        self.map_batches.contains_key(owner)
    }

    /// Whether no batch is outstanding at all.
    pub fn is_idle(&self) -> bool {
        self.map_batches.is_empty()
    }

    #[cfg(test)]
    fn insert_batches(&mut self, owner: &str, batches: Vec<MapBatch>) {
        self.map_batches.insert(owner.to_string(), batches.into());
    }
}
