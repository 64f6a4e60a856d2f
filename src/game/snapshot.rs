//! Snapshot/event accumulation between broadcast cycles
//!
//! The engine records changed tile indices and discrete events as they
//! happen; a drain hands everything to the broadcaster exactly once and
//! clears both buffers. Draining runs on the room task, never concurrently
//! with a tick.

use std::collections::BTreeSet;

use crate::ws::protocol::{GameEvent, TileDelta};

use super::grid::{TileGrid, TileState};

/// Buffers per-room deltas between snapshot broadcasts.
#[derive(Debug)]
pub struct SnapshotAccumulator {
    /// Tile indices needing a refresh (set, so repeat transitions dedupe)
    changed_tiles: BTreeSet<usize>,
    /// Ordered discrete events since the last drain
    events: Vec<GameEvent>,
    /// Tick counter since last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotAccumulator {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            changed_tiles: BTreeSet::new(),
            events: Vec::new(),
            ticks_since_snapshot: 0,
            snapshot_interval,
        }
    }

    /// Mark a tile as changed since the last drain.
    pub fn note_tile(&mut self, index: usize) {
        self.changed_tiles.insert(index);
    }

    /// Append a discrete event.
    pub fn push_event(&mut self, event: GameEvent) {
        self.events.push(event);
    }

    /// Check if it's time to send a snapshot.
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (used for round transitions).
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    /// Drain the buffered tile deltas and events, clearing both atomically.
    /// Tiles that are back to (still) solid are omitted from the payload.
    pub fn drain(&mut self, grid: &TileGrid) -> (Vec<TileDelta>, Vec<GameEvent>) {
        let tiles: Vec<TileDelta> = self
            .changed_tiles
            .iter()
            .map(|&index| TileDelta {
                index,
                state: grid.state(index),
            })
            .filter(|delta| delta.state != TileState::Solid)
            .collect();

        self.changed_tiles.clear();
        (tiles, std::mem::take(&mut self.events))
    }
}
