// Track lifecycle over the slotted pool
//
// All mutating operations run on the dispatcher; the store itself has no
// internal locking. Snapshot accessors return owned copies so readers never
// hold references into slot storage.

use serde::Serialize;
use tracing::warn;

use crate::constants::{HEADER_WIRE_LEN, MAX_EXTRAPOLATION, POINT_WIRE_LEN, SEED_POINT_COUNT};
use crate::pool::TrackPool;
use crate::types::{TrackHeader, TrackPoint, TrackState};

/// Owned, non-torn copy of one track at a logical instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub header: TrackHeader,
    /// Window contents, oldest to newest.
    pub points: Vec<TrackPoint>,
}

/// Result of pushing one point into a track.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Ok,
    /// The id is not live; nothing changed.
    UnknownTrack,
    /// The push exceeded the extrapolation limit. The slot has been released;
    /// the final window (terminating point included) is only observable here.
    Terminated(TrackSnapshot),
}

/// Registry of live tracks plus the lifecycle policy that drives them.
#[derive(Debug)]
pub struct TrackStore {
    pool: TrackPool,
}

impl TrackStore {
    pub fn new(track_capacity: usize, point_capacity: usize) -> Self {
        TrackStore {
            pool: TrackPool::new(track_capacity, point_capacity),
        }
    }

    /// Open an empty track. Returns None when the pool is saturated.
    pub fn create_track(&mut self) -> Option<u32> {
        self.pool.allocate()
    }

    /// Open a track and push the four seed points in order. If any seed push
    /// terminates the track, the whole attempt is rolled back and None is
    /// returned.
    pub fn seed_track(&mut self, seeds: &[TrackPoint; SEED_POINT_COUNT]) -> Option<u32> {
        let id = self.pool.allocate()?;
        for point in seeds {
            match self.push_point(id, *point) {
                PushOutcome::Ok => {}
                PushOutcome::Terminated(_) => {
                    // push_point already released the slot
                    return None;
                }
                PushOutcome::UnknownTrack => {
                    // Unreachable while we hold a freshly issued id
                    self.pool.release(id);
                    return None;
                }
            }
        }
        Some(id)
    }

    /// Append a point and apply the extrapolation state machine.
    ///
    /// The point is appended even on the push that terminates the track; the
    /// returned snapshot is the only place the final window survives.
    pub fn push_point(&mut self, id: u32, mut point: TrackPoint) -> PushOutcome {
        let Some(index) = self.pool.lookup(id) else {
            return PushOutcome::UnknownTrack;
        };
        let slot = self.pool.slot_mut(index);

        // Carried timestamps are authoritative, but a window never goes
        // backwards: clamp a regressing timestamp up to the newest retained.
        if let Some(newest) = slot.window.len().checked_sub(1).map(|i| slot.window.get(i)) {
            if point.timestamp_ms < newest.timestamp_ms {
                point.timestamp_ms = newest.timestamp_ms;
            }
        }
        slot.window.push(point);

        if point.associated {
            slot.header.extrapolation_count = slot.header.extrapolation_count.saturating_sub(1);
            slot.header.state = TrackState::Normal;
        } else if slot.header.extrapolation_count < MAX_EXTRAPOLATION {
            slot.header.extrapolation_count += 1;
            slot.header.state = TrackState::Extrapolating;
        } else {
            slot.header.state = TrackState::Terminated;
        }
        slot.header.point_count = slot.window.len() as u32;

        if slot.header.state == TrackState::Terminated {
            let snapshot = TrackSnapshot {
                header: slot.header,
                points: slot.window.iter().copied().collect(),
            };
            self.pool.release(id);
            return PushOutcome::Terminated(snapshot);
        }
        PushOutcome::Ok
    }

    /// Manual fusion of two tracks judged to be the same physical target.
    ///
    /// The source id survives with its newest `MAX_EXTRAPOLATION` points
    /// overwritten by the target's newest points (aligned newest-to-newest);
    /// the target is released. Both windows must hold at least
    /// `MAX_EXTRAPOLATION` points so the tails can be aligned.
    pub fn merge(&mut self, source_id: u32, target_id: u32) -> bool {
        if source_id == target_id {
            warn!(source_id, "merge rejected: source and target are the same track");
            return false;
        }
        let (Some(source_index), Some(target_index)) =
            (self.pool.lookup(source_id), self.pool.lookup(target_id))
        else {
            return false;
        };

        let tail = MAX_EXTRAPOLATION as usize;
        let target_len = self.pool.slot(target_index).window.len();
        let source_len = self.pool.slot(source_index).window.len();
        if source_len < tail || target_len < tail {
            warn!(
                source_id,
                target_id, "merge rejected: not enough history to align tails"
            );
            return false;
        }

        let target_tail: Vec<TrackPoint> = (0..tail)
            .map(|i| *self.pool.slot(target_index).window.get(target_len - tail + i))
            .collect();
        let source = self.pool.slot_mut(source_index);
        for (i, point) in target_tail.into_iter().enumerate() {
            source.window.set(source_len - tail + i, point);
        }

        self.pool.release(target_id);
        true
    }

    /// Release one track unconditionally.
    pub fn release(&mut self, id: u32) -> bool {
        self.pool.release(id)
    }

    /// Drop every track and restart the id counter.
    pub fn clear_all(&mut self) {
        self.pool.clear_all();
    }

    // --- Snapshot API (read side) ---

    /// Currently live ids. Ordering unspecified but stable within one call.
    pub fn active_ids(&self) -> Vec<u32> {
        self.pool.live_ids()
    }

    pub fn header(&self, id: u32) -> Option<TrackHeader> {
        self.pool.get(id).map(|slot| slot.header)
    }

    /// Window contents oldest to newest.
    pub fn window(&self, id: u32) -> Option<Vec<TrackPoint>> {
        self.pool
            .get(id)
            .map(|slot| slot.window.iter().copied().collect())
    }

    pub fn snapshot(&self, id: u32) -> Option<TrackSnapshot> {
        self.pool.get(id).map(|slot| TrackSnapshot {
            header: slot.header,
            points: slot.window.iter().copied().collect(),
        })
    }

    /// Snapshots of every live track, for the visualizer hook.
    pub fn snapshot_all(&self) -> Vec<TrackSnapshot> {
        self.pool
            .live_ids()
            .into_iter()
            .filter_map(|id| self.snapshot(id))
            .collect()
    }

    /// Serialize header plus window into `buf` using the fixed wire layout.
    /// Returns bytes written; 0 when the id is unknown or `buf` is too small
    /// for the whole frame.
    pub fn pack(&self, id: u32, buf: &mut [u8]) -> usize {
        let Some(slot) = self.pool.get(id) else {
            return 0;
        };
        let needed = HEADER_WIRE_LEN + slot.window.len() * POINT_WIRE_LEN;
        if buf.len() < needed {
            warn!(id, needed, available = buf.len(), "pack buffer too small");
            return 0;
        }
        buf[..HEADER_WIRE_LEN].copy_from_slice(&slot.header.to_wire());
        for (i, point) in slot.window.iter().enumerate() {
            let off = HEADER_WIRE_LEN + i * POINT_WIRE_LEN;
            buf[off..off + POINT_WIRE_LEN].copy_from_slice(&point.to_wire());
        }
        needed
    }

    /// Pack into a fresh buffer, sized exactly.
    pub fn pack_vec(&self, id: u32) -> Option<Vec<u8>> {
        let slot = self.pool.get(id)?;
        let mut buf = vec![0u8; HEADER_WIRE_LEN + slot.window.len() * POINT_WIRE_LEN];
        let written = self.pack(id, &mut buf);
        debug_assert_eq!(written, buf.len());
        Some(buf)
    }

    pub fn used_count(&self) -> usize {
        self.pool.used_count()
    }

    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &TrackPool {
        &self.pool
    }
}

/// Pack an already-captured snapshot (e.g. a termination event) with the
/// same layout as `TrackStore::pack`.
pub fn pack_snapshot(snapshot: &TrackSnapshot) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_WIRE_LEN + snapshot.points.len() * POINT_WIRE_LEN);
    buf.extend_from_slice(&snapshot.header.to_wire());
    for point in &snapshot.points {
        buf.extend_from_slice(&point.to_wire());
    }
    buf
}
