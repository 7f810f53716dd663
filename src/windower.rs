use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, trace};

use crate::model::{LocationFix, Segment};

/// Number of fixes that make up one segment
pub const WINDOW_SIZE: usize = 2;

struct PendingFixes {
    fixes: Vec<LocationFix>,
    last_seen: Instant,
}

/// Pairs consecutive fixes of each vehicle into [`Segment`]s.
///
/// Buffers are keyed by vehicle id. `DashMap::entry` holds the shard lock for
/// the whole append-and-maybe-emit step, so two fixes of the same vehicle can
/// never interleave and lose an update. Distinct vehicles only contend when
/// they hash to the same shard.
#[derive(Default)]
pub struct SegmentWindower {
    pending: DashMap<String, PendingFixes>,
}

impl SegmentWindower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `fix` and emit a segment once the vehicle has a full window.
    ///
    /// The emitted segment holds the two most recent fixes, oldest first, and
    /// the vehicle's buffer is emptied entirely.
    pub fn ingest(&self, fix: LocationFix) -> Option<Segment> {
        let mut entry = self
            .pending
            .entry(fix.vehicle_id.clone())
            .or_insert_with(|| PendingFixes {
                fixes: Vec::with_capacity(WINDOW_SIZE),
                last_seen: Instant::now(),
            });

        entry.last_seen = Instant::now();
        entry.fixes.push(fix);

        if entry.fixes.len() < WINDOW_SIZE {
            trace!("Buffering fix, {} pending", entry.fixes.len());
            return None;
        }

        let fix_b = entry.fixes.pop()?;
        let fix_a = entry.fixes.pop()?;
        entry.fixes.clear();

        debug!(
            "Segment ready for vehicle {} ({} -> {})",
            fix_b.vehicle_id, fix_a.message_id, fix_b.message_id
        );

        Some(Segment {
            vehicle_id: fix_b.vehicle_id.clone(),
            message_id: fix_b.message_id,
            fix_a,
            fix_b,
        })
    }

    /// Number of fixes waiting for a partner
    pub fn pending_len(&self, vehicle_id: &str) -> usize {
        self.pending
            .get(vehicle_id)
            .map(|entry| entry.fixes.len())
            .unwrap_or(0)
    }

    /// Drop buffers not touched for longer than `max_idle`.
    /// Returns how many pending fixes were discarded.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut discarded = 0;
        self.pending.retain(|vehicle_id, entry| {
            if entry.last_seen.elapsed() <= max_idle {
                return true;
            }
            if !entry.fixes.is_empty() {
                debug!(
                    "Evicting {} unpaired fix(es) of idle vehicle {}",
                    entry.fixes.len(),
                    vehicle_id
                );
            }
            discarded += entry.fixes.len();
            false
        });
        discarded
    }
}
