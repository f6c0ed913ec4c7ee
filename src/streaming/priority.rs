//! Request priority, deadlines and cancellation tokens

use crate::streaming::catalog::GridBlobRef;
use crate::streaming::key::FrameKey;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between the scheduler and a job
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }
}

/// Why a request exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Derived from the playback window; cancelled when it leaves the window
    Prefetch,
    /// Asked for directly; only cancelled when its sequence closes
    Explicit,
}

/// A request that has been issued but not dispatched yet
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub key: FrameKey,
    pub blob: GridBlobRef,
    /// Frames between the playback position and this frame
    pub distance: u32,
    /// Estimated time playback reaches this frame
    pub deadline: Instant,
    /// Playback generation that issued or last refreshed the request
    pub generation: u64,
    pub origin: RequestOrigin,
    pub token: CancelToken,
    /// Issue order, the last tie-break
    pub order: u64,
    /// Counted as demoted already
    pub demoted: bool,
}

impl PendingRequest {
    pub fn is_overdue(&self, now: Instant) -> bool {
        now > self.deadline
    }

    /// Dispatch ordering key at `now`
    pub fn urgency(&self, now: Instant) -> Urgency {
        Urgency {
            overdue: self.is_overdue(now),
            distance: self.distance,
            lod: self.key.lod,
            order: self.order,
            key: self.key,
        }
    }
}

/// Dispatch order of pending requests.
///
/// Closer frames first. At equal distance an overdue request goes after the
/// on-time ones, then finer LODs first, then issue order. Being overdue never
/// moves a request behind a farther frame. The greatest value is the most
/// urgent, as [`BinaryHeap`] pops its maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Urgency {
    pub overdue: bool,
    pub distance: u32,
    pub lod: u8,
    pub order: u64,
    pub key: FrameKey,
}

impl Urgency {
    fn rank(&self) -> (Reverse<u32>, Reverse<bool>, u8, Reverse<u64>) {
        (Reverse(self.distance), Reverse(self.overdue), self.lod, Reverse(self.order))
    }
}

impl Ord for Urgency {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank()).then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for Urgency {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Order requests for dispatch, most urgent first
pub fn dispatch_order<'a>(requests: impl IntoIterator<Item = &'a PendingRequest>, now: Instant) -> Vec<FrameKey> {
    let mut heap: BinaryHeap<Urgency> = requests.into_iter().map(|r| r.urgency(now)).collect();
    let mut ordered = Vec::with_capacity(heap.len());
    while let Some(urgency) = heap.pop() {
        ordered.push(urgency.key);
    }
    ordered
}

/// Estimated time until playback reaches a frame `distance` frames away
///
/// # Arguments
/// * `distance` - Frames from the playback position
/// * `frame_rate` - Sequence frames per second
/// * `speed` - Playback speed multiplier (sign ignored; paused playback
///   counts as normal speed)
pub fn arrival_delay(distance: u32, frame_rate: f32, speed: f32) -> Duration {
    let rate = frame_rate * if speed == 0.0 { 1.0 } else { speed.abs() };
    if !(rate > 0.0) {
        return Duration::ZERO;
    }
    Duration::from_secs_f32(distance as f32 / rate)
}
