//! Streaming scheduler
//!
//! Decides which (frame, LOD) keys should be resident soon, keeps one
//! pending request per key, and hands decode jobs to the worker pool in
//! priority order. The scheduler is plain state: it performs no I/O and is
//! driven by the streamer with an explicit `now`.
//!
//! Request lifecycle:
//! pending -> decoding -> uploading -> published (or failed / cancelled).
//! A key is in at most one of these stages at a time.

use crate::streaming::cache::{CacheError, ResidentCache};
use crate::streaming::catalog::{GridBlobRef, VolumeCatalog};
use crate::streaming::config::StreamingConfig;
use crate::streaming::disk_io::DecodeError;
use crate::streaming::key::{FrameKey, FrameStatus, SequenceId};
use crate::streaming::lod::{coarsest_lod, per_frame_share, select_lod};
use crate::streaming::playback::PlaybackState;
use crate::streaming::priority::{arrival_delay, dispatch_order, CancelToken, PendingRequest, RequestOrigin};
use crate::streaming::upload::TransferError;
use crate::streaming::worker::DecodeJob;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Result of an explicit [`StreamingScheduler::request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new request was queued
    Issued,
    /// Joined a request already pending or in flight
    Coalesced,
    AlreadyResident,
    /// Failed recently, permanently rejected, or not in the catalog
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Decoding,
    Uploading,
}

#[derive(Debug)]
struct InFlight {
    stage: JobStage,
    token: CancelToken,
    origin: RequestOrigin,
    blob: GridBlobRef,
    /// Wanted again after cancellation; reissued when the job reports back
    reissue: bool,
}

/// Streaming statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StreamingStats {
    pub issued: u64,
    pub coalesced: u64,
    pub cancelled: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub demoted: u64,
    pub pending: usize,
    pub decoding: usize,
    pub uploading: usize,
}

/// Playback-driven request scheduler
pub struct StreamingScheduler {
    config: StreamingConfig,
    /// Issued, not dispatched
    pending: HashMap<FrameKey, PendingRequest>,
    /// Dispatched, not finished
    in_flight: HashMap<FrameKey, InFlight>,
    /// Failed keys and when they may be retried
    failures: HashMap<FrameKey, Instant>,
    /// Keys the cache can never hold this session
    rejected: HashSet<FrameKey>,
    next_order: u64,
    dirty: bool,
    stats: StreamingStats,
}

impl StreamingScheduler {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            failures: HashMap::new(),
            rejected: HashSet::new(),
            next_order: 0,
            dirty: true,
            stats: StreamingStats::default(),
        }
    }

    /// Replace the configuration; takes effect at the next reevaluation
    pub fn set_config(&mut self, config: StreamingConfig) {
        self.config = config;
        self.dirty = true;
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Whether something other than a frame crossing calls for a reevaluation
    pub fn wants_reevaluate(&self, now: Instant) -> bool {
        self.dirty || self.failures.values().any(|&retry_at| retry_at <= now)
    }

    /// Keys that should be resident for this playback position, with their
    /// distance in frames
    fn desired_set(
        &self,
        catalog: &VolumeCatalog,
        cache: &ResidentCache,
        playback: &PlaybackState,
    ) -> HashMap<FrameKey, u32> {
        let mut desired = HashMap::new();
        let count = catalog.frame_count();
        if count == 0 {
            return desired;
        }

        let sequence = catalog.sequence();
        let current = playback.current_frame().min(count - 1);
        let direction = i64::from(playback.direction());
        let looping = playback.is_looping();
        let share = per_frame_share(self.config.memory_budget_bytes, self.config.resident_frames());

        let ahead = (0..=self.config.prefetch_window)
            .map_while(|d| step(current, direction * i64::from(d), count, looping).map(|f| (f, d)));
        let behind = (1..=self.config.frames_behind)
            .map_while(|d| step(current, -direction * i64::from(d), count, looping).map(|f| (f, d)));

        for (frame, distance) in ahead.chain(behind) {
            // Frames missing from the catalog are skipped
            if !catalog.contains_frame(frame) {
                continue;
            }
            let rejected = |level| self.rejected.contains(&FrameKey::new(sequence, frame, level));
            if let Some(level) = select_lod(self.config.lod_policy, catalog, frame, share, rejected) {
                desired
                    .entry(FrameKey::new(sequence, frame, level))
                    .and_modify(|d: &mut u32| *d = (*d).min(distance))
                    .or_insert(distance);
            }
        }

        // Coarsest LOD of the current frame as a fallback while nothing of it is resident
        if cache.resident_lods(sequence, current).is_empty() {
            let rejected = |level| self.rejected.contains(&FrameKey::new(sequence, current, level));
            if let Some(level) = coarsest_lod(catalog, current, rejected) {
                desired.insert(FrameKey::new(sequence, current, level), 0);
            }
        }

        desired
    }

    /// Recompute the desired set and diff it against outstanding requests.
    ///
    /// Called when playback crosses a frame boundary, on seek, and whenever
    /// [`StreamingScheduler::wants_reevaluate`] says so.
    pub fn reevaluate(
        &mut self,
        catalog: &VolumeCatalog,
        cache: &ResidentCache,
        playback: &PlaybackState,
        now: Instant,
    ) {
        let sequence = catalog.sequence();
        let generation = playback.generation();
        let desired = self.desired_set(catalog, cache, playback);

        // Requests that left the window
        let stale: Vec<FrameKey> = self
            .pending
            .iter()
            .filter(|(key, r)| {
                key.sequence == sequence && r.origin == RequestOrigin::Prefetch && !desired.contains_key(key)
            })
            .map(|(&key, _)| key)
            .collect();
        for key in stale {
            if let Some(request) = self.pending.remove(&key) {
                request.token.cancel();
                self.stats.cancelled += 1;
                log::trace!("Cancelled pending {}", key);
            }
        }
        for (key, job) in self.in_flight.iter_mut() {
            if key.sequence == sequence
                && job.origin == RequestOrigin::Prefetch
                && !job.token.is_cancelled()
                && !desired.contains_key(key)
            {
                job.token.cancel();
                self.stats.cancelled += 1;
                log::trace!("Cancelled in-flight {}", key);
            }
        }

        // Expired failures outside the window are forgotten
        self.failures
            .retain(|key, retry_at| *retry_at > now || key.sequence != sequence || desired.contains_key(key));

        let mut issued = 0;
        let mut resident = Vec::new();
        for (key, distance) in desired {
            if cache.contains(key) {
                resident.push(key);
                continue;
            }

            // Due when playback leaves the frame, not when it arrives
            let deadline = now + arrival_delay(distance + 1, catalog.frame_rate(), playback.speed());
            if let Some(request) = self.pending.get_mut(&key) {
                request.distance = distance;
                request.deadline = deadline;
                request.generation = generation;
                continue;
            }
            if let Some(job) = self.in_flight.get_mut(&key) {
                if job.token.is_cancelled() {
                    job.reissue = true;
                }
                continue;
            }
            if self.rejected.contains(&key) || self.failures.get(&key).is_some_and(|&t| t > now) {
                continue;
            }

            match catalog.resolve(key) {
                Ok(blob) => {
                    self.issue(key, blob, distance, deadline, generation, RequestOrigin::Prefetch);
                    issued += 1;
                }
                Err(e) => log::warn!("Skipping {}: {}", key, e),
            }
        }

        cache.touch_many(resident);

        self.dirty = false;
        log::debug!(
            "Reevaluated {} at frame {}: {} issued, {} pending, {} in flight",
            sequence,
            playback.current_frame(),
            issued,
            self.pending.len(),
            self.in_flight.len()
        );
    }

    fn issue(
        &mut self,
        key: FrameKey,
        blob: GridBlobRef,
        distance: u32,
        deadline: Instant,
        generation: u64,
        origin: RequestOrigin,
    ) {
        self.failures.remove(&key);
        let request = PendingRequest {
            key,
            blob,
            distance,
            deadline,
            generation,
            origin,
            token: CancelToken::new(),
            order: self.next_order,
            demoted: false,
        };
        self.next_order += 1;
        self.pending.insert(key, request);
        self.stats.issued += 1;
        log::trace!("Issued {} (distance {})", key, distance);
    }

    /// Ask for one key outside the playback window
    pub fn request(
        &mut self,
        key: FrameKey,
        catalog: &VolumeCatalog,
        cache: &ResidentCache,
        now: Instant,
    ) -> RequestOutcome {
        if cache.contains(key) {
            return RequestOutcome::AlreadyResident;
        }

        if let Some(request) = self.pending.get_mut(&key) {
            request.origin = RequestOrigin::Explicit;
            self.stats.coalesced += 1;
            return RequestOutcome::Coalesced;
        }
        if let Some(job) = self.in_flight.get_mut(&key) {
            job.origin = RequestOrigin::Explicit;
            if job.token.is_cancelled() {
                job.reissue = true;
            }
            self.stats.coalesced += 1;
            return RequestOutcome::Coalesced;
        }

        if self.rejected.contains(&key) || self.failures.get(&key).is_some_and(|&t| t > now) {
            return RequestOutcome::Failed;
        }

        match catalog.resolve(key) {
            Ok(blob) => {
                let deadline = now + arrival_delay(1, catalog.frame_rate(), 1.0);
                self.issue(key, blob, 0, deadline, 0, RequestOrigin::Explicit);
                RequestOutcome::Issued
            }
            Err(e) => {
                log::warn!("Request for {} failed: {}", key, e);
                RequestOutcome::Failed
            }
        }
    }

    /// Hand out decode jobs, most urgent first, up to the worker count
    pub fn dispatch(&mut self, now: Instant) -> Vec<DecodeJob> {
        let decoding = self
            .in_flight
            .values()
            .filter(|job| job.stage == JobStage::Decoding)
            .count();
        let free = self.config.worker_count.saturating_sub(decoding);
        if free == 0 || self.pending.is_empty() {
            return Vec::new();
        }

        for request in self.pending.values_mut() {
            if !request.demoted && request.is_overdue(now) {
                request.demoted = true;
                self.stats.demoted += 1;
                log::trace!("{} is past its deadline, demoted", request.key);
            }
        }

        let order = dispatch_order(self.pending.values(), now);
        let mut jobs = Vec::with_capacity(free.min(order.len()));
        for key in order.into_iter().take(free) {
            let Some(request) = self.pending.remove(&key) else { continue };
            self.in_flight.insert(
                key,
                InFlight {
                    stage: JobStage::Decoding,
                    token: request.token.clone(),
                    origin: request.origin,
                    blob: request.blob.clone(),
                    reissue: false,
                },
            );
            self.stats.dispatched += 1;
            jobs.push(DecodeJob {
                key,
                blob: request.blob,
                token: request.token,
            });
        }
        jobs
    }

    // --- Job results ---

    /// A decode finished. Returns the token to carry into the upload, or
    /// `None` if the result should be dropped.
    pub fn on_decoded(&mut self, key: FrameKey, now: Instant) -> Option<CancelToken> {
        let job = self.in_flight.get_mut(&key)?;
        if job.token.is_cancelled() {
            self.on_cancelled(key, now);
            return None;
        }
        job.stage = JobStage::Uploading;
        Some(job.token.clone())
    }

    pub fn on_decode_failed(&mut self, key: FrameKey, error: &DecodeError, now: Instant) {
        let Some(job) = self.in_flight.remove(&key) else { return };
        if job.token.is_cancelled() {
            self.finish_cancelled(key, job, now);
            return;
        }
        log::warn!("Decode of {} failed: {}", key, error);
        self.mark_failed(key, now);
    }

    /// The job observed its cancelled token and discarded its work
    pub fn on_cancelled(&mut self, key: FrameKey, now: Instant) {
        if let Some(job) = self.in_flight.remove(&key) {
            self.finish_cancelled(key, job, now);
        }
    }

    /// Reissued requests get their real distance and deadline at the next
    /// reevaluation
    fn finish_cancelled(&mut self, key: FrameKey, job: InFlight, now: Instant) {
        self.dirty = true;
        if job.reissue {
            self.issue(key, job.blob, 0, now, 0, job.origin);
        }
    }

    pub fn on_published(&mut self, key: FrameKey) {
        if self.in_flight.remove(&key).is_some() {
            self.failures.remove(&key);
            self.stats.completed += 1;
        }
    }

    pub fn on_upload_failed(&mut self, key: FrameKey, error: &TransferError, now: Instant) {
        if !self.in_flight.contains_key(&key) {
            return;
        }
        match error {
            // Someone else got it resident first
            TransferError::Cache(CacheError::Duplicate(_)) => self.on_published(key),
            e if e.is_permanent() => {
                self.in_flight.remove(&key);
                log::warn!("{} rejected for this session: {}", key, e);
                self.rejected.insert(key);
                self.stats.rejected += 1;
                // A coarser LOD may fit
                self.dirty = true;
            }
            e => {
                self.in_flight.remove(&key);
                log::warn!("Upload of {} failed: {}", key, e);
                self.mark_failed(key, now);
            }
        }
    }

    fn mark_failed(&mut self, key: FrameKey, now: Instant) {
        self.failures.insert(key, now + self.config.retry_cooldown);
        self.stats.failed += 1;
    }

    /// Cancel and forget everything about a sequence
    pub fn forget_sequence(&mut self, sequence: SequenceId) {
        self.pending.retain(|key, request| {
            let keep = key.sequence != sequence;
            if !keep {
                request.token.cancel();
            }
            keep
        });
        for (key, job) in self.in_flight.iter_mut() {
            if key.sequence == sequence {
                job.token.cancel();
                job.reissue = false;
            }
        }
        self.failures.retain(|key, _| key.sequence != sequence);
        self.rejected.retain(|key| key.sequence != sequence);
    }

    // --- Queries ---

    /// Best-effort status of a key
    pub fn status(&self, key: FrameKey, cache: &ResidentCache) -> FrameStatus {
        if cache.contains(key) {
            FrameStatus::Resident
        } else if self.pending.contains_key(&key)
            || self.in_flight.get(&key).is_some_and(|job| !job.token.is_cancelled() || job.reissue)
        {
            FrameStatus::Pending
        } else if self.rejected.contains(&key) || self.failures.contains_key(&key) {
            FrameStatus::Failed
        } else {
            FrameStatus::Unknown
        }
    }

    /// Non-resident keys the scheduler knows about, with their status
    pub fn tracked_keys(&self) -> Vec<(FrameKey, FrameStatus)> {
        let pending = self
            .pending
            .keys()
            .chain(self.in_flight.iter().filter(|(_, j)| !j.token.is_cancelled()).map(|(k, _)| k))
            .map(|&key| (key, FrameStatus::Pending));
        let failed = self
            .failures
            .keys()
            .chain(self.rejected.iter())
            .map(|&key| (key, FrameStatus::Failed));
        pending.chain(failed).collect()
    }

    /// Whether some LOD of a frame has been decoded and is being uploaded
    pub fn is_uploading_frame(&self, sequence: SequenceId, frame: u32) -> bool {
        self.in_flight.iter().any(|(key, job)| {
            key.sequence == sequence && key.frame == frame && job.stage == JobStage::Uploading
        })
    }

    /// Whether any LOD of a frame is still queued or on its way
    pub fn has_outstanding_frame(&self, sequence: SequenceId, frame: u32) -> bool {
        let matches = |key: &FrameKey| key.sequence == sequence && key.frame == frame;
        self.pending.keys().any(matches)
            || self
                .in_flight
                .iter()
                .any(|(key, job)| matches(key) && (!job.token.is_cancelled() || job.reissue))
    }

    pub fn stage(&self, key: FrameKey) -> Option<JobStage> {
        self.in_flight.get(&key).map(|job| job.stage)
    }

    pub fn is_pending(&self, key: FrameKey) -> bool {
        self.pending.contains_key(&key)
    }

    /// Cancellation token of a pending request
    pub fn pending_token(&self, key: FrameKey) -> Option<CancelToken> {
        self.pending.get(&key).map(|r| r.token.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_rejected(&self, key: FrameKey) -> bool {
        self.rejected.contains(&key)
    }

    pub fn stats(&self) -> StreamingStats {
        let uploading = self
            .in_flight
            .values()
            .filter(|job| job.stage == JobStage::Uploading)
            .count();
        StreamingStats {
            pending: self.pending.len(),
            decoding: self.in_flight.len() - uploading,
            uploading,
            ..self.stats
        }
    }
}

/// Frame `offset` frames away from `current`, wrapping when looping
fn step(current: u32, offset: i64, count: u32, looping: bool) -> Option<u32> {
    let frame = i64::from(current) + offset;
    let count = i64::from(count);
    if looping {
        Some(frame.rem_euclid(count) as u32)
    } else if (0..count).contains(&frame) {
        Some(frame as u32)
    } else {
        None
    }
}
