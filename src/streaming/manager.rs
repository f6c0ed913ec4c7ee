//! Volume streamer
//!
//! Ties the catalog, scheduler, worker pool, upload pipeline, residency
//! cache and render consumer together behind one non-blocking `tick`.

use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::cache::{CacheStats, ResidentCache};
use crate::streaming::catalog::VolumeCatalog;
use crate::streaming::config::{ConfigError, StreamingConfig};
use crate::streaming::consumer::{FrameView, RenderConsumer, Unavailable};
use crate::streaming::diagnostics::{SequenceSnapshot, StatusBoard, StatusBoardHandler};
use crate::streaming::disk_io::{DecodeError, GridSource};
use crate::streaming::key::{FrameKey, FrameStatus, SequenceId};
use crate::streaming::playback::{FrameAdvance, PlaybackState};
use crate::streaming::scheduler::{RequestOutcome, StreamingScheduler, StreamingStats};
use crate::streaming::upload::{UploadBackend, UploadEvent, UploadJob, UploadPipeline, UploadStats};
use crate::streaming::worker::{DecodeOutcome, DecodeWorkerPool};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use vdbstream_debug::DebugServer;

/// Combined statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct StreamerStats {
    pub cache: CacheStats,
    pub streaming: StreamingStats,
    pub uploads: UploadStats,
    /// Jobs handed to the worker pool and not reported back yet
    pub decode_in_progress: usize,
}

struct OpenSequence {
    catalog: Arc<VolumeCatalog>,
    /// Playback frame at the last reevaluation
    last_frame: Option<u32>,
    /// Playback generation at the last reevaluation
    last_generation: Option<u64>,
}

/// Streams frames of open sequences into the residency cache
pub struct VolumeStreamer {
    config: StreamingConfig,
    /// Applied at the start of the next tick
    pending_config: Option<StreamingConfig>,
    cache: ResidentCache,
    scheduler: StreamingScheduler,
    uploads: UploadPipeline,
    consumer: RenderConsumer,
    workers: DecodeWorkerPool,
    sequences: BTreeMap<SequenceId, OpenSequence>,
    next_sequence: u32,
    board: StatusBoard,
}

impl VolumeStreamer {
    /// Create a streamer and start its decode workers
    ///
    /// # Arguments
    /// * `config` - Streaming configuration (validated)
    /// * `source` - Reads and decodes grid blobs
    /// * `backend` - Allocates and fills GPU buffers
    pub fn new(config: StreamingConfig, source: Arc<dyn GridSource>, backend: Box<dyn UploadBackend>) -> Result<Self> {
        config.validate()?;

        let cache = ResidentCache::new(config.memory_budget_bytes, config.max_pinned);
        let workers = DecodeWorkerPool::new(source, config.worker_count)?;
        let uploads = UploadPipeline::new(backend, cache.clone(), config.buffer_idle_ticks);

        log::info!(
            "Volume streamer started: budget {} bytes, window {}, {} workers",
            config.memory_budget_bytes,
            config.prefetch_window,
            config.worker_count
        );

        Ok(Self {
            scheduler: StreamingScheduler::new(config.clone()),
            consumer: RenderConsumer::new(cache.clone()),
            config,
            pending_config: None,
            cache,
            uploads,
            workers,
            sequences: BTreeMap::new(),
            next_sequence: 0,
            board: StatusBoard::new(),
        })
    }

    // --- Sequences ---

    /// Load a manifest and open its sequence under a fresh id
    pub fn open_sequence(&mut self, manifest_path: &Path) -> Result<SequenceId> {
        let sequence = self.allocate_sequence_id();
        let catalog = VolumeCatalog::load(sequence, manifest_path)?;
        self.open_catalog(catalog)
    }

    /// Open an already-built catalog under its own id
    pub fn open_catalog(&mut self, catalog: VolumeCatalog) -> Result<SequenceId> {
        let sequence = catalog.sequence();
        if self.sequences.contains_key(&sequence) {
            return Err(Error::Streaming(format!("{} is already open", sequence)));
        }
        self.next_sequence = self.next_sequence.max(sequence.0.saturating_add(1));

        log::info!(
            "Opened {} '{}': {} frames at {} fps",
            sequence,
            catalog.name(),
            catalog.frame_count(),
            catalog.frame_rate()
        );
        self.sequences.insert(
            sequence,
            OpenSequence {
                catalog: Arc::new(catalog),
                last_frame: None,
                last_generation: None,
            },
        );
        Ok(sequence)
    }

    /// Id the next [`VolumeStreamer::open_sequence`] will use
    pub fn allocate_sequence_id(&mut self) -> SequenceId {
        while self.sequences.contains_key(&SequenceId(self.next_sequence)) {
            self.next_sequence += 1;
        }
        SequenceId(self.next_sequence)
    }

    /// Cancel everything of a sequence and drop its resident grids.
    ///
    /// Handles the renderer still holds stay valid until released.
    pub fn close_sequence(&mut self, sequence: SequenceId) -> bool {
        let Some(open) = self.sequences.remove(&sequence) else {
            return false;
        };
        self.scheduler.forget_sequence(sequence);
        self.uploads.cancel_sequence(sequence);
        self.consumer.release_sequence(sequence);
        let removed = self.cache.remove_sequence(sequence);
        self.board.remove_sequence(sequence);
        log::info!("Closed {} '{}', {} grids released", sequence, open.catalog.name(), removed);
        true
    }

    pub fn catalog(&self, sequence: SequenceId) -> Option<&VolumeCatalog> {
        self.sequences.get(&sequence).map(|open| open.catalog.as_ref())
    }

    pub fn sequences(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.sequences.keys().copied()
    }

    // --- Per-frame driving ---

    /// Advance one sequence by `dt` seconds and move data along.
    ///
    /// Never blocks: decode results and fences are polled.
    pub fn tick(
        &mut self,
        sequence: SequenceId,
        playback: &mut PlaybackState,
        dt: f32,
        now: Instant,
    ) -> Result<FrameAdvance> {
        if let Some(config) = self.pending_config.take() {
            self.apply_config(config);
        }
        self.cache.begin_frame();

        self.drain_decodes(now);
        self.pump_uploads(now);

        let catalog = self
            .sequences
            .get(&sequence)
            .map(|open| Arc::clone(&open.catalog))
            .ok_or_else(|| Error::Streaming(format!("{} is not open", sequence)))?;

        self.refresh(&catalog, playback, now, false);
        if playback.is_buffering() && self.buffer_ready(&catalog, playback) {
            playback.end_buffering();
        }

        let step = playback.advance(dt);
        self.refresh(&catalog, playback, now, step.crossed);

        self.dispatch(now);
        self.publish_status(&catalog, playback);

        Ok(step)
    }

    /// Reevaluate when playback moved, was repositioned, or the scheduler asks
    fn refresh(&mut self, catalog: &VolumeCatalog, playback: &PlaybackState, now: Instant, crossed: bool) {
        let sequence = catalog.sequence();
        let Some(open) = self.sequences.get_mut(&sequence) else { return };

        let frame = playback.current_frame();
        let generation = playback.generation();
        let moved = open.last_frame != Some(frame) || open.last_generation != Some(generation);
        if !(crossed || moved || self.scheduler.wants_reevaluate(now)) {
            return;
        }

        open.last_frame = Some(frame);
        open.last_generation = Some(generation);
        self.scheduler.reevaluate(catalog, &self.cache, playback, now);
    }

    fn dispatch(&mut self, now: Instant) {
        for job in self.scheduler.dispatch(now) {
            let key = job.key;
            if !self.workers.submit(job) {
                let error = DecodeError::Worker("decode worker pool refused the job".into());
                self.scheduler.on_decode_failed(key, &error, now);
            }
        }
    }

    fn drain_decodes(&mut self, now: Instant) {
        for result in self.workers.poll_results() {
            let key = result.key;
            match result.outcome {
                DecodeOutcome::Decoded(grid) => match self.scheduler.on_decoded(key, now) {
                    Some(token) => {
                        if let Err(e) = self.uploads.submit(UploadJob { key, grid, token }) {
                            self.scheduler.on_upload_failed(key, &e, now);
                        }
                    }
                    None => log::trace!("Dropping decoded {}", key),
                },
                DecodeOutcome::Cancelled => self.scheduler.on_cancelled(key, now),
                DecodeOutcome::Failed(e) => self.scheduler.on_decode_failed(key, &e, now),
            }
        }
    }

    fn pump_uploads(&mut self, now: Instant) {
        for event in self.uploads.pump() {
            match event {
                UploadEvent::Published(key) => self.scheduler.on_published(key),
                UploadEvent::Failed { key, error } => self.scheduler.on_upload_failed(key, &error, now),
                UploadEvent::Cancelled(key) => self.scheduler.on_cancelled(key, now),
            }
        }
    }

    /// The current frame is resident and the next few frames are decoded
    /// (or will never arrive)
    fn buffer_ready(&self, catalog: &VolumeCatalog, playback: &PlaybackState) -> bool {
        let sequence = catalog.sequence();
        let current = playback.current_frame();
        if self.cache.resident_lods(sequence, current).is_empty() {
            return false;
        }

        let count = i64::from(catalog.frame_count());
        let direction = i64::from(playback.direction());
        (1..i64::from(self.config.buffering_frames)).all(|distance| {
            let mut frame = i64::from(current) + direction * distance;
            if playback.is_looping() {
                frame = frame.rem_euclid(count.max(1));
            } else if !(0..count).contains(&frame) {
                return true;
            }
            let frame = frame as u32;
            !self.cache.resident_lods(sequence, frame).is_empty()
                || self.scheduler.is_uploading_frame(sequence, frame)
                || !self.scheduler.has_outstanding_frame(sequence, frame)
        })
    }

    fn publish_status(&self, catalog: &VolumeCatalog, playback: &PlaybackState) {
        let stats = self.stats();
        self.board.update_stats(stats.cache, stats.streaming, stats.uploads);
        self.board
            .update_sequence(catalog.sequence(), SequenceSnapshot::new(catalog.name(), playback));

        let resident = self
            .cache
            .resident_keys()
            .into_iter()
            .map(|key| (key, FrameStatus::Resident));
        self.board.update_frames(resident.chain(self.scheduler.tracked_keys()));

        log::debug!(
            "{} frame {}: {} resident, {} pending, {} decoding, {} uploading",
            catalog.sequence(),
            playback.current_frame(),
            stats.cache.entries,
            stats.streaming.pending,
            stats.streaming.decoding,
            stats.streaming.uploading
        );
    }

    // --- Consumer side ---

    /// Finest resident LOD of a frame, pinned as current
    pub fn request_current_frame(&mut self, sequence: SequenceId, frame: u32) -> std::result::Result<FrameView, Unavailable> {
        let catalog = self
            .sequences
            .get(&sequence)
            .map(|open| Arc::clone(&open.catalog))
            .ok_or(Unavailable { sequence, frame })?;
        self.consumer.request_current_frame(&catalog, frame)
    }

    /// Ask for a key outside the playback window
    pub fn request(&mut self, key: FrameKey, now: Instant) -> RequestOutcome {
        let Some(open) = self.sequences.get(&key.sequence) else {
            return RequestOutcome::Failed;
        };
        let catalog = Arc::clone(&open.catalog);
        let outcome = self.scheduler.request(key, &catalog, &self.cache, now);
        self.dispatch(now);
        outcome
    }

    pub fn status(&self, key: FrameKey) -> FrameStatus {
        self.scheduler.status(key, &self.cache)
    }

    // --- Configuration ---

    /// Queue a configuration change for the next tick
    pub fn set_config(&mut self, config: StreamingConfig) -> std::result::Result<(), ConfigError> {
        config.validate()?;
        self.pending_config = Some(config);
        Ok(())
    }

    fn apply_config(&mut self, config: StreamingConfig) {
        if config.worker_count != self.workers.worker_count() {
            log::warn!(
                "Worker pool keeps {} threads; dispatch is limited to {}",
                self.workers.worker_count(),
                config.worker_count
            );
        }
        self.uploads.set_ceiling(config.memory_budget_bytes);
        self.cache.set_max_pinned(config.max_pinned);
        self.uploads.set_buffer_idle_ticks(config.buffer_idle_ticks);
        self.scheduler.set_config(config.clone());
        log::info!(
            "Applied streaming config: budget {} bytes, window {}",
            config.memory_budget_bytes,
            config.prefetch_window
        );
        self.config = config;
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    // --- Diagnostics ---

    pub fn stats(&self) -> StreamerStats {
        StreamerStats {
            cache: self.cache.stats(),
            streaming: self.scheduler.stats(),
            uploads: self.uploads.stats(),
            decode_in_progress: self.workers.pending_count(),
        }
    }

    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn cache(&self) -> &ResidentCache {
        &self.cache
    }

    pub fn runtime_handle(&self) -> Option<tokio::runtime::Handle> {
        self.workers.runtime_handle()
    }

    /// Serve the status board over TCP on the worker runtime
    pub fn start_debug_server(&self, port: u16) -> Result<DebugServer> {
        let runtime = self
            .runtime_handle()
            .ok_or_else(|| Error::Streaming("worker runtime is gone".into()))?;
        let handler = Arc::new(tokio::sync::Mutex::new(StatusBoardHandler::new(self.board.clone())));
        Ok(DebugServer::start(handler, port, &runtime)?)
    }
}
