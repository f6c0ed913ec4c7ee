//! Status board and debug command handler
//!
//! The streamer publishes a snapshot after every tick. The debug server
//! answers from that snapshot, so it never touches the cache or scheduler
//! directly.

use crate::streaming::cache::CacheStats;
use crate::streaming::key::{FrameKey, FrameStatus, SequenceId};
use crate::streaming::playback::{PlayMode, PlaybackState};
use crate::streaming::scheduler::StreamingStats;
use crate::streaming::upload::UploadStats;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use vdbstream_debug::{
    CacheStatsInfo, DebugCommand, DebugHandler, DebugResponse, ResponseData, SequenceInfo, SequenceSummary,
    StreamingStatsInfo,
};

/// Per-sequence part of the snapshot
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SequenceSnapshot {
    pub name: String,
    pub frame_count: u32,
    pub frame_rate: f32,
    pub current_frame: u32,
    pub mode: PlayMode,
    pub buffering: bool,
    pub looping: bool,
    pub speed: f32,
}

impl SequenceSnapshot {
    pub fn new(name: &str, playback: &PlaybackState) -> Self {
        Self {
            name: name.to_string(),
            frame_count: playback.frame_count(),
            frame_rate: playback.frame_rate(),
            current_frame: playback.current_frame(),
            mode: playback.mode(),
            buffering: playback.is_buffering(),
            looping: playback.is_looping(),
            speed: playback.speed(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub cache: CacheStats,
    pub streaming: StreamingStats,
    pub uploads: UploadStats,
    pub sequences: BTreeMap<SequenceId, SequenceSnapshot>,
    /// Every key that is not `Unknown`
    pub frames: HashMap<FrameKey, FrameStatus>,
}

impl StatusSnapshot {
    pub fn frame_status(&self, key: FrameKey) -> FrameStatus {
        self.frames.get(&key).copied().unwrap_or(FrameStatus::Unknown)
    }
}

/// Shared, lock-protected status snapshot
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<Mutex<StatusSnapshot>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatusSnapshot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn update_stats(&self, cache: CacheStats, streaming: StreamingStats, uploads: UploadStats) {
        let mut snapshot = self.lock();
        snapshot.cache = cache;
        snapshot.streaming = streaming;
        snapshot.uploads = uploads;
    }

    pub fn update_sequence(&self, sequence: SequenceId, info: SequenceSnapshot) {
        self.lock().sequences.insert(sequence, info);
    }

    /// Replace the key table
    pub fn update_frames(&self, frames: impl IntoIterator<Item = (FrameKey, FrameStatus)>) {
        let mut snapshot = self.lock();
        snapshot.frames.clear();
        for (key, status) in frames {
            // Resident wins over anything the scheduler still tracks
            let entry = snapshot.frames.entry(key).or_insert(status);
            if status == FrameStatus::Resident {
                *entry = status;
            }
        }
    }

    pub fn remove_sequence(&self, sequence: SequenceId) {
        let mut snapshot = self.lock();
        snapshot.sequences.remove(&sequence);
        snapshot.frames.retain(|key, _| key.sequence != sequence);
    }

    pub fn frame_status(&self, key: FrameKey) -> FrameStatus {
        self.lock().frame_status(key)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().clone()
    }
}

fn status_name(status: FrameStatus) -> &'static str {
    match status {
        FrameStatus::Resident => "resident",
        FrameStatus::Pending => "pending",
        FrameStatus::Failed => "failed",
        FrameStatus::Unknown => "unknown",
    }
}

fn mode_name(mode: PlayMode) -> &'static str {
    match mode {
        PlayMode::Playing => "playing",
        PlayMode::Paused => "paused",
        PlayMode::Stopped => "stopped",
    }
}

/// Answers debug commands from a [`StatusBoard`]
pub struct StatusBoardHandler {
    board: StatusBoard,
}

impl StatusBoardHandler {
    pub fn new(board: StatusBoard) -> Self {
        Self { board }
    }
}

impl DebugHandler for StatusBoardHandler {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse {
        let snapshot = self.board.snapshot();

        match cmd {
            DebugCommand::Ping => DebugResponse::pong(),

            DebugCommand::GetFrameStatus { sequence, frame, lod } => {
                let status = snapshot.frame_status(FrameKey::new(SequenceId(sequence), frame, lod));
                DebugResponse::ok(ResponseData::FrameStatus {
                    sequence,
                    frame,
                    lod,
                    frame_status: status_name(status).into(),
                })
            }

            DebugCommand::GetCacheStats => {
                let c = snapshot.cache;
                DebugResponse::ok(ResponseData::CacheStats(CacheStatsInfo {
                    entries: c.entries,
                    pinned: c.pinned,
                    held: c.held,
                    charged_bytes: c.charged_bytes,
                    reserved_bytes: c.reserved_bytes,
                    ceiling_bytes: c.ceiling_bytes,
                    requested_ceiling_bytes: c.requested_ceiling_bytes,
                    pressure: c.pressure,
                    hits: c.hits,
                    misses: c.misses,
                    evictions: c.evictions,
                    rejections: c.rejections,
                }))
            }

            DebugCommand::GetStreamingStats => {
                let s = snapshot.streaming;
                let u = snapshot.uploads;
                DebugResponse::ok(ResponseData::StreamingStats(StreamingStatsInfo {
                    issued: s.issued,
                    coalesced: s.coalesced,
                    cancelled: s.cancelled,
                    dispatched: s.dispatched,
                    completed: s.completed,
                    failed: s.failed,
                    rejected: s.rejected,
                    demoted: s.demoted,
                    pending: s.pending,
                    decoding: s.decoding,
                    uploading: s.uploading,
                    uploads_queued: u.queued,
                    uploads_transferring: u.transferring,
                    buffers_parked: u.pool.parked,
                    buffers_reused: u.pool.reused,
                }))
            }

            DebugCommand::GetSequenceInfo { sequence } => {
                let id = SequenceId(sequence);
                let Some(info) = snapshot.sequences.get(&id) else {
                    return DebugResponse::error(format!("No open sequence {}", sequence));
                };

                let mut resident: Vec<(u32, u8)> = Vec::new();
                let mut failed_frames: Vec<u32> = Vec::new();
                for (key, status) in snapshot.frames.iter().filter(|(k, _)| k.sequence == id) {
                    match status {
                        FrameStatus::Resident => resident.push((key.frame, key.lod)),
                        FrameStatus::Failed => failed_frames.push(key.frame),
                        _ => {}
                    }
                }
                resident.sort_unstable();
                failed_frames.sort_unstable();
                failed_frames.dedup();

                DebugResponse::ok(ResponseData::SequenceInfo(SequenceInfo {
                    sequence,
                    name: info.name.clone(),
                    frame_count: info.frame_count,
                    frame_rate: info.frame_rate,
                    current_frame: info.current_frame,
                    play_mode: mode_name(info.mode).into(),
                    buffering: info.buffering,
                    looping: info.looping,
                    speed: info.speed,
                    resident,
                    failed_frames,
                }))
            }

            DebugCommand::ListSequences => DebugResponse::ok(ResponseData::Sequences {
                sequences: snapshot
                    .sequences
                    .iter()
                    .map(|(id, info)| SequenceSummary {
                        sequence: id.0,
                        name: info.name.clone(),
                        frame_count: info.frame_count,
                    })
                    .collect(),
            }),
        }
    }
}
