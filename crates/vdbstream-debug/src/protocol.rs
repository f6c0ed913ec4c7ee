//! Debug protocol - JSON command/response definitions

use serde::{Deserialize, Serialize};

/// Commands sent by a debug client, one JSON object per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum DebugCommand {
    /// Status of one (sequence, frame, LOD) key
    GetFrameStatus { sequence: u32, frame: u32, lod: u8 },
    /// Residency cache counters and budget
    GetCacheStats,
    /// Scheduler and upload counters
    GetStreamingStats,
    /// Playback and residency summary of one open sequence
    GetSequenceInfo { sequence: u32 },
    /// Open sequences
    ListSequences,
    /// Ping (health check)
    Ping,
}

/// Responses from debug server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DebugResponse {
    #[serde(rename = "ok")]
    Ok { data: ResponseData },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    None,
    Pong { message: String },
    FrameStatus {
        sequence: u32,
        frame: u32,
        lod: u8,
        /// "resident", "pending", "failed" or "unknown"
        frame_status: String,
    },
    CacheStats(CacheStatsInfo),
    StreamingStats(StreamingStatsInfo),
    SequenceInfo(SequenceInfo),
    Sequences { sequences: Vec<SequenceSummary> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatsInfo {
    pub entries: usize,
    pub pinned: usize,
    pub held: usize,
    pub charged_bytes: u64,
    pub reserved_bytes: u64,
    pub ceiling_bytes: u64,
    pub requested_ceiling_bytes: u64,
    pub pressure: f32,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejections: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingStatsInfo {
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
    pub uploads_queued: usize,
    pub uploads_transferring: usize,
    pub buffers_parked: usize,
    pub buffers_reused: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub sequence: u32,
    pub name: String,
    pub frame_count: u32,
    pub frame_rate: f32,
    pub current_frame: u32,
    /// "playing", "paused" or "stopped"
    pub play_mode: String,
    pub buffering: bool,
    pub looping: bool,
    pub speed: f32,
    /// Resident (frame, lod) pairs
    pub resident: Vec<(u32, u8)>,
    /// Frames whose last attempt failed
    pub failed_frames: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceSummary {
    pub sequence: u32,
    pub name: String,
    pub frame_count: u32,
}

impl DebugResponse {
    pub fn ok(data: ResponseData) -> Self {
        Self::Ok { data }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error {
            message: msg.into(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(ResponseData::Pong {
            message: "pong".into(),
        })
    }

    pub fn none() -> Self {
        Self::ok(ResponseData::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let cmd: DebugCommand =
            serde_json::from_str(r#"{"cmd":"GetFrameStatus","params":{"sequence":1,"frame":5,"lod":2}}"#)
                .expect("valid command");
        assert_eq!(cmd, DebugCommand::GetFrameStatus { sequence: 1, frame: 5, lod: 2 });

        let cmd: DebugCommand = serde_json::from_str(r#"{"cmd":"Ping"}"#).expect("valid command");
        assert_eq!(cmd, DebugCommand::Ping);
    }

    #[test]
    fn test_response_wire_format() {
        let json = serde_json::to_string(&DebugResponse::pong()).expect("serializes");
        assert_eq!(json, r#"{"status":"ok","data":{"message":"pong"}}"#);

        let json = serde_json::to_string(&DebugResponse::error("no such sequence")).expect("serializes");
        assert_eq!(json, r#"{"status":"error","message":"no such sequence"}"#);
    }

    #[test]
    fn test_untagged_data_parses_back() {
        let response = DebugResponse::ok(ResponseData::FrameStatus {
            sequence: 0,
            frame: 3,
            lod: 1,
            frame_status: "resident".into(),
        });
        let json = serde_json::to_string(&response).expect("serializes");
        let parsed: DebugResponse = serde_json::from_str(&json).expect("parses");
        assert_eq!(parsed, response);

        let response = DebugResponse::ok(ResponseData::CacheStats(CacheStatsInfo {
            entries: 4,
            charged_bytes: 4096,
            ..Default::default()
        }));
        let json = serde_json::to_string(&response).expect("serializes");
        let parsed: DebugResponse = serde_json::from_str(&json).expect("parses");
        assert_eq!(parsed, response);
    }
}
