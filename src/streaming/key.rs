//! Identifiers for streamable units

use serde::{Deserialize, Serialize};

/// Opaque identifier for one open volume animation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceId(pub u32);

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seq#{}", self.0)
    }
}

/// One streamable unit: a frame of a sequence at a given LOD level.
///
/// LOD levels ascend with detail: level 0 is the coarsest representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameKey {
    pub sequence: SequenceId,
    pub frame: u32,
    pub lod: u8,
}

impl FrameKey {
    pub fn new(sequence: SequenceId, frame: u32, lod: u8) -> Self {
        Self { sequence, frame, lod }
    }

    /// Same frame at another LOD level
    pub fn with_lod(self, lod: u8) -> Self {
        Self { lod, ..self }
    }
}

impl std::fmt::Display for FrameKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/frame {}/lod {}", self.sequence, self.frame, self.lod)
    }
}

/// Best-effort status of a key, for diagnostics and UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameStatus {
    /// Published in the residency cache
    Resident,
    /// Queued, decoding or uploading
    Pending,
    /// Last attempt failed (cooling down, or permanently rejected)
    Failed,
    /// Never requested, evicted, or cancelled
    Unknown,
}
