//! Volume catalog: frame/LOD table of one sequence
//!
//! Built once from a manifest when a sequence is opened and read-only
//! afterwards, so a catalog is shared between the scheduler and the worker
//! pool behind an `Arc` without locking.

use crate::streaming::key::{FrameKey, SequenceId};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Current manifest version
pub const MANIFEST_VERSION: u32 = 1;

/// Playback rate assumed when a manifest does not specify one
pub const DEFAULT_FRAME_RATE: f32 = 30.0;

/// Catalog lookup and loading errors
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no entry for {0}")]
    NotFound(FrameKey),

    #[error("manifest IO error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

/// Location of one compressed grid blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridBlobRef {
    /// Data file holding the blob
    pub path: Arc<PathBuf>,
    pub offset: u64,
    pub length: u64,
    /// Estimated size of the GPU-resident form
    pub uncompressed_size: u64,
}

/// One LOD of a frame as listed in the manifest
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LodEntry {
    pub level: u8,
    pub offset: u64,
    pub length: u64,
    pub uncompressed_size: u64,
}

/// One frame as listed in the manifest
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FrameEntry {
    pub index: u32,
    pub lods: Vec<LodEntry>,
}

/// Manifest file data (serialized as JSON for easy inspection)
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SequenceManifest {
    pub version: u32,
    pub name: String,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f32,
    /// Data file, relative to the manifest directory unless absolute
    pub data_file: String,
    pub frames: Vec<FrameEntry>,
}

fn default_frame_rate() -> f32 {
    DEFAULT_FRAME_RATE
}

impl SequenceManifest {
    /// Write the manifest as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[derive(Debug)]
struct CatalogFrame {
    /// Sorted by ascending level (coarse to fine)
    levels: Vec<u8>,
    entries: Vec<LodEntry>,
}

/// Read-only frame → LOD → byte range table for one sequence
#[derive(Debug)]
pub struct VolumeCatalog {
    name: String,
    sequence: SequenceId,
    data_path: Arc<PathBuf>,
    frame_rate: f32,
    frames: BTreeMap<u32, CatalogFrame>,
}

impl VolumeCatalog {
    /// Build a catalog from a parsed manifest.
    ///
    /// `base_dir` resolves a relative `data_file`.
    pub fn from_manifest(
        sequence: SequenceId,
        manifest: SequenceManifest,
        base_dir: &Path,
    ) -> Result<Self, CatalogError> {
        if manifest.version != MANIFEST_VERSION {
            return Err(CatalogError::UnsupportedVersion(manifest.version));
        }
        if !(manifest.frame_rate > 0.0) {
            return Err(CatalogError::Invalid(format!("frame rate {}", manifest.frame_rate)));
        }

        let data_file = PathBuf::from(&manifest.data_file);
        let data_path = if data_file.is_absolute() { data_file } else { base_dir.join(data_file) };

        let mut frames = BTreeMap::new();
        for frame in manifest.frames {
            // Frame counts must fit in a u32
            if frame.index == u32::MAX {
                return Err(CatalogError::Invalid(format!("frame index {} out of range", frame.index)));
            }
            if frame.lods.is_empty() {
                log::warn!("{}: frame {} lists no LODs, skipping", manifest.name, frame.index);
                continue;
            }

            let mut entries = frame.lods;
            entries.sort_by_key(|e| e.level);
            if entries.windows(2).any(|w| w[0].level == w[1].level) {
                return Err(CatalogError::Invalid(format!(
                    "frame {} lists a LOD level twice",
                    frame.index
                )));
            }

            let levels = entries.iter().map(|e| e.level).collect();
            if frames.insert(frame.index, CatalogFrame { levels, entries }).is_some() {
                return Err(CatalogError::Invalid(format!("frame {} listed twice", frame.index)));
            }
        }

        log::info!(
            "Catalog {} ({}): {} frames @ {} fps",
            manifest.name, sequence, frames.len(), manifest.frame_rate
        );

        Ok(Self {
            name: manifest.name,
            sequence,
            data_path: Arc::new(data_path),
            frame_rate: manifest.frame_rate,
            frames,
        })
    }

    /// Load a manifest from disk
    pub fn load(sequence: SequenceId, manifest_path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(manifest_path)?;
        let manifest: SequenceManifest = serde_json::from_str(&json)?;
        let base_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_manifest(sequence, manifest, base_dir)
    }

    /// Resolve a key to its blob location
    pub fn resolve(&self, key: FrameKey) -> Result<GridBlobRef, CatalogError> {
        if key.sequence != self.sequence {
            return Err(CatalogError::NotFound(key));
        }

        let entry = self
            .frames
            .get(&key.frame)
            .and_then(|f| f.entries.iter().find(|e| e.level == key.lod))
            .ok_or(CatalogError::NotFound(key))?;

        Ok(GridBlobRef {
            path: Arc::clone(&self.data_path),
            offset: entry.offset,
            length: entry.length,
            uncompressed_size: entry.uncompressed_size,
        })
    }

    /// Available LOD levels of a frame, ascending detail. Empty if the frame is unknown.
    pub fn lods(&self, frame: u32) -> &[u8] {
        self.frames.get(&frame).map(|f| f.levels.as_slice()).unwrap_or(&[])
    }

    /// Estimated resident size of (frame, level)
    pub fn size_estimate(&self, frame: u32, level: u8) -> Option<u64> {
        self.frames
            .get(&frame)?
            .entries
            .iter()
            .find(|e| e.level == level)
            .map(|e| e.uncompressed_size)
    }

    /// Finest available level not above `desired`, else the coarsest level above it
    pub fn nearest_lod(&self, frame: u32, desired: u8) -> Option<u8> {
        let levels = self.lods(frame);
        levels
            .iter()
            .rev()
            .find(|&&l| l <= desired)
            .or_else(|| levels.first())
            .copied()
    }

    pub fn contains_frame(&self, frame: u32) -> bool {
        self.frames.contains_key(&frame)
    }

    /// Number of frames in the sequence (highest index + 1)
    pub fn frame_count(&self) -> u32 {
        self.frames.keys().next_back().map(|&i| i + 1).unwrap_or(0)
    }

    /// Largest resident size estimate over every frame and level
    pub fn max_frame_bytes(&self) -> u64 {
        self.frames
            .values()
            .flat_map(|f| f.entries.iter())
            .map(|e| e.uncompressed_size)
            .max()
            .unwrap_or(0)
    }

    pub fn frame_rate(&self) -> f32 {
        self.frame_rate
    }

    /// Time between two consecutive frames
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.frame_rate)
    }

    /// Playback length: the span from the first to the last frame
    pub fn duration_secs(&self) -> f32 {
        (self.frame_count().max(1) - 1) as f32 / self.frame_rate
    }

    /// Frame shown at `seconds` of animation time
    pub fn frame_index_from_time(&self, seconds: f32) -> u32 {
        let last = self.frame_count().saturating_sub(1);
        let index = (seconds.max(0.0) * self.frame_rate).floor() as u32;
        index.min(last)
    }

    pub fn sequence(&self) -> SequenceId {
        self.sequence
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }
}
