//! Grid blob codec and the grid source seam
//!
//! A sequence data file is a plain concatenation of grid blobs. Each blob is
//! an LZ4 block (size prepended) wrapping an rkyv archive of [`GridRecord`].
//! The tree payload is opaque to this crate: the codec library that owns the
//! sparse-grid layout produces it and the renderer samples it.

use crate::math::Aabb;
use crate::streaming::catalog::{GridBlobRef, LodEntry, FrameEntry, SequenceManifest, MANIFEST_VERSION};
use rkyv::{Archive, Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// An LZ4 block never expands its input by more than this factor
const LZ4_MAX_RATIO: u64 = 255;

/// Decoded archives may exceed the manifest's size estimate by this factor
const ARCHIVE_SIZE_FACTOR: u64 = 4;

/// Estimates below this are not trusted to bound an archive
const MIN_ARCHIVE_LIMIT: u64 = 64 * 1024;

/// Errors produced while reading or decoding a grid blob
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("blob truncated: expected {expected} bytes at offset {offset}")]
    Truncated { offset: u64, expected: u64 },

    #[error("corrupt grid blob: {0}")]
    Corrupt(String),

    #[error("decode worker failed: {0}")]
    Worker(String),
}

/// Serializable grid record, the unit stored per (frame, LOD)
#[derive(Debug, Clone, PartialEq, Archive, Deserialize, Serialize)]
pub struct GridRecord {
    pub bounds_min: [f32; 3],
    pub bounds_max: [f32; 3],
    pub active_voxel_count: u64,
    /// Opaque sparse tree payload
    pub tree: Vec<u8>,
}

/// In-memory sparse grid produced by a [`GridSource`]
///
/// Never mutated after decode; ownership moves from the worker to the upload
/// pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedGrid {
    pub bounds: Aabb,
    pub active_voxel_count: u64,
    pub tree: Vec<u8>,
}

impl DecodedGrid {
    /// Build a decoded grid from a record.
    ///
    /// Grids without active voxels get a unit bounding box so downstream
    /// consumers never see a degenerate volume.
    pub fn from_record(record: GridRecord) -> Self {
        let bounds = if record.active_voxel_count == 0 {
            Aabb::unit()
        } else {
            Aabb::from_arrays(record.bounds_min, record.bounds_max)
        };
        Self {
            bounds,
            active_voxel_count: record.active_voxel_count,
            tree: record.tree,
        }
    }

    /// Size of the tree payload in bytes
    pub fn payload_len(&self) -> u64 {
        self.tree.len() as u64
    }
}

/// Source of decoded grids: reads a byte range and decodes it.
///
/// Split in two steps so cancellation can be observed between I/O and
/// decode. Implementations are stateless per call and shared across workers.
pub trait GridSource: Send + Sync + 'static {
    /// Read the raw compressed bytes of a blob
    fn read(&self, blob: &GridBlobRef) -> Result<Vec<u8>, DecodeError>;

    /// Decode raw bytes previously returned by [`GridSource::read`]
    fn decode(&self, blob: &GridBlobRef, bytes: &[u8]) -> Result<DecodedGrid, DecodeError>;
}

/// Grid source reading LZ4/rkyv blobs from sequence data files
#[derive(Debug, Default, Clone, Copy)]
pub struct FileGridSource;

impl GridSource for FileGridSource {
    fn read(&self, blob: &GridBlobRef) -> Result<Vec<u8>, DecodeError> {
        read_blob(blob)
    }

    fn decode(&self, blob: &GridBlobRef, bytes: &[u8]) -> Result<DecodedGrid, DecodeError> {
        let limit = blob
            .uncompressed_size
            .saturating_mul(ARCHIVE_SIZE_FACTOR)
            .max(MIN_ARCHIVE_LIMIT);
        decompress_grid_within(bytes, limit).map(DecodedGrid::from_record)
    }
}

/// Read the byte range of a blob from its data file
pub fn read_blob(blob: &GridBlobRef) -> Result<Vec<u8>, DecodeError> {
    let io_err = |source| DecodeError::Io { path: blob.path.to_path_buf(), source };

    let mut file = File::open(&*blob.path).map_err(io_err)?;
    let file_len = file.metadata().map_err(io_err)?.len();
    let truncated = DecodeError::Truncated { offset: blob.offset, expected: blob.length };
    // The range is checked against the file before anything is allocated
    match blob.offset.checked_add(blob.length) {
        Some(end) if end <= file_len => {}
        _ => return Err(truncated),
    }
    let length = usize::try_from(blob.length).map_err(|_| truncated)?;
    file.seek(SeekFrom::Start(blob.offset)).map_err(io_err)?;

    let mut bytes = vec![0u8; length];
    match file.read_exact(&mut bytes) {
        Ok(()) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(DecodeError::Truncated {
            offset: blob.offset,
            expected: blob.length,
        }),
        Err(e) => Err(io_err(e)),
    }
}

/// Serialize a grid record to bytes (uncompressed)
pub fn serialize_grid(record: &GridRecord) -> Result<Vec<u8>, io::Error> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(record)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(bytes.to_vec())
}

/// Deserialize a grid record from bytes (uncompressed)
pub fn deserialize_grid(data: &[u8]) -> Result<GridRecord, DecodeError> {
    // Archives must be read from aligned storage
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(data.len());
    aligned.extend_from_slice(data);

    rkyv::from_bytes::<GridRecord, rkyv::rancor::Error>(&aligned)
        .map_err(|e| DecodeError::Corrupt(e.to_string()))
}

/// Serialize and compress a grid record using LZ4
pub fn compress_grid(record: &GridRecord) -> Result<Vec<u8>, io::Error> {
    let serialized = serialize_grid(record)?;
    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress and deserialize a grid record
pub fn decompress_grid(data: &[u8]) -> Result<GridRecord, DecodeError> {
    decompress_grid_within(data, u64::MAX)
}

/// Decompress and deserialize a grid record whose archive claims at most
/// `limit` bytes.
///
/// The size prepended to the LZ4 block is checked before it is allocated; a
/// claim above `limit` or above what LZ4 can expand `data` to is corrupt.
pub fn decompress_grid_within(data: &[u8], limit: u64) -> Result<GridRecord, DecodeError> {
    let Some(prefix) = data.first_chunk::<4>() else {
        return Err(DecodeError::Corrupt("blob shorter than its size prefix".into()));
    };
    let claimed = u64::from(u32::from_le_bytes(*prefix));
    let expandable = (data.len() as u64 - 4).saturating_mul(LZ4_MAX_RATIO);
    if claimed > limit.min(expandable) {
        return Err(DecodeError::Corrupt(format!(
            "blob claims {} decompressed bytes from {} compressed",
            claimed,
            data.len()
        )));
    }

    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| DecodeError::Corrupt(format!("LZ4 decompression failed: {}", e)))?;
    deserialize_grid(&decompressed)
}

/// Appends grid blobs to a sequence data file and records the manifest table
pub struct SequenceWriter {
    file: File,
    data_path: PathBuf,
    offset: u64,
    frames: Vec<FrameEntry>,
}

impl SequenceWriter {
    /// Create (or truncate) the data file
    pub fn create(data_path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = data_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(data_path)?;
        Ok(Self {
            file,
            data_path: data_path.to_path_buf(),
            offset: 0,
            frames: Vec::new(),
        })
    }

    /// Append an already-compressed blob for (frame, level)
    pub fn append_blob(
        &mut self,
        frame: u32,
        level: u8,
        blob: &[u8],
        uncompressed_size: u64,
    ) -> Result<LodEntry, io::Error> {
        self.file.write_all(blob)?;

        let entry = LodEntry {
            level,
            offset: self.offset,
            length: blob.len() as u64,
            uncompressed_size,
        };
        self.offset += blob.len() as u64;

        match self.frames.iter_mut().find(|f| f.index == frame) {
            Some(existing) => existing.lods.push(entry.clone()),
            None => self.frames.push(FrameEntry { index: frame, lods: vec![entry.clone()] }),
        }

        Ok(entry)
    }

    /// Compress and append a grid record
    pub fn append_grid(&mut self, frame: u32, level: u8, record: &GridRecord) -> Result<LodEntry, io::Error> {
        let blob = compress_grid(record)?;
        let uncompressed = crate::streaming::upload::gpu_layout_size(record.tree.len() as u64);
        self.append_blob(frame, level, &blob, uncompressed)
    }

    /// Flush the data file and build the manifest describing it
    pub fn finish(mut self, name: &str, frame_rate: f32) -> Result<SequenceManifest, io::Error> {
        self.file.flush()?;
        self.frames.sort_by_key(|f| f.index);

        let data_file = self
            .data_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(SequenceManifest {
            version: MANIFEST_VERSION,
            name: name.to_string(),
            frame_rate,
            data_file,
            frames: self.frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_record(voxels: u64, payload: usize) -> GridRecord {
        GridRecord {
            bounds_min: [-1.0, 0.0, -1.0],
            bounds_max: [1.0, 2.0, 1.0],
            active_voxel_count: voxels,
            tree: (0..payload).map(|i| (i % 251) as u8).collect(),
        }
    }

    #[test]
    fn test_compress_decompress_grid() {
        let record = make_record(500, 4096);

        let compressed = compress_grid(&record).expect("compression failed");
        assert!(!compressed.is_empty());

        let decoded = decompress_grid(&compressed).expect("decompression failed");
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_empty_grid_gets_unit_bounds() {
        let grid = DecodedGrid::from_record(make_record(0, 16));
        assert_eq!(grid.bounds, Aabb::unit());

        let grid = DecodedGrid::from_record(make_record(10, 16));
        assert_eq!(grid.bounds.min.y, 0.0);
        assert_eq!(grid.bounds.max.y, 2.0);
    }

    #[test]
    fn test_corrupt_blob_is_rejected() {
        let record = make_record(10, 256);
        let mut compressed = compress_grid(&record).expect("compression failed");
        // Damage everything past the size prefix
        for b in compressed.iter_mut().skip(4) {
            *b = 0xAB;
        }

        assert!(matches!(decompress_grid(&compressed), Err(DecodeError::Corrupt(_))));
        assert!(matches!(decompress_grid(&[1, 2]), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn test_writer_and_read_blob() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let data_path = temp_dir.path().join("seq.vdbs");

        let mut writer = SequenceWriter::create(&data_path).expect("create failed");
        let first = writer.append_grid(0, 0, &make_record(5, 64)).expect("append failed");
        let second = writer.append_grid(0, 1, &make_record(50, 512)).expect("append failed");
        let manifest = writer.finish("test", 30.0).expect("finish failed");

        assert_eq!(second.offset, first.length);
        assert_eq!(manifest.frames.len(), 1);
        assert_eq!(manifest.frames[0].lods.len(), 2);
        assert_eq!(manifest.data_file, "seq.vdbs");

        let blob = GridBlobRef {
            path: Arc::new(data_path),
            offset: second.offset,
            length: second.length,
            uncompressed_size: second.uncompressed_size,
        };
        let source = FileGridSource;
        let bytes = source.read(&blob).expect("read failed");
        let grid = source.decode(&blob, &bytes).expect("decode failed");
        assert_eq!(grid.active_voxel_count, 50);
        assert_eq!(grid.payload_len(), 512);
    }

    #[test]
    fn test_read_past_end_is_truncated() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let data_path = temp_dir.path().join("short.vdbs");
        std::fs::write(&data_path, [0u8; 8]).expect("write failed");

        let blob = GridBlobRef {
            path: Arc::new(data_path),
            offset: 4,
            length: 64,
            uncompressed_size: 0,
        };
        assert!(matches!(read_blob(&blob), Err(DecodeError::Truncated { offset: 4, expected: 64 })));
    }

    #[test]
    fn test_length_beyond_file_is_truncated_without_allocating() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let data_path = temp_dir.path().join("short.vdbs");
        std::fs::write(&data_path, [0u8; 8]).expect("write failed");

        let blob = GridBlobRef {
            path: Arc::new(data_path),
            offset: 0,
            length: 1 << 40,
            uncompressed_size: 0,
        };
        assert!(matches!(read_blob(&blob), Err(DecodeError::Truncated { expected, .. }) if expected == 1 << 40));

        let overflowing = GridBlobRef { offset: u64::MAX, length: 2, ..blob };
        assert!(matches!(read_blob(&overflowing), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_oversized_size_prefix_is_corrupt() {
        // Claims 4 GiB from a handful of bytes
        let mut blob = vec![0xFF, 0xFF, 0xFF, 0xFF];
        blob.extend_from_slice(&[0x10; 12]);
        assert!(matches!(decompress_grid(&blob), Err(DecodeError::Corrupt(_))));
        assert!(matches!(decompress_grid(&[1, 0]), Err(DecodeError::Corrupt(_))));

        // Within LZ4's reach but beyond what the manifest allows
        let compressed = compress_grid(&make_record(10, 200_000)).expect("compression failed");
        assert!(decompress_grid(&compressed).is_ok());
        assert!(matches!(decompress_grid_within(&compressed, 1024), Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let blob = GridBlobRef {
            path: Arc::new(PathBuf::from("/nonexistent/vdbstream/none.vdbs")),
            offset: 0,
            length: 1,
            uncompressed_size: 0,
        };
        assert!(matches!(read_blob(&blob), Err(DecodeError::Io { .. })));
    }
}
