//! Streaming of time-varying sparse volumes into GPU memory
//!
//! Data flows catalog -> scheduler -> decode workers -> upload pipeline ->
//! residency cache -> render consumer. [`VolumeStreamer`] drives the whole
//! chain from one `tick` per frame.

pub mod key;
pub mod catalog;
pub mod config;
pub mod disk_io;
pub mod priority;
pub mod lod;
pub mod scheduler;
pub mod worker;
pub mod budget;
pub mod buffer_pool;
pub mod cache;
pub mod upload;
pub mod consumer;
pub mod playback;
pub mod diagnostics;
pub mod manager;

pub use key::{FrameKey, FrameStatus, SequenceId};
pub use catalog::{CatalogError, GridBlobRef, SequenceManifest, VolumeCatalog};
pub use config::{ConfigError, StreamingConfig};
pub use disk_io::{
    DecodeError, DecodedGrid, FileGridSource, GridRecord, GridSource, SequenceWriter,
    compress_grid, decompress_grid,
};
pub use priority::CancelToken;
pub use lod::LodPolicy;
pub use scheduler::{RequestOutcome, StreamingScheduler, StreamingStats};
pub use worker::DecodeWorkerPool;
pub use budget::MemoryBudget;
pub use buffer_pool::{BufferPool, GpuBuffer};
pub use cache::{CacheError, CacheStats, ResidentCache, ResidentGrid, ResidentHandle};
pub use upload::{HostBackend, TransferError, UploadBackend, UploadPipeline, WgpuBackend};
pub use consumer::{FrameView, RenderConsumer, Unavailable};
pub use playback::{PlayMode, PlaybackState};
pub use diagnostics::{StatusBoard, StatusBoardHandler};
pub use manager::{StreamerStats, VolumeStreamer};
