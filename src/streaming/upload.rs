//! Upload pipeline: decoded grids to GPU-resident buffers
//!
//! A decoded grid is laid out as a [`GridGpuHeader`] followed by its tree
//! payload, written into one of two staging slots and copied into its
//! destination buffer. The grid becomes visible in the cache only after the
//! transfer fence signals, so the renderer never samples a half-written
//! buffer and an in-flight copy never waits on a frame being rendered.

use crate::streaming::buffer_pool::{BufferPool, BufferPoolStats, GpuBuffer};
use crate::streaming::cache::{CacheError, GridInfo, Reservation, ResidentCache};
use crate::streaming::disk_io::DecodedGrid;
use crate::streaming::key::{FrameKey, SequenceId};
use crate::streaming::priority::CancelToken;
use bytemuck::{Pod, Zeroable};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Staging slots: one being filled while the other is in flight
pub const STAGING_SLOTS: usize = 2;

/// "VDBG" little-endian
pub const GPU_HEADER_MAGIC: u32 = u32::from_le_bytes(*b"VDBG");

/// Size of the header preceding the tree payload
pub const GPU_HEADER_SIZE: u64 = std::mem::size_of::<GridGpuHeader>() as u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("{0} is already in the upload pipeline")]
    AlreadyInFlight(FrameKey),

    #[error("out of device memory allocating {requested} bytes")]
    OutOfDeviceMemory { requested: u64 },

    #[error("device error: {0}")]
    Device(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl TransferError {
    /// Whether retrying the same key can never succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransferError::Cache(e) if e.is_permanent())
    }
}

/// Header of a grid in GPU memory
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GridGpuHeader {
    pub bounds_min: [f32; 3],
    pub lod: u32,
    pub bounds_max: [f32; 3],
    pub frame: u32,
    pub active_voxels_lo: u32,
    pub active_voxels_hi: u32,
    pub payload_len: u32,
    pub magic: u32,
}

impl GridGpuHeader {
    pub fn active_voxel_count(&self) -> u64 {
        (u64::from(self.active_voxels_hi) << 32) | u64::from(self.active_voxels_lo)
    }
}

/// Bytes a grid occupies on the GPU, given its tree payload size
pub fn gpu_layout_size(payload_len: u64) -> u64 {
    (GPU_HEADER_SIZE + payload_len).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

/// Build the GPU layout of a decoded grid
pub fn encode_gpu_layout(key: FrameKey, grid: &DecodedGrid) -> Result<Vec<u8>, TransferError> {
    let payload_len = u32::try_from(grid.tree.len())
        .map_err(|_| TransferError::Device(format!("{} payload of {} bytes exceeds 4 GiB", key, grid.tree.len())))?;

    let header = GridGpuHeader {
        bounds_min: grid.bounds.min.to_array(),
        lod: u32::from(key.lod),
        bounds_max: grid.bounds.max.to_array(),
        frame: key.frame,
        active_voxels_lo: grid.active_voxel_count as u32,
        active_voxels_hi: (grid.active_voxel_count >> 32) as u32,
        payload_len,
        magic: GPU_HEADER_MAGIC,
    };

    let size = gpu_layout_size(grid.payload_len()) as usize;
    let mut bytes = Vec::with_capacity(size);
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    bytes.extend_from_slice(&grid.tree);
    bytes.resize(size, 0);
    Ok(bytes)
}

/// Completion flag of a submitted transfer
#[derive(Debug, Clone, Default)]
pub struct Fence(Arc<AtomicBool>);

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Device side of the pipeline
pub trait UploadBackend: Send {
    /// Allocate a destination buffer of `size` bytes
    fn allocate(&mut self, size: u64) -> Result<GpuBuffer, TransferError>;

    /// Write `bytes` into staging slot `slot` and copy them to the start of `dst`
    fn begin_transfer(&mut self, slot: usize, bytes: &[u8], dst: &mut GpuBuffer) -> Result<Fence, TransferError>;

    /// Give completed transfers a chance to signal. Never blocks.
    fn poll(&mut self);

    /// Return a destination buffer to the device
    fn release(&mut self, buffer: GpuBuffer);
}

/// Backend uploading through a wgpu queue
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    staging: [Option<wgpu::Buffer>; STAGING_SLOTS],
}

impl WgpuBackend {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            staging: std::array::from_fn(|_| None),
        }
    }
}

/// Staging buffer of a slot, grown to hold `size` bytes
fn ensure_staging<'a>(device: &wgpu::Device, entry: &'a mut Option<wgpu::Buffer>, size: u64) -> &'a wgpu::Buffer {
    if entry.as_ref().is_none_or(|b| b.size() < size) {
        *entry = None;
    }
    entry.get_or_insert_with(|| {
        let size = size.next_power_of_two().max(wgpu::COPY_BUFFER_ALIGNMENT);
        log::debug!("Allocating {} byte staging buffer", size);
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vdb_staging"),
            size,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    })
}

impl UploadBackend for WgpuBackend {
    fn allocate(&mut self, size: u64) -> Result<GpuBuffer, TransferError> {
        if size > self.device.limits().max_buffer_size {
            return Err(TransferError::OutOfDeviceMemory { requested: size });
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vdb_grid"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(GpuBuffer::Device(buffer))
    }

    fn begin_transfer(&mut self, slot: usize, bytes: &[u8], dst: &mut GpuBuffer) -> Result<Fence, TransferError> {
        let len = bytes.len() as u64;
        let dst: &wgpu::Buffer = match &*dst {
            GpuBuffer::Device(buffer) if buffer.size() >= len => buffer,
            GpuBuffer::Device(buffer) => {
                return Err(TransferError::Device(format!(
                    "destination of {} bytes cannot hold {} bytes",
                    buffer.size(),
                    len
                )));
            }
            GpuBuffer::Host(_) => return Err(TransferError::Device("host buffer given to wgpu backend".into())),
        };

        let staging = ensure_staging(&self.device, &mut self.staging[slot % STAGING_SLOTS], len);
        self.queue.write_buffer(staging, 0, bytes);

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("vdb_upload"),
        });
        encoder.copy_buffer_to_buffer(staging, 0, dst, 0, len);
        self.queue.submit(std::iter::once(encoder.finish()));

        let fence = Fence::new();
        let signal = fence.clone();
        self.queue.on_submitted_work_done(move || signal.signal());
        Ok(fence)
    }

    fn poll(&mut self) {
        let _ = self.device.poll(wgpu::PollType::Poll);
    }

    fn release(&mut self, buffer: GpuBuffer) {
        if let GpuBuffer::Device(buffer) = buffer {
            buffer.destroy();
        }
    }
}

/// Backend keeping "device" buffers in host memory.
///
/// Fences signal on the next poll. An optional capacity makes allocation
/// fail like a device running out of memory.
#[derive(Debug, Default)]
pub struct HostBackend {
    capacity: Option<u64>,
    allocated: u64,
    unsignaled: Vec<Fence>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Bytes currently allocated
    pub fn allocated(&self) -> u64 {
        self.allocated
    }
}

impl UploadBackend for HostBackend {
    fn allocate(&mut self, size: u64) -> Result<GpuBuffer, TransferError> {
        if self.capacity.is_some_and(|cap| self.allocated + size > cap) {
            return Err(TransferError::OutOfDeviceMemory { requested: size });
        }
        self.allocated += size;
        Ok(GpuBuffer::Host(vec![0u8; size as usize].into_boxed_slice()))
    }

    fn begin_transfer(&mut self, _slot: usize, bytes: &[u8], dst: &mut GpuBuffer) -> Result<Fence, TransferError> {
        match dst {
            GpuBuffer::Host(memory) if memory.len() >= bytes.len() => {
                memory[..bytes.len()].copy_from_slice(bytes);
            }
            GpuBuffer::Host(memory) => {
                return Err(TransferError::Device(format!(
                    "destination of {} bytes cannot hold {} bytes",
                    memory.len(),
                    bytes.len()
                )));
            }
            GpuBuffer::Device(_) => return Err(TransferError::Device("device buffer given to host backend".into())),
        }

        let fence = Fence::new();
        self.unsignaled.push(fence.clone());
        Ok(fence)
    }

    fn poll(&mut self) {
        for fence in self.unsignaled.drain(..) {
            fence.signal();
        }
    }

    fn release(&mut self, buffer: GpuBuffer) {
        self.allocated = self.allocated.saturating_sub(buffer.size());
    }
}

/// A decoded grid waiting for a staging slot
#[derive(Debug)]
pub struct UploadJob {
    pub key: FrameKey,
    pub grid: DecodedGrid,
    pub token: CancelToken,
}

/// Outcome of an upload, reported by [`UploadPipeline::pump`]
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Published(FrameKey),
    Failed { key: FrameKey, error: TransferError },
    Cancelled(FrameKey),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct UploadStats {
    pub queued: usize,
    pub transferring: usize,
    pub published: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub pool: BufferPoolStats,
}

struct Transfer {
    key: FrameKey,
    reservation: Reservation,
    buffer: GpuBuffer,
    fence: Fence,
    info: GridInfo,
    token: CancelToken,
}

/// Double-buffered upload pipeline feeding the residency cache
pub struct UploadPipeline {
    backend: Box<dyn UploadBackend>,
    cache: ResidentCache,
    pool: BufferPool,
    queue: VecDeque<UploadJob>,
    slots: [Option<Transfer>; STAGING_SLOTS],
    /// Every key queued or transferring
    keys: HashSet<FrameKey>,
    published: u64,
    failed: u64,
    cancelled: u64,
}

impl UploadPipeline {
    pub fn new(backend: Box<dyn UploadBackend>, cache: ResidentCache, buffer_idle_ticks: u32) -> Self {
        Self {
            backend,
            cache,
            pool: BufferPool::new(buffer_idle_ticks),
            queue: VecDeque::new(),
            slots: std::array::from_fn(|_| None),
            keys: HashSet::new(),
            published: 0,
            failed: 0,
            cancelled: 0,
        }
    }

    /// Queue a decoded grid for upload.
    ///
    /// A key may only be in the pipeline once.
    pub fn submit(&mut self, job: UploadJob) -> Result<(), TransferError> {
        if !self.keys.insert(job.key) {
            return Err(TransferError::AlreadyInFlight(job.key));
        }
        log::trace!("Queued upload of {}", job.key);
        self.queue.push_back(job);
        Ok(())
    }

    /// Publish finished transfers, start queued ones, recycle buffers.
    ///
    /// Never blocks on the device.
    pub fn pump(&mut self) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        self.backend.poll();

        for slot in self.slots.iter_mut() {
            if !slot.as_ref().is_some_and(|t| t.fence.is_signaled()) {
                continue;
            }
            let Some(transfer) = slot.take() else { continue };
            self.keys.remove(&transfer.key);

            if transfer.token.is_cancelled() {
                log::trace!("Discarding cancelled upload of {}", transfer.key);
                drop(transfer.reservation);
                self.pool.park(transfer.buffer);
                self.cancelled += 1;
                events.push(UploadEvent::Cancelled(transfer.key));
                continue;
            }

            let _ = self.cache.publish(transfer.reservation, transfer.buffer, transfer.info);
            self.published += 1;
            events.push(UploadEvent::Published(transfer.key));
        }

        for index in 0..STAGING_SLOTS {
            if self.slots[index].is_some() {
                continue;
            }
            while let Some(job) = self.queue.pop_front() {
                match self.start(index, job) {
                    Ok(transfer) => {
                        self.slots[index] = Some(transfer);
                        break;
                    }
                    Err(event) => events.push(event),
                }
            }
        }

        self.pool.retire(self.cache.take_retired());
        for buffer in self.pool.tick() {
            self.backend.release(buffer);
        }

        events
    }

    fn start(&mut self, slot: usize, job: UploadJob) -> Result<Transfer, UploadEvent> {
        let key = job.key;
        if job.token.is_cancelled() {
            self.keys.remove(&key);
            self.cancelled += 1;
            return Err(UploadEvent::Cancelled(key));
        }

        let layout = encode_gpu_layout(key, &job.grid).map_err(|e| self.fail(key, e))?;
        let size = layout.len() as u64;

        let mut recycled = self.pool.take(size);
        let charge = recycled.as_ref().map_or(size, GpuBuffer::size);
        let mut reserved = self.cache.reserve(key, charge);
        if reserved.is_err() && charge > size {
            // The recycled buffer's slack does not fit; fall back to an exact allocation
            if let Some(buffer) = recycled.take() {
                self.pool.park(buffer);
            }
            reserved = self.cache.reserve(key, size);
        }
        let reservation = match reserved {
            Ok(reservation) => reservation,
            Err(e) => {
                if let Some(buffer) = recycled {
                    self.pool.park(buffer);
                }
                return Err(self.fail(key, e.into()));
            }
        };

        let mut buffer = match recycled {
            Some(buffer) => buffer,
            None => self.backend.allocate(size).map_err(|e| self.fail(key, e))?,
        };

        let fence = match self.backend.begin_transfer(slot, &layout, &mut buffer) {
            Ok(fence) => fence,
            Err(e) => {
                self.pool.park(buffer);
                return Err(self.fail(key, e));
            }
        };
        log::trace!("Transferring {} ({} bytes) through slot {}", key, size, slot);

        Ok(Transfer {
            key,
            reservation,
            buffer,
            fence,
            info: GridInfo {
                bounds: job.grid.bounds,
                active_voxel_count: job.grid.active_voxel_count,
            },
            token: job.token,
        })
    }

    fn fail(&mut self, key: FrameKey, error: TransferError) -> UploadEvent {
        log::warn!("Upload of {} failed: {}", key, error);
        self.keys.remove(&key);
        self.failed += 1;
        UploadEvent::Failed { key, error }
    }

    /// Drop queued uploads of a sequence and cancel its transfers
    pub fn cancel_sequence(&mut self, sequence: SequenceId) {
        let keys = &mut self.keys;
        self.queue.retain(|job| {
            let keep = job.key.sequence != sequence;
            if !keep {
                keys.remove(&job.key);
            }
            keep
        });
        for transfer in self.slots.iter().flatten() {
            if transfer.key.sequence == sequence {
                transfer.token.cancel();
            }
        }
    }

    pub fn is_in_flight(&self, key: FrameKey) -> bool {
        self.keys.contains(&key)
    }

    /// Keys queued or transferring
    pub fn in_flight(&self) -> usize {
        self.keys.len()
    }

    pub fn set_buffer_idle_ticks(&mut self, ticks: u32) {
        self.pool.set_idle_ticks(ticks);
    }

    /// Apply a new byte budget to the cache and release parked buffers that
    /// no longer fit under it
    pub fn set_ceiling(&mut self, ceiling_bytes: u64) {
        self.cache.set_ceiling(ceiling_bytes);
        for buffer in self.pool.release_larger_than(ceiling_bytes) {
            self.backend.release(buffer);
        }
    }

    pub fn stats(&self) -> UploadStats {
        UploadStats {
            queued: self.queue.len(),
            transferring: self.slots.iter().flatten().count(),
            published: self.published,
            failed: self.failed,
            cancelled: self.cancelled,
            pool: self.pool.stats(),
        }
    }
}

impl Drop for UploadPipeline {
    fn drop(&mut self) {
        for buffer in self.pool.drain() {
            self.backend.release(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Aabb;

    const SEQ: SequenceId = SequenceId(2);

    fn job(frame: u32, payload: usize) -> UploadJob {
        UploadJob {
            key: FrameKey::new(SEQ, frame, 0),
            grid: DecodedGrid {
                bounds: Aabb::unit(),
                active_voxel_count: 64,
                tree: vec![frame as u8; payload],
            },
            token: CancelToken::new(),
        }
    }

    fn pipeline(ceiling: u64) -> (UploadPipeline, ResidentCache) {
        let cache = ResidentCache::new(ceiling, 2);
        let pipeline = UploadPipeline::new(Box::new(HostBackend::new()), cache.clone(), 30);
        (pipeline, cache)
    }

    #[test]
    fn test_layout_size_is_aligned() {
        assert_eq!(GPU_HEADER_SIZE, 48);
        assert_eq!(gpu_layout_size(0), 48);
        assert_eq!(gpu_layout_size(1), 52);
        assert_eq!(gpu_layout_size(4), 52);
    }

    #[test]
    fn test_encode_layout() {
        let job = job(3, 10);
        let bytes = encode_gpu_layout(job.key, &job.grid).expect("encode");
        assert_eq!(bytes.len() as u64, gpu_layout_size(10));

        let header: GridGpuHeader = bytemuck::pod_read_unaligned(&bytes[..GPU_HEADER_SIZE as usize]);
        assert_eq!(header.magic, GPU_HEADER_MAGIC);
        assert_eq!(header.frame, 3);
        assert_eq!(header.payload_len, 10);
        assert_eq!(header.active_voxel_count(), 64);
        assert_eq!(&bytes[48..58], &[3u8; 10]);
    }

    #[test]
    fn test_publish_waits_for_fence() {
        let (mut pipeline, cache) = pipeline(10_000);
        let key = FrameKey::new(SEQ, 0, 0);
        pipeline.submit(job(0, 100)).expect("submit");

        let events = pipeline.pump();
        assert!(events.is_empty());
        assert!(!cache.contains(key));
        // The budget is charged while the transfer is in flight
        assert_eq!(cache.charged_bytes(), gpu_layout_size(100));
        assert!(pipeline.is_in_flight(key));

        let events = pipeline.pump();
        assert_eq!(events, vec![UploadEvent::Published(key)]);
        assert!(!pipeline.is_in_flight(key));

        let handle = cache.lookup(key).expect("resident");
        let memory = handle.buffer.as_host().expect("host buffer");
        let header: GridGpuHeader = bytemuck::pod_read_unaligned(&memory[..GPU_HEADER_SIZE as usize]);
        assert_eq!(header.payload_len, 100);
    }

    #[test]
    fn test_second_upload_of_key_refused() {
        let (mut pipeline, _cache) = pipeline(10_000);
        pipeline.submit(job(1, 16)).expect("submit");
        assert!(matches!(
            pipeline.submit(job(1, 16)),
            Err(TransferError::AlreadyInFlight(_))
        ));
    }

    #[test]
    fn test_two_staging_slots() {
        let (mut pipeline, cache) = pipeline(10_000);
        for frame in 0..3 {
            pipeline.submit(job(frame, 32)).expect("submit");
        }

        pipeline.pump();
        let stats = pipeline.stats();
        assert_eq!(stats.transferring, 2);
        assert_eq!(stats.queued, 1);

        let events = pipeline.pump();
        assert_eq!(events.len(), 2);
        assert_eq!(pipeline.stats().transferring, 1);

        pipeline.pump();
        assert_eq!(cache.len(), 3);
        assert_eq!(pipeline.stats().published, 3);
        assert_eq!(pipeline.in_flight(), 0);
    }

    #[test]
    fn test_cancelled_before_transfer() {
        let (mut pipeline, cache) = pipeline(10_000);
        let job = job(4, 32);
        let key = job.key;
        job.token.cancel();
        pipeline.submit(job).expect("submit");

        let events = pipeline.pump();
        assert_eq!(events, vec![UploadEvent::Cancelled(key)]);
        assert!(!cache.contains(key));
        assert_eq!(cache.charged_bytes(), 0);
        assert!(!pipeline.is_in_flight(key));
    }

    #[test]
    fn test_out_of_device_memory_refunds_budget() {
        let cache = ResidentCache::new(10_000, 2);
        let mut pipeline = UploadPipeline::new(Box::new(HostBackend::with_capacity(64)), cache.clone(), 30);
        let key = FrameKey::new(SEQ, 5, 0);
        pipeline.submit(job(5, 100)).expect("submit");

        let events = pipeline.pump();
        assert!(matches!(
            events.as_slice(),
            [UploadEvent::Failed { error: TransferError::OutOfDeviceMemory { .. }, .. }]
        ));
        assert!(!cache.contains(key));
        assert_eq!(cache.charged_bytes(), 0);
        assert!(!pipeline.is_in_flight(key));
    }

    #[test]
    fn test_too_large_for_budget_is_permanent() {
        let (mut pipeline, cache) = pipeline(100);
        pipeline.submit(job(6, 500)).expect("submit");

        let events = pipeline.pump();
        let [UploadEvent::Failed { error, .. }] = events.as_slice() else {
            panic!("expected one failure, got {:?}", events);
        };
        assert!(error.is_permanent());
        assert_eq!(cache.charged_bytes(), 0);
    }

    #[test]
    fn test_evicted_buffers_are_recycled() {
        let size = gpu_layout_size(100);
        // Room for exactly one grid
        let (mut pipeline, cache) = pipeline(size);

        pipeline.submit(job(0, 100)).expect("submit");
        pipeline.pump();
        pipeline.pump();
        assert!(cache.contains(FrameKey::new(SEQ, 0, 0)));

        // Evicts frame 0; its buffer is parked during the same pump
        pipeline.submit(job(1, 100)).expect("submit");
        pipeline.pump();
        assert_eq!(pipeline.stats().pool.parked, 1);
        pipeline.pump();

        pipeline.submit(job(2, 100)).expect("submit");
        pipeline.pump();
        assert_eq!(pipeline.stats().pool.reused, 1);
        pipeline.pump();
        assert!(cache.contains(FrameKey::new(SEQ, 2, 0)));
        assert_eq!(cache.charged_bytes(), size);
    }

    #[test]
    fn test_oversized_recycled_buffer_falls_back_to_exact_size() {
        let (mut pipeline, cache) = pipeline(100);
        pipeline.pool.park(GpuBuffer::Host(vec![0u8; 120].into_boxed_slice()));
        let key = FrameKey::new(SEQ, 0, 0);
        // 96 byte layout: fits the budget, the parked buffer does not
        pipeline.submit(job(0, 48)).expect("submit");

        let events = pipeline.pump();
        assert!(events.is_empty(), "unexpected events {:?}", events);
        assert_eq!(pipeline.pump(), vec![UploadEvent::Published(key)]);

        assert_eq!(cache.charged_bytes(), 96);
        assert_eq!(cache.lookup(key).expect("resident").buffer.size(), 96);
        assert_eq!(pipeline.stats().pool.parked, 1);
    }

    #[test]
    fn test_lowered_ceiling_releases_oversized_buffers() {
        let (mut pipeline, cache) = pipeline(1000);
        pipeline.pool.park(GpuBuffer::Host(vec![0u8; 500].into_boxed_slice()));
        pipeline.pool.park(GpuBuffer::Host(vec![0u8; 120].into_boxed_slice()));

        pipeline.set_ceiling(200);
        assert_eq!(cache.ceiling(), 200);
        let pool = pipeline.stats().pool;
        assert_eq!(pool.parked, 1);
        assert_eq!(pool.parked_bytes, 120);
        assert_eq!(pool.released, 1);
    }

    #[test]
    fn test_cancel_sequence() {
        let (mut pipeline, cache) = pipeline(10_000);
        for frame in 0..4 {
            pipeline.submit(job(frame, 8)).expect("submit");
        }
        pipeline.pump();
        pipeline.cancel_sequence(SEQ);
        assert_eq!(pipeline.stats().queued, 0);

        let events = pipeline.pump();
        assert!(events.iter().all(|e| matches!(e, UploadEvent::Cancelled(_))));
        assert_eq!(events.len(), 2);
        assert!(cache.is_empty());
        assert_eq!(pipeline.in_flight(), 0);
    }
}
