//! Destination buffers and their recycling pool
//!
//! Buffers of evicted grids are parked once the last read handle is gone and
//! handed to later uploads of a compatible size. Parked buffers that stay idle
//! for `idle_ticks` pipeline ticks are released to the device.

use crate::streaming::cache::ResidentGrid;
use std::sync::Arc;

/// Default number of idle ticks before a parked buffer is released
pub const DEFAULT_IDLE_TICKS: u32 = 30;

/// A parked buffer may be at most this much larger than the request (1/4)
const REUSE_SLACK_SHIFT: u32 = 2;

/// GPU-side storage of one resident grid
#[derive(Debug)]
pub enum GpuBuffer {
    /// Device buffer created by the wgpu backend
    Device(wgpu::Buffer),
    /// Host memory standing in for device memory
    Host(Box<[u8]>),
}

impl GpuBuffer {
    /// Size of the buffer in bytes
    pub fn size(&self) -> u64 {
        match self {
            GpuBuffer::Device(buffer) => buffer.size(),
            GpuBuffer::Host(bytes) => bytes.len() as u64,
        }
    }

    pub fn as_device(&self) -> Option<&wgpu::Buffer> {
        match self {
            GpuBuffer::Device(buffer) => Some(buffer),
            GpuBuffer::Host(_) => None,
        }
    }

    pub fn as_host(&self) -> Option<&[u8]> {
        match self {
            GpuBuffer::Device(_) => None,
            GpuBuffer::Host(bytes) => Some(bytes),
        }
    }
}

#[derive(Debug)]
struct ParkedBuffer {
    buffer: GpuBuffer,
    idle_ticks: u32,
}

/// Buffer pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BufferPoolStats {
    pub parked: usize,
    pub parked_bytes: u64,
    /// Retired grids still waiting for their last handle
    pub retiring: usize,
    pub reused: u64,
    pub released: u64,
}

/// Pool of released destination buffers
#[derive(Debug)]
pub struct BufferPool {
    parked: Vec<ParkedBuffer>,
    retiring: Vec<Arc<ResidentGrid>>,
    idle_ticks: u32,
    reused: u64,
    released: u64,
}

impl BufferPool {
    pub fn new(idle_ticks: u32) -> Self {
        Self {
            parked: Vec::new(),
            retiring: Vec::new(),
            idle_ticks,
            reused: 0,
            released: 0,
        }
    }

    pub fn set_idle_ticks(&mut self, idle_ticks: u32) {
        self.idle_ticks = idle_ticks;
    }

    /// Take the smallest parked buffer that holds `size` bytes without much slack
    pub fn take(&mut self, size: u64) -> Option<GpuBuffer> {
        let limit = size.saturating_add(size >> REUSE_SLACK_SHIFT);
        let index = self
            .parked
            .iter()
            .enumerate()
            .filter(|(_, p)| (size..=limit).contains(&p.buffer.size()))
            .min_by_key(|(_, p)| p.buffer.size())
            .map(|(i, _)| i)?;

        self.reused += 1;
        Some(self.parked.swap_remove(index).buffer)
    }

    /// Park a buffer for reuse
    pub fn park(&mut self, buffer: GpuBuffer) {
        self.parked.push(ParkedBuffer { buffer, idle_ticks: 0 });
    }

    /// Hand over grids evicted from the cache.
    ///
    /// Their buffers are parked once no read handle refers to them anymore.
    pub fn retire(&mut self, grids: impl IntoIterator<Item = Arc<ResidentGrid>>) {
        self.retiring.extend(grids);
    }

    /// Advance idle counters and reclaim retired buffers.
    ///
    /// Returns the buffers that exceeded their idle time; the caller releases
    /// them to the device.
    pub fn tick(&mut self) -> Vec<GpuBuffer> {
        let mut still_held = Vec::new();
        for grid in self.retiring.drain(..) {
            match Arc::try_unwrap(grid) {
                Ok(grid) => self.parked.push(ParkedBuffer { buffer: grid.buffer, idle_ticks: 0 }),
                Err(grid) => still_held.push(grid),
            }
        }
        self.retiring = still_held;

        let idle_limit = self.idle_ticks;
        let mut expired = Vec::new();
        let mut kept = Vec::with_capacity(self.parked.len());
        for mut parked in self.parked.drain(..) {
            parked.idle_ticks += 1;
            if parked.idle_ticks > idle_limit {
                expired.push(parked.buffer);
            } else {
                kept.push(parked);
            }
        }
        self.parked = kept;

        if !expired.is_empty() {
            log::debug!("Releasing {} idle buffers", expired.len());
        }
        self.released += expired.len() as u64;
        expired
    }

    /// Remove parked buffers larger than `max` bytes
    pub fn release_larger_than(&mut self, max: u64) -> Vec<GpuBuffer> {
        let (released, kept): (Vec<_>, Vec<_>) = self.parked.drain(..).partition(|p| p.buffer.size() > max);
        self.parked = kept;
        self.released += released.len() as u64;
        released.into_iter().map(|p| p.buffer).collect()
    }

    /// Release every parked buffer
    pub fn drain(&mut self) -> Vec<GpuBuffer> {
        self.released += self.parked.len() as u64;
        self.parked.drain(..).map(|p| p.buffer).collect()
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            parked: self.parked.len(),
            parked_bytes: self.parked.iter().map(|p| p.buffer.size()).sum(),
            retiring: self.retiring.len(),
            reused: self.reused,
            released: self.released,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TICKS)
    }
}
