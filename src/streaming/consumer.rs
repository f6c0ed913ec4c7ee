//! Render consumer interface
//!
//! The renderer asks for "the best version of frame N right now". The
//! answer is the finest resident LOD of that frame, pinned as current while
//! the previously shown key stays pinned too, so switching frames never
//! leaves the renderer with nothing to draw.

use crate::streaming::cache::{CacheError, ResidentCache, ResidentHandle};
use crate::streaming::catalog::VolumeCatalog;
use crate::streaming::key::{FrameKey, SequenceId};
use std::collections::HashMap;
use thiserror::Error;

/// No LOD of the frame is resident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frame {frame} of {sequence} is not resident at any LOD")]
pub struct Unavailable {
    pub sequence: SequenceId,
    pub frame: u32,
}

/// A resident grid ready to draw
#[derive(Debug, Clone)]
pub struct FrameView {
    pub handle: ResidentHandle,
    /// LOD actually resident, may be coarser than the one prefetched
    pub lod: u8,
}

#[derive(Debug, Default, Clone, Copy)]
struct Shown {
    current: Option<FrameKey>,
    previous: Option<FrameKey>,
}

/// Hands out resident frames and keeps the shown ones pinned
pub struct RenderConsumer {
    cache: ResidentCache,
    shown: HashMap<SequenceId, Shown>,
}

impl RenderConsumer {
    pub fn new(cache: ResidentCache) -> Self {
        Self {
            cache,
            shown: HashMap::new(),
        }
    }

    /// Best resident version of a frame
    ///
    /// # Arguments
    /// * `catalog` - Catalog of the frame's sequence
    /// * `frame` - Frame index
    ///
    /// # Returns
    /// The finest resident LOD with a read handle, or [`Unavailable`] when
    /// nothing of the frame is resident (callers keep drawing their previous
    /// handle)
    pub fn request_current_frame(&mut self, catalog: &VolumeCatalog, frame: u32) -> Result<FrameView, Unavailable> {
        let sequence = catalog.sequence();
        let handle = catalog
            .lods(frame)
            .iter()
            .rev()
            .find_map(|&level| self.cache.lookup(FrameKey::new(sequence, frame, level)))
            .ok_or(Unavailable { sequence, frame })?;

        let lod = handle.key().lod;
        self.show(handle.key());
        Ok(FrameView { handle, lod })
    }

    /// Make `key` the current key of its sequence and pin it
    fn show(&mut self, key: FrameKey) {
        let shown = self.shown.entry(key.sequence).or_default();
        if shown.current == Some(key) {
            return;
        }

        if let Some(old) = shown.previous.take() {
            self.cache.unpin(old);
        }
        shown.previous = shown.current;
        shown.current = Some(key);

        match self.cache.pin(key) {
            Ok(()) => log::trace!("Showing {}", key),
            // The handle still protects the grid while it is drawn
            Err(CacheError::PinLimitReached { max, .. }) => {
                log::debug!("Showing {} unpinned, {} keys already pinned", key, max)
            }
            Err(e) => log::debug!("Could not pin {}: {}", key, e),
        }
    }

    /// Current and previous keys shown for a sequence
    pub fn shown(&self, sequence: SequenceId) -> (Option<FrameKey>, Option<FrameKey>) {
        self.shown
            .get(&sequence)
            .map_or((None, None), |s| (s.current, s.previous))
    }

    /// Unpin everything shown for a sequence
    pub fn release_sequence(&mut self, sequence: SequenceId) {
        if let Some(shown) = self.shown.remove(&sequence) {
            for key in [shown.current, shown.previous].into_iter().flatten() {
                self.cache.unpin(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Aabb;
    use crate::streaming::buffer_pool::GpuBuffer;
    use crate::streaming::cache::GridInfo;
    use crate::streaming::catalog::{FrameEntry, LodEntry, SequenceManifest, MANIFEST_VERSION};
    use std::path::Path;

    const SEQ: SequenceId = SequenceId(1);

    fn catalog() -> VolumeCatalog {
        let manifest = SequenceManifest {
            version: MANIFEST_VERSION,
            name: "consumer".into(),
            frame_rate: 24.0,
            data_file: "consumer.vdbs".into(),
            frames: (0..10)
                .map(|index| FrameEntry {
                    index,
                    lods: (0..3)
                        .map(|level| LodEntry { level, offset: 0, length: 1, uncompressed_size: 64 })
                        .collect(),
                })
                .collect(),
        };
        VolumeCatalog::from_manifest(SEQ, manifest, Path::new(".")).expect("valid manifest")
    }

    fn insert(cache: &ResidentCache, frame: u32, lod: u8) {
        let info = GridInfo { bounds: Aabb::unit(), active_voxel_count: 8 };
        cache
            .insert(FrameKey::new(SEQ, frame, lod), 64, GpuBuffer::Host(vec![0; 64].into_boxed_slice()), info)
            .expect("insert");
    }

    #[test]
    fn test_returns_finest_resident_lod() {
        let cache = ResidentCache::new(10_000, 2);
        insert(&cache, 3, 0);
        insert(&cache, 3, 1);
        let mut consumer = RenderConsumer::new(cache.clone());

        let view = consumer.request_current_frame(&catalog(), 3).expect("resident");
        assert_eq!(view.lod, 1);
        assert_eq!(view.handle.key(), FrameKey::new(SEQ, 3, 1));
        assert!(cache.is_pinned(FrameKey::new(SEQ, 3, 1)));
    }

    #[test]
    fn test_unavailable_when_nothing_resident() {
        let cache = ResidentCache::new(10_000, 2);
        insert(&cache, 2, 2);
        let mut consumer = RenderConsumer::new(cache);

        let err = consumer.request_current_frame(&catalog(), 4).unwrap_err();
        assert_eq!(err, Unavailable { sequence: SEQ, frame: 4 });
        assert_eq!(consumer.shown(SEQ), (None, None));
    }

    #[test]
    fn test_keeps_current_and_previous_pinned() {
        let cache = ResidentCache::new(10_000, 2);
        for frame in 0..3 {
            insert(&cache, frame, 2);
        }
        let mut consumer = RenderConsumer::new(cache.clone());
        let catalog = catalog();

        consumer.request_current_frame(&catalog, 0).expect("frame 0");
        consumer.request_current_frame(&catalog, 1).expect("frame 1");
        assert!(cache.is_pinned(FrameKey::new(SEQ, 0, 2)));
        assert!(cache.is_pinned(FrameKey::new(SEQ, 1, 2)));

        consumer.request_current_frame(&catalog, 2).expect("frame 2");
        assert!(!cache.is_pinned(FrameKey::new(SEQ, 0, 2)));
        assert!(cache.is_pinned(FrameKey::new(SEQ, 1, 2)));
        assert!(cache.is_pinned(FrameKey::new(SEQ, 2, 2)));

        // Asking again for the same frame changes nothing
        consumer.request_current_frame(&catalog, 2).expect("frame 2");
        assert!(cache.is_pinned(FrameKey::new(SEQ, 1, 2)));
        assert_eq!(
            consumer.shown(SEQ),
            (Some(FrameKey::new(SEQ, 2, 2)), Some(FrameKey::new(SEQ, 1, 2)))
        );
    }

    #[test]
    fn test_release_sequence_unpins() {
        let cache = ResidentCache::new(10_000, 2);
        insert(&cache, 0, 0);
        insert(&cache, 1, 0);
        let mut consumer = RenderConsumer::new(cache.clone());
        let catalog = catalog();
        consumer.request_current_frame(&catalog, 0).expect("frame 0");
        consumer.request_current_frame(&catalog, 1).expect("frame 1");

        consumer.release_sequence(SEQ);
        assert_eq!(cache.stats().pinned, 0);
    }
}
