//! Level of Detail (LOD) selection for prefetched frames
//!
//! LOD levels ascend with detail: level 0 is the coarsest representation a
//! frame offers. The policy picks one level per frame from what the catalog
//! lists, skipping levels the cache permanently rejected.

use crate::streaming::catalog::VolumeCatalog;
use serde::{Deserialize, Serialize};

/// How the scheduler picks the LOD of a prefetched frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LodPolicy {
    /// Finest level whose size estimate fits the per-frame budget share,
    /// else the next coarser one
    #[default]
    FinestFitting,
    /// A fixed level (nearest available when a frame lacks it)
    Fixed { level: u8 },
    /// Always the coarsest level
    Coarsest,
}

/// Per-frame share of the budget when `frames` frames compete for it
///
/// # Examples
/// ```
/// use vdbstream::streaming::lod::per_frame_share;
///
/// assert_eq!(per_frame_share(1000, 4), 250);
/// assert_eq!(per_frame_share(1000, 0), 1000);
/// ```
pub fn per_frame_share(ceiling_bytes: u64, frames: u32) -> u64 {
    ceiling_bytes / u64::from(frames.max(1))
}

/// Select the LOD level for a frame
///
/// # Arguments
/// * `policy` - Selection policy
/// * `catalog` - Catalog of the frame's sequence
/// * `frame` - Frame index
/// * `share_bytes` - Per-frame budget share (see [`per_frame_share`])
/// * `rejected` - Levels that must not be requested
///
/// # Returns
/// The level to request, or `None` if the frame has no usable level
pub fn select_lod(
    policy: LodPolicy,
    catalog: &VolumeCatalog,
    frame: u32,
    share_bytes: u64,
    rejected: impl Fn(u8) -> bool,
) -> Option<u8> {
    let levels = catalog.lods(frame);

    match policy {
        LodPolicy::FinestFitting => levels
            .iter()
            .rev()
            .copied()
            .filter(|&level| !rejected(level))
            .find(|&level| {
                catalog
                    .size_estimate(frame, level)
                    .is_some_and(|size| size <= share_bytes)
            })
            .or_else(|| coarsest_lod(catalog, frame, &rejected)),

        LodPolicy::Fixed { level } => {
            let nearest = catalog.nearest_lod(frame, level)?;
            if !rejected(nearest) {
                return Some(nearest);
            }
            // Step down from the nearest level
            levels
                .iter()
                .rev()
                .copied()
                .filter(|&l| l < nearest)
                .find(|&l| !rejected(l))
        }

        LodPolicy::Coarsest => coarsest_lod(catalog, frame, &rejected),
    }
}

/// Coarsest level of a frame that is not rejected
pub fn coarsest_lod(catalog: &VolumeCatalog, frame: u32, rejected: impl Fn(u8) -> bool) -> Option<u8> {
    catalog.lods(frame).iter().copied().find(|&level| !rejected(level))
}
