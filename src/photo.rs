//! Core identifiers and quality/priority types shared across the pipeline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An opaque handle identifying a source photo plus its original pixel
/// dimensions. Cheap to clone and suitable as a map key, mirroring the
/// small `Clone + Hash + Eq` key types the pipeline threads everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhotoRef {
    uri: Arc<str>,
    original_size: (u32, u32),
}

impl PhotoRef {
    pub fn new<S: Into<Arc<str>>>(uri: S, original_size: (u32, u32)) -> Self {
        PhotoRef {
            uri: uri.into(),
            original_size,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn original_size(&self) -> (u32, u32) {
        self.original_size
    }

    pub fn original_area(&self) -> u64 {
        self.original_size.0 as u64 * self.original_size.1 as u64
    }
}

impl std::fmt::Display for PhotoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri)
    }
}

/// A discrete photo resolution tier, `L0` (smallest) through `L7` (largest).
///
/// Ordered by `level` so `existing[p] < requested` comparisons in the
/// selector's dedup pass are literal `<`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LodLevel {
    L0 = 0,
    L1 = 1,
    L2 = 2,
    L3 = 3,
    L4 = 4,
    L5 = 5,
    L6 = 6,
    L7 = 7,
}

/// Target edge lengths in pixels, indexed by [`LodLevel::level`].
const RES: [u32; 8] = [32, 64, 128, 192, 256, 384, 512, 768];

/// Zoom interval lower bounds; `zoomRange(L)` is `[ZOOM_FLOORS[L], ZOOM_FLOORS[L+1])`,
/// with `L7` extending to infinity.
const ZOOM_FLOORS: [f32; 8] = [0.0, 0.25, 0.5, 1.25, 2.0, 3.0, 5.0, 8.0];

impl LodLevel {
    pub const ALL: [LodLevel; 8] = [
        LodLevel::L0,
        LodLevel::L1,
        LodLevel::L2,
        LodLevel::L3,
        LodLevel::L4,
        LodLevel::L5,
        LodLevel::L6,
        LodLevel::L7,
    ];

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        Self::ALL.get(level as usize).copied()
    }

    /// Target edge length in pixels for this tier.
    pub fn resolution(self) -> u32 {
        RES[self.level() as usize]
    }

    /// The unique tier whose zoom interval contains `zoom`, or `L7` if
    /// `zoom` exceeds every interval's upper bound.
    pub fn for_zoom(zoom: f32) -> LodLevel {
        let mut selected = LodLevel::L0;

        for lod in LodLevel::ALL {
            if zoom >= ZOOM_FLOORS[lod.level() as usize] {
                selected = lod;
            } else {
                break;
            }
        }

        selected
    }

    /// Saturating successor, capped at `L7`.
    pub fn next_capped(self) -> LodLevel {
        LodLevel::from_level(self.level() + 1).unwrap_or(LodLevel::L7)
    }
}

/// Scheduling fairness hint. Does not influence LOD selection, only
/// worker-pool ordering and memory-eviction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhotoPriority {
    Normal,
    High,
}

/// The semantic reason a photo subset was requested. The sole place quality
/// boosts are encoded: each variant maps to a [`PhotoQuality`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AtlasPriority {
    PersistentCache,
    VisibleCells,
    ActiveCell,
    SelectedPhoto,
}

impl AtlasPriority {
    pub fn quality(self) -> PhotoQuality {
        match self {
            AtlasPriority::PersistentCache => PhotoQuality::Standard,
            AtlasPriority::VisibleCells => PhotoQuality::Standard,
            AtlasPriority::ActiveCell => PhotoQuality::Enhanced,
            AtlasPriority::SelectedPhoto => PhotoQuality::Maximum,
        }
    }
}

/// A quality boost applied on top of the zoom-derived LOD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhotoQuality {
    Standard,
    Enhanced,
    Maximum,
}

impl PhotoQuality {
    pub fn apply(self, lod: LodLevel) -> LodLevel {
        match self {
            PhotoQuality::Standard => lod,
            PhotoQuality::Enhanced => lod.next_capped(),
            PhotoQuality::Maximum => LodLevel::L7,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lod_ordering_is_numeric() {
        assert!(LodLevel::L2 < LodLevel::L3);
        assert!(LodLevel::L0 < LodLevel::L7);
    }

    #[test]
    fn for_zoom_partitions_axis() {
        assert_eq!(LodLevel::for_zoom(0.0), LodLevel::L0);
        assert_eq!(LodLevel::for_zoom(1.0), LodLevel::L2);
        assert_eq!(LodLevel::for_zoom(1.24), LodLevel::L2);
        assert_eq!(LodLevel::for_zoom(1.25), LodLevel::L3);
        assert_eq!(LodLevel::for_zoom(100.0), LodLevel::L7);
    }

    #[test]
    fn next_capped_saturates() {
        assert_eq!(LodLevel::L6.next_capped(), LodLevel::L7);
        assert_eq!(LodLevel::L7.next_capped(), LodLevel::L7);
    }

    #[test]
    fn quality_boost_rules() {
        assert_eq!(PhotoQuality::Standard.apply(LodLevel::L3), LodLevel::L3);
        assert_eq!(PhotoQuality::Enhanced.apply(LodLevel::L3), LodLevel::L4);
        assert_eq!(PhotoQuality::Enhanced.apply(LodLevel::L7), LodLevel::L7);
        assert_eq!(PhotoQuality::Maximum.apply(LodLevel::L0), LodLevel::L7);
    }

    #[test]
    fn atlas_priority_quality_mapping() {
        assert_eq!(AtlasPriority::PersistentCache.quality(), PhotoQuality::Standard);
        assert_eq!(AtlasPriority::VisibleCells.quality(), PhotoQuality::Standard);
        assert_eq!(AtlasPriority::ActiveCell.quality(), PhotoQuality::Enhanced);
        assert_eq!(AtlasPriority::SelectedPhoto.quality(), PhotoQuality::Maximum);
    }
}
