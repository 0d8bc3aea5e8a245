//! Texture atlas, its immutable per-photo regions, and the reactive region
//! table that lets consumers observe progressive availability (§3, §4.8).

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use foldhash::fast::FixedState;

use crate::photo::{LodLevel, PhotoRef};

/// A single-producer, multi-consumer observable slot. Writes are
/// monotonic: once set to `Some`, a cell never reverts to `None`. Reads are
/// lock-free on the consumer's common path.
pub struct ObservableCell<T> {
    slot: ArcSwapOption<T>,
}

impl<T> ObservableCell<T> {
    pub fn new() -> Self {
        ObservableCell {
            slot: ArcSwapOption::from(None),
        }
    }

    /// Reads the current value without blocking.
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.load_full()
    }

    /// Writes `value`, provided the cell is still empty. Returns `false`
    /// (a no-op) if the cell was already populated, enforcing the
    /// `None -> Some` monotonicity invariant.
    ///
    /// Only the single producer that owns this atlas's build task ever
    /// calls `set`, so a plain load-then-store is sufficient — there is no
    /// concurrent writer to race against.
    pub fn set(&self, value: T) -> bool {
        if self.slot.load().is_some() {
            return false;
        }

        self.slot.store(Some(Arc::new(value)));
        true
    }
}

impl<T> Default for ObservableCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable, fully-resolved placement of one photo within an atlas.
#[derive(Debug, Clone, PartialEq)]
pub struct AtlasRegion {
    pub photo_id: PhotoRef,
    pub atlas_rect: (u32, u32, u32, u32),
    pub original_size: (u32, u32),
    pub scaled_size: (u32, u32),
    pub aspect_ratio: f32,
    pub lod_level: LodLevel,
}

/// A deterministic hash of a sorted set of photo refs, used as the
/// `photos_hash` component of [`crate::memory::AtlasKey`].
pub fn hash_photo_set(photos: &[PhotoRef]) -> u64 {
    let mut sorted: Vec<&PhotoRef> = photos.iter().collect();
    sorted.sort_by(|a, b| a.uri().cmp(b.uri()));

    let mut hasher = FixedState::with_seed(0).build_hasher();
    for photo in sorted {
        photo.uri().hash(&mut hasher);
    }

    hasher.finish()
}

/// A fixed-size pixel buffer holding many photos laid out without overlap,
/// each described by a reactive region.
///
/// The pixel buffer is recycled through the bitmap pool only once the
/// atlas is unregistered from the memory manager; while `TextureAtlas` is
/// alive it exclusively owns its buffer.
pub struct TextureAtlas {
    pub lod_level: LodLevel,
    pub size: u32,
    pixels: Option<Vec<u8>>,
    reactive_regions: HashMap<PhotoRef, Arc<ObservableCell<AtlasRegion>>>,
}

impl TextureAtlas {
    /// Creates an empty atlas with a `reactive_regions` entry pre-populated
    /// (as `None`) for every `member_photos` entry, per the
    /// immediate-availability contract (§4.3).
    pub fn new_empty(lod_level: LodLevel, size: u32, pixels: Vec<u8>, member_photos: &[PhotoRef]) -> Self {
        let reactive_regions = member_photos
            .iter()
            .cloned()
            .map(|p| (p, Arc::new(ObservableCell::new())))
            .collect();

        TextureAtlas {
            lod_level,
            size,
            pixels: Some(pixels),
            reactive_regions,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        self.pixels.as_deref().unwrap_or(&[])
    }

    /// Takes the pixel buffer out, leaving the atlas buffer-less. Used when
    /// unregistering so the buffer can be returned to the bitmap pool.
    pub fn take_pixels(&mut self) -> Option<Vec<u8>> {
        self.pixels.take()
    }

    pub fn region_cell(&self, photo: &PhotoRef) -> Option<&Arc<ObservableCell<AtlasRegion>>> {
        self.reactive_regions.get(photo)
    }

    /// Writes `region` for `photo`, transitioning its cell `None -> Some`.
    /// Idempotent: a second call for the same photo is a no-op, preserving
    /// monotonicity.
    pub fn publish_region(&self, photo: &PhotoRef, region: AtlasRegion) -> bool {
        match self.reactive_regions.get(photo) {
            Some(cell) => cell.set(region),
            None => false,
        }
    }

    /// Every resolved region currently held by this atlas.
    pub fn resolved_regions(&self) -> Vec<AtlasRegion> {
        self.reactive_regions
            .values()
            .filter_map(|cell| cell.get())
            .map(|arc| (*arc).clone())
            .collect()
    }

    /// `sum(region_area) / atlas_area`, clamped to `[0, 1]`.
    pub fn utilization(&self) -> f32 {
        let atlas_area = self.size as u64 * self.size as u64;
        if atlas_area == 0 {
            return 0.0;
        }

        let used: u64 = self
            .resolved_regions()
            .iter()
            .map(|r| r.atlas_rect.2 as u64 * r.atlas_rect.3 as u64)
            .sum();

        (used as f32 / atlas_area as f32).clamp(0.0, 1.0)
    }

    pub fn member_count(&self) -> usize {
        self.reactive_regions.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn photo(name: &str) -> PhotoRef {
        PhotoRef::new(name.to_string(), (100, 100))
    }

    fn region(photo_id: PhotoRef) -> AtlasRegion {
        AtlasRegion {
            photo_id,
            atlas_rect: (2, 2, 100, 100),
            original_size: (100, 100),
            scaled_size: (100, 100),
            aspect_ratio: 1.0,
            lod_level: LodLevel::L2,
        }
    }

    #[test]
    fn reactive_region_starts_none_and_transitions_once() {
        let a = photo("a");
        let atlas = TextureAtlas::new_empty(LodLevel::L2, 2048, vec![0; 2048 * 2048 * 4], &[a.clone()]);

        assert!(atlas.region_cell(&a).unwrap().get().is_none());
        assert!(atlas.publish_region(&a, region(a.clone())));
        assert!(atlas.region_cell(&a).unwrap().get().is_some());

        // Second publish is a no-op; the cell never reverts and never
        // silently overwrites.
        assert!(!atlas.publish_region(&a, region(a.clone())));
    }

    #[test]
    fn hash_photo_set_is_order_independent() {
        let a = photo("a");
        let b = photo("b");
        assert_eq!(hash_photo_set(&[a.clone(), b.clone()]), hash_photo_set(&[b, a]));
    }

    #[test]
    fn utilization_reflects_published_regions_only() {
        let a = photo("a");
        let b = photo("b");
        let atlas = TextureAtlas::new_empty(LodLevel::L2, 2048, vec![0; 2048 * 2048 * 4], &[a.clone(), b]);
        assert_eq!(atlas.utilization(), 0.0);

        atlas.publish_region(&a, region(a.clone()));
        assert!(atlas.utilization() > 0.0);
    }
}
