//! Public facade tying the selector, distributor, packer, processor, and
//! memory manager into one streaming engine (§6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::Stream;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::atlas::{hash_photo_set, AtlasRegion, TextureAtlas};
use crate::device::DeviceCapabilities;
use crate::distributor::{build_all, distribute, DistributionItem, DistributionStrategy, PhotoGroup};
use crate::error::ProcessError;
use crate::memory::{AtlasKey, MemoryManager, MemoryStatus};
use crate::packer::{self, PackInput};
use crate::photo::{AtlasPriority, LodLevel, PhotoPriority, PhotoRef};
use crate::pool::BitmapPool;
use crate::processor::{self, FileImageDecoder, ImageDecoder, ScaleStrategy};
use crate::selector::{select, ExistingResidency, PriorityRequest, SelectionMode, ViewportState, VisibleCell};
use crate::stream::{AtlasStreamResult, CancellationToken, StreamingManager};

/// Static configuration for an [`AtlasEngine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub device: DeviceCapabilities,
    pub scale_strategy: ScaleStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            device: DeviceCapabilities::conservative(),
            scale_strategy: ScaleStrategy::FitCenter,
        }
    }
}

/// The caller-facing viewport change event (the `ViewportEvents` contract,
/// §4.1). Re-shapes into a [`ViewportState`] with the engine's own
/// persistent-cache-initialized bit folded in.
#[derive(Debug, Clone)]
pub struct ViewportUpdate {
    pub visible_cells: Vec<VisibleCell>,
    pub zoom: f32,
    pub selected_media: Option<PhotoRef>,
    pub selection_mode: SelectionMode,
    pub active_cell: Option<VisibleCell>,
    pub canvas_photos: Vec<PhotoRef>,
}

/// Scales `original` so its longer (FitCenter) or both (CenterCrop) edges
/// match `lod`'s target resolution, preserving aspect ratio under
/// `FitCenter`.
fn target_dimensions(original: (u32, u32), lod: LodLevel, strategy: ScaleStrategy) -> (u32, u32) {
    let res = lod.resolution();

    match strategy {
        ScaleStrategy::CenterCrop => (res, res),
        ScaleStrategy::FitCenter => {
            let (w, h) = original;
            if w >= h {
                let scaled_h = ((h as u64 * res as u64) / (w.max(1) as u64)).max(1) as u32;
                (res, scaled_h)
            } else {
                let scaled_w = ((w as u64 * res as u64) / (h.max(1) as u64)).max(1) as u32;
                (scaled_w, res)
            }
        },
    }
}

/// The streaming, multi-resolution texture atlas engine.
///
/// Owns every resident atlas and the reactive regions published into them;
/// callers read through [`Self::best_region`]/[`Self::region_at`] and drive
/// work through [`Self::update_viewport`], observing progress through
/// [`Self::subscribe`].
pub struct AtlasEngine {
    config: EngineConfig,
    decoder: Arc<dyn ImageDecoder>,
    memory: Arc<MemoryManager>,
    pool: Arc<BitmapPool>,
    streaming: Arc<StreamingManager>,
    atlases: Mutex<HashMap<AtlasKey, Arc<TextureAtlas>>>,
    residency: Mutex<HashMap<PhotoRef, (LodLevel, AtlasKey)>>,
    persistent_cache_initialized: AtomicBool,
    persistent_cache_keys: Mutex<Vec<AtlasKey>>,
}

impl AtlasEngine {
    /// Builds an engine backed by the default filesystem image decoder.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_decoder(config, Arc::new(FileImageDecoder))
    }

    /// Builds an engine against a caller-supplied [`ImageDecoder`] (tests
    /// and embedders that source pixels from something other than the
    /// filesystem).
    pub fn with_decoder(config: EngineConfig, decoder: Arc<dyn ImageDecoder>) -> Arc<Self> {
        let memory = Arc::new(MemoryManager::new(config.device.memory_budget_bytes));
        let pool = Arc::new(BitmapPool::new());

        // §4.6 "Pressure changes are also published as an observable signal
        // consumed by the bitmap pool to release cached buffers": the pool
        // has no direct reference to the memory manager, so a background
        // task relays every pressure transition from one to the other.
        let mut pressure_rx = memory.subscribe();
        let watched_pool = pool.clone();
        tokio::spawn(async move {
            let mut last = pressure_rx.borrow().pressure;
            watched_pool.on_pressure(last);
            while pressure_rx.changed().await.is_ok() {
                let current = pressure_rx.borrow().pressure;
                if current != last {
                    watched_pool.on_pressure(current);
                    last = current;
                }
            }
        });

        Arc::new(AtlasEngine {
            config,
            decoder,
            memory,
            pool,
            streaming: Arc::new(StreamingManager::new()),
            atlases: Mutex::new(HashMap::new()),
            residency: Mutex::new(HashMap::new()),
            persistent_cache_initialized: AtomicBool::new(false),
            persistent_cache_keys: Mutex::new(Vec::new()),
        })
    }

    /// A stream of [`AtlasStreamResult`]s describing generation progress.
    /// Cold on first subscription: the latest known result, if any, replays
    /// immediately, ahead of subsequent live events (§6).
    pub fn subscribe(&self) -> impl Stream<Item = AtlasStreamResult> + Send + 'static {
        self.streaming.stream()
    }

    pub fn memory_status(&self) -> MemoryStatus {
        self.memory.status()
    }

    /// The currently resolved, fully-published regions for a photo, along
    /// with the atlas holding it. `None` if the photo hasn't been built at
    /// any LOD yet.
    pub fn best_region(&self, photo: &PhotoRef) -> Option<(Arc<TextureAtlas>, AtlasRegion)> {
        let key = self.residency.lock().get(photo).map(|(_, key)| *key)?;
        let atlas = self.atlases.lock().get(&key)?.clone();
        let region = atlas.region_cell(photo)?.get()?;
        self.memory.touch(&key);
        Some((atlas, (*region).clone()))
    }

    /// The region for `photo` at `preferred_lod`, falling back to the
    /// nearest lower resident LOD (ultimately `L0`) if the preferred tier
    /// isn't resolved yet (§6 "preferred LOD with LOD-descending
    /// fallback"). `None` preferred LOD starts the descent from `L7`.
    pub fn region_at(&self, photo: &PhotoRef, preferred_lod: Option<LodLevel>) -> Option<AtlasRegion> {
        let atlases = self.atlases.lock();
        let mut level = preferred_lod.unwrap_or(LodLevel::L7).level();

        loop {
            let lod = LodLevel::from_level(level)?;
            let found = atlases
                .iter()
                .filter(|(key, _)| key.lod_level == lod)
                .find_map(|(key, atlas)| atlas.region_cell(photo).and_then(|cell| cell.get().map(|region| (*key, region))));

            if let Some((key, region)) = found {
                self.memory.touch(&key);
                return Some((*region).clone());
            }

            if level == 0 {
                return None;
            }
            level -= 1;
        }
    }

    /// Every atlas built to satisfy the persistent-cache request, in build
    /// order.
    pub fn persistent_cache(&self) -> Vec<Arc<TextureAtlas>> {
        let atlases = self.atlases.lock();
        self.persistent_cache_keys
            .lock()
            .iter()
            .filter_map(|key| atlases.get(key).cloned())
            .collect()
    }

    /// Drops every resident `L6`/`L7` atlas that isn't part of the
    /// persistent cache, synchronously, returning their buffers to the
    /// bitmap pool. Called when a selected photo is deselected and its
    /// maximum-quality atlas is no longer needed (§4.6 "Photo
    /// deselection").
    pub fn cleanup_high_detail_for_deselection(&self) {
        let persistent = self.persistent_cache_keys.lock().clone();
        let mut atlases = self.atlases.lock();

        let doomed: Vec<AtlasKey> = atlases
            .keys()
            .copied()
            .filter(|key| key.lod_level.level() >= LodLevel::L6.level() && !persistent.contains(key))
            .collect();

        let removed_count = doomed.len();

        for key in &doomed {
            if let Some(atlas) = atlases.remove(key) {
                if let Ok(mut atlas) = Arc::try_unwrap(atlas) {
                    if let Some(pixels) = atlas.take_pixels() {
                        self.pool.release(key.atlas_size, pixels);
                    }
                }
            }

            self.memory.unregister(key);
        }

        drop(atlases);

        if removed_count > 0 {
            self.residency.lock().retain(|_, (_, key)| !doomed.contains(key));

            self.streaming.emit(AtlasStreamResult::AtlasRemoved {
                sequence: self.streaming.next_sequence(),
                lod: LodLevel::L7,
                reason: "selected photo deselected",
                removed_count,
            });
        }
    }

    /// Evaluates the selector against `update`, launching one independent
    /// build task per resulting priority request. Returns immediately with
    /// the sequence number assigned to this update; results arrive later on
    /// [`Self::subscribe`].
    pub fn update_viewport(self: &Arc<Self>, update: ViewportUpdate) -> u64 {
        let sequence = self.streaming.next_sequence();

        let view = ViewportState {
            visible_cells: update.visible_cells,
            zoom: update.zoom,
            selected_media: update.selected_media,
            selection_mode: update.selection_mode,
            active_cell: update.active_cell,
            persistent_cache_initialized: self.persistent_cache_initialized.load(Ordering::Acquire),
            canvas_photos: update.canvas_photos,
        };

        let existing: ExistingResidency = {
            let residency = self.residency.lock();
            residency.iter().map(|(photo, (lod, _))| (photo.clone(), *lod)).collect()
        };

        let requests = select(&view, &existing);

        if requests.is_empty() {
            self.streaming.emit(AtlasStreamResult::Loading {
                sequence,
                lod: None,
                message: "nothing new to build".to_string(),
            });
            return sequence;
        }

        self.streaming.emit(AtlasStreamResult::Loading {
            sequence,
            lod: None,
            message: format!("{} request(s) queued", requests.len()),
        });

        // Zero-wait fallback (§4.2): if a persistent cache already exists,
        // synthesize an immediate LodReady for L0 under this sequence before
        // any of the freshly selected requests finish building, so a
        // consumer always has *something* to render while the real work is
        // in flight.
        if self.persistent_cache_initialized.load(Ordering::Acquire) {
            let regions: Vec<AtlasRegion> = self
                .persistent_cache()
                .iter()
                .flat_map(|atlas| atlas.resolved_regions())
                .collect();
            self.streaming.emit_persistent_cache_fallback(sequence, regions);
        }

        for request in requests {
            let engine = self.clone();
            tokio::spawn(async move {
                build_request(engine, sequence, request).await;
            });
        }

        sequence
    }
}

async fn build_request(engine: Arc<AtlasEngine>, sequence: u64, request: PriorityRequest) {
    let lod = request.lod;
    let priority = request.priority;
    let reason = request.reason;
    let started = std::time::Instant::now();

    let token = engine.streaming.begin_task(lod).await;

    engine.streaming.emit(AtlasStreamResult::Progress {
        sequence,
        lod,
        message: format!("building {} photo(s)", request.photos.len()),
        progress: 0.0,
    });

    if token.is_cancelled() {
        engine.streaming.finish_task(lod);
        return;
    }

    let tier = engine.config.device.performance_tier;
    let pressure = engine.memory.status().pressure;

    // Scheduling-fairness priority (§3 "drives scheduling fairness, not LOD
    // selection") tracks how urgent the *reason* for the request is: a
    // photo the viewer is actively focused on (active cell, selection)
    // gets `High` so the distributor's `PRIORITY_BASED` strategy and the
    // memory manager's eviction order favor it over ambient visible-cell
    // fill-in work.
    let photo_priority = match priority {
        AtlasPriority::ActiveCell | AtlasPriority::SelectedPhoto => PhotoPriority::High,
        AtlasPriority::PersistentCache | AtlasPriority::VisibleCells => PhotoPriority::Normal,
    };

    let items: Vec<DistributionItem> = request
        .photos
        .iter()
        .map(|photo| {
            let (width, height) = target_dimensions(photo.original_size(), lod, engine.config.scale_strategy);
            DistributionItem {
                photo: photo.clone(),
                width,
                height,
                priority: photo_priority,
            }
        })
        .collect();

    let atlas_size_estimate = engine
        .config
        .device
        .recommended_atlas_sizes
        .iter()
        .copied()
        .max()
        .unwrap_or(2048);

    let strategy = DistributionStrategy::select(pressure, tier, &items, atlas_size_estimate);
    let groups = distribute(strategy, &items, &engine.config.device.recommended_atlas_sizes, lod);

    let max_parallel = tier.max_parallel_builds_under(pressure);
    let worker_cap = tier.processor_workers_under(pressure);
    let build_engine = engine.clone();
    let build_decoder = engine.decoder.clone();
    let build_strategy = engine.config.scale_strategy;
    let build_token = token.clone();

    let results = build_all(groups, max_parallel, move |group| {
        let engine = build_engine.clone();
        let decoder = build_decoder.clone();
        let token = build_token.clone();
        async move {
            build_group(&engine, sequence, lod, priority, group, decoder, build_strategy, token, worker_cap).await
        }
    })
    .await;

    engine.streaming.finish_task(lod);

    if token.is_cancelled() {
        return;
    }

    let mut regions = Vec::new();
    let mut atlas_count = 0;

    for result in results.into_iter().flatten() {
        atlas_count += 1;
        regions.extend(result);
    }

    // GenerationFailed (§7): only when this LOD produced zero atlases for a
    // non-empty request. Per-photo decode/packing/allocation failures never
    // reach here as a `LodFailed` — they're local to `build_group`, which
    // silently drops the offending photo (or whole group) and lets the
    // others keep going (§7 "the whole request never aborts").
    if atlas_count == 0 {
        engine.streaming.emit(AtlasStreamResult::LodFailed {
            sequence,
            lod,
            error: "no atlases could be built for this LOD".to_string(),
            retryable: true,
        });
        return;
    }

    if matches!(priority, AtlasPriority::PersistentCache) {
        engine.persistent_cache_initialized.store(true, Ordering::Release);
    }

    engine.streaming.emit(AtlasStreamResult::LodReady {
        sequence,
        lod,
        atlas_count,
        regions,
        elapsed_ms: crate::stream::elapsed_ms(started),
        reason,
    });
}

async fn build_group(
    engine: &Arc<AtlasEngine>,
    sequence: u64,
    lod: LodLevel,
    priority: AtlasPriority,
    group: PhotoGroup,
    decoder: Arc<dyn ImageDecoder>,
    scale_strategy: ScaleStrategy,
    token: CancellationToken,
    worker_cap: usize,
) -> Option<Vec<AtlasRegion>> {
    if token.is_cancelled() {
        return None;
    }

    let pack_inputs: Vec<PackInput> = group
        .items
        .iter()
        .map(|item| PackInput {
            id: item.photo.clone(),
            width: item.width,
            height: item.height,
        })
        .collect();

    let pack_result = packer::pack(&pack_inputs, group.atlas_size, 2);

    if pack_result.packed.is_empty() {
        // PackingFailure (§7): every photo in this group was oversized for
        // the atlas. Recorded locally; the caller's atlas_count just stays
        // one short, it's never surfaced as a `LodFailed` on its own.
        debug!("group of {} photo(s) produced zero packable rects at size {}", pack_inputs.len(), group.atlas_size);
        return None;
    }

    if !pack_result.failed.is_empty() {
        debug!("{} photo(s) did not fit in this atlas and were dropped from the group", pack_result.failed.len());
    }

    let member_photos: Vec<PhotoRef> = pack_result.packed.iter().map(|rect| rect.id.clone()).collect();
    let byte_size = group.atlas_size as u64 * group.atlas_size as u64 * 4;
    let key = AtlasKey::new(lod, group.atlas_size, hash_photo_set(&member_photos));

    engine.memory.add_protected([key]);

    let outcome = engine.memory.request(byte_size, lod, priority);
    if !outcome.ok {
        // AllocationFailure (§7): local to this group; the distributor's
        // other groups for the same LOD may still succeed, so this is a
        // logged non-event rather than a `LodFailed`.
        engine.memory.unprotect(&key);
        debug!("insufficient atlas memory for this group (recommend {:?})", outcome.recommended_lod);
        return None;
    }

    let pixels = engine.pool.acquire(group.atlas_size);
    let atlas = Arc::new(TextureAtlas::new_empty(lod, group.atlas_size, pixels, &member_photos));

    // Photos within a group decode/downsample in parallel, bounded by the
    // device's per-tier worker cap (halved under High pressure, §4.5). Each
    // decode runs via `spawn_blocking` since it's CPU-bound work that must
    // not stall the async runtime's reactor threads.
    let semaphore = Arc::new(Semaphore::new(worker_cap.max(1)));
    let mut handles = Vec::with_capacity(pack_result.packed.len());

    for rect in pack_result.packed.clone() {
        let semaphore = semaphore.clone();
        let decoder = decoder.clone();
        let token = token.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");

            if token.is_cancelled() {
                return (rect, Err(ProcessError::Cancelled));
            }

            let blocking_token = token.clone();
            let photo_id = rect.id.clone();
            let result = tokio::task::spawn_blocking(move || {
                processor::process(decoder.as_ref(), &photo_id, lod, scale_strategy, || blocking_token.is_cancelled())
            })
            .await
            .unwrap_or(Err(ProcessError::Cancelled));

            (rect, result)
        }));
    }

    let mut regions = Vec::with_capacity(handles.len());
    let mut saw_cancellation = false;

    for handle in handles {
        let (rect, processed) = handle.await.expect("photo processing task panicked");

        let processed = match processed {
            Ok(processed) => processed,
            Err(err) if crate::stream::is_cancellation(&err) => {
                saw_cancellation = true;
                continue;
            },
            Err(err) => {
                // DecodeFailure (§7): recorded locally, never fails the
                // whole atlas — the other photos in this group still get
                // packed and published.
                debug!("photo {} failed to process: {err}", rect.id);
                continue;
            },
        };

        let region = AtlasRegion {
            photo_id: rect.id.clone(),
            atlas_rect: (rect.x, rect.y, rect.width, rect.height),
            original_size: processed.original_size,
            scaled_size: processed.scaled_size,
            aspect_ratio: processed.aspect_ratio,
            lod_level: lod,
        };

        atlas.publish_region(&rect.id, region.clone());

        {
            let mut residency = engine.residency.lock();
            let already_higher = residency.get(&rect.id).is_some_and(|(resident_lod, _)| resident_lod.level() >= lod.level());
            if !already_higher {
                residency.insert(rect.id.clone(), (lod, key));
            }
        }

        regions.push(region);
    }

    // On cancellation or total decode failure, the atlas is abandoned
    // before registration: release its pixels back to the pool rather than
    // letting them deallocate (§5 "partially packed pixel buffers are
    // released to the bitmap pool; no partial atlas is registered").
    let abandon = saw_cancellation || token.is_cancelled() || regions.is_empty();
    if abandon {
        engine.memory.unprotect(&key);
        if let Ok(mut atlas) = Arc::try_unwrap(atlas) {
            if let Some(pixels) = atlas.take_pixels() {
                engine.pool.release(group.atlas_size, pixels);
            }
        }
        return None;
    }

    engine.memory.register(key, byte_size, priority);
    engine.memory.unprotect(&key);
    engine.atlases.lock().insert(key, atlas);

    if matches!(priority, AtlasPriority::PersistentCache) {
        engine.persistent_cache_keys.lock().push(key);
    }

    Some(regions)
}

#[cfg(test)]
mod test {
    use super::*;
    use futures_util::StreamExt;
    use image::DynamicImage;
    use std::pin::pin;

    struct SolidDecoder;

    impl ImageDecoder for SolidDecoder {
        fn decode_bounds(&self, photo: &PhotoRef) -> Result<(u32, u32), ProcessError> {
            Ok(photo.original_size())
        }

        fn decode(&self, photo: &PhotoRef, sample: u32) -> Result<DynamicImage, ProcessError> {
            let (w, h) = photo.original_size();
            Ok(DynamicImage::new_rgba8((w / sample.max(1)).max(1), (h / sample.max(1)).max(1)))
        }
    }

    fn photo(name: &str) -> PhotoRef {
        PhotoRef::new(format!("test://{name}"), (1000, 1000))
    }

    #[tokio::test]
    async fn s1_cold_start_builds_persistent_cache_and_visible() {
        let config = EngineConfig {
            device: DeviceCapabilities::conservative(),
            scale_strategy: ScaleStrategy::CenterCrop,
        };
        let engine = AtlasEngine::with_decoder(config, Arc::new(SolidDecoder));
        let mut events = pin!(engine.subscribe());

        let photos: Vec<PhotoRef> = (0..5).map(|i| photo(&format!("p{i}"))).collect();

        engine.update_viewport(ViewportUpdate {
            visible_cells: vec![VisibleCell {
                photos: photos[..3].to_vec(),
            }],
            zoom: 1.0,
            selected_media: None,
            selection_mode: SelectionMode::CellMode,
            active_cell: None,
            canvas_photos: photos.clone(),
        });

        let mut ready_count = 0;
        while ready_count < 2 {
            match tokio::time::timeout(std::time::Duration::from_secs(5), events.next()).await {
                Ok(Some(AtlasStreamResult::LodReady { .. })) => ready_count += 1,
                Ok(Some(_)) => continue,
                _ => break,
            }
        }

        assert_eq!(ready_count, 2);
        assert!(engine.best_region(&photos[0]).is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_non_persistent_high_detail_atlases() {
        let config = EngineConfig::default();
        let engine = AtlasEngine::with_decoder(config, Arc::new(SolidDecoder));

        let p = photo("solo");
        let key = AtlasKey::new(LodLevel::L7, 2048, hash_photo_set(&[p.clone()]));
        engine.memory.add_protected([key]);
        engine.memory.register(key, 2048 * 2048 * 4, AtlasPriority::SelectedPhoto);
        engine.memory.unprotect(&key);

        let atlas = TextureAtlas::new_empty(LodLevel::L7, 2048, vec![0; 2048 * 2048 * 4], &[p.clone()]);
        engine.atlases.lock().insert(key, Arc::new(atlas));
        engine.residency.lock().insert(p.clone(), (LodLevel::L7, key));

        engine.cleanup_high_detail_for_deselection();

        assert!(engine.atlases.lock().is_empty());
        assert!(engine.residency.lock().is_empty());
    }

    struct FlakyDecoder {
        fails: &'static str,
    }

    impl ImageDecoder for FlakyDecoder {
        fn decode_bounds(&self, photo: &PhotoRef) -> Result<(u32, u32), ProcessError> {
            Ok(photo.original_size())
        }

        fn decode(&self, photo: &PhotoRef, sample: u32) -> Result<DynamicImage, ProcessError> {
            if photo.uri() == self.fails {
                return Err(ProcessError::Source(std::io::Error::other("synthetic decode failure")));
            }
            let (w, h) = photo.original_size();
            Ok(DynamicImage::new_rgba8((w / sample.max(1)).max(1), (h / sample.max(1)).max(1)))
        }
    }

    #[tokio::test]
    async fn per_photo_decode_failure_does_not_fail_the_whole_lod() {
        let config = EngineConfig {
            device: DeviceCapabilities::conservative(),
            scale_strategy: ScaleStrategy::CenterCrop,
        };
        let bad = photo("bad-one");
        let good = photo("good-one");
        let engine = AtlasEngine::with_decoder(config, Arc::new(FlakyDecoder { fails: bad.uri() }));
        let mut events = pin!(engine.subscribe());

        let photos = vec![good.clone(), bad.clone()];
        engine.update_viewport(ViewportUpdate {
            visible_cells: vec![VisibleCell { photos: photos.clone() }],
            zoom: 1.0,
            selected_media: None,
            selection_mode: SelectionMode::CellMode,
            active_cell: None,
            canvas_photos: photos.clone(),
        });

        let mut saw_lod_ready = false;
        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(5), events.next()).await {
                Ok(Some(AtlasStreamResult::LodReady { lod: LodLevel::L2, .. })) => {
                    saw_lod_ready = true;
                    break;
                },
                Ok(Some(AtlasStreamResult::LodFailed { lod: LodLevel::L2, .. })) => {
                    panic!("a single bad photo must not fail the whole LOD");
                },
                Ok(Some(_)) => continue,
                _ => break,
            }
        }

        assert!(saw_lod_ready);
        assert!(engine.best_region(&good).is_some());
        assert!(engine.best_region(&bad).is_none());
    }

    #[test]
    fn region_at_falls_back_to_nearest_lower_resident_lod() {
        let config = EngineConfig::default();
        let engine = AtlasEngine::with_decoder(config, Arc::new(SolidDecoder));

        let p = photo("fallback");
        let key = AtlasKey::new(LodLevel::L2, 2048, hash_photo_set(&[p.clone()]));
        engine.memory.add_protected([key]);
        engine.memory.register(key, 2048 * 2048 * 4, AtlasPriority::VisibleCells);
        engine.memory.unprotect(&key);

        let atlas = TextureAtlas::new_empty(LodLevel::L2, 2048, vec![0; 2048 * 2048 * 4], &[p.clone()]);
        let region = AtlasRegion {
            photo_id: p.clone(),
            atlas_rect: (2, 2, 128, 128),
            original_size: (1000, 1000),
            scaled_size: (128, 128),
            aspect_ratio: 1.0,
            lod_level: LodLevel::L2,
        };
        atlas.publish_region(&p, region.clone());
        engine.atlases.lock().insert(key, Arc::new(atlas));
        engine.residency.lock().insert(p.clone(), (LodLevel::L2, key));

        // Only L2 is resident; asking for L6 should fall back down to it
        // rather than returning `None`.
        let found = engine.region_at(&p, Some(LodLevel::L6)).expect("should fall back to L2");
        assert_eq!(found.lod_level, LodLevel::L2);

        // A photo with no resident atlas at all falls all the way through
        // to `None`.
        assert!(engine.region_at(&photo("never-built"), Some(LodLevel::L7)).is_none());
    }
}
