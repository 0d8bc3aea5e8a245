//! LOD selector & deduplication: maps viewport state to a prioritized,
//! deduplicated set of generation requests (§4.1).

use hashbrown::HashMap;

use crate::photo::{AtlasPriority, LodLevel, PhotoRef};

/// Which of a cell's photos is considered "selected" for quality-boost
/// purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    CellMode,
    PhotoMode,
}

/// A single visible hex cell's contents, in cell-major / in-cell order.
#[derive(Debug, Clone)]
pub struct VisibleCell {
    pub photos: Vec<PhotoRef>,
}

/// The caller-supplied viewport state driving selection.
#[derive(Debug, Clone)]
pub struct ViewportState {
    pub visible_cells: Vec<VisibleCell>,
    pub zoom: f32,
    pub selected_media: Option<PhotoRef>,
    pub selection_mode: SelectionMode,
    pub active_cell: Option<VisibleCell>,
    pub persistent_cache_initialized: bool,
    pub canvas_photos: Vec<PhotoRef>,
}

/// One of the four atlas-priority requests the selector can emit.
#[derive(Debug, Clone)]
pub struct PriorityRequest {
    pub priority: AtlasPriority,
    pub photos: Vec<PhotoRef>,
    pub lod: LodLevel,
    pub reason: &'static str,
}

/// The highest LOD each photo is currently resident at, across all
/// registered atlases. Rebuilt from the memory manager's registry on every
/// `select` call.
pub type ExistingResidency = HashMap<PhotoRef, LodLevel>;

fn dedup_insertion_order(photos: Vec<PhotoRef>) -> Vec<PhotoRef> {
    let mut seen = hashbrown::HashSet::with_capacity(photos.len());
    photos.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

/// Builds the ordered list of candidate requests before deduplication
/// (§4.1 "Output" + "Rules").
fn candidate_requests(view: &ViewportState) -> Vec<PriorityRequest> {
    let mut requests = Vec::with_capacity(4);
    let base_lod = LodLevel::for_zoom(view.zoom);

    if !view.persistent_cache_initialized {
        requests.push(PriorityRequest {
            priority: AtlasPriority::PersistentCache,
            photos: dedup_insertion_order(view.canvas_photos.clone()),
            lod: AtlasPriority::PersistentCache.quality().apply(LodLevel::L0),
            reason: "persistent cache not yet initialized",
        });
    }

    let visible_photos: Vec<PhotoRef> = view
        .visible_cells
        .iter()
        .flat_map(|cell| cell.photos.iter().cloned())
        .filter(|p| {
            if view.selection_mode == SelectionMode::PhotoMode {
                Some(p) != view.selected_media.as_ref()
            } else {
                true
            }
        })
        .collect();

    requests.push(PriorityRequest {
        priority: AtlasPriority::VisibleCells,
        photos: dedup_insertion_order(visible_photos),
        lod: AtlasPriority::VisibleCells.quality().apply(base_lod),
        reason: "visible cells",
    });

    if view.selection_mode == SelectionMode::CellMode {
        if let Some(active) = &view.active_cell {
            requests.push(PriorityRequest {
                priority: AtlasPriority::ActiveCell,
                photos: dedup_insertion_order(active.photos.clone()),
                lod: AtlasPriority::ActiveCell.quality().apply(base_lod),
                reason: "active cell enhancement",
            });
        }
    }

    if view.selection_mode == SelectionMode::PhotoMode {
        if let Some(selected) = &view.selected_media {
            requests.push(PriorityRequest {
                priority: AtlasPriority::SelectedPhoto,
                photos: vec![selected.clone()],
                lod: AtlasPriority::SelectedPhoto.quality().apply(base_lod),
                reason: "selected photo",
            });
        }
    }

    requests
}

/// Retains only photos not already resident at an LOD `>=` the request's
/// target, then drops requests that become empty. This is the sole
/// early-exit mechanism (§4.1 "Upfront deduplication").
fn dedup_against_residency(
    requests: Vec<PriorityRequest>,
    existing: &ExistingResidency,
) -> Vec<PriorityRequest> {
    requests
        .into_iter()
        .filter_map(|mut req| {
            req.photos.retain(|p| match existing.get(p) {
                Some(resident_lod) => resident_lod.level() < req.lod.level(),
                None => true,
            });

            if req.photos.is_empty() {
                None
            } else {
                Some(req)
            }
        })
        .collect()
}

/// Pure function: `(viewport, residency snapshot) -> requests`. No hidden
/// state, so it's unit-testable without standing up the rest of the
/// engine.
pub fn select(view: &ViewportState, existing: &ExistingResidency) -> Vec<PriorityRequest> {
    let candidates = candidate_requests(view);
    dedup_against_residency(candidates, existing)
}

#[cfg(test)]
mod test {
    use super::*;

    fn photo(name: &str) -> PhotoRef {
        PhotoRef::new(name.to_string(), (100, 100))
    }

    fn base_view() -> ViewportState {
        ViewportState {
            visible_cells: vec![VisibleCell {
                photos: vec![photo("a"), photo("b"), photo("c")],
            }],
            zoom: 1.0,
            selected_media: None,
            selection_mode: SelectionMode::CellMode,
            active_cell: None,
            persistent_cache_initialized: true,
            canvas_photos: vec![photo("a"), photo("b"), photo("c"), photo("d"), photo("e")],
        }
    }

    #[test]
    fn s1_cold_start_emits_persistent_cache_and_visible() {
        let mut view = base_view();
        view.persistent_cache_initialized = false;

        let requests = select(&view, &ExistingResidency::new());
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].priority, AtlasPriority::PersistentCache);
        assert_eq!(requests[0].photos.len(), 5);
        assert_eq!(requests[1].priority, AtlasPriority::VisibleCells);
        assert_eq!(requests[1].lod, LodLevel::L2);
    }

    #[test]
    fn s3_selected_photo_excluded_from_visible_request() {
        let mut view = base_view();
        view.selection_mode = SelectionMode::PhotoMode;
        view.selected_media = Some(photo("a"));

        let requests = select(&view, &ExistingResidency::new());
        let visible = requests
            .iter()
            .find(|r| r.priority == AtlasPriority::VisibleCells)
            .unwrap();
        assert!(!visible.photos.contains(&photo("a")));

        let selected = requests
            .iter()
            .find(|r| r.priority == AtlasPriority::SelectedPhoto)
            .unwrap();
        assert_eq!(selected.photos, vec![photo("a")]);
        assert_eq!(selected.lod, LodLevel::L7);
    }

    #[test]
    fn dedup_drops_already_resident_photos() {
        let view = base_view();
        let mut existing = ExistingResidency::new();
        existing.insert(photo("a"), LodLevel::L7);
        existing.insert(photo("b"), LodLevel::L7);
        existing.insert(photo("c"), LodLevel::L7);

        let requests = select(&view, &existing);
        // Every visible photo is already resident at L7, above the
        // requested L2, so the visible-cells request disappears entirely.
        assert!(requests.iter().all(|r| r.priority != AtlasPriority::VisibleCells));
    }

    #[test]
    fn dedup_is_idempotent() {
        let view = base_view();
        let first = select(&view, &ExistingResidency::new());
        let second = select(&view, &ExistingResidency::new());
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn active_cell_enhancement_noop_when_already_at_l7() {
        let mut view = base_view();
        view.zoom = 100.0; // forces base_lod = L7
        view.active_cell = Some(VisibleCell {
            photos: vec![photo("f")],
        });

        let requests = select(&view, &ExistingResidency::new());
        let active = requests
            .iter()
            .find(|r| r.priority == AtlasPriority::ActiveCell)
            .unwrap();
        // Enhanced quality is `min(L+1, L7)`; already at L7 there is no
        // extra request beyond what VisibleCells would already produce.
        assert_eq!(active.lod, LodLevel::L7);
    }

    #[test]
    fn empty_visible_set_yields_no_requests() {
        let view = ViewportState {
            visible_cells: vec![],
            zoom: 1.0,
            selected_media: None,
            selection_mode: SelectionMode::CellMode,
            active_cell: None,
            persistent_cache_initialized: true,
            canvas_photos: vec![],
        };

        let requests = select(&view, &ExistingResidency::new());
        assert!(requests.is_empty());
    }
}
