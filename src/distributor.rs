//! Dynamic atlas pool: strategy selection, photo-to-atlas distribution, and
//! bounded-parallel atlas building (§4.3).

use std::sync::Arc;

use log::debug;
use tokio::sync::Semaphore;

use crate::device::PerformanceTier;
use crate::memory::Pressure;
use crate::packer::shelf_feasible;
use crate::photo::{LodLevel, PhotoPriority, PhotoRef};

/// A photo queued for distribution, sized at its target LOD resolution.
#[derive(Debug, Clone)]
pub struct DistributionItem {
    pub photo: PhotoRef,
    pub width: u32,
    pub height: u32,
    pub priority: PhotoPriority,
}

impl DistributionItem {
    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// How photos are split across one or more atlases of possibly different
/// sizes. A plain tagged variant, matched with `match` — no dynamic
/// dispatch, per the redesign flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionStrategy {
    SingleSize,
    MultiSize,
    PriorityBased,
}

impl DistributionStrategy {
    /// Chooses a strategy from pressure, device tier, photo count estimate,
    /// and whether any `HIGH`-priority photos are present (§4.3).
    pub fn select(
        pressure: Pressure,
        tier: PerformanceTier,
        items: &[DistributionItem],
        atlas_size_estimate: u32,
    ) -> DistributionStrategy {
        if pressure == Pressure::Critical {
            return DistributionStrategy::SingleSize;
        }

        if pressure == Pressure::High {
            return DistributionStrategy::SingleSize;
        }

        let has_high_priority = items.iter().any(|i| i.priority == PhotoPriority::High);

        if has_high_priority {
            return DistributionStrategy::PriorityBased;
        }

        if estimate_atlas_count(items, atlas_size_estimate) <= 1 {
            return DistributionStrategy::SingleSize;
        }

        match tier {
            PerformanceTier::High => DistributionStrategy::PriorityBased,
            PerformanceTier::Medium | PerformanceTier::Low => DistributionStrategy::MultiSize,
        }
    }
}

/// A group of photos destined for a single atlas of `atlas_size`.
#[derive(Debug, Clone)]
pub struct PhotoGroup {
    pub atlas_size: u32,
    pub items: Vec<DistributionItem>,
}

impl PhotoGroup {
    fn area(&self) -> u64 {
        self.items.iter().map(DistributionItem::area).sum()
    }

    fn utilization(&self) -> f32 {
        let usable = usable_area(self.atlas_size);
        if usable == 0 {
            0.0
        } else {
            self.area() as f32 / usable as f32
        }
    }
}

const PADDING: u32 = 2;
const USABLE_FRACTION: f64 = 0.9;

fn usable_area(atlas_size: u32) -> u64 {
    ((atlas_size as u64 * atlas_size as u64) as f64 * USABLE_FRACTION) as u64
}

/// `ceil(sum(photo_area) / (atlas_area * 0.9))`, per §4.3.
pub fn estimate_atlas_count(items: &[DistributionItem], atlas_size: u32) -> usize {
    let usable = usable_area(atlas_size);
    if usable == 0 {
        return items.len();
    }

    let total_area: u64 = items.iter().map(DistributionItem::area).sum();
    (total_area as f64 / usable as f64).ceil() as usize
}

fn min_photos_per_atlas(lod: LodLevel) -> usize {
    match lod {
        LodLevel::L5 | LodLevel::L6 | LodLevel::L7 => 1,
        LodLevel::L4 => 2,
        LodLevel::L2 | LodLevel::L3 => 3,
        _ => 4,
    }
}

fn fits_group(group: &[DistributionItem], candidate: &DistributionItem, atlas_size: u32) -> bool {
    let current_area: u64 = group.iter().map(DistributionItem::area).sum();

    if current_area + candidate.area() > usable_area(atlas_size) {
        return false;
    }

    let mut heights: Vec<u32> = group.iter().map(|i| i.height).collect();
    let mut widths: Vec<u32> = group.iter().map(|i| i.width).collect();
    heights.push(candidate.height);
    widths.push(candidate.width);

    shelf_feasible(&heights, &widths, atlas_size, PADDING)
}

/// Greedy fill by area, emitting groups until all photos are placed. Falls
/// back to one-per-group if even a single photo doesn't fit.
pub fn single_size(items: &[DistributionItem], size: u32) -> Vec<PhotoGroup> {
    let mut remaining: Vec<DistributionItem> = items.to_vec();
    remaining.sort_by(|a, b| b.area().cmp(&a.area()));

    let mut groups = Vec::new();

    while !remaining.is_empty() {
        let mut group: Vec<DistributionItem> = Vec::new();
        let mut i = 0;

        while i < remaining.len() {
            if fits_group(&group, &remaining[i], size) {
                group.push(remaining.remove(i));
            } else {
                i += 1;
            }
        }

        if group.is_empty() {
            // Emergency fallback: the lone remaining photo doesn't fit even
            // alone at this size; give it its own group anyway so no photo
            // is silently dropped.
            group.push(remaining.remove(0));
        }

        groups.push(PhotoGroup {
            atlas_size: size,
            items: group,
        });
    }

    groups
}

/// Sorts by area descending, walks candidate atlas sizes, and fills groups
/// subject to the shelf-feasibility check and LOD-specific minimum
/// occupancy (§4.3 `MULTI_SIZE`).
pub fn multi_size(items: &[DistributionItem], sizes: &[u32], lod: LodLevel) -> Vec<PhotoGroup> {
    let mut remaining: Vec<DistributionItem> = items.to_vec();
    remaining.sort_by(|a, b| b.area().cmp(&a.area()));

    let min_per_atlas = min_photos_per_atlas(lod);
    let min_utilization = if lod.level() >= LodLevel::L4.level() {
        0.3
    } else {
        0.5
    };

    let mut ordered_sizes = sizes.to_vec();
    if lod.level() >= LodLevel::L5.level() {
        ordered_sizes.sort_unstable_by(|a, b| b.cmp(a));
    } else {
        ordered_sizes.sort_unstable();
    }

    let mut groups = Vec::new();

    'sizes: for &size in &ordered_sizes {
        if remaining.is_empty() {
            break;
        }

        for pass in 0..3 {
            if remaining.is_empty() {
                continue 'sizes;
            }

            let mut group: Vec<DistributionItem> = Vec::new();
            let mut i = 0;

            while i < remaining.len() {
                if fits_group(&group, &remaining[i], size) {
                    group.push(remaining.remove(i));
                } else {
                    i += 1;
                }
            }

            if group.is_empty() {
                continue;
            }

            let candidate = PhotoGroup {
                atlas_size: size,
                items: group,
            };

            let is_final_pass = pass == 2 || remaining.is_empty();
            let meets_minimums =
                candidate.items.len() >= min_per_atlas && candidate.utilization() >= min_utilization;

            if meets_minimums || is_final_pass {
                groups.push(candidate);
            } else {
                // Put the photos back; they'll be reconsidered on a later
                // pass or a different size.
                remaining.extend(candidate.items);
                remaining.sort_by(|a, b| b.area().cmp(&a.area()));
            }
        }
    }

    if lod.level() >= LodLevel::L5.level() && !remaining.is_empty() {
        // Back-merge into existing groups with a more generous budget before
        // falling back to a single optimally-sized group.
        let mut still_remaining = Vec::new();

        for item in remaining {
            let merged = groups.iter_mut().any(|g| {
                if fits_group(&g.items, &item, g.atlas_size) {
                    g.items.push(item.clone());
                    true
                } else {
                    false
                }
            });

            if !merged {
                still_remaining.push(item);
            }
        }

        if !still_remaining.is_empty() {
            let ideal = ideal_size_for(&still_remaining, sizes);
            groups.push(PhotoGroup {
                atlas_size: ideal,
                items: still_remaining,
            });
        }
    } else if !remaining.is_empty() {
        let smallest = sizes.iter().copied().min().unwrap_or(2048);
        groups.extend(single_size(&remaining, smallest));
    }

    groups
}

fn ideal_size_for(items: &[DistributionItem], available_sizes: &[u32]) -> u32 {
    let total_area: u64 = items.iter().map(DistributionItem::area).sum();
    let max_edge = items.iter().map(|i| i.width.max(i.height)).max().unwrap_or(0);

    let mut sorted_sizes = available_sizes.to_vec();
    sorted_sizes.sort_unstable();

    for &size in &sorted_sizes {
        if (size as u64 * size as u64) as f64 * USABLE_FRACTION >= total_area as f64 && size >= max_edge {
            return size;
        }
    }

    sorted_sizes.last().copied().unwrap_or(2048)
}

/// Splits by priority; `HIGH` photos get the full size set via
/// `MULTI_SIZE` at the requested LOD, `NORMAL` photos get a reduced set
/// (§4.3 `PRIORITY_BASED`).
pub fn priority_based(items: &[DistributionItem], sizes: &[u32], lod: LodLevel) -> Vec<PhotoGroup> {
    let (high, normal): (Vec<_>, Vec<_>) = items
        .iter()
        .cloned()
        .partition(|i| i.priority == PhotoPriority::High);

    let mut groups = multi_size(&high, sizes, lod);

    let normal_sizes: Vec<u32> = if lod.level() >= LodLevel::L4.level() {
        sizes.iter().copied().filter(|&s| s == 2048).collect()
    } else if lod.level() >= LodLevel::L2.level() {
        sizes.iter().copied().filter(|&s| s <= 4096).collect()
    } else {
        sizes.to_vec()
    };

    let normal_sizes = if normal_sizes.is_empty() {
        sizes.to_vec()
    } else {
        normal_sizes
    };

    groups.extend(multi_size(&normal, &normal_sizes, lod));
    groups
}

/// Distributes `items` according to `strategy`.
pub fn distribute(
    strategy: DistributionStrategy,
    items: &[DistributionItem],
    sizes: &[u32],
    lod: LodLevel,
) -> Vec<PhotoGroup> {
    if items.is_empty() {
        return Vec::new();
    }

    match strategy {
        DistributionStrategy::SingleSize => {
            let size = sizes.iter().copied().min().unwrap_or(2048);
            single_size(items, size)
        },
        DistributionStrategy::MultiSize => multi_size(items, sizes, lod),
        DistributionStrategy::PriorityBased => priority_based(items, sizes, lod),
    }
}

/// Runs `build_one` over `groups` with at most `max_parallel` builds
/// in flight at any time. Uses a semaphore rather than explicit chunking;
/// bounded concurrency yields the same "waves complete before the next
/// starts" behavior as an emergent property.
pub async fn build_all<F, Fut, T>(
    groups: Vec<PhotoGroup>,
    max_parallel: usize,
    build_one: F,
) -> Vec<T>
where
    F: Fn(PhotoGroup) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let build_one = Arc::new(build_one);
    let mut tasks = Vec::with_capacity(groups.len());

    for group in groups {
        let semaphore = semaphore.clone();
        let build_one = build_one.clone();

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            debug!("building atlas group ({} photos)", group.items.len());
            build_one(group).await
        }));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        if let Ok(value) = task.await {
            results.push(value);
        }
    }

    results
}
