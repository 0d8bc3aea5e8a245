//! Deterministic shelf rectangle packer.
//!
//! A pure function of its inputs: stable sort, first-fit shelf placement,
//! no hidden state. Used directly by tests (S4) and by the distributor's
//! shelf-feasibility pre-check.

use crate::photo::PhotoRef;

/// A rectangle to be packed, identified by its owning photo.
#[derive(Debug, Clone)]
pub struct PackInput {
    pub id: PhotoRef,
    pub width: u32,
    pub height: u32,
}

/// A rectangle placed into atlas-local pixel coordinates. `x`/`y`/`width`/
/// `height` describe the *unpadded* inner rect; the packer guarantees at
/// least `padding` pixels of clearance on every side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedRect {
    pub id: PhotoRef,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Outcome of a packing pass.
#[derive(Debug, Clone)]
pub struct PackResult {
    pub packed: Vec<PackedRect>,
    pub failed: Vec<PackInput>,
    pub utilization: f32,
}

struct Shelf {
    y_origin: u32,
    height: u32,
    x_cursor: u32,
}

/// Packs `inputs` into a single `atlas_size` × `atlas_size` bitmap with
/// `padding` pixels of clearance enforced on every side, using shelf
/// packing (§4.4).
///
/// Deterministic: a stable sort by height descending (width descending as
/// tie-breaker) followed by first-fit placement means identical input
/// sequences always yield identical output.
///
/// The usable extent along each axis is `atlas_size - padding`, reserving
/// the trailing padding strip for whichever rect lands last on an edge —
/// the leading/between-item padding is already folded into each rect's
/// padded footprint.
pub fn pack(inputs: &[PackInput], atlas_size: u32, padding: u32) -> PackResult {
    let usable = atlas_size.saturating_sub(padding);

    let mut ordered: Vec<&PackInput> = inputs.iter().collect();
    ordered.sort_by(|a, b| {
        b.height
            .cmp(&a.height)
            .then_with(|| b.width.cmp(&a.width))
    });

    let mut shelves: Vec<Shelf> = Vec::new();
    let mut packed = Vec::with_capacity(inputs.len());
    let mut failed = Vec::new();
    let mut inner_area: u64 = 0;

    for input in ordered {
        let iw = input.width + 2 * padding;
        let ih = input.height + 2 * padding;

        if iw > atlas_size || ih > atlas_size {
            failed.push(input.clone());
            continue;
        }

        let mut placed = false;

        for shelf in shelves.iter_mut() {
            if ih <= shelf.height && shelf.x_cursor + iw <= usable {
                let x_origin = shelf.x_cursor;
                shelf.x_cursor += iw;
                packed.push(PackedRect {
                    id: input.id.clone(),
                    x: x_origin + padding,
                    y: shelf.y_origin + padding,
                    width: input.width,
                    height: input.height,
                });
                inner_area += input.width as u64 * input.height as u64;
                placed = true;
                break;
            }
        }

        if placed {
            continue;
        }

        let y_origin: u32 = shelves.iter().map(|s| s.height).sum();

        if y_origin + ih <= usable {
            packed.push(PackedRect {
                id: input.id.clone(),
                x: padding,
                y: y_origin + padding,
                width: input.width,
                height: input.height,
            });
            inner_area += input.width as u64 * input.height as u64;
            shelves.push(Shelf {
                y_origin,
                height: ih,
                x_cursor: iw,
            });
        } else {
            failed.push(input.clone());
        }
    }

    let atlas_area = atlas_size as u64 * atlas_size as u64;
    let utilization = if atlas_area == 0 {
        0.0
    } else {
        inner_area as f32 / atlas_area as f32
    };

    PackResult {
        packed,
        failed,
        utilization,
    }
}

/// Simulates packing using only heights to decide whether a tentative
/// group fits, without materializing rects. Used by the distributor's
/// multi-size fill passes (§4.3 step 4b).
pub fn shelf_feasible(heights: &[u32], widths: &[u32], atlas_size: u32, padding: u32) -> bool {
    let usable = atlas_size.saturating_sub(padding);
    let mut shelves: Vec<Shelf> = Vec::new();

    for (&h, &w) in heights.iter().zip(widths.iter()) {
        let iw = w + 2 * padding;
        let ih = h + 2 * padding;

        if iw > atlas_size || ih > atlas_size {
            return false;
        }

        let mut placed = false;

        for shelf in shelves.iter_mut() {
            if ih <= shelf.height && shelf.x_cursor + iw <= usable {
                shelf.x_cursor += iw;
                placed = true;
                break;
            }
        }

        if placed {
            continue;
        }

        let y_origin: u32 = shelves.iter().map(|s| s.height).sum();

        if y_origin + ih <= usable {
            shelves.push(Shelf {
                y_origin,
                height: ih,
                x_cursor: iw,
            });
        } else {
            return false;
        }
    }

    shelves.iter().map(|s| s.height).sum::<u32>() <= usable
}

#[cfg(test)]
mod test {
    use super::*;

    fn photo(name: &str, w: u32, h: u32) -> PhotoRef {
        PhotoRef::new(name.to_string(), (w, h))
    }

    #[test]
    fn s4_packer_determinism() {
        let inputs = vec![
            PackInput {
                id: photo("a", 100, 200),
                width: 100,
                height: 200,
            },
            PackInput {
                id: photo("b", 300, 100),
                width: 300,
                height: 100,
            },
            PackInput {
                id: photo("c", 100, 200),
                width: 100,
                height: 200,
            },
        ];

        let result = pack(&inputs, 512, 2);
        assert!(result.failed.is_empty());
        assert_eq!(result.packed.len(), 3);

        assert_eq!(result.packed[0].id.uri(), "a");
        assert_eq!((result.packed[0].x, result.packed[0].y), (2, 2));
        assert_eq!((result.packed[0].width, result.packed[0].height), (100, 200));

        assert_eq!(result.packed[1].id.uri(), "c");
        assert_eq!((result.packed[1].x, result.packed[1].y), (106, 2));

        assert_eq!(result.packed[2].id.uri(), "b");
        assert_eq!((result.packed[2].x, result.packed[2].y), (2, 206));
        assert_eq!((result.packed[2].width, result.packed[2].height), (300, 100));

        let expected_utilization = (100.0 * 200.0 * 2.0 + 300.0 * 100.0) / (512.0 * 512.0);
        assert!((result.utilization - expected_utilization).abs() < 1e-6);
    }

    #[test]
    fn packed_and_failed_partition_inputs() {
        let inputs = vec![
            PackInput {
                id: photo("a", 100, 100),
                width: 100,
                height: 100,
            },
            PackInput {
                id: photo("huge", 5000, 5000),
                width: 5000,
                height: 5000,
            },
        ];

        let result = pack(&inputs, 512, 2);
        assert_eq!(result.packed.len(), 1);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].id.uri(), "huge");
    }

    #[test]
    fn oversized_single_input_fails_with_zero_utilization() {
        let inputs = vec![PackInput {
            id: photo("a", 600, 600),
            width: 600,
            height: 600,
        }];

        let result = pack(&inputs, 512, 2);
        assert!(result.packed.is_empty());
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.utilization, 0.0);
    }

    #[test]
    fn determinism_is_stable_across_repeated_calls() {
        let inputs = vec![
            PackInput {
                id: photo("x", 64, 64),
                width: 64,
                height: 64,
            },
            PackInput {
                id: photo("y", 128, 64),
                width: 128,
                height: 64,
            },
        ];

        let first = pack(&inputs, 256, 2);
        let second = pack(&inputs, 256, 2);

        let first_ids: Vec<_> = first.packed.iter().map(|r| r.id.clone()).collect();
        let second_ids: Vec<_> = second.packed.iter().map(|r| r.id.clone()).collect();
        assert_eq!(first_ids, second_ids);
    }

    /// Invariants 2 and 3 (§8): across many random input batches, `packed`
    /// and `failed` together account for every input exactly once, and
    /// packing the same batch twice yields identical placements.
    #[test]
    fn random_batches_partition_inputs_and_stay_deterministic() {
        use rand::Rng;

        let mut rng = rand::thread_rng();

        for trial in 0..200 {
            let count = rng.gen_range(1..40);
            let inputs: Vec<PackInput> = (0..count)
                .map(|i| {
                    let w = rng.gen_range(8..900);
                    let h = rng.gen_range(8..900);
                    PackInput {
                        id: photo(&format!("t{trial}-{i}"), w, h),
                        width: w,
                        height: h,
                    }
                })
                .collect();

            let first = pack(&inputs, 1024, 2);
            let second = pack(&inputs, 1024, 2);

            let mut accounted: Vec<&str> = first
                .packed
                .iter()
                .map(|r| r.id.uri())
                .chain(first.failed.iter().map(|i| i.id.uri()))
                .collect();
            let mut expected: Vec<&str> = inputs.iter().map(|i| i.id.uri()).collect();
            accounted.sort_unstable();
            expected.sort_unstable();
            assert_eq!(accounted, expected, "trial {trial}: packed+failed must equal inputs");

            let first_ids: Vec<_> = first.packed.iter().map(|r| r.id.clone()).collect();
            let second_ids: Vec<_> = second.packed.iter().map(|r| r.id.clone()).collect();
            assert_eq!(first_ids, second_ids, "trial {trial}: repeated packing must be deterministic");
        }
    }
}
