//! Winner-take-all disparity selection with parabolic sub-pixel refinement.

use rayon::prelude::*;

use crate::{AdCensusOptions, INVALID_FLOAT, LARGE_FLOAT};

/// Left-view WTA over the optimized cost volume.
///
/// Boundary winners (`d = min` or `d = max - 1`) cannot be sub-pixel
/// refined and are marked invalid.
pub(crate) fn compute_left_disparity(
    cost: &[f32],
    disparity: &mut [f32],
    width: usize,
    height: usize,
    options: &AdCensusOptions,
) {
    let disp_range = options.disp_range() as usize;
    let min_disparity = options.min_disparity;
    debug_assert_eq!(cost.len(), width * height * disp_range);

    disparity
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, disp_row)| {
            for (x, out) in disp_row.iter_mut().enumerate() {
                let base = (y * width + x) * disp_range;
                let costs = &cost[base..base + disp_range];

                let mut min_cost = LARGE_FLOAT;
                let mut best = 0usize;
                for (d_idx, &c) in costs.iter().enumerate() {
                    if c < min_cost {
                        min_cost = c;
                        best = d_idx;
                    }
                }

                if best == 0 || best == disp_range - 1 {
                    *out = INVALID_FLOAT;
                    continue;
                }

                *out = subpixel(
                    (best as i32 + min_disparity) as f32,
                    costs[best - 1],
                    costs[best + 1],
                    min_cost,
                );
            }
        });
}

/// Right-view WTA, addressing the left-view volume at `(y, j + d, d)`.
///
/// Candidates reaching outside the image cost [`LARGE_FLOAT`]; boundary
/// winners keep their integer disparity rather than going invalid.
pub(crate) fn compute_right_disparity(
    cost: &[f32],
    disparity: &mut [f32],
    width: usize,
    height: usize,
    options: &AdCensusOptions,
) {
    let disp_range = options.disp_range() as usize;
    let min_disparity = options.min_disparity;
    debug_assert_eq!(cost.len(), width * height * disp_range);

    disparity
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, disp_row)| {
            let mut cost_local = vec![0.0f32; disp_range];
            for (x, out) in disp_row.iter_mut().enumerate() {
                let mut min_cost = LARGE_FLOAT;
                let mut best = 0usize;

                for (d_idx, slot) in cost_local.iter_mut().enumerate() {
                    let d = d_idx as i32 + min_disparity;
                    let col_left = x as i32 + d;
                    *slot = if col_left >= 0 && col_left < width as i32 {
                        cost[(y * width + col_left as usize) * disp_range + d_idx]
                    } else {
                        LARGE_FLOAT
                    };
                    if *slot < min_cost {
                        min_cost = *slot;
                        best = d_idx;
                    }
                }

                if best == 0 || best == disp_range - 1 {
                    *out = (best as i32 + min_disparity) as f32;
                    continue;
                }

                *out = subpixel(
                    (best as i32 + min_disparity) as f32,
                    cost_local[best - 1],
                    cost_local[best + 1],
                    min_cost,
                );
            }
        });
}

/// Parabola through the winner and its two neighbours; falls back to the
/// integer disparity when the three costs are collinear.
#[inline]
fn subpixel(best_disparity: f32, cost_1: f32, cost_2: f32, min_cost: f32) -> f32 {
    let denom = cost_1 + cost_2 - 2.0 * min_cost;
    if denom != 0.0 {
        best_disparity + (cost_1 - cost_2) / (denom * 2.0)
    } else {
        best_disparity
    }
}
