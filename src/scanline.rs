//! Four-direction scanline optimization over the aggregated cost volume.
//!
//! Each sweep runs the classic previous-pixel recurrence
//! `L(p,d) = (C(p,d) + min(L(p0,d), L(p0,d-1)+P1, L(p0,d+1)+P1,
//! min_k L(p0,k)+P2)) / 2` along its direction, with the penalty pair
//! picked per disparity from colour distances in both images. The halving
//! keeps each sweep's output on the scale of its input so the four sweeps
//! compose without blow-up.

use rayon::prelude::*;

use crate::util::{color_at, color_dist};
use crate::{AdCensusOptions, LARGE_FLOAT};

/// Optimizes the cost volume along four scanline directions.
pub struct ScanlineOptimizer {
    width: usize,
    height: usize,
    min_disparity: i32,
    disp_range: usize,
    p1: f32,
    p2: f32,
    tso: i32,
}

impl ScanlineOptimizer {
    pub fn new(width: usize, height: usize, options: &AdCensusOptions) -> Self {
        Self {
            width,
            height,
            min_disparity: options.min_disparity,
            disp_range: options.disp_range() as usize,
            p1: options.so_p1,
            p2: options.so_p2,
            tso: options.so_tso,
        }
    }

    /// Run the four sweeps. `cost_aggr` holds the input volume and, after
    /// two ping-pong round trips through `cost_init`, the optimized result.
    pub fn optimize(
        &self,
        img_left: &[u8],
        img_right: &[u8],
        cost_init: &mut [f32],
        cost_aggr: &mut [f32],
    ) {
        self.sweep_horizontal(img_left, img_right, cost_aggr, cost_init, true);
        self.sweep_horizontal(img_left, img_right, cost_init, cost_aggr, false);
        self.sweep_vertical(img_left, img_right, cost_aggr, cost_init, true);
        self.sweep_vertical(img_left, img_right, cost_init, cost_aggr, false);
    }

    /// Left-to-right (`forward`) or right-to-left sweep; rows in parallel.
    fn sweep_horizontal(
        &self,
        img_left: &[u8],
        img_right: &[u8],
        src: &[f32],
        dst: &mut [f32],
        forward: bool,
    ) {
        let width = self.width;
        let disp_range = self.disp_range;
        let dir: i32 = if forward { 1 } else { -1 };

        dst.par_chunks_mut(width * disp_range)
            .enumerate()
            .for_each(|(y, dst_row)| {
                let src_row = &src[y * width * disp_range..(y + 1) * width * disp_range];

                let start_x: i32 = if forward { 0 } else { width as i32 - 1 };
                let mut color_last = color_at(img_left, width, start_x as usize, y);

                // Path head: output equals the source cost.
                let head = start_x as usize * disp_range;
                dst_row[head..head + disp_range]
                    .copy_from_slice(&src_row[head..head + disp_range]);

                let mut cost_last_path = vec![LARGE_FLOAT; disp_range + 2];
                cost_last_path[1..=disp_range].copy_from_slice(&dst_row[head..head + disp_range]);
                let mut mincost_last_path = min_of(&cost_last_path);

                let mut x = start_x + dir;
                for _ in 0..width - 1 {
                    let color = color_at(img_left, width, x as usize, y);
                    let d1 = color_dist(color, color_last);

                    let base = x as usize * disp_range;
                    for d_idx in 0..disp_range {
                        let d = d_idx as i32 + self.min_disparity;
                        let xr = x - d;

                        let mut d2 = d1;
                        if xr > 0 && xr < width as i32 - 1 {
                            let color_r = color_at(img_right, width, xr as usize, y);
                            let color_last_r =
                                color_at(img_right, width, (xr - dir) as usize, y);
                            d2 = color_dist(color_r, color_last_r);
                        }

                        let (p1, p2) = self.penalties(d1, d2);

                        let cost = src_row[base + d_idx];
                        let l1 = cost_last_path[d_idx + 1];
                        let l2 = cost_last_path[d_idx] + p1;
                        let l3 = cost_last_path[d_idx + 2] + p1;
                        let l4 = mincost_last_path + p2;
                        dst_row[base + d_idx] = (cost + l1.min(l2).min(l3.min(l4))) / 2.0;
                    }

                    cost_last_path[1..=disp_range]
                        .copy_from_slice(&dst_row[base..base + disp_range]);
                    mincost_last_path = min_of(&cost_last_path);
                    color_last = color;
                    x += dir;
                }
            });
    }

    /// Top-to-bottom (`forward`) or bottom-to-top sweep, column by column.
    fn sweep_vertical(
        &self,
        img_left: &[u8],
        img_right: &[u8],
        src: &[f32],
        dst: &mut [f32],
        forward: bool,
    ) {
        let width = self.width;
        let height = self.height;
        let disp_range = self.disp_range;
        let dir: i32 = if forward { 1 } else { -1 };

        let mut cost_last_path = vec![LARGE_FLOAT; disp_range + 2];

        for x in 0..width {
            let start_y: i32 = if forward { 0 } else { height as i32 - 1 };
            let mut color_last = color_at(img_left, width, x, start_y as usize);

            let head = (start_y as usize * width + x) * disp_range;
            dst[head..head + disp_range].copy_from_slice(&src[head..head + disp_range]);

            cost_last_path.fill(LARGE_FLOAT);
            cost_last_path[1..=disp_range].copy_from_slice(&dst[head..head + disp_range]);
            let mut mincost_last_path = min_of(&cost_last_path);

            let mut y = start_y + dir;
            for _ in 0..height - 1 {
                let color = color_at(img_left, width, x, y as usize);
                let d1 = color_dist(color, color_last);

                let base = (y as usize * width + x) * disp_range;
                for d_idx in 0..disp_range {
                    let d = d_idx as i32 + self.min_disparity;
                    let xr = x as i32 - d;

                    let mut d2 = d1;
                    if xr > 0 && xr < width as i32 - 1 {
                        let color_r = color_at(img_right, width, xr as usize, y as usize);
                        let color_last_r =
                            color_at(img_right, width, xr as usize, (y - dir) as usize);
                        d2 = color_dist(color_r, color_last_r);
                    }

                    let (p1, p2) = self.penalties(d1, d2);

                    let cost = src[base + d_idx];
                    let l1 = cost_last_path[d_idx + 1];
                    let l2 = cost_last_path[d_idx] + p1;
                    let l3 = cost_last_path[d_idx + 2] + p1;
                    let l4 = mincost_last_path + p2;
                    dst[base + d_idx] = (cost + l1.min(l2).min(l3.min(l4))) / 2.0;
                }

                cost_last_path[1..=disp_range].copy_from_slice(&dst[base..base + disp_range]);
                mincost_last_path = min_of(&cost_last_path);
                color_last = color;
                y += dir;
            }
        }
    }

    /// Penalty pair for one disparity candidate, conditioned on the colour
    /// distances along the path in the left (`d1`) and right (`d2`) images.
    #[inline]
    fn penalties(&self, d1: i32, d2: i32) -> (f32, f32) {
        if d1 < self.tso && d2 < self.tso {
            (self.p1, self.p2)
        } else if d1 < self.tso && d2 >= self.tso {
            (self.p1 / 4.0, self.p2 / 4.0)
        } else if d1 >= self.tso && d2 < self.tso {
            (self.p1 / 4.0, self.p2 / 4.0)
        } else {
            (self.p1 / 10.0, self.p2 / 10.0)
        }
    }
}

#[inline]
fn min_of(costs: &[f32]) -> f32 {
    costs.iter().copied().fold(LARGE_FLOAT, f32::min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_image(width: usize, height: usize, value: u8) -> Vec<u8> {
        vec![value; width * height * 3]
    }

    fn options(max_disparity: i32) -> AdCensusOptions {
        AdCensusOptions {
            max_disparity,
            ..Default::default()
        }
    }

    #[test]
    fn test_constant_volume_is_a_fixpoint() {
        let width = 10;
        let height = 8;
        let opts = options(4);
        let disp_range = opts.disp_range() as usize;
        let img = solid_image(width, height, 100);

        let optimizer = ScanlineOptimizer::new(width, height, &opts);
        let mut cost_init = vec![0.0f32; width * height * disp_range];
        let mut cost_aggr = vec![0.7f32; width * height * disp_range];
        optimizer.optimize(&img, &img, &mut cost_init, &mut cost_aggr);

        // With equal costs everywhere the no-change branch always wins and
        // the halved sum reproduces the input exactly.
        for &v in &cost_aggr {
            assert_eq!(v, 0.7);
        }
    }

    #[test]
    fn test_output_is_finite_and_non_negative() {
        let width = 12;
        let height = 9;
        let opts = options(6);
        let disp_range = opts.disp_range() as usize;
        let img = solid_image(width, height, 100);

        let optimizer = ScanlineOptimizer::new(width, height, &opts);
        // Deterministic pseudo-random non-negative costs.
        let mut cost_aggr: Vec<f32> = (0..width * height * disp_range)
            .map(|i| ((i * 2654435761) % 1000) as f32 / 500.0)
            .collect();
        let mut cost_init = vec![0.0f32; cost_aggr.len()];
        optimizer.optimize(&img, &img, &mut cost_init, &mut cost_aggr);

        for &v in &cost_aggr {
            assert!(v.is_finite());
            assert!(v >= 0.0);
        }
    }

    #[test]
    fn test_smoothing_pulls_outlier_towards_path() {
        let width = 8;
        let height = 1;
        let opts = options(4);
        let disp_range = opts.disp_range() as usize;
        let img = solid_image(width, height, 100);

        let optimizer = ScanlineOptimizer::new(width, height, &opts);
        // All candidates cost 1.0 except a cheap d = 1 everywhere, and one
        // pixel whose d = 1 candidate is an expensive outlier.
        let mut cost_aggr = vec![1.0f32; width * disp_range];
        for x in 0..width {
            cost_aggr[x * disp_range + 1] = 0.1;
        }
        cost_aggr[4 * disp_range + 1] = 1.0;
        let mut cost_init = vec![0.0f32; cost_aggr.len()];
        optimizer.optimize(&img, &img, &mut cost_init, &mut cost_aggr);

        // After optimization the outlier candidate is still the per-pixel
        // minimum thanks to the smoothness term.
        let base = 4 * disp_range;
        let c = &cost_aggr[base..base + disp_range];
        let min_d = (0..disp_range)
            .min_by(|&a, &b| c[a].total_cmp(&c[b]))
            .unwrap();
        assert_eq!(min_d, 1);
    }
}
