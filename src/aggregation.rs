//! Cross-based adaptive cost aggregation.
//!
//! Each pixel owns four arms whose extent is bounded by colour similarity
//! in the left image. The support region of a pixel is built two-pass:
//! one direction through the pixel, then the orthogonal arm of every pixel
//! on it. Aggregation averages the cost volume over that region,
//! alternating the leading direction across iterations.

use rayon::prelude::*;

use crate::util::{color_at, color_dist};
use crate::{AdCensusOptions, MAX_ARM_LENGTH};

/// Per-pixel cross arm lengths, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrossArm {
    pub left: u8,
    pub right: u8,
    pub top: u8,
    pub bottom: u8,
}

/// Aggregates the cost volume over per-pixel adaptive cross regions.
pub struct CrossAggregator {
    width: usize,
    height: usize,
    disp_range: usize,
    cross_l1: i32,
    cross_l2: i32,
    cross_t1: i32,
    cross_t2: i32,

    arms: Vec<CrossArm>,
    /// Support-region pixel counts: `[0]` horizontal-first, `[1]` vertical-first.
    sup_count: [Vec<u32>; 2],
    sup_count_tmp: Vec<u32>,
    plane_src: Vec<f32>,
    plane_tmp: Vec<f32>,
}

impl CrossAggregator {
    pub fn new(width: usize, height: usize, options: &AdCensusOptions) -> Self {
        let img_size = width * height;
        Self {
            width,
            height,
            disp_range: options.disp_range() as usize,
            cross_l1: options.cross_l1,
            cross_l2: options.cross_l2,
            cross_t1: options.cross_t1,
            cross_t2: options.cross_t2,
            arms: vec![CrossArm::default(); img_size],
            sup_count: [vec![0; img_size], vec![0; img_size]],
            sup_count_tmp: vec![0; img_size],
            plane_src: vec![0.0; img_size],
            plane_tmp: vec![0.0; img_size],
        }
    }

    /// The cross arms computed by the last [`aggregate`](Self::aggregate) call.
    pub fn arms(&self) -> &[CrossArm] {
        &self.arms
    }

    /// Aggregate `cost_init` into `cost_aggr` over `num_iters` iterations,
    /// starting horizontal-first.
    pub fn aggregate(
        &mut self,
        img_left: &[u8],
        cost_init: &[f32],
        cost_aggr: &mut [f32],
        num_iters: usize,
    ) {
        self.build_arms(img_left);
        self.compute_support_counts();

        cost_aggr.copy_from_slice(cost_init);

        let mut horizontal_first = true;
        for _ in 0..num_iters {
            for d_idx in 0..self.disp_range {
                self.aggregate_in_arms(d_idx, horizontal_first, cost_aggr);
            }
            horizontal_first = !horizontal_first;
        }
    }

    fn build_arms(&mut self, img_left: &[u8]) {
        let width = self.width;
        let height = self.height;
        let cross_l1 = self.cross_l1;
        let cross_l2 = self.cross_l2;
        let cross_t1 = self.cross_t1;
        let cross_t2 = self.cross_t2;

        self.arms.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            for (x, arm) in row.iter_mut().enumerate() {
                let grow = |dx: i32, dy: i32| -> u8 {
                    arm_length(
                        img_left, width, height, x as i32, y as i32, dx, dy, cross_l1, cross_l2,
                        cross_t1, cross_t2,
                    )
                };
                *arm = CrossArm {
                    left: grow(-1, 0),
                    right: grow(1, 0),
                    top: grow(0, -1),
                    bottom: grow(0, 1),
                };
            }
        });
    }

    /// Precompute the support-region size for both pass orientations.
    fn compute_support_counts(&mut self) {
        let width = self.width;
        let arms = &self.arms;

        for id in 0..2 {
            let horizontal_first = id == 0;

            // Pass 1: extent of the first-direction arm.
            self.sup_count_tmp
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| {
                    for (x, count) in row.iter_mut().enumerate() {
                        let arm = arms[y * width + x];
                        *count = if horizontal_first {
                            arm.left as u32 + arm.right as u32 + 1
                        } else {
                            arm.top as u32 + arm.bottom as u32 + 1
                        };
                    }
                });

            // Pass 2: sum those extents along the second-direction arm.
            let tmp = &self.sup_count_tmp;
            self.sup_count[id]
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| {
                    for (x, count) in row.iter_mut().enumerate() {
                        let arm = arms[y * width + x];
                        let mut sum = 0u32;
                        if horizontal_first {
                            for t in -(arm.top as i32)..=(arm.bottom as i32) {
                                sum += tmp[(y as i32 + t) as usize * width + x];
                            }
                        } else {
                            for s in -(arm.left as i32)..=(arm.right as i32) {
                                sum += tmp[y * width + (x as i32 + s) as usize];
                            }
                        }
                        *count = sum;
                    }
                });
        }
    }

    /// One two-pass aggregation of a single disparity slice, in place.
    fn aggregate_in_arms(&mut self, d_idx: usize, horizontal_first: bool, cost_aggr: &mut [f32]) {
        let width = self.width;
        let disp_range = self.disp_range;

        // Extract the disparity slice into a contiguous plane.
        {
            let cost_view: &[f32] = cost_aggr;
            self.plane_src
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| {
                    let base = y * width * disp_range;
                    for (x, v) in row.iter_mut().enumerate() {
                        *v = cost_view[base + x * disp_range + d_idx];
                    }
                });
        }

        let arms = &self.arms;

        // Pass 1: sum along each pixel's first-direction arm.
        {
            let src = &self.plane_src;
            self.plane_tmp
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| {
                    for (x, out) in row.iter_mut().enumerate() {
                        let arm = arms[y * width + x];
                        let mut sum = 0.0f32;
                        if horizontal_first {
                            for s in -(arm.left as i32)..=(arm.right as i32) {
                                sum += src[y * width + (x as i32 + s) as usize];
                            }
                        } else {
                            for t in -(arm.top as i32)..=(arm.bottom as i32) {
                                sum += src[(y as i32 + t) as usize * width + x];
                            }
                        }
                        *out = sum;
                    }
                });
        }

        // Pass 2: sum along the second-direction arm, average, write back.
        let tmp = &self.plane_tmp;
        let sup = if horizontal_first {
            &self.sup_count[0]
        } else {
            &self.sup_count[1]
        };
        cost_aggr
            .par_chunks_mut(width * disp_range)
            .enumerate()
            .for_each(|(y, cost_row)| {
                for x in 0..width {
                    let arm = arms[y * width + x];
                    let mut sum = 0.0f32;
                    if horizontal_first {
                        for t in -(arm.top as i32)..=(arm.bottom as i32) {
                            sum += tmp[(y as i32 + t) as usize * width + x];
                        }
                    } else {
                        for s in -(arm.left as i32)..=(arm.right as i32) {
                            sum += tmp[y * width + (x as i32 + s) as usize];
                        }
                    }
                    cost_row[x * disp_range + d_idx] = sum / sup[y * width + x] as f32;
                }
            });
    }
}

/// Length of the arm grown from `(x, y)` along `(dx, dy)`.
///
/// A step is accepted while it stays inside the image, within
/// `min(cross_l1, MAX_ARM_LENGTH)` steps, closer than `cross_t1` to both
/// the centre colour and the previous step's colour, and closer than
/// `cross_t2` to the centre once the arm exceeds `cross_l2`.
#[allow(clippy::too_many_arguments)]
fn arm_length(
    img: &[u8],
    width: usize,
    height: usize,
    x: i32,
    y: i32,
    dx: i32,
    dy: i32,
    cross_l1: i32,
    cross_l2: i32,
    cross_t1: i32,
    cross_t2: i32,
) -> u8 {
    let color0 = color_at(img, width, x as usize, y as usize);
    let mut color_last = color0;
    let mut xn = x + dx;
    let mut yn = y + dy;
    let mut len = 0u8;

    let max_steps = cross_l1.min(MAX_ARM_LENGTH);
    for n in 0..max_steps {
        if xn < 0 || xn >= width as i32 || yn < 0 || yn >= height as i32 {
            break;
        }
        let color = color_at(img, width, xn as usize, yn as usize);

        let dist_center = color_dist(color, color0);
        if dist_center >= cross_t1 {
            break;
        }
        if n > 0 && color_dist(color, color_last) >= cross_t1 {
            break;
        }
        if n + 1 > cross_l2 && dist_center >= cross_t2 {
            break;
        }

        len += 1;
        color_last = color;
        xn += dx;
        yn += dy;
    }
    len
}
