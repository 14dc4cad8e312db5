//! Multi-step disparity refinement.
//!
//! Mutates the left disparity map in four stages: left-right consistency
//! classification into occlusions and mismatches, iterative region voting
//! over the cross-arm support regions, proper interpolation of the
//! remaining holes along 16 rays, and a cost-guided adjustment of depth
//! discontinuities. A 3x3 median filter always runs last.

use crate::aggregation::CrossArm;
use crate::util::{color_at, median_filter};
use crate::{AdCensusOptions, INVALID_FLOAT, LARGE_FLOAT};

const VOTING_ITERATIONS: usize = 5;
const INTERPOLATION_RAYS: usize = 16;
const EDGE_THRESHOLD: f32 = 5.0;

/// Refines the left disparity map after WTA selection.
pub struct MultiStepRefiner {
    width: usize,
    height: usize,
    edge_mask: Vec<u8>,
    occlusions: Vec<(i32, i32)>,
    mismatches: Vec<(i32, i32)>,
    disp_snapshot: Vec<f32>,
}

impl MultiStepRefiner {
    pub fn new(width: usize, height: usize) -> Self {
        let img_size = width * height;
        Self {
            width,
            height,
            edge_mask: vec![0; img_size],
            occlusions: Vec::new(),
            mismatches: Vec::new(),
            disp_snapshot: vec![0.0; img_size],
        }
    }

    /// Run the enabled refinement steps followed by the median filter.
    ///
    /// `cost` is the optimized volume the disparities were picked from;
    /// `arms` are the aggregator's cross arms.
    pub fn refine(
        &mut self,
        img_left: &[u8],
        cost: &[f32],
        arms: &[CrossArm],
        disp_left: &mut [f32],
        disp_right: &[f32],
        options: &AdCensusOptions,
    ) {
        if options.do_lr_check {
            self.outlier_detection(disp_left, disp_right, options.lrcheck_thres);
        }
        if options.do_filling {
            self.iterative_region_voting(arms, disp_left, options);
            self.proper_interpolation(img_left, disp_left, options);
        }
        if options.do_discontinuity_adjustment {
            self.depth_discontinuity_adjustment(cost, disp_left, options);
        }

        self.disp_snapshot.copy_from_slice(disp_left);
        median_filter(&self.disp_snapshot, disp_left, self.width, self.height, 3);
    }

    /// Step 1: classify inconsistent pixels as occlusions or mismatches
    /// and invalidate them.
    fn outlier_detection(&mut self, disp_left: &mut [f32], disp_right: &[f32], threshold: f32) {
        let width = self.width as i32;
        let height = self.height as i32;

        self.occlusions.clear();
        self.mismatches.clear();

        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) as usize;
                let disp = disp_left[idx];
                if disp == INVALID_FLOAT {
                    self.mismatches.push((x, y));
                    continue;
                }

                // Matching pixel on the right image.
                let col_right = (x as f32 - disp).round() as i32;
                if col_right >= 0 && col_right < width {
                    let disp_r = disp_right[(y * width + col_right) as usize];
                    if (disp - disp_r).abs() > threshold {
                        // Re-project through the right disparity: hidden
                        // geometry shows a larger left disparity there.
                        let col_rl = (col_right as f32 + disp_r).round() as i32;
                        if col_rl > 0 && col_rl < width {
                            let disp_l = disp_left[(y * width + col_rl) as usize];
                            if disp_l > disp {
                                self.occlusions.push((x, y));
                            } else {
                                self.mismatches.push((x, y));
                            }
                        } else {
                            self.mismatches.push((x, y));
                        }
                        disp_left[idx] = INVALID_FLOAT;
                    }
                } else {
                    disp_left[idx] = INVALID_FLOAT;
                    self.mismatches.push((x, y));
                }
            }
        }
    }

    /// Step 2: fill holes whose cross region votes decisively for one
    /// disparity. Mismatches are visited before occlusions in each of the
    /// fixed iterations; filled pixels leave their list after every pass.
    fn iterative_region_voting(
        &mut self,
        arms: &[CrossArm],
        disp_left: &mut [f32],
        options: &AdCensusOptions,
    ) {
        let width = self.width;
        let disp_range = options.disp_range();
        if disp_range <= 0 {
            return;
        }
        let min_disparity = options.min_disparity;

        let mut histogram = vec![0i32; disp_range as usize];

        for _ in 0..VOTING_ITERATIONS {
            for k in 0..2 {
                let trg_pixels = if k == 0 {
                    &mut self.mismatches
                } else {
                    &mut self.occlusions
                };

                for &(x, y) in trg_pixels.iter() {
                    let idx = y as usize * width + x as usize;
                    if disp_left[idx] != INVALID_FLOAT {
                        continue;
                    }

                    histogram.fill(0);

                    // Vertical arm first, then each pixel's horizontal arm.
                    let arm = arms[idx];
                    for t in -(arm.top as i32)..=(arm.bottom as i32) {
                        let yt = (y + t) as usize;
                        let arm2 = arms[yt * width + x as usize];
                        for s in -(arm2.left as i32)..=(arm2.right as i32) {
                            let d = disp_left[yt * width + (x + s) as usize];
                            if d != INVALID_FLOAT {
                                let di = d.round() as i32;
                                histogram[(di - min_disparity) as usize] += 1;
                            }
                        }
                    }

                    let mut best_disp = 0i32;
                    let mut max_ht = 0i32;
                    let mut count = 0i32;
                    for (d, &h) in histogram.iter().enumerate() {
                        if max_ht < h {
                            max_ht = h;
                            best_disp = d as i32;
                        }
                        count += h;
                    }

                    if max_ht > 0
                        && count > options.irv_ts
                        && max_ht as f32 / count as f32 > options.irv_th
                    {
                        disp_left[idx] = (best_disp + min_disparity) as f32;
                    }
                }

                trg_pixels
                    .retain(|&(x, y)| disp_left[y as usize * width + x as usize] == INVALID_FLOAT);
            }
        }
    }

    /// Step 3: fill the remaining holes from the first valid disparity hit
    /// along 16 rays. Mismatches copy the most colour-similar candidate,
    /// occlusions the smallest disparity (background side).
    fn proper_interpolation(
        &mut self,
        img_left: &[u8],
        disp_left: &mut [f32],
        options: &AdCensusOptions,
    ) {
        let width = self.width as i32;
        let height = self.height as i32;
        let max_search_length = options.min_disparity.abs().max(options.max_disparity.abs());

        let mut disp_collects: Vec<(usize, f32)> = Vec::with_capacity(INTERPOLATION_RAYS);

        for k in 0..2 {
            let trg_pixels = if k == 0 {
                &self.mismatches
            } else {
                &self.occlusions
            };
            if trg_pixels.is_empty() {
                continue;
            }

            // Two-phase: all fills are computed before any are written.
            let mut fill_disps = vec![INVALID_FLOAT; trg_pixels.len()];

            for (n, &(x, y)) in trg_pixels.iter().enumerate() {
                disp_collects.clear();
                let mut ang = 0.0f64;
                for _ in 0..INTERPOLATION_RAYS {
                    let sina = ang.sin();
                    let cosa = ang.cos();
                    for m in 1..max_search_length {
                        let yy = (y as f64 + m as f64 * sina).round() as i32;
                        let xx = (x as f64 + m as f64 * cosa).round() as i32;
                        if yy < 0 || yy >= height || xx < 0 || xx >= width {
                            break;
                        }
                        let d = disp_left[(yy * width + xx) as usize];
                        if d != INVALID_FLOAT {
                            disp_collects.push(((yy * width + xx) as usize, d));
                            break;
                        }
                    }
                    ang += std::f64::consts::PI / INTERPOLATION_RAYS as f64;
                }
                if disp_collects.is_empty() {
                    continue;
                }

                if k == 0 {
                    // Mismatch: the candidate whose colour best matches.
                    let color = color_at(img_left, self.width, x as usize, y as usize);
                    let mut min_dist = i32::MAX;
                    let mut best = 0.0f32;
                    for &(pixel, d) in &disp_collects {
                        let c = color_at(img_left, self.width, pixel % self.width, pixel / self.width);
                        let dist = (color[0] as i32 - c[0] as i32).abs()
                            + (color[1] as i32 - c[1] as i32).abs()
                            + (color[2] as i32 - c[2] as i32).abs();
                        if dist < min_dist {
                            min_dist = dist;
                            best = d;
                        }
                    }
                    fill_disps[n] = best;
                } else {
                    // Occlusion: the hole belongs to the background.
                    let mut min_disp = LARGE_FLOAT;
                    for &(_, d) in &disp_collects {
                        min_disp = min_disp.min(d);
                    }
                    fill_disps[n] = min_disp;
                }
            }

            for (n, &(x, y)) in trg_pixels.iter().enumerate() {
                // Holes without any candidate keep their invalid value.
                disp_left[(y * width + x) as usize] = fill_disps[n];
            }
        }
    }

    /// Step 4: on disparity edges, replace a pixel's disparity with a
    /// horizontal neighbour's when the neighbour's cost is lower.
    fn depth_discontinuity_adjustment(
        &mut self,
        cost: &[f32],
        disp_left: &mut [f32],
        options: &AdCensusOptions,
    ) {
        let width = self.width;
        let height = self.height;
        let disp_range = options.disp_range();
        if disp_range <= 0 {
            return;
        }
        let min_disparity = options.min_disparity;
        let dr = disp_range as usize;

        edge_detect(
            &mut self.edge_mask,
            disp_left,
            width,
            height,
            EDGE_THRESHOLD,
        );

        for y in 0..height {
            for x in 1..width - 1 {
                if self.edge_mask[y * width + x] != 1 {
                    continue;
                }
                let idx = y * width + x;
                let d = disp_left[idx];
                if d == INVALID_FLOAT {
                    continue;
                }

                let di = d.round() as i32 - min_disparity;
                if di < 0 || di >= disp_range {
                    continue;
                }
                let mut c0 = cost[idx * dr + di as usize];

                for k in 0..2 {
                    let x2 = if k == 0 { x - 1 } else { x + 1 };
                    let d2 = disp_left[y * width + x2];
                    if d2 == INVALID_FLOAT {
                        continue;
                    }
                    let d2i = d2.round() as i32 - min_disparity;
                    if d2i < 0 || d2i >= disp_range {
                        continue;
                    }
                    let c = cost[(y * width + x2) * dr + d2i as usize];
                    if c < c0 {
                        disp_left[idx] = d2;
                        c0 = c;
                    }
                }
            }
        }
    }
}

/// Sobel `|Gx| + |Gy|` edge mask over the disparity plane; border pixels
/// stay unmarked.
fn edge_detect(edge_mask: &mut [u8], disp: &[f32], width: usize, height: usize, threshold: f32) {
    edge_mask.fill(0);
    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let grad_x = (-disp[(y - 1) * width + x - 1] + disp[(y - 1) * width + x + 1])
                + (-2.0 * disp[y * width + x - 1] + 2.0 * disp[y * width + x + 1])
                + (-disp[(y + 1) * width + x - 1] + disp[(y + 1) * width + x + 1]);
            let grad_y = (-disp[(y - 1) * width + x - 1]
                - 2.0 * disp[(y - 1) * width + x]
                - disp[(y - 1) * width + x + 1])
                + (disp[(y + 1) * width + x - 1]
                    + 2.0 * disp[(y + 1) * width + x]
                    + disp[(y + 1) * width + x + 1]);
            let grad = grad_x.abs() + grad_y.abs();
            if grad > threshold {
                edge_mask[y * width + x] = 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_arms(width: usize, height: usize, reach: u8) -> Vec<CrossArm> {
        let mut arms = vec![CrossArm::default(); width * height];
        for y in 0..height {
            for x in 0..width {
                arms[y * width + x] = CrossArm {
                    left: (x as i32).min(reach as i32) as u8,
                    right: (width as i32 - 1 - x as i32).min(reach as i32) as u8,
                    top: (y as i32).min(reach as i32) as u8,
                    bottom: (height as i32 - 1 - y as i32).min(reach as i32) as u8,
                };
            }
        }
        arms
    }

    #[test]
    fn test_outlier_detection_classifies_and_invalidates() {
        let width = 8;
        let height = 1;
        let mut refiner = MultiStepRefiner::new(width, height);

        // Left pixel 5 claims d = 2 -> right column 3; right disagrees.
        let mut disp_left = vec![2.0f32; width];
        let mut disp_right = vec![2.0f32; width];
        disp_right[3] = 5.0; // |2 - 5| > 1, col_rl = round(3 + 5) = 8 (outside)

        refiner.outlier_detection(&mut disp_left, &disp_right, 1.0);

        // Pixel 5 disagrees with its correspondence and re-projects
        // outside the image, so it lands in the mismatch list.
        assert_eq!(disp_left[5], INVALID_FLOAT);
        assert!(refiner.mismatches.contains(&(5, 0)));
        assert!(refiner.occlusions.is_empty());
        // Pixels 0 and 1 have no correspondence at all (x - d < 0).
        assert!(refiner.mismatches.contains(&(0, 0)));
        assert_eq!(disp_left[0], INVALID_FLOAT);
        // Consistent pixels keep their disparity.
        assert_eq!(disp_left[6], 2.0);
    }

    #[test]
    fn test_outlier_detection_occlusion_branch() {
        let width = 10;
        let height = 1;
        let mut refiner = MultiStepRefiner::new(width, height);

        let mut disp_left = vec![1.0f32; width];
        disp_left[6] = 2.0; // -> right column 4
        disp_left[7] = 4.0; // read back through the re-projection
        let mut disp_right = vec![1.0f32; width];
        disp_right[4] = 3.0; // |2 - 3| > 1, col_rl = 7, disp_left[7] = 4 > 2

        refiner.outlier_detection(&mut disp_left, &disp_right, 0.5);

        assert!(refiner.occlusions.contains(&(6, 0)));
        assert_eq!(disp_left[6], INVALID_FLOAT);
    }

    #[test]
    fn test_region_voting_fills_decisive_hole() {
        let width = 9;
        let height = 9;
        let mut refiner = MultiStepRefiner::new(width, height);
        let arms = flat_arms(width, height, 4);

        let mut disp_left = vec![6.0f32; width * height];
        let hole = 4 * width + 4;
        disp_left[hole] = INVALID_FLOAT;
        refiner.mismatches.push((4, 4));

        let opts = AdCensusOptions {
            max_disparity: 16,
            ..Default::default()
        };
        refiner.iterative_region_voting(&arms, &mut disp_left, &opts);

        // 80 unanimous votes clear both the count and ratio floors.
        assert_eq!(disp_left[hole], 6.0);
        assert!(refiner.mismatches.is_empty());
    }

    #[test]
    fn test_region_voting_respects_support_floor() {
        let width = 5;
        let height = 5;
        let mut refiner = MultiStepRefiner::new(width, height);
        let arms = flat_arms(width, height, 1);

        let mut disp_left = vec![3.0f32; width * height];
        let hole = 2 * width + 2;
        disp_left[hole] = INVALID_FLOAT;
        refiner.mismatches.push((2, 2));

        // 3x3 region has at most 8 valid votes, below irv_ts = 20.
        let opts = AdCensusOptions {
            max_disparity: 16,
            ..Default::default()
        };
        refiner.iterative_region_voting(&arms, &mut disp_left, &opts);

        assert_eq!(disp_left[hole], INVALID_FLOAT);
        assert_eq!(refiner.mismatches.len(), 1);
    }

    #[test]
    fn test_interpolation_occlusion_takes_minimum() {
        let width = 16;
        let height = 16;
        let mut refiner = MultiStepRefiner::new(width, height);
        let img = vec![128u8; width * height * 3];

        // Left half background d = 5, right half foreground d = 12,
        // one occluded hole on the boundary.
        let mut disp_left: Vec<f32> = (0..width * height)
            .map(|i| if i % width < 8 { 5.0 } else { 12.0 })
            .collect();
        let hole = 8 * width + 8;
        disp_left[hole] = INVALID_FLOAT;
        refiner.occlusions.push((8, 8));

        let opts = AdCensusOptions {
            max_disparity: 32,
            ..Default::default()
        };
        refiner.proper_interpolation(&img, &mut disp_left, &opts);

        assert_eq!(disp_left[hole], 5.0);
    }

    #[test]
    fn test_interpolation_mismatch_matches_colour() {
        let width = 12;
        let height = 3;
        let mut refiner = MultiStepRefiner::new(width, height);

        // Hole at (6, 1) is dark; the nearest valid pixels left and right
        // carry different disparities, the left one shares its colour.
        let mut img = vec![200u8; width * height * 3];
        for &x in &[5usize, 6] {
            let base = (width + x) * 3;
            img[base..base + 3].copy_from_slice(&[10, 10, 10]);
        }

        let mut disp_left = vec![INVALID_FLOAT; width * height];
        for y in 0..height {
            disp_left[y * width + 5] = 4.0; // dark, colour-matching
            disp_left[y * width + 7] = 9.0; // bright
        }
        let hole = width + 6;
        refiner.mismatches.push((6, 1));

        let opts = AdCensusOptions {
            max_disparity: 16,
            ..Default::default()
        };
        refiner.proper_interpolation(&img, &mut disp_left, &opts);

        assert_eq!(disp_left[hole], 4.0);
    }

    #[test]
    fn test_interpolation_without_candidates_leaves_hole() {
        let width = 6;
        let height = 6;
        let mut refiner = MultiStepRefiner::new(width, height);
        let img = vec![50u8; width * height * 3];

        let mut disp_left = vec![INVALID_FLOAT; width * height];
        refiner.mismatches.push((3, 3));

        let opts = AdCensusOptions::default();
        refiner.proper_interpolation(&img, &mut disp_left, &opts);

        assert_eq!(disp_left[3 * width + 3], INVALID_FLOAT);
    }

    #[test]
    fn test_edge_detect_marks_disparity_step() {
        let width = 8;
        let height = 5;
        let disp: Vec<f32> = (0..width * height)
            .map(|i| if i % width < 4 { 2.0 } else { 10.0 })
            .collect();
        let mut mask = vec![0u8; width * height];
        edge_detect(&mut mask, &disp, width, height, EDGE_THRESHOLD);

        // The step between columns 3 and 4 is marked on both sides.
        assert_eq!(mask[2 * width + 3], 1);
        assert_eq!(mask[2 * width + 4], 1);
        // Flat interior stays unmarked; borders always stay unmarked.
        assert_eq!(mask[2 * width + 1], 0);
        assert_eq!(mask[0], 0);
    }

    #[test]
    fn test_discontinuity_adjustment_takes_cheaper_neighbour() {
        let width = 8;
        let height = 5;
        let mut refiner = MultiStepRefiner::new(width, height);
        let opts = AdCensusOptions {
            max_disparity: 16,
            ..Default::default()
        };
        let dr = opts.disp_range() as usize;

        let mut disp_left: Vec<f32> = (0..width * height)
            .map(|i| if i % width < 4 { 2.0 } else { 10.0 })
            .collect();

        // Costs: everything expensive except disparity 2, which is cheap
        // everywhere... so edge pixels on the foreground side fall back to
        // the background disparity of their left neighbour.
        let mut cost = vec![0.9f32; width * height * dr];
        for p in 0..width * height {
            cost[p * dr + 2] = 0.1;
        }

        refiner.depth_discontinuity_adjustment(&cost, &mut disp_left, &opts);

        assert_eq!(disp_left[2 * width + 4], 2.0);
    }
}
