//! Initial matching cost: AD + Census with robust exponential weighting.
//!
//! For a left pixel `p` and candidate disparity `d`, the cost against the
//! right pixel `q = (x - d, y)` combines the mean absolute colour
//! difference and the Hamming distance of the two Census codes:
//! `C0 = (1 - exp(-AD / lambda_ad)) + (1 - exp(-Census / lambda_census))`.

use rayon::prelude::*;

use crate::AdCensusOptions;

/// Census window: 9 rows x 7 columns, packed row-major into a `u64`.
const CENSUS_RADIUS_Y: i32 = 4;
const CENSUS_RADIUS_X: i32 = 3;

/// Cost charged for disparity candidates whose right-image sample falls
/// outside the image: the asymptote of both robust terms summed.
const OUT_OF_RANGE_COST: f32 = 2.0;

/// Builds the initial cost volume from a rectified pair.
pub struct CostComputer {
    width: usize,
    height: usize,
    min_disparity: i32,
    max_disparity: i32,
    lambda_ad: f32,
    lambda_census: f32,

    gray_left: Vec<u8>,
    gray_right: Vec<u8>,
    census_left: Vec<u64>,
    census_right: Vec<u64>,
}

impl CostComputer {
    pub fn new(width: usize, height: usize, options: &AdCensusOptions) -> Self {
        let img_size = width * height;
        Self {
            width,
            height,
            min_disparity: options.min_disparity,
            max_disparity: options.max_disparity,
            lambda_ad: options.lambda_ad,
            lambda_census: options.lambda_census,
            gray_left: vec![0; img_size],
            gray_right: vec![0; img_size],
            census_left: vec![0; img_size],
            census_right: vec![0; img_size],
        }
    }

    /// Fill `cost_init` (layout `[y][x][d]`) from the interleaved
    /// 3-channel images.
    pub fn compute(&mut self, img_left: &[u8], img_right: &[u8], cost_init: &mut [f32]) {
        rgb_to_gray(img_left, &mut self.gray_left);
        rgb_to_gray(img_right, &mut self.gray_right);

        census_transform(&self.gray_left, &mut self.census_left, self.width, self.height);
        census_transform(
            &self.gray_right,
            &mut self.census_right,
            self.width,
            self.height,
        );

        let width = self.width;
        let disp_range = (self.max_disparity - self.min_disparity) as usize;
        let min_disparity = self.min_disparity;
        let lambda_ad = self.lambda_ad;
        let lambda_census = self.lambda_census;
        let census_left = &self.census_left;
        let census_right = &self.census_right;

        cost_init
            .par_chunks_mut(width * disp_range)
            .enumerate()
            .for_each(|(y, cost_row)| {
                for x in 0..width {
                    let lp = (y * width + x) * 3;
                    let census_l = census_left[y * width + x];

                    for d_idx in 0..disp_range {
                        let d = d_idx as i32 + min_disparity;
                        let xr = x as i32 - d;
                        let cost = &mut cost_row[x * disp_range + d_idx];

                        if xr < 0 || xr >= width as i32 {
                            *cost = OUT_OF_RANGE_COST;
                            continue;
                        }

                        let rp = (y * width + xr as usize) * 3;
                        let cost_ad = ((img_left[lp] as i32 - img_right[rp] as i32).abs()
                            + (img_left[lp + 1] as i32 - img_right[rp + 1] as i32).abs()
                            + (img_left[lp + 2] as i32 - img_right[rp + 2] as i32).abs())
                            as f32
                            / 3.0;

                        let census_r = census_right[y * width + xr as usize];
                        let cost_census = hamming_distance(census_l, census_r) as f32;

                        *cost = 1.0 - (-cost_ad / lambda_ad).exp() + 1.0
                            - (-cost_census / lambda_census).exp();
                    }
                }
            });
    }
}

/// Luminance proxy for the Census transform.
fn rgb_to_gray(img: &[u8], gray: &mut [u8]) {
    for (g, px) in gray.iter_mut().zip(img.chunks_exact(3)) {
        *g = (px[0] as f32 * 0.299 + px[1] as f32 * 0.587 + px[2] as f32 * 0.114) as u8;
    }
}

/// 9x7 Census transform with clamp-to-edge windows.
///
/// Each bit is 1 iff the window pixel is strictly darker than the centre;
/// the centre itself contributes a zero bit.
fn census_transform(gray: &[u8], census: &mut [u64], width: usize, height: usize) {
    census.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        let y = y as i32;
        for (x, code) in row.iter_mut().enumerate() {
            let x = x as i32;
            let center = gray[y as usize * width + x as usize];
            let mut value = 0u64;
            for r in -CENSUS_RADIUS_Y..=CENSUS_RADIUS_Y {
                let yy = (y + r).clamp(0, height as i32 - 1) as usize;
                for c in -CENSUS_RADIUS_X..=CENSUS_RADIUS_X {
                    let xx = (x + c).clamp(0, width as i32 - 1) as usize;
                    value <<= 1;
                    if gray[yy * width + xx] < center {
                        value |= 1;
                    }
                }
            }
            *code = value;
        }
    });
}

#[inline]
fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}
