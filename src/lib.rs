//! AD-Census dense stereo matching
//!
//! This crate computes a per-pixel floating-point disparity map for the left
//! view of a rectified stereo pair. The pipeline follows the AD-Census
//! method: AD + Census matching costs, cross-based adaptive cost
//! aggregation, four-direction scanline optimization, winner-take-all
//! disparity selection with sub-pixel refinement on both views, and a
//! multi-step post-refinement (left-right check, iterative region voting,
//! proper interpolation, depth-discontinuity adjustment, median filter).

pub mod aggregation;
pub mod cost;
pub mod disparity;
pub mod parallel;
pub mod refinement;
pub mod scanline;
pub mod util;

pub use aggregation::{CrossAggregator, CrossArm};
pub use cost::CostComputer;
pub use parallel::init_thread_pool;
pub use refinement::MultiStepRefiner;
pub use scanline::ScanlineOptimizer;

use image::RgbImage;

/// Sentinel marking a pixel with no recoverable disparity.
pub const INVALID_FLOAT: f32 = f32::INFINITY;

/// Stand-in for an unattainably large matching cost.
pub const LARGE_FLOAT: f32 = 99999.0;

/// Upper bound on a single cross arm, in pixels.
pub const MAX_ARM_LENGTH: i32 = 255;

/// Number of cross-based aggregation iterations.
const AGGREGATION_ITERATIONS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Tunable parameters of the AD-Census pipeline.
///
/// `Default` yields the shipped configuration. The disparity search covers
/// `[min_disparity, max_disparity)`; the range must be non-empty.
#[derive(Debug, Clone, Copy)]
pub struct AdCensusOptions {
    pub min_disparity: i32,
    pub max_disparity: i32,
    /// Robustness scale of the AD term.
    pub lambda_ad: f32,
    /// Robustness scale of the Census term.
    pub lambda_census: f32,
    /// Maximum cross arm length.
    pub cross_l1: i32,
    /// Arm length beyond which the tighter colour threshold applies.
    pub cross_l2: i32,
    /// Colour threshold for arm growth.
    pub cross_t1: i32,
    /// Tighter colour threshold applied beyond `cross_l2`. Must be < `cross_t1`.
    pub cross_t2: i32,
    /// Scanline penalty for a one-level disparity change.
    pub so_p1: f32,
    /// Scanline penalty for larger disparity changes. Must be > `so_p1`.
    pub so_p2: f32,
    /// Colour threshold steering scanline penalty selection.
    pub so_tso: i32,
    /// Region voting support count floor.
    pub irv_ts: i32,
    /// Region voting ratio floor, in `[0, 1]`.
    pub irv_th: f32,
    /// Left-right consistency tolerance, in disparities.
    pub lrcheck_thres: f32,
    pub do_lr_check: bool,
    /// Enables region voting and proper interpolation.
    pub do_filling: bool,
    pub do_discontinuity_adjustment: bool,
}

impl Default for AdCensusOptions {
    fn default() -> Self {
        Self {
            min_disparity: 0,
            max_disparity: 64,
            lambda_ad: 10.0,
            lambda_census: 30.0,
            cross_l1: 34,
            cross_l2: 17,
            cross_t1: 20,
            cross_t2: 6,
            so_p1: 1.0,
            so_p2: 3.0,
            so_tso: 15,
            irv_ts: 20,
            irv_th: 0.4,
            lrcheck_thres: 1.0,
            do_lr_check: true,
            do_filling: true,
            do_discontinuity_adjustment: false,
        }
    }
}

impl AdCensusOptions {
    pub fn disp_range(&self) -> i32 {
        self.max_disparity - self.min_disparity
    }
}

/// Disparity map representation.
///
/// Valid entries lie in `[min_disparity - 0.5, max_disparity - 0.5]`;
/// holes carry [`INVALID_FLOAT`].
#[derive(Debug, Clone)]
pub struct DisparityMap {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub min_disparity: i32,
    pub max_disparity: i32,
}

impl DisparityMap {
    pub fn new(width: u32, height: u32, min_d: i32, max_d: i32) -> Self {
        let size = (width * height) as usize;
        Self {
            data: vec![INVALID_FLOAT; size],
            width,
            height,
            min_disparity: min_d,
            max_disparity: max_d,
        }
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        let idx = (y * self.width + x) as usize;
        self.data.get(idx).copied().unwrap_or(INVALID_FLOAT)
    }

    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let idx = (y * self.width + x) as usize;
        if let Some(cell) = self.data.get_mut(idx) {
            *cell = value;
        }
    }

    /// True when `(x, y)` is inside the map and holds a finite disparity.
    pub fn is_valid_at(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.get(x, y).is_finite()
    }
}

/// Compute a per-pixel validity mask (`true` = finite disparity).
pub fn compute_validity_mask(disparity: &DisparityMap) -> Vec<bool> {
    disparity.data.iter().map(|d| d.is_finite()).collect()
}

/// AD-Census stereo matcher.
///
/// All working buffers are allocated once at construction and reused across
/// [`compute`](AdCensusMatcher::compute) calls. Two cost volumes of extent
/// `width * height * disp_range` are ping-ponged between the aggregation
/// and scanline passes.
pub struct AdCensusMatcher {
    width: usize,
    height: usize,
    options: AdCensusOptions,

    cost_computer: CostComputer,
    aggregator: CrossAggregator,
    optimizer: ScanlineOptimizer,
    refiner: MultiStepRefiner,

    /// Initial cost volume; scratch destination during scanline sweeps.
    cost_init: Vec<f32>,
    /// Aggregated cost volume; holds the optimized costs after the sweeps.
    cost_aggr: Vec<f32>,
    disp_left: Vec<f32>,
    disp_right: Vec<f32>,
}

impl AdCensusMatcher {
    /// Allocate a matcher for images of `width x height`.
    ///
    /// Fails on zero dimensions or an empty disparity range.
    pub fn new(width: u32, height: u32, options: AdCensusOptions) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidInput(format!(
                "Image dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        if options.disp_range() <= 0 {
            return Err(Error::InvalidInput(format!(
                "Disparity range must be non-empty, got [{}, {})",
                options.min_disparity, options.max_disparity
            )));
        }

        let w = width as usize;
        let h = height as usize;
        let img_size = w * h;
        let volume_size = img_size * options.disp_range() as usize;

        Ok(Self {
            width: w,
            height: h,
            options,
            cost_computer: CostComputer::new(w, h, &options),
            aggregator: CrossAggregator::new(w, h, &options),
            optimizer: ScanlineOptimizer::new(w, h, &options),
            refiner: MultiStepRefiner::new(w, h),
            cost_init: vec![0.0; volume_size],
            cost_aggr: vec![0.0; volume_size],
            disp_left: vec![INVALID_FLOAT; img_size],
            disp_right: vec![INVALID_FLOAT; img_size],
        })
    }

    pub fn options(&self) -> &AdCensusOptions {
        &self.options
    }

    pub fn width(&self) -> u32 {
        self.width as u32
    }

    pub fn height(&self) -> u32 {
        self.height as u32
    }

    /// Match a rectified pair and return the left-view disparity map.
    ///
    /// Both images must have the dimensions the matcher was built with.
    pub fn compute(&mut self, left: &RgbImage, right: &RgbImage) -> Result<DisparityMap> {
        self.check_dimensions(left, "left")?;
        self.check_dimensions(right, "right")?;

        let img_left = left.as_raw().as_slice();
        let img_right = right.as_raw().as_slice();

        #[cfg(feature = "tracing")]
        let stage_start = std::time::Instant::now();
        self.cost_computer
            .compute(img_left, img_right, &mut self.cost_init);
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "cost computation: {:.1} ms",
            stage_start.elapsed().as_secs_f64() * 1e3
        );

        #[cfg(feature = "tracing")]
        let stage_start = std::time::Instant::now();
        self.aggregator.aggregate(
            img_left,
            &self.cost_init,
            &mut self.cost_aggr,
            AGGREGATION_ITERATIONS,
        );
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "cost aggregation: {:.1} ms",
            stage_start.elapsed().as_secs_f64() * 1e3
        );

        #[cfg(feature = "tracing")]
        let stage_start = std::time::Instant::now();
        self.optimizer.optimize(
            img_left,
            img_right,
            &mut self.cost_init,
            &mut self.cost_aggr,
        );
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "scanline optimization: {:.1} ms",
            stage_start.elapsed().as_secs_f64() * 1e3
        );

        #[cfg(feature = "tracing")]
        let stage_start = std::time::Instant::now();
        disparity::compute_left_disparity(
            &self.cost_aggr,
            &mut self.disp_left,
            self.width,
            self.height,
            &self.options,
        );
        disparity::compute_right_disparity(
            &self.cost_aggr,
            &mut self.disp_right,
            self.width,
            self.height,
            &self.options,
        );
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "disparity selection: {:.1} ms",
            stage_start.elapsed().as_secs_f64() * 1e3
        );

        #[cfg(feature = "tracing")]
        let stage_start = std::time::Instant::now();
        self.refiner.refine(
            img_left,
            &self.cost_aggr,
            self.aggregator.arms(),
            &mut self.disp_left,
            &self.disp_right,
            &self.options,
        );
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "multi-step refinement: {:.1} ms",
            stage_start.elapsed().as_secs_f64() * 1e3
        );

        let mut map = DisparityMap::new(
            self.width as u32,
            self.height as u32,
            self.options.min_disparity,
            self.options.max_disparity,
        );
        map.data.copy_from_slice(&self.disp_left);
        Ok(map)
    }

    /// Release all buffers and re-initialize for new dimensions and options.
    pub fn reset(&mut self, width: u32, height: u32, options: AdCensusOptions) -> Result<()> {
        *self = Self::new(width, height, options)?;
        Ok(())
    }

    fn check_dimensions(&self, img: &RgbImage, which: &str) -> Result<()> {
        if img.width() as usize != self.width || img.height() as usize != self.height {
            return Err(Error::DimensionMismatch(format!(
                "{} image is {}x{}, matcher was initialized for {}x{}",
                which,
                img.width(),
                img.height(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = AdCensusOptions::default();
        assert_eq!(opts.min_disparity, 0);
        assert_eq!(opts.max_disparity, 64);
        assert_eq!(opts.disp_range(), 64);
        assert!(opts.do_lr_check);
        assert!(opts.do_filling);
        assert!(!opts.do_discontinuity_adjustment);
    }

    #[test]
    fn test_new_rejects_bad_dimensions() {
        assert!(AdCensusMatcher::new(0, 10, AdCensusOptions::default()).is_err());
        assert!(AdCensusMatcher::new(10, 0, AdCensusOptions::default()).is_err());
    }

    #[test]
    fn test_new_rejects_empty_disparity_range() {
        let opts = AdCensusOptions {
            min_disparity: 32,
            max_disparity: 32,
            ..Default::default()
        };
        assert!(AdCensusMatcher::new(16, 16, opts).is_err());

        let opts = AdCensusOptions {
            min_disparity: 40,
            max_disparity: 32,
            ..Default::default()
        };
        assert!(AdCensusMatcher::new(16, 16, opts).is_err());
    }

    #[test]
    fn test_compute_rejects_mismatched_images() {
        let mut matcher = AdCensusMatcher::new(16, 16, AdCensusOptions::default()).unwrap();
        let left = RgbImage::new(16, 16);
        let right = RgbImage::new(16, 8);
        assert!(matcher.compute(&left, &right).is_err());
    }

    #[test]
    fn test_disparity_map_accessors() {
        let mut map = DisparityMap::new(8, 4, 0, 16);
        assert_eq!(map.get(3, 2), INVALID_FLOAT);
        assert!(!map.is_valid_at(3, 2));

        map.set(3, 2, 7.25);
        assert_eq!(map.get(3, 2), 7.25);
        assert!(map.is_valid_at(3, 2));
        assert!(!map.is_valid_at(8, 0));

        let mask = compute_validity_mask(&map);
        assert_eq!(mask.iter().filter(|&&v| v).count(), 1);
    }
}
