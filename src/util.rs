//! Shared pixel helpers and the disparity median filter.

use rayon::prelude::*;

/// Fetch the 3-channel pixel at `(x, y)` from an interleaved buffer.
#[inline]
pub(crate) fn color_at(img: &[u8], width: usize, x: usize, y: usize) -> [u8; 3] {
    let base = (y * width + x) * 3;
    [img[base], img[base + 1], img[base + 2]]
}

/// Colour distance: maximum componentwise absolute difference.
#[inline]
pub(crate) fn color_dist(a: [u8; 3], b: [u8; 3]) -> i32 {
    let d0 = (a[0] as i32 - b[0] as i32).abs();
    let d1 = (a[1] as i32 - b[1] as i32).abs();
    let d2 = (a[2] as i32 - b[2] as i32).abs();
    d0.max(d1).max(d2)
}

/// Window median filter over a float plane.
///
/// The window is clamped to the image; entries are ordered by their raw bit
/// pattern (`total_cmp`), so non-finite values sort to the ends and the
/// median of an all-invalid neighbourhood stays invalid.
pub fn median_filter(src: &[f32], dst: &mut [f32], width: usize, height: usize, wnd_size: usize) {
    let radius = (wnd_size / 2) as i32;

    dst.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        let y = y as i32;
        let mut wnd_data: Vec<f32> = Vec::with_capacity(wnd_size * wnd_size);
        for (x, out) in row.iter_mut().enumerate() {
            let x = x as i32;
            wnd_data.clear();
            for r in -radius..=radius {
                for c in -radius..=radius {
                    let yy = y + r;
                    let xx = x + c;
                    if yy >= 0 && yy < height as i32 && xx >= 0 && xx < width as i32 {
                        wnd_data.push(src[yy as usize * width + xx as usize]);
                    }
                }
            }
            wnd_data.sort_by(f32::total_cmp);
            *out = wnd_data[wnd_data.len() / 2];
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_FLOAT;

    #[test]
    fn test_color_dist_is_max_component() {
        assert_eq!(color_dist([10, 20, 30], [10, 20, 30]), 0);
        assert_eq!(color_dist([10, 20, 30], [15, 40, 31]), 20);
        assert_eq!(color_dist([0, 0, 255], [0, 0, 0]), 255);
    }

    #[test]
    fn test_color_at_indexing() {
        // 2x2 image, interleaved triples.
        let img = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        assert_eq!(color_at(&img, 2, 0, 0), [1, 2, 3]);
        assert_eq!(color_at(&img, 2, 1, 1), [10, 11, 12]);
    }

    #[test]
    fn test_median_filter_removes_spike() {
        let width = 5;
        let height = 5;
        let mut src = vec![1.0f32; width * height];
        src[2 * width + 2] = 50.0;

        let mut dst = vec![0.0f32; width * height];
        median_filter(&src, &mut dst, width, height, 3);

        // The spike is in the minority of every window it appears in.
        assert!(dst.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_median_filter_preserves_uniform_plane() {
        let width = 4;
        let height = 3;
        let src = vec![7.5f32; width * height];
        let mut dst = vec![0.0f32; width * height];
        median_filter(&src, &mut dst, width, height, 3);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_median_filter_invalid_neighbourhood_stays_invalid() {
        let width = 3;
        let height = 3;
        let src = vec![INVALID_FLOAT; width * height];
        let mut dst = vec![0.0f32; width * height];
        median_filter(&src, &mut dst, width, height, 3);
        assert!(dst.iter().all(|v| *v == INVALID_FLOAT));
    }
}
