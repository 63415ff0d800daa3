//! Resampling kernels for non 1:1 raster I/O
//!
//! Coordinates are continuous raster coordinates: pixel `i` covers
//! `[i, i + 1)` and its center sits at `i + 0.5`. Kernel taps outside the
//! raster are clamped to the nearest edge pixel.

use rastercache_common::{ResampleAlg, Result};

/// Bilinear weights for the taps at `floor` and `floor + 1`
pub fn bilinear_weights(t: f64) -> [f64; 2] {
    [1.0 - t, t]
}

/// Catmull-Rom (a = -0.5) weights for the taps at `floor - 1 ..= floor + 2`
pub fn cubic_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        -0.5 * t3 + t2 - 0.5 * t,
        1.5 * t3 - 2.5 * t2 + 1.0,
        -1.5 * t3 + 2.0 * t2 + 0.5 * t,
        0.5 * t3 - 0.5 * t2,
    ]
}

fn clamp_index(i: i64, len: usize) -> usize {
    let max = i64::try_from(len.saturating_sub(1)).unwrap_or(i64::MAX);
    i.clamp(0, max) as usize
}

/// Split a continuous coordinate into its base tap and fractional offset
fn split(coord: f64) -> (i64, f64) {
    let shifted = coord - 0.5;
    let base = shifted.floor();
    (base as i64, shifted - base)
}

/// Index of the pixel containing a continuous coordinate, clamped to
/// `[lo, hi)`
pub fn nearest_index(coord: f64, lo: usize, hi: usize) -> usize {
    let i = coord.floor();
    if i < lo as f64 {
        lo
    } else {
        (i as usize).min(hi.saturating_sub(1))
    }
}

/// Interpolate at `(x, y)` with a separable kernel
///
/// `sample` returns the value of one raster pixel. `Nearest` and `Average`
/// are not separable kernels and fall back to nearest here.
pub fn interpolate<F>(
    alg: ResampleAlg,
    x: f64,
    y: f64,
    width: usize,
    height: usize,
    mut sample: F,
) -> Result<f64>
where
    F: FnMut(usize, usize) -> Result<f64>,
{
    match alg {
        ResampleAlg::Bilinear => {
            let (x0, tx) = split(x);
            let (y0, ty) = split(y);
            let wx = bilinear_weights(tx);
            let wy = bilinear_weights(ty);
            let mut acc = 0.0;
            for (j, wy) in wy.iter().enumerate() {
                let sy = clamp_index(y0 + j as i64, height);
                for (i, wx) in wx.iter().enumerate() {
                    let sx = clamp_index(x0 + i as i64, width);
                    acc += wx * wy * sample(sx, sy)?;
                }
            }
            Ok(acc)
        }
        ResampleAlg::Cubic => {
            let (x0, tx) = split(x);
            let (y0, ty) = split(y);
            let wx = cubic_weights(tx);
            let wy = cubic_weights(ty);
            let mut acc = 0.0;
            for (j, wy) in wy.iter().enumerate() {
                let sy = clamp_index(y0 - 1 + j as i64, height);
                for (i, wx) in wx.iter().enumerate() {
                    let sx = clamp_index(x0 - 1 + i as i64, width);
                    acc += wx * wy * sample(sx, sy)?;
                }
            }
            Ok(acc)
        }
        ResampleAlg::Nearest | ResampleAlg::Average => {
            sample(nearest_index(x, 0, width), nearest_index(y, 0, height))
        }
    }
}

/// Mean of the pixels in `[x0, x1) x [y0, y1)`
pub fn average<F>(x0: usize, x1: usize, y0: usize, y1: usize, mut sample: F) -> Result<f64>
where
    F: FnMut(usize, usize) -> Result<f64>,
{
    let mut sum = 0.0;
    let mut count = 0usize;
    for y in y0..y1 {
        for x in x0..x1 {
            sum += sample(x, y)?;
            count += 1;
        }
    }
    Ok(if count == 0 { 0.0 } else { sum / count as f64 })
}

/// Integer pixel range covered by `[start, end)`, at least one pixel wide
/// and clamped to `[lo, hi)`
pub fn footprint(start: f64, end: f64, lo: usize, hi: usize) -> (usize, usize) {
    let first = nearest_index(start, lo, hi);
    let last = (end.ceil() as usize).clamp(first + 1, hi.max(first + 1));
    (first, last)
}
