//! Trilinear interpolation over a regular (z, y, x) grid.

use ndarray::ArrayView3;

use crate::coords::InvalidGeometry;

fn is_strictly_increasing(axis: &[f64]) -> bool {
    axis.windows(2).all(|w| w[0] < w[1])
}

/// Locate the cell containing `value` and return `(index, fraction)` such
/// that `axis[index] + fraction * (axis[index + 1] - axis[index]) == value`.
fn locate(axis: &[f64], value: f64) -> Option<(usize, f64)> {
    if value < axis[0] || value > axis[axis.len() - 1] {
        return None;
    }

    if axis.len() == 1 {
        return Some((0, 0.0));
    }

    let upper = axis.partition_point(|&a| a <= value).min(axis.len() - 1);
    let lower = upper.saturating_sub(1).min(axis.len() - 2);
    let span = axis[lower + 1] - axis[lower];

    Some(((lower), (value - axis[lower]) / span))
}

/// Piecewise-trilinear interpolator over strictly increasing axes, the
/// workhorse behind both the gamma engine and the dose-grid services.
pub struct RegularGridInterpolator<'a> {
    z: &'a [f64],
    y: &'a [f64],
    x: &'a [f64],
    values: ArrayView3<'a, f64>,
}

impl<'a> RegularGridInterpolator<'a> {
    pub fn new(
        z: &'a [f64],
        y: &'a [f64],
        x: &'a [f64],
        values: ArrayView3<'a, f64>,
    ) -> Result<Self, InvalidGeometry> {
        for axis in [z, y, x] {
            if axis.is_empty() || !is_strictly_increasing(axis) {
                return Err(InvalidGeometry::NonMonotonicAxis);
            }
        }

        if values.dim() != (z.len(), y.len(), x.len()) {
            return Err(InvalidGeometry::AxisShapeMismatch);
        }

        Ok(RegularGridInterpolator { z, y, x, values })
    }

    /// Interpolate one point, `None` when it lies outside the grid domain.
    pub fn sample(&self, z: f64, y: f64, x: f64) -> Option<f64> {
        let (iz, fz) = locate(self.z, z)?;
        let (iy, fy) = locate(self.y, y)?;
        let (ix, fx) = locate(self.x, x)?;

        let iz1 = (iz + 1).min(self.z.len() - 1);
        let iy1 = (iy + 1).min(self.y.len() - 1);
        let ix1 = (ix + 1).min(self.x.len() - 1);

        let v = &self.values;
        let c00 = v[[iz, iy, ix]] * (1.0 - fx) + v[[iz, iy, ix1]] * fx;
        let c01 = v[[iz, iy1, ix]] * (1.0 - fx) + v[[iz, iy1, ix1]] * fx;
        let c10 = v[[iz1, iy, ix]] * (1.0 - fx) + v[[iz1, iy, ix1]] * fx;
        let c11 = v[[iz1, iy1, ix]] * (1.0 - fx) + v[[iz1, iy1, ix1]] * fx;

        let c0 = c00 * (1.0 - fy) + c01 * fy;
        let c1 = c10 * (1.0 - fy) + c11 * fy;

        Some(c0 * (1.0 - fz) + c1 * fz)
    }

    /// Interpolate a set of (z, y, x) points, failing on the first point
    /// outside the grid domain.
    pub fn interpolate(&self, points: &[[f64; 3]]) -> Result<Vec<f64>, InvalidGeometry> {
        points
            .iter()
            .map(|&[z, y, x]| {
                self.sample(z, y, x)
                    .ok_or(InvalidGeometry::OutOfDomain { x, y, z })
            })
            .collect()
    }

    /// Interpolate a set of points, substituting `fill` outside the domain.
    pub fn interpolate_or(&self, points: &[[f64; 3]], fill: f64) -> Vec<f64> {
        points
            .iter()
            .map(|&[z, y, x]| self.sample(z, y, x).unwrap_or(fill))
            .collect()
    }
}
