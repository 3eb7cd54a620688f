//! The gamma dose-comparison engine.
//!
//! Compares two dose grids with the gamma index of Low et al., combining
//! dose difference and distance to agreement. Every reference voxel above
//! the lower dose cutoff becomes the centre of a search: evaluation dose
//! is interpolated on expanding spherical shells and the minimum gamma is
//! tracked as the shells grow. A reference point is finalised as soon as
//! the current search radius alone would exceed its best gamma so far,
//! since no outer shell can improve on it.
//!
//! Memory is the one actively managed resource: the per-shell working set
//! is tiled so interpolated sample blocks stay within `ram_available`.

use log::debug;
use ndarray::{Array3, ArrayView3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::coords::InvalidGeometry;
use crate::interp::RegularGridInterpolator;

/// 1.5 GiB, the default working-set bound.
const DEFAULT_RAM: usize = (3 << 30) / 2;

/// Grid axes in (z, y, x) order, matching the dose array layout.
pub type Axes<'a> = (&'a [f64], &'a [f64], &'a [f64]);

/// The options bundle of the gamma engine. Construct with
/// [`GammaOptions::new`] and override fields as needed.
#[derive(Debug, Clone)]
pub struct GammaOptions {
    /// Dose difference criterion as a percentage of the normalisation.
    pub dose_percent_threshold: f64,
    /// Distance-to-agreement criterion in mm.
    pub distance_mm_threshold: f64,
    /// Reference dose below this percentage of the normalisation is not
    /// evaluated. Defaults to 20 %.
    pub lower_percent_dose_cutoff: f64,
    /// The fraction the distance threshold is divided into for shell
    /// stepping. Defaults to 10.
    pub interp_fraction: f64,
    /// Largest gamma searched for; the search radius is bounded by
    /// `distance_mm_threshold * max_gamma` and results are clamped here.
    pub max_gamma: f64,
    /// Normalise dose differences by the local reference dose instead of
    /// the global normalisation.
    pub local_gamma: bool,
    /// Dose normalisation for the percent criteria. Defaults to the
    /// maximum of the reference grid.
    pub global_normalisation: Option<f64>,
    /// Stop searching a reference point as soon as it passes (gamma < 1).
    pub skip_once_passed: bool,
    /// Evaluate only this many randomly chosen reference points.
    pub random_subset: Option<usize>,
    /// Seed for the random subset selection; the engine itself is
    /// deterministic for a fixed seed.
    pub subset_seed: u64,
    /// Working-set bound in bytes for the shell interpolation blocks.
    pub ram_available: usize,
}

impl GammaOptions {
    pub fn new(dose_percent_threshold: f64, distance_mm_threshold: f64) -> Self {
        GammaOptions {
            dose_percent_threshold,
            distance_mm_threshold,
            lower_percent_dose_cutoff: 20.0,
            interp_fraction: 10.0,
            max_gamma: f64::INFINITY,
            local_gamma: false,
            global_normalisation: None,
            skip_once_passed: false,
            random_subset: None,
            subset_seed: 0,
            ram_available: DEFAULT_RAM,
        }
    }
}

fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    if count <= 1 {
        return vec![start];
    }

    let step = (end - start) / (count - 1) as f64;
    (0..count).map(|i| start + i as f64 * step).collect()
}

/// The offsets of one spherical shell at the given radius, spaced so that
/// no gap between neighbouring points exceeds `step`.
fn coordinates_shell(distance: f64, step: f64) -> Vec<[f64; 3]> {
    let number_of_rows = (std::f64::consts::PI * distance / step).ceil() as usize + 1;
    let elevation = linspace(0.0, std::f64::consts::PI, number_of_rows);

    let mut offsets = Vec::new();
    for phi in elevation {
        let row_circumference = 2.0 * std::f64::consts::PI * distance * phi.sin();
        let amount_in_row = (row_circumference / step).ceil() as usize + 1;

        let azimuth = linspace(0.0, 2.0 * std::f64::consts::PI, amount_in_row + 1);
        for &theta in &azimuth[..amount_in_row] {
            offsets.push([
                distance * phi.sin() * theta.cos(),
                distance * phi.sin() * theta.sin(),
                distance * phi.cos(),
            ]);
        }
    }

    offsets
}

struct FlatReference {
    axes_z: Vec<f64>,
    axes_y: Vec<f64>,
    axes_x: Vec<f64>,
    dose: Vec<f64>,
}

impl FlatReference {
    fn coordinates(&self, index: usize) -> [f64; 3] {
        let nx = self.axes_x.len();
        let ny = self.axes_y.len();

        let iz = index / (ny * nx);
        let iy = (index / nx) % ny;
        let ix = index % nx;

        [self.axes_z[iz], self.axes_y[iy], self.axes_x[ix]]
    }
}

/// The distance beyond which no shell sample can land inside the
/// evaluation domain for any reference point, so further searching cannot
/// change any result.
fn escape_distance(axes_reference: Axes, axes_evaluation: Axes) -> f64 {
    let span = |reference: &[f64], evaluation: &[f64]| -> f64 {
        let (ref_min, ref_max) = (reference[0], reference[reference.len() - 1]);
        let (eval_min, eval_max) = (evaluation[0], evaluation[evaluation.len() - 1]);
        (ref_min - eval_max).abs().max((ref_max - eval_min).abs())
    };

    let dz = span(axes_reference.0, axes_evaluation.0);
    let dy = span(axes_reference.1, axes_evaluation.1);
    let dx = span(axes_reference.2, axes_evaluation.2);

    (dz * dz + dy * dy + dx * dx).sqrt()
}

fn min_dose_difference(
    reference: &FlatReference,
    interp: &RegularGridInterpolator,
    to_be_checked: &[usize],
    shell: &[[f64; 3]],
    local_gamma: bool,
    global_normalisation: f64,
    ram_available: usize,
) -> Vec<f64> {
    // Tile the reference points so the interpolated sample block of any
    // one tile stays within the RAM bound; the tiling has no effect on
    // the numerical result.
    let estimated_ram = shell.len() * to_be_checked.len() * 32 * 3 * 2;
    let num_slices = estimated_ram / ram_available.max(1) + 1;
    let slice_size = to_be_checked.len().div_ceil(num_slices);

    let mut minimums = Vec::with_capacity(to_be_checked.len());

    for chunk in to_be_checked.chunks(slice_size.max(1)) {
        minimums.par_extend(chunk.par_iter().map(|&index| {
            let centre = reference.coordinates(index);
            let reference_dose = reference.dose[index];

            let mut minimum = f64::INFINITY;
            for offset in shell {
                let evaluation_dose = interp
                    .sample(
                        centre[0] + offset[0],
                        centre[1] + offset[1],
                        centre[2] + offset[2],
                    )
                    .unwrap_or(f64::INFINITY);

                let relative = if local_gamma {
                    (evaluation_dose - reference_dose) / reference_dose
                } else {
                    (evaluation_dose - reference_dose) / global_normalisation
                };

                minimum = minimum.min(relative.abs());
            }

            minimum
        }));
    }

    minimums
}

/// Compare two dose grids with the gamma index.
///
/// Axes are `(z, y, x)` and dose arrays have shape `(|z|, |y|, |x|)`.
/// Returns an array shaped like the reference grid; voxels below the
/// lower dose cutoff (or excluded by `random_subset`) hold NaN.
pub fn gamma_shell<'a>(
    axes_reference: Axes,
    dose_reference: ArrayView3<f64>,
    axes_evaluation: Axes<'a>,
    dose_evaluation: ArrayView3<'a, f64>,
    options: &GammaOptions,
) -> Result<Array3<f64>, InvalidGeometry> {
    if dose_reference.dim()
        != (
            axes_reference.0.len(),
            axes_reference.1.len(),
            axes_reference.2.len(),
        )
    {
        return Err(InvalidGeometry::AxisShapeMismatch);
    }

    let interp = RegularGridInterpolator::new(
        axes_evaluation.0,
        axes_evaluation.1,
        axes_evaluation.2,
        dose_evaluation,
    )?;

    let reference = FlatReference {
        axes_z: axes_reference.0.to_vec(),
        axes_y: axes_reference.1.to_vec(),
        axes_x: axes_reference.2.to_vec(),
        dose: dose_reference.iter().copied().collect(),
    };

    let global_normalisation = options
        .global_normalisation
        .unwrap_or_else(|| reference.dose.iter().copied().fold(0.0f64, f64::max));
    let lower_dose_cutoff = options.lower_percent_dose_cutoff / 100.0 * global_normalisation;

    let distance_threshold = options.distance_mm_threshold;
    let dose_threshold = options.dose_percent_threshold / 100.0;

    let mut to_calc: Vec<bool> = reference
        .dose
        .iter()
        .map(|&dose| dose >= lower_dose_cutoff)
        .collect();

    if let Some(count) = options.random_subset {
        let mut candidates: Vec<usize> = (0..to_calc.len()).filter(|&i| to_calc[i]).collect();
        let mut rng = StdRng::seed_from_u64(options.subset_seed);
        candidates.shuffle(&mut rng);
        candidates.truncate(count);

        to_calc = vec![false; to_calc.len()];
        for index in candidates {
            to_calc[index] = true;
        }
    }

    let maximum_test_distance = distance_threshold * options.max_gamma;
    let give_up_distance = escape_distance(axes_reference, axes_evaluation) + distance_threshold;

    let mut current_gamma = vec![f64::INFINITY; reference.dose.len()];
    let mut still_searching = vec![true; reference.dose.len()];

    let mut distance = 0.0;
    let mut distance_step_size = distance_threshold / options.interp_fraction;
    let mut force_search_distance = Some(distance_threshold);

    while distance <= maximum_test_distance && distance <= give_up_distance {
        let to_be_checked: Vec<usize> = (0..reference.dose.len())
            .filter(|&i| to_calc[i] && still_searching[i])
            .collect();

        if to_be_checked.is_empty() {
            break;
        }

        let shell = coordinates_shell(distance, distance_step_size);

        debug!(
            "gamma search at {distance:.2} mm, {} reference points remaining, \
             {} points per shell",
            to_be_checked.len(),
            shell.len(),
        );

        let minimums = min_dose_difference(
            &reference,
            &interp,
            &to_be_checked,
            &shell,
            options.local_gamma,
            global_normalisation,
            options.ram_available,
        );

        for (&index, &minimum) in to_be_checked.iter().zip(&minimums) {
            let gamma_at_distance = ((minimum / dose_threshold).powi(2)
                + (distance / distance_threshold).powi(2))
            .sqrt();

            current_gamma[index] = current_gamma[index].min(gamma_at_distance);

            let mut searching = current_gamma[index] > distance / distance_threshold;
            if options.skip_once_passed {
                searching = searching && current_gamma[index] >= 1.0;
            }
            still_searching[index] = searching;
        }

        distance_step_size = distance_threshold / options.interp_fraction;
        if options.max_gamma.is_finite() {
            distance_step_size =
                distance_step_size.max(distance / options.interp_fraction / options.max_gamma);
        }

        distance += distance_step_size;

        // Always test at exactly the distance threshold on the way past.
        if let Some(force) = force_search_distance {
            if distance >= force {
                distance = force;
                force_search_distance = None;
            }
        }
    }

    let shape = dose_reference.dim();
    let mut gamma = Array3::from_elem(shape, f64::NAN);

    for (index, value) in current_gamma.iter().enumerate() {
        if !to_calc[index] {
            continue;
        }

        let (ny, nx) = (shape.1, shape.2);
        let voxel = (index / (ny * nx), (index / nx) % ny, index % nx);

        gamma[voxel] = if value.is_infinite() {
            f64::NAN
        } else if options.max_gamma.is_finite() && *value > options.max_gamma {
            options.max_gamma
        } else {
            *value
        };
    }

    Ok(gamma)
}
