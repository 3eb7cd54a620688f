//! The MetersetMap (fluence) engine.
//!
//! Reconstructs the deliverable fluence of a delivery on a regular grid at
//! the isocentre plane. For every pair of adjacent control points the MLC
//! leaves and jaw blades are swept linearly between their end positions
//! over a number of time steps; each pixel accumulates the fraction of the
//! window during which it was unblocked, weighted by the monitor units
//! delivered across the pair.
//!
//! Jaw and MLC positions are bipolar: a positive value is travel away from
//! the centre, a negative value is travel over the isocentre. All
//! positions are mm at the isocentre projection.

use ndarray::{Array2, ArrayView2, ArrayView3, Axis, s};
use thiserror::Error;

/// Matching tolerance when locating local grid columns in the full grid.
const GRID_MATCH_TOLERANCE: f64 = 1e-4;

const DIVISIBILITY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum InvalidConfiguration {
    #[error("the grid resolution needs to exactly divide half the max leaf gap")]
    ResolutionDoesNotDivideMaxLeafGap,

    #[error("the grid resolution needs to exactly divide every leaf pair width")]
    ResolutionDoesNotDivideLeafWidths,

    #[error(
        "the mlc must not travel further out than half the maximum leaf gap; \
         the first failing control point is {control_point}"
    )]
    MlcBeyondMaxLeafGap { control_point: usize },

    #[error(
        "the jaw must not travel further out than the leaf extent; \
         max travel was {max_travel}"
    )]
    JawBeyondLeafExtent { max_travel: f64 },

    #[error("the jaw blades overlap leaving no aperture to calculate over")]
    EmptyJawAperture,

    #[error("a control point pair requires exactly two control points")]
    NotAControlPointPair,

    #[error("mlc, jaw and mu must agree on the number of control points")]
    MismatchedControlPoints,
}

/// Configuration of the calculation grid and sweep.
#[derive(Debug, Clone)]
pub struct MetersetMapConfig {
    /// Calc grid resolution in mm. Defaults to 1 mm.
    pub grid_resolution: f64,
    /// Maximum possible distance between opposing leaves in mm. Defaults
    /// to 400 mm.
    pub max_leaf_gap: f64,
    /// The width of each leaf pair in mm; the length defines the number of
    /// pairs. Defaults to 80 pairs of 5 mm.
    pub leaf_pair_widths: Vec<f64>,
    /// Minimum number of time steps used per pixel of travel. Defaults
    /// to 10.
    pub min_step_per_pixel: usize,
}

impl Default for MetersetMapConfig {
    fn default() -> Self {
        MetersetMapConfig {
            grid_resolution: 1.0,
            max_leaf_gap: 400.0,
            leaf_pair_widths: vec![5.0; 80],
            min_step_per_pixel: 10,
        }
    }
}

/// Pixel-centre coordinates of a metersetmap, mm at the isocentre.
#[derive(Debug, Clone, PartialEq)]
pub struct MetersetMapGrid {
    /// Coordinates along the leaf travel direction.
    pub mlc: Vec<f64>,
    /// Coordinates along the jaw travel direction.
    pub jaw: Vec<f64>,
}

/// A computed fluence map: `values[(jaw index, mlc index)]` holds the MU
/// delivered through that pixel.
#[derive(Debug, Clone)]
pub struct MetersetMap {
    pub grid: MetersetMapGrid,
    pub values: Array2<f64>,
}

fn is_integer_multiple(value: f64, divisor: f64) -> bool {
    let ratio = value / divisor;
    (ratio - ratio.round()).abs() < DIVISIBILITY_TOLERANCE
}

fn max_abs(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().fold(0.0f64, |acc, v| acc.max(v.abs()))
}

fn range_from(start: f64, count: usize, step: f64) -> Vec<f64> {
    (0..count).map(|i| start + i as f64 * step).collect()
}

fn leaf_centres(leaf_pair_widths: &[f64]) -> (Vec<f64>, f64) {
    let total: f64 = leaf_pair_widths.iter().sum();

    let mut centres = Vec::with_capacity(leaf_pair_widths.len());
    let mut cumulative = 0.0;
    for &width in leaf_pair_widths {
        cumulative += width;
        centres.push(cumulative - width / 2.0 - total / 2.0);
    }

    let reference = leaf_pair_widths.len() / 2;
    let top_of_reference_leaf = centres[reference] + leaf_pair_widths[reference] / 2.0;

    (centres, top_of_reference_leaf)
}

fn reference_grid_position(top_of_reference_leaf: f64, grid_resolution: f64) -> f64 {
    top_of_reference_leaf - grid_resolution / 2.0
}

/// The full calculation grid for a configuration: the MLC axis spans the
/// maximum leaf gap, the jaw axis the summed leaf widths, aligned so that
/// pixel centres sit half a resolution off the reference leaf edge.
pub fn grid(config: &MetersetMapConfig) -> Result<MetersetMapGrid, InvalidConfiguration> {
    let res = config.grid_resolution;

    if !is_integer_multiple(config.max_leaf_gap / 2.0, res) {
        return Err(InvalidConfiguration::ResolutionDoesNotDivideMaxLeafGap);
    }

    let mlc_count = (config.max_leaf_gap / res).round() as usize + 1;
    let mlc = range_from(-config.max_leaf_gap / 2.0, mlc_count, res);

    let (_, top_of_reference_leaf) = leaf_centres(&config.leaf_pair_widths);
    let reference = reference_grid_position(top_of_reference_leaf, res);

    let total_leaf_widths: f64 = config.leaf_pair_widths.iter().sum();
    let top = ((total_leaf_widths / 2.0 - reference) / res).ceil() * res + reference;
    let bot = reference - ((total_leaf_widths / 2.0 + reference) / res).ceil() * res;

    let jaw_count = ((top - bot) / res).round() as usize + 1;
    let jaw = range_from(bot, jaw_count, res);

    Ok(MetersetMapGrid { mlc, jaw })
}

struct CalcGrid {
    grid: MetersetMapGrid,
    /// Local jaw-grid row to local leaf row.
    grid_leaf_map: Vec<usize>,
    /// The leaves actually spanned by the jaw aperture, `(2, L', 2)`.
    adjusted_mlc: ndarray::Array3<f64>,
}

fn determine_calc_grid_and_adjustments(
    mlc: ArrayView3<f64>,
    jaw: ArrayView2<f64>,
    leaf_pair_widths: &[f64],
    grid_resolution: f64,
) -> Result<CalcGrid, InvalidConfiguration> {
    let res = grid_resolution;

    let min_y = (0..jaw.nrows()).map(|i| -jaw[[i, 0]]).fold(f64::INFINITY, f64::min);
    let max_y = (0..jaw.nrows()).map(|i| jaw[[i, 1]]).fold(f64::NEG_INFINITY, f64::max);

    let (centres, top_of_reference_leaf) = leaf_centres(leaf_pair_widths);
    let reference = reference_grid_position(top_of_reference_leaf, res);

    let top = ((max_y - reference) / res).round_ties_even() * res + reference;
    let bot = reference - ((-min_y + reference) / res).round_ties_even() * res;

    if top < bot {
        return Err(InvalidConfiguration::EmptyJawAperture);
    }

    let jaw_count = ((top - bot) / res).round() as usize + 1;
    let jaw_grid = range_from(bot, jaw_count, res);

    let raw_leaf_map: Vec<usize> = jaw_grid
        .iter()
        .map(|&y| {
            let mut best = 0;
            let mut best_distance = f64::INFINITY;
            for (index, &centre) in centres.iter().enumerate() {
                let distance = (y - centre).abs();
                if distance < best_distance {
                    best_distance = distance;
                    best = index;
                }
            }
            best
        })
        .collect();

    let min_leaf = raw_leaf_map.iter().copied().min().unwrap_or(0);
    let grid_leaf_map: Vec<usize> = raw_leaf_map.iter().map(|&l| l - min_leaf).collect();

    let mut leaves_to_calc: Vec<usize> = raw_leaf_map.clone();
    leaves_to_calc.sort_unstable();
    leaves_to_calc.dedup();

    let adjusted_mlc = mlc.select(Axis(1), &leaves_to_calc);

    let adjusted_mlc_ref = &adjusted_mlc;
    let min_x = ((0..adjusted_mlc_ref.shape()[0])
        .flat_map(|i| (0..adjusted_mlc_ref.shape()[1]).map(move |l| -adjusted_mlc_ref[[i, l, 0]]))
        .fold(f64::INFINITY, f64::min)
        / res)
        .round_ties_even()
        * res;
    let max_x = ((0..adjusted_mlc_ref.shape()[0])
        .flat_map(|i| (0..adjusted_mlc_ref.shape()[1]).map(move |l| adjusted_mlc_ref[[i, l, 1]]))
        .fold(f64::NEG_INFINITY, f64::max)
        / res)
        .round_ties_even()
        * res;

    let mlc_count = ((max_x - min_x) / res).round() as usize + 1;
    let mlc_grid = range_from(min_x, mlc_count, res);

    Ok(CalcGrid {
        grid: MetersetMapGrid {
            mlc: mlc_grid,
            jaw: jaw_grid,
        },
        grid_leaf_map,
        adjusted_mlc,
    })
}

/// Blocked fraction of one pixel for one device position. `diff` is the
/// signed distance from the pixel centre to the blocking edge.
fn blocked_fraction(diff: f64, grid_resolution: f64) -> f64 {
    if diff <= -grid_resolution / 2.0 {
        1.0
    } else if diff >= grid_resolution / 2.0 {
        0.0
    } else {
        (-diff + grid_resolution / 2.0) / grid_resolution
    }
}

struct DeviceTravel {
    start: Vec<f64>,
    end: Vec<f64>,
    multiplier: f64,
}

fn time_steps(devices: &[&DeviceTravel], grid_resolution: f64, min_step_per_pixel: usize) -> usize {
    let maximum_travel = devices
        .iter()
        .flat_map(|device| {
            device
                .start
                .iter()
                .zip(&device.end)
                .map(|(s, e)| (e - s).abs())
        })
        .fold(0.0f64, f64::max);

    let pixels = (maximum_travel / grid_resolution).ceil() as usize;
    (pixels * min_step_per_pixel).max(10)
}

fn open_fraction_at_step(
    device_a: &DeviceTravel,
    device_b: &DeviceTravel,
    grid: &[f64],
    object: usize,
    fraction: f64,
    grid_resolution: f64,
    out: &mut [f64],
) {
    for (pixel, &position) in grid.iter().enumerate() {
        let mut blocked = 0.0;
        for device in [device_a, device_b] {
            let travel =
                device.start[object] + fraction * (device.end[object] - device.start[object]);
            let diff = device.multiplier * (position - travel);
            blocked += blocked_fraction(diff, grid_resolution);
        }

        out[pixel] = (1.0 - blocked).clamp(0.0, 1.0);
    }
}

/// Calculate the metersetmap of a single control point pair.
///
/// `mlc` has shape `(2, L, 2)` and `jaw` shape `(2, 2)`: the first axis is
/// the start and end state of the sweep. Returns the local calculation
/// grid and the map on it.
pub fn calc_single_control_point(
    mlc: ArrayView3<f64>,
    jaw: ArrayView2<f64>,
    delivered_mu: f64,
    config: &MetersetMapConfig,
) -> Result<(MetersetMapGrid, Array2<f64>), InvalidConfiguration> {
    if mlc.shape()[0] != 2 || jaw.nrows() != 2 {
        return Err(InvalidConfiguration::NotAControlPointPair);
    }

    let res = config.grid_resolution;

    if config
        .leaf_pair_widths
        .iter()
        .any(|&width| !is_integer_multiple(width, res))
    {
        return Err(InvalidConfiguration::ResolutionDoesNotDivideLeafWidths);
    }

    let total_leaf_widths: f64 = config.leaf_pair_widths.iter().sum();
    let max_jaw_travel = max_abs(jaw.iter().copied());
    if max_jaw_travel > total_leaf_widths / 2.0 {
        return Err(InvalidConfiguration::JawBeyondLeafExtent {
            max_travel: max_jaw_travel,
        });
    }

    let calc = determine_calc_grid_and_adjustments(mlc, jaw, &config.leaf_pair_widths, res)?;

    let local_leaves = calc.adjusted_mlc.shape()[1];
    let mlc_left = DeviceTravel {
        start: (0..local_leaves).map(|l| -calc.adjusted_mlc[[0, l, 0]]).collect(),
        end: (0..local_leaves).map(|l| -calc.adjusted_mlc[[1, l, 0]]).collect(),
        multiplier: 1.0,
    };
    let mlc_right = DeviceTravel {
        start: (0..local_leaves).map(|l| calc.adjusted_mlc[[0, l, 1]]).collect(),
        end: (0..local_leaves).map(|l| calc.adjusted_mlc[[1, l, 1]]).collect(),
        multiplier: -1.0,
    };
    let jaw_bot = DeviceTravel {
        start: vec![-jaw[[0, 0]]],
        end: vec![-jaw[[1, 0]]],
        multiplier: 1.0,
    };
    let jaw_top = DeviceTravel {
        start: vec![jaw[[0, 1]]],
        end: vec![jaw[[1, 1]]],
        multiplier: -1.0,
    };

    let steps = time_steps(
        &[&mlc_left, &mlc_right, &jaw_bot, &jaw_top],
        res,
        config.min_step_per_pixel,
    );

    let n_rows = calc.grid.jaw.len();
    let n_cols = calc.grid.mlc.len();

    // Accumulate the per-step open fractions straight into the map instead
    // of materialising the full (steps, leaves, pixels) block.
    let mut open_sum = Array2::<f64>::zeros((n_rows, n_cols));
    let mut mlc_open = Array2::<f64>::zeros((local_leaves, n_cols));
    let mut jaw_open = vec![0.0; n_rows];

    for step in 0..steps {
        let fraction = step as f64 / (steps - 1) as f64;

        for leaf in 0..local_leaves {
            open_fraction_at_step(
                &mlc_left,
                &mlc_right,
                &calc.grid.mlc,
                leaf,
                fraction,
                res,
                mlc_open
                    .slice_mut(s![leaf, ..])
                    .into_slice()
                    .expect("row is contiguous"),
            );
        }

        let mut jaw_row = [0.0];
        for (row, open) in jaw_open.iter_mut().enumerate() {
            open_fraction_at_step(
                &jaw_bot,
                &jaw_top,
                &calc.grid.jaw[row..row + 1],
                0,
                fraction,
                res,
                &mut jaw_row,
            );
            *open = jaw_row[0];
        }

        for row in 0..n_rows {
            let leaf = calc.grid_leaf_map[row];
            for col in 0..n_cols {
                open_sum[[row, col]] += mlc_open[[leaf, col]] * jaw_open[row];
            }
        }
    }

    let metersetmap = open_sum.mapv(|sum| sum / steps as f64 * delivered_mu);

    Ok((calc.grid, metersetmap))
}

fn add_to_full_grid(
    full: &mut MetersetMap,
    local_grid: &MetersetMapGrid,
    local_values: &Array2<f64>,
) {
    let column_offsets: Vec<Option<usize>> = local_grid
        .mlc
        .iter()
        .map(|&x| {
            full.grid
                .mlc
                .iter()
                .position(|&fx| (fx - x).abs() < GRID_MATCH_TOLERANCE)
        })
        .collect();
    let row_offsets: Vec<Option<usize>> = local_grid
        .jaw
        .iter()
        .map(|&y| {
            full.grid
                .jaw
                .iter()
                .position(|&fy| (fy - y).abs() < GRID_MATCH_TOLERANCE)
        })
        .collect();

    for (local_row, full_row) in row_offsets.iter().enumerate() {
        let Some(full_row) = full_row else { continue };
        for (local_col, full_col) in column_offsets.iter().enumerate() {
            let Some(full_col) = full_col else { continue };
            full.values[[*full_row, *full_col]] += local_values[[local_row, local_col]];
        }
    }
}

fn filter_control_points(
    mu: &[f64],
    mlc: ArrayView3<f64>,
    jaw: ArrayView2<f64>,
) -> (Vec<f64>, ndarray::Array3<f64>, Array2<f64>) {
    if mu.len() < 2 {
        return (mu.to_vec(), mlc.to_owned(), jaw.to_owned());
    }

    let no_change: Vec<bool> = mu.windows(2).map(|w| w[1] - w[0] == 0.0).collect();

    let mut keep = Vec::with_capacity(mu.len());
    keep.push(!no_change[0]);
    for i in 1..mu.len() - 1 {
        keep.push(!(no_change[i - 1] && no_change[i]));
    }
    keep.push(!no_change[no_change.len() - 1]);

    let indices: Vec<usize> = (0..mu.len()).filter(|&i| keep[i]).collect();

    (
        indices.iter().map(|&i| mu[i]).collect(),
        mlc.select(Axis(0), &indices),
        jaw.select(Axis(0), &indices),
    )
}

/// Determine the MetersetMap of a full delivery.
///
/// `mu` is the cumulative monitor units per control point, `mlc` the
/// `(n, L, 2)` leaf tensor and `jaw` the `(n, 2)` blade array, all in the
/// bipolar outward-positive convention.
pub fn calc_metersetmap(
    mu: &[f64],
    mlc: ArrayView3<f64>,
    jaw: ArrayView2<f64>,
    config: &MetersetMapConfig,
) -> Result<MetersetMap, InvalidConfiguration> {
    let res = config.grid_resolution;

    if !is_integer_multiple(config.max_leaf_gap / 2.0, res) {
        return Err(InvalidConfiguration::ResolutionDoesNotDivideMaxLeafGap);
    }

    if mlc.shape()[0] != mu.len() || jaw.nrows() != mu.len() {
        return Err(InvalidConfiguration::MismatchedControlPoints);
    }

    for cp in 0..mlc.shape()[0] {
        let row_max = max_abs(mlc.slice(s![cp, .., ..]).iter().copied());
        if row_max > config.max_leaf_gap / 2.0 {
            return Err(InvalidConfiguration::MlcBeyondMaxLeafGap { control_point: cp });
        }
    }

    let (mu, mlc, jaw) = filter_control_points(mu, mlc, jaw);

    let full_grid = grid(config)?;
    let values = Array2::zeros((full_grid.jaw.len(), full_grid.mlc.len()));
    let mut full = MetersetMap {
        grid: full_grid,
        values,
    };

    for i in 0..mu.len().saturating_sub(1) {
        let delivered_mu = mu[i + 1] - mu[i];
        let (local_grid, local_values) = calc_single_control_point(
            mlc.slice(s![i..i + 2, .., ..]),
            jaw.slice(s![i..i + 2, ..]),
            delivered_mu,
            config,
        )?;

        add_to_full_grid(&mut full, &local_grid, &local_values);
    }

    Ok(full)
}

/// The metersetmap of a single moving leaf pair, on a one-pixel-high
/// aperture. `left` and `right` are `(start, end)` positions of the two
/// leaves. Returns the grid coordinates and the map values.
pub fn single_mlc_pair(
    left: (f64, f64),
    right: (f64, f64),
    grid_resolution: f64,
    min_step_per_pixel: usize,
) -> Result<(Vec<f64>, Vec<f64>), InvalidConfiguration> {
    let config = MetersetMapConfig {
        grid_resolution,
        max_leaf_gap: 400.0,
        leaf_pair_widths: vec![grid_resolution],
        min_step_per_pixel,
    };

    let mlc = ndarray::Array3::from_shape_vec(
        (2, 1, 2),
        vec![-left.0, right.0, -left.1, right.1],
    )
    .expect("shape matches data");
    let jaw = Array2::from_shape_vec(
        (2, 2),
        vec![
            grid_resolution / 2.0,
            grid_resolution / 2.0,
            grid_resolution / 2.0,
            grid_resolution / 2.0,
        ],
    )
    .expect("shape matches data");

    let (grid, values) = calc_single_control_point(mlc.view(), jaw.view(), 1.0, &config)?;

    Ok((grid.mlc, values.row(0).to_vec()))
}
