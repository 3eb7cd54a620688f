//! Coordinate utilities: dose-grid axes in the DICOM, IEC-fixed and
//! IEC-patient frames, plus the bipolar angle convention.
//!
//! The bipolar convention maps gantry and collimator angles into
//! (−180°, 180°]. Exactly 180° stays at +180°; the asymmetry is kept
//! identical on read and write so angles round-trip bit for bit.

use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use thiserror::Error;

use crate::attr::{self, AttrError};

/// An immutable coordinate triple in mm. The frame is stated wherever a
/// `Point` crosses an API boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Point { x, y, z }
    }
}

/// The coordinate system in which grid axes are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordSystem {
    #[default]
    Dicom,
    IecFixed,
    IecPatient,
}

#[derive(Debug, Error)]
pub enum InvalidGeometry {
    #[error(
        "dose grid orientation is not supported, grid slices must be aligned \
         along the superoinferior axis of the patient"
    )]
    UnsupportedOrientation,

    #[error("patient position is not {expected}, the dataset reports {found}")]
    WrongPatientPosition {
        expected: &'static str,
        found: String,
    },

    #[error("only gantry angles equal to 0.0 are supported for this operation")]
    GantryNotZero,

    #[error("grid axes must be strictly increasing")]
    NonMonotonicAxis,

    #[error("axis lengths do not match the value array shape")]
    AxisShapeMismatch,

    #[error("point ({x}, {y}, {z}) is outside the grid domain")]
    OutOfDomain { x: f64, y: f64, z: f64 },

    #[error("all z values within a contour must be equal")]
    ContourNotPlanar,

    #[error("only one contour per slice is supported")]
    MultipleContoursOnSlice,

    #[error(
        "only contours with no gaps in z and whose planes coincide with the \
         dose grid planes are supported"
    )]
    MisalignedPlanes,

    #[error("structure {name} was not found within the structure set")]
    UnknownRoi { name: String },

    #[error("only CLOSED_PLANAR contours are supported, found {found}")]
    UnsupportedContourType { found: String },

    #[error("each slice must reference exactly one image")]
    ConflictingReferencedImages,

    #[error("contour data points must come in (x, y, z) triples")]
    MalformedContourData,

    #[error(transparent)]
    Attr(#[from] AttrError),
}

fn orientation_is_head_first(orientation: &[f64], is_decubitus: bool) -> bool {
    let total: f64 = orientation.iter().sum();
    if is_decubitus {
        total.abs() != 2.0
    } else {
        total.abs() == 2.0
    }
}

fn flipped(axis: &[f64]) -> Vec<f64> {
    axis.iter().rev().copied().collect()
}

/// Compute the x, y and z axes of a dataset's pixel grid in the requested
/// coordinate system.
///
/// Reads `ImagePositionPatient`, `ImageOrientationPatient`, `PixelSpacing`,
/// `Rows`, `Columns` and `GridFrameOffsetVector`. Only the eight cardinal
/// patient orientations are accepted; anything else is rejected with
/// [`InvalidGeometry::UnsupportedOrientation`].
pub fn xyz_axes_from_dataset(
    ds: &InMemDicomObject,
    coord_system: CoordSystem,
) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>), InvalidGeometry> {
    let position = attr::multi_f64(ds, tags::IMAGE_POSITION_PATIENT, "ImagePositionPatient")?;
    let orientation = attr::multi_f64(
        ds,
        tags::IMAGE_ORIENTATION_PATIENT,
        "ImageOrientationPatient",
    )?;

    let row_like: Vec<f64> = orientation.iter().map(|v| v.abs()).collect();
    if row_like != [1.0, 0.0, 0.0, 0.0, 1.0, 0.0] && row_like != [0.0, 1.0, 0.0, 1.0, 0.0, 0.0] {
        return Err(InvalidGeometry::UnsupportedOrientation);
    }

    let is_decubitus = orientation[0] == 0.0;
    let is_head_first = orientation_is_head_first(&orientation, is_decubitus);

    let spacing = attr::multi_f64(ds, tags::PIXEL_SPACING, "PixelSpacing")?;
    let (di, dj) = (spacing[0], spacing[1]);
    let columns = attr::i64_value(ds, tags::COLUMNS, "Columns")? as usize;
    let rows = attr::i64_value(ds, tags::ROWS, "Rows")? as usize;
    let offsets = attr::multi_f64(ds, tags::GRID_FRAME_OFFSET_VECTOR, "GridFrameOffsetVector")?;

    let col_range: Vec<f64> = (0..columns).map(|i| i as f64 * di).collect();
    let row_range: Vec<f64> = (0..rows).map(|j| j as f64 * dj).collect();

    let (x_dicom_fixed, y_dicom_fixed): (Vec<f64>, Vec<f64>) = if is_decubitus {
        (
            col_range
                .iter()
                .map(|c| orientation[1] * position[1] + c)
                .collect(),
            row_range
                .iter()
                .map(|r| orientation[3] * position[0] + r)
                .collect(),
        )
    } else {
        (
            col_range
                .iter()
                .map(|c| orientation[0] * position[0] + c)
                .collect(),
            row_range
                .iter()
                .map(|r| orientation[4] * position[1] + r)
                .collect(),
        )
    };

    let z_dicom_fixed: Vec<f64> = if is_head_first {
        offsets.iter().map(|o| position[2] + o).collect()
    } else {
        offsets.iter().map(|o| -position[2] + o).collect()
    };

    if coord_system == CoordSystem::IecFixed {
        let x = x_dicom_fixed;
        let y = z_dicom_fixed;
        let z: Vec<f64> = flipped(&y_dicom_fixed).iter().map(|v| -v).collect();
        return Ok((x, y, z));
    }

    // DICOM and IEC-patient share the in-plane handling; the frames differ
    // only in how the y/z axes are assembled at the end.
    let mut x = Vec::new();
    let mut y_d = Vec::new();

    if orientation[0] == 1.0 {
        x = x_dicom_fixed.clone();
    } else if orientation[0] == -1.0 {
        x = flipped(&x_dicom_fixed);
    } else if orientation[1] == 1.0 {
        y_d = x_dicom_fixed.clone();
    } else if orientation[1] == -1.0 {
        y_d = flipped(&x_dicom_fixed);
    }

    if orientation[4] == 1.0 {
        y_d = y_dicom_fixed.clone();
    } else if orientation[4] == -1.0 {
        y_d = flipped(&y_dicom_fixed);
    } else if orientation[3] == 1.0 {
        x = y_dicom_fixed.clone();
    } else if orientation[3] == -1.0 {
        x = flipped(&y_dicom_fixed);
    }

    let z_d = if is_head_first {
        z_dicom_fixed
    } else {
        flipped(&z_dicom_fixed)
    };

    match coord_system {
        CoordSystem::Dicom => Ok((x, y_d, z_d)),
        CoordSystem::IecPatient => {
            let z: Vec<f64> = flipped(&y_d).iter().map(|v| -v).collect();
            Ok((x, z_d, z))
        }
        CoordSystem::IecFixed => unreachable!(),
    }
}

/// Convert one IEC angle (0°–360°) to bipolar (−180°, 180°].
pub fn iec_to_bipolar(angle: f64) -> f64 {
    if angle > 180.0 { angle - 360.0 } else { angle }
}

/// Convert one bipolar angle back to the IEC 0°–360° range. +180° is left
/// untouched so the conversion is the exact inverse of [`iec_to_bipolar`].
pub fn bipolar_to_iec(angle: f64) -> f64 {
    if angle < 0.0 { angle + 360.0 } else { angle }
}

#[derive(Debug, Error)]
#[error("unable to determine whether an angle of 180 is +180 or -180")]
pub struct AmbiguousAngle;

/// Convert a sampled angle sequence to bipolar.
///
/// Samples sitting exactly at 180° are resolved to ±180 by leaning on the
/// nearest non-180 sample on either side; if the two neighbours disagree in
/// sign the sequence is rejected.
pub fn angles_to_bipolar(angles: &[f64]) -> Result<Vec<f64>, AmbiguousAngle> {
    let mut converted: Vec<f64> = angles.iter().copied().map(iec_to_bipolar).collect();

    if converted.iter().all(|&a| a == 180.0) {
        return Ok(converted);
    }

    let not_180: Vec<usize> = (0..converted.len())
        .filter(|&i| converted[i] != 180.0)
        .collect();

    let resolved: Vec<(usize, f64)> = (0..converted.len())
        .filter(|&i| converted[i] == 180.0)
        .map(|i| {
            let left = not_180
                .iter()
                .min_by_key(|&&j| i.abs_diff(j))
                .copied()
                .expect("at least one non-180 sample exists");
            let right = not_180
                .iter()
                .rev()
                .min_by_key(|&&j| i.abs_diff(j))
                .copied()
                .expect("at least one non-180 sample exists");

            if converted[left].signum() != converted[right].signum() {
                return Err(AmbiguousAngle);
            }

            Ok((i, converted[left].signum() * 180.0))
        })
        .collect::<Result<_, _>>()?;

    for (i, value) in resolved {
        converted[i] = value;
    }

    Ok(converted)
}
