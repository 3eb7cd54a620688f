//! Dose-grid services over DICOM RT Dose datasets.
//!
//! Extraction of axes and voxel dose, trilinear interpolation, depth-dose
//! and profile sampling, structure masking and dose-grid summation.

use byteorder::{ByteOrder, LittleEndian};
use dicom::core::VR;
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use geo::{Contains, LineString, Point as GeoPoint, Polygon};
use ndarray::Array3;
use thiserror::Error;

use crate::attr::{self, AttrError};
use crate::coords::{CoordSystem, InvalidGeometry, xyz_axes_from_dataset};
use crate::interp::RegularGridInterpolator;
use crate::orientation::{PatientPosition, require_patient_position};
use crate::rtplan::{self, InvalidPlan, put_str};
use crate::structure;

#[derive(Debug, Error)]
pub enum DoseError {
    #[error("unsupported BitsAllocated of {bits}; dose words must be 16 or 32 bit")]
    UnsupportedBitsAllocated { bits: i64 },

    #[error("pixel data length does not match rows x columns x frames")]
    PixelDataLengthMismatch,

    #[error("unrecognised DoseUnits {found}")]
    UnknownDoseUnits { found: String },

    #[error(transparent)]
    Geometry(#[from] InvalidGeometry),

    #[error(transparent)]
    Plan(#[from] InvalidPlan),

    #[error(transparent)]
    Attr(#[from] AttrError),
}

/// Equality checks that must pass before dose grids may be summed.
#[derive(Debug, Error)]
pub enum InconsistentDoseGrids {
    #[error("`datasets` must only contain DICOM RT Dose datasets")]
    NotRtDose,

    #[error("patient ID must match for all datasets")]
    PatientIdMismatch,

    #[error("only doses whose DoseSummationType is PLAN are supported")]
    SummationTypeMismatch,

    #[error("all doses must have the same units (GY or RELATIVE)")]
    UnitsMismatch,

    #[error("only doses whose DoseType is PHYSICAL or EFFECTIVE are supported")]
    UnsupportedDoseType,

    #[error("all dose grids must have perfectly coincident coordinates")]
    CoordinateMismatch,

    #[error("no datasets were provided to sum")]
    Empty,

    #[error(transparent)]
    Dose(#[from] DoseError),

    #[error(transparent)]
    Attr(#[from] AttrError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoseUnits {
    Gray,
    Relative,
}

/// An axis-aligned scalar dose field: axes in mm, voxel array shaped
/// `(|z|, |y|, |x|)`, values scaled by `DoseGridScaling` into the stated
/// units.
#[derive(Debug, Clone)]
pub struct DoseGrid {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    dose: Array3<f64>,
    units: DoseUnits,
}

impl DoseGrid {
    /// Extract the dose grid of an RT Dose dataset, axes in the DICOM
    /// patient coordinate system.
    pub fn from_dataset(ds: &InMemDicomObject) -> Result<Self, DoseError> {
        let (x, y, z) = xyz_axes_from_dataset(ds, CoordSystem::Dicom)?;

        let scaling = attr::f64_value(ds, tags::DOSE_GRID_SCALING, "DoseGridScaling")?;
        let bits = attr::i64_value(ds, tags::BITS_ALLOCATED, "BitsAllocated")?;
        let units = match attr::string(ds, tags::DOSE_UNITS, "DoseUnits")?.as_str() {
            "GY" => DoseUnits::Gray,
            "RELATIVE" => DoseUnits::Relative,
            found => {
                return Err(DoseError::UnknownDoseUnits {
                    found: found.to_string(),
                });
            }
        };

        let pixel_element = attr::element(ds, tags::PIXEL_DATA, "PixelData")?;
        let bytes = pixel_element.to_bytes().map_err(|_| AttrError::Malformed {
            keyword: "PixelData",
            expected: "raw bytes",
        })?;

        let voxel_count = z.len() * y.len() * x.len();

        let raw: Vec<f64> = match bits {
            16 => {
                if bytes.len() != voxel_count * 2 {
                    return Err(DoseError::PixelDataLengthMismatch);
                }
                let mut words = vec![0u16; voxel_count];
                LittleEndian::read_u16_into(&bytes, &mut words);
                words.into_iter().map(f64::from).collect()
            }
            32 => {
                if bytes.len() != voxel_count * 4 {
                    return Err(DoseError::PixelDataLengthMismatch);
                }
                let mut words = vec![0u32; voxel_count];
                LittleEndian::read_u32_into(&bytes, &mut words);
                words.into_iter().map(f64::from).collect()
            }
            bits => return Err(DoseError::UnsupportedBitsAllocated { bits }),
        };

        let dose = Array3::from_shape_vec((z.len(), y.len(), x.len()), raw)
            .expect("length checked against the axes")
            .mapv(|v| v * scaling);

        Ok(DoseGrid { x, y, z, dose, units })
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn z(&self) -> &[f64] {
        &self.z
    }

    pub fn dose(&self) -> &Array3<f64> {
        &self.dose
    }

    pub fn units(&self) -> DoseUnits {
        self.units
    }

    /// Axes in the `(z, y, x)` order of the voxel array, for handing to
    /// the gamma engine.
    pub fn zyx_axes(&self) -> (&[f64], &[f64], &[f64]) {
        (&self.z, &self.y, &self.x)
    }

    /// Trilinear interpolation of the dose at `(z, y, x)` points; a point
    /// outside the grid domain is an error.
    pub fn interpolate(&self, points: &[[f64; 3]]) -> Result<Vec<f64>, InvalidGeometry> {
        let interp = RegularGridInterpolator::new(&self.z, &self.y, &self.x, self.dose.view())?;
        interp.interpolate(points)
    }
}

/// Interpolate dose along a depth ray.
///
/// Requires an HFS dose dataset and a plan whose gantry angles are all
/// exactly zero. Depth zero is the patient surface, located from
/// `SurfaceEntryPoint` or the isocentre/SSD/SAD fallback, and depth
/// increases along +y in DICOM coordinates.
pub fn depth_dose(
    depths: &[f64],
    dose_dataset: &InMemDicomObject,
    plan_dataset: &InMemDicomObject,
) -> Result<Vec<f64>, DoseError> {
    require_patient_position(dose_dataset, PatientPosition::Hfs)?;
    rtplan::require_gantries_be_zero(plan_dataset)?;

    let entry = rtplan::surface_entry_point_with_fallback(plan_dataset)?;
    let grid = DoseGrid::from_dataset(dose_dataset)?;

    let points: Vec<[f64; 3]> = depths
        .iter()
        .map(|&depth| [entry.z, depth + entry.y, entry.x])
        .collect();

    Ok(grid.interpolate(&points)?)
}

/// The axis a horizontal profile sweeps along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileDirection {
    /// Along the DICOM z axis.
    Inplane,
    /// Along the DICOM x axis.
    Crossplane,
}

/// Interpolate a horizontal dose profile at the given depth.
pub fn profile(
    displacements: &[f64],
    depth: f64,
    direction: ProfileDirection,
    dose_dataset: &InMemDicomObject,
    plan_dataset: &InMemDicomObject,
) -> Result<Vec<f64>, DoseError> {
    require_patient_position(dose_dataset, PatientPosition::Hfs)?;
    rtplan::require_gantries_be_zero(plan_dataset)?;

    let entry = rtplan::surface_entry_point_with_fallback(plan_dataset)?;
    let grid = DoseGrid::from_dataset(dose_dataset)?;
    let y = depth + entry.y;

    let points: Vec<[f64; 3]> = displacements
        .iter()
        .map(|&displacement| match direction {
            ProfileDirection::Inplane => [displacement + entry.z, y, entry.x],
            ProfileDirection::Crossplane => [entry.z, y, displacement + entry.x],
        })
        .collect();

    Ok(grid.interpolate(&points)?)
}

/// The boolean voxel mask of a named structure on a dose grid.
///
/// Contour planes must coincide with dose grid planes; there is no
/// inter-slice interpolation, and only one contour per slice is
/// supported.
pub fn structure_mask(
    structure_name: &str,
    structure_dataset: &InMemDicomObject,
    dose_dataset: &InMemDicomObject,
) -> Result<Array3<bool>, DoseError> {
    let (x_dose, y_dose, z_dose) = xyz_axes_from_dataset(dose_dataset, CoordSystem::Dicom)?;
    let contours = structure::pull_structure(structure_name, structure_dataset)?;

    let mut structure_z: Vec<f64> = Vec::with_capacity(contours.len());
    for contour in &contours {
        let mut unique = contour.z.clone();
        unique.dedup();
        if unique.len() != 1 {
            return Err(InvalidGeometry::ContourNotPlanar.into());
        }
        structure_z.push(unique[0]);
    }

    let mut sorted_structure_z = structure_z.clone();
    sorted_structure_z.sort_by(|a, b| a.partial_cmp(b).expect("z values are finite"));

    if sorted_structure_z.windows(2).any(|w| w[0] == w[1]) {
        return Err(InvalidGeometry::MultipleContoursOnSlice.into());
    }

    let mut sorted_dose_z = z_dose.clone();
    sorted_dose_z.sort_by(|a, b| a.partial_cmp(b).expect("z values are finite"));

    // Every structure plane must land on a dose plane with no gaps.
    let first_dose_index = sorted_dose_z
        .iter()
        .position(|&z| z == sorted_structure_z[0])
        .ok_or(InvalidGeometry::MisalignedPlanes)?;

    for (i, &z_value) in sorted_structure_z.iter().enumerate() {
        match sorted_dose_z.get(first_dose_index + i) {
            Some(&dose_z) if dose_z == z_value => {}
            _ => return Err(InvalidGeometry::MisalignedPlanes.into()),
        }
    }

    let mut mask = Array3::from_elem((z_dose.len(), y_dose.len(), x_dose.len()), false);

    for (contour, &z_value) in contours.iter().zip(&structure_z) {
        let dose_index = z_dose
            .iter()
            .position(|&z| z == z_value)
            .ok_or(InvalidGeometry::MisalignedPlanes)?;

        let exterior: Vec<(f64, f64)> = contour
            .x
            .iter()
            .zip(&contour.y)
            .map(|(&x, &y)| (x, y))
            .collect();
        let polygon = Polygon::new(LineString::from(exterior), vec![]);

        for (j, &y) in y_dose.iter().enumerate() {
            for (i, &x) in x_dose.iter().enumerate() {
                if polygon.contains(&GeoPoint::new(x, y)) {
                    mask[[dose_index, j, i]] = true;
                }
            }
        }
    }

    Ok(mask)
}

/// The dose values inside a named structure.
pub fn dose_within_structure(
    structure_name: &str,
    structure_dataset: &InMemDicomObject,
    dose_dataset: &InMemDicomObject,
) -> Result<Vec<f64>, DoseError> {
    let grid = DoseGrid::from_dataset(dose_dataset)?;
    let mask = structure_mask(structure_name, structure_dataset, dose_dataset)?;

    Ok(grid
        .dose()
        .iter()
        .zip(mask.iter())
        .filter(|&(_, &inside)| inside)
        .map(|(&dose, _)| dose)
        .collect())
}

fn all_equal_strings(
    datasets: &[&InMemDicomObject],
    tag: dicom::core::Tag,
    keyword: &'static str,
) -> Result<bool, AttrError> {
    let first = attr::string(datasets[0], tag, keyword)?;
    for ds in &datasets[1..] {
        if attr::string(ds, tag, keyword)? != first {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Sum two or more dose grids into a new RT Dose dataset.
///
/// The datasets must agree on modality, patient, summation type, units and
/// coordinates. The result is rescaled to 32-bit words with a fresh
/// `DoseGridScaling`.
pub fn sum_doses(datasets: &[&InMemDicomObject]) -> Result<InMemDicomObject, InconsistentDoseGrids> {
    if datasets.is_empty() {
        return Err(InconsistentDoseGrids::Empty);
    }

    for ds in datasets {
        if attr::string(ds, tags::MODALITY, "Modality")? != "RTDOSE" {
            return Err(InconsistentDoseGrids::NotRtDose);
        }
        if attr::string(ds, tags::DOSE_SUMMATION_TYPE, "DoseSummationType")? != "PLAN" {
            return Err(InconsistentDoseGrids::SummationTypeMismatch);
        }
        let dose_type = attr::string(ds, tags::DOSE_TYPE, "DoseType")?;
        if dose_type != "PHYSICAL" && dose_type != "EFFECTIVE" {
            return Err(InconsistentDoseGrids::UnsupportedDoseType);
        }
    }

    if !all_equal_strings(datasets, tags::PATIENT_ID, "PatientID")? {
        return Err(InconsistentDoseGrids::PatientIdMismatch);
    }

    if !all_equal_strings(datasets, tags::DOSE_UNITS, "DoseUnits")? {
        return Err(InconsistentDoseGrids::UnitsMismatch);
    }

    let grids: Vec<DoseGrid> = datasets
        .iter()
        .map(|ds| DoseGrid::from_dataset(ds))
        .collect::<Result<_, _>>()?;

    let first = &grids[0];
    for grid in &grids[1..] {
        if grid.x != first.x || grid.y != first.y || grid.z != first.z {
            return Err(InconsistentDoseGrids::CoordinateMismatch);
        }
    }

    let mut summed = first.dose.clone();
    for grid in &grids[1..] {
        summed += &grid.dose;
    }

    let any_effective = datasets.iter().any(|ds| {
        attr::string(ds, tags::DOSE_TYPE, "DoseType").is_ok_and(|t| t == "EFFECTIVE")
    });

    let mut ds_summed = datasets[0].clone();

    ds_summed.put(dicom::core::DataElement::new(
        tags::BITS_ALLOCATED,
        VR::US,
        dicom::core::PrimitiveValue::from(32u16),
    ));
    ds_summed.put(dicom::core::DataElement::new(
        tags::BITS_STORED,
        VR::US,
        dicom::core::PrimitiveValue::from(32u16),
    ));
    ds_summed.put(dicom::core::DataElement::new(
        tags::HIGH_BIT,
        VR::US,
        dicom::core::PrimitiveValue::from(31u16),
    ));
    put_str(&mut ds_summed, tags::DOSE_SUMMATION_TYPE, VR::CS, "MULTI_PLAN");
    put_str(&mut ds_summed, tags::DOSE_COMMENT, VR::LO, "Summed Dose");
    put_str(
        &mut ds_summed,
        tags::DOSE_TYPE,
        VR::CS,
        if any_effective { "EFFECTIVE" } else { "PHYSICAL" },
    );

    let maximum = summed.iter().copied().fold(0.0f64, f64::max);
    let scaling = maximum / 2f64.powi(31);
    put_str(
        &mut ds_summed,
        tags::DOSE_GRID_SCALING,
        VR::DS,
        format!("{scaling}"),
    );

    let words: Vec<u32> = summed
        .iter()
        .map(|&dose| if scaling == 0.0 { 0 } else { (dose / scaling) as u32 })
        .collect();
    let mut bytes = vec![0u8; words.len() * 4];
    LittleEndian::write_u32_into(&words, &mut bytes);

    ds_summed.put(dicom::core::DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        dicom::core::PrimitiveValue::from(bytes),
    ));

    Ok(ds_summed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use dicom::core::{DataElement, PrimitiveValue};

    pub(crate) fn dose_dataset(
        rows: usize,
        columns: usize,
        frames: usize,
        values: &[u16],
        scaling: f64,
    ) -> InMemDicomObject {
        let mut ds = InMemDicomObject::new_empty();

        put_str(&mut ds, tags::MODALITY, VR::CS, "RTDOSE");
        put_str(&mut ds, tags::PATIENT_ID, VR::LO, "PMX-0001");
        put_str(&mut ds, tags::DOSE_UNITS, VR::CS, "GY");
        put_str(&mut ds, tags::DOSE_TYPE, VR::CS, "PHYSICAL");
        put_str(&mut ds, tags::DOSE_SUMMATION_TYPE, VR::CS, "PLAN");
        put_str(&mut ds, tags::PATIENT_POSITION, VR::CS, "HFS");
        put_str(
            &mut ds,
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            "1.0\\0.0\\0.0\\0.0\\1.0\\0.0",
        );
        put_str(
            &mut ds,
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            "0.0\\0.0\\0.0",
        );
        put_str(&mut ds, tags::PIXEL_SPACING, VR::DS, "2.0\\2.0");
        ds.put(DataElement::new(
            tags::ROWS,
            VR::US,
            PrimitiveValue::from(rows as u16),
        ));
        ds.put(DataElement::new(
            tags::COLUMNS,
            VR::US,
            PrimitiveValue::from(columns as u16),
        ));
        put_str(
            &mut ds,
            tags::GRID_FRAME_OFFSET_VECTOR,
            VR::DS,
            (0..frames)
                .map(|i| format!("{}", i as f64 * 2.0))
                .collect::<Vec<_>>()
                .join("\\"),
        );
        put_str(
            &mut ds,
            tags::DOSE_GRID_SCALING,
            VR::DS,
            format!("{scaling}"),
        );
        ds.put(DataElement::new(
            tags::BITS_ALLOCATED,
            VR::US,
            PrimitiveValue::from(16u16),
        ));

        let mut bytes = vec![0u8; values.len() * 2];
        LittleEndian::write_u16_into(values, &mut bytes);
        ds.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::from(bytes),
        ));

        ds
    }

    #[test]
    fn dose_grid_extraction_applies_scaling() {
        let values: Vec<u16> = (0..2 * 3 * 4).collect();
        let ds = dose_dataset(3, 4, 2, &values, 0.5);
        let grid = DoseGrid::from_dataset(&ds).unwrap();

        assert_eq!(grid.dose().dim(), (2, 3, 4));
        assert_eq!(grid.x(), &[0.0, 2.0, 4.0, 6.0]);
        assert_eq!(grid.y(), &[0.0, 2.0, 4.0]);
        assert_eq!(grid.z(), &[0.0, 2.0]);
        assert_abs_diff_eq!(grid.dose()[[1, 2, 3]], 23.0 * 0.5);
        assert_eq!(grid.units(), DoseUnits::Gray);
    }

    #[test]
    fn mismatched_pixel_data_length_is_rejected() {
        let values: Vec<u16> = vec![0; 5];
        let ds = dose_dataset(3, 4, 2, &values, 1.0);
        assert!(matches!(
            DoseGrid::from_dataset(&ds),
            Err(DoseError::PixelDataLengthMismatch)
        ));
    }

    #[test]
    fn summing_requires_matching_patient() {
        let values: Vec<u16> = vec![100; 2 * 3 * 4];
        let a = dose_dataset(3, 4, 2, &values, 0.01);
        let mut b = dose_dataset(3, 4, 2, &values, 0.01);
        put_str(&mut b, tags::PATIENT_ID, VR::LO, "SOMEONE-ELSE");

        assert!(matches!(
            sum_doses(&[&a, &b]),
            Err(InconsistentDoseGrids::PatientIdMismatch)
        ));
    }

    #[test]
    fn summed_doses_round_trip_through_the_new_scaling() {
        let values: Vec<u16> = (0..2 * 3 * 4).map(|v| v * 10).collect();
        let a = dose_dataset(3, 4, 2, &values, 0.01);
        let b = dose_dataset(3, 4, 2, &values, 0.02);

        let summed = sum_doses(&[&a, &b]).unwrap();
        let grid = DoseGrid::from_dataset(&summed).unwrap();

        // The voxel dose of the sum matches a + b to the 32-bit rescale
        // precision.
        let expected = 230.0 * 0.01 + 230.0 * 0.02;
        assert_abs_diff_eq!(grid.dose()[[1, 2, 3]], expected, epsilon = 1e-6);

        assert_eq!(
            attr::string(&summed, tags::DOSE_SUMMATION_TYPE, "DoseSummationType").unwrap(),
            "MULTI_PLAN"
        );
    }

    fn structure_set_with_square(z: f64) -> InMemDicomObject {
        let mut roi = InMemDicomObject::new_empty();
        put_str(&mut roi, tags::ROI_NUMBER, VR::IS, "1");
        put_str(&mut roi, tags::ROI_NAME, VR::LO, "PTV");

        let square = [(1.0, 1.0), (5.0, 1.0), (5.0, 5.0), (1.0, 5.0)];
        let data: Vec<String> = square
            .iter()
            .flat_map(|&(x, y)| [format!("{x}"), format!("{y}"), format!("{z}")])
            .collect();

        let mut contour = InMemDicomObject::new_empty();
        put_str(&mut contour, tags::CONTOUR_GEOMETRIC_TYPE, VR::CS, "CLOSED_PLANAR");
        put_str(&mut contour, tags::CONTOUR_DATA, VR::DS, data.join("\\"));

        let mut roi_contour = InMemDicomObject::new_empty();
        put_str(&mut roi_contour, tags::REFERENCED_ROI_NUMBER, VR::IS, "1");
        rtplan::put_sequence(&mut roi_contour, tags::CONTOUR_SEQUENCE, vec![contour]);

        let mut ds = InMemDicomObject::new_empty();
        rtplan::put_sequence(&mut ds, tags::STRUCTURE_SET_ROI_SEQUENCE, vec![roi]);
        rtplan::put_sequence(&mut ds, tags::ROI_CONTOUR_SEQUENCE, vec![roi_contour]);
        ds
    }

    #[test]
    fn structure_mask_marks_voxels_inside_the_contour() {
        let values: Vec<u16> = (0..2 * 4 * 4).collect();
        let dose = dose_dataset(4, 4, 2, &values, 1.0);
        let structures = structure_set_with_square(0.0);

        let mask = structure_mask("PTV", &structures, &dose).unwrap();
        assert_eq!(mask.dim(), (2, 4, 4));

        // Grid points at x, y in {2, 4} sit inside the 1..5 square, on
        // the z = 0 plane only.
        let inside = mask.iter().filter(|&&v| v).count();
        assert_eq!(inside, 4);
        assert!(mask[[0, 1, 1]]);
        assert!(mask[[0, 2, 2]]);
        assert!(!mask[[1, 1, 1]]);

        let doses = dose_within_structure("PTV", &structures, &dose).unwrap();
        assert_eq!(doses.len(), 4);
    }

    #[test]
    fn contours_off_the_dose_planes_are_rejected() {
        let values: Vec<u16> = (0..2 * 4 * 4).collect();
        let dose = dose_dataset(4, 4, 2, &values, 1.0);
        let structures = structure_set_with_square(1.0);

        assert!(matches!(
            structure_mask("PTV", &structures, &dose),
            Err(DoseError::Geometry(InvalidGeometry::MisalignedPlanes))
        ));
    }

    #[test]
    fn depth_dose_samples_the_central_axis() {
        let dose = crate::test_data::depth_dose_fixture();
        let plan = crate::test_data::rtplan_fixture(&[0.0], &[100.0]);

        let depths: Vec<f64> = (0..=30).map(|i| i as f64 * 10.0).collect();
        let extracted = depth_dose(&depths, &dose, &plan).unwrap();

        assert_eq!(extracted.len(), 31);
        assert!(extracted.iter().all(|v| v.is_finite()));

        // The surface value sits within 5% of the grid maximum.
        let grid = DoseGrid::from_dataset(&dose).unwrap();
        let maximum = grid.dose().iter().copied().fold(0.0f64, f64::max);
        assert!((extracted[0] - maximum).abs() / maximum < 0.05);

        // Dose falls off monotonically with depth in this field.
        assert!(extracted.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn depth_dose_requires_zero_gantry() {
        let dose = crate::test_data::depth_dose_fixture();
        let plan = crate::test_data::rtplan_fixture(&[90.0], &[100.0]);

        let depths = [0.0, 10.0];
        let err = depth_dose(&depths, &dose, &plan).unwrap_err();
        assert!(matches!(
            err,
            DoseError::Plan(InvalidPlan::Geometry(InvalidGeometry::GantryNotZero))
        ));
    }

    #[test]
    fn profiles_sweep_the_requested_axis() {
        let dose = crate::test_data::depth_dose_fixture();
        let plan = crate::test_data::rtplan_fixture(&[0.0], &[100.0]);

        let displacements = [-10.0, 0.0, 10.0];
        let crossplane = profile(
            &displacements,
            50.0,
            ProfileDirection::Crossplane,
            &dose,
            &plan,
        )
        .unwrap();
        let inplane = profile(
            &displacements,
            50.0,
            ProfileDirection::Inplane,
            &dose,
            &plan,
        )
        .unwrap();

        // The fixture dose varies only with depth, so both profiles are
        // flat and equal to the central-axis dose at that depth.
        let expected = depth_dose(&[50.0], &dose, &plan).unwrap()[0];
        for value in crossplane.iter().chain(inplane.iter()) {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn summing_rejects_mismatched_coordinates() {
        let values: Vec<u16> = vec![1; 2 * 3 * 4];
        let a = dose_dataset(3, 4, 2, &values, 1.0);
        let mut b = dose_dataset(3, 4, 2, &values, 1.0);
        put_str(
            &mut b,
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            "5.0\\0.0\\0.0",
        );

        assert!(matches!(
            sum_doses(&[&a, &b]),
            Err(InconsistentDoseGrids::CoordinateMismatch)
        ));
    }
}
