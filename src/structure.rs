//! Structure-set services: contour extraction, per-slice polygon merging
//! and frame-of-reference splitting.

use dicom::core::VR;
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use geo::{BooleanOps, MultiPolygon, Polygon};
use geo::LineString;

use crate::attr::{self, AttrError};
use crate::coords::InvalidGeometry;
use crate::rtplan::{format_ds, items_owned, put_sequence, put_str};

const CONTOUR_GEOMETRIC_TYPE: &str = "CLOSED_PLANAR";
const SPATIAL_REGISTRATION_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.66.1";

/// One closed planar contour; `z` carries the raw per-vertex values so
/// planarity can be checked downstream.
#[derive(Debug, Clone)]
pub struct Contour {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

pub(crate) fn generate_uid() -> String {
    format!("2.25.{}", uuid::Uuid::new_v4().as_u128())
}

fn roi_number_by_name(
    structure_set: &InMemDicomObject,
    name: &str,
) -> Result<i64, InvalidGeometry> {
    for roi in attr::items(
        structure_set,
        tags::STRUCTURE_SET_ROI_SEQUENCE,
        "StructureSetROISequence",
    )? {
        if attr::string(roi, tags::ROI_NAME, "ROIName")? == name {
            return Ok(attr::i64_value(roi, tags::ROI_NUMBER, "ROINumber")?);
        }
    }

    Err(InvalidGeometry::UnknownRoi {
        name: name.to_string(),
    })
}

fn roi_contour_index_by_name(
    structure_set: &InMemDicomObject,
    name: &str,
) -> Result<usize, InvalidGeometry> {
    let number = roi_number_by_name(structure_set, name)?;

    let contour_sequences = attr::items(
        structure_set,
        tags::ROI_CONTOUR_SEQUENCE,
        "ROIContourSequence",
    )?;

    contour_sequences
        .iter()
        .position(|item| {
            attr::i64_value(item, tags::REFERENCED_ROI_NUMBER, "ReferencedROINumber")
                .is_ok_and(|found| found == number)
        })
        .ok_or(InvalidGeometry::UnknownRoi {
            name: name.to_string(),
        })
}

/// Extract the contours of the named ROI.
pub fn pull_structure(
    name: &str,
    structure_set: &InMemDicomObject,
) -> Result<Vec<Contour>, InvalidGeometry> {
    let index = roi_contour_index_by_name(structure_set, name)?;
    let contour_sequences = attr::items(
        structure_set,
        tags::ROI_CONTOUR_SEQUENCE,
        "ROIContourSequence",
    )?;

    let contour_sequence = attr::items(
        &contour_sequences[index],
        tags::CONTOUR_SEQUENCE,
        "ContourSequence",
    )?;

    contour_sequence
        .iter()
        .map(|contour| {
            let data = attr::multi_f64(contour, tags::CONTOUR_DATA, "ContourData")?;
            if data.len() % 3 != 0 {
                return Err(InvalidGeometry::MalformedContourData);
            }

            Ok(Contour {
                x: data.iter().step_by(3).copied().collect(),
                y: data.iter().skip(1).step_by(3).copied().collect(),
                z: data.iter().skip(2).step_by(3).copied().collect(),
            })
        })
        .collect()
}

struct SliceContours {
    z: f64,
    polygons: Vec<Polygon<f64>>,
    image_reference: (String, String),
    image_sequence: Vec<InMemDicomObject>,
}

fn extract_slice_contours(
    contour_sequence: &[InMemDicomObject],
) -> Result<Vec<SliceContours>, InvalidGeometry> {
    let mut slices: Vec<SliceContours> = Vec::new();

    for contour in contour_sequence {
        let geometric_type =
            attr::string(contour, tags::CONTOUR_GEOMETRIC_TYPE, "ContourGeometricType")?;
        if geometric_type != CONTOUR_GEOMETRIC_TYPE {
            return Err(InvalidGeometry::UnsupportedContourType {
                found: geometric_type,
            });
        }

        let data = attr::multi_f64(contour, tags::CONTOUR_DATA, "ContourData")?;
        if data.len() % 3 != 0 {
            return Err(InvalidGeometry::MalformedContourData);
        }

        let mut z_values: Vec<f64> = data.iter().skip(2).step_by(3).copied().collect();
        z_values.dedup();
        if z_values.len() != 1 {
            return Err(InvalidGeometry::ContourNotPlanar);
        }
        let z = z_values[0];

        let exterior: Vec<(f64, f64)> = data
            .chunks_exact(3)
            .map(|triple| (triple[0], triple[1]))
            .collect();
        let polygon = Polygon::new(LineString::from(exterior), vec![]);

        let image_sequence = items_owned(
            contour,
            tags::CONTOUR_IMAGE_SEQUENCE,
            "ContourImageSequence",
        )?;
        if image_sequence.len() != 1 {
            return Err(InvalidGeometry::ConflictingReferencedImages);
        }
        let image_reference = (
            attr::string(
                &image_sequence[0],
                tags::REFERENCED_SOP_CLASS_UID,
                "ReferencedSOPClassUID",
            )?,
            attr::string(
                &image_sequence[0],
                tags::REFERENCED_SOP_INSTANCE_UID,
                "ReferencedSOPInstanceUID",
            )?,
        );

        match slices.iter_mut().find(|slice| slice.z == z) {
            Some(slice) => {
                if slice.image_reference != image_reference {
                    return Err(InvalidGeometry::ConflictingReferencedImages);
                }
                slice.polygons.push(polygon);
            }
            None => slices.push(SliceContours {
                z,
                polygons: vec![polygon],
                image_reference,
                image_sequence,
            }),
        }
    }

    Ok(slices)
}

fn union_polygons(polygons: &[Polygon<f64>]) -> MultiPolygon<f64> {
    let mut merged = MultiPolygon::new(vec![polygons[0].clone()]);

    for polygon in &polygons[1..] {
        merged = merged.union(&MultiPolygon::new(vec![polygon.clone()]));
    }

    merged
}

fn contour_data_from_polygon(polygon: &Polygon<f64>, z: f64) -> Vec<String> {
    polygon
        .exterior()
        .coords()
        .flat_map(|coord| {
            [
                format_ds((coord.x * 10.0).round() / 10.0),
                format_ds((coord.y * 10.0).round() / 10.0),
                format_ds((z * 10.0).round() / 10.0),
            ]
        })
        .collect()
}

/// Merge the overlapping contours of one `ROIContourSequence` item,
/// slice by slice.
///
/// The contours must be CLOSED_PLANAR with one z per contour, and all
/// contours of a slice must reference the same image. Unions producing
/// multiple disjoint polygons emit one contour item per polygon.
pub fn merge_contours(
    roi_contour: &InMemDicomObject,
) -> Result<InMemDicomObject, InvalidGeometry> {
    let contour_sequence = items_owned(roi_contour, tags::CONTOUR_SEQUENCE, "ContourSequence")?;
    let slices = extract_slice_contours(&contour_sequence)?;

    let mut new_contour_sequence = Vec::new();

    for slice in &slices {
        let merged = union_polygons(&slice.polygons);

        for polygon in &merged {
            let contour_data = contour_data_from_polygon(polygon, slice.z);

            let mut contour = InMemDicomObject::new_empty();
            put_str(
                &mut contour,
                tags::CONTOUR_GEOMETRIC_TYPE,
                VR::CS,
                CONTOUR_GEOMETRIC_TYPE,
            );
            put_str(
                &mut contour,
                tags::NUMBER_OF_CONTOUR_POINTS,
                VR::IS,
                (contour_data.len() / 3).to_string(),
            );
            put_str(
                &mut contour,
                tags::CONTOUR_DATA,
                VR::DS,
                contour_data.join("\\"),
            );
            put_sequence(
                &mut contour,
                tags::CONTOUR_IMAGE_SEQUENCE,
                slice.image_sequence.clone(),
            );

            new_contour_sequence.push(contour);
        }
    }

    let mut merged_roi_contour = roi_contour.clone();
    put_sequence(
        &mut merged_roi_contour,
        tags::CONTOUR_SEQUENCE,
        new_contour_sequence,
    );

    Ok(merged_roi_contour)
}

/// Merge contours across a whole structure set. With `structures` given,
/// only the named ROIs are merged; otherwise every ROI is.
pub fn merge_structure_set_contours(
    structure_set: &InMemDicomObject,
    structures: Option<&[&str]>,
) -> Result<InMemDicomObject, InvalidGeometry> {
    let indices: Vec<usize> = match structures {
        Some(names) => names
            .iter()
            .map(|name| roi_contour_index_by_name(structure_set, name))
            .collect::<Result<_, _>>()?,
        None => {
            let count = attr::items(
                structure_set,
                tags::ROI_CONTOUR_SEQUENCE,
                "ROIContourSequence",
            )?
            .len();
            (0..count).collect()
        }
    };

    let mut roi_contours = items_owned(
        structure_set,
        tags::ROI_CONTOUR_SEQUENCE,
        "ROIContourSequence",
    )?;

    for index in indices {
        roi_contours[index] = merge_contours(&roi_contours[index])?;
    }

    let mut merged = structure_set.clone();
    put_sequence(&mut merged, tags::ROI_CONTOUR_SEQUENCE, roi_contours);

    Ok(merged)
}

/// Append or replace the `REL_ELEC_DENSITY` physical property of the
/// named structures.
pub fn adjust_rel_elec_density(
    structure_set: &InMemDicomObject,
    adjustments: &[(String, f64)],
    ignore_missing_structure: bool,
) -> Result<InMemDicomObject, InvalidGeometry> {
    let mut observations = items_owned(
        structure_set,
        tags::RTROI_OBSERVATIONS_SEQUENCE,
        "RTROIObservationsSequence",
    )?;

    for (name, density) in adjustments {
        let number = match roi_number_by_name(structure_set, name) {
            Ok(number) => number,
            Err(InvalidGeometry::UnknownRoi { .. }) if ignore_missing_structure => continue,
            Err(err) => return Err(err),
        };

        let observation = observations
            .iter_mut()
            .find(|observation| {
                attr::i64_value(observation, tags::REFERENCED_ROI_NUMBER, "ReferencedROINumber")
                    .is_ok_and(|found| found == number)
            })
            .ok_or(InvalidGeometry::UnknownRoi { name: name.clone() })?;

        let mut properties = items_owned(
            observation,
            tags::ROI_PHYSICAL_PROPERTIES_SEQUENCE,
            "ROIPhysicalPropertiesSequence",
        )
        .unwrap_or_default();

        properties.retain(|property| {
            attr::string(property, tags::ROI_PHYSICAL_PROPERTY, "ROIPhysicalProperty")
                .map(|value| value != "REL_ELEC_DENSITY")
                .unwrap_or(true)
        });

        let mut property = InMemDicomObject::new_empty();
        put_str(
            &mut property,
            tags::ROI_PHYSICAL_PROPERTY,
            VR::CS,
            "REL_ELEC_DENSITY",
        );
        put_str(
            &mut property,
            tags::ROI_PHYSICAL_PROPERTY_VALUE,
            VR::DS,
            format_ds(*density),
        );
        properties.push(property);

        put_sequence(
            observation,
            tags::ROI_PHYSICAL_PROPERTIES_SEQUENCE,
            properties,
        );
    }

    let mut adjusted = structure_set.clone();
    put_sequence(
        &mut adjusted,
        tags::RTROI_OBSERVATIONS_SEQUENCE,
        observations,
    );

    Ok(adjusted)
}

/// Parse `"<name> RED = <value>"` style structure names into an
/// adjustment map for [`adjust_rel_elec_density`].
pub fn red_adjustment_map_from_structure_names(structure_names: &[String]) -> Vec<(String, f64)> {
    let pattern = regex::Regex::new(r"(?i)^.*RED\s*[=:]\s*(\d+\.?\d*)\s*$")
        .expect("pattern is valid");

    structure_names
        .iter()
        .filter_map(|name| {
            pattern.captures(name).and_then(|captures| {
                captures[1]
                    .parse::<f64>()
                    .ok()
                    .map(|density| (name.clone(), density))
            })
        })
        .collect()
}

fn filter_items_by_roi(
    ds: &mut InMemDicomObject,
    tag: dicom::core::Tag,
    keyword: &'static str,
    number_tag: dicom::core::Tag,
    number_keyword: &'static str,
    keep: &[i64],
) -> Result<(), AttrError> {
    let items = items_owned(ds, tag, keyword)?;
    let kept: Vec<InMemDicomObject> = items
        .into_iter()
        .filter(|item| {
            attr::i64_value(item, number_tag, number_keyword)
                .is_ok_and(|number| keep.contains(&number))
        })
        .collect();
    put_sequence(ds, tag, kept);
    Ok(())
}

fn identity_registration(
    reference: &InMemDicomObject,
    source_for: &str,
    target_for: &str,
    date: &str,
    time: &str,
) -> InMemDicomObject {
    let mut registration = InMemDicomObject::new_empty();

    put_str(&mut registration, tags::SOP_CLASS_UID, VR::UI, SPATIAL_REGISTRATION_SOP_CLASS);
    put_str(&mut registration, tags::SOP_INSTANCE_UID, VR::UI, generate_uid());
    put_str(&mut registration, tags::MODALITY, VR::CS, "REG");
    put_str(&mut registration, tags::SERIES_INSTANCE_UID, VR::UI, generate_uid());
    put_str(&mut registration, tags::SERIES_NUMBER, VR::IS, "1");
    put_str(&mut registration, tags::INSTANCE_NUMBER, VR::IS, "1");
    put_str(&mut registration, tags::SERIES_DATE, VR::DA, date);
    put_str(&mut registration, tags::SERIES_TIME, VR::TM, time);
    put_str(&mut registration, tags::CONTENT_DATE, VR::DA, date);
    put_str(&mut registration, tags::CONTENT_TIME, VR::TM, time);
    put_str(&mut registration, tags::CONTENT_LABEL, VR::CS, "REGISTRATION");
    put_str(
        &mut registration,
        tags::CONTENT_DESCRIPTION,
        VR::LO,
        format!("Registration from {source_for} to {target_for}"),
    );
    put_str(
        &mut registration,
        tags::SERIES_DESCRIPTION,
        VR::LO,
        format!(
            "Spatial Registration {} to {}",
            &source_for[..source_for.len().min(16)],
            &target_for[..target_for.len().min(16)]
        ),
    );

    for &tag in &[
        tags::PATIENT_NAME,
        tags::PATIENT_ID,
        tags::PATIENT_BIRTH_DATE,
        tags::PATIENT_SEX,
        tags::STUDY_INSTANCE_UID,
        tags::STUDY_DATE,
        tags::STUDY_TIME,
        tags::STUDY_ID,
        tags::ACCESSION_NUMBER,
    ] {
        if let Ok(element) = reference.element(tag) {
            registration.put(element.clone());
        }
    }

    let mut matrix_item = InMemDicomObject::new_empty();
    put_str(
        &mut matrix_item,
        tags::FRAME_OF_REFERENCE_TRANSFORMATION_MATRIX_TYPE,
        VR::CS,
        "RIGID",
    );
    let identity: Vec<String> = (0..16)
        .map(|i| if i % 5 == 0 { "1.0" } else { "0.0" }.to_string())
        .collect();
    put_str(
        &mut matrix_item,
        tags::FRAME_OF_REFERENCE_TRANSFORMATION_MATRIX,
        VR::DS,
        identity.join("\\"),
    );

    let mut matrix_registration = InMemDicomObject::new_empty();
    put_sequence(
        &mut matrix_registration,
        tags::MATRIX_SEQUENCE,
        vec![matrix_item],
    );

    let mut registration_item = InMemDicomObject::new_empty();
    put_str(
        &mut registration_item,
        tags::FRAME_OF_REFERENCE_UID,
        VR::UI,
        target_for,
    );
    put_sequence(
        &mut registration_item,
        tags::MATRIX_REGISTRATION_SEQUENCE,
        vec![matrix_registration],
    );

    put_sequence(
        &mut registration,
        tags::REGISTRATION_SEQUENCE,
        vec![registration_item],
    );

    registration
}

/// Split a structure set referencing multiple Frame of Reference UIDs
/// into one set per FoR, plus one identity spatial registration per FoR
/// pair.
///
/// A single-FoR input is returned unchanged with no registrations. Split
/// outputs receive fresh SOP instance UIDs, a distinguishing series
/// description and current timestamps.
pub fn split_by_frame_of_reference(
    structure_set: &InMemDicomObject,
) -> Result<(Vec<InMemDicomObject>, Vec<InMemDicomObject>), InvalidGeometry> {
    let rois = attr::items(
        structure_set,
        tags::STRUCTURE_SET_ROI_SEQUENCE,
        "StructureSetROISequence",
    )?;

    // FoR UID -> ROI numbers, preserving first-seen order.
    let mut for_to_rois: Vec<(String, Vec<i64>)> = Vec::new();
    for roi in rois {
        let number = attr::i64_value(roi, tags::ROI_NUMBER, "ROINumber")?;
        let for_uid = attr::string(
            roi,
            tags::REFERENCED_FRAME_OF_REFERENCE_UID,
            "ReferencedFrameOfReferenceUID",
        )?;

        match for_to_rois.iter_mut().find(|(uid, _)| *uid == for_uid) {
            Some((_, numbers)) => numbers.push(number),
            None => for_to_rois.push((for_uid, vec![number])),
        }
    }

    if for_to_rois.len() <= 1 {
        return Ok((vec![structure_set.clone()], Vec::new()));
    }

    let now = chrono::Local::now();
    let date = now.format("%Y%m%d").to_string();
    let time = now.format("%H%M%S%.3f").to_string();

    let mut split_sets = Vec::with_capacity(for_to_rois.len());

    for (for_uid, roi_numbers) in &for_to_rois {
        let mut split = structure_set.clone();

        put_str(&mut split, tags::SOP_INSTANCE_UID, VR::UI, generate_uid());

        let description = attr::opt_string(&split, tags::SERIES_DESCRIPTION, "SeriesDescription")?
            .map(|existing| format!("{existing} - FOR Split"))
            .unwrap_or_else(|| "Structure Set - FOR Split".to_string());
        put_str(&mut split, tags::SERIES_DESCRIPTION, VR::LO, description);
        put_str(&mut split, tags::INSTANCE_CREATION_DATE, VR::DA, date.clone());
        put_str(&mut split, tags::INSTANCE_CREATION_TIME, VR::TM, time.clone());

        filter_items_by_roi(
            &mut split,
            tags::STRUCTURE_SET_ROI_SEQUENCE,
            "StructureSetROISequence",
            tags::ROI_NUMBER,
            "ROINumber",
            roi_numbers,
        )?;
        filter_items_by_roi(
            &mut split,
            tags::ROI_CONTOUR_SEQUENCE,
            "ROIContourSequence",
            tags::REFERENCED_ROI_NUMBER,
            "ReferencedROINumber",
            roi_numbers,
        )?;
        if split.element(tags::RTROI_OBSERVATIONS_SEQUENCE).is_ok() {
            filter_items_by_roi(
                &mut split,
                tags::RTROI_OBSERVATIONS_SEQUENCE,
                "RTROIObservationsSequence",
                tags::REFERENCED_ROI_NUMBER,
                "ReferencedROINumber",
                roi_numbers,
            )?;
        }

        if let Ok(referenced) = items_owned(
            &split,
            tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE,
            "ReferencedFrameOfReferenceSequence",
        ) {
            let kept: Vec<InMemDicomObject> = referenced
                .into_iter()
                .filter(|item| {
                    attr::string(item, tags::FRAME_OF_REFERENCE_UID, "FrameOfReferenceUID")
                        .is_ok_and(|uid| uid == *for_uid)
                })
                .collect();
            put_sequence(&mut split, tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE, kept);
        }

        split_sets.push(split);
    }

    let mut registrations = Vec::new();
    for i in 0..for_to_rois.len() {
        for j in i + 1..for_to_rois.len() {
            registrations.push(identity_registration(
                structure_set,
                &for_to_rois[i].0,
                &for_to_rois[j].0,
                &date,
                &time,
            ));
        }
    }

    Ok((split_sets, registrations))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roi_entry(number: i64, name: &str, for_uid: &str) -> InMemDicomObject {
        let mut roi = InMemDicomObject::new_empty();
        put_str(&mut roi, tags::ROI_NUMBER, VR::IS, number.to_string());
        put_str(&mut roi, tags::ROI_NAME, VR::LO, name);
        put_str(
            &mut roi,
            tags::REFERENCED_FRAME_OF_REFERENCE_UID,
            VR::UI,
            for_uid,
        );
        roi
    }

    fn contour_item(points: &[(f64, f64)], z: f64, image_uid: &str) -> InMemDicomObject {
        let mut image = InMemDicomObject::new_empty();
        put_str(
            &mut image,
            tags::REFERENCED_SOP_CLASS_UID,
            VR::UI,
            "1.2.840.10008.5.1.4.1.1.2",
        );
        put_str(&mut image, tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, image_uid);

        let data: Vec<String> = points
            .iter()
            .flat_map(|&(x, y)| [format_ds(x), format_ds(y), format_ds(z)])
            .collect();

        let mut contour = InMemDicomObject::new_empty();
        put_str(&mut contour, tags::CONTOUR_GEOMETRIC_TYPE, VR::CS, "CLOSED_PLANAR");
        put_str(
            &mut contour,
            tags::NUMBER_OF_CONTOUR_POINTS,
            VR::IS,
            points.len().to_string(),
        );
        put_str(&mut contour, tags::CONTOUR_DATA, VR::DS, data.join("\\"));
        put_sequence(&mut contour, tags::CONTOUR_IMAGE_SEQUENCE, vec![image]);

        contour
    }

    fn roi_contour_entry(number: i64, contours: Vec<InMemDicomObject>) -> InMemDicomObject {
        let mut roi_contour = InMemDicomObject::new_empty();
        put_str(
            &mut roi_contour,
            tags::REFERENCED_ROI_NUMBER,
            VR::IS,
            number.to_string(),
        );
        put_sequence(&mut roi_contour, tags::CONTOUR_SEQUENCE, contours);
        roi_contour
    }

    fn observation_entry(number: i64) -> InMemDicomObject {
        let mut observation = InMemDicomObject::new_empty();
        put_str(
            &mut observation,
            tags::REFERENCED_ROI_NUMBER,
            VR::IS,
            number.to_string(),
        );
        observation
    }

    fn two_for_structure_set() -> InMemDicomObject {
        let mut ds = InMemDicomObject::new_empty();
        put_str(&mut ds, tags::SOP_INSTANCE_UID, VR::UI, "2.25.100");
        put_str(&mut ds, tags::SERIES_DESCRIPTION, VR::LO, "Planning structures");
        put_str(&mut ds, tags::PATIENT_ID, VR::LO, "PMX-0001");

        put_sequence(
            &mut ds,
            tags::STRUCTURE_SET_ROI_SEQUENCE,
            vec![
                roi_entry(1, "PTV", "2.25.7001"),
                roi_entry(2, "Lung_L", "2.25.7001"),
                roi_entry(3, "Couch", "2.25.7002"),
            ],
        );

        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        put_sequence(
            &mut ds,
            tags::ROI_CONTOUR_SEQUENCE,
            vec![
                roi_contour_entry(1, vec![contour_item(&square, 0.0, "2.25.9001")]),
                roi_contour_entry(2, vec![contour_item(&square, 0.0, "2.25.9001")]),
                roi_contour_entry(3, vec![contour_item(&square, 0.0, "2.25.9001")]),
            ],
        );

        put_sequence(
            &mut ds,
            tags::RTROI_OBSERVATIONS_SEQUENCE,
            vec![observation_entry(1), observation_entry(2), observation_entry(3)],
        );

        let mut for_a = InMemDicomObject::new_empty();
        put_str(&mut for_a, tags::FRAME_OF_REFERENCE_UID, VR::UI, "2.25.7001");
        let mut for_b = InMemDicomObject::new_empty();
        put_str(&mut for_b, tags::FRAME_OF_REFERENCE_UID, VR::UI, "2.25.7002");
        put_sequence(
            &mut ds,
            tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE,
            vec![for_a, for_b],
        );

        ds
    }

    #[test]
    fn pull_structure_extracts_contour_triples() {
        let ds = two_for_structure_set();
        let contours = pull_structure("PTV", &ds).unwrap();
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].x, vec![0.0, 10.0, 10.0, 0.0]);
        assert_eq!(contours[0].z, vec![0.0; 4]);

        assert!(matches!(
            pull_structure("Missing", &ds),
            Err(InvalidGeometry::UnknownRoi { .. })
        ));
    }

    #[test]
    fn merging_two_overlapping_squares_gives_one_contour() {
        let a = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        let b = [(5.0, 0.0), (15.0, 0.0), (15.0, 10.0), (5.0, 10.0)];
        let roi_contour = roi_contour_entry(
            1,
            vec![
                contour_item(&a, 0.0, "2.25.9001"),
                contour_item(&b, 0.0, "2.25.9001"),
            ],
        );

        let merged = merge_contours(&roi_contour).unwrap();
        let contour_sequence = attr::items(&merged, tags::CONTOUR_SEQUENCE, "ContourSequence")
            .unwrap();
        assert_eq!(contour_sequence.len(), 1);

        let data = attr::multi_f64(&contour_sequence[0], tags::CONTOUR_DATA, "ContourData")
            .unwrap();
        let xs: Vec<f64> = data.iter().step_by(3).copied().collect();
        let max_x = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(max_x, 15.0);
    }

    #[test]
    fn disjoint_squares_stay_separate_contours() {
        let a = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        let b = [(20.0, 0.0), (30.0, 0.0), (30.0, 10.0), (20.0, 10.0)];
        let roi_contour = roi_contour_entry(
            1,
            vec![
                contour_item(&a, 0.0, "2.25.9001"),
                contour_item(&b, 0.0, "2.25.9001"),
            ],
        );

        let merged = merge_contours(&roi_contour).unwrap();
        let contour_sequence = attr::items(&merged, tags::CONTOUR_SEQUENCE, "ContourSequence")
            .unwrap();
        assert_eq!(contour_sequence.len(), 2);
    }

    #[test]
    fn conflicting_referenced_images_are_rejected() {
        let a = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        let roi_contour = roi_contour_entry(
            1,
            vec![
                contour_item(&a, 0.0, "2.25.9001"),
                contour_item(&a, 0.0, "2.25.9002"),
            ],
        );

        assert!(matches!(
            merge_contours(&roi_contour),
            Err(InvalidGeometry::ConflictingReferencedImages)
        ));
    }

    #[test]
    fn split_produces_one_set_per_frame_of_reference() {
        let ds = two_for_structure_set();
        let (split, registrations) = split_by_frame_of_reference(&ds).unwrap();

        assert_eq!(split.len(), 2);
        assert_eq!(registrations.len(), 1);

        // ROI numbers across the split outputs equal the input set.
        let mut numbers: Vec<i64> = split
            .iter()
            .flat_map(|ds| {
                attr::items(ds, tags::STRUCTURE_SET_ROI_SEQUENCE, "StructureSetROISequence")
                    .unwrap()
                    .iter()
                    .map(|roi| attr::i64_value(roi, tags::ROI_NUMBER, "ROINumber").unwrap())
                    .collect::<Vec<_>>()
            })
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![1, 2, 3]);

        // Each output references exactly one frame of reference and has a
        // fresh SOP instance UID.
        for ds in &split {
            let referenced = attr::items(
                ds,
                tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE,
                "ReferencedFrameOfReferenceSequence",
            )
            .unwrap();
            assert_eq!(referenced.len(), 1);

            let uid = attr::string(ds, tags::SOP_INSTANCE_UID, "SOPInstanceUID").unwrap();
            assert_ne!(uid, "2.25.100");
        }

        // The registration carries a rigid identity matrix.
        let registration = &registrations[0];
        let sequence = attr::items(registration, tags::REGISTRATION_SEQUENCE, "RegistrationSequence")
            .unwrap();
        let matrix_registration = attr::items(
            &sequence[0],
            tags::MATRIX_REGISTRATION_SEQUENCE,
            "MatrixRegistrationSequence",
        )
        .unwrap();
        let matrix = attr::items(
            &matrix_registration[0],
            tags::MATRIX_SEQUENCE,
            "MatrixSequence",
        )
        .unwrap();
        let values = attr::multi_f64(
            &matrix[0],
            tags::FRAME_OF_REFERENCE_TRANSFORMATION_MATRIX,
            "FrameOfReferenceTransformationMatrix",
        )
        .unwrap();
        let identity: Vec<f64> = (0..16)
            .map(|i| if i % 5 == 0 { 1.0 } else { 0.0 })
            .collect();
        assert_eq!(values, identity);
    }

    #[test]
    fn single_for_passes_through_unchanged() {
        let mut ds = two_for_structure_set();
        put_sequence(
            &mut ds,
            tags::STRUCTURE_SET_ROI_SEQUENCE,
            vec![roi_entry(1, "PTV", "2.25.7001")],
        );

        let (split, registrations) = split_by_frame_of_reference(&ds).unwrap();
        assert_eq!(split.len(), 1);
        assert!(registrations.is_empty());
        assert_eq!(
            attr::string(&split[0], tags::SOP_INSTANCE_UID, "SOPInstanceUID").unwrap(),
            "2.25.100"
        );
    }

    #[test]
    fn red_names_are_parsed_case_insensitively() {
        let names = vec![
            "Couch RED = 0.6".to_string(),
            "Prosthesis red: 4.2".to_string(),
            "PTV".to_string(),
        ];

        let map = red_adjustment_map_from_structure_names(&names);
        assert_eq!(map.len(), 2);
        assert_eq!(map[0].1, 0.6);
        assert_eq!(map[1].1, 4.2);
    }

    #[test]
    fn rel_elec_density_is_appended_and_replaced() {
        let ds = two_for_structure_set();
        let adjusted = adjust_rel_elec_density(
            &ds,
            &[("Couch".to_string(), 0.6)],
            false,
        )
        .unwrap();

        let observations = attr::items(
            &adjusted,
            tags::RTROI_OBSERVATIONS_SEQUENCE,
            "RTROIObservationsSequence",
        )
        .unwrap();
        let properties = attr::items(
            &observations[2],
            tags::ROI_PHYSICAL_PROPERTIES_SEQUENCE,
            "ROIPhysicalPropertiesSequence",
        )
        .unwrap();
        assert_eq!(properties.len(), 1);
        assert_eq!(
            attr::f64_value(
                &properties[0],
                tags::ROI_PHYSICAL_PROPERTY_VALUE,
                "ROIPhysicalPropertyValue"
            )
            .unwrap(),
            0.6
        );

        // Adjusting again replaces rather than duplicates.
        let again = adjust_rel_elec_density(
            &adjusted,
            &[("Couch".to_string(), 1.1)],
            false,
        )
        .unwrap();
        let observations = attr::items(
            &again,
            tags::RTROI_OBSERVATIONS_SEQUENCE,
            "RTROIObservationsSequence",
        )
        .unwrap();
        let properties = attr::items(
            &observations[2],
            tags::ROI_PHYSICAL_PROPERTIES_SEQUENCE,
            "ROIPhysicalPropertiesSequence",
        )
        .unwrap();
        assert_eq!(properties.len(), 1);

        assert!(matches!(
            adjust_rel_elec_density(&ds, &[("Missing".to_string(), 1.0)], false),
            Err(InvalidGeometry::UnknownRoi { .. })
        ));

        adjust_rel_elec_density(&ds, &[("Missing".to_string(), 1.0)], true).unwrap();
    }
}
