//! RT Plan reading and writing helpers.
//!
//! The read side lifts fraction groups, referenced beams and per-beam
//! gantry angles out of a plan dataset; the write side emits a new plan by
//! deep-copying a template and replacing only the beam and fraction-group
//! subtrees.

use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use thiserror::Error;

use crate::attr::{self, AttrError};
use crate::controlpoints;
use crate::coords::{InvalidGeometry, Point, bipolar_to_iec, iec_to_bipolar};
use crate::delivery::Delivery;

#[derive(Debug, Error)]
pub enum InvalidPlan {
    #[error(
        "only plans whose beam limiting devices are exactly {{MLCX, ASYMY}} are supported; \
         this plan has {found:?}. The internal jaw handling assumes a single \
         Y jaw system, so other configurations cannot be read yet"
    )]
    UnsupportedCollimation { found: Vec<String> },

    #[error("expected exactly one beam limiting device of type {device_type}")]
    DeviceCountMismatch { device_type: String },

    #[error("expected the number of leaf jaw pairs to match the leaf position boundary differences")]
    LeafPairCountMismatch,

    #[error(
        "CumulativeMetersetWeight is not set within the RT plan. This may be \
         due to the plan being exported from a planning system without the \
         dose having been calculated"
    )]
    MissingMetersetWeight,

    #[error(
        "there is more than one fraction group in this plan, provide a \
         fraction group number to define which one to pull; numbers to \
         choose from are {available:?}"
    )]
    FractionGroupRequired { available: Vec<i64> },

    #[error("fraction group {number} was not found within this plan")]
    UnknownFractionGroup { number: i64 },

    #[error("beam number {number} referenced by the fraction group was not found")]
    UnknownBeamNumber { number: i64 },

    #[error(
        "a fraction group with metersets and gantry angles matching this \
         delivery was not found within the tolerances; define the fraction \
         group number manually"
    )]
    NoFractionGroupMatch,

    #[error(
        "more than one fraction group matched this delivery within the \
         tolerances; define the fraction group number manually"
    )]
    AmbiguousFractionGroupMatch,

    #[error("only a single gantry angle per beam is currently supported")]
    MultipleGantryAnglesPerBeam,

    #[error("duplicate gantry angles are not yet supported")]
    DuplicateGantryAngles,

    #[error(
        "not all control points were captured by the gantry tolerance of \
         {tolerance} deg; angles out of tolerance: {out_of_tolerance:?}"
    )]
    GantryAnglesNotCovered {
        tolerance: f64,
        out_of_tolerance: Vec<f64>,
    },

    #[error("{attribute} was not found on the initial control point")]
    MissingOnInitialControlPoint { attribute: &'static str },

    #[error("expected exactly one {device_type} entry per control point")]
    LeafJawPositionsMismatch { device_type: String },

    #[error("{keyword} was not found within the plan")]
    EntryMissing { keyword: &'static str },

    #[error("more than one disagreeing {keyword} found within the plan")]
    DisagreeingValues { keyword: &'static str },

    #[error("delivery sequences must have equal control point counts")]
    MismatchedLengths,

    #[error(transparent)]
    Attr(#[from] AttrError),

    #[error(transparent)]
    Geometry(#[from] InvalidGeometry),
}

/// Format a decimal string the way the planning systems emit them: whole
/// values keep one decimal place.
pub(crate) fn format_ds(value: f64) -> String {
    if value == value.trunc() {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

pub(crate) fn items_owned(
    obj: &InMemDicomObject,
    tag: Tag,
    keyword: &'static str,
) -> Result<Vec<InMemDicomObject>, AttrError> {
    Ok(attr::items(obj, tag, keyword)?.to_vec())
}

pub(crate) fn put_sequence(obj: &mut InMemDicomObject, tag: Tag, items: Vec<InMemDicomObject>) {
    obj.put(DataElement::new(tag, VR::SQ, DataSetSequence::from(items)));
}

pub(crate) fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: impl Into<String>) {
    let value = value.into();
    // In DICOM, `\` separates the individual values of a multi-valued
    // element. Store such a value as the multi-valued `Strs` representation
    // a parsed file would yield, so numeric accessors like
    // `to_multi_float64` split it instead of failing to parse the joined
    // string as one number. Serialised bytes are identical either way.
    let primitive = if value.contains('\\') {
        PrimitiveValue::Strs(value.split('\\').map(str::to_string).collect())
    } else {
        PrimitiveValue::from(value)
    };
    obj.put(DataElement::new(tag, vr, primitive));
}

pub fn fraction_group_numbers(plan: &InMemDicomObject) -> Result<Vec<i64>, InvalidPlan> {
    attr::items(plan, tags::FRACTION_GROUP_SEQUENCE, "FractionGroupSequence")?
        .iter()
        .map(|group| {
            Ok(attr::i64_value(
                group,
                tags::FRACTION_GROUP_NUMBER,
                "FractionGroupNumber",
            )?)
        })
        .collect()
}

fn fraction_group<'a>(
    plan: &'a InMemDicomObject,
    number: i64,
) -> Result<&'a InMemDicomObject, InvalidPlan> {
    let groups = attr::items(plan, tags::FRACTION_GROUP_SEQUENCE, "FractionGroupSequence")?;

    for group in groups {
        if attr::i64_value(group, tags::FRACTION_GROUP_NUMBER, "FractionGroupNumber")? == number {
            return Ok(group);
        }
    }

    Err(InvalidPlan::UnknownFractionGroup { number })
}

fn referenced_beams(
    plan: &InMemDicomObject,
    number: i64,
) -> Result<(Vec<i64>, Vec<&InMemDicomObject>), InvalidPlan> {
    let group = fraction_group(plan, number)?;
    let referenced = attr::items(group, tags::REFERENCED_BEAM_SEQUENCE, "ReferencedBeamSequence")?;

    let numbers = referenced
        .iter()
        .map(|item| {
            Ok(attr::i64_value(
                item,
                tags::REFERENCED_BEAM_NUMBER,
                "ReferencedBeamNumber",
            )?)
        })
        .collect::<Result<Vec<_>, InvalidPlan>>()?;

    Ok((numbers, referenced.iter().collect()))
}

/// The `BeamMeterset` of each beam referenced by a fraction group, in
/// referenced order.
pub fn fraction_group_metersets(
    plan: &InMemDicomObject,
    number: i64,
) -> Result<Vec<f64>, InvalidPlan> {
    let (_, referenced) = referenced_beams(plan, number)?;

    referenced
        .iter()
        .map(|item| Ok(attr::f64_value(item, tags::BEAM_METERSET, "BeamMeterset")?))
        .collect()
}

/// The beam datasets referenced by a fraction group, in referenced order,
/// paired with their metersets.
pub fn fraction_group_beams_and_metersets(
    plan: &InMemDicomObject,
    number: i64,
) -> Result<(Vec<&InMemDicomObject>, Vec<f64>), InvalidPlan> {
    let (beam_numbers, referenced) = referenced_beams(plan, number)?;

    let metersets = referenced
        .iter()
        .map(|item| Ok(attr::f64_value(item, tags::BEAM_METERSET, "BeamMeterset")?))
        .collect::<Result<Vec<_>, InvalidPlan>>()?;

    let beams = attr::items(plan, tags::BEAM_SEQUENCE, "BeamSequence")?;

    let ordered = beam_numbers
        .iter()
        .map(|&number| {
            beams
                .iter()
                .find(|beam| {
                    attr::i64_value(beam, tags::BEAM_NUMBER, "BeamNumber")
                        .is_ok_and(|found| found == number)
                })
                .ok_or(InvalidPlan::UnknownBeamNumber { number })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((ordered, metersets))
}

/// Collapse a plan down to a single fraction group and the beams it
/// references, in referenced order.
pub fn convert_to_one_fraction_group(
    plan: &InMemDicomObject,
    number: i64,
) -> Result<InMemDicomObject, InvalidPlan> {
    let group = fraction_group(plan, number)?.clone();
    let (beams, _) = fraction_group_beams_and_metersets(plan, number)?;
    let beams: Vec<InMemDicomObject> = beams.into_iter().cloned().collect();

    let mut collapsed = plan.clone();
    put_sequence(&mut collapsed, tags::FRACTION_GROUP_SEQUENCE, vec![group]);
    put_sequence(&mut collapsed, tags::BEAM_SEQUENCE, beams);

    Ok(collapsed)
}

/// Validate that a beam's limiting devices are exactly `{MLCX, ASYMY}`.
pub(crate) fn check_supported_collimation(
    limiting_devices: &[InMemDicomObject],
) -> Result<(), InvalidPlan> {
    let mut found: Vec<String> = limiting_devices
        .iter()
        .map(|device| {
            Ok(attr::string(
                device,
                tags::RT_BEAM_LIMITING_DEVICE_TYPE,
                "RTBeamLimitingDeviceType",
            )?)
        })
        .collect::<Result<_, InvalidPlan>>()?;
    found.sort();
    found.dedup();

    if found != ["ASYMY", "MLCX"] {
        return Err(InvalidPlan::UnsupportedCollimation { found });
    }

    Ok(())
}

pub(crate) fn single_device_of_type<'a>(
    limiting_devices: &'a [InMemDicomObject],
    device_type: &str,
) -> Result<&'a InMemDicomObject, InvalidPlan> {
    let matching: Vec<&InMemDicomObject> = limiting_devices
        .iter()
        .filter(|device| {
            attr::string(device, tags::RT_BEAM_LIMITING_DEVICE_TYPE, "RTBeamLimitingDeviceType")
                .is_ok_and(|found| found == device_type)
        })
        .collect();

    match matching.as_slice() {
        [single] => Ok(*single),
        _ => Err(InvalidPlan::DeviceCountMismatch {
            device_type: device_type.to_string(),
        }),
    }
}

/// The single bipolar gantry angle of each beam. A beam whose control
/// points sweep more than one gantry angle is rejected.
pub fn beam_gantry_angles(plan: &InMemDicomObject) -> Result<Vec<f64>, InvalidPlan> {
    let beams = attr::items(plan, tags::BEAM_SEQUENCE, "BeamSequence")?;

    beams
        .iter()
        .map(|beam| {
            let control_points =
                attr::items(beam, tags::CONTROL_POINT_SEQUENCE, "ControlPointSequence")?;
            let angles: Vec<f64> = controlpoints::f64_leaning_on_prior(
                control_points,
                tags::GANTRY_ANGLE,
                "GantryAngle",
            )?
            .into_iter()
            .map(iec_to_bipolar)
            .collect();

            let mut unique = angles.clone();
            unique.sort_by(|a, b| a.partial_cmp(b).expect("angles are finite"));
            unique.dedup();

            match unique.as_slice() {
                [single] => Ok(*single),
                _ => Err(InvalidPlan::MultipleGantryAnglesPerBeam),
            }
        })
        .collect()
}

/// The gantry masking tolerance appropriate for a set of template angles:
/// half the smallest angular separation less a guard band, capped at 3°.
pub fn gantry_tol_from_gantry_angles(gantry_angles: &[f64]) -> f64 {
    let mut sorted = gantry_angles.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("angles are finite"));

    let min_diff = sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold(f64::INFINITY, f64::min);

    (min_diff / 2.0 - 0.1).min(3.0)
}

pub fn require_gantries_be_zero(plan: &InMemDicomObject) -> Result<(), InvalidPlan> {
    let angles = beam_gantry_angles(plan)?;

    if angles.iter().any(|&angle| angle != 0.0) {
        return Err(InvalidGeometry::GantryNotZero.into());
    }

    Ok(())
}

fn single_multi_f64_from_control_points(
    plan: &InMemDicomObject,
    tag: Tag,
    keyword: &'static str,
) -> Result<Vec<f64>, InvalidPlan> {
    let mut found: Option<Vec<f64>> = None;

    for beam in attr::items(plan, tags::BEAM_SEQUENCE, "BeamSequence")? {
        for cp in attr::items(beam, tags::CONTROL_POINT_SEQUENCE, "ControlPointSequence")? {
            let Ok(value) = attr::multi_f64(cp, tag, keyword) else {
                continue;
            };

            match &found {
                Some(existing) if *existing != value => {
                    return Err(InvalidPlan::DisagreeingValues { keyword });
                }
                _ => found = Some(value),
            }
        }
    }

    found.ok_or(InvalidPlan::EntryMissing { keyword })
}

fn single_f64_from_beams(
    plan: &InMemDicomObject,
    tag: Tag,
    keyword: &'static str,
) -> Result<f64, InvalidPlan> {
    let mut found: Option<f64> = None;

    for beam in attr::items(plan, tags::BEAM_SEQUENCE, "BeamSequence")? {
        let Ok(value) = attr::f64_value(beam, tag, keyword) else {
            continue;
        };

        match found {
            Some(existing) if existing != value => {
                return Err(InvalidPlan::DisagreeingValues { keyword });
            }
            _ => found = Some(value),
        }
    }

    found.ok_or(InvalidPlan::EntryMissing { keyword })
}

/// The ray entry point on the patient surface, in the DICOM patient frame.
pub fn surface_entry_point(plan: &InMemDicomObject) -> Result<Point, InvalidPlan> {
    let raw =
        single_multi_f64_from_control_points(plan, tags::SURFACE_ENTRY_POINT, "SurfaceEntryPoint")?;

    Ok(Point::new(raw[0], raw[1], raw[2]))
}

/// [`surface_entry_point`] with an isocentre-based fallback: for gantry-0
/// plans the entry point is the isocentre shifted by `SSD - SAD` along +y.
pub fn surface_entry_point_with_fallback(plan: &InMemDicomObject) -> Result<Point, InvalidPlan> {
    match surface_entry_point(plan) {
        Ok(point) => return Ok(point),
        Err(InvalidPlan::EntryMissing { .. }) => {}
        Err(err) => return Err(err),
    }

    require_gantries_be_zero(plan)?;

    let iso = single_multi_f64_from_control_points(
        plan,
        tags::ISOCENTER_POSITION,
        "IsocenterPosition",
    )?;
    let ssd = single_f64_from_control_points_scalar(plan)?;
    let sad = single_f64_from_beams(plan, tags::SOURCE_AXIS_DISTANCE, "SourceAxisDistance")?;

    Ok(Point::new(iso[0], iso[1] + ssd - sad, iso[2]))
}

fn single_f64_from_control_points_scalar(plan: &InMemDicomObject) -> Result<f64, InvalidPlan> {
    let values = single_multi_f64_from_control_points(
        plan,
        tags::SOURCE_TO_SURFACE_DISTANCE,
        "SourceToSurfaceDistance",
    )?;

    Ok(values[0])
}

/// The delivery data of one beam converted into DICOM textual layout.
pub(crate) struct DicomBeamData {
    pub monitor_units: Vec<f64>,
    pub mlc: Vec<Vec<String>>,
    pub jaw: Vec<[String; 2]>,
    pub gantry_angle: Vec<String>,
    pub gantry_movement: Vec<&'static str>,
    pub collimator_angle: Vec<String>,
    pub collimator_movement: Vec<&'static str>,
}

fn angles_to_dicom(angles: &[f64]) -> (Vec<String>, Vec<&'static str>) {
    let movement: Vec<&'static str> = angles
        .windows(2)
        .map(|w| {
            if w[1] - w[0] > 0.0 {
                "CW"
            } else if w[1] - w[0] < 0.0 {
                "CC"
            } else {
                "NONE"
            }
        })
        .chain(std::iter::once("NONE"))
        .collect();

    let converted = angles
        .iter()
        .map(|&angle| format_ds(bipolar_to_iec(angle)))
        .collect();

    (converted, movement)
}

/// Convert a delivery back into the DICOM flat layouts: MLC banks are
/// unstacked and re-reversed, jaw blades are swapped back and the second
/// blade negated, angles return to the IEC range.
pub(crate) fn coordinate_convert(delivery: &Delivery) -> DicomBeamData {
    let n = delivery.len();
    let leaves = delivery.leaf_pair_count();
    let mlc = delivery.mlc();
    let jaw = delivery.jaw();

    let mlc_strings: Vec<Vec<String>> = (0..n)
        .map(|i| {
            let mut row = Vec::with_capacity(2 * leaves);
            for l in (0..leaves).rev() {
                row.push(format_ds(-mlc[[i, l, 1]]));
            }
            for l in (0..leaves).rev() {
                row.push(format_ds(mlc[[i, l, 0]]));
            }
            row
        })
        .collect();

    let jaw_strings: Vec<[String; 2]> = (0..n)
        .map(|i| [format_ds(-jaw[[i, 1]]), format_ds(jaw[[i, 0]])])
        .collect();

    let (gantry_angle, gantry_movement) = angles_to_dicom(delivery.gantry());
    let (collimator_angle, collimator_movement) = angles_to_dicom(delivery.collimator());

    DicomBeamData {
        monitor_units: delivery.monitor_units().to_vec(),
        mlc: mlc_strings,
        jaw: jaw_strings,
        gantry_angle,
        gantry_movement,
        collimator_angle,
        collimator_movement,
    }
}

fn set_leaf_jaw_positions(
    control_point: &mut InMemDicomObject,
    jaw: &[String],
    mlc: &[String],
) -> Result<(), InvalidPlan> {
    let mut items = items_owned(
        control_point,
        tags::BEAM_LIMITING_DEVICE_POSITION_SEQUENCE,
        "BeamLimitingDevicePositionSequence",
    )?;

    for item in &mut items {
        let device_type = attr::string(
            item,
            tags::RT_BEAM_LIMITING_DEVICE_TYPE,
            "RTBeamLimitingDeviceType",
        )?;

        let positions = match device_type.as_str() {
            "ASYMY" => jaw.join("\\"),
            "MLCX" => mlc.join("\\"),
            other => {
                return Err(InvalidPlan::LeafJawPositionsMismatch {
                    device_type: other.to_string(),
                });
            }
        };

        put_str(item, tags::LEAF_JAW_POSITIONS, VR::DS, positions);
    }

    put_sequence(
        control_point,
        tags::BEAM_LIMITING_DEVICE_POSITION_SEQUENCE,
        items,
    );

    Ok(())
}

/// Build the full control point sequence for one beam from templates for
/// the initial and subsequent control points.
pub(crate) fn build_control_points(
    initial_template: &InMemDicomObject,
    subsequent_template: &InMemDicomObject,
    data: &DicomBeamData,
) -> Result<Vec<InMemDicomObject>, InvalidPlan> {
    let final_mu = data.monitor_units.last().copied().unwrap_or(0.0);

    let mut initial = initial_template.clone();
    put_str(&mut initial, tags::GANTRY_ANGLE, VR::DS, data.gantry_angle[0].clone());
    put_str(
        &mut initial,
        tags::GANTRY_ROTATION_DIRECTION,
        VR::CS,
        data.gantry_movement[0],
    );
    put_str(
        &mut initial,
        tags::BEAM_LIMITING_DEVICE_ANGLE,
        VR::DS,
        data.collimator_angle[0].clone(),
    );
    put_str(
        &mut initial,
        tags::BEAM_LIMITING_DEVICE_ROTATION_DIRECTION,
        VR::CS,
        data.collimator_movement[0],
    );
    set_leaf_jaw_positions(&mut initial, &data.jaw[0], &data.mlc[0])?;

    let mut all_control_points = vec![initial];

    for i in 1..data.monitor_units.len() {
        let mut cp = subsequent_template.clone();
        put_str(&mut cp, tags::CONTROL_POINT_INDEX, VR::IS, i.to_string());
        put_str(&mut cp, tags::GANTRY_ANGLE, VR::DS, data.gantry_angle[i].clone());
        put_str(
            &mut cp,
            tags::GANTRY_ROTATION_DIRECTION,
            VR::CS,
            data.gantry_movement[i],
        );
        put_str(
            &mut cp,
            tags::BEAM_LIMITING_DEVICE_ANGLE,
            VR::DS,
            data.collimator_angle[i].clone(),
        );
        put_str(
            &mut cp,
            tags::BEAM_LIMITING_DEVICE_ROTATION_DIRECTION,
            VR::CS,
            data.collimator_movement[i],
        );
        set_leaf_jaw_positions(&mut cp, &data.jaw[i], &data.mlc[i])?;

        let weight = if final_mu == 0.0 {
            0.0
        } else {
            round_weight(data.monitor_units[i] / final_mu)
        };
        put_str(
            &mut cp,
            tags::CUMULATIVE_METERSET_WEIGHT,
            VR::DS,
            format_ds(weight),
        );

        all_control_points.push(cp);
    }

    Ok(all_control_points)
}

fn round_weight(weight: f64) -> f64 {
    (weight * 1e6).round() / 1e6
}

/// Replace the fraction group's referenced beam subtree with the single
/// beam being written and its final cumulative meterset.
pub(crate) fn replace_fraction_group(
    plan: &mut InMemDicomObject,
    beam_meterset: &str,
    beam_index: usize,
) -> Result<(), InvalidPlan> {
    let mut groups = items_owned(plan, tags::FRACTION_GROUP_SEQUENCE, "FractionGroupSequence")?;
    let group = groups.first_mut().ok_or(InvalidPlan::MismatchedLengths)?;

    let referenced = items_owned(group, tags::REFERENCED_BEAM_SEQUENCE, "ReferencedBeamSequence")?;
    let mut referenced_beam = referenced
        .get(beam_index)
        .ok_or(InvalidPlan::MismatchedLengths)?
        .clone();
    put_str(&mut referenced_beam, tags::BEAM_METERSET, VR::DS, beam_meterset);

    put_sequence(group, tags::REFERENCED_BEAM_SEQUENCE, vec![referenced_beam]);
    let group = group.clone();
    put_sequence(plan, tags::FRACTION_GROUP_SEQUENCE, vec![group]);

    Ok(())
}

/// Replace the beam subtree with the rebuilt control point sequence.
pub(crate) fn replace_beam_sequence(
    plan: &mut InMemDicomObject,
    all_control_points: Vec<InMemDicomObject>,
    beam_index: usize,
) -> Result<(), InvalidPlan> {
    let beams = items_owned(plan, tags::BEAM_SEQUENCE, "BeamSequence")?;
    let mut beam = beams
        .get(beam_index)
        .ok_or(InvalidPlan::MismatchedLengths)?
        .clone();

    put_str(
        &mut beam,
        tags::NUMBER_OF_CONTROL_POINTS,
        VR::IS,
        all_control_points.len().to_string(),
    );
    put_sequence(&mut beam, tags::CONTROL_POINT_SEQUENCE, all_control_points);
    put_sequence(plan, tags::BEAM_SEQUENCE, vec![beam]);

    Ok(())
}

/// Merge single-beam plans back into one plan carrying every beam and a
/// referenced-beam entry per beam.
pub(crate) fn merge_beam_sequences(
    plans: Vec<InMemDicomObject>,
) -> Result<InMemDicomObject, InvalidPlan> {
    let mut plans = plans.into_iter();
    let mut merged = plans.next().ok_or(InvalidPlan::MismatchedLengths)?;

    let mut beams = items_owned(&merged, tags::BEAM_SEQUENCE, "BeamSequence")?;
    let mut groups = items_owned(&merged, tags::FRACTION_GROUP_SEQUENCE, "FractionGroupSequence")?;
    let group = groups.first_mut().ok_or(InvalidPlan::MismatchedLengths)?;
    let mut referenced = items_owned(
        group,
        tags::REFERENCED_BEAM_SEQUENCE,
        "ReferencedBeamSequence",
    )?;

    for plan in plans {
        beams.extend(items_owned(&plan, tags::BEAM_SEQUENCE, "BeamSequence")?);
        let other_groups = items_owned(&plan, tags::FRACTION_GROUP_SEQUENCE, "FractionGroupSequence")?;
        referenced.extend(items_owned(
            &other_groups[0],
            tags::REFERENCED_BEAM_SEQUENCE,
            "ReferencedBeamSequence",
        )?);
    }

    put_sequence(group, tags::REFERENCED_BEAM_SEQUENCE, referenced);
    put_sequence(&mut merged, tags::FRACTION_GROUP_SEQUENCE, groups);
    put_sequence(&mut merged, tags::BEAM_SEQUENCE, beams);

    Ok(merged)
}

/// Rewrite every `CumulativeMetersetWeight` with the same number of
/// decimal places as the beam's `FinalCumulativeMetersetWeight` string, so
/// parsers relying on the text representation see a stable format.
pub(crate) fn restore_trailing_zeros(plan: &mut InMemDicomObject) -> Result<(), InvalidPlan> {
    let mut beams = items_owned(plan, tags::BEAM_SEQUENCE, "BeamSequence")?;

    for beam in &mut beams {
        let Ok(final_weight) = attr::string(
            beam,
            tags::FINAL_CUMULATIVE_METERSET_WEIGHT,
            "FinalCumulativeMetersetWeight",
        ) else {
            continue;
        };

        let decimals = final_weight
            .split_once('.')
            .map(|(_, fraction)| fraction.len())
            .unwrap_or(0);

        let mut control_points =
            items_owned(beam, tags::CONTROL_POINT_SEQUENCE, "ControlPointSequence")?;

        for cp in &mut control_points {
            let Ok(weight) = attr::f64_value(cp, tags::CUMULATIVE_METERSET_WEIGHT, "CumulativeMetersetWeight")
            else {
                continue;
            };

            put_str(
                cp,
                tags::CUMULATIVE_METERSET_WEIGHT,
                VR::DS,
                format!("{weight:.decimals$}"),
            );
        }

        put_sequence(beam, tags::CONTROL_POINT_SEQUENCE, control_points);
    }

    put_sequence(plan, tags::BEAM_SEQUENCE, beams);

    Ok(())
}

/// Set `TreatmentMachineName` on every beam of a plan.
pub fn adjust_machine_name(
    plan: &InMemDicomObject,
    new_machine_name: &str,
) -> Result<InMemDicomObject, InvalidPlan> {
    let mut adjusted = plan.clone();
    let mut beams = items_owned(&adjusted, tags::BEAM_SEQUENCE, "BeamSequence")?;

    for beam in &mut beams {
        put_str(beam, tags::TREATMENT_MACHINE_NAME, VR::SH, new_machine_name);
    }

    put_sequence(&mut adjusted, tags::BEAM_SEQUENCE, beams);

    Ok(adjusted)
}
