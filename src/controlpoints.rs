//! Control-point canonicalisation.
//!
//! DICOM RT control points omit attributes that have not changed since the
//! previous control point. Numeric code in this crate never inspects raw
//! optional fields; it goes through this canonicalising pass first, which
//! produces one dense value per control point by inheriting from the most
//! recent control point that carried the attribute.

use dicom::core::Tag;
use dicom::object::InMemDicomObject;
use dicom::object::mem::InMemElement;
use dicom_dictionary_std::tags;

use crate::attr::AttrError;
use crate::rtplan::InvalidPlan;

/// Return one element per control point for `tag`, inheriting from the
/// immediately preceding control point wherever the attribute is absent.
///
/// Fails when the attribute is missing on the initial control point, since
/// there is nothing to lean on.
pub fn attribute_leaning_on_prior<'a>(
    control_points: &'a [InMemDicomObject],
    tag: Tag,
    keyword: &'static str,
) -> Result<Vec<&'a InMemElement>, InvalidPlan> {
    let mut current: Option<&InMemElement> = None;
    let mut results = Vec::with_capacity(control_points.len());

    for control_point in control_points {
        if let Ok(elem) = control_point.element(tag) {
            current = Some(elem);
        }

        match current {
            Some(elem) => results.push(elem),
            None => {
                return Err(InvalidPlan::MissingOnInitialControlPoint { attribute: keyword });
            }
        }
    }

    Ok(results)
}

/// Dense per-control-point decimal attribute (gantry angle, collimator
/// angle, SSD and friends).
pub fn f64_leaning_on_prior(
    control_points: &[InMemDicomObject],
    tag: Tag,
    keyword: &'static str,
) -> Result<Vec<f64>, InvalidPlan> {
    attribute_leaning_on_prior(control_points, tag, keyword)?
        .into_iter()
        .map(|elem| {
            elem.to_float64().map_err(|_| {
                InvalidPlan::from(AttrError::Malformed {
                    keyword,
                    expected: "a decimal value",
                })
            })
        })
        .collect()
}

/// Dense per-control-point sequence attribute; used for
/// `BeamLimitingDevicePositionSequence`.
pub fn items_leaning_on_prior<'a>(
    control_points: &'a [InMemDicomObject],
    tag: Tag,
    keyword: &'static str,
) -> Result<Vec<&'a [InMemDicomObject]>, InvalidPlan> {
    attribute_leaning_on_prior(control_points, tag, keyword)?
        .into_iter()
        .map(|elem| {
            elem.items().ok_or(InvalidPlan::from(AttrError::Malformed {
                keyword,
                expected: "a sequence",
            }))
        })
        .collect()
}

/// Extract the `LeafJawPositions` of the named beam-limiting device type
/// ("MLCX", "ASYMY", ...) from each control point's canonicalised position
/// sequence. Exactly one matching item per control point is required.
pub fn leaf_jaw_positions_for_type(
    position_sequences: &[&[InMemDicomObject]],
    device_type: &str,
) -> Result<Vec<Vec<f64>>, InvalidPlan> {
    let mut positions = Vec::with_capacity(position_sequences.len());

    for sequence in position_sequences {
        let matching: Vec<&InMemDicomObject> = sequence
            .iter()
            .filter(|item| {
                item.element(tags::RT_BEAM_LIMITING_DEVICE_TYPE)
                    .ok()
                    .and_then(|elem| elem.to_str().ok())
                    .is_some_and(|value| value.trim() == device_type)
            })
            .collect();

        if matching.len() != 1 {
            return Err(InvalidPlan::LeafJawPositionsMismatch {
                device_type: device_type.to_string(),
            });
        }

        positions.push(
            matching[0]
                .element(tags::LEAF_JAW_POSITIONS)
                .map_err(|_| AttrError::Missing {
                    keyword: "LeafJawPositions",
                })?
                .to_multi_float64()
                .map_err(|_| AttrError::Malformed {
                    keyword: "LeafJawPositions",
                    expected: "decimal values",
                })?,
        );
    }

    Ok(positions)
}
