//! The machine-agnostic delivery record.
//!
//! A [`Delivery`] holds one or many beams as parallel sequences indexed by
//! control point: cumulative monitor units, gantry and collimator angles in
//! the bipolar convention, MLC leaf positions as an `(n, L, 2)` tensor and
//! the two opposing jaw blades as an `(n, 2)` array. All positions are in
//! mm at the isocentre plane with both banks positive outward from the
//! centre; leaves are ordered from low y to high y.

use std::collections::BTreeMap;
use std::path::Path;

use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, Axis, concatenate};

use crate::attr;
use crate::controlpoints;
use crate::coords::iec_to_bipolar;
use crate::metersetmap::{InvalidConfiguration, MetersetMap, MetersetMapConfig};
use crate::rtplan::{self, InvalidPlan};
use crate::trajectory_log::{self, InvalidLogEncoding};

const MU_ROUND_DECIMALS: i32 = 7;

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone)]
pub struct Delivery {
    monitor_units: Vec<f64>,
    gantry: Vec<f64>,
    collimator: Vec<f64>,
    mlc: Array3<f64>,
    jaw: Array2<f64>,
}

impl Delivery {
    pub fn new(
        monitor_units: Vec<f64>,
        gantry: Vec<f64>,
        collimator: Vec<f64>,
        mlc: Array3<f64>,
        jaw: Array2<f64>,
    ) -> Result<Self, InvalidPlan> {
        let n = monitor_units.len();
        if gantry.len() != n
            || collimator.len() != n
            || mlc.shape()[0] != n
            || mlc.shape()[2] != 2
            || jaw.dim() != (n, 2)
        {
            return Err(InvalidPlan::MismatchedLengths);
        }

        Ok(Delivery {
            monitor_units,
            gantry,
            collimator,
            mlc,
            jaw,
        })
    }

    pub fn monitor_units(&self) -> &[f64] {
        &self.monitor_units
    }

    /// Shorthand for [`Delivery::monitor_units`].
    pub fn mu(&self) -> &[f64] {
        &self.monitor_units
    }

    pub fn gantry(&self) -> &[f64] {
        &self.gantry
    }

    pub fn collimator(&self) -> &[f64] {
        &self.collimator
    }

    pub fn mlc(&self) -> &Array3<f64> {
        &self.mlc
    }

    pub fn jaw(&self) -> &Array2<f64> {
        &self.jaw
    }

    /// Number of control points.
    pub fn len(&self) -> usize {
        self.monitor_units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitor_units.is_empty()
    }

    pub fn leaf_pair_count(&self) -> usize {
        self.mlc.shape()[1]
    }

    /// Concatenate several deliveries (one per beam) into a single record.
    ///
    /// Monitor units are rebased so the merged sequence stays cumulative:
    /// negative steps across beam boundaries are clamped to zero.
    pub fn combine(parts: &[Delivery]) -> Result<Delivery, InvalidPlan> {
        let first = parts.first().ok_or(InvalidPlan::MismatchedLengths)?;

        if parts
            .iter()
            .any(|p| p.leaf_pair_count() != first.leaf_pair_count())
        {
            return Err(InvalidPlan::MismatchedLengths);
        }

        let monitor_units: Vec<f64> = parts
            .iter()
            .flat_map(|p| p.monitor_units.iter().copied())
            .collect();
        let gantry: Vec<f64> = parts.iter().flat_map(|p| p.gantry.iter().copied()).collect();
        let collimator: Vec<f64> = parts
            .iter()
            .flat_map(|p| p.collimator.iter().copied())
            .collect();

        let mlc_views: Vec<_> = parts.iter().map(|p| p.mlc.view()).collect();
        let jaw_views: Vec<_> = parts.iter().map(|p| p.jaw.view()).collect();
        let mlc = concatenate(Axis(0), &mlc_views).map_err(|_| InvalidPlan::MismatchedLengths)?;
        let jaw = concatenate(Axis(0), &jaw_views).map_err(|_| InvalidPlan::MismatchedLengths)?;

        let mut cumulative = Vec::with_capacity(monitor_units.len());
        let mut total = 0.0;
        for (i, mu) in monitor_units.iter().enumerate() {
            if i > 0 {
                let step = mu - monitor_units[i - 1];
                total += step.max(0.0);
            }
            cumulative.push(total);
        }

        Delivery::new(cumulative, gantry, collimator, mlc, jaw)
    }

    /// Remove control points that neither deliver dose themselves nor
    /// border a delivering pair.
    ///
    /// A control point is irrelevant when the monitor units do not change
    /// on either side of it; the first and last control points are dropped
    /// when their adjacent step is zero.
    pub fn filtered(&self) -> Delivery {
        if self.len() < 2 {
            return self.clone();
        }

        let no_change: Vec<bool> = self
            .monitor_units
            .windows(2)
            .map(|w| w[1] - w[0] == 0.0)
            .collect();

        let mut keep = Vec::with_capacity(self.len());
        keep.push(!no_change[0]);
        for i in 1..self.len() - 1 {
            keep.push(!(no_change[i - 1] && no_change[i]));
        }
        keep.push(!no_change[no_change.len() - 1]);

        self.apply_mask_unrebased(&keep)
    }

    fn apply_mask_unrebased(&self, mask: &[bool]) -> Delivery {
        let indices: Vec<usize> = (0..self.len()).filter(|&i| mask[i]).collect();
        let monitor_units = indices.iter().map(|&i| self.monitor_units[i]).collect();
        let gantry = indices.iter().map(|&i| self.gantry[i]).collect();
        let collimator = indices.iter().map(|&i| self.collimator[i]).collect();
        let mlc = self.mlc.select(Axis(0), &indices);
        let jaw = self.jaw.select(Axis(0), &indices);

        Delivery {
            monitor_units,
            gantry,
            collimator,
            mlc,
            jaw,
        }
    }

    /// Like [`Delivery::apply_mask_unrebased`] but with the monitor units
    /// rebased to start at zero, rounded to 7 decimal places.
    fn apply_mask(&self, mask: &[bool]) -> Delivery {
        let mut masked = self.apply_mask_unrebased(mask);

        if let Some(&first) = masked.monitor_units.first() {
            for mu in &mut masked.monitor_units {
                *mu = round_to(*mu - first, MU_ROUND_DECIMALS);
            }
        }

        masked
    }

    fn gantry_angle_mask(
        &self,
        gantry_angle: f64,
        gantry_tolerance: f64,
    ) -> Result<Vec<bool>, InvalidPlan> {
        let mask: Vec<bool> = self
            .gantry
            .iter()
            .map(|&angle| (angle - gantry_angle).abs() <= gantry_tolerance)
            .collect();

        let hits: Vec<usize> = (0..mask.len()).filter(|&i| mask[i]).collect();
        if hits.windows(2).any(|w| w[1] - w[0] != 1) {
            // Two separate runs near the same angle would mean two beams
            // sharing a gantry angle, which cannot be told apart here.
            return Err(InvalidPlan::DuplicateGantryAngles);
        }

        Ok(mask)
    }

    /// Split the delivery into one record per template gantry angle.
    pub(crate) fn mask_by_gantry(
        &self,
        gantry_angles: &[f64],
        gantry_tolerance: f64,
        allow_missing_angles: bool,
    ) -> Result<Vec<Delivery>, InvalidPlan> {
        let masks: Vec<Vec<bool>> = gantry_angles
            .iter()
            .map(|&angle| self.gantry_angle_mask(angle, gantry_tolerance))
            .collect::<Result<_, _>>()?;

        if !allow_missing_angles {
            let coverage: Vec<usize> = (0..self.len())
                .map(|i| masks.iter().filter(|mask| mask[i]).count())
                .collect();

            if coverage.iter().any(|&count| count != 1) {
                let mut out_of_tolerance: Vec<f64> = (0..self.len())
                    .filter(|&i| coverage[i] == 0)
                    .map(|i| self.gantry[i])
                    .collect();
                out_of_tolerance.dedup();

                return Err(InvalidPlan::GantryAnglesNotCovered {
                    tolerance: gantry_tolerance,
                    out_of_tolerance,
                });
            }
        }

        Ok(masks.iter().map(|mask| self.apply_mask(mask)).collect())
    }

    /// The final cumulative monitor units delivered near each of the given
    /// gantry angles. Angles with no matching control points are skipped.
    pub fn metersets(
        &self,
        gantry_angles: &[f64],
        gantry_tolerance: f64,
    ) -> Result<Vec<f64>, InvalidPlan> {
        let masked = self.mask_by_gantry(gantry_angles, gantry_tolerance, true)?;

        Ok(masked
            .iter()
            .filter_map(|delivery| delivery.monitor_units.last().copied())
            .collect())
    }

    /// Compute the fluence map delivered by this record. See
    /// [`crate::metersetmap::calc_metersetmap`].
    pub fn metersetmap(
        &self,
        config: &MetersetMapConfig,
    ) -> Result<MetersetMap, InvalidConfiguration> {
        crate::metersetmap::calc_metersetmap(
            &self.monitor_units,
            self.mlc.view(),
            self.jaw.view(),
            config,
        )
    }

    /// Build a delivery record from an RT Plan dataset.
    ///
    /// `fraction_group_number` is only required when the plan carries more
    /// than one fraction group; the error lists the valid numbers. Use
    /// [`Delivery::all_fraction_groups`] to read every group at once.
    pub fn from_dicom(
        plan: &InMemDicomObject,
        fraction_group_number: Option<i64>,
    ) -> Result<Delivery, InvalidPlan> {
        let number = match fraction_group_number {
            Some(number) => number,
            None => {
                let numbers = rtplan::fraction_group_numbers(plan)?;
                match numbers.as_slice() {
                    [single] => *single,
                    _ => return Err(InvalidPlan::FractionGroupRequired { available: numbers }),
                }
            }
        };

        let (beams, metersets) = rtplan::fraction_group_beams_and_metersets(plan, number)?;

        let per_beam: Vec<Delivery> = beams
            .iter()
            .zip(&metersets)
            .map(|(beam, &meterset)| Delivery::from_dicom_beam(beam, meterset))
            .collect::<Result<_, _>>()?;

        Delivery::combine(&per_beam)
    }

    /// Read every fraction group of a plan, keyed by fraction group number.
    pub fn all_fraction_groups(
        plan: &InMemDicomObject,
    ) -> Result<BTreeMap<i64, Delivery>, InvalidPlan> {
        rtplan::fraction_group_numbers(plan)?
            .into_iter()
            .map(|number| Ok((number, Delivery::from_dicom(plan, Some(number))?)))
            .collect()
    }

    fn from_dicom_beam(beam: &InMemDicomObject, meterset: f64) -> Result<Delivery, InvalidPlan> {
        let limiting_devices = attr::items(
            beam,
            tags::BEAM_LIMITING_DEVICE_SEQUENCE,
            "BeamLimitingDeviceSequence",
        )?;
        rtplan::check_supported_collimation(limiting_devices)?;

        let mlc_device = rtplan::single_device_of_type(limiting_devices, "MLCX")?;
        let boundaries = attr::multi_f64(
            mlc_device,
            tags::LEAF_POSITION_BOUNDARIES,
            "LeafPositionBoundaries",
        )?;
        let leaf_widths: Vec<f64> = boundaries.windows(2).map(|w| w[1] - w[0]).collect();
        let stated_pairs = attr::i64_value(
            mlc_device,
            tags::NUMBER_OF_LEAF_JAW_PAIRS,
            "NumberOfLeafJawPairs",
        )?;

        if stated_pairs as usize != leaf_widths.len() {
            return Err(InvalidPlan::LeafPairCountMismatch);
        }

        let num_leaves = leaf_widths.len();

        let control_points =
            attr::items(beam, tags::CONTROL_POINT_SEQUENCE, "ControlPointSequence")?;

        let position_sequences = controlpoints::items_leaning_on_prior(
            control_points,
            tags::BEAM_LIMITING_DEVICE_POSITION_SEQUENCE,
            "BeamLimitingDevicePositionSequence",
        )?;

        let dicom_mlcs = controlpoints::leaf_jaw_positions_for_type(&position_sequences, "MLCX")?;

        let mut mlc = Array3::zeros((control_points.len(), num_leaves, 2));
        for (i, raw) in dicom_mlcs.iter().enumerate() {
            if raw.len() != 2 * num_leaves {
                return Err(InvalidPlan::LeafPairCountMismatch);
            }

            // Bank A is the first half reversed and negated, bank B the
            // second half reversed; both banks end up positive outward
            // from the centre, leaves ordered low y to high y.
            for l in 0..num_leaves {
                mlc[[i, l, 0]] = raw[num_leaves + (num_leaves - 1 - l)];
                mlc[[i, l, 1]] = -raw[num_leaves - 1 - l];
            }
        }

        let dicom_jaw = controlpoints::leaf_jaw_positions_for_type(&position_sequences, "ASYMY")?;

        let mut jaw = Array2::zeros((control_points.len(), 2));
        for (i, raw) in dicom_jaw.iter().enumerate() {
            if raw.len() != 2 {
                return Err(InvalidPlan::LeafPairCountMismatch);
            }

            // The blades are swapped and the second negated, giving the
            // same outward-positive convention as the MLC.
            jaw[[i, 0]] = raw[1];
            jaw[[i, 1]] = -raw[0];
        }

        let final_weight = attr::f64_value(
            beam,
            tags::FINAL_CUMULATIVE_METERSET_WEIGHT,
            "FinalCumulativeMetersetWeight",
        )?;

        let monitor_units: Vec<f64> = control_points
            .iter()
            .map(|cp| {
                let weight = attr::f64_value(
                    cp,
                    tags::CUMULATIVE_METERSET_WEIGHT,
                    "CumulativeMetersetWeight",
                )
                .map_err(|_| InvalidPlan::MissingMetersetWeight)?;

                Ok(meterset * weight / final_weight)
            })
            .collect::<Result<_, InvalidPlan>>()?;

        let gantry: Vec<f64> =
            controlpoints::f64_leaning_on_prior(control_points, tags::GANTRY_ANGLE, "GantryAngle")?
                .into_iter()
                .map(iec_to_bipolar)
                .collect();

        let collimator: Vec<f64> = controlpoints::f64_leaning_on_prior(
            control_points,
            tags::BEAM_LIMITING_DEVICE_ANGLE,
            "BeamLimitingDeviceAngle",
        )?
        .into_iter()
        .map(iec_to_bipolar)
        .collect();

        Delivery::new(monitor_units, gantry, collimator, mlc, jaw)
    }

    /// Write this delivery into a copy of an RT Plan template.
    ///
    /// When `fraction_group_number` is absent it is determined by matching
    /// gantry angles within 3° and per-beam metersets within 0.5 MU; an
    /// ambiguous or failed match is fatal.
    pub fn to_dicom(
        &self,
        template: &InMemDicomObject,
        fraction_group_number: Option<i64>,
    ) -> Result<InMemDicomObject, InvalidPlan> {
        let filtered = self.filtered();

        let number = match fraction_group_number {
            Some(number) => number,
            None => filtered.fraction_group_number(template)?,
        };

        let single_group_template = rtplan::convert_to_one_fraction_group(template, number)?;
        let template_gantry_angles = rtplan::beam_gantry_angles(&single_group_template)?;
        let gantry_tolerance = rtplan::gantry_tol_from_gantry_angles(&template_gantry_angles);

        let masked = filtered.mask_by_gantry(&template_gantry_angles, gantry_tolerance, false)?;

        let single_beam_plans: Vec<InMemDicomObject> = masked
            .iter()
            .enumerate()
            .map(|(beam_index, delivery)| {
                delivery.to_dicom_beam(&single_group_template, beam_index)
            })
            .collect::<Result<_, _>>()?;

        rtplan::merge_beam_sequences(single_beam_plans)
    }

    fn to_dicom_beam(
        &self,
        template: &InMemDicomObject,
        beam_index: usize,
    ) -> Result<InMemDicomObject, InvalidPlan> {
        let mut created = template.clone();
        let data = rtplan::coordinate_convert(self);

        let (initial_template, subsequent_template) = {
            let beams = attr::items(&created, tags::BEAM_SEQUENCE, "BeamSequence")?;
            let beam = beams
                .get(beam_index)
                .ok_or(InvalidPlan::MismatchedLengths)?;
            let control_points =
                attr::items(beam, tags::CONTROL_POINT_SEQUENCE, "ControlPointSequence")?;
            (
                control_points
                    .first()
                    .ok_or(InvalidPlan::MismatchedLengths)?
                    .clone(),
                control_points
                    .last()
                    .ok_or(InvalidPlan::MismatchedLengths)?
                    .clone(),
            )
        };

        let all_control_points =
            rtplan::build_control_points(&initial_template, &subsequent_template, &data)?;

        let beam_meterset = format!("{:.6}", data.monitor_units.last().copied().unwrap_or(0.0));
        rtplan::replace_fraction_group(&mut created, &beam_meterset, beam_index)?;
        rtplan::replace_beam_sequence(&mut created, all_control_points, beam_index)?;
        rtplan::restore_trailing_zeros(&mut created)?;

        Ok(created)
    }

    fn matches_fraction_group(
        &self,
        template: &InMemDicomObject,
        fraction_group_number: i64,
        gantry_tolerance: f64,
        meterset_tolerance: f64,
    ) -> Result<bool, InvalidPlan> {
        let dicom_metersets = rtplan::fraction_group_metersets(template, fraction_group_number)?;
        let single_group = rtplan::convert_to_one_fraction_group(template, fraction_group_number)?;
        let gantry_angles = rtplan::beam_gantry_angles(&single_group)?;

        let delivery_metersets = match self.metersets(&gantry_angles, gantry_tolerance) {
            Ok(metersets) => metersets,
            Err(InvalidPlan::DuplicateGantryAngles) => return Ok(false),
            Err(err) => return Err(err),
        };

        if dicom_metersets.len() != delivery_metersets.len() || dicom_metersets.is_empty() {
            return Ok(false);
        }

        let max_diff = dicom_metersets
            .iter()
            .zip(&delivery_metersets)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f64, f64::max);

        Ok(max_diff <= meterset_tolerance)
    }

    fn fraction_group_number(&self, template: &InMemDicomObject) -> Result<i64, InvalidPlan> {
        let numbers = rtplan::fraction_group_numbers(template)?;

        if let [single] = numbers.as_slice() {
            return Ok(*single);
        }

        let matches: Vec<i64> = numbers
            .iter()
            .copied()
            .filter_map(
                |number| match self.matches_fraction_group(template, number, 3.0, 0.5) {
                    Ok(true) => Some(Ok(number)),
                    Ok(false) => None,
                    Err(err) => Some(Err(err)),
                },
            )
            .collect::<Result<_, _>>()?;

        match matches.as_slice() {
            [] => Err(InvalidPlan::NoFractionGroupMatch),
            [single] => Ok(*single),
            _ => Err(InvalidPlan::AmbiguousFractionGroupMatch),
        }
    }

    /// Decode a binary trajectory log and project it into a delivery
    /// record.
    pub fn from_trajectory_log(contents: &[u8]) -> Result<Delivery, InvalidLogEncoding> {
        let log = trajectory_log::TrajectoryLog::decode(contents)?;
        trajectory_log::delivery_from_log(&log)
    }

    /// Read and decode a trajectory log file.
    pub fn from_trajectory_log_file(path: impl AsRef<Path>) -> Result<Delivery, InvalidLogEncoding> {
        let contents = std::fs::read(path)?;
        Delivery::from_trajectory_log(&contents)
    }
}


#[cfg(test)]
mod dicom_tests {
    use super::*;
    use crate::test_data::{rtplan_fixture, rtplan_fixture_asymx};
    use approx::assert_abs_diff_eq;

    #[test]
    fn from_dicom_reads_the_canonical_layout() {
        let plan = rtplan_fixture(&[0.0, 270.0], &[100.0, 50.0]);
        let delivery = Delivery::from_dicom(&plan, None).unwrap();

        assert_eq!(delivery.len(), 4);
        assert_eq!(delivery.leaf_pair_count(), 3);
        assert_eq!(delivery.monitor_units(), &[0.0, 100.0, 100.0, 150.0]);

        // 270 deg IEC reads back as -90 bipolar, with the second control
        // point leaning on the first for its angle.
        assert_eq!(delivery.gantry(), &[0.0, 0.0, -90.0, -90.0]);

        // MLC banks: first half reversed and negated lands in bank 1, the
        // second half reversed in bank 0.
        assert_abs_diff_eq!(delivery.mlc()[[0, 0, 0]], 20.0);
        assert_abs_diff_eq!(delivery.mlc()[[0, 0, 1]], 20.0);
        assert_abs_diff_eq!(delivery.mlc()[[1, 0, 1]], 10.0);
        assert_abs_diff_eq!(delivery.mlc()[[1, 0, 0]], 15.0);

        // Jaw blades swapped with the second negated.
        assert_abs_diff_eq!(delivery.jaw()[[0, 0]], 50.0);
        assert_abs_diff_eq!(delivery.jaw()[[0, 1]], 50.0);
    }

    #[test]
    fn unsupported_collimation_is_rejected() {
        let plan = rtplan_fixture_asymx();
        let err = Delivery::from_dicom(&plan, None).unwrap_err();
        assert!(matches!(err, InvalidPlan::UnsupportedCollimation { .. }));
    }

    #[test]
    fn unknown_fraction_group_is_rejected() {
        let plan = rtplan_fixture(&[0.0], &[100.0]);
        let err = Delivery::from_dicom(&plan, Some(7)).unwrap_err();
        assert!(matches!(
            err,
            InvalidPlan::UnknownFractionGroup { number: 7 }
        ));
    }

    #[test]
    fn all_fraction_groups_is_keyed_by_number() {
        let plan = rtplan_fixture(&[0.0], &[100.0]);
        let groups = Delivery::all_fraction_groups(&plan).unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups.contains_key(&1));
    }

    #[test]
    fn plan_delivery_round_trips_through_to_dicom() {
        let template = rtplan_fixture(&[0.0, 270.0], &[100.0, 50.0]);
        let delivery = Delivery::from_dicom(&template, None).unwrap();

        let written = delivery.to_dicom(&template, None).unwrap();
        let re_read = Delivery::from_dicom(&written, None).unwrap();

        assert_eq!(re_read.len(), delivery.len());
        assert_eq!(re_read.leaf_pair_count(), delivery.leaf_pair_count());

        for (a, b) in delivery
            .monitor_units()
            .iter()
            .zip(re_read.monitor_units())
        {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }

        assert_eq!(delivery.gantry(), re_read.gantry());
        assert_eq!(delivery.collimator(), re_read.collimator());
        assert_eq!(delivery.mlc(), re_read.mlc());
        assert_eq!(delivery.jaw(), re_read.jaw());
    }

    #[test]
    fn written_meterset_weights_keep_trailing_zero_format() {
        let template = rtplan_fixture(&[0.0], &[100.0]);
        let delivery = Delivery::from_dicom(&template, None).unwrap();
        let written = delivery.to_dicom(&template, None).unwrap();

        let beams = crate::attr::items(&written, tags::BEAM_SEQUENCE, "BeamSequence").unwrap();
        let cps = crate::attr::items(
            &beams[0],
            tags::CONTROL_POINT_SEQUENCE,
            "ControlPointSequence",
        )
        .unwrap();

        // FinalCumulativeMetersetWeight is "1.0", so every weight carries
        // exactly one decimal place.
        for cp in cps {
            let weight = crate::attr::string(
                cp,
                tags::CUMULATIVE_METERSET_WEIGHT,
                "CumulativeMetersetWeight",
            )
            .unwrap();
            assert!(weight.split_once('.').is_some_and(|(_, f)| f.len() == 1));
        }
    }
}
