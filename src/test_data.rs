//! Synthetic DICOM fixtures shared by the unit tests.

use byteorder::{ByteOrder, LittleEndian};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;

use crate::rtplan::{put_sequence, put_str};

fn ds_list(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\\")
}

fn limiting_device(device_type: &str, boundaries: Option<&[f64]>) -> InMemDicomObject {
    let mut device = InMemDicomObject::new_empty();
    put_str(
        &mut device,
        tags::RT_BEAM_LIMITING_DEVICE_TYPE,
        VR::CS,
        device_type,
    );

    if let Some(boundaries) = boundaries {
        put_str(
            &mut device,
            tags::LEAF_POSITION_BOUNDARIES,
            VR::DS,
            ds_list(boundaries),
        );
        put_str(
            &mut device,
            tags::NUMBER_OF_LEAF_JAW_PAIRS,
            VR::IS,
            (boundaries.len() - 1).to_string(),
        );
    } else {
        put_str(&mut device, tags::NUMBER_OF_LEAF_JAW_PAIRS, VR::IS, "1");
    }

    device
}

fn position_item(device_type: &str, positions: &[f64]) -> InMemDicomObject {
    let mut item = InMemDicomObject::new_empty();
    put_str(
        &mut item,
        tags::RT_BEAM_LIMITING_DEVICE_TYPE,
        VR::CS,
        device_type,
    );
    put_str(&mut item, tags::LEAF_JAW_POSITIONS, VR::DS, ds_list(positions));
    item
}

fn control_point(
    index: usize,
    gantry: Option<f64>,
    weight: f64,
    mlc: &[f64],
    jaw: &[f64],
    with_geometry: bool,
) -> InMemDicomObject {
    let mut cp = InMemDicomObject::new_empty();
    put_str(&mut cp, tags::CONTROL_POINT_INDEX, VR::IS, index.to_string());
    put_str(
        &mut cp,
        tags::CUMULATIVE_METERSET_WEIGHT,
        VR::DS,
        format!("{weight:.1}"),
    );

    if let Some(gantry) = gantry {
        put_str(&mut cp, tags::GANTRY_ANGLE, VR::DS, format!("{gantry:.1}"));
        put_str(&mut cp, tags::GANTRY_ROTATION_DIRECTION, VR::CS, "NONE");
        put_str(&mut cp, tags::BEAM_LIMITING_DEVICE_ANGLE, VR::DS, "0.0");
        put_str(
            &mut cp,
            tags::BEAM_LIMITING_DEVICE_ROTATION_DIRECTION,
            VR::CS,
            "NONE",
        );
    }

    if with_geometry {
        put_str(&mut cp, tags::ISOCENTER_POSITION, VR::DS, "0.0\\0.0\\0.0");
        put_str(&mut cp, tags::SURFACE_ENTRY_POINT, VR::DS, "0.0\\0.0\\0.0");
        put_str(&mut cp, tags::SOURCE_TO_SURFACE_DISTANCE, VR::DS, "900.0");
    }

    put_sequence(
        &mut cp,
        tags::BEAM_LIMITING_DEVICE_POSITION_SEQUENCE,
        vec![position_item("ASYMY", jaw), position_item("MLCX", mlc)],
    );

    cp
}

fn beam(number: i64, gantry: f64, jaw_device_type: &str) -> InMemDicomObject {
    let mut beam = InMemDicomObject::new_empty();
    put_str(&mut beam, tags::BEAM_NUMBER, VR::IS, number.to_string());
    put_str(&mut beam, tags::TREATMENT_MACHINE_NAME, VR::SH, "2619");
    put_str(&mut beam, tags::SOURCE_AXIS_DISTANCE, VR::DS, "1000.0");
    put_str(
        &mut beam,
        tags::FINAL_CUMULATIVE_METERSET_WEIGHT,
        VR::DS,
        "1.0",
    );

    put_sequence(
        &mut beam,
        tags::BEAM_LIMITING_DEVICE_SEQUENCE,
        vec![
            limiting_device(jaw_device_type, None),
            limiting_device("MLCX", Some(&[-15.0, -5.0, 5.0, 15.0])),
        ],
    );

    // The second control point omits the gantry attributes so readers
    // must lean on the prior control point.
    put_sequence(
        &mut beam,
        tags::CONTROL_POINT_SEQUENCE,
        vec![
            control_point(
                0,
                Some(gantry),
                0.0,
                &[-20.0, -20.0, -20.0, 20.0, 20.0, 20.0],
                &[-50.0, 50.0],
                true,
            ),
            control_point(
                1,
                None,
                1.0,
                &[-10.0, -10.0, -10.0, 15.0, 15.0, 15.0],
                &[-50.0, 50.0],
                false,
            ),
        ],
    );

    beam
}

fn referenced_beam(number: i64, meterset: f64) -> InMemDicomObject {
    let mut item = InMemDicomObject::new_empty();
    put_str(
        &mut item,
        tags::REFERENCED_BEAM_NUMBER,
        VR::IS,
        number.to_string(),
    );
    put_str(&mut item, tags::BEAM_METERSET, VR::DS, format!("{meterset:.1}"));
    item
}

/// A minimal but structurally faithful RT Plan with one beam per gantry
/// angle, all referenced from a single fraction group.
pub(crate) fn rtplan_fixture(gantry_angles: &[f64], metersets: &[f64]) -> InMemDicomObject {
    let mut plan = InMemDicomObject::new_empty();
    put_str(&mut plan, tags::MODALITY, VR::CS, "RTPLAN");
    put_str(&mut plan, tags::PATIENT_ID, VR::LO, "PMX-0001");

    let beams: Vec<InMemDicomObject> = gantry_angles
        .iter()
        .enumerate()
        .map(|(i, &angle)| beam(i as i64 + 1, angle, "ASYMY"))
        .collect();

    let referenced: Vec<InMemDicomObject> = metersets
        .iter()
        .enumerate()
        .map(|(i, &meterset)| referenced_beam(i as i64 + 1, meterset))
        .collect();

    let mut group = InMemDicomObject::new_empty();
    put_str(&mut group, tags::FRACTION_GROUP_NUMBER, VR::IS, "1");
    put_sequence(&mut group, tags::REFERENCED_BEAM_SEQUENCE, referenced);

    put_sequence(&mut plan, tags::FRACTION_GROUP_SEQUENCE, vec![group]);
    put_sequence(&mut plan, tags::BEAM_SEQUENCE, beams);

    plan
}

/// Like [`rtplan_fixture`] but with an X jaw, an unsupported limiting
/// device configuration.
pub(crate) fn rtplan_fixture_asymx() -> InMemDicomObject {
    let mut plan = rtplan_fixture(&[0.0], &[100.0]);
    let beams = vec![beam(1, 0.0, "ASYMX")];
    put_sequence(&mut plan, tags::BEAM_SEQUENCE, beams);
    plan
}

/// An HFS RT Dose dataset whose dose falls off linearly with depth (+y),
/// with the maximum at the surface row.
pub(crate) fn depth_dose_fixture() -> InMemDicomObject {
    let rows = 35usize;
    let columns = 5usize;
    let frames = 3usize;
    let spacing = 10.0;

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
        "-20.0\\0.0\\-10.0",
    );
    put_str(
        &mut ds,
        tags::PIXEL_SPACING,
        VR::DS,
        format!("{spacing}\\{spacing}"),
    );
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
        ds_list(&[0.0, 10.0, 20.0]),
    );
    put_str(&mut ds, tags::DOSE_GRID_SCALING, VR::DS, "0.01");
    ds.put(DataElement::new(
        tags::BITS_ALLOCATED,
        VR::US,
        PrimitiveValue::from(16u16),
    ));

    // Dose falls with the row index: 100% at the surface, minus 0.2% per
    // mm of depth.
    let mut words = Vec::with_capacity(rows * columns * frames);
    for _frame in 0..frames {
        for row in 0..rows {
            for _column in 0..columns {
                let depth = row as f64 * spacing;
                words.push((10000.0 - 20.0 * depth) as u16);
            }
        }
    }

    let mut bytes = vec![0u8; words.len() * 2];
    LittleEndian::write_u16_into(&words, &mut bytes);
    ds.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        PrimitiveValue::from(bytes),
    ));

    ds
}
