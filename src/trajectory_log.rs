//! Binary trajectory-log decoding.
//!
//! A log is a single little-endian blob of `{header, table}`. The header
//! carries delivery metadata and the ordered list of table column
//! identifiers; the table is a fixed-stride run of per-sample rows. See
//! [`header`] and [`table`] for the two layers, and [`delivery_from_log`]
//! for the projection into a [`Delivery`].

pub mod header;
pub mod table;

use ndarray::{Array2, Array3};
use thiserror::Error;

use crate::coords::{AmbiguousAngle, angles_to_bipolar};
use crate::delivery::Delivery;
use crate::rtplan::InvalidPlan;

pub use header::Header;
pub use table::{ItemPart, Table};

/// Raw cumulative dose is recorded in 1/64ths of a monitor unit.
const DOSE_RAW_PER_MU: f64 = 64.0;

#[derive(Debug, Error)]
pub enum InvalidLogEncoding {
    #[error("trajectory log header is not in an expected form")]
    HeaderMismatch,

    #[error("trajectory log ends before the end of the header")]
    TruncatedHeader,

    #[error("unsupported trajectory log version {version}")]
    UnsupportedVersion { version: i32 },

    #[error(
        "table byte count {found} is not divisible by the computed row size \
         of {row_size} bytes"
    )]
    RowSizeMismatch { found: usize, row_size: usize },

    #[error(
        "the conversion lookup for {lookup} codes is incomplete, code {code} \
         was not converted; extend the lookup to include it"
    )]
    UnknownStateCode { lookup: &'static str, code: i16 },

    #[error(
        "unknown item part identifier ({id}, {part}); extend the item part \
         lookup to include it"
    )]
    UnknownItemPart { id: i16, part: i16 },

    #[error("column {column} is missing from the trajectory log table")]
    MissingColumn { column: String },

    #[error("Y1 and Y2 leaf columns do not form matching pairs")]
    MismatchedLeafBanks,

    #[error(transparent)]
    Angle(#[from] AmbiguousAngle),

    #[error(transparent)]
    Plan(#[from] InvalidPlan),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A fully decoded trajectory log.
#[derive(Debug, Clone)]
pub struct TrajectoryLog {
    pub header: Header,
    pub table: Table,
}

impl TrajectoryLog {
    pub fn decode(contents: &[u8]) -> Result<Self, InvalidLogEncoding> {
        let header = header::decode_header(contents)?;
        let table = table::decode_table(&contents[header.header_length..], &header)?;

        Ok(TrajectoryLog { header, table })
    }
}

/// Project a decoded log into the canonical delivery record.
///
/// Cumulative dose becomes cumulative MU, gantry and collimator angles are
/// converted to the bipolar convention (raw 180° samples lean on their
/// neighbours), and the leaf and diaphragm columns are assembled into the
/// outward-positive MLC/jaw layout shared with the RT Plan reader.
pub fn delivery_from_log(log: &TrajectoryLog) -> Result<Delivery, InvalidLogEncoding> {
    let table = &log.table;

    let monitor_units: Vec<f64> = table
        .column(ItemPart::CumulativeDose)?
        .iter()
        .map(|raw| raw / DOSE_RAW_PER_MU)
        .collect();

    let gantry = angles_to_bipolar(&table.column(ItemPart::Gantry)?)?;
    let collimator = angles_to_bipolar(&table.column(ItemPart::Collimator)?)?;

    let y1_diaphragm = table.column(ItemPart::Y1Diaphragm)?;
    let y2_diaphragm = table.column(ItemPart::Y2Diaphragm)?;

    let rows = monitor_units.len();
    let mut jaw = Array2::zeros((rows, 2));
    for i in 0..rows {
        jaw[[i, 0]] = y2_diaphragm[i];
        jaw[[i, 1]] = -y1_diaphragm[i];
    }

    let y1_leaves = table.leaf_bank_columns(false)?;
    let y2_leaves = table.leaf_bank_columns(true)?;

    if y1_leaves.len() != y2_leaves.len() || y1_leaves.is_empty() {
        return Err(InvalidLogEncoding::MismatchedLeafBanks);
    }

    let leaf_pairs = y1_leaves.len();
    let mut mlc = Array3::zeros((rows, leaf_pairs, 2));
    for (l, (y1, y2)) in y1_leaves.iter().zip(&y2_leaves).enumerate() {
        for i in 0..rows {
            // The Y2 bank sign flip has already happened during table
            // conversion, leaving both banks positive outward.
            mlc[[i, l, 0]] = y1[i];
            mlc[[i, l, 1]] = y2[i];
        }
    }

    Ok(Delivery::new(monitor_units, gantry, collimator, mlc, jaw)?)
}
