//! Trajectory-log table decoding and column semantics.

use byteorder::{ByteOrder, LittleEndian};
use ndarray::Array2;

use super::{Header, InvalidLogEncoding};

/// Sample spacing of the log table in seconds.
pub const TIME_INCREMENT_S: f64 = 0.025;

/// Positional items are recorded in tenths of a mm or degree.
const POSITIONAL_SCALE: f64 = 10.0;

/// The meaning of one table column, decoded from its `(id, part)`
/// identifier pair.
///
/// The identifier space belongs to the vendor; the lookup below covers the
/// items consumed by the delivery projection and fails loudly on anything
/// else so that new machine configurations surface immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPart {
    ControlPoint,
    LinacState,
    WedgePosition,
    /// Cumulative dose, raw 1/64 MU with i16 wrap correction.
    CumulativeDose,
    /// Dose delivered since the previous sample, 0.1 MU units.
    StepDose,
    Gantry,
    Collimator,
    Y1Diaphragm,
    Y2Diaphragm,
    /// Y1-bank leaf, 1-based pair index.
    Y1Leaf(u16),
    /// Y2-bank leaf, 1-based pair index.
    Y2Leaf(u16),
}

fn item_part_kind(id: i16, part: i16) -> Result<ItemPart, InvalidLogEncoding> {
    let kind = match (id, part) {
        (0, 0) => ItemPart::ControlPoint,
        (1, 0) => ItemPart::LinacState,
        (2, 0) => ItemPart::WedgePosition,
        (3, 0) => ItemPart::CumulativeDose,
        (4, 0) => ItemPart::StepDose,
        (5, 1) => ItemPart::Gantry,
        (6, 1) => ItemPart::Collimator,
        (7, 1) => ItemPart::Y1Diaphragm,
        (8, 1) => ItemPart::Y2Diaphragm,
        (id, 1) if (101..=180).contains(&id) => ItemPart::Y1Leaf((id - 100) as u16),
        (id, 1) if (201..=280).contains(&id) => ItemPart::Y2Leaf((id - 200) as u16),
        (id, part) => return Err(InvalidLogEncoding::UnknownItemPart { id, part }),
    };

    Ok(kind)
}

fn linac_state_label(code: i16) -> Result<&'static str, InvalidLogEncoding> {
    let label = match code {
        0 => "Preparatory",
        1 => "Confirm",
        2 => "Segment ready",
        3 => "Beam on",
        4 => "Beam hold",
        5 => "Segment complete",
        6 => "Field complete",
        7 => "Terminated fault",
        code => {
            return Err(InvalidLogEncoding::UnknownStateCode {
                lookup: "linac state",
                code,
            });
        }
    };

    Ok(label)
}

fn wedge_label(code: i16) -> Result<&'static str, InvalidLogEncoding> {
    let label = match code {
        0 => "No wedge",
        1 => "Static wedge",
        2 => "Dynamic wedge",
        3 => "Motorised wedge",
        code => {
            return Err(InvalidLogEncoding::UnknownStateCode {
                lookup: "wedge",
                code,
            });
        }
    };

    Ok(label)
}

struct VersionRow {
    lg_scale: usize,
    offset: usize,
}

fn version_row(version: i32) -> Result<VersionRow, InvalidLogEncoding> {
    match version {
        1 => Ok(VersionRow {
            lg_scale: 2,
            offset: 0,
        }),
        2..=4 => Ok(VersionRow {
            lg_scale: 2,
            offset: 8,
        }),
        version => Err(InvalidLogEncoding::UnsupportedVersion { version }),
    }
}

/// The decoded per-sample table.
///
/// Values carry the converted units: positional items in mm/deg, step dose
/// in MU, cumulative dose as wrap-corrected raw 1/64 MU counts. Y2 leaf
/// columns have had their historical sign flip applied so both banks are
/// positive outward.
#[derive(Debug, Clone)]
pub struct Table {
    columns: Vec<ItemPart>,
    values: Array2<f64>,
    /// Per-row i64 timestamps; absent for version-1 logs.
    pub timestamps: Option<Vec<i64>>,
    /// Sample times in seconds, derived from the row index.
    pub time_s: Vec<f64>,
    /// Per-row linac state labels.
    pub linac_states: Vec<&'static str>,
    /// Per-row wedge position labels.
    pub wedge_positions: Vec<&'static str>,
}

impl Table {
    pub fn rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn columns(&self) -> &[ItemPart] {
        &self.columns
    }

    /// The converted values of one column.
    pub fn column(&self, kind: ItemPart) -> Result<Vec<f64>, InvalidLogEncoding> {
        let index = self
            .columns
            .iter()
            .position(|&c| c == kind)
            .ok_or_else(|| InvalidLogEncoding::MissingColumn {
                column: format!("{kind:?}"),
            })?;

        Ok(self.values.column(index).to_vec())
    }

    /// All leaf columns of one bank ordered by pair index.
    pub fn leaf_bank_columns(&self, y2: bool) -> Result<Vec<Vec<f64>>, InvalidLogEncoding> {
        let mut indexed: Vec<(u16, usize)> = self
            .columns
            .iter()
            .enumerate()
            .filter_map(|(index, &kind)| match (y2, kind) {
                (false, ItemPart::Y1Leaf(pair)) => Some((pair, index)),
                (true, ItemPart::Y2Leaf(pair)) => Some((pair, index)),
                _ => None,
            })
            .collect();
        indexed.sort_by_key(|&(pair, _)| pair);

        if indexed
            .iter()
            .enumerate()
            .any(|(i, &(pair, _))| pair as usize != i + 1)
        {
            return Err(InvalidLogEncoding::MismatchedLeafBanks);
        }

        Ok(indexed
            .into_iter()
            .map(|(_, index)| self.values.column(index).to_vec())
            .collect())
    }
}

fn convert_value(kind: ItemPart, raw: i16) -> f64 {
    match kind {
        ItemPart::ControlPoint | ItemPart::LinacState | ItemPart::WedgePosition => raw as f64,
        ItemPart::CumulativeDose => {
            // The cumulative counter outgrows i16 during long beams; the
            // wrapped value is recovered by reinterpreting as u16.
            if raw < 0 {
                raw as f64 + 65536.0
            } else {
                raw as f64
            }
        }
        ItemPart::StepDose => raw as f64 / POSITIONAL_SCALE,
        ItemPart::Gantry
        | ItemPart::Collimator
        | ItemPart::Y1Diaphragm
        | ItemPart::Y2Diaphragm
        | ItemPart::Y1Leaf(_) => raw as f64 / POSITIONAL_SCALE,
        ItemPart::Y2Leaf(_) => -(raw as f64) / POSITIONAL_SCALE,
    }
}

/// Decode the table portion of a log given its decoded header.
pub fn decode_table(table_contents: &[u8], header: &Header) -> Result<Table, InvalidLogEncoding> {
    let columns: Vec<ItemPart> = header
        .item_parts
        .iter()
        .map(|&(id, part)| item_part_kind(id, part))
        .collect::<Result<_, _>>()?;

    let row = version_row(header.version)?;
    let row_size = row.lg_scale * columns.len() + row.offset;

    if row_size == 0 || table_contents.len() % row_size != 0 {
        return Err(InvalidLogEncoding::RowSizeMismatch {
            found: table_contents.len(),
            row_size,
        });
    }

    let n_rows = table_contents.len() / row_size;
    let mut values = Array2::zeros((n_rows, columns.len()));
    let mut timestamps = (header.version >= 2).then(|| Vec::with_capacity(n_rows));
    let mut linac_states = Vec::with_capacity(n_rows);
    let mut wedge_positions = Vec::with_capacity(n_rows);

    for i in 0..n_rows {
        let row_bytes = &table_contents[i * row_size..(i + 1) * row_size];

        if let Some(timestamps) = timestamps.as_mut() {
            timestamps.push(LittleEndian::read_i64(row_bytes));
        }

        for (j, &kind) in columns.iter().enumerate() {
            let raw = LittleEndian::read_i16(&row_bytes[row.offset + 2 * j..]);
            values[[i, j]] = convert_value(kind, raw);

            match kind {
                ItemPart::LinacState => linac_states.push(linac_state_label(raw)?),
                ItemPart::WedgePosition => wedge_positions.push(wedge_label(raw)?),
                _ => {}
            }
        }
    }

    let time_s = (0..n_rows)
        .map(|i| (i as f64 * TIME_INCREMENT_S * 100.0).round() / 100.0)
        .collect();

    Ok(Table {
        columns,
        values,
        timestamps,
        time_s,
        linac_states,
        wedge_positions,
    })
}
