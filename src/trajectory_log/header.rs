//! Trajectory-log header decoding.
//!
//! The header layout was reverse engineered rather than taken from vendor
//! documentation. Zero-padded text fields sit between single delimiter
//! bytes, followed by a little-endian binary tail:
//!
//! ```text
//! <delim> date <delim> utc-offset <delim> field-label/field-name <delim>
//! machine-name <delim> f64 total_mu | i32 version | i32 item_parts_number
//! | item_parts_number x (i16 id, i16 part)
//! ```

use std::sync::OnceLock;

use byteorder::{ByteOrder, LittleEndian};
use regex::bytes::Regex;

use super::InvalidLogEncoding;

/// Bytes of the fixed-width binary tail before the item part list.
const BINARY_TAIL_FIXED: usize = 8 + 4 + 4;

#[derive(Debug, Clone)]
pub struct Header {
    /// Machine ID, for serial-number based setups something like "2619".
    pub machine: String,
    /// UTC date, e.g. "24/02/10 06:29:58 Z".
    pub date: String,
    /// e.g. "+10:00".
    pub timezone: String,
    /// First field identifier; blank for service-mode beams.
    pub field_label: String,
    /// Second field identifier, e.g. "AP G0".
    pub field_name: String,
    /// Total delivered monitor units as recorded by the machine.
    pub total_mu: f64,
    /// Table layout version.
    pub version: i32,
    /// Ordered `(id, part)` identifier pairs, one per table column.
    pub item_parts: Vec<(i16, i16)>,
    /// Total header byte length; the table starts here.
    pub(crate) header_length: usize,
}

fn header_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?-u)^[\x00-\x19](\d\d[/-]\d\d[/-]\d\d \d\d:\d\d:\d\d Z)[\x00-\x19]((\+|-)\d\d:\d\d)[\x00-\x25]([\x20-\x7F]*)[\x00-\x19]([\x20-\x7F]+)[\x00-\x19]",
        )
        .expect("header pattern is valid")
    })
}

fn ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decode the header at the start of a trajectory-log blob.
///
/// A byte stream that does not open with the expected structure yields
/// [`InvalidLogEncoding::HeaderMismatch`]; this is an ordinary result, not
/// control flow, so callers can probe arbitrary files cheaply.
pub fn decode_header(contents: &[u8]) -> Result<Header, InvalidLogEncoding> {
    let captures = header_regex()
        .captures(contents)
        .ok_or(InvalidLogEncoding::HeaderMismatch)?;

    let date = ascii(&captures[1]);
    let timezone = ascii(&captures[2]);
    let field = ascii(&captures[4]);
    let machine = ascii(&captures[5]);

    let (field_label, field_name) = match field.split_once('/') {
        Some((label, name)) => (label.to_string(), name.to_string()),
        None => (String::new(), field),
    };

    let tail_start = captures.get(0).expect("whole match exists").end();

    if contents.len() < tail_start + BINARY_TAIL_FIXED {
        return Err(InvalidLogEncoding::TruncatedHeader);
    }

    let total_mu = LittleEndian::read_f64(&contents[tail_start..]);
    let version = LittleEndian::read_i32(&contents[tail_start + 8..]);
    let item_parts_number = LittleEndian::read_i32(&contents[tail_start + 12..]);

    if item_parts_number < 0 {
        return Err(InvalidLogEncoding::HeaderMismatch);
    }

    let item_parts_number = item_parts_number as usize;
    let header_length = tail_start + BINARY_TAIL_FIXED + 4 * item_parts_number;

    if contents.len() < header_length {
        return Err(InvalidLogEncoding::TruncatedHeader);
    }

    let mut item_parts = Vec::with_capacity(item_parts_number);
    for i in 0..item_parts_number {
        let offset = tail_start + BINARY_TAIL_FIXED + 4 * i;
        let id = LittleEndian::read_i16(&contents[offset..]);
        let part = LittleEndian::read_i16(&contents[offset + 2..]);
        item_parts.push((id, part));
    }

    Ok(Header {
        machine,
        date,
        timezone,
        field_label,
        field_name,
        total_mu,
        version,
        item_parts,
        header_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_mode_field_has_no_label() {
        let mut contents = Vec::new();
        contents.push(0x09);
        contents.extend_from_slice(b"24-02-10 06:29:58 Z");
        contents.push(0x09);
        contents.extend_from_slice(b"-05:00");
        contents.push(0x09);
        contents.extend_from_slice(b"Service beam");
        contents.push(0x09);
        contents.extend_from_slice(b"5201");
        contents.push(0x09);
        contents.extend_from_slice(&1.25f64.to_le_bytes());
        contents.extend_from_slice(&1i32.to_le_bytes());
        contents.extend_from_slice(&0i32.to_le_bytes());

        let header = decode_header(&contents).unwrap();
        assert_eq!(header.field_label, "");
        assert_eq!(header.field_name, "Service beam");
        assert_eq!(header.timezone, "-05:00");
        assert_eq!(header.item_parts, vec![]);
        assert_eq!(header.header_length, contents.len());
    }

    #[test]
    fn truncated_tail_is_reported() {
        let mut contents = Vec::new();
        contents.push(0x09);
        contents.extend_from_slice(b"24/02/10 06:29:58 Z");
        contents.push(0x09);
        contents.extend_from_slice(b"+10:00");
        contents.push(0x09);
        contents.extend_from_slice(b"1-1/AP G0");
        contents.push(0x09);
        contents.extend_from_slice(b"2619");
        contents.push(0x09);
        contents.extend_from_slice(&[0u8; 4]);

        let err = decode_header(&contents).unwrap_err();
        assert!(matches!(err, InvalidLogEncoding::TruncatedHeader));
    }
}
