//! Replacement strategies for identifying DICOM values, indexed by VR.

use chrono::{Duration, NaiveDate};
use dicom::core::{PrimitiveValue, VR};
use sha2::{Digest, Sha256};

use super::AnonymiseError;

const EPOCH_DATE: &str = "20000101";

/// A value-replacement strategy. The dispatch is an explicit mapping from
/// VR to replacement behaviour, passed by the caller to the anonymise
/// entry point rather than looked up globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Replace with VR-specific fixed tokens. Applying it twice gives the
    /// same dataset as applying it once.
    Hardcode,
    /// Replace via deterministic per-VR functions: hashes for text,
    /// offset-and-jitter for dates and ages, a structured transform for
    /// names, identity for opaque binaries.
    Pseudonymise,
}

impl Strategy {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Strategy::Hardcode => "hardcode",
            Strategy::Pseudonymise => "pseudonymise",
        }
    }

    pub(crate) fn replacement(
        self,
        keyword: &str,
        vr: VR,
        current: &PrimitiveValue,
    ) -> Result<PrimitiveValue, AnonymiseError> {
        match self {
            Strategy::Hardcode => hardcode_replacement(keyword, vr),
            Strategy::Pseudonymise => pseudonymous_replacement(keyword, vr, current),
        }
    }
}

/// The fixed token used by the hardcode strategy for a VR, if the VR is
/// handled. Also used by the `is_anonymised` predicate to recognise
/// already-dummied elements.
pub(crate) fn hardcode_token(vr: VR) -> Option<&'static str> {
    let token = match vr {
        VR::AE => "Anonymous",
        VR::AS => "100Y",
        VR::CS => "ANON",
        VR::DA => "20190303",
        VR::DS => "12345678.9",
        VR::DT => "20190303000900.000000",
        VR::IS => "12345678",
        VR::LO => "Anonymous",
        VR::LT => "Anonymous",
        VR::PN => "Anonymous",
        VR::SH => "Anonymous",
        VR::ST => "Anonymous",
        VR::TM => "000900.000000",
        VR::UI => "12345678.9",
        _ => return None,
    };

    Some(token)
}

fn hardcode_replacement(keyword: &str, vr: VR) -> Result<PrimitiveValue, AnonymiseError> {
    match vr {
        VR::OB | VR::OW | VR::UN => Ok(PrimitiveValue::from(vec![0u8, 0u8])),
        VR::US => Ok(PrimitiveValue::from(12345u16)),
        vr => hardcode_token(vr)
            .map(PrimitiveValue::from)
            .ok_or_else(|| AnonymiseError::UnsupportedVr {
                keyword: keyword.to_string(),
                vr: format!("{vr:?}"),
                strategy: "hardcode",
            }),
    }
}

fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// A small deterministic integer derived from the value, used for date
/// shifts and age jitter.
fn hash_offset(value: &str, modulus: i64) -> i64 {
    let digest = sha256_hex(value);
    let word = i64::from_str_radix(&digest[..12], 16).unwrap_or(0);
    word % modulus
}

fn pseudonymise_text(value: &str, length: usize) -> String {
    sha256_hex(value)[..length].to_uppercase()
}

fn pseudonymise_name(value: &str) -> String {
    format!("ANON^{}", &sha256_hex(value)[..12].to_uppercase())
}

fn pseudonymise_date(value: &str) -> String {
    let date_part: String = value.chars().take(8).collect();
    let parsed = NaiveDate::parse_from_str(&date_part, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(EPOCH_DATE, "%Y%m%d"))
        .expect("the epoch fallback parses");

    // Shift back by a value-derived number of days within one year; the
    // same input always lands on the same output date.
    let shifted = parsed - Duration::days(hash_offset(value, 365));
    shifted.format("%Y%m%d").to_string()
}

fn pseudonymise_datetime(value: &str) -> String {
    format!("{}000000.000000", pseudonymise_date(value))
}

/// Jitter an age string while keeping it plausible: old ages collapse to
/// buckets, young ages shift by a value-derived amount in a smaller unit.
fn pseudonymise_age(value: &str) -> String {
    let (digits, unit) = value.split_at(value.len().saturating_sub(1));
    let Ok(numeric) = digits.parse::<i64>() else {
        return "100Y".to_string();
    };

    let increment = hash_offset(value, 5) - 2;

    let (pseudo_numeric, pseudo_unit) = if numeric > 80 {
        (80, unit)
    } else if numeric > 20 {
        (numeric - numeric % 10, unit)
    } else if numeric > 10 {
        (numeric + increment, unit)
    } else {
        match unit {
            "Y" => (12 * numeric + increment, "M"),
            "M" => (4 * numeric + increment, "W"),
            "W" => (7 * numeric + increment, "D"),
            unit => (numeric + increment.max(0), unit),
        }
    };

    format!("{:03}{}", pseudo_numeric.max(0), pseudo_unit)
}

fn pseudonymise_uid(value: &str) -> String {
    let digest = sha256_hex(value);
    let word = u128::from_str_radix(&digest[..30], 16).unwrap_or(0);
    format!("2.25.{word}")
}

fn pseudonymous_replacement(
    keyword: &str,
    vr: VR,
    current: &PrimitiveValue,
) -> Result<PrimitiveValue, AnonymiseError> {
    let text = current.to_str();

    let replaced = match vr {
        VR::AE | VR::SH => pseudonymise_text(&text, 16),
        VR::CS => pseudonymise_text(&text, 16),
        VR::LO | VR::LT | VR::ST => pseudonymise_text(&text, 32),
        VR::PN => pseudonymise_name(&text),
        VR::DA => pseudonymise_date(&text),
        VR::DT => pseudonymise_datetime(&text),
        VR::TM => "000000".to_string(),
        VR::AS => pseudonymise_age(&text),
        VR::UI => pseudonymise_uid(&text),
        VR::DS | VR::IS => hardcode_token(vr).expect("numeric strings are handled").to_string(),
        // Opaque binaries map to themselves.
        VR::OB | VR::OW | VR::UN => return Ok(current.clone()),
        vr => {
            return Err(AnonymiseError::UnsupportedVr {
                keyword: keyword.to_string(),
                vr: format!("{vr:?}"),
                strategy: "pseudonymise",
            });
        }
    };

    Ok(PrimitiveValue::from(replaced))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardcode_is_idempotent_per_vr() {
        let once = hardcode_replacement("PatientName", VR::PN).unwrap();
        let twice = hardcode_replacement("PatientName", VR::PN).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn pseudonymised_text_is_deterministic_and_different() {
        let value = PrimitiveValue::from("Doe^Jane");
        let a = pseudonymous_replacement("PatientName", VR::PN, &value).unwrap();
        let b = pseudonymous_replacement("PatientName", VR::PN, &value).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.to_str(), "Doe^Jane");
    }

    #[test]
    fn pseudonymised_dates_shift_backwards_within_a_year() {
        let shifted = pseudonymise_date("19800214");
        assert_ne!(shifted, "19800214");

        let original = NaiveDate::parse_from_str("19800214", "%Y%m%d").unwrap();
        let replaced = NaiveDate::parse_from_str(&shifted, "%Y%m%d").unwrap();
        let days = (original - replaced).num_days();
        assert!((0..365).contains(&days));

        assert_eq!(shifted, pseudonymise_date("19800214"));
    }

    #[test]
    fn ages_round_to_plausible_buckets() {
        assert_eq!(pseudonymise_age("093Y"), pseudonymise_age("093Y"));
        assert_eq!(pseudonymise_age("095Y"), "080Y");
        assert_eq!(pseudonymise_age("047Y"), "040Y");

        let young = pseudonymise_age("004Y");
        assert!(young.ends_with('M'));
    }

    #[test]
    fn uids_become_uuid_derived() {
        let uid = pseudonymise_uid("1.2.840.10008.1.2");
        assert!(uid.starts_with("2.25."));
        assert_eq!(uid, pseudonymise_uid("1.2.840.10008.1.2"));
    }
}
