//! Keyword-driven anonymisation of DICOM datasets.
//!
//! The traversal walks a dataset tree, replacing the value of every
//! element whose keyword sits in the identifying set. Replacement goes
//! through a [`Strategy`] chosen by the caller; sequences are recursed
//! into, private tags may be deleted wholesale, and tags unknown to the
//! DICOM dictionary are handled per an explicit policy. UIDs are not in
//! the identifying set and are left alone by default.

pub mod strategy;

use std::path::{Path, PathBuf};

use dicom::core::dictionary::DataDictionary;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::{InMemDicomObject, open_file};
use dicom_dictionary_std::StandardDataDictionary;
use log::warn;
use thiserror::Error;

pub use strategy::Strategy;

use crate::rtplan::put_sequence;

/// The authoritative set of identifying keywords. Widening it requires a
/// matching migration of stored baselines, so additions are deliberate.
pub const IDENTIFYING_KEYWORDS: &[&str] = &[
    "AccessionNumber",
    "AcquisitionDate",
    "AcquisitionDateTime",
    "AcquisitionTime",
    "ContentCreatorName",
    "ContentDate",
    "ContentTime",
    "DeviceSerialNumber",
    "InstanceCreationDate",
    "InstanceCreationTime",
    "InstitutionAddress",
    "InstitutionName",
    "InstitutionalDepartmentName",
    "OperatorsName",
    "OtherPatientIDs",
    "OtherPatientNames",
    "PatientAddress",
    "PatientBirthDate",
    "PatientBirthTime",
    "PatientID",
    "PatientName",
    "PatientSex",
    "PatientTelephoneNumbers",
    "PerformingPhysicianName",
    "PhysiciansOfRecord",
    "ReferringPhysicianName",
    "SeriesDate",
    "SeriesTime",
    "StationName",
    "StructureSetDate",
    "StructureSetTime",
    "StudyDate",
    "StudyID",
    "StudyTime",
];

#[derive(Debug, Error)]
pub enum AnonymiseError {
    #[error(
        "unable to anonymise {keyword} with VR {vr}; the {strategy} strategy \
         has no replacement for this representation"
    )]
    UnsupportedVr {
        keyword: String,
        vr: String,
        strategy: &'static str,
    },

    #[error(
        "tag {tag} is not known to the DICOM dictionary; choose whether \
         unknown tags should be deleted or retained"
    )]
    UnknownTag { tag: String },

    #[error("failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An identifying element still carrying a live value.
#[derive(Debug, Error)]
#[error("the dataset is not anonymised: {keyword} still carries a value")]
pub struct NotAnonymised {
    pub keyword: String,
}

/// What to do with non-private tags the DICOM dictionary does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownTagPolicy {
    /// Fail the anonymisation.
    #[default]
    Raise,
    Delete,
    Retain,
}

/// How a directory anonymisation reacts to individual failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Stop at the first failing dataset.
    #[default]
    FailFast,
    /// Anonymise everything that can be, then report the first failure.
    CollectAndContinue,
}

#[derive(Debug, Clone)]
pub struct AnonymiseOptions<'a> {
    /// Replace values via the strategy; with `false`, values are blanked.
    pub replace_values: bool,
    /// Keywords excluded from the identifying set for this run.
    pub keywords_to_leave_unchanged: &'a [&'a str],
    /// Delete all private tags.
    pub delete_private_tags: bool,
    pub unknown_tags: UnknownTagPolicy,
    pub strategy: Strategy,
}

impl Default for AnonymiseOptions<'_> {
    fn default() -> Self {
        AnonymiseOptions {
            replace_values: true,
            keywords_to_leave_unchanged: &[],
            delete_private_tags: true,
            unknown_tags: UnknownTagPolicy::Raise,
            strategy: Strategy::Hardcode,
        }
    }
}

fn keyword_of(tag: Tag) -> Option<&'static str> {
    StandardDataDictionary.by_tag(tag).map(|entry| entry.alias)
}

fn is_group_length(tag: Tag) -> bool {
    tag.element() == 0 && tag.group() > 6
}

fn value_is_empty(value: &PrimitiveValue) -> bool {
    matches!(value, PrimitiveValue::Empty) || value.to_str().trim().is_empty()
}

fn anonymise_in_place(
    ds: &mut InMemDicomObject,
    options: &AnonymiseOptions,
) -> Result<(), AnonymiseError> {
    let tags: Vec<Tag> = ds.iter().map(|elem| elem.header().tag).collect();

    for tag in tags {
        if is_group_length(tag) {
            continue;
        }

        if tag.group() % 2 == 1 {
            if options.delete_private_tags {
                ds.remove_element(tag);
            }
            continue;
        }

        let keyword = match keyword_of(tag) {
            Some(keyword) => keyword,
            None => {
                match options.unknown_tags {
                    UnknownTagPolicy::Raise => {
                        return Err(AnonymiseError::UnknownTag {
                            tag: tag.to_string(),
                        });
                    }
                    UnknownTagPolicy::Delete => {
                        ds.remove_element(tag);
                    }
                    UnknownTagPolicy::Retain => {}
                }
                continue;
            }
        };

        let elem = ds.element(tag).expect("tag was just listed");
        let vr = elem.vr();

        // Sequences are traversed recursively whether or not their own
        // keyword is identifying.
        if vr == VR::SQ {
            if let Some(items) = elem.items() {
                let mut new_items = items.to_vec();
                for item in &mut new_items {
                    anonymise_in_place(item, options)?;
                }
                put_sequence(ds, tag, new_items);
            }
            continue;
        }

        if !IDENTIFYING_KEYWORDS.contains(&keyword)
            || options.keywords_to_leave_unchanged.contains(&keyword)
        {
            continue;
        }

        if vr == VR::CS {
            warn!(
                "{keyword} has value representation CS; replacement may break \
                 interoperability with strict receivers"
            );
        }

        let Some(current) = elem.value().primitive() else {
            continue;
        };

        if value_is_empty(current) {
            continue;
        }

        let replacement = if options.replace_values {
            options.strategy.replacement(keyword, vr, current)?
        } else if matches!(vr, VR::OB | VR::OW | VR::UN) {
            PrimitiveValue::from(vec![0u8, 0u8])
        } else {
            PrimitiveValue::Empty
        };

        ds.put(DataElement::new(tag, vr, replacement));
    }

    Ok(())
}

/// Anonymise a dataset, returning a new dataset and leaving the input
/// untouched.
pub fn anonymise_dataset(
    ds: &InMemDicomObject,
    options: &AnonymiseOptions,
) -> Result<InMemDicomObject, AnonymiseError> {
    let mut anonymised = ds.clone();
    anonymise_in_place(&mut anonymised, options)?;
    Ok(anonymised)
}

fn first_identifying_value(ds: &InMemDicomObject, ignore_private_tags: bool) -> Option<String> {
    for elem in ds.iter() {
        let tag = elem.header().tag;

        if tag.group() % 2 == 1 {
            if !ignore_private_tags {
                return Some(tag.to_string());
            }
            continue;
        }

        if elem.vr() == VR::SQ {
            if let Some(items) = elem.items() {
                if let Some(found) = items
                    .iter()
                    .find_map(|item| first_identifying_value(item, ignore_private_tags))
                {
                    return Some(found);
                }
            }
            continue;
        }

        let Some(keyword) = keyword_of(tag) else {
            continue;
        };

        if !IDENTIFYING_KEYWORDS.contains(&keyword) {
            continue;
        }

        let Some(value) = elem.value().primitive() else {
            continue;
        };

        if value_is_empty(value) {
            continue;
        }

        let is_dummy = strategy::hardcode_token(elem.vr())
            .is_some_and(|token| value.to_str().trim() == token);

        if !is_dummy {
            return Some(keyword.to_string());
        }
    }

    None
}

/// Require that no identifying element carries a non-dummy, non-empty
/// value. Private tags count as identifying unless ignored.
pub fn ensure_anonymised(
    ds: &InMemDicomObject,
    ignore_private_tags: bool,
) -> Result<(), NotAnonymised> {
    match first_identifying_value(ds, ignore_private_tags) {
        Some(keyword) => Err(NotAnonymised { keyword }),
        None => Ok(()),
    }
}

/// Whether a dataset has been anonymised by this module's strategies.
pub fn is_anonymised(ds: &InMemDicomObject, ignore_private_tags: bool) -> bool {
    ensure_anonymised(ds, ignore_private_tags).is_ok()
}

fn anonymised_output_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("dataset");
    path.with_file_name(format!("{stem}_Anonymised.dcm"))
}

/// Anonymise one DICOM file, writing `<name>_Anonymised.dcm` alongside it
/// (or to `output_path` when given). Returns the output path.
pub fn anonymise_file(
    path: &Path,
    output_path: Option<&Path>,
    options: &AnonymiseOptions,
) -> Result<PathBuf, AnonymiseError> {
    let mut obj = open_file(path).map_err(|err| AnonymiseError::Read {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    anonymise_in_place(&mut obj, options)?;

    let output = output_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| anonymised_output_path(path));

    obj.write_to_file(&output).map_err(|err| AnonymiseError::Write {
        path: output.clone(),
        message: err.to_string(),
    })?;

    Ok(output)
}

/// Anonymise every `.dcm` file in a directory.
///
/// In [`ErrorMode::FailFast`] the first failure stops the run; in
/// [`ErrorMode::CollectAndContinue`] every remaining file is still
/// processed and the first failure is returned at the end.
pub fn anonymise_directory(
    directory: &Path,
    options: &AnonymiseOptions,
    error_mode: ErrorMode,
) -> Result<Vec<PathBuf>, AnonymiseError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(directory)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
        })
        .collect();
    paths.sort();

    let mut outputs = Vec::with_capacity(paths.len());
    let mut first_failure = None;

    for path in paths {
        match anonymise_file(&path, None, options) {
            Ok(output) => outputs.push(output),
            Err(err) => match error_mode {
                ErrorMode::FailFast => return Err(err),
                ErrorMode::CollectAndContinue => {
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            },
        }
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(outputs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    fn identified_dataset() -> InMemDicomObject {
        let mut ds = InMemDicomObject::new_empty();
        ds.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from("Doe^Jane"),
        ));
        ds.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from("PMX-0001"),
        ));
        ds.put(DataElement::new(
            tags::PATIENT_BIRTH_DATE,
            VR::DA,
            PrimitiveValue::from("19800214"),
        ));
        ds.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from("RTPLAN"),
        ));
        ds.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("2.25.4321"),
        ));
        ds
    }

    #[test]
    fn hardcode_replaces_identifying_values() {
        let ds = identified_dataset();
        let anonymised = anonymise_dataset(&ds, &AnonymiseOptions::default()).unwrap();

        let name = anonymised.element(tags::PATIENT_NAME).unwrap();
        assert_eq!(name.to_str().unwrap(), "Anonymous");

        let birth = anonymised.element(tags::PATIENT_BIRTH_DATE).unwrap();
        assert_eq!(birth.to_str().unwrap(), "20190303");

        // Non-identifying attributes are untouched, UIDs included.
        let uid = anonymised.element(tags::SOP_INSTANCE_UID).unwrap();
        assert_eq!(uid.to_str().unwrap(), "2.25.4321");
        let modality = anonymised.element(tags::MODALITY).unwrap();
        assert_eq!(modality.to_str().unwrap(), "RTPLAN");
    }

    #[test]
    fn hardcode_is_idempotent_on_datasets() {
        let ds = identified_dataset();
        let options = AnonymiseOptions::default();
        let once = anonymise_dataset(&ds, &options).unwrap();
        let twice = anonymise_dataset(&once, &options).unwrap();

        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn pseudonymisation_is_deterministic() {
        let ds = identified_dataset();
        let options = AnonymiseOptions {
            strategy: Strategy::Pseudonymise,
            ..AnonymiseOptions::default()
        };

        let first = anonymise_dataset(&ds, &options).unwrap();
        let second = anonymise_dataset(&ds, &options).unwrap();

        let a = first.element(tags::PATIENT_ID).unwrap().to_str().unwrap();
        let b = second.element(tags::PATIENT_ID).unwrap().to_str().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, "PMX-0001");
    }

    #[test]
    fn sequences_are_recursed() {
        let mut ds = InMemDicomObject::new_empty();
        let mut item = InMemDicomObject::new_empty();
        item.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from("Nested^Name"),
        ));
        put_sequence(&mut ds, tags::REFERENCED_STUDY_SEQUENCE, vec![item]);

        let anonymised = anonymise_dataset(&ds, &AnonymiseOptions::default()).unwrap();
        let items = anonymised
            .element(tags::REFERENCED_STUDY_SEQUENCE)
            .unwrap()
            .items()
            .unwrap();
        let name = items[0].element(tags::PATIENT_NAME).unwrap();
        assert_eq!(name.to_str().unwrap(), "Anonymous");
    }

    #[test]
    fn empty_values_are_skipped() {
        let mut ds = InMemDicomObject::new_empty();
        ds.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::Empty,
        ));

        let anonymised = anonymise_dataset(&ds, &AnonymiseOptions::default()).unwrap();
        let name = anonymised.element(tags::PATIENT_NAME).unwrap();
        assert!(matches!(name.value().primitive(), Some(PrimitiveValue::Empty)));
    }

    #[test]
    fn private_tags_are_deleted_wholesale() {
        let mut ds = identified_dataset();
        ds.put(DataElement::new(
            Tag(0x0029, 0x1010),
            VR::LO,
            PrimitiveValue::from("vendor private"),
        ));

        let anonymised = anonymise_dataset(&ds, &AnonymiseOptions::default()).unwrap();
        assert!(anonymised.element(Tag(0x0029, 0x1010)).is_err());

        let kept = anonymise_dataset(
            &ds,
            &AnonymiseOptions {
                delete_private_tags: false,
                ..AnonymiseOptions::default()
            },
        )
        .unwrap();
        assert!(kept.element(Tag(0x0029, 0x1010)).is_ok());
    }

    #[test]
    fn keywords_can_be_left_unchanged() {
        let ds = identified_dataset();
        let options = AnonymiseOptions {
            keywords_to_leave_unchanged: &["PatientID"],
            ..AnonymiseOptions::default()
        };

        let anonymised = anonymise_dataset(&ds, &options).unwrap();
        assert_eq!(
            anonymised.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "PMX-0001"
        );
        assert_eq!(
            anonymised.element(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
            "Anonymous"
        );
    }

    #[test]
    fn is_anonymised_detects_live_values() {
        let ds = identified_dataset();
        assert!(!is_anonymised(&ds, false));

        let err = ensure_anonymised(&ds, false).unwrap_err();
        assert_eq!(err.keyword, "PatientName");

        let anonymised = anonymise_dataset(&ds, &AnonymiseOptions::default()).unwrap();
        assert!(is_anonymised(&anonymised, false));
    }

    #[test]
    fn blanking_mode_empties_values() {
        let ds = identified_dataset();
        let options = AnonymiseOptions {
            replace_values: false,
            ..AnonymiseOptions::default()
        };

        let anonymised = anonymise_dataset(&ds, &options).unwrap();
        let name = anonymised.element(tags::PATIENT_NAME).unwrap();
        assert!(value_is_empty(name.value().primitive().unwrap()));
        assert!(is_anonymised(&anonymised, false));
    }
}
