//! Shared helpers for pulling required attributes out of DICOM datasets.
//!
//! Every reader in this crate funnels through these so that a missing or
//! malformed attribute surfaces with the DICOM keyword in the message
//! instead of a bare tag number.

use dicom::core::Tag;
use dicom::object::InMemDicomObject;
use dicom::object::mem::InMemElement;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttrError {
    #[error("{keyword} is missing from the dataset")]
    Missing { keyword: &'static str },

    #[error("{keyword} could not be read as {expected}")]
    Malformed {
        keyword: &'static str,
        expected: &'static str,
    },
}

pub(crate) fn element<'a>(
    obj: &'a InMemDicomObject,
    tag: Tag,
    keyword: &'static str,
) -> Result<&'a InMemElement, AttrError> {
    obj.element(tag).map_err(|_| AttrError::Missing { keyword })
}

pub(crate) fn items<'a>(
    obj: &'a InMemDicomObject,
    tag: Tag,
    keyword: &'static str,
) -> Result<&'a [InMemDicomObject], AttrError> {
    element(obj, tag, keyword)?
        .items()
        .ok_or(AttrError::Malformed {
            keyword,
            expected: "a sequence",
        })
}

pub(crate) fn f64_value(
    obj: &InMemDicomObject,
    tag: Tag,
    keyword: &'static str,
) -> Result<f64, AttrError> {
    element(obj, tag, keyword)?
        .to_float64()
        .map_err(|_| AttrError::Malformed {
            keyword,
            expected: "a decimal value",
        })
}

pub(crate) fn multi_f64(
    obj: &InMemDicomObject,
    tag: Tag,
    keyword: &'static str,
) -> Result<Vec<f64>, AttrError> {
    element(obj, tag, keyword)?
        .to_multi_float64()
        .map_err(|_| AttrError::Malformed {
            keyword,
            expected: "decimal values",
        })
}

pub(crate) fn i64_value(
    obj: &InMemDicomObject,
    tag: Tag,
    keyword: &'static str,
) -> Result<i64, AttrError> {
    element(obj, tag, keyword)?
        .to_int::<i64>()
        .map_err(|_| AttrError::Malformed {
            keyword,
            expected: "an integer",
        })
}

pub(crate) fn string(
    obj: &InMemDicomObject,
    tag: Tag,
    keyword: &'static str,
) -> Result<String, AttrError> {
    Ok(element(obj, tag, keyword)?
        .to_str()
        .map_err(|_| AttrError::Malformed {
            keyword,
            expected: "a string",
        })?
        .trim()
        .to_string())
}

/// Like [`string`] but treats an absent element as `None`.
pub(crate) fn opt_string(
    obj: &InMemDicomObject,
    tag: Tag,
    keyword: &'static str,
) -> Result<Option<String>, AttrError> {
    match obj.element(tag) {
        Ok(elem) => Ok(Some(
            elem.to_str()
                .map_err(|_| AttrError::Malformed {
                    keyword,
                    expected: "a string",
                })?
                .trim()
                .to_string(),
        )),
        Err(_) => Ok(None),
    }
}
