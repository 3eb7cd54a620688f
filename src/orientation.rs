//! Patient position handling for the eight cardinal scan orientations.

use dicom::object::InMemDicomObject;
use dicom_dictionary_std::tags;

use crate::attr;
use crate::coords::InvalidGeometry;

/// The DICOM Patient Position values supported by the dose-grid services.
///
/// Slices must stack along the superoinferior axis, which restricts the
/// supported `ImageOrientationPatient` vectors to the eight combinations
/// below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatientPosition {
    /// Head First-Supine
    Hfs,
    /// Head First-Prone
    Hfp,
    /// Head First-Decubitus Left
    Hfdl,
    /// Head First-Decubitus Right
    Hfdr,
    /// Feet First-Supine
    Ffs,
    /// Feet First-Prone
    Ffp,
    /// Feet First-Decubitus Left
    Ffdl,
    /// Feet First-Decubitus Right
    Ffdr,
}

impl PatientPosition {
    pub fn code(self) -> &'static str {
        match self {
            PatientPosition::Hfs => "HFS",
            PatientPosition::Hfp => "HFP",
            PatientPosition::Hfdl => "HFDL",
            PatientPosition::Hfdr => "HFDR",
            PatientPosition::Ffs => "FFS",
            PatientPosition::Ffp => "FFP",
            PatientPosition::Ffdl => "FFDL",
            PatientPosition::Ffdr => "FFDR",
        }
    }

    /// The `ImageOrientationPatient` direction cosines for this position.
    pub fn image_orientation(self) -> [f64; 6] {
        match self {
            PatientPosition::Hfs => [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            PatientPosition::Hfp => [-1.0, 0.0, 0.0, 0.0, -1.0, 0.0],
            PatientPosition::Hfdl => [0.0, -1.0, 0.0, 1.0, 0.0, 0.0],
            PatientPosition::Hfdr => [0.0, 1.0, 0.0, -1.0, 0.0, 0.0],
            PatientPosition::Ffs => [-1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            PatientPosition::Ffp => [1.0, 0.0, 0.0, 0.0, -1.0, 0.0],
            PatientPosition::Ffdl => [0.0, 1.0, 0.0, 1.0, 0.0, 0.0],
            PatientPosition::Ffdr => [0.0, -1.0, 0.0, -1.0, 0.0, 0.0],
        }
    }
}

/// Require that a dataset is in the given patient position.
///
/// Checks `PatientPosition` when present and always checks
/// `ImageOrientationPatient` against the expected direction cosines.
pub fn require_patient_position(
    ds: &InMemDicomObject,
    position: PatientPosition,
) -> Result<(), InvalidGeometry> {
    if let Some(stated) =
        attr::opt_string(ds, tags::PATIENT_POSITION, "PatientPosition")?
    {
        if stated != position.code() {
            return Err(InvalidGeometry::WrongPatientPosition {
                expected: position.code(),
                found: stated,
            });
        }
    }

    let orientation = attr::multi_f64(
        ds,
        tags::IMAGE_ORIENTATION_PATIENT,
        "ImageOrientationPatient",
    )?;

    if orientation != position.image_orientation() {
        return Err(InvalidGeometry::WrongPatientPosition {
            expected: position.code(),
            found: format!("{orientation:?}"),
        });
    }

    Ok(())
}
