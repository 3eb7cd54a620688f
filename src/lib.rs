//! # dicom-rtqa
//!
//! Radiotherapy QA engines on top of the dicom-rs ecosystem: quantitative
//! comparison of planned and delivered radiation from DICOM-RT objects
//! and binary linac trajectory logs.
//!
//! The crate is built around three tightly coupled subsystems:
//!
//!  - the **gamma engine** ([`gamma`]): a 3D dosimetric similarity metric
//!    combining dose difference and distance to agreement, computed with
//!    a memory-bounded interpolating shell search;
//!  - the **metersetmap engine** ([`metersetmap`]): reconstruction of the
//!    deliverable fluence from MLC and jaw trajectories weighted by
//!    monitor units, on a regular grid at the isocentre;
//!  - the **delivery bridge** ([`delivery`], [`rtplan`],
//!    [`trajectory_log`]): one canonical per-control-point representation
//!    of a beam that can be read from an RT Plan or a trajectory log and
//!    written back into an RT Plan template.
//!
//! Around those sit the dose-grid services ([`dose`]), structure-set
//! services ([`structure`]) and a keyword-driven anonymisation core
//! ([`anonymise`]).
//!
//! All engines are synchronous, CPU-bound and free of process-wide
//! mutable state, so they are safe to drive from a worker pool. No
//! operation performs I/O beyond reading a caller-supplied path or byte
//! buffer.
//!
//! # Examples
//!
//! Reconstruct the fluence delivered by an RT Plan:
//!
//! ```no_run
//! # use dicom_rtqa::{Delivery, metersetmap::MetersetMapConfig};
//! let plan = dicom::object::open_file("plan.dcm").unwrap();
//! let delivery = Delivery::from_dicom(&plan, None).unwrap();
//! let map = delivery.metersetmap(&MetersetMapConfig::default()).unwrap();
//! println!("{} MU through the central pixel", map.values[[8, 5]]);
//! ```
//!
//! Compare two dose grids with a 3%/3mm gamma:
//!
//! ```no_run
//! # use dicom_rtqa::{DoseGrid, gamma::{GammaOptions, gamma_shell}};
//! let reference = dicom::object::open_file("planned.dcm").unwrap();
//! let evaluation = dicom::object::open_file("delivered.dcm").unwrap();
//!
//! let reference = DoseGrid::from_dataset(&reference).unwrap();
//! let evaluation = DoseGrid::from_dataset(&evaluation).unwrap();
//!
//! let gamma = gamma_shell(
//!     reference.zyx_axes(),
//!     reference.dose().view(),
//!     evaluation.zyx_axes(),
//!     evaluation.dose().view(),
//!     &GammaOptions::new(3.0, 3.0),
//! )
//! .unwrap();
//! ```

pub mod anonymise;
mod attr;
pub mod controlpoints;
pub mod coords;
pub mod delivery;
pub mod dose;
pub mod gamma;
pub mod interp;
pub mod metersetmap;
pub mod orientation;
pub mod rtplan;
pub mod structure;
pub mod trajectory_log;

#[cfg(test)]
mod test_data;

pub use attr::AttrError;
pub use coords::{CoordSystem, InvalidGeometry, Point};
pub use delivery::Delivery;
pub use dose::{DoseGrid, DoseUnits};
pub use gamma::{GammaOptions, gamma_shell};
pub use metersetmap::{MetersetMap, MetersetMapConfig, calc_metersetmap};
pub use rtplan::InvalidPlan;
pub use trajectory_log::{InvalidLogEncoding, TrajectoryLog};
