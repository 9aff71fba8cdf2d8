//! # SVR-volume library
//!
//! This crate reconstructs a single isotropic 3D intensity volume from
//! several stacks of thick 2D slices acquired in different planes (for
//! example an axial, a coronal and a sagittal MRI series of the same
//! anatomy).
//!
//! Slices are read through two small collaborator traits,
//! [`PixelSource`] and [`GeometrySource`]. A [`DicomSource`] built on the
//! dicom-rs ecosystem is provided and can be loaded from multiple
//! [`FileDicomObject<InMemDicomObject>`] or from a folder of ".dcm" files;
//! [`InMemorySource`] serves hosts that decode pixels elsewhere.
//!
//! A run goes through these stages:
//!  - Loading with an optional downsampling policy
//!  - Robust intensity normalization (optional histogram matching)
//!  - Series alignment: bounding-box centers or rigid registration scored
//!    by normalized cross-correlation inside a region of interest
//!  - Grid planning under a dimension cap and a peak-memory budget
//!  - Cropping of slices to the region of interest
//!  - Iterative reconstruction: point-spread-function aware splatting,
//!    forward projection, robust residuals and backprojection, optionally
//!    coarse-to-fine
//!
//! The run is synchronous and deterministic. [`runner`] moves it onto a
//! tokio blocking worker with progress reporting and cancellation. Element
//! wise passes are parallelized with rayon.
//!
//! # Examples
//!
//! ## Reconstructing all series of a DICOM directory
//!
//! ```no_run
//! # use svr_volume::{DicomSource, ReconstructionOptions, RunContext, run_reconstruction};
//! # use svr_volume::enums::Orientation;
//! # use std::path::PathBuf;
//! let (source, inputs) = DicomSource::load_from_directory(&PathBuf::from("dicom"))
//!     .expect("should have loaded files from directory");
//! let output = run_reconstruction(&source, &inputs, &ReconstructionOptions::default(), &RunContext::detached())
//!     .expect("should have reconstructed a volume");
//! let center = output
//!     .volume
//!     .get_slice_from_axis(output.volume.dim().0 / 2, &Orientation::Axial)
//!     .expect("should have returned the central axial plane");
//! ```
//!
//! [`FileDicomObject<InMemDicomObject>`]: https://docs.rs/dicom-object/latest/dicom_object/struct.FileDicomObject.html

pub mod alignment;
pub mod config;
pub mod cropper;
pub mod dicom_source;
pub mod enums;
pub mod error;
pub mod geometry;
pub mod grid_planner;
pub mod interpolator;
pub mod multires;
pub mod normalizer;
pub mod phantom;
pub mod pipeline;
pub mod progress;
pub mod reconstruction;
pub mod registration;
pub mod rigid;
pub mod runner;
pub mod slice;
pub mod slice_loader;
pub mod volume;

pub use config::{ReconstructionOptions, RegistrationTuning, RoiOptions, SolverOptions};
pub use dicom_source::DicomSource;
pub use error::SvrError;
pub use geometry::{Bounds, BoundsMm, Vec3};
pub use pipeline::{ReconstructionOutput, run_reconstruction};
pub use progress::{CancellationToken, Progress, RunContext};
pub use registration::{RegistrationOutcome, RegistrationReport, register_series_to_volume};
pub use rigid::{RigidParams, RigidTransform};
pub use runner::{ReconstructionHandle, spawn_reconstruction};
pub use slice::{ReconstructionSlice, SliceSeries};
pub use slice_loader::{GeometrySource, InMemorySource, PixelSource, SeriesInput, SourceError};
pub use volume::{ReconstructionGrid, Volume};
