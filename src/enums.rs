use serde::{Deserialize, Serialize};

/// Anatomical cutting plane of a slice stack or an output view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Axial,
    Coronal,
    Sagittal,
}

/// Point-spread function modelled along each slice normal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsfMode {
    #[default]
    None,
    Box,
    Gaussian,
}

/// Residual weighting used during iterative refinement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobustLoss {
    None,
    #[default]
    Huber,
    Tukey,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeriesRegistrationMode {
    #[default]
    None,
    BoundsCenter,
    RoiRigid,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SliceDownsampleMode {
    Fixed,
    #[default]
    VoxelAware,
}

/// How a region of interest constrains the run.
///
/// `Hard` clips the reconstruction bounds and crops slices, `Guide` only
/// steers registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiMode {
    #[default]
    Hard,
    Guide,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Loading,
    Initializing,
    Reconstructing,
    Finalizing,
}
