//! Run configuration. Field names follow the host's camelCase option keys so
//! a JSON options object can be deserialized directly.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::enums::{
    Orientation, PsfMode, RobustLoss, RoiMode, SeriesRegistrationMode, SliceDownsampleMode,
};
use crate::error::SvrError;
use crate::geometry::{Bounds, BoundsMm};

pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 1 << 30;

/// Region of interest drawn by the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoiOptions {
    #[serde(default)]
    pub mode: RoiMode,
    pub bounds_mm: BoundsMm,
    #[serde(default)]
    pub source_series_uid: Option<String>,
    #[serde(default)]
    pub source_plane: Orientation,
}

impl RoiOptions {
    pub fn bounds(&self) -> Bounds {
        self.bounds_mm.into()
    }
}

/// Empirical registration thresholds, overridable per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrationTuning {
    /// Series with fewer in-bounds samples are not registered.
    pub min_series_samples: usize,
    /// Candidates with fewer valid samples score −∞.
    pub min_ncc_samples: usize,
    /// Upper bound on samples drawn per series.
    pub max_samples: usize,
    /// Required NCC gain over identity before a transform is applied.
    pub accept_epsilon: f64,
    /// Required NCC gain for a coordinate-descent step to be kept.
    pub sweep_epsilon: f64,
    pub max_sweeps: usize,
    pub max_translation_mm: f64,
    pub max_rotation_deg: f64,
    /// `(translation step mm, rotation step degrees)` per stage.
    pub stages: Vec<(f64, f64)>,
}

impl Default for RegistrationTuning {
    fn default() -> Self {
        Self {
            min_series_samples: 1024,
            min_ncc_samples: 512,
            max_samples: 20_000,
            accept_epsilon: 1e-3,
            sweep_epsilon: 1e-4,
            max_sweeps: 20,
            max_translation_mm: 20.0,
            max_rotation_deg: 10.0,
            stages: vec![(2.0, 2.0), (1.0, 1.0), (0.5, 0.5)],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconstructionOptions {
    pub iterations: usize,
    pub step_size: f32,
    pub clamp_output: bool,
    pub psf_mode: PsfMode,
    pub robust_loss: RobustLoss,
    pub robust_delta: f32,
    pub laplacian_weight: f32,
    pub series_registration_mode: SeriesRegistrationMode,
    pub target_voxel_size_mm: Option<f64>,
    pub max_volume_dim: usize,
    pub slice_downsample_mode: SliceDownsampleMode,
    pub slice_downsample_max_size: usize,
    pub multi_resolution: bool,
    pub multi_resolution_factor: f64,
    pub multi_resolution_coarse_iterations: usize,
    pub roi: Option<RoiOptions>,
    /// Per-series quantile matching before the global window.
    pub histogram_match: bool,
    pub memory_budget_bytes: u64,
    /// Voxel size of the scoring volumes; twice the output voxel if unset.
    pub registration_voxel_size_mm: Option<f64>,
    /// Slab tolerance for slice cropping; derived from slice thickness and
    /// voxel size if unset.
    pub slice_crop_tolerance_mm: Option<f64>,
    pub registration: RegistrationTuning,
}

impl Default for ReconstructionOptions {
    fn default() -> Self {
        Self {
            iterations: 4,
            step_size: 0.8,
            clamp_output: true,
            psf_mode: PsfMode::Gaussian,
            robust_loss: RobustLoss::Huber,
            robust_delta: 0.1,
            laplacian_weight: 0.0,
            series_registration_mode: SeriesRegistrationMode::None,
            target_voxel_size_mm: None,
            max_volume_dim: 256,
            slice_downsample_mode: SliceDownsampleMode::VoxelAware,
            slice_downsample_max_size: 256,
            multi_resolution: false,
            multi_resolution_factor: 2.0,
            multi_resolution_coarse_iterations: 2,
            roi: None,
            histogram_match: false,
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            registration_voxel_size_mm: None,
            slice_crop_tolerance_mm: None,
            registration: RegistrationTuning::default(),
        }
    }
}

impl ReconstructionOptions {
    pub fn from_json_str(json: &str) -> Result<Self, SvrError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SvrError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Rejects values the solver cannot run with.
    pub fn validate(&self) -> Result<(), SvrError> {
        let fail = |msg: &str| Err(SvrError::InvalidConfig(msg.to_string()));

        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return fail("stepSize must be a positive number");
        }
        if !(self.robust_delta.is_finite() && self.robust_delta > 0.0) {
            return fail("robustDelta must be a positive number");
        }
        if !(self.laplacian_weight.is_finite() && (0.0..=1.0 / 6.0).contains(&self.laplacian_weight)) {
            return fail("laplacianWeight must lie in [0, 1/6]");
        }
        if let Some(v) = self.target_voxel_size_mm {
            if !(v.is_finite() && v > 0.0) {
                return fail("targetVoxelSizeMm must be a positive number");
            }
        }
        if let Some(v) = self.registration_voxel_size_mm {
            if !(v.is_finite() && v > 0.0) {
                return fail("registrationVoxelSizeMm must be a positive number");
            }
        }
        if self.max_volume_dim < 4 {
            return fail("maxVolumeDim must be at least 4");
        }
        if self.slice_downsample_max_size == 0 {
            return fail("sliceDownsampleMaxSize must be positive");
        }
        let factor = self.multi_resolution_factor;
        if self.multi_resolution && !(factor.is_finite() && factor > 1.0) {
            return fail("multiResolutionFactor must be greater than 1");
        }
        if self.memory_budget_bytes == 0 {
            return fail("memoryBudgetBytes must be positive");
        }
        if let Some(roi) = &self.roi {
            if roi.bounds().is_empty() {
                return fail("roi.boundsMm must contain finite coordinates");
            }
        }
        let tuning = &self.registration;
        if tuning.stages.iter().any(|(t, r)| !(*t > 0.0 && *r > 0.0)) {
            return fail("registration stages must use positive step sizes");
        }
        Ok(())
    }

    pub fn solver(&self) -> SolverOptions {
        SolverOptions {
            iterations: self.iterations,
            step_size: self.step_size,
            clamp_output: self.clamp_output,
            psf_mode: self.psf_mode,
            robust_loss: self.robust_loss,
            robust_delta: self.robust_delta,
            laplacian_weight: self.laplacian_weight,
        }
    }
}

/// The subset of options the reconstruction core reads.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolverOptions {
    pub iterations: usize,
    pub step_size: f32,
    pub clamp_output: bool,
    pub psf_mode: PsfMode,
    pub robust_loss: RobustLoss,
    pub robust_delta: f32,
    pub laplacian_weight: f32,
}

impl SolverOptions {
    /// Normalized backprojection only: no refinement, no PSF.
    pub fn backprojection_only() -> Self {
        Self {
            iterations: 0,
            psf_mode: PsfMode::None,
            ..ReconstructionOptions::default().solver()
        }
    }
}

impl Default for SolverOptions {
    fn default() -> Self {
        ReconstructionOptions::default().solver()
    }
}
