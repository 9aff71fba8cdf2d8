//! Rigid series-to-volume registration scored by normalized
//! cross-correlation.
//!
//! A moving series is summarized by a bounded set of (intensity, position)
//! samples inside the registration region. Candidate transforms rotate those
//! positions about the region center, translate them, and read the
//! reference volume trilinearly. A staged coordinate descent over the six
//! parameters keeps the best score; the result is applied only when it beats
//! the identity by a margin.

use log::{debug, info, warn};
use serde::Serialize;
use web_time::Instant;

use crate::config::{RegistrationTuning, SolverOptions};
use crate::enums::ProgressPhase;
use crate::error::SvrError;
use crate::geometry::{Bounds, Vec3};
use crate::interpolator::{Interpolator, Support};
use crate::progress::RunContext;
use crate::reconstruction::reconstruct;
use crate::rigid::{RigidParams, RigidTransform};
use crate::slice::{ReconstructionSlice, SliceSeries};
use crate::volume::{ReconstructionGrid, Volume};

/// Transient samples of one series, used only for scoring.
#[derive(Clone, Debug, Default)]
pub struct SeriesSamples {
    pub intensities: Vec<f32>,
    pub positions: Vec<Vec3>,
}

impl SeriesSamples {
    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RegistrationOutcome {
    Applied {
        params: RigidParams,
        identity_ncc: f64,
        optimized_ncc: f64,
    },
    /// The optimum did not beat the identity by enough; series untouched.
    Rejected { identity_ncc: f64, optimized_ncc: f64 },
    InsufficientSamples { available: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegistrationReport {
    pub series_uid: String,
    #[serde(flatten)]
    pub outcome: RegistrationOutcome,
}

/// Pixels of `series` whose centers fall inside `bounds`, on a 2D stride
/// chosen from the in-bounds pixel count so roughly `max_samples` remain,
/// then decimated to at most `max_samples`.
pub fn extract_samples(series: &SliceSeries, bounds: &Bounds, max_samples: usize) -> SeriesSamples {
    let max_samples = max_samples.max(1);
    let inside = |slice: &ReconstructionSlice, r: usize, c: usize| {
        let p = slice.world_at(r as f64, c as f64);
        bounds.contains(&p).then_some(p)
    };

    let in_bounds: usize = series
        .slices
        .iter()
        .map(|slice| {
            let (rows, cols) = slice.dim();
            (0..rows)
                .flat_map(|r| (0..cols).map(move |c| (r, c)))
                .filter(|&(r, c)| inside(slice, r, c).is_some())
                .count()
        })
        .sum();
    let stride = ((in_bounds as f64 / max_samples as f64).sqrt().ceil() as usize).max(1);

    let mut samples = SeriesSamples::default();
    for slice in &series.slices {
        let (rows, cols) = slice.dim();
        for r in (0..rows).step_by(stride) {
            for c in (0..cols).step_by(stride) {
                if let Some(p) = inside(slice, r, c) {
                    samples.intensities.push(slice.pixels[[r, c]]);
                    samples.positions.push(p);
                }
            }
        }
    }

    if samples.len() > max_samples {
        let step = samples.len().div_ceil(max_samples);
        samples = SeriesSamples {
            intensities: samples.intensities.into_iter().step_by(step).collect(),
            positions: samples.positions.into_iter().step_by(step).collect(),
        };
    }
    samples
}

/// NCC between the samples and the reference read at the transformed
/// positions. Samples landing outside the reference are skipped; fewer
/// than `min_samples` valid pairs, or a flat signal, score −∞.
pub fn ncc(
    samples: &SeriesSamples,
    reference: &Volume,
    transform: &RigidTransform,
    min_samples: usize,
) -> f64 {
    let Ok(data) = reference.as_slice() else {
        return f64::NEG_INFINITY;
    };
    let grid = reference.grid;
    let dims = grid.dims();

    let (mut n, mut sa, mut sb, mut saa, mut sbb, mut sab) = (0usize, 0.0, 0.0, 0.0, 0.0, 0.0);
    for (value, position) in samples.intensities.iter().zip(&samples.positions) {
        let v = grid.world_to_voxel(&transform.apply_point(position));
        let Some(stencil) = Interpolator::stencil(dims, v.x, v.y, v.z, Support::Inclusive) else {
            continue;
        };
        let a = *value as f64;
        let b = stencil.sample(data) as f64;
        n += 1;
        sa += a;
        sb += b;
        saa += a * a;
        sbb += b * b;
        sab += a * b;
    }
    if n < min_samples.max(2) {
        return f64::NEG_INFINITY;
    }

    let nf = n as f64;
    let cov = sab - sa * sb / nf;
    let var_a = saa - sa * sa / nf;
    let var_b = sbb - sb * sb / nf;
    let denom = (var_a * var_b).sqrt();
    if !(denom > 1e-12) {
        return f64::NEG_INFINITY;
    }
    cov / denom
}

/// Staged coordinate descent over [`RigidParams`].
pub struct RigidOptimizer<'a> {
    samples: &'a SeriesSamples,
    reference: &'a Volume,
    pivot: Vec3,
    tuning: &'a RegistrationTuning,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OptimizerResult {
    pub params: RigidParams,
    pub identity_ncc: f64,
    pub optimized_ncc: f64,
    pub evaluations: usize,
}

impl<'a> RigidOptimizer<'a> {
    pub fn new(
        samples: &'a SeriesSamples,
        reference: &'a Volume,
        pivot: Vec3,
        tuning: &'a RegistrationTuning,
    ) -> Self {
        Self {
            samples,
            reference,
            pivot,
            tuning,
        }
    }

    pub fn score(&self, params: &RigidParams) -> f64 {
        let transform = RigidTransform::new(params, self.pivot);
        ncc(self.samples, self.reference, &transform, self.tuning.min_ncc_samples)
    }

    pub fn optimize(&self, ctx: &RunContext) -> Result<OptimizerResult, SvrError> {
        let t_max = self.tuning.max_translation_mm;
        let r_max = self.tuning.max_rotation_deg.to_radians();
        let limits = [t_max, t_max, t_max, r_max, r_max, r_max];

        let identity_ncc = self.score(&RigidParams::identity());
        let mut best = RigidParams::identity().to_array();
        let mut best_score = identity_ncc;
        let mut evaluations = 1;

        for (stage, &(t_step, r_step_deg)) in self.tuning.stages.iter().enumerate() {
            let r_step = r_step_deg.to_radians();
            let steps = [t_step, t_step, t_step, r_step, r_step, r_step];

            for sweep in 0..self.tuning.max_sweeps {
                ctx.check_cancelled()?;
                let mut improved = false;
                for k in 0..RigidParams::COUNT {
                    for direction in [1.0, -1.0] {
                        let mut candidate = best;
                        candidate[k] = (candidate[k] + direction * steps[k]).clamp(-limits[k], limits[k]);
                        if candidate[k] == best[k] {
                            continue;
                        }
                        let s = self.score(&RigidParams::from_array(candidate));
                        evaluations += 1;
                        if s > best_score + self.tuning.sweep_epsilon {
                            best = candidate;
                            best_score = s;
                            improved = true;
                            // −step only when +step did not help.
                            break;
                        }
                    }
                }
                if !improved {
                    debug!("Stage {stage} converged after {sweep} sweeps at NCC {best_score:.5}");
                    break;
                }
            }
        }

        Ok(OptimizerResult {
            params: RigidParams::from_array(best),
            identity_ncc,
            optimized_ncc: best_score,
            evaluations,
        })
    }
}

/// Registers one series against a fixed reference volume, rotating about
/// the center of `bounds`. The series is modified only when the optimum
/// beats the identity by `tuning.accept_epsilon`.
pub fn register_series_to_volume(
    series: &mut SliceSeries,
    reference: &Volume,
    bounds: &Bounds,
    tuning: &RegistrationTuning,
    ctx: &RunContext,
) -> Result<RegistrationOutcome, SvrError> {
    ctx.check_cancelled()?;
    let samples = extract_samples(series, bounds, tuning.max_samples);
    if samples.len() < tuning.min_series_samples {
        warn!(
            "Series {}: {} samples inside the registration region, need {}; not registered",
            series.series_uid,
            samples.len(),
            tuning.min_series_samples
        );
        return Ok(RegistrationOutcome::InsufficientSamples {
            available: samples.len(),
        });
    }

    let pivot = bounds.center();
    let started = Instant::now();
    let result = RigidOptimizer::new(&samples, reference, pivot, tuning).optimize(ctx)?;
    debug!(
        "Series {}: {} evaluations over {} samples in {:?}",
        series.series_uid,
        result.evaluations,
        samples.len(),
        started.elapsed()
    );

    if !result.params.is_identity() && result.optimized_ncc > result.identity_ncc + tuning.accept_epsilon {
        series.apply_rigid(&RigidTransform::new(&result.params, pivot));
        info!(
            "Series {}: NCC {:.4} -> {:.4}, applied {:?}",
            series.series_uid, result.identity_ncc, result.optimized_ncc, result.params
        );
        Ok(RegistrationOutcome::Applied {
            params: result.params,
            identity_ncc: result.identity_ncc,
            optimized_ncc: result.optimized_ncc,
        })
    } else {
        info!(
            "Series {}: NCC {:.4} -> {:.4}, kept original geometry",
            series.series_uid, result.identity_ncc, result.optimized_ncc
        );
        Ok(RegistrationOutcome::Rejected {
            identity_ncc: result.identity_ncc,
            optimized_ncc: result.optimized_ncc,
        })
    }
}

/// Registers every non-reference series, in order, against a volume
/// backprojected from all the other series at their current positions.
/// Earlier updates therefore influence later references.
pub fn register_series_roi_rigid(
    series: &mut [SliceSeries],
    reference_index: usize,
    bounds: &Bounds,
    grid: &ReconstructionGrid,
    tuning: &RegistrationTuning,
    ctx: &RunContext,
) -> Result<Vec<RegistrationReport>, SvrError> {
    let mut reports = Vec::new();
    let total = series.len();
    let solver = SolverOptions::backprojection_only();

    for i in 0..total {
        if i == reference_index || series[i].is_empty() {
            continue;
        }
        ctx.check_cancelled()?;
        ctx.report(
            ProgressPhase::Initializing,
            i + 1,
            total,
            format!("Registering series {}/{total}", i + 1),
        );

        let reference = {
            let others: Vec<&ReconstructionSlice> = series
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .flat_map(|(_, s)| s.slices.iter())
                .collect();
            reconstruct(&others, grid, &solver, &ctx.silent())?
        };

        let outcome = register_series_to_volume(&mut series[i], &reference, bounds, tuning, ctx)?;
        reports.push(RegistrationReport {
            series_uid: series[i].series_uid.clone(),
            outcome,
        });
    }
    Ok(reports)
}
