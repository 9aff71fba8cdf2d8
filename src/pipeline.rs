//! End-to-end reconstruction: load, normalize, align, plan, crop, solve.

use log::{debug, info};
use web_time::Instant;

use crate::alignment::{align_bounds_centers, select_reference};
use crate::config::ReconstructionOptions;
use crate::cropper::crop_series;
use crate::enums::{ProgressPhase, RoiMode, SeriesRegistrationMode};
use crate::error::SvrError;
use crate::geometry::Bounds;
use crate::grid_planner::GridPlanner;
use crate::multires::MultiResolution;
use crate::normalizer::{IntensityNormalizer, IntensityWindow};
use crate::progress::RunContext;
use crate::reconstruction::reconstruct;
use crate::registration::{RegistrationReport, register_series_roi_rigid};
use crate::slice::{ReconstructionSlice, SliceSeries};
use crate::slice_loader::{GeometrySource, PixelSource, SeriesInput, SliceLoader};
use crate::volume::{ReconstructionGrid, Volume};

/// Result of a successful run.
#[derive(Clone, Debug)]
pub struct ReconstructionOutput {
    /// Normalized intensities in [0, 1] on the planned grid.
    pub volume: Volume,
    /// World box the grid was planned over.
    pub bounds: Bounds,
    /// One entry per registered series, in registration order.
    pub registration: Vec<RegistrationReport>,
    pub intensity_window: IntensityWindow,
    pub slices_used: usize,
}

impl ReconstructionOutput {
    pub fn grid(&self) -> &ReconstructionGrid {
        &self.volume.grid
    }
}

/// Runs the whole pipeline synchronously. Checks `ctx` for cancellation
/// between slices, series and iterations.
pub fn run_reconstruction<S: PixelSource + GeometrySource + ?Sized>(
    source: &S,
    inputs: &[SeriesInput],
    options: &ReconstructionOptions,
    ctx: &RunContext,
) -> Result<ReconstructionOutput, SvrError> {
    options.validate()?;
    let run_started = Instant::now();

    let mut series = load_all(source, inputs, options, ctx)?;

    ctx.check_cancelled()?;
    ctx.report(ProgressPhase::Initializing, 0, 4, "Normalizing intensities");
    let intensity_window = IntensityNormalizer::new(options.histogram_match).normalize(&mut series);

    let reference = select_reference(&series, options.roi.as_ref()).ok_or(SvrError::NoUsableInput)?;
    info!(
        "Reference series {} ({} slices)",
        series[reference].series_uid,
        series[reference].len()
    );
    if let Some(roi) = &options.roi {
        debug!(
            "ROI ({:?} mode) drawn on the {:?} plane of {}",
            roi.mode,
            roi.source_plane,
            roi.source_series_uid.as_deref().unwrap_or("an unknown series")
        );
    }

    let voxel_size_mm = options
        .target_voxel_size_mm
        .unwrap_or_else(|| min_pixel_spacing(&series));
    let planner = GridPlanner::from_options(options);

    ctx.check_cancelled()?;
    ctx.report(ProgressPhase::Initializing, 1, 4, "Aligning series");
    let registration = align_series(&mut series, reference, voxel_size_mm, &planner, options, ctx)?;

    ctx.check_cancelled()?;
    ctx.report(ProgressPhase::Initializing, 2, 4, "Planning grid");
    let data_bounds = data_bounds(&series);
    let bounds = match &options.roi {
        Some(roi) if roi.mode == RoiMode::Hard => restrict_to_roi(&data_bounds, options)?,
        Some(_) => {
            restrict_to_roi(&data_bounds, options)?;
            data_bounds
        }
        None => data_bounds,
    };
    let grid = planner.plan(&bounds, voxel_size_mm, options.iterations)?;
    info!(
        "Output grid {}x{}x{} at {:.3} mm, origin {:?}",
        grid.nx, grid.ny, grid.nz, grid.voxel_size_mm, grid.origin_mm
    );

    if options.roi.as_ref().is_some_and(|r| r.mode == RoiMode::Hard) {
        ctx.report(ProgressPhase::Initializing, 3, 4, "Cropping slices to the ROI");
        let voxel = grid.voxel_size_mm;
        let kept = crop_series(&mut series, &bounds, |slice| {
            options
                .slice_crop_tolerance_mm
                .unwrap_or_else(|| 0.5 * slice.effective_thickness_mm() + voxel)
        });
        if kept == 0 {
            return Err(SvrError::NoUsableInput);
        }
    }

    let slices: Vec<&ReconstructionSlice> = series.iter().flat_map(|s| s.slices.iter()).collect();
    info!("Reconstructing from {} slices", slices.len());
    let solve_started = Instant::now();
    let solver = options.solver();
    let volume = if options.multi_resolution {
        MultiResolution::new(options.multi_resolution_factor, options.multi_resolution_coarse_iterations)
            .reconstruct(&slices, &planner, &bounds, &grid, &solver, ctx)?
    } else {
        reconstruct(&slices, &grid, &solver, ctx)?
    };
    debug!("Solve took {:?}", solve_started.elapsed());

    ctx.check_cancelled()?;
    ctx.report(ProgressPhase::Finalizing, 1, 1, "Reconstruction complete");
    info!("Reconstruction finished in {:?}", run_started.elapsed());

    Ok(ReconstructionOutput {
        slices_used: slices.len(),
        volume,
        bounds,
        registration,
        intensity_window,
    })
}

fn load_all<S: PixelSource + GeometrySource + ?Sized>(
    source: &S,
    inputs: &[SeriesInput],
    options: &ReconstructionOptions,
    ctx: &RunContext,
) -> Result<Vec<SliceSeries>, SvrError> {
    let started = Instant::now();
    let loader = SliceLoader::new(
        options.slice_downsample_mode,
        options.slice_downsample_max_size,
        options.target_voxel_size_mm,
    );

    let mut series = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        ctx.report(
            ProgressPhase::Loading,
            i,
            inputs.len(),
            format!("Loading series {}/{}", i + 1, inputs.len()),
        );
        let loaded = loader.load_series(source, input, ctx)?;
        if loaded.is_empty() {
            info!("Series {} has no usable slices, ignored", input.series_uid);
            continue;
        }
        series.push(loaded);
    }

    if series.is_empty() {
        return Err(SvrError::NoUsableInput);
    }
    info!(
        "Loaded {} slices from {} series in {:?}",
        series.iter().map(SliceSeries::len).sum::<usize>(),
        series.len(),
        started.elapsed()
    );
    Ok(series)
}

fn align_series(
    series: &mut [SliceSeries],
    reference: usize,
    voxel_size_mm: f64,
    planner: &GridPlanner,
    options: &ReconstructionOptions,
    ctx: &RunContext,
) -> Result<Vec<RegistrationReport>, SvrError> {
    match options.series_registration_mode {
        SeriesRegistrationMode::None => Ok(Vec::new()),
        SeriesRegistrationMode::BoundsCenter => {
            align_bounds_centers(series, reference);
            Ok(Vec::new())
        }
        SeriesRegistrationMode::RoiRigid => {
            if series.len() < 2 {
                return Ok(Vec::new());
            }
            let started = Instant::now();
            let region = restrict_to_roi(&data_bounds(series), options)?;
            let registration_voxel = options
                .registration_voxel_size_mm
                .unwrap_or(2.0 * voxel_size_mm);
            let grid = planner.plan(&region, registration_voxel, 0)?;
            let reports =
                register_series_roi_rigid(series, reference, &region, &grid, &options.registration, ctx)?;
            info!("Registered {} series in {:?}", reports.len(), started.elapsed());
            Ok(reports)
        }
    }
}

fn data_bounds(series: &[SliceSeries]) -> Bounds {
    series.iter().fold(Bounds::empty(), |acc, s| acc.union(&s.bounds()))
}

fn min_pixel_spacing(series: &[SliceSeries]) -> f64 {
    series
        .iter()
        .flat_map(|s| s.slices.iter())
        .map(ReconstructionSlice::min_pixel_spacing_mm)
        .fold(f64::INFINITY, f64::min)
}

/// `bounds ∩ roi` when an ROI is configured, `bounds` otherwise.
fn restrict_to_roi(bounds: &Bounds, options: &ReconstructionOptions) -> Result<Bounds, SvrError> {
    match &options.roi {
        Some(roi) => bounds.intersect(&roi.bounds()).ok_or(SvrError::EmptyIntersection),
        None => Ok(*bounds),
    }
}
