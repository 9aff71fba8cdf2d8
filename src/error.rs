use thiserror::Error;

/// Fatal conditions of a reconstruction run.
///
/// Local, recoverable conditions (a slice that fails to load, a series with
/// too few registration samples) never surface here; they are logged and the
/// run continues.
#[derive(Debug, Error)]
pub enum SvrError {
    #[error("Reconstruction cancelled")]
    Cancelled,

    #[error("No slices could be loaded from the selected series")]
    NoUsableInput,

    #[error(
        "The region of interest does not overlap the reconstruction bounds; move or enlarge the ROI"
    )]
    EmptyIntersection,

    #[error(
        "Projected peak memory of {estimated_bytes} bytes exceeds the budget of {budget_bytes} bytes \
         even at {voxel_size_mm:.3} mm voxels; enable or shrink the ROI, raise targetVoxelSizeMm, \
         lower maxVolumeDim or reduce iterations"
    )]
    MemoryBudgetExceeded {
        estimated_bytes: u64,
        budget_bytes: u64,
        voxel_size_mm: f64,
    },

    #[error("Volume buffer holds {actual} voxels but the grid requires {expected}")]
    GridMismatch { expected: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Reconstruction worker failed: {0}")]
    Worker(String),
}
