use stereocalib_3d::pose::{EssentialError, HomographyError};
use stereocalib_imgproc::chessboard::DetectionError;
use stereocalib_optim::{OptimizerError, ProblemError};

/// An error type for the calibration routines.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    /// Fewer usable views than the calibration requires.
    #[error("Insufficient data: {obtained} usable views, {required} required")]
    InsufficientData {
        /// Number of usable views.
        obtained: usize,
        /// Minimum number of views.
        required: usize,
    },

    /// The solver exhausted its iteration budget.
    #[error("Calibration did not converge after {iterations} iterations (rms {rms:.4} px)")]
    ConvergenceFailure {
        /// Iterations performed.
        iterations: usize,
        /// Reprojection RMS at termination, in pixels.
        rms: f64,
    },

    /// Only one camera saw the pattern in a frame.
    #[error("Frame {index} has a pattern view in only one camera")]
    PartialFrame {
        /// Index of the frame.
        index: usize,
    },

    /// The two views of a frame do not describe the same pattern points.
    #[error("Frame {index}: {reason}")]
    MismatchedViews {
        /// Index of the frame.
        index: usize,
        /// What differs between the views.
        reason: String,
    },

    /// The two cameras delivered different numbers of frames.
    #[error("Frame count mismatch: {left} left and {right} right images")]
    FrameCountMismatch {
        /// Number of left images.
        left: usize,
        /// Number of right images.
        right: usize,
    },

    /// A view cannot be used for calibration.
    #[error("View {index}: {reason}")]
    InvalidView {
        /// Index of the view.
        index: usize,
        /// Why the view was rejected.
        reason: String,
    },

    /// No valid initial estimate could be computed.
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Homography estimation failed.
    #[error(transparent)]
    Homography(#[from] HomographyError),

    /// Essential matrix estimation failed.
    #[error(transparent)]
    Essential(#[from] EssentialError),

    /// Pattern detection failed.
    #[error(transparent)]
    Detection(#[from] DetectionError),

    /// The optimization problem could not be built.
    #[error(transparent)]
    Problem(#[from] ProblemError),

    /// The solver failed.
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}
