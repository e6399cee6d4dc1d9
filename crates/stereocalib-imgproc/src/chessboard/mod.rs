//! # Chessboard detection
//!
//! Finds the inner corners of a planar chessboard calibration target and
//! pairs them with their coordinates on the target:
//!
//! 1. gaussian blur and saddle point response,
//! 2. non-maximum suppression and a ring test that keeps only X-junctions,
//! 3. sub-pixel refinement,
//! 4. lattice assembly and canonical ordering.

mod grid;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use stereocalib_image::{Image, ImageError};

use crate::color::gray_from_rgb_u8;
use crate::features::{find_peaks, saddle_response};
use crate::filter::{central_gradients, gaussian_blur, kernel_size_for_sigma};
use crate::interpolation::bilinear;
use crate::subpix::{refine_corner, SubPixParams};

/// An error type for the chessboard detector.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum DetectionError {
    /// The complete pattern was not found in the image.
    #[error("Pattern not found: {found} candidate corners, {expected} expected")]
    NotFound {
        /// Number of X-junctions detected in the image.
        found: usize,
        /// Number of inner corners of the pattern.
        expected: usize,
    },

    /// The pattern geometry or the image cannot be processed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Image buffer error.
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Geometry of a chessboard target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternGeometry {
    /// Number of inner corners along the fast axis.
    pub rows: usize,
    /// Number of inner corners along the slow axis.
    pub cols: usize,
    /// Side length of a square in world units.
    pub square_size: f64,
}

impl PatternGeometry {
    /// Create a new pattern geometry.
    pub fn new(rows: usize, cols: usize, square_size: f64) -> Self {
        Self {
            rows,
            cols,
            square_size,
        }
    }

    /// Check that the geometry describes a detectable pattern.
    pub fn validate(&self) -> Result<(), DetectionError> {
        if self.rows < 2 || self.cols < 2 {
            return Err(DetectionError::InvalidInput(format!(
                "pattern needs at least 2x2 inner corners, got {}x{}",
                self.rows, self.cols
            )));
        }
        if !(self.square_size.is_finite() && self.square_size > 0.0) {
            return Err(DetectionError::InvalidInput(format!(
                "square size must be positive, got {}",
                self.square_size
            )));
        }
        Ok(())
    }

    /// Number of inner corners.
    pub fn num_corners(&self) -> usize {
        self.rows * self.cols
    }

    /// Coordinates of the inner corners on the target plane `Z = 0`.
    ///
    /// Corner `k = j * rows + i` is at `(i * s, j * s, 0)`.
    pub fn object_points(&self) -> Vec<[f64; 3]> {
        (0..self.cols)
            .flat_map(|j| {
                (0..self.rows).map(move |i| {
                    [
                        i as f64 * self.square_size,
                        j as f64 * self.square_size,
                        0.0,
                    ]
                })
            })
            .collect()
    }
}

/// A pixel paired with the target point it images.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    /// Pixel coordinates `(u, v)`.
    pub image: [f64; 2],
    /// Target coordinates `(X, Y, Z)`.
    pub object: [f64; 3],
}

/// All correspondences found in one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternView {
    /// Size of the source image (width, height).
    pub image_size: (usize, usize),
    /// The correspondences in canonical corner order.
    pub correspondences: Vec<Correspondence>,
}

impl PatternView {
    /// Pair image corners, in canonical order, with the pattern's target points.
    pub fn from_corners(
        geometry: &PatternGeometry,
        corners: &[[f64; 2]],
        image_size: (usize, usize),
    ) -> Result<Self, DetectionError> {
        if corners.len() != geometry.num_corners() {
            return Err(DetectionError::InvalidInput(format!(
                "{} corners given for a {}x{} pattern",
                corners.len(),
                geometry.rows,
                geometry.cols
            )));
        }
        let correspondences = corners
            .iter()
            .zip(geometry.object_points())
            .map(|(image, object)| Correspondence {
                image: *image,
                object,
            })
            .collect();
        Ok(Self {
            image_size,
            correspondences,
        })
    }

    /// Number of correspondences.
    pub fn len(&self) -> usize {
        self.correspondences.len()
    }

    /// Whether the view has no correspondences.
    pub fn is_empty(&self) -> bool {
        self.correspondences.is_empty()
    }

    /// The pixel coordinates.
    pub fn image_points(&self) -> Vec<[f64; 2]> {
        self.correspondences.iter().map(|c| c.image).collect()
    }

    /// The target coordinates.
    pub fn object_points(&self) -> Vec<[f64; 3]> {
        self.correspondences.iter().map(|c| c.object).collect()
    }
}

/// Parameters of the chessboard detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChessboardParams {
    /// Standard deviation of the pre-filter, in pixels.
    pub blur_sigma: f32,
    /// Minimum saddle response relative to the strongest one.
    pub threshold_rel: f32,
    /// Radius of the non-maximum suppression.
    pub nms_radius: usize,
    /// Radius of the ring sampled around a candidate.
    pub ring_radius: f64,
    /// Minimum gray level difference on the ring.
    pub min_contrast: f32,
    /// Sub-pixel refinement parameters.
    pub subpix: SubPixParams,
    /// Maximum distance of an accepted corner to its predicted position, in grid steps.
    pub grid_tolerance: f64,
    /// Number of lattice seeds tried before giving up.
    pub max_seeds: usize,
}

impl Default for ChessboardParams {
    fn default() -> Self {
        Self {
            blur_sigma: 1.0,
            threshold_rel: 0.1,
            nms_radius: 4,
            ring_radius: 5.0,
            min_contrast: 20.0,
            subpix: SubPixParams::default(),
            grid_tolerance: 0.35,
            max_seeds: 8,
        }
    }
}

impl ChessboardParams {
    /// Set the blur standard deviation.
    pub fn with_blur_sigma(mut self, sigma: f32) -> Self {
        self.blur_sigma = sigma;
        self
    }

    /// Set the ring radius; should stay below half a square in pixels.
    pub fn with_ring_radius(mut self, radius: f64) -> Self {
        self.ring_radius = radius;
        self
    }

    /// Set the sub-pixel refinement window.
    pub fn with_subpix_window(mut self, half_window: usize) -> Self {
        self.subpix.half_window = half_window;
        self
    }

    /// Pixels near the border that the detector never reports.
    fn border(&self) -> usize {
        let ring = self.ring_radius.ceil().max(0.0) as usize + 2;
        let window = self.subpix.half_window + 2;
        let blur = kernel_size_for_sigma(self.blur_sigma) / 2;
        ring.max(window).max(blur).max(self.nms_radius)
    }
}

/// An X-junction detected in an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChessCorner {
    /// Sub-pixel position `(u, v)`.
    pub position: [f64; 2],
    /// Saddle response at the initial integer position.
    pub score: f32,
}

const RING_SAMPLES: usize = 16;

/// Detect chessboard X-junctions in a grayscale image.
///
/// The corners are returned by decreasing response.
pub fn detect_corners(
    image: &Image<u8, 1>,
    params: &ChessboardParams,
) -> Result<Vec<ChessCorner>, DetectionError> {
    let border = params.border();
    if image.cols() <= 2 * border || image.rows() <= 2 * border {
        return Err(DetectionError::InvalidInput(format!(
            "image {} is smaller than the detector footprint",
            image.size()
        )));
    }

    let src = image.cast::<f32>()?;
    let mut blurred = Image::<f32, 1>::from_size_val(image.size(), 0.0)?;
    gaussian_blur(&src, &mut blurred, params.blur_sigma)?;

    let mut response = Image::<f32, 1>::from_size_val(image.size(), 0.0)?;
    saddle_response(&blurred, &mut response)?;

    let peaks = find_peaks(&response, params.threshold_rel, params.nms_radius, border);

    let mut gx = Image::<f32, 1>::from_size_val(image.size(), 0.0)?;
    let mut gy = Image::<f32, 1>::from_size_val(image.size(), 0.0)?;
    central_gradients(&blurred, &mut gx, &mut gy)?;

    let refined: Vec<ChessCorner> = peaks
        .par_iter()
        .filter(|p| {
            is_x_junction(
                &blurred,
                [p.x as f64, p.y as f64],
                params.ring_radius,
                params.min_contrast,
            )
        })
        .filter_map(|p| {
            let position = refine_corner(&gx, &gy, [p.x as f64, p.y as f64], &params.subpix)?;
            Some(ChessCorner {
                position,
                score: p.score,
            })
        })
        .collect();

    // refinement can pull two peaks onto the same corner
    let min_dist = params.nms_radius.max(1) as f64;
    let mut corners: Vec<ChessCorner> = Vec::with_capacity(refined.len());
    for c in refined {
        let duplicate = corners.iter().any(|k| {
            let (du, dv) = (k.position[0] - c.position[0], k.position[1] - c.position[1]);
            (du * du + dv * dv).sqrt() < min_dist
        });
        if !duplicate {
            corners.push(c);
        }
    }

    log::debug!(
        "chessboard: {} response peaks, {} X-junctions",
        peaks.len(),
        corners.len()
    );

    Ok(corners)
}

/// Ring test: the samples on a circle around an X-junction alternate between
/// dark and bright exactly four times.
fn is_x_junction(image: &Image<f32, 1>, center: [f64; 2], radius: f64, min_contrast: f32) -> bool {
    let mut samples = [0.0f32; RING_SAMPLES];
    for (k, sample) in samples.iter_mut().enumerate() {
        // half-step offset keeps samples off axis-aligned edges
        let angle = (k as f64 + 0.5) * std::f64::consts::TAU / RING_SAMPLES as f64;
        let (s, c) = angle.sin_cos();
        match bilinear(image, center[0] + radius * c, center[1] + radius * s) {
            Some(v) => *sample = v,
            None => return false,
        }
    }

    let (lo, hi) = samples
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if hi - lo < min_contrast {
        return false;
    }

    let mid = 0.5 * (lo + hi);
    let transitions = (0..RING_SAMPLES)
        .filter(|&k| (samples[k] > mid) != (samples[(k + 1) % RING_SAMPLES] > mid))
        .count();
    transitions == 4
}

/// Find a chessboard pattern in a grayscale image.
///
/// # Arguments
///
/// * `image` - The grayscale image.
/// * `geometry` - The geometry of the target.
/// * `params` - The detector parameters.
///
/// # Returns
///
/// The `rows x cols` correspondences in canonical order, or
/// [`DetectionError::NotFound`] when the complete pattern is not visible.
pub fn find_pattern(
    image: &Image<u8, 1>,
    geometry: &PatternGeometry,
    params: &ChessboardParams,
) -> Result<PatternView, DetectionError> {
    geometry.validate()?;

    let corners = detect_corners(image, params)?;
    let expected = geometry.num_corners();
    let not_found = DetectionError::NotFound {
        found: corners.len(),
        expected,
    };
    if corners.len() < expected {
        return Err(not_found);
    }

    let points: Vec<[f64; 2]> = corners.iter().map(|c| c.position).collect();
    let lattice = grid::assemble_grid(
        &points,
        geometry.rows,
        geometry.cols,
        params.grid_tolerance,
        params.max_seeds,
    )
    .ok_or(not_found)?;

    let ordered: Vec<[f64; 2]> = grid::canonical_order(&lattice, &points, geometry.rows, geometry.cols)
        .into_iter()
        .map(|k| points[k])
        .collect();

    PatternView::from_corners(geometry, &ordered, (image.width(), image.height()))
}

/// Find a chessboard pattern in an RGB image.
pub fn find_pattern_rgb(
    image: &Image<u8, 3>,
    geometry: &PatternGeometry,
    params: &ChessboardParams,
) -> Result<PatternView, DetectionError> {
    let mut gray = Image::<u8, 1>::from_size_val(image.size(), 0)?;
    gray_from_rgb_u8(image, &mut gray)?;
    find_pattern(&gray, geometry, params)
}
