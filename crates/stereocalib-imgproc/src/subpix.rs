use serde::{Deserialize, Serialize};
use stereocalib_image::Image;

use crate::interpolation::bilinear;

/// Parameters of the iterative sub-pixel corner refinement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubPixParams {
    /// Half size of the search window in pixels.
    pub half_window: usize,
    /// Maximum number of iterations.
    pub max_iterations: usize,
    /// Stop when the corner moves less than this, in pixels.
    pub epsilon: f64,
}

impl Default for SubPixParams {
    fn default() -> Self {
        Self {
            half_window: 5,
            max_iterations: 20,
            epsilon: 1e-3,
        }
    }
}

/// Refine the location of a corner to sub-pixel accuracy.
///
/// Every vector from the corner `c` to a point `q` in its neighbourhood is
/// orthogonal to the image gradient at `q`. Each iteration solves the
/// gaussian-weighted least-squares system
///
/// ```text
/// Σ w G(q) G(q)ᵀ · c = Σ w G(q) G(q)ᵀ · q
/// ```
///
/// and recentres the window on the new estimate.
///
/// # Arguments
///
/// * `gx` - The horizontal image gradient.
/// * `gy` - The vertical image gradient.
/// * `corner` - The initial corner estimate `(u, v)`.
/// * `params` - The refinement parameters.
///
/// Returns `None` when the system is singular, the window leaves the image or
/// the corner drifts farther than the window size.
pub fn refine_corner(
    gx: &Image<f32, 1>,
    gy: &Image<f32, 1>,
    corner: [f64; 2],
    params: &SubPixParams,
) -> Option<[f64; 2]> {
    let win = params.half_window as isize;
    let sigma = (params.half_window as f64 / 2.0).max(1.0);
    let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);

    let mut c = corner;
    for _ in 0..params.max_iterations {
        let (mut a11, mut a12, mut a22) = (0.0, 0.0, 0.0);
        let (mut b1, mut b2) = (0.0, 0.0);

        for dy in -win..=win {
            for dx in -win..=win {
                let (fx, fy) = (dx as f64, dy as f64);
                let (qx, qy) = (c[0] + fx, c[1] + fy);
                let gxq = bilinear(gx, qx, qy)? as f64;
                let gyq = bilinear(gy, qx, qy)? as f64;

                let w = (-(fx * fx + fy * fy) * inv_two_sigma_sq).exp();
                let gxx = w * gxq * gxq;
                let gxy = w * gxq * gyq;
                let gyy = w * gyq * gyq;

                a11 += gxx;
                a12 += gxy;
                a22 += gyy;
                b1 += gxx * qx + gxy * qy;
                b2 += gxy * qx + gyy * qy;
            }
        }

        let det = a11 * a22 - a12 * a12;
        if det.abs() <= f64::EPSILON * (a11 * a22).abs().max(1.0) {
            return None;
        }
        let next = [(a22 * b1 - a12 * b2) / det, (a11 * b2 - a12 * b1) / det];
        let shift = ((next[0] - c[0]).powi(2) + (next[1] - c[1]).powi(2)).sqrt();
        c = next;
        if shift < params.epsilon {
            break;
        }
    }

    let drift = ((c[0] - corner[0]).powi(2) + (c[1] - corner[1]).powi(2)).sqrt();
    (drift <= params.half_window as f64).then_some(c)
}
