//! Axis-angle (Rodrigues) parametrization of 3D rotations.
//!
//! Rotations are converted through unit quaternions, which keeps both maps
//! well conditioned for small angles and close to `pi`.

use crate::Mat33;

/// Lie algebra -> rotation matrix.
pub fn exp(omega: &[f64; 3]) -> Mat33 {
    let theta = (omega[0] * omega[0] + omega[1] * omega[1] + omega[2] * omega[2]).sqrt();
    let half = 0.5 * theta;
    let (w, b) = if theta > 1e-12 {
        (half.cos(), half.sin() / theta)
    } else {
        // sin(θ/2)/θ -> 1/2 - θ²/48
        (1.0 - theta * theta / 8.0, 0.5 - theta * theta / 48.0)
    };
    quat_to_matrix(w, b * omega[0], b * omega[1], b * omega[2])
}

/// Rotation matrix -> Lie algebra.
pub fn log(r: &Mat33) -> [f64; 3] {
    let (w, x, y, z) = matrix_to_quat(r);
    let vec_norm = (x * x + y * y + z * z).sqrt();
    if vec_norm < 1e-12 {
        return [2.0 * x, 2.0 * y, 2.0 * z];
    }
    // keep the angle in [0, pi]
    let (w, x, y, z) = if w < 0.0 { (-w, -x, -y, -z) } else { (w, x, y, z) };
    let theta = 2.0 * vec_norm.atan2(w);
    let scale = theta / vec_norm;
    [x * scale, y * scale, z * scale]
}

/// Vector space -> Lie algebra.
pub fn hat(v: &[f64; 3]) -> Mat33 {
    crate::linalg::skew_vec3(v)
}

fn quat_to_matrix(w: f64, x: f64, y: f64, z: f64) -> Mat33 {
    let n = (w * w + x * x + y * y + z * z).sqrt();
    let (w, x, y, z) = (w / n, x / n, y / n, z / n);
    [
        [
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - w * z),
            2.0 * (x * z + w * y),
        ],
        [
            2.0 * (x * y + w * z),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - w * x),
        ],
        [
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            1.0 - 2.0 * (x * x + y * y),
        ],
    ]
}

fn matrix_to_quat(r: &Mat33) -> (f64, f64, f64, f64) {
    let trace = r[0][0] + r[1][1] + r[2][2];
    if trace > 0.0 {
        let s = 0.5 / (trace + 1.0).sqrt();
        (
            0.25 / s,
            (r[2][1] - r[1][2]) * s,
            (r[0][2] - r[2][0]) * s,
            (r[1][0] - r[0][1]) * s,
        )
    } else if r[0][0] > r[1][1] && r[0][0] > r[2][2] {
        let s = 2.0 * (1.0 + r[0][0] - r[1][1] - r[2][2]).sqrt();
        (
            (r[2][1] - r[1][2]) / s,
            0.25 * s,
            (r[0][1] + r[1][0]) / s,
            (r[0][2] + r[2][0]) / s,
        )
    } else if r[1][1] > r[2][2] {
        let s = 2.0 * (1.0 + r[1][1] - r[0][0] - r[2][2]).sqrt();
        (
            (r[0][2] - r[2][0]) / s,
            (r[0][1] + r[1][0]) / s,
            0.25 * s,
            (r[1][2] + r[2][1]) / s,
        )
    } else {
        let s = 2.0 * (1.0 + r[2][2] - r[0][0] - r[1][1]).sqrt();
        (
            (r[1][0] - r[0][1]) / s,
            (r[0][2] + r[2][0]) / s,
            (r[1][2] + r[2][1]) / s,
            0.25 * s,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{det_mat33, mat33_mul, transpose_mat33, IDENTITY33};
    use approx::assert_relative_eq;

    #[test]
    fn test_exp_identity() {
        let r = exp(&[0.0, 0.0, 0.0]);
        assert_eq!(r, IDENTITY33);
    }

    #[test]
    fn test_exp_about_z() {
        let r = exp(&[0.0, 0.0, std::f64::consts::FRAC_PI_2]);
        // x axis maps to y axis
        assert_relative_eq!(r[0][0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(r[1][0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(r[0][1], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_log_exp() {
        for omega in [
            [0.1, -0.2, 0.3],
            [1e-9, 2e-9, -1e-9],
            [0.0, 3.0, 0.0],
            [-1.2, 0.4, 2.1],
        ] {
            let r = exp(&omega);
            assert_relative_eq!(det_mat33(&r), 1.0, epsilon = 1e-12);
            let rrt = mat33_mul(&r, &transpose_mat33(&r));
            for i in 0..3 {
                for j in 0..3 {
                    assert_relative_eq!(rrt[i][j], IDENTITY33[i][j], epsilon = 1e-12);
                }
            }
            let back = log(&r);
            for k in 0..3 {
                assert_relative_eq!(back[k], omega[k], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_hat() {
        let h = hat(&[1.0, 2.0, 3.0]);
        assert_eq!(h[0][1], -3.0);
        assert_eq!(h[2][1], 1.0);
    }
}
