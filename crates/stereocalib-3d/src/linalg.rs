use crate::{Mat33, Point3};

/// The 3x3 identity matrix.
pub const IDENTITY33: Mat33 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Compute the determinant of a 3x3 matrix.
pub fn det_mat33(m: &Mat33) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Transpose a 3x3 matrix.
pub fn transpose_mat33(m: &Mat33) -> Mat33 {
    let mut t = [[0.0; 3]; 3];
    for (i, row) in m.iter().enumerate() {
        for (j, val) in row.iter().enumerate() {
            t[j][i] = *val;
        }
    }
    t
}

/// Multiply two 3x3 matrices.
pub fn mat33_mul(a: &Mat33, b: &Mat33) -> Mat33 {
    let mut c = [[0.0; 3]; 3];
    for (i, row) in c.iter_mut().enumerate() {
        for (j, val) in row.iter_mut().enumerate() {
            *val = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    c
}

/// Multiply a 3x3 matrix with a 3d vector.
pub fn mat33_mul_vec3(m: &Mat33, v: &Point3) -> Point3 {
    [
        dot_product3(&m[0], v),
        dot_product3(&m[1], v),
        dot_product3(&m[2], v),
    ]
}

/// Dot product of two 3d vectors.
pub fn dot_product3(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Cross product of two 3d vectors.
pub fn cross_vec3(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Euclidean norm of a 3d vector.
pub fn norm_vec3(v: &[f64; 3]) -> f64 {
    dot_product3(v, v).sqrt()
}

/// Skew-symmetric matrix `[v]x` such that `[v]x * w = v x w`.
pub fn skew_vec3(v: &[f64; 3]) -> Mat33 {
    [[0.0, -v[2], v[1]], [v[2], 0.0, -v[0]], [-v[1], v[0], 0.0]]
}

/// Invert a 3x3 matrix. Returns `None` when the matrix is singular.
pub fn inverse_mat33(m: &Mat33) -> Option<Mat33> {
    let det = det_mat33(m);
    if det.abs() < f64::EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;
    let mut inv = [[0.0; 3]; 3];
    for (i, row) in inv.iter_mut().enumerate() {
        for (j, val) in row.iter_mut().enumerate() {
            // cofactor of (j, i)
            let (r0, r1) = ((j + 1) % 3, (j + 2) % 3);
            let (c0, c1) = ((i + 1) % 3, (i + 2) % 3);
            *val = (m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0]) * inv_det;
        }
    }
    Some(inv)
}

/// Scale a 3x3 matrix in place so that its Frobenius norm is one.
pub fn normalize_mat33_inplace(m: &mut Mat33) {
    let norm = m.iter().flatten().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        m.iter_mut().flatten().for_each(|v| *v /= norm);
    }
}

/// Convert a 3x3 array into a faer matrix.
pub fn to_faer_mat33(m: &Mat33) -> faer::Mat<f64> {
    faer::mat![
        [m[0][0], m[0][1], m[0][2]],
        [m[1][0], m[1][1], m[1][2]],
        [m[2][0], m[2][1], m[2][2]]
    ]
}

/// Singular value decomposition `M = U diag(s) Vᵀ` of a 3x3 matrix.
#[derive(Debug, Clone, Copy)]
pub struct Svd3 {
    /// Left singular vectors (as columns).
    pub u: Mat33,
    /// Singular values in non-increasing order.
    pub s: [f64; 3],
    /// Right singular vectors (as columns).
    pub v: Mat33,
}

/// Compute the SVD of a 3x3 matrix with singular values sorted non-increasing.
pub fn svd3(m: &Mat33) -> Svd3 {
    let svd = to_faer_mat33(m).svd();
    let (u_f, v_f, s_f) = (svd.u(), svd.v(), svd.s_diagonal());

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| s_f.read(b).total_cmp(&s_f.read(a)));

    let mut u = [[0.0; 3]; 3];
    let mut v = [[0.0; 3]; 3];
    let mut s = [0.0; 3];
    for (c, &src) in order.iter().enumerate() {
        s[c] = s_f.read(src);
        for r in 0..3 {
            u[r][c] = u_f.read(r, src);
            v[r][c] = v_f.read(r, src);
        }
    }
    Svd3 { u, s, v }
}

/// Project a 3x3 matrix onto the closest rotation in the Frobenius sense.
pub fn nearest_rotation(m: &Mat33) -> Mat33 {
    let Svd3 { u, v, .. } = svd3(m);
    let vt = transpose_mat33(&v);
    let mut r = mat33_mul(&u, &vt);
    if det_mat33(&r) < 0.0 {
        let mut u_flip = u;
        for row in u_flip.iter_mut() {
            row[2] = -row[2];
        }
        r = mat33_mul(&u_flip, &vt);
    }
    r
}

/// Right null vector of a dense matrix together with its sorted singular values.
///
/// Returns the right singular vector of the smallest singular value and all
/// singular values in non-increasing order. Columns beyond the rank bound of a
/// wide matrix count as zero singular values.
pub fn null_vector(a: &faer::Mat<f64>) -> (Vec<f64>, Vec<f64>) {
    let svd = a.svd();
    let s_f = svd.s_diagonal();
    let mut singular: Vec<f64> = (0..s_f.nrows()).map(|i| s_f.read(i)).collect();

    let ncols = a.ncols();
    let idx = if ncols > singular.len() {
        ncols - 1
    } else {
        (0..singular.len())
            .min_by(|&i, &j| singular[i].total_cmp(&singular[j]))
            .unwrap_or(ncols - 1)
    };
    singular.resize(ncols, 0.0);
    singular.sort_by(|a, b| b.total_cmp(a));

    let v = svd.v();
    let null = (0..ncols).map(|r| v.read(r, idx)).collect();
    (null, singular)
}
