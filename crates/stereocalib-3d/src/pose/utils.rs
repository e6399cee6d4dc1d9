use crate::{Mat33, Point2};

/// Normalize points with a similarity so that they have zero mean and an
/// average distance of `sqrt(2)` to the origin.
///
/// Returns the normalized points and the similarity `T` with `x_n = T x`.
pub fn normalize_points_2d(x: &[Point2]) -> (Vec<Point2>, Mat33) {
    let n = x.len().max(1) as f64;
    let (mx, my) = x
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
    let (mx, my) = (mx / n, my / n);

    let mean_dist = x
        .iter()
        .map(|p| ((p[0] - mx).powi(2) + (p[1] - my).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > 0.0 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let xn = x
        .iter()
        .map(|p| [(p[0] - mx) * scale, (p[1] - my) * scale])
        .collect();

    let t = [
        [scale, 0.0, -scale * mx],
        [0.0, scale, -scale * my],
        [0.0, 0.0, 1.0],
    ];
    (xn, t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalize_points_2d() {
        let x = [[10.0, 10.0], [12.0, 10.0], [12.0, 14.0], [10.0, 14.0]];
        let (xn, t) = normalize_points_2d(&x);

        let mean = xn.iter().fold([0.0, 0.0], |a, p| [a[0] + p[0], a[1] + p[1]]);
        assert_relative_eq!(mean[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(mean[1], 0.0, epsilon = 1e-12);

        let avg = xn.iter().map(|p| (p[0] * p[0] + p[1] * p[1]).sqrt()).sum::<f64>() / 4.0;
        assert_relative_eq!(avg, std::f64::consts::SQRT_2, epsilon = 1e-12);

        let p = crate::linalg::mat33_mul_vec3(&t, &[x[2][0], x[2][1], 1.0]);
        assert_relative_eq!(p[0], xn[2][0], epsilon = 1e-12);
        assert_relative_eq!(p[1], xn[2][1], epsilon = 1e-12);
    }
}
