use crate::factor::{FactorError, FactorResult};

/// Relative step used by the central differences.
const EPS: f64 = 1e-6;

/// Compute a row-major Jacobian of `residual_fn` with central differences.
///
/// Every component of every parameter block is perturbed by `±h` with
/// `h = EPS * max(1, |x|)`, so parameters of very different magnitude (focal
/// lengths and distortion coefficients) get a comparable relative step.
///
/// # Arguments
///
/// * `params` - The parameter blocks at which to differentiate.
/// * `residual_dim` - Expected length of the residual vector.
/// * `residual_fn` - The residual function.
///
/// # Returns
///
/// A `residual_dim x total_dim` matrix flattened row-major.
pub fn central_difference_jacobian<F>(
    params: &[&[f64]],
    residual_dim: usize,
    residual_fn: F,
) -> FactorResult<Vec<f64>>
where
    F: Fn(&[&[f64]]) -> FactorResult<Vec<f64>>,
{
    let total_dim: usize = params.iter().map(|p| p.len()).sum();
    let mut jacobian = vec![0.0; residual_dim * total_dim];
    let mut blocks: Vec<Vec<f64>> = params.iter().map(|p| p.to_vec()).collect();

    let mut col = 0;
    for b in 0..blocks.len() {
        for k in 0..blocks[b].len() {
            let x0 = blocks[b][k];
            let h = EPS * x0.abs().max(1.0);

            blocks[b][k] = x0 + h;
            let r_plus = evaluate(&blocks, &residual_fn, residual_dim)?;
            blocks[b][k] = x0 - h;
            let r_minus = evaluate(&blocks, &residual_fn, residual_dim)?;
            blocks[b][k] = x0;

            let inv_2h = 1.0 / (2.0 * h);
            for row in 0..residual_dim {
                jacobian[row * total_dim + col] = (r_plus[row] - r_minus[row]) * inv_2h;
            }
            col += 1;
        }
    }

    Ok(jacobian)
}

fn evaluate<F>(blocks: &[Vec<f64>], residual_fn: &F, residual_dim: usize) -> FactorResult<Vec<f64>>
where
    F: Fn(&[&[f64]]) -> FactorResult<Vec<f64>>,
{
    let views: Vec<&[f64]> = blocks.iter().map(|b| b.as_slice()).collect();
    let r = residual_fn(&views)?;
    if r.len() != residual_dim {
        return Err(FactorError::DimensionMismatch {
            expected: residual_dim,
            actual: r.len(),
        });
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_jacobian_of_polynomial() -> FactorResult<()> {
        // r = [a0 * b0^2, a1 + 3 b0]
        let a = [2.0, -1.0];
        let b = [3.0];
        let jac = central_difference_jacobian(&[&a[..], &b[..]], 2, |p: &[&[f64]]| {
            Ok(vec![p[0][0] * p[1][0] * p[1][0], p[0][1] + 3.0 * p[1][0]])
        })?;

        let expected = [9.0, 0.0, 12.0, 0.0, 1.0, 3.0];
        for (j, e) in jac.iter().zip(expected) {
            assert_relative_eq!(*j, e, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_jacobian_wrong_residual_dim() {
        let a = [1.0];
        let res = central_difference_jacobian(&[&a[..]], 2, |p: &[&[f64]]| Ok(vec![p[0][0]]));
        assert!(matches!(res, Err(FactorError::DimensionMismatch { .. })));
    }
}
