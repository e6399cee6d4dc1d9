//! Factor trait for nonlinear least squares
//!
//! Factors represent measurements or constraints. Each factor computes a
//! residual and optionally a Jacobian with respect to the connected variables.

use thiserror::Error;

/// Errors raised while evaluating a factor.
#[derive(Debug, Error)]
pub enum FactorError {
    /// Invalid dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Dimension that was provided.
        actual: usize,
    },

    /// Jacobian computation failed
    #[error("Jacobian computation failed: {0}")]
    JacobianFailed(String),

    /// Invalid parameter values
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Result type for factor operations
pub type FactorResult<T> = Result<T, FactorError>;

/// Output of factor linearization
#[derive(Debug, Clone)]
pub struct LinearizationResult {
    /// Residual vector (error)
    pub residual: Vec<f64>,
    /// Jacobian matrix (row-major, flattened)
    /// Shape: (residual_dim, total_dim)
    pub jacobian: Option<Vec<f64>>,
    /// Total dimension of the connected variables (number of Jacobian columns)
    pub total_dim: usize,
}

impl LinearizationResult {
    /// Create a new linearization result
    pub fn new(residual: Vec<f64>, jacobian: Option<Vec<f64>>, total_dim: usize) -> Self {
        Self {
            residual,
            jacobian,
            total_dim,
        }
    }

    /// Get the residual dimension
    pub fn residual_dim(&self) -> usize {
        self.residual.len()
    }

    /// Get a specific Jacobian element (row-major order)
    pub fn jacobian_element(&self, row: usize, col: usize) -> Option<f64> {
        self.jacobian.as_ref().map(|j| j[row * self.total_dim + col])
    }
}

/// A measurement or constraint connecting one or more variables.
///
/// Implementors define the residual `r(x)`; the optimizer minimizes the sum
/// of squared residuals over all factors of a [`crate::Problem`]. Jacobians
/// may be analytic or obtained with [`crate::central_difference_jacobian`].
///
/// Factors must be `Send + Sync` so that problems can be built and solved
/// from worker threads.
pub trait Factor: Send + Sync {
    /// Compute the residual and optionally the Jacobian at the given parameter values.
    ///
    /// # Arguments
    ///
    /// * `params` - One slice per connected variable, in connection order.
    /// * `compute_jacobian` - Whether to compute the Jacobian matrix.
    fn linearize(
        &self,
        params: &[&[f64]],
        compute_jacobian: bool,
    ) -> FactorResult<LinearizationResult>;

    /// Number of elements in the residual vector.
    fn residual_dim(&self) -> usize;

    /// Number of variables this factor connects.
    fn num_variables(&self) -> usize;

    /// Dimension of the connected variable at `idx`.
    fn variable_dim(&self, idx: usize) -> usize;

    /// Total dimension of all connected variables.
    fn total_dim(&self) -> usize {
        (0..self.num_variables()).map(|i| self.variable_dim(i)).sum()
    }
}

/// A prior factor that penalizes deviation from a target value.
///
/// Residual: r = x - target
#[derive(Debug, Clone)]
pub struct PriorFactor {
    /// Target value
    pub target: Vec<f64>,
}

impl PriorFactor {
    /// Create a new prior factor
    pub fn new(target: Vec<f64>) -> Self {
        Self { target }
    }
}

impl Factor for PriorFactor {
    fn linearize(
        &self,
        params: &[&[f64]],
        compute_jacobian: bool,
    ) -> FactorResult<LinearizationResult> {
        if params.len() != 1 {
            return Err(FactorError::DimensionMismatch {
                expected: 1,
                actual: params.len(),
            });
        }

        let x = params[0];
        if x.len() != self.target.len() {
            return Err(FactorError::DimensionMismatch {
                expected: self.target.len(),
                actual: x.len(),
            });
        }

        let residual: Vec<f64> = x.iter().zip(&self.target).map(|(xi, ti)| xi - ti).collect();

        let jacobian = compute_jacobian.then(|| {
            let n = x.len();
            let mut jac = vec![0.0; n * n];
            for i in 0..n {
                jac[i * n + i] = 1.0;
            }
            jac
        });

        Ok(LinearizationResult::new(residual, jacobian, x.len()))
    }

    fn residual_dim(&self) -> usize {
        self.target.len()
    }

    fn num_variables(&self) -> usize {
        1
    }

    fn variable_dim(&self, _idx: usize) -> usize {
        self.target.len()
    }
}
