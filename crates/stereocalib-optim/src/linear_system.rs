use std::collections::HashMap;

use faer::Mat;

use crate::factor::FactorError;
use crate::levenberg_marquardt::OptimizerError;
use crate::problem::{Problem, ProblemError};

/// Variable ordering and column layout of the normal equations.
///
/// Variables are ordered by name so that the layout is deterministic. Only
/// free components receive a column.
#[derive(Debug, Clone)]
pub struct VariableLayout {
    /// Variable names in column order.
    pub var_names: Vec<String>,
    /// Index of each variable in `var_names`.
    pub var_index_map: HashMap<String, usize>,
    /// Per variable, the global column of each component (`None` when fixed).
    pub columns: Vec<Vec<Option<usize>>>,
    /// Number of free components over all variables.
    pub total_dim: usize,
}

impl VariableLayout {
    /// Build the layout for the current problem.
    pub fn from_problem(problem: &Problem) -> Self {
        let variables = problem.variables();
        let mut var_names: Vec<String> = variables.keys().cloned().collect();
        var_names.sort();

        let var_index_map: HashMap<String, usize> = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut total_dim = 0;
        let mut columns = Vec::with_capacity(var_names.len());
        for name in &var_names {
            let var = &variables[name];
            let cols = (0..var.dim())
                .map(|k| {
                    if var.is_fixed(k) {
                        None
                    } else {
                        total_dim += 1;
                        Some(total_dim - 1)
                    }
                })
                .collect();
            columns.push(cols);
        }

        Self {
            var_names,
            var_index_map,
            columns,
            total_dim,
        }
    }

    /// Current values of all free components, in column order.
    pub fn gather(&self, problem: &Problem) -> Vec<f64> {
        let mut x = vec![0.0; self.total_dim];
        for (name, cols) in self.var_names.iter().zip(&self.columns) {
            let values = &problem.variables()[name].values;
            for (k, col) in cols.iter().enumerate() {
                if let Some(c) = col {
                    x[*c] = values[k];
                }
            }
        }
        x
    }
}

/// Builds the normal equations `JᵀJ` and `Jᵀr` from all factors of a problem.
pub struct LinearSystemBuilder;

impl LinearSystemBuilder {
    /// Accumulate the normal equations for the given layout.
    pub fn build(
        problem: &Problem,
        layout: &VariableLayout,
    ) -> Result<(Mat<f64>, Vec<f64>), OptimizerError> {
        let n = layout.total_dim;
        let mut jtj = Mat::<f64>::zeros(n, n);
        let mut jtr = vec![0.0; n];

        for (factor, factor_var_names) in problem.factors() {
            let params = problem.factor_params(factor_var_names)?;
            let result = factor.linearize(&params, true)?;

            let Some(jacobian) = &result.jacobian else {
                return Err(OptimizerError::Factor(FactorError::JacobianFailed(
                    "Jacobian required for optimization".to_string(),
                )));
            };

            // map every factor column to a global column, skipping fixed ones
            let mut mapping: Vec<(usize, usize)> = Vec::with_capacity(result.total_dim);
            let mut factor_col = 0;
            for name in factor_var_names {
                let idx = layout
                    .var_index_map
                    .get(name)
                    .ok_or_else(|| ProblemError::VariableNotFound { name: name.clone() })?;
                for col in &layout.columns[*idx] {
                    if let Some(c) = col {
                        mapping.push((factor_col, *c));
                    }
                    factor_col += 1;
                }
            }

            if factor_col != result.total_dim
                || jacobian.len() != result.residual_dim() * result.total_dim
            {
                return Err(OptimizerError::Factor(FactorError::DimensionMismatch {
                    expected: factor_col,
                    actual: result.total_dim,
                }));
            }

            let stride = result.total_dim;
            for (row, r) in result.residual.iter().enumerate() {
                let jrow = &jacobian[row * stride..(row + 1) * stride];
                for &(fi, gi) in &mapping {
                    let ji = jrow[fi];
                    if ji == 0.0 {
                        continue;
                    }
                    jtr[gi] += ji * r;
                    for &(fj, gj) in &mapping {
                        let jj = jrow[fj];
                        if jj != 0.0 {
                            jtj.write(gi, gj, jtj.read(gi, gj) + ji * jj);
                        }
                    }
                }
            }
        }

        Ok((jtj, jtr))
    }
}
