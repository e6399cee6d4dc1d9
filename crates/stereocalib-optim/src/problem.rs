//! A Problem contains variables (parameters to optimize) and factors (constraints/measurements).

use std::collections::HashMap;

use thiserror::Error;

use crate::factor::{Factor, FactorError};
use crate::variable::Variable;

/// Errors that can occur when working with optimization problems.
#[derive(Debug, Error)]
pub enum ProblemError {
    /// Variable with this name already exists
    #[error("Variable '{name}' already exists")]
    DuplicateVariable {
        /// Name of the duplicated variable.
        name: String,
    },
    /// Variable with this name was not found
    #[error("Variable '{name}' not found")]
    VariableNotFound {
        /// Name of the missing variable.
        name: String,
    },
    /// Dimension mismatch between a factor and the variables it connects
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Dimension that was provided.
        actual: usize,
    },
    /// Factor evaluation failed
    #[error("Factor evaluation failed: {0}")]
    FactorEvaluation(#[from] FactorError),
}

/// An optimization problem containing variables and factors.
#[derive(Default)]
pub struct Problem {
    variables: HashMap<String, Variable>,
    factors: Vec<(Box<dyn Factor>, Vec<String>)>,
}

impl Problem {
    /// Create a new empty problem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable. Names must be unique.
    pub fn add_variable(&mut self, var: Variable) -> Result<(), ProblemError> {
        if self.variables.contains_key(&var.name) {
            return Err(ProblemError::DuplicateVariable {
                name: var.name.clone(),
            });
        }
        self.variables.insert(var.name.clone(), var);
        Ok(())
    }

    /// Add a factor connecting the named variables, in the factor's order.
    pub fn add_factor(
        &mut self,
        factor: Box<dyn Factor>,
        var_names: Vec<String>,
    ) -> Result<(), ProblemError> {
        if factor.num_variables() != var_names.len() {
            return Err(ProblemError::DimensionMismatch {
                expected: factor.num_variables(),
                actual: var_names.len(),
            });
        }
        for (idx, name) in var_names.iter().enumerate() {
            let var = self
                .variables
                .get(name)
                .ok_or_else(|| ProblemError::VariableNotFound { name: name.clone() })?;
            if var.dim() != factor.variable_dim(idx) {
                return Err(ProblemError::DimensionMismatch {
                    expected: factor.variable_dim(idx),
                    actual: var.dim(),
                });
            }
        }
        self.factors.push((factor, var_names));
        Ok(())
    }

    /// All variables indexed by name.
    pub fn variables(&self) -> &HashMap<String, Variable> {
        &self.variables
    }

    /// Mutable access to the variables.
    pub fn variables_mut(&mut self) -> &mut HashMap<String, Variable> {
        &mut self.variables
    }

    /// Current values of the named variable.
    pub fn values(&self, name: &str) -> Result<&[f64], ProblemError> {
        self.variables
            .get(name)
            .map(|v| v.values.as_slice())
            .ok_or_else(|| ProblemError::VariableNotFound {
                name: name.to_string(),
            })
    }

    /// All factors with the names of the variables they connect.
    pub fn factors(&self) -> &[(Box<dyn Factor>, Vec<String>)] {
        &self.factors
    }

    /// Total number of residual components over all factors.
    pub fn num_residuals(&self) -> usize {
        self.factors.iter().map(|(f, _)| f.residual_dim()).sum()
    }

    pub(crate) fn factor_params<'a>(
        &'a self,
        var_names: &[String],
    ) -> Result<Vec<&'a [f64]>, ProblemError> {
        var_names
            .iter()
            .map(|name| {
                self.variables
                    .get(name)
                    .map(|v| v.values.as_slice())
                    .ok_or_else(|| ProblemError::VariableNotFound { name: name.clone() })
            })
            .collect()
    }

    /// Sum of squared residuals at the current variable values.
    pub fn compute_total_cost(&self) -> Result<f64, ProblemError> {
        let mut total_cost = 0.0;

        for (factor, var_names) in &self.factors {
            let params = self.factor_params(var_names)?;
            let result = factor.linearize(&params, false)?;
            total_cost += result.residual.iter().map(|r| r * r).sum::<f64>();
        }

        Ok(total_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PriorFactor;

    #[test]
    fn test_add_and_get_variable() -> Result<(), ProblemError> {
        let mut problem = Problem::new();
        problem.add_variable(Variable::new("R", vec![1.0, 2.0]))?;

        let vars = problem.variables();
        assert!(vars.contains_key("R"));
        assert_eq!(problem.values("R")?, &[1.0, 2.0]);
        assert!(problem.values("T").is_err());
        Ok(())
    }

    #[test]
    fn test_add_variable_duplicate_should_fail() {
        let mut problem = Problem::new();
        let var = Variable::new("R", vec![1.0, 2.0]);
        assert!(problem.add_variable(var.clone()).is_ok());
        assert!(matches!(
            problem.add_variable(var),
            Err(ProblemError::DuplicateVariable { .. })
        ));
    }

    #[test]
    fn test_add_factor_wrong_dim_should_fail() -> Result<(), ProblemError> {
        let mut problem = Problem::new();
        problem.add_variable(Variable::zeros("x", 2))?;
        let res = problem.add_factor(
            Box::new(PriorFactor::new(vec![1.0, 2.0, 3.0])),
            vec!["x".to_string()],
        );
        assert!(matches!(
            res,
            Err(ProblemError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        Ok(())
    }

    #[test]
    fn test_add_factor_missing_variable() {
        let mut problem = Problem::new();
        let prior = PriorFactor::new(vec![1.0, 1.0]);
        let res = problem.add_factor(Box::new(prior), vec!["not_present".to_string()]);
        match res {
            Err(ProblemError::VariableNotFound { name }) => assert_eq!(name, "not_present"),
            _ => panic!("Expected VariableNotFound error"),
        }
    }

    #[test]
    fn test_compute_total_cost_with_multiple_factors() -> Result<(), ProblemError> {
        let mut problem = Problem::new();
        problem.add_variable(Variable::new("x", vec![2.0]))?;
        problem.add_variable(Variable::new("y", vec![3.0, -2.0]))?;
        // (2-3)^2 = 1
        problem.add_factor(Box::new(PriorFactor::new(vec![3.0])), vec!["x".into()])?;
        // (3-4)^2 + (-2+5)^2 = 10
        problem.add_factor(
            Box::new(PriorFactor::new(vec![4.0, -5.0])),
            vec!["y".into()],
        )?;

        assert_eq!(problem.num_residuals(), 3);
        assert!((problem.compute_total_cost()? - 11.0).abs() < 1e-12);
        Ok(())
    }
}
