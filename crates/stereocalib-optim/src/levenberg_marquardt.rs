//! Levenberg-Marquardt optimizer for non-linear least squares optimization
//!
//! The Levenberg-Marquardt algorithm is a trust-region method that blends
//! gradient descent and Gauss-Newton. It solves the damped normal equations
//! `(JᵀJ + λD) δ = -Jᵀr` where `D` is the (floored) diagonal of `JᵀJ`, so the
//! damping adapts to the scale of every parameter.

use faer::prelude::SpSolver;
use faer::Mat;
use thiserror::Error;

use crate::factor::FactorError;
use crate::linear_system::{LinearSystemBuilder, VariableLayout};
use crate::problem::{Problem, ProblemError};

/// Errors that can occur during optimization.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Problem-related error
    #[error("Problem error: {0}")]
    Problem(#[from] ProblemError),

    /// Factor evaluation failed
    #[error("Factor evaluation failed: {0}")]
    Factor(#[from] FactorError),

    /// The problem has nothing to optimize
    #[error("Empty problem: {0}")]
    EmptyProblem(&'static str),
}

/// Result of an optimization run.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerResult {
    /// Initial cost (sum of squared residuals)
    pub initial_cost: f64,
    /// Final cost (sum of squared residuals)
    pub final_cost: f64,
    /// Number of iterations performed, accepted or not
    pub iterations: usize,
    /// Reason for termination
    pub termination_reason: TerminationReason,
}

impl OptimizerResult {
    /// Whether the run stopped on a convergence criterion.
    pub fn converged(&self) -> bool {
        self.termination_reason.is_converged()
    }
}

/// Reason why the optimizer terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Converged: relative cost change below tolerance
    CostConverged,
    /// Converged: gradient norm below tolerance
    GradientConverged,
    /// Converged: step size below tolerance relative to the parameters
    ParameterConverged,
    /// Maximum iterations reached
    MaxIterations,
    /// Lambda exceeded maximum (likely numerical issues)
    LambdaMaxExceeded,
}

impl TerminationReason {
    /// Whether this reason is one of the convergence criteria.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            TerminationReason::CostConverged
                | TerminationReason::GradientConverged
                | TerminationReason::ParameterConverged
        )
    }
}

/// A nonlinear least-squares solver operating on a [`Problem`].
///
/// The solver updates the problem's variables in place.
pub trait LeastSquaresSolver: Send + Sync {
    /// Minimize the sum of squared residuals of `problem`.
    fn minimize(&self, problem: &mut Problem) -> Result<OptimizerResult, OptimizerError>;
}

/// Levenberg-Marquardt optimizer configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LevenbergMarquardt {
    /// Initial damping parameter
    pub lambda_init: f64,
    /// Maximum damping parameter
    pub lambda_max: f64,
    /// Factor for lambda adaptation
    pub lambda_factor: f64,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Convergence threshold on the relative cost change of an accepted step
    pub cost_tolerance: f64,
    /// Convergence threshold on the max-norm of the gradient
    pub gradient_tolerance: f64,
    /// Convergence threshold on the step norm relative to the parameter norm
    pub parameter_tolerance: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            lambda_init: 1e-3,
            lambda_max: 1e10,
            lambda_factor: 10.0,
            max_iterations: 50,
            cost_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-10,
        }
    }
}

impl LevenbergMarquardt {
    const MIN_LAMBDA: f64 = 1e-12;
    const MIN_DIAGONAL: f64 = 1e-6;

    /// Set maximum iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the relative cost change tolerance.
    pub fn with_cost_tolerance(mut self, tol: f64) -> Self {
        self.cost_tolerance = tol;
        self
    }

    /// Set the gradient tolerance.
    pub fn with_gradient_tolerance(mut self, tol: f64) -> Self {
        self.gradient_tolerance = tol;
        self
    }

    /// Set the relative step tolerance.
    pub fn with_parameter_tolerance(mut self, tol: f64) -> Self {
        self.parameter_tolerance = tol;
        self
    }

    /// Set initial lambda.
    pub fn with_initial_lambda(mut self, lambda: f64) -> Self {
        self.lambda_init = lambda;
        self
    }

    /// Run the optimizer, updating the variables of `problem` in place.
    pub fn optimize(&self, problem: &mut Problem) -> Result<OptimizerResult, OptimizerError> {
        if problem.factors().is_empty() {
            return Err(OptimizerError::EmptyProblem("no factors in problem"));
        }

        let layout = VariableLayout::from_problem(problem);
        if layout.total_dim == 0 {
            return Err(OptimizerError::EmptyProblem("no free parameters"));
        }

        let initial_cost = problem.compute_total_cost()?;
        let mut current_cost = initial_cost;
        let mut lambda = self.lambda_init;
        let mut iterations = 0;

        let finish = |final_cost: f64,
                      iterations: usize,
                      reason: TerminationReason|
         -> Result<OptimizerResult, OptimizerError> {
            log::debug!(
                "lm: {:?} after {} iterations, cost {:.6e} -> {:.6e}",
                reason,
                iterations,
                initial_cost,
                final_cost
            );
            Ok(OptimizerResult {
                initial_cost,
                final_cost,
                iterations,
                termination_reason: reason,
            })
        };

        if current_cost == 0.0 {
            return finish(current_cost, iterations, TerminationReason::CostConverged);
        }

        // the normal equations only change after an accepted step
        let mut system = LinearSystemBuilder::build(problem, &layout)?;

        loop {
            if iterations >= self.max_iterations {
                return finish(current_cost, iterations, TerminationReason::MaxIterations);
            }

            let (jtj, jtr) = &system;
            let gradient_norm = jtr.iter().fold(0.0f64, |acc, g| acc.max(g.abs()));
            if gradient_norm < self.gradient_tolerance {
                return finish(current_cost, iterations, TerminationReason::GradientConverged);
            }

            iterations += 1;

            let Some(delta) = Self::solve_damped_system(jtj, jtr, lambda) else {
                lambda *= self.lambda_factor;
                if lambda > self.lambda_max {
                    return finish(current_cost, iterations, TerminationReason::LambdaMaxExceeded);
                }
                continue;
            };

            let x = layout.gather(problem);
            let x_norm = x.iter().map(|v| v * v).sum::<f64>().sqrt();
            let step_norm = delta.iter().map(|v| v * v).sum::<f64>().sqrt();
            if step_norm <= self.parameter_tolerance * (x_norm + self.parameter_tolerance) {
                return finish(current_cost, iterations, TerminationReason::ParameterConverged);
            }

            let snapshot = Self::apply_step(problem, &layout, &delta);
            let new_cost = match problem.compute_total_cost() {
                Ok(cost) if cost.is_finite() => Some(cost),
                // a step may leave the valid domain of a factor (e.g. behind the camera)
                Ok(_) | Err(ProblemError::FactorEvaluation(_)) => None,
                Err(e) => return Err(e.into()),
            };

            match new_cost {
                Some(new_cost) if new_cost < current_cost => {
                    let relative_change = (current_cost - new_cost) / current_cost;
                    current_cost = new_cost;
                    lambda = (lambda / self.lambda_factor).max(Self::MIN_LAMBDA);
                    log::trace!(
                        "lm: iteration {} accepted, cost {:.6e}, lambda {:.1e}",
                        iterations,
                        current_cost,
                        lambda
                    );

                    if relative_change < self.cost_tolerance || current_cost == 0.0 {
                        return finish(current_cost, iterations, TerminationReason::CostConverged);
                    }
                    system = LinearSystemBuilder::build(problem, &layout)?;
                }
                _ => {
                    Self::revert_step(problem, snapshot);
                    lambda *= self.lambda_factor;
                    log::trace!(
                        "lm: iteration {} rejected, lambda {:.1e}",
                        iterations,
                        lambda
                    );
                    if lambda > self.lambda_max {
                        return finish(
                            current_cost,
                            iterations,
                            TerminationReason::LambdaMaxExceeded,
                        );
                    }
                }
            }
        }
    }

    /// Solve the damped system (JᵀJ + λD) δ = -Jᵀr.
    fn solve_damped_system(jtj: &Mat<f64>, jtr: &[f64], lambda: f64) -> Option<Vec<f64>> {
        let n = jtr.len();
        let mut hessian = jtj.clone();
        for i in 0..n {
            let d = jtj.read(i, i);
            hessian.write(i, i, d + lambda * d.max(Self::MIN_DIAGONAL));
        }

        let rhs = Mat::<f64>::from_fn(n, 1, |i, _| -jtr[i]);
        let solution = hessian.partial_piv_lu().solve(rhs.as_ref());

        let delta: Vec<f64> = (0..n).map(|i| solution.read(i, 0)).collect();
        delta.iter().all(|d| d.is_finite()).then_some(delta)
    }

    fn apply_step(
        problem: &mut Problem,
        layout: &VariableLayout,
        delta: &[f64],
    ) -> Vec<(String, Vec<f64>)> {
        let variables = problem.variables_mut();
        let mut snapshot = Vec::with_capacity(layout.var_names.len());

        for (name, cols) in layout.var_names.iter().zip(&layout.columns) {
            let Some(var) = variables.get_mut(name) else {
                continue;
            };
            snapshot.push((name.clone(), var.values.clone()));
            for (k, col) in cols.iter().enumerate() {
                if let Some(c) = col {
                    var.values[k] += delta[*c];
                }
            }
        }

        snapshot
    }

    fn revert_step(problem: &mut Problem, snapshot: Vec<(String, Vec<f64>)>) {
        let variables = problem.variables_mut();
        for (name, old_values) in snapshot {
            if let Some(var) = variables.get_mut(&name) {
                var.values = old_values;
            }
        }
    }
}

impl LeastSquaresSolver for LevenbergMarquardt {
    fn minimize(&self, problem: &mut Problem) -> Result<OptimizerResult, OptimizerError> {
        self.optimize(problem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        central_difference_jacobian, Factor, FactorResult, LinearizationResult, PriorFactor,
        Variable,
    };

    /// Residual of the Rosenbrock function: r = [10 (y - x²), 1 - x].
    struct Rosenbrock;

    impl Factor for Rosenbrock {
        fn linearize(
            &self,
            params: &[&[f64]],
            compute_jacobian: bool,
        ) -> FactorResult<LinearizationResult> {
            let eval = |p: &[&[f64]]| -> FactorResult<Vec<f64>> {
                let (x, y) = (p[0][0], p[0][1]);
                Ok(vec![10.0 * (y - x * x), 1.0 - x])
            };
            let residual = eval(params)?;
            let jacobian = if compute_jacobian {
                Some(central_difference_jacobian(params, 2, eval)?)
            } else {
                None
            };
            Ok(LinearizationResult::new(residual, jacobian, 2))
        }

        fn residual_dim(&self) -> usize {
            2
        }

        fn num_variables(&self) -> usize {
            1
        }

        fn variable_dim(&self, _idx: usize) -> usize {
            2
        }
    }

    #[test]
    fn test_simple_1d_optimization() -> Result<(), Box<dyn std::error::Error>> {
        // minimize (x - 5)^2
        let mut problem = Problem::new();
        problem.add_variable(Variable::zeros("x", 1))?;
        problem.add_factor(Box::new(PriorFactor::new(vec![5.0])), vec!["x".into()])?;

        let result = LevenbergMarquardt::default().optimize(&mut problem)?;

        assert!(result.iterations > 0);
        assert!(result.final_cost < 1e-10);
        assert!(result.converged());
        assert!((problem.values("x")?[0] - 5.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_rosenbrock() -> Result<(), Box<dyn std::error::Error>> {
        let mut problem = Problem::new();
        problem.add_variable(Variable::new("p", vec![-1.2, 1.0]))?;
        problem.add_factor(Box::new(Rosenbrock), vec!["p".into()])?;

        let optimizer = LevenbergMarquardt::default().with_max_iterations(200);
        let result = optimizer.minimize(&mut problem)?;

        assert!(result.converged(), "{:?}", result.termination_reason);
        let p = problem.values("p")?;
        approx::assert_relative_eq!(p[0], 1.0, epsilon = 1e-5);
        approx::assert_relative_eq!(p[1], 1.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn test_fixed_components_are_untouched() -> Result<(), Box<dyn std::error::Error>> {
        let mut problem = Problem::new();
        problem.add_variable(Variable::new("x", vec![0.0, 0.0, 0.0]).with_fixed(&[1]))?;
        problem.add_factor(
            Box::new(PriorFactor::new(vec![1.0, 2.0, 3.0])),
            vec!["x".into()],
        )?;

        LevenbergMarquardt::default().optimize(&mut problem)?;

        let x = problem.values("x")?;
        assert!((x[0] - 1.0).abs() < 1e-5);
        assert_eq!(x[1], 0.0);
        assert!((x[2] - 3.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_max_iterations_is_reported() -> Result<(), Box<dyn std::error::Error>> {
        let mut problem = Problem::new();
        problem.add_variable(Variable::new("p", vec![-1.2, 1.0]))?;
        problem.add_factor(Box::new(Rosenbrock), vec!["p".into()])?;

        let result = LevenbergMarquardt::default()
            .with_max_iterations(1)
            .optimize(&mut problem)?;
        assert_eq!(result.termination_reason, TerminationReason::MaxIterations);
        assert!(!result.converged());
        Ok(())
    }

    #[test]
    fn test_empty_problem() {
        let mut problem = Problem::new();
        assert!(matches!(
            LevenbergMarquardt::default().optimize(&mut problem),
            Err(OptimizerError::EmptyProblem(_))
        ));
    }

    #[test]
    fn test_optimizer_default() {
        let optimizer = LevenbergMarquardt::default();
        assert_eq!(optimizer.lambda_init, 1e-3);
        assert_eq!(optimizer.lambda_max, 1e10);
        assert_eq!(optimizer.lambda_factor, 10.0);
        assert_eq!(optimizer.max_iterations, 50);
    }
}
