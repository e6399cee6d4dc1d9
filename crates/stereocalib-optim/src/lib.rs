#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod factor;
mod levenberg_marquardt;
mod linear_system;
mod numeric;
mod problem;
mod variable;

pub use factor::{Factor, FactorError, FactorResult, LinearizationResult, PriorFactor};
pub use levenberg_marquardt::{
    LeastSquaresSolver, LevenbergMarquardt, OptimizerError, OptimizerResult, TerminationReason,
};
pub use linear_system::{LinearSystemBuilder, VariableLayout};
pub use numeric::central_difference_jacobian;
pub use problem::{Problem, ProblemError};
pub use variable::Variable;
