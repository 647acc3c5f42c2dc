pub mod autodiff;
pub mod data;
pub mod equation_engine;
pub mod error;
pub mod loss;
pub mod models;
pub mod optimize;
pub mod problem;
pub mod solvers;
pub mod training;
/// The `udefit_core` crate fits universal differential equations: ODE models
/// whose right-hand side holds a small vector of physical parameters or an
/// embedded neural network standing in for an unknown term.
///
/// Key components:
/// - **Traits**: `Scalar` (numeric type abstraction) and `ParametricSystem` (vector fields driven by a parameter vector).
/// - **Solvers**: Adaptive Tsit5 with dense output and forward sensitivities.
/// - **Models**: Lotka-Volterra, hybrid known-plus-learned models and dense networks.
/// - **Loss / Training**: SSE against observations and the Adam-then-BFGS schedule.
pub mod traits;

pub use error::{Result, UdeError};
