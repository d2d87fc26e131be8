pub mod builder;
pub mod features;
pub mod partial;
pub mod router;
pub mod solution;
pub mod solver;

pub use builder::SolutionBuilder;
pub use features::FeatureExecutor;
pub use partial::{PartialSolution, PartialSolver};
pub use router::NeuronRouter;
pub use solution::Solution;
pub use solver::SolutionSolver;
