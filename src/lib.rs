pub mod context;
pub mod data;
pub mod errors;
pub mod net;
pub mod objective;
pub mod qlearn;
pub mod settings;
pub mod solve;
pub mod train;
pub mod utils;

pub use context::CpuContext;
pub use data::{DataSet, SequenceData};
pub use errors::{LatResult, LatticaError};
pub use net::{Network, NetworkBuilder, TransferKind};
pub use objective::{CostKind, CostObjective, Objective};
pub use qlearn::{QEnvironment, QSet, QTrainer};
pub use settings::Settings;
pub use solve::{Solution, SolutionBuilder, SolutionSolver};
pub use train::{BackpropOptimizer, UpdaterKind, WeightAdapter, WeightUpdater};
