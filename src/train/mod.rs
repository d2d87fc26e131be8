pub mod adapter;
pub mod backprop;
pub mod updater;

pub use adapter::WeightAdapter;
pub use backprop::{BackpropOptimizer, OperationGraph};
pub use updater::{UpdateRule, UpdaterKind, WeightUpdater};
