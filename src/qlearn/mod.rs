pub mod environment;
pub mod set;
pub mod trainer;

pub use environment::{EnvProperties, QEnvironment, StateTransition};
pub use set::{action_slot_size, action_table_size, QSet};
pub use trainer::QTrainer;
