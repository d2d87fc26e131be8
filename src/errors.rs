use thiserror::Error;

/// Structured failures surfaced at the boundary of the current operation
/// (`solve`, `iterate`, `incorporate`). Locally recoverable conditions such
/// as a q-set lookup miss are expressed as `Option`, not as errors.
#[derive(Error, Debug)]
pub enum LatticaError {
    #[error("shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("sequence interval out of bounds: {start} + {count} exceeds {available}")]
    SequenceIntervalOutOfBounds {
        start: usize,
        count: usize,
        available: usize,
    },
    #[error("solution plan has no rows")]
    EmptyPlan,
    #[error("solution row {0} has no partial solutions")]
    EmptyRow(usize),
    #[error("neuron router could not collect a solvable subset ({unprocessed} neurons unprocessed)")]
    EmptySubset { unprocessed: usize },
    #[error(
        "recurrent input of neuron {neuron} references neuron {referenced}; \
         only self-recurrence is differentiable"
    )]
    UnsupportedRecurrence { neuron: usize, referenced: usize },
    #[error("{what} index {index} out of bounds ({bound})")]
    IndexOutOfBounds {
        what: &'static str,
        index: usize,
        bound: usize,
    },
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
    #[error("subset modification attempted while collection is running")]
    CollectionRunning,
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type LatResult<T> = Result<T, LatticaError>;
