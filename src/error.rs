use thiserror::Error;

/// What an out-of-range index referred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Node,
    Arc,
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Arc => write!(f, "arc"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("{kind} index {index} out of range for graph with {len} {kind}s")]
    InvalidIndex {
        kind: IndexKind,
        index: usize,
        len: usize,
    },

    #[error("shape mismatch: expected {expected} values, got {actual}")]
    ShapeError { expected: usize, actual: usize },

    #[error("dimension mismatch: graph has {expected} arcs, got {actual} weights")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("attaching these inputs would make the graph its own ancestor")]
    CycleError,

    #[error("graph topology is frozen once it is used as an input")]
    Frozen,

    #[error("a backward function is already attached to this graph")]
    TapeAttached,
}

pub type Result<T> = std::result::Result<T, GraphError>;
