use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("failed to allocate {bytes} bytes{}", node.map(|n| format!(" on NUMA node {n}")).unwrap_or_default())]
    OutOfMemory { bytes: u64, node: Option<usize> },

    #[error("invalid region layout: {0}")]
    InvalidLayout(String),

    #[error("NUMA: {0}")]
    Numa(String),

    #[error("permutation is not a single cycle: expected {expected} hops, walked {found}")]
    PermutationBroken { expected: usize, found: usize },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("invalid size '{0}'")]
    InvalidSize(String),

    #[error("malformed result line: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BenchError>;
