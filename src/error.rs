use std::fmt;

use thiserror::Error;

/// Condition reported to the caller when a build does not produce a trace.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Condition {
    BuildFailed,
    NoPartitions,
    InternalInvariantViolation,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::BuildFailed => write!(f, "Build failed"),
            Condition::NoPartitions => write!(f, "No partitions"),
            Condition::InternalInvariantViolation => write!(f, "Internal invariant violation"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("no communication phases found")]
    EmptyResult,

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

impl BuildError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        BuildError::MalformedInput(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        BuildError::InvariantViolation(msg.into())
    }

    pub fn condition(&self) -> Condition {
        match self {
            BuildError::MalformedInput(_) => Condition::BuildFailed,
            BuildError::EmptyResult => Condition::NoPartitions,
            BuildError::InvariantViolation(_) => Condition::InternalInvariantViolation,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
