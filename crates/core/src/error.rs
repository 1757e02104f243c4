//! Error types for the core library

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cyclic delegation: {}", cycle.join(" -> "))]
    CyclicDelegation { cycle: Vec<String> },

    #[error("Agent registry has not been validated")]
    RegistryNotValidated,

    #[error("Agent registry is frozen")]
    RegistryFrozen,

    #[error("Invalid pipeline '{name}': {reason}")]
    InvalidPipeline { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
