//! Error types for configuration generation.

use thiserror::Error;

use crate::codec::ConfigKind;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while building or driving the generators.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration space exhausted for {kind} configurations")]
    ExhaustedConfigurationSpace { kind: ConfigKind },

    #[error("key `{0}` is both preset and permeable")]
    OverlappingKeys(String),

    #[error("{count} permeable keys exceed the supported maximum of {max}")]
    TooManyPermeableKeys { count: usize, max: usize },

    #[error("invalid seed range [{from}, {to})")]
    InvalidSeedRange { from: u64, to: u64 },

    #[error("malformed canonical form: {0}")]
    Canonical(String),

    #[error("configuration error: {0}")]
    Config(String),
}
