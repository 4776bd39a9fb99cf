use thiserror::Error;

use crate::array::ArrayError;
use crate::runtime::CollectiveError;
use crate::sharding::ShardingError;

#[derive(Error, Clone, Debug, PartialEq)]
pub enum Error {
    // TODO(tessera): `Error::InsufficientParams` should report the path of the missing leaf once containers expose
    //  named parameters.
    #[error("expected at least {expected_count} parameters but got fewer")]
    InsufficientParams { expected_count: usize },

    #[error("got more parameters than expected")]
    UnusedParams,

    #[error("invalid hyperparameters: {message}")]
    InvalidHParams { message: String },

    #[error("unknown logical axis '{axis_name}'")]
    UnknownLogicalAxis { axis_name: String },

    /// Two distinct logical axes of the same tensor resolve onto the same mesh axis.
    #[error(
        "partitioning conflict in '{tensor}': logical axes '{first_logical_axis}' and '{second_logical_axis}' both \
        map to mesh axis '{mesh_axis}'"
    )]
    PartitioningConflict { tensor: String, mesh_axis: String, first_logical_axis: String, second_logical_axis: String },

    /// A tensor (or tensor shard) dimension disagrees with the shape implied by the resolved sharding.
    #[error("shape mismatch in '{tensor}' along logical axis '{logical_axis}': expected {expected}, got {actual}")]
    ShapeMismatch { tensor: String, logical_axis: String, expected: usize, actual: usize },

    #[error("rank mismatch in '{tensor}': expected rank {expected}, got {actual}")]
    RankMismatch { tensor: String, expected: usize, actual: usize },

    #[error("KV cache overflow: appending {seq_len} position(s) to a cache of length {cache_len} exceeds {max_len}")]
    CacheOverflow { cache_len: usize, seq_len: usize, max_len: usize },

    #[error("invalid chunk: {message}")]
    InvalidChunk { message: String },

    #[error("token {token} is outside of the vocabulary of size {vocab}")]
    InvalidToken { token: i64, vocab: usize },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Sharding(#[from] ShardingError),

    #[error(transparent)]
    Array(#[from] ArrayError),

    #[error(transparent)]
    Collective(#[from] CollectiveError),
}

impl From<candle_core::Error> for Error {
    fn from(error: candle_core::Error) -> Self {
        Error::Array(error.into())
    }
}

impl Error {
    /// Returns `true` if this error was caused by another device aborting the current program.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Collective(CollectiveError::Aborted { .. }))
    }
}
