//! Error types for the serving and consumption pipeline.
//!
//! Each stage reports its own error enum so callers can match on the failure
//! they care about; [`Error`] aggregates them for the binary.

use thiserror::Error;

/// Malformed or incomplete observation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("image '{field}' has rank {rank}, expected 3 (HxWxC)")]
    BadRank { field: &'static str, rank: usize },

    #[error("image '{field}' has {channels} channels, expected 3")]
    BadChannels { field: &'static str, channels: usize },

    #[error("image '{field}' holds {actual} values but its shape implies {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("image '{field}' is {actual_h}x{actual_w}, expected {expected_h}x{expected_w}")]
    Resolution {
        field: &'static str,
        expected_h: usize,
        expected_w: usize,
        actual_h: usize,
        actual_w: usize,
    },

    #[error("image '{field}' is {h}x{w}x{c}, more pixels than fit in memory")]
    ShapeOverflow {
        field: &'static str,
        h: usize,
        w: usize,
        c: usize,
    },

    #[error("image '{field}' contains non-finite pixel values")]
    NonFinite { field: &'static str },
}

/// Failure to decode a numeric array from its text encoding.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WireError {
    #[error("unsupported dtype '{0}'")]
    UnsupportedDtype(String),

    #[error("invalid base64 payload: {0}")]
    Base64(String),

    #[error("payload has {actual} bytes but shape {shape:?} with dtype '{dtype}' needs {expected}")]
    ByteLength {
        dtype: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("shape {shape:?} has more elements than fit in memory")]
    ShapeOverflow { shape: Vec<usize> },

    #[error("nested list is ragged or non-numeric")]
    RaggedList,
}

/// Outcome of a failed `act` call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    /// The request violates the configured field contract.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The model call failed. The service stays available.
    #[error("inference failed: {message}")]
    InferenceFailure {
        message: String,
        detail: Option<String>,
    },

    /// The remote endpoint could not be reached or answered garbage.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<NormalizationError> for ServiceError {
    fn from(err: NormalizationError) -> Self {
        ServiceError::BadRequest(err.to_string())
    }
}

impl From<WireError> for ServiceError {
    fn from(err: WireError) -> Self {
        ServiceError::BadRequest(err.to_string())
    }
}

/// Trajectory reconstruction failures. Reported at the first failing index.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationError {
    #[error("orientation at pose {index} has zero norm; no heading direction exists")]
    ZeroNorm { index: usize },

    #[error("action step {index} has {len} values, at least 6 are required")]
    MalformedStep { index: usize, len: usize },
}

/// Dataset statistics could not be loaded or do not fit the configuration.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("statistics parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown unnorm_key '{key}' (available: {available:?})")]
    UnknownKey { key: String, available: Vec<String> },

    #[error("statistics for '{key}' are malformed: {message}")]
    Malformed { key: String, message: String },
}

/// A line of an action log could not be parsed.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("action log line {line}: {message}")]
pub struct ActionLogError {
    pub line: usize,
    pub message: String,
}

/// Configuration parsing or validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Chunk journal storage errors.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("journal encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Crate-level error used by the binary and top-level helpers.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error(transparent)]
    ActionLog(#[from] ActionLogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
