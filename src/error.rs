//! Error types
//!
//! Two tiers: `MeasurementError` is raised by a measurement provider and is
//! recoverable per record, `IfdError` stops the run.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single forward-pass measurement.
#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("tokenizer failed: {0}")]
    Tokenizer(String),

    #[error("forward pass failed: {0}")]
    Model(#[from] candle_core::Error),

    #[error("target span is empty")]
    EmptySpan,

    #[error("target span not found in text")]
    SpanNotFound,

    #[error("no tokens left to score after masking and truncation")]
    EmptyTarget,

    #[error("sequence of {len} tokens exceeds context length {context_length}")]
    ContextOverflow { len: usize, context_length: usize },

    #[error("loss is not finite: {0}")]
    NonFinite(f64),
}

/// Fatal pipeline errors.
#[derive(Debug, Error)]
pub enum IfdError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed analysis entry {index} in {path}: {reason}")]
    MalformedAnalysis {
        path: PathBuf,
        index: usize,
        reason: String,
    },

    #[error(
        "dataset has {records} records but analysis stream has {analysis} entries; \
        the scorer run is incomplete or the inputs are out of sync"
    )]
    LengthMismatch { records: usize, analysis: usize },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("token counting failed: {0}")]
    Measurement(#[from] MeasurementError),

    #[error("failed to serialize: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl IfdError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, IfdError>;
