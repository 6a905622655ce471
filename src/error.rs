use std::path::PathBuf;

use thiserror::Error;

use crate::graph::DataType;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to read graph from `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write `{path}`: {source}")]
    Export {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse graph JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to initialise logging: {reason}")]
    LoggerInit { reason: String },
    #[error("operand {operand} does not exist in the graph")]
    InvalidConversionOperand { operand: u32 },
    #[error("`{op_type}` expects between {min} and {max} inputs, got {actual}")]
    InputCountMismatch {
        op_type: String,
        min: usize,
        max: usize,
        actual: usize,
    },
    #[error("malformed packed params: {reason}")]
    MalformedPackedParams { reason: String },
    #[error("group count {groups} does not evenly divide {channels} channels")]
    InvalidGroupCount { groups: i64, channels: u32 },
    #[error(
        "bias of rank {rank} with shape {bias_shape:?} cannot be broadcast to convolution output {output_shape:?}"
    )]
    UnsupportedBiasRank {
        rank: usize,
        bias_shape: Vec<u32>,
        output_shape: Vec<u32>,
    },
    #[error("shape inference failed for `{op_type}`: {reason}")]
    ShapeInferenceFailed { op_type: String, reason: String },
    #[error("{data_type:?} is not a supported quantized storage type")]
    UnsupportedQuantizedType { data_type: DataType },
    #[error("conversion of `{op_type}` failed: {reason}")]
    ConversionFailed { op_type: String, reason: String },
    #[error("operation `{op_type}` is not supported by the reference executor")]
    UnsupportedOperation { op_type: String },
    #[error("missing runtime input `{name}`")]
    RuntimeTensorMissing { name: String },
    #[error("unexpected runtime input `{name}`")]
    RuntimeTensorUnexpected { name: String },
    #[error("runtime input `{name}` has shape {actual:?}, expected {expected:?}")]
    RuntimeTensorShapeMismatch {
        name: String,
        expected: Vec<u32>,
        actual: Vec<usize>,
    },
    #[error("tensor `{name}` holds {actual} elements, shape requires {expected}")]
    RuntimeTensorDataLengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

impl GraphError {
    pub fn io(path: PathBuf, source: std::io::Error) -> Self {
        GraphError::Io { path, source }
    }

    pub fn export(path: PathBuf, source: std::io::Error) -> Self {
        GraphError::Export { path, source }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        GraphError::MalformedPackedParams {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(op_type: &str, reason: impl Into<String>) -> Self {
        GraphError::ShapeInferenceFailed {
            op_type: op_type.to_string(),
            reason: reason.into(),
        }
    }
}
