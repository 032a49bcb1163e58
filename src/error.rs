use thiserror::Error;

use crate::v4l2::NodeId;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Device {node} {op} failed: {reason}")]
    Device {
        node: NodeId,
        op: &'static str,
        reason: String,
    },

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl CameraError {
    pub fn device(node: NodeId, op: &'static str, reason: impl Into<String>) -> Self {
        CameraError::Device {
            node,
            op,
            reason: reason.into(),
        }
    }

    /// True for failures reported by the device gateway.
    pub fn is_device(&self) -> bool {
        matches!(self, CameraError::Device { .. })
    }
}

pub type Result<T> = std::result::Result<T, CameraError>;
