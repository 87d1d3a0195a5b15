//! Error type shared by the session, proxy and pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::mode::CaptureMode;
use crate::proxy::HardwareOp;
use crate::session::SessionState;

/// Error type for capture session operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Requested capture mode is not in the negotiated capability set.
    #[error("capture mode {0} is not supported by the device")]
    UnsupportedMode(CaptureMode),

    /// Command issued while the session cannot accept it.
    #[error("device busy: cannot {operation} while {state}")]
    DeviceBusy {
        /// Rejected operation.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },

    /// The hardware reported a failure for a proxied call.
    #[error("hardware call {op} failed: {message}")]
    Hardware {
        /// Failed operation.
        op: HardwareOp,
        /// Failure description from the device layer.
        message: String,
    },

    /// Writing a captured image to storage failed.
    #[error("failed to write {path}: {source}")]
    StorageWrite {
        /// Destination that could not be written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A parameter value is out of range or malformed.
    #[error("invalid parameter {key}={value}")]
    InvalidParameter {
        /// Parameter key.
        key: String,
        /// Offending value.
        value: String,
    },

    /// Frame bytes do not match their declared layout.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Failed to open the camera device.
    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),

    /// Image encoding or decoding failed.
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Build a hardware failure for `op` from any displayable cause.
    pub fn hardware<D: std::fmt::Display>(op: HardwareOp, cause: D) -> Self {
        Self::Hardware {
            op,
            message: cause.to_string(),
        }
    }

    /// Whether this error came from the device layer.
    pub const fn is_hardware(&self) -> bool {
        matches!(self, Self::Hardware { .. } | Self::DeviceOpenFailed(_))
    }
}

/// Result type for capture session operations.
pub type Result<T> = std::result::Result<T, CameraError>;
