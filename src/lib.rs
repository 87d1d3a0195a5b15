//! Pi-Cam-Session: capture session control for V4L2 cameras on Raspberry Pi
//!
//! A [`Coordinator`] owns the camera through a [`DeviceProxy`] worker thread,
//! sequences preview, focus and multi-frame captures across the supported
//! [`CaptureMode`]s, and hands finished frames to a bounded [`SavePipeline`]
//! that writes images and thumbnails in the background.

pub mod config;
pub mod device;
pub mod error;
pub mod imaging;
pub mod mode;
pub mod parameters;
pub mod pipeline;
pub mod proxy;
pub mod session;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use config::{BurstConfig, SessionConfig};
pub use device::V4L2Camera;
pub use error::{CameraError, Result};
pub use mode::CaptureMode;
pub use pipeline::{DirectoryStore, ImageStore, Location, SavePipeline};
pub use proxy::DeviceProxy;
pub use session::{CaptureRequest, Coordinator, SessionCommand, SessionState};
pub use traits::{CameraHal, Format, FourCC, Frame, LoggingListener, SessionListener};
