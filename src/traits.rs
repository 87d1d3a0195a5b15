//! Core traits and types shared by the session, its hardware layer and its
//! listeners.

use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::imaging::Thumbnail;
use crate::mode::CaptureMode;
use crate::parameters::Parameters;
use crate::session::SessionState;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");

    /// Bytes per pixel for packed formats, `None` for compressed ones.
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match self.0 {
            [b'Y', b'U', b'Y', b'V'] => Some(2),
            [b'R', b'G', b'B', b'3'] => Some(3),
            _ => None,
        }
    }

    /// Name used for this format in the `picture-format` parameter.
    pub const fn parameter_name(self) -> &'static str {
        match self.0 {
            [b'Y', b'U', b'Y', b'V'] => "yuv422i-yuyv",
            [b'R', b'G', b'B', b'3'] => "rgb888",
            _ => "jpeg",
        }
    }

    /// Parse a `picture-format` parameter value.
    pub fn from_parameter(value: &str) -> Option<Self> {
        match value {
            "yuv422i-yuyv" => Some(Self::YUYV),
            "rgb888" => Some(Self::RGB3),
            "jpeg" => Some(Self::MJPG),
            _ => None,
        }
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Image format specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride), zero for compressed formats.
    pub stride: u32,
    /// Total frame size in bytes, zero for compressed formats.
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = match fourcc.bytes_per_pixel() {
            Some(bpp) => width * bpp,
            None => 0,
        };
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A captured still frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Layout of `data`.
    pub format: Format,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Get RGB values for a pixel at the specified coordinates.
    ///
    /// Returns `None` for coordinates outside the frame and for formats other
    /// than YUYV. For odd x coordinates the Y value of the second pixel in the
    /// pair is used with the shared U/V values.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if self.format.fourcc != FourCC::YUYV || x >= self.format.width || y >= self.format.height
        {
            return None;
        }

        // YUYV format: [Y0 U Y1 V] repeats, each pair shares U and V
        let stride = if self.format.stride == 0 {
            self.format.width * 2
        } else {
            self.format.stride
        };
        let pair_x = x & !1;
        let offset = (y * stride + pair_x * 2) as usize;

        let y_val = if x % 2 == 0 {
            *self.data.get(offset)?
        } else {
            *self.data.get(offset + 2)?
        };
        let u = *self.data.get(offset + 1)?;
        let v = *self.data.get(offset + 3)?;

        Some(yuv_to_rgb(y_val, u, v))
    }
}

/// Convert YUV values to RGB using the ITU-R BT.601 conversion formula.
///
/// RGB values are clamped to the 0-255 range.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub(crate) fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}

/// Manual exposure/gain pair requested for a single shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureGain {
    /// Exposure time in microseconds.
    pub exposure_us: u32,
    /// Analog gain in ISO units.
    pub gain_iso: u32,
}

/// Per-shot settings handed to the hardware with each take-picture call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotSettings {
    /// Capture cycle this shot belongs to.
    pub sequence: u64,
    /// Zero-based frame index within the burst.
    pub index: u32,
    /// Mode the capture was issued in.
    pub mode: CaptureMode,
    /// Optional manual exposure.
    pub exposure: Option<ExposureGain>,
}

/// Hardware operations the device proxy serializes onto its worker thread.
///
/// Every call blocks until the hardware completes it. Failures are reported
/// as errors and never retried by the caller.
pub trait CameraHal {
    /// Read the current parameter set, including capability lists.
    fn get_parameters(&mut self) -> Result<Parameters>;

    /// Apply a full parameter set.
    fn set_parameters(&mut self, params: &Parameters) -> Result<()>;

    /// Start streaming preview.
    fn start_preview(&mut self) -> Result<()>;

    /// Stop streaming preview.
    fn stop_preview(&mut self) -> Result<()>;

    /// Run one focus sweep. Returns whether focus locked.
    fn auto_focus(&mut self) -> Result<bool>;

    /// Capture one still frame.
    fn take_picture(&mut self, shot: &ShotSettings) -> Result<Frame>;

    /// Re-open the device after it was lost or switched.
    fn reconnect(&mut self) -> Result<()>;

    /// Release the device.
    fn release(&mut self) -> Result<()>;
}

impl<H: CameraHal + ?Sized> CameraHal for Box<H> {
    fn get_parameters(&mut self) -> Result<Parameters> {
        (**self).get_parameters()
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<()> {
        (**self).set_parameters(params)
    }

    fn start_preview(&mut self) -> Result<()> {
        (**self).start_preview()
    }

    fn stop_preview(&mut self) -> Result<()> {
        (**self).stop_preview()
    }

    fn auto_focus(&mut self) -> Result<bool> {
        (**self).auto_focus()
    }

    fn take_picture(&mut self, shot: &ShotSettings) -> Result<Frame> {
        (**self).take_picture(shot)
    }

    fn reconnect(&mut self) -> Result<()> {
        (**self).reconnect()
    }

    fn release(&mut self) -> Result<()> {
        (**self).release()
    }
}

/// UI-facing collaborator notified of session progress.
///
/// Thumbnail notifications arrive from the persistence worker thread, the
/// rest from the coordinator's thread.
pub trait SessionListener: Send + Sync {
    /// The session moved from `old` to `new`.
    fn on_session_state_changed(&self, old: SessionState, new: SessionState) {
        let _ = (old, new);
    }

    /// A hardware failure rolled back a transition.
    fn on_capture_error(&self, error: &CameraError) {
        let _ = error;
    }

    /// A thumbnail was generated for the most recent saved image.
    fn on_thumbnail_ready(&self, thumbnail: &Thumbnail) {
        let _ = thumbnail;
    }
}

/// Listener that only reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl SessionListener for LoggingListener {
    fn on_session_state_changed(&self, old: SessionState, new: SessionState) {
        tracing::info!(%old, %new, "session state changed");
    }

    fn on_capture_error(&self, error: &CameraError) {
        tracing::error!(%error, "capture failed");
    }

    fn on_thumbnail_ready(&self, thumbnail: &Thumbnail) {
        tracing::info!(
            title = %thumbnail.title,
            width = thumbnail.image.width(),
            height = thumbnail.image.height(),
            "thumbnail ready"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuyv_frame(width: u32, height: u32, yuv: (u8, u8, u8)) -> Frame {
        let format = Format::new(width, height, FourCC::YUYV);
        let mut data = Vec::with_capacity(format.size as usize);
        for _ in 0..(width * height / 2) {
            data.extend_from_slice(&[yuv.0, yuv.1, yuv.0, yuv.2]);
        }
        Frame {
            data,
            format,
            metadata: FrameMetadata {
                sequence: 0,
                timestamp: Duration::ZERO,
                bytes_used: format.size,
            },
        }
    }

    #[test]
    fn test_format_stride_by_fourcc() {
        let yuyv = Format::new(640, 480, FourCC::YUYV);
        assert_eq!(yuyv.stride, 1280);
        assert_eq!(yuyv.size, 1280 * 480);

        let rgb = Format::new(10, 10, FourCC::RGB3);
        assert_eq!(rgb.stride, 30);

        let mjpg = Format::new(640, 480, FourCC::MJPG);
        assert_eq!(mjpg.stride, 0);
        assert_eq!(mjpg.size, 0);
    }

    #[test]
    fn test_fourcc_parameter_names() {
        for fourcc in [FourCC::YUYV, FourCC::RGB3, FourCC::MJPG] {
            assert_eq!(FourCC::from_parameter(fourcc.parameter_name()), Some(fourcc));
        }
        assert_eq!(FourCC::from_parameter("nv21"), None);
        assert_eq!(FourCC::YUYV.to_string(), "YUYV");
    }

    #[test]
    fn test_pixel_at_neutral_gray() {
        let frame = yuyv_frame(4, 2, (128, 128, 128));
        assert_eq!(frame.pixel_at(0, 0), Some((128, 128, 128)));
        assert_eq!(frame.pixel_at(3, 1), Some((128, 128, 128)));
    }

    #[test]
    fn test_pixel_at_out_of_bounds() {
        let frame = yuyv_frame(4, 2, (128, 128, 128));
        assert_eq!(frame.pixel_at(4, 0), None);
        assert_eq!(frame.pixel_at(0, 2), None);
    }

    #[test]
    fn test_yuv_to_rgb_clamps() {
        let (r, _, b) = yuv_to_rgb(255, 255, 255);
        assert_eq!((r, b), (255, 255));
        let (r, _, _) = yuv_to_rgb(0, 0, 0);
        assert_eq!(r, 0);
    }
}
