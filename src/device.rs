//! V4L2 camera implementation using the v4l crate.
//!
//! V4L2 has no separate preview and still paths, so preview is a flag and
//! every still is pulled from a short-lived mmap stream. Zoom, exposure and
//! focus map onto the standard camera-class controls when the driver exposes
//! them.

use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CameraError, Result};
use crate::mode::CaptureMode;
use crate::parameters::{keys, Parameters};
use crate::proxy::HardwareOp;
use crate::traits::{CameraHal, Format, FourCC, Frame, FrameMetadata, ShotSettings};

const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const CID_FOCUS_AUTO: u32 = 0x009a_090c;
const CID_ZOOM_ABSOLUTE: u32 = 0x009a_090d;
const CID_AUTO_FOCUS_START: u32 = 0x009a_091c;

/// `V4L2_EXPOSURE_MANUAL`.
const EXPOSURE_MANUAL: i64 = 1;

/// Buffers queued for a still capture.
const STILL_BUFFERS: u32 = 2;

/// Modes a plain V4L2 device can emulate by repeated stills.
const V4L2_MODES: [CaptureMode; 3] = [
    CaptureMode::Standard,
    CaptureMode::HighPerformanceBurst,
    CaptureMode::TemporalBracketing,
];

/// Controls discovered when the device was opened.
#[derive(Debug, Clone, Copy, Default)]
struct Controls {
    zoom: Option<(i64, i64)>,
    exposure: bool,
    focus_auto: bool,
    focus_start: bool,
}

/// Identity reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Driver name (e.g., "vivid", "uvcvideo").
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
}

/// V4L2 camera implementing [`CameraHal`].
pub struct V4L2Camera {
    index: u32,
    device: Option<Device>,
    info: DeviceInfo,
    controls: Controls,
    params: Parameters,
    previewing: bool,
}

impl V4L2Camera {
    /// Open a V4L2 device by index (e.g., 0 for /dev/video0).
    pub fn open(index: u32) -> Result<Self> {
        let (device, info, controls) = open_device(index)?;
        info!(
            index,
            driver = %info.driver,
            card = %info.card,
            "opened V4L2 device"
        );
        Ok(Self {
            index,
            device: Some(device),
            info,
            controls,
            params: Parameters::new(),
            previewing: false,
        })
    }

    /// Driver identity.
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Whether the device is currently open.
    pub const fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn device(&self, op: HardwareOp) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| CameraError::hardware(op, "device released"))
    }

    fn format(&self, op: HardwareOp) -> Result<Format> {
        let fmt = self
            .device(op)?
            .format()
            .map_err(|err| CameraError::hardware(op, err))?;
        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn set_format(&self, width: u32, height: u32, fourcc: FourCC) -> Result<Format> {
        let op = HardwareOp::SetParameters;
        let device = self.device(op)?;
        let mut fmt = device.format().map_err(|err| CameraError::hardware(op, err))?;
        fmt.width = width;
        fmt.height = height;
        fmt.fourcc = fourcc.into();

        let fmt = device
            .set_format(&fmt)
            .map_err(|err| CameraError::hardware(op, err))?;
        if (fmt.width, fmt.height) != (width, height) {
            warn!(
                requested = %format!("{width}x{height}"),
                actual = %format!("{}x{}", fmt.width, fmt.height),
                "driver adjusted picture size"
            );
        }
        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn set_control(&self, op: HardwareOp, id: u32, value: i64) -> Result<()> {
        self.device(op)?
            .set_control(Control {
                id,
                value: Value::Integer(value),
            })
            .map_err(|err| CameraError::hardware(op, err))
    }
}

fn open_device(index: u32) -> Result<(Device, DeviceInfo, Controls)> {
    let device = Device::new(index as usize)
        .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

    let caps = device
        .query_caps()
        .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::DeviceOpenFailed(format!(
            "{} cannot capture video",
            caps.card
        )));
    }

    let mut controls = Controls::default();
    // Drivers without controls report an error here; treat as none
    for description in device.query_controls().unwrap_or_default() {
        match description.id {
            CID_ZOOM_ABSOLUTE => {
                controls.zoom = Some((description.minimum, description.maximum));
            }
            CID_EXPOSURE_ABSOLUTE => controls.exposure = true,
            CID_FOCUS_AUTO => controls.focus_auto = true,
            CID_AUTO_FOCUS_START => controls.focus_start = true,
            _ => {}
        }
    }
    debug!(?controls, "camera controls discovered");

    let info = DeviceInfo {
        driver: caps.driver,
        card: caps.card,
        bus_info: caps.bus,
    };
    Ok((device, info, controls))
}

impl CameraHal for V4L2Camera {
    fn get_parameters(&mut self) -> Result<Parameters> {
        let format = self.format(HardwareOp::GetParameters)?;

        let mut params = self.params.clone();
        let modes: Vec<&str> = V4L2_MODES.iter().map(|m| m.wire_name()).collect();
        params.set_list(keys::CAPTURE_MODE_VALUES, &modes);
        params.set(
            keys::PICTURE_SIZE,
            format!("{}x{}", format.width, format.height),
        );
        params.set(keys::PICTURE_FORMAT, format.fourcc.parameter_name());

        let autofocus = self.controls.focus_auto || self.controls.focus_start;
        params.set(
            keys::FOCUS_MODE_VALUES,
            if autofocus { "auto,fixed" } else { "fixed" },
        );
        let max_zoom = self
            .controls
            .zoom
            .map_or(0, |(min, max)| u32::try_from(max - min).unwrap_or(0));
        params.set(keys::MAX_ZOOM, max_zoom);
        Ok(params)
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<()> {
        let current = self.format(HardwareOp::SetParameters)?;
        let (width, height) = params
            .get_size(keys::PICTURE_SIZE)
            .unwrap_or((current.width, current.height));
        let fourcc = params
            .get(keys::PICTURE_FORMAT)
            .and_then(FourCC::from_parameter)
            .unwrap_or(current.fourcc);

        if (width, height, fourcc) != (current.width, current.height, current.fourcc) {
            if self.previewing {
                return Err(CameraError::hardware(
                    HardwareOp::SetParameters,
                    "picture format cannot change while previewing",
                ));
            }
            self.set_format(width, height, fourcc)?;
        }

        if let (Some(zoom), Some((min, _))) = (params.get_u32(keys::ZOOM), self.controls.zoom) {
            self.set_control(
                HardwareOp::SetParameters,
                CID_ZOOM_ABSOLUTE,
                min + i64::from(zoom),
            )?;
        }

        self.params = params.clone();
        Ok(())
    }

    fn start_preview(&mut self) -> Result<()> {
        self.device(HardwareOp::StartPreview)?;
        self.previewing = true;
        Ok(())
    }

    fn stop_preview(&mut self) -> Result<()> {
        self.previewing = false;
        Ok(())
    }

    fn auto_focus(&mut self) -> Result<bool> {
        if self.controls.focus_start {
            self.set_control(HardwareOp::AutoFocus, CID_AUTO_FOCUS_START, 1)?;
        } else if self.controls.focus_auto {
            self.set_control(HardwareOp::AutoFocus, CID_FOCUS_AUTO, 1)?;
        }
        Ok(true)
    }

    fn take_picture(&mut self, shot: &ShotSettings) -> Result<Frame> {
        let op = HardwareOp::TakePicture;
        if let (Some(exposure), true) = (shot.exposure, self.controls.exposure) {
            self.set_control(op, CID_EXPOSURE_AUTO, EXPOSURE_MANUAL)?;
            // V4L2 absolute exposure is in 100 us units
            self.set_control(
                op,
                CID_EXPOSURE_ABSOLUTE,
                i64::from(exposure.exposure_us / 100).max(1),
            )?;
        }

        let format = self.format(op)?;
        let device = self.device(op)?;
        let mut stream = Stream::with_buffers(device, Type::VideoCapture, STILL_BUFFERS)
            .map_err(|err| CameraError::hardware(op, err))?;
        let (buf, meta) = stream.next().map_err(|err| CameraError::hardware(op, err))?;

        let used = (meta.bytesused as usize).min(buf.len());
        let data = buf.get(..used).unwrap_or(buf).to_vec();

        // V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        debug!(
            sequence = shot.sequence,
            index = shot.index,
            bytes = data.len(),
            "still captured"
        );
        Ok(Frame {
            data,
            format,
            metadata: FrameMetadata {
                sequence: meta.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: meta.bytesused,
            },
        })
    }

    fn reconnect(&mut self) -> Result<()> {
        self.device = None;
        self.previewing = false;
        let (device, info, controls) = open_device(self.index)
            .map_err(|err| CameraError::hardware(HardwareOp::Reconnect, err))?;
        self.device = Some(device);
        self.info = info;
        self.controls = controls;
        info!(index = self.index, "V4L2 device reopened");
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.previewing = false;
        if self.device.take().is_some() {
            info!(index = self.index, "V4L2 device released");
        }
        Ok(())
    }
}
