//! Scripted camera for testing without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::mode::CaptureMode;
use crate::parameters::{keys, Parameters};
use crate::proxy::HardwareOp;
use crate::traits::{CameraHal, Format, FourCC, Frame, FrameMetadata, ShotSettings};

/// Calls recorded by [`MockHal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalCall {
    GetParameters,
    SetParameters,
    StartPreview,
    StopPreview,
    AutoFocus,
    TakePicture,
    Reconnect,
    Release,
}

impl HalCall {
    const fn op(self) -> HardwareOp {
        match self {
            Self::GetParameters => HardwareOp::GetParameters,
            Self::SetParameters => HardwareOp::SetParameters,
            Self::StartPreview => HardwareOp::StartPreview,
            Self::StopPreview => HardwareOp::StopPreview,
            Self::AutoFocus => HardwareOp::AutoFocus,
            Self::TakePicture => HardwareOp::TakePicture,
            Self::Reconnect => HardwareOp::Reconnect,
            Self::Release => HardwareOp::Release,
        }
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

#[derive(Debug)]
struct MockState {
    params: Parameters,
    calls: Vec<HalCall>,
    failures: VecDeque<(HalCall, u32)>,
    shots: Vec<ShotSettings>,
    pattern: TestPattern,
    frame_count: u32,
    focus_locks: bool,
}

/// Shared view of a [`MockHal`] that stays with the test after the HAL moves
/// onto the proxy worker.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<HalCall> {
        self.lock().calls.clone()
    }

    /// How many times `call` was made.
    pub fn count(&self, call: HalCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Settings of every take-picture call.
    pub fn shots(&self) -> Vec<ShotSettings> {
        self.lock().shots.clone()
    }

    /// Last parameter set the device accepted.
    pub fn parameters(&self) -> Parameters {
        self.lock().params.clone()
    }

    /// Make the next `call` fail.
    pub fn fail_next(&self, call: HalCall) {
        self.fail_after(call, 0);
    }

    /// Let `skip` more `call`s succeed, then fail the one after.
    pub fn fail_after(&self, call: HalCall, skip: u32) {
        self.lock().failures.push_back((call, skip));
    }

    /// Choose whether focus sweeps lock.
    pub fn set_focus_locks(&self, locks: bool) {
        self.lock().focus_locks = locks;
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

/// Mock camera implementing [`CameraHal`].
#[derive(Debug)]
pub struct MockHal {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHal {
    /// Mock supporting every capture mode with a 64x48 YUYV picture size.
    #[must_use]
    pub fn new() -> Self {
        let mut params = Parameters::new();
        let modes: Vec<&str> = CaptureMode::ALL.iter().map(|m| m.wire_name()).collect();
        params.set_list(keys::CAPTURE_MODE_VALUES, &modes);
        params.set(keys::MAX_ZOOM, 10);
        params.set(keys::ZOOM, 0);
        params.set(keys::FOCUS_MODE_VALUES, "auto,fixed");
        params.set(keys::FOCUS_MODE, "auto");
        params.set(keys::PICTURE_SIZE, "64x48");
        params.set(keys::PICTURE_FORMAT, FourCC::YUYV.parameter_name());

        Self {
            state: Arc::new(Mutex::new(MockState {
                params,
                calls: Vec::new(),
                failures: VecDeque::new(),
                shots: Vec::new(),
                pattern: TestPattern::ColorBars,
                frame_count: 0,
                focus_locks: true,
            })),
        }
    }

    /// Restrict the advertised capture modes.
    #[must_use]
    pub fn with_modes(self, modes: &[CaptureMode]) -> Self {
        let names: Vec<&str> = modes.iter().map(|m| m.wire_name()).collect();
        self.lock().params.set_list(keys::CAPTURE_MODE_VALUES, &names);
        self
    }

    /// Advertise a fixed-focus lens.
    #[must_use]
    pub fn without_autofocus(self) -> Self {
        self.lock().params.set(keys::FOCUS_MODE_VALUES, "fixed");
        self
    }

    /// Set the test pattern for frame generation.
    #[must_use]
    pub fn with_pattern(self, pattern: TestPattern) -> Self {
        self.lock().pattern = pattern;
        self
    }

    /// Handle for inspecting the mock after it moves.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    fn record(&self, call: HalCall) -> Result<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push(call);
        let fail = match state.failures.front_mut() {
            Some((failing, skip)) if *failing == call => {
                if *skip == 0 {
                    true
                } else {
                    *skip -= 1;
                    false
                }
            }
            _ => false,
        };
        if fail {
            state.failures.pop_front();
            return Err(CameraError::hardware(call.op(), "injected failure"));
        }
        Ok(state)
    }
}

impl CameraHal for MockHal {
    fn get_parameters(&mut self) -> Result<Parameters> {
        Ok(self.record(HalCall::GetParameters)?.params.clone())
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<()> {
        self.record(HalCall::SetParameters)?.params = params.clone();
        Ok(())
    }

    fn start_preview(&mut self) -> Result<()> {
        self.record(HalCall::StartPreview).map(drop)
    }

    fn stop_preview(&mut self) -> Result<()> {
        self.record(HalCall::StopPreview).map(drop)
    }

    fn auto_focus(&mut self) -> Result<bool> {
        Ok(self.record(HalCall::AutoFocus)?.focus_locks)
    }

    fn take_picture(&mut self, shot: &ShotSettings) -> Result<Frame> {
        let mut state = self.record(HalCall::TakePicture)?;
        state.shots.push(*shot);

        let (width, height) = state
            .params
            .get_size(keys::PICTURE_SIZE)
            .unwrap_or((64, 48));
        let format = Format::new(width, height, FourCC::YUYV);
        let data = generate_test_frame(&format, state.pattern);

        let seq = state.frame_count;
        state.frame_count += 1;

        Ok(Frame {
            data,
            format,
            metadata: FrameMetadata {
                sequence: seq,
                timestamp: Duration::from_millis(u64::from(seq) * 33),
                bytes_used: format.size,
            },
        })
    }

    fn reconnect(&mut self) -> Result<()> {
        self.record(HalCall::Reconnect).map(drop)
    }

    fn release(&mut self) -> Result<()> {
        self.record(HalCall::Release).map(drop)
    }
}

/// Generate YUYV test frame data based on pattern.
pub fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let size = (format.width * format.height * 2) as usize;
    let mut data = vec![0u8; size];

    match pattern {
        TestPattern::ColorBars => generate_color_bars(&mut data, format.width, format.height),
        TestPattern::Gradient => generate_gradient(&mut data, format.width, format.height),
        TestPattern::Solid(y, u, v) => generate_solid(&mut data, y, u, v),
    }

    data
}

fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    // White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];

    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let (y_val, u_val, v_val) = bars[(x / bar_width).min(7) as usize];
            let offset = ((y * width + x) * 2) as usize;
            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = u_val;
                data[offset + 2] = y_val;
                data[offset + 3] = v_val;
            }
        }
    }
}

fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = ((x * 255) / width) as u8;
            let offset = ((y * width + x) * 2) as usize;

            if offset + 3 < data.len() {
                data[offset] = y_val;
                data[offset + 1] = 128;
                data[offset + 2] = y_val;
                data[offset + 3] = 128;
            }
        }
    }
}

fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for chunk in data.chunks_exact_mut(4) {
        chunk.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shot() -> ShotSettings {
        ShotSettings {
            sequence: 1,
            index: 0,
            mode: CaptureMode::Standard,
            exposure: None,
        }
    }

    #[test]
    fn test_mock_advertises_all_modes() {
        let mut hal = MockHal::new();
        let params = hal.get_parameters().expect("get_parameters should succeed");
        assert_eq!(params.get_list(keys::CAPTURE_MODE_VALUES).len(), 5);

        let mut hal = MockHal::new().with_modes(&[CaptureMode::Standard]);
        let params = hal.get_parameters().expect("get_parameters should succeed");
        assert_eq!(params.get_list(keys::CAPTURE_MODE_VALUES), vec!["standard"]);
    }

    #[test]
    fn test_mock_frames_follow_picture_size() {
        let mut hal = MockHal::new();
        let mut params = hal.get_parameters().expect("get_parameters should succeed");
        params.set(keys::PICTURE_SIZE, "32x16");
        hal.set_parameters(&params).expect("set_parameters should succeed");

        let frame1 = hal.take_picture(&shot()).expect("take_picture should succeed");
        assert_eq!(frame1.format.width, 32);
        assert_eq!(frame1.data.len(), 32 * 16 * 2);
        assert_eq!(frame1.metadata.sequence, 0);

        let frame2 = hal.take_picture(&shot()).expect("take_picture should succeed");
        assert_eq!(frame2.metadata.sequence, 1);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let mut hal = MockHal::new();
        let handle = hal.handle();
        handle.fail_next(HalCall::StartPreview);

        assert!(hal.start_preview().is_err());
        assert!(hal.start_preview().is_ok());
        assert_eq!(handle.count(HalCall::StartPreview), 2);
    }

    #[test]
    fn test_delayed_failure_skips_earlier_calls() {
        let mut hal = MockHal::new();
        let handle = hal.handle();
        handle.fail_after(HalCall::TakePicture, 1);

        assert!(hal.take_picture(&shot()).is_ok());
        assert!(hal.take_picture(&shot()).is_err());
        assert!(hal.take_picture(&shot()).is_ok());
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);

        assert_eq!(data.len(), (640 * 480 * 2) as usize);
        // First bar is white
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Gradient);

        assert!(data[0] < 10);
        let last_row_start = (479 * 640 * 2) as usize;
        assert!(data[last_row_start + 638 * 2] > 200);
    }

    #[test]
    fn test_solid_pattern() {
        let format = Format::new(64, 64, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Solid(128, 64, 192));

        assert_eq!(&data[..4], &[128, 64, 128, 192]);
    }
}
