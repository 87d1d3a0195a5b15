//! Capture session coordinator.
//!
//! Owns the session state, the capture mode and the exclusive handle to the
//! device proxy, and sequences every hardware command. All transitions run
//! on the thread that drives the coordinator; hardware completions arrive as
//! [`HardwareEvent`]s and are dispatched by [`Coordinator::handle_event`].
//!
//! ```text
//! PreviewStopped --start_preview--> Idle --begin_capture--> Capturing
//! Capturing --frame, remaining > 0--> Capturing (next shot issued)
//! Capturing --frame, remaining == 0--> Idle (preview restarted)
//! Idle --auto_focus--> Focusing --focus complete--> Idle
//! any --switch_device--> SwitchingDevice --reopened--> Idle
//! any --cancel/release--> PreviewStopped
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use crossbeam::select;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{CameraError, Result};
use crate::imaging::Orientation;
use crate::mode::CaptureMode;
use crate::parameters::{keys, ParameterStore, UpdateSet};
use crate::pipeline::{Destination, ImageStore, Location, PipelineStats, SavePipeline, SaveRequest};
use crate::proxy::{DeviceProxy, HardwareEvent, HardwareOp};
use crate::traits::{CameraHal, ExposureGain, Frame, SessionListener, ShotSettings};

/// Lifecycle state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No preview running. Initial state.
    PreviewStopped,
    /// Preview running, ready for commands.
    Idle,
    /// Focus sweep in flight.
    Focusing,
    /// Capture cycle in flight.
    Capturing,
    /// Device being reopened.
    SwitchingDevice,
}

impl SessionState {
    /// Whether no hardware operation is in flight.
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::PreviewStopped | Self::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreviewStopped => "preview-stopped",
            Self::Idle => "idle",
            Self::Focusing => "focusing",
            Self::Capturing => "capturing",
            Self::SwitchingDevice => "switching-device",
        };
        f.write_str(name)
    }
}

/// Options for one shutter action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Manual exposure applied to every frame of the cycle.
    pub exposure: Option<ExposureGain>,
    /// Single shot held for the caller's review instead of being saved.
    pub intent: bool,
}

/// The capture cycle in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotRequest {
    /// Capture cycle number.
    pub sequence: u64,
    /// Mode at issue time.
    pub mode: CaptureMode,
    /// Manual exposure, if requested.
    pub exposure: Option<ExposureGain>,
    /// Frames still expected.
    pub burst_remaining: u32,
    /// Frames in the whole cycle.
    pub burst_total: u32,
    /// Index of the frame the hardware is producing now.
    pub next_index: u32,
    /// Whether the cycle is an intent capture.
    pub intent: bool,
}

impl ShotRequest {
    const fn settings(&self) -> ShotSettings {
        ShotSettings {
            sequence: self.sequence,
            index: self.next_index,
            mode: self.mode,
            exposure: self.exposure,
        }
    }

    fn title(&self, index: u32) -> String {
        if self.burst_total > 1 {
            format!("IMG_{:05}_{index:02}", self.sequence)
        } else {
            format!("IMG_{:05}", self.sequence)
        }
    }
}

/// Typed commands accepted by [`Coordinator::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Start preview.
    StartPreview,
    /// Change capture mode.
    SetMode(CaptureMode),
    /// Trigger the shutter.
    BeginCapture(CaptureRequest),
    /// Run a focus sweep.
    AutoFocus,
    /// Change a device preference.
    SetPreference {
        /// Parameter key.
        key: String,
        /// New value.
        value: String,
    },
    /// Change zoom index.
    SetZoom(u32),
    /// Resolve a held intent capture.
    ReviewHeldFrame {
        /// Save the frame instead of discarding it.
        keep: bool,
    },
    /// Tag later captures with a display rotation in degrees.
    SetOrientation(i32),
    /// Tag later captures with a location.
    SetLocation(Option<Location>),
    /// Cancel the session.
    Cancel,
    /// Reopen the device.
    SwitchDevice,
    /// Finish the capture in flight, drain saves and release the device.
    Shutdown,
}

/// Capture session state machine.
pub struct Coordinator {
    proxy: DeviceProxy,
    events: Receiver<HardwareEvent>,
    store: ParameterStore,
    pipeline: SavePipeline,
    listener: Arc<dyn SessionListener>,
    config: SessionConfig,
    state: SessionState,
    mode: CaptureMode,
    shot: Option<ShotRequest>,
    last_sequence: u64,
    focus_sweep: Option<u64>,
    last_sweep: u64,
    device_lost: bool,
    held_frame: Option<(String, Frame)>,
    location: Option<Location>,
    orientation: Orientation,
    deferred_commit: Option<Instant>,
    saves_submitted: u64,
}

impl Coordinator {
    /// Take ownership of `hal`, start the persistence worker and negotiate
    /// initial parameters with the device.
    ///
    /// The session starts in [`SessionState::PreviewStopped`]. A configured
    /// default mode the device does not support falls back to standard.
    pub fn new<H, S>(
        hal: H,
        image_store: S,
        config: SessionConfig,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self>
    where
        H: CameraHal + Send + 'static,
        S: ImageStore,
    {
        let (proxy, events) = DeviceProxy::spawn(hal)?;
        let pipeline =
            SavePipeline::spawn(image_store, config.queue_capacity, Arc::clone(&listener))?;
        let store = ParameterStore::new(config.default_mode, &config.burst);

        let mut coordinator = Self {
            proxy,
            events,
            store,
            pipeline,
            listener,
            mode: config.default_mode,
            config,
            state: SessionState::PreviewStopped,
            shot: None,
            last_sequence: 0,
            focus_sweep: None,
            last_sweep: 0,
            device_lost: false,
            held_frame: None,
            location: None,
            orientation: Orientation::default(),
            deferred_commit: None,
            saves_submitted: 0,
        };
        coordinator.initialize()?;
        Ok(coordinator)
    }

    fn initialize(&mut self) -> Result<()> {
        self.store.mark(UpdateSet::INITIALIZE);
        self.store.commit(&self.proxy)?;

        if !self.store.capabilities().supports(self.mode) {
            warn!(mode = %self.mode, "configured mode unsupported, using standard");
            self.mode = CaptureMode::Standard;
            self.store.set_mode(CaptureMode::Standard, &self.config.burst);
            self.store.commit(&self.proxy)?;
        }
        info!(
            mode = %self.mode,
            modes = ?self.store.capabilities().modes,
            "device parameters initialized"
        );
        Ok(())
    }

    /// Current state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Active capture mode.
    pub const fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Parameter store, for reading committed values and capabilities.
    pub const fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    /// Capture cycle in flight.
    pub const fn pending_shot(&self) -> Option<&ShotRequest> {
        self.shot.as_ref()
    }

    /// Frame held by an intent capture.
    pub fn held_frame(&self) -> Option<&Frame> {
        self.held_frame.as_ref().map(|(_, frame)| frame)
    }

    /// Save requests handed to the persistence pipeline so far.
    pub const fn saves_submitted(&self) -> u64 {
        self.saves_submitted
    }

    /// Whether a parameter commit is waiting for the session to settle.
    pub const fn has_deferred_commit(&self) -> bool {
        self.deferred_commit.is_some()
    }

    fn transition(&mut self, new: SessionState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        debug!(%old, %new, "session transition");
        self.listener.on_session_state_changed(old, new);
    }

    fn surface(&self, err: CameraError) -> CameraError {
        error!(error = %err, state = %self.state, "hardware call failed");
        self.listener.on_capture_error(&err);
        err
    }

    const fn busy(&self, operation: &'static str) -> CameraError {
        CameraError::DeviceBusy {
            operation,
            state: self.state,
        }
    }

    /// Start preview: `PreviewStopped -> Idle`.
    pub fn start_preview(&mut self) -> Result<()> {
        match self.state {
            SessionState::Idle => return Ok(()),
            SessionState::PreviewStopped => {}
            _ => return Err(self.busy("start preview")),
        }

        if let Err(err) = self.store.commit(&self.proxy) {
            return Err(self.surface(err));
        }
        if let Err(err) = self.proxy.start_preview() {
            return Err(self.surface(err));
        }
        self.transition(SessionState::Idle);
        Ok(())
    }

    /// Switch capture mode. Only allowed while idle or with preview stopped.
    pub fn set_capture_mode(&mut self, mode: CaptureMode) -> Result<()> {
        if !self.state.is_settled() {
            debug!(%mode, state = %self.state, "mode change rejected");
            return Err(self.busy("change mode"));
        }
        if !self.store.capabilities().supports(mode) {
            warn!(%mode, "capture mode not supported by device");
            return Err(CameraError::UnsupportedMode(mode));
        }

        let snapshot = self.store.clone();
        self.store.set_mode(mode, &self.config.burst);
        if let Err(err) = self.store.commit(&self.proxy) {
            self.store = snapshot;
            return Err(self.surface(err));
        }

        info!(from = %self.mode, to = %mode, "capture mode changed");
        self.mode = mode;
        Ok(())
    }

    /// Trigger the shutter. Only allowed while idle; returns the capture
    /// cycle number.
    pub fn begin_capture(&mut self, request: CaptureRequest) -> Result<u64> {
        if self.state != SessionState::Idle {
            debug!(state = %self.state, "capture rejected");
            return Err(self.busy("capture"));
        }
        if self.held_frame.take().is_some() {
            warn!("discarding unreviewed intent capture");
        }

        let total = if request.intent {
            1
        } else {
            self.mode.shot_count(&self.config.burst)
        };
        let shot = ShotRequest {
            sequence: self.last_sequence + 1,
            mode: self.mode,
            exposure: request.exposure,
            burst_remaining: total,
            burst_total: total,
            next_index: 0,
            intent: request.intent,
        };

        self.transition(SessionState::Capturing);
        if let Err(err) = self.proxy.take_picture(shot.settings()) {
            self.transition(SessionState::Idle);
            return Err(self.surface(err));
        }

        self.last_sequence = shot.sequence;
        self.shot = Some(shot);
        info!(
            sequence = shot.sequence,
            mode = %shot.mode,
            frames = total,
            "capture started"
        );
        Ok(shot.sequence)
    }

    /// Run a focus sweep: `Idle -> Focusing`.
    pub fn auto_focus(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(self.busy("focus"));
        }

        self.transition(SessionState::Focusing);
        if !self.store.capabilities().auto_focus {
            debug!("fixed-focus device, focus completes immediately");
            self.transition(SessionState::Idle);
            return Ok(());
        }
        let sweep = self.last_sweep + 1;
        if let Err(err) = self.proxy.auto_focus(sweep) {
            self.transition(SessionState::Idle);
            return Err(self.surface(err));
        }
        self.last_sweep = sweep;
        self.focus_sweep = Some(sweep);
        Ok(())
    }

    /// Stop everything and return to `PreviewStopped`. Calling it again is a
    /// no-op.
    ///
    /// Hardware calls already dispatched still complete; their events are
    /// ignored.
    pub fn cancel_session(&mut self) {
        if self.state == SessionState::PreviewStopped {
            return;
        }
        if let Some(shot) = self.shot.take() {
            info!(sequence = shot.sequence, "flushing pending shot");
        }
        self.focus_sweep = None;
        if let Err(err) = self.proxy.stop_preview() {
            warn!(error = %err, "stop preview failed during cancel");
        }
        self.transition(SessionState::PreviewStopped);
    }

    /// Reopen the device and resume preview.
    ///
    /// A failure at any step leaves the session in `PreviewStopped`.
    pub fn switch_device(&mut self) -> Result<()> {
        let previous = self.state;
        self.transition(SessionState::SwitchingDevice);
        self.shot = None;
        self.focus_sweep = None;

        if previous != SessionState::PreviewStopped {
            if let Err(err) = self.proxy.stop_preview() {
                warn!(error = %err, "stop preview failed before reconnect");
            }
        }

        let reopened = self
            .proxy
            .reconnect()
            .and_then(|()| self.initialize())
            .and_then(|()| self.proxy.start_preview());
        if let Err(err) = reopened {
            self.transition(SessionState::PreviewStopped);
            return Err(self.surface(err));
        }

        self.transition(SessionState::Idle);
        Ok(())
    }

    /// Change a device preference. Deferred while a capture or focus is in
    /// flight.
    pub fn set_preference(&mut self, key: &str, value: &str) -> Result<()> {
        self.store.set_preference(key, value);
        self.commit_or_defer()
    }

    /// Change the zoom index. Deferred while a capture or focus is in flight.
    pub fn set_zoom(&mut self, level: u32) -> Result<()> {
        let max_zoom = self.store.capabilities().max_zoom;
        if level > max_zoom {
            return Err(CameraError::InvalidParameter {
                key: keys::ZOOM.to_owned(),
                value: level.to_string(),
            });
        }
        self.store.set_zoom(level);
        self.commit_or_defer()
    }

    /// Tag later captures with a display rotation.
    pub fn set_orientation(&mut self, degrees: i32) {
        self.orientation = Orientation::from_degrees(degrees);
    }

    /// Tag later captures with a location.
    pub fn set_location(&mut self, location: Option<Location>) {
        self.location = location;
    }

    fn commit_or_defer(&mut self) -> Result<()> {
        if self.state.is_settled() {
            self.deferred_commit = None;
            return self.store.commit(&self.proxy).map(drop).map_err(|err| self.surface(err));
        }
        if self.deferred_commit.is_none() {
            debug!(state = %self.state, "parameter commit deferred");
            self.deferred_commit = Some(Instant::now() + self.config.preference_retry());
        }
        Ok(())
    }

    fn retry_deferred_commit(&mut self) {
        let Some(due) = self.deferred_commit else {
            return;
        };
        let now = Instant::now();
        if now < due {
            return;
        }
        if self.state.is_settled() {
            self.deferred_commit = None;
            if let Err(err) = self.store.commit(&self.proxy) {
                self.surface(err);
            }
        } else {
            self.deferred_commit = Some(now + self.config.preference_retry());
        }
    }

    /// Save or discard the frame held by an intent capture. Returns whether a
    /// frame was held.
    pub fn review_held_frame(&mut self, keep: bool) -> Result<bool> {
        let Some((title, frame)) = self.held_frame.take() else {
            return Ok(false);
        };
        if keep {
            self.submit_save(title, frame)?;
        } else {
            debug!(%title, "held frame discarded");
        }
        Ok(true)
    }

    fn submit_save(&mut self, title: String, frame: Frame) -> Result<()> {
        let request = SaveRequest {
            width: frame.format.width,
            height: frame.format.height,
            fourcc: frame.format.fourcc,
            data: frame.data,
            destination: Destination {
                title,
                taken_at: SystemTime::now(),
            },
            location: self.location,
            orientation: self.orientation,
            thumbnail_width: self.config.thumbnail_width,
        };
        self.pipeline.submit(request)?;
        self.saves_submitted += 1;
        Ok(())
    }

    /// Dispatch one hardware completion.
    pub fn handle_event(&mut self, event: HardwareEvent) {
        match event {
            HardwareEvent::FrameReady { shot, frame } => self.on_frame_ready(shot, frame),
            HardwareEvent::FocusComplete { sweep, focused } => {
                self.on_focus_complete(sweep, focused);
            }
            HardwareEvent::Failed {
                op,
                shot,
                sweep,
                message,
            } => self.on_failure(op, shot, sweep, message),
        }
    }

    fn on_frame_ready(&mut self, settings: ShotSettings, frame: Frame) {
        let current = self.shot.filter(|shot| {
            self.state == SessionState::Capturing
                && shot.sequence == settings.sequence
                && shot.next_index == settings.index
        });
        let Some(mut shot) = current else {
            debug!(
                sequence = settings.sequence,
                index = settings.index,
                state = %self.state,
                "ignoring stale frame"
            );
            return;
        };

        shot.burst_remaining = shot.burst_remaining.saturating_sub(1);
        shot.next_index += 1;
        let title = shot.title(settings.index);

        if shot.intent {
            debug!(%title, "holding intent capture for review");
            self.held_frame = Some((title, frame));
        } else if let Err(err) = self.submit_save(title, frame) {
            error!(error = %err, "could not queue captured frame");
        }

        if shot.burst_remaining > 0 && shot.mode.is_burst() {
            self.shot = Some(shot);
            if let Err(err) = self.proxy.take_picture(shot.settings()) {
                self.shot = None;
                self.transition(SessionState::Idle);
                self.surface(err);
            }
            return;
        }

        self.shot = None;
        info!(sequence = shot.sequence, "capture complete");
        match self.proxy.start_preview() {
            Ok(()) => self.transition(SessionState::Idle),
            Err(err) => {
                self.transition(SessionState::PreviewStopped);
                self.surface(err);
            }
        }
    }

    fn on_focus_complete(&mut self, sweep: u64, focused: bool) {
        if self.state != SessionState::Focusing || self.focus_sweep != Some(sweep) {
            debug!(sweep, state = %self.state, "ignoring stale focus completion");
            return;
        }
        self.focus_sweep = None;
        self.transition(SessionState::Idle);
        if !focused {
            self.surface(CameraError::hardware(
                HardwareOp::AutoFocus,
                "focus did not lock",
            ));
        }
    }

    fn on_failure(
        &mut self,
        op: HardwareOp,
        shot: Option<ShotSettings>,
        sweep: Option<u64>,
        message: String,
    ) {
        let relevant = match op {
            HardwareOp::TakePicture => {
                self.state == SessionState::Capturing
                    && shot.is_some()
                    && shot.map(|s| (s.sequence, s.index))
                        == self.shot.map(|s| (s.sequence, s.next_index))
            }
            HardwareOp::AutoFocus => {
                self.state == SessionState::Focusing
                    && sweep.is_some()
                    && sweep == self.focus_sweep
            }
            _ => false,
        };
        if !relevant {
            debug!(%op, %message, "ignoring stale hardware failure");
            return;
        }

        self.shot = None;
        self.focus_sweep = None;
        self.transition(SessionState::Idle);
        self.surface(CameraError::Hardware { op, message });
    }

    fn on_device_lost(&mut self) {
        if self.device_lost {
            return;
        }
        self.device_lost = true;
        warn!(state = %self.state, "device event channel closed");
        let op = match self.state {
            SessionState::Capturing => HardwareOp::TakePicture,
            SessionState::Focusing => HardwareOp::AutoFocus,
            SessionState::SwitchingDevice => HardwareOp::Reconnect,
            SessionState::PreviewStopped | SessionState::Idle => return,
        };
        self.shot = None;
        self.focus_sweep = None;
        self.transition(SessionState::PreviewStopped);
        self.surface(CameraError::hardware(op, "device worker exited"));
    }

    /// Wait up to `timeout` for one hardware event and dispatch it. A due
    /// deferred commit is retried either way.
    ///
    /// Returns whether an event was handled.
    pub fn process_next(&mut self, timeout: Duration) -> bool {
        self.retry_deferred_commit();

        let wait = self.deferred_commit.map_or(timeout, |due| {
            timeout.min(due.saturating_duration_since(Instant::now()))
        });
        let handled = match self.events.recv_timeout(wait) {
            Ok(event) => {
                self.handle_event(event);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                self.on_device_lost();
                false
            }
        };

        self.retry_deferred_commit();
        handled
    }

    /// Pump events until the session is idle or stopped. Returns `false` if
    /// `timeout` expired first.
    ///
    /// Losing the device worker stops the session, so this returns as soon as
    /// the event channel closes.
    pub fn wait_until_settled(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.state.is_settled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.process_next(remaining);
        }
        true
    }

    /// Execute one command.
    pub fn execute(&mut self, command: SessionCommand) -> Result<()> {
        match command {
            SessionCommand::StartPreview => self.start_preview(),
            SessionCommand::SetMode(mode) => self.set_capture_mode(mode),
            SessionCommand::BeginCapture(request) => self.begin_capture(request).map(drop),
            SessionCommand::AutoFocus => self.auto_focus(),
            SessionCommand::SetPreference { key, value } => self.set_preference(&key, &value),
            SessionCommand::SetZoom(level) => self.set_zoom(level),
            SessionCommand::ReviewHeldFrame { keep } => self.review_held_frame(keep).map(drop),
            SessionCommand::SetOrientation(degrees) => {
                self.set_orientation(degrees);
                Ok(())
            }
            SessionCommand::SetLocation(location) => {
                self.set_location(location);
                Ok(())
            }
            SessionCommand::Cancel => {
                self.cancel_session();
                Ok(())
            }
            SessionCommand::SwitchDevice => self.switch_device(),
            SessionCommand::Shutdown => {
                self.finish_in_flight();
                Ok(())
            }
        }
    }

    fn finish_in_flight(&mut self) {
        while !self.state.is_settled() {
            match self.events.recv() {
                Ok(event) => self.handle_event(event),
                Err(_) => self.on_device_lost(),
            }
        }
    }

    /// Single-threaded event loop over `commands` and hardware events.
    ///
    /// Runs until [`SessionCommand::Shutdown`] arrives or `commands`
    /// disconnects, then finishes the capture in flight and releases the
    /// session.
    pub fn run(mut self, commands: &Receiver<SessionCommand>) -> Result<PipelineStats> {
        let events = self.events.clone();
        loop {
            let wait = self.deferred_commit.map_or(Duration::from_secs(60), |due| {
                due.saturating_duration_since(Instant::now())
            });
            let running = select! {
                recv(commands) -> command => match command {
                    Ok(SessionCommand::Shutdown) | Err(_) => false,
                    Ok(command) => {
                        if let Err(err) = self.execute(command) {
                            warn!(error = %err, "command rejected");
                        }
                        true
                    }
                },
                recv(events) -> event => match event {
                    Ok(event) => {
                        self.handle_event(event);
                        true
                    }
                    Err(_) => {
                        self.on_device_lost();
                        false
                    }
                },
                default(wait) => {
                    self.retry_deferred_commit();
                    true
                },
            };
            if !running {
                break;
            }
        }

        self.finish_in_flight();
        self.release()
    }

    /// Drain the persistence pipeline and release the device.
    pub fn release(&mut self) -> Result<PipelineStats> {
        self.cancel_session();
        let stats = self.pipeline.shutdown();
        self.proxy.release()?;
        info!(saved = stats.saved, failed = stats.failed, "session released");
        Ok(stats)
    }
}
