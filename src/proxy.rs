//! Device proxy: runs every hardware call on one dedicated worker thread.
//!
//! Commands are executed strictly in the order they were issued. Parameter,
//! preview, reconnect and release calls block the caller until the worker
//! replies. Focus and capture return immediately and complete through the
//! [`HardwareEvent`] channel handed out by [`DeviceProxy::spawn`].

use std::fmt;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, trace, warn};

use crate::error::{CameraError, Result};
use crate::parameters::{ParameterChannel, Parameters};
use crate::traits::{CameraHal, Frame, ShotSettings};

/// Hardware operations, used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareOp {
    /// Parameter read.
    GetParameters,
    /// Parameter write.
    SetParameters,
    /// Preview start.
    StartPreview,
    /// Preview stop.
    StopPreview,
    /// Focus sweep.
    AutoFocus,
    /// Still capture.
    TakePicture,
    /// Device re-open.
    Reconnect,
    /// Device release.
    Release,
}

impl fmt::Display for HardwareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GetParameters => "get-parameters",
            Self::SetParameters => "set-parameters",
            Self::StartPreview => "start-preview",
            Self::StopPreview => "stop-preview",
            Self::AutoFocus => "auto-focus",
            Self::TakePicture => "take-picture",
            Self::Reconnect => "reconnect",
            Self::Release => "release",
        };
        f.write_str(name)
    }
}

/// Completion of an asynchronous hardware call.
#[derive(Debug)]
pub enum HardwareEvent {
    /// A still frame was captured for `shot`.
    FrameReady {
        /// Settings the frame was captured with.
        shot: ShotSettings,
        /// Captured frame.
        frame: Frame,
    },
    /// A focus sweep finished.
    FocusComplete {
        /// Sweep number passed to [`DeviceProxy::auto_focus`].
        sweep: u64,
        /// Whether focus locked.
        focused: bool,
    },
    /// An asynchronous call failed.
    Failed {
        /// Failed operation.
        op: HardwareOp,
        /// Shot the failure belongs to, for captures.
        shot: Option<ShotSettings>,
        /// Sweep the failure belongs to, for focus.
        sweep: Option<u64>,
        /// Failure description.
        message: String,
    },
}

type Reply<T> = Sender<Result<T>>;

enum Command {
    GetParameters(Reply<Parameters>),
    SetParameters(Parameters, Reply<()>),
    StartPreview(Reply<()>),
    StopPreview(Reply<()>),
    AutoFocus(u64),
    TakePicture(ShotSettings),
    Reconnect(Reply<()>),
    Release(Reply<()>),
}

/// Handle to the hardware worker thread.
///
/// Dropping the proxy closes the command queue; the worker finishes the
/// commands already queued and exits.
pub struct DeviceProxy {
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceProxy {
    /// Move `hal` onto a new worker thread.
    ///
    /// Returns the proxy and the receiving end of its event channel.
    pub fn spawn<H>(hal: H) -> Result<(Self, Receiver<HardwareEvent>)>
    where
        H: CameraHal + Send + 'static,
    {
        let (command_tx, command_rx) = channel::unbounded();
        let (event_tx, event_rx) = channel::unbounded();

        let worker = thread::Builder::new()
            .name("camera-device".to_owned())
            .spawn(move || run_worker(hal, &command_rx, &event_tx))?;

        Ok((
            Self {
                commands: Some(command_tx),
                worker: Some(worker),
            },
            event_rx,
        ))
    }

    fn send(&self, op: HardwareOp, command: Command) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| CameraError::hardware(op, "device proxy closed"))?;
        commands
            .send(command)
            .map_err(|_| CameraError::hardware(op, "device worker exited"))
    }

    fn call<T, F>(&self, op: HardwareOp, make: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> Command,
    {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.send(op, make(reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| CameraError::hardware(op, "device worker exited"))?
    }

    /// Start preview.
    pub fn start_preview(&self) -> Result<()> {
        self.call(HardwareOp::StartPreview, Command::StartPreview)
    }

    /// Stop preview.
    pub fn stop_preview(&self) -> Result<()> {
        self.call(HardwareOp::StopPreview, Command::StopPreview)
    }

    /// Queue focus sweep number `sweep`; completion arrives as
    /// [`HardwareEvent::FocusComplete`] tagged with the same number.
    pub fn auto_focus(&self, sweep: u64) -> Result<()> {
        self.send(HardwareOp::AutoFocus, Command::AutoFocus(sweep))
    }

    /// Queue a still capture; completion arrives as [`HardwareEvent::FrameReady`].
    pub fn take_picture(&self, shot: ShotSettings) -> Result<()> {
        self.send(HardwareOp::TakePicture, Command::TakePicture(shot))
    }

    /// Re-open the device.
    pub fn reconnect(&self) -> Result<()> {
        self.call(HardwareOp::Reconnect, Command::Reconnect)
    }

    /// Release the device and stop the worker.
    ///
    /// Later calls fail with a hardware error.
    pub fn release(&mut self) -> Result<()> {
        let result = self.call(HardwareOp::Release, Command::Release);
        self.shutdown();
        result
    }

    fn shutdown(&mut self) {
        self.commands.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("camera device worker panicked");
            }
        }
    }
}

impl ParameterChannel for DeviceProxy {
    fn get_parameters(&self) -> Result<Parameters> {
        self.call(HardwareOp::GetParameters, Command::GetParameters)
    }

    fn set_parameters(&self, params: &Parameters) -> Result<()> {
        let params = params.clone();
        self.call(HardwareOp::SetParameters, |reply| {
            Command::SetParameters(params, reply)
        })
    }
}

impl Drop for DeviceProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<H: CameraHal>(
    mut hal: H,
    commands: &Receiver<Command>,
    events: &Sender<HardwareEvent>,
) {
    debug!("camera device worker started");
    for command in commands {
        match command {
            Command::GetParameters(reply) => {
                respond(&reply, hal.get_parameters(), HardwareOp::GetParameters);
            }
            Command::SetParameters(params, reply) => {
                respond(&reply, hal.set_parameters(&params), HardwareOp::SetParameters);
            }
            Command::StartPreview(reply) => {
                respond(&reply, hal.start_preview(), HardwareOp::StartPreview);
            }
            Command::StopPreview(reply) => {
                respond(&reply, hal.stop_preview(), HardwareOp::StopPreview);
            }
            Command::Reconnect(reply) => {
                respond(&reply, hal.reconnect(), HardwareOp::Reconnect);
            }
            Command::Release(reply) => {
                respond(&reply, hal.release(), HardwareOp::Release);
                break;
            }
            Command::AutoFocus(sweep) => {
                let event = match hal.auto_focus() {
                    Ok(focused) => HardwareEvent::FocusComplete { sweep, focused },
                    Err(err) => HardwareEvent::Failed {
                        op: HardwareOp::AutoFocus,
                        shot: None,
                        sweep: Some(sweep),
                        message: err.to_string(),
                    },
                };
                emit(events, event);
            }
            Command::TakePicture(shot) => {
                trace!(sequence = shot.sequence, index = shot.index, "taking picture");
                let event = match hal.take_picture(&shot) {
                    Ok(frame) => HardwareEvent::FrameReady { shot, frame },
                    Err(err) => HardwareEvent::Failed {
                        op: HardwareOp::TakePicture,
                        shot: Some(shot),
                        sweep: None,
                        message: err.to_string(),
                    },
                };
                emit(events, event);
            }
        }
    }
    debug!("camera device worker stopped");
}

fn respond<T>(reply: &Reply<T>, result: Result<T>, op: HardwareOp) {
    let result = result.map_err(|err| match err {
        err @ CameraError::Hardware { .. } => err,
        other => CameraError::hardware(op, other),
    });
    if reply.send(result).is_err() {
        warn!(%op, "caller went away before the reply");
    }
}

fn emit(events: &Sender<HardwareEvent>, event: HardwareEvent) {
    if events.send(event).is_err() {
        debug!("hardware event dropped, session is gone");
    }
}
