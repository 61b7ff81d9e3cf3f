//! control: user toggles delivered to the pipeline between frames
//!
//! Input handlers hold a [`ControlHandle`] and send commands whenever a key is
//! pressed.  The frame loop owns the [`ControlQueue`] and applies everything
//! queued so far right before it pulls the next frame, so the pipeline always
//! sees one consistent [`Toggles`] value per frame.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use tracing::{debug, info};

/// The two independent switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Toggles {
    /// Detect eyes and paste the decoration.
    pub overlay: bool,
    /// Write frames to the output video.
    pub recording: bool,
}

impl Toggles {
    pub const fn new(overlay: bool, recording: bool) -> Self {
        Self { overlay, recording }
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::ToggleOverlay => self.overlay = !self.overlay,
            Command::ToggleRecording => self.recording = !self.recording,
            Command::SetOverlay(on) => self.overlay = on,
            Command::SetRecording(on) => self.recording = on,
            Command::Shutdown => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleOverlay,
    ToggleRecording,
    SetOverlay(bool),
    SetRecording(bool),
    Shutdown,
}

/// Sending side; cheap to clone and hand to input threads.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: Sender<Command>,
}

impl ControlHandle {
    /// Queue a command.  Returns `false` once the frame loop has gone away.
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }
}

/// Receiving side, drained by the frame loop.
#[derive(Debug)]
pub struct ControlQueue {
    rx: Receiver<Command>,
}

/// What [`ControlQueue::apply_pending`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Applied {
    pub commands: usize,
    pub shutdown: bool,
}

impl ControlQueue {
    /// Fold every queued command into `toggles`, in arrival order.
    pub fn apply_pending(&self, toggles: &mut Toggles) -> Applied {
        let before = *toggles;
        let mut applied = Applied::default();
        loop {
            match self.rx.try_recv() {
                Ok(command) => {
                    debug!(?command, "control command");
                    applied.commands += 1;
                    if command == Command::Shutdown {
                        applied.shutdown = true;
                    }
                    toggles.apply(command);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if *toggles != before {
            info!(
                overlay = toggles.overlay,
                recording = toggles.recording,
                "toggles changed"
            );
        }
        applied
    }
}

pub fn channel() -> (ControlHandle, ControlQueue) {
    let (tx, rx) = mpsc::channel();
    (ControlHandle { tx }, ControlQueue { rx })
}
