//! Live preview window.
//!
//! Shows each processed frame through OpenCV's highgui and turns key presses
//! in the window into control commands.

use anyhow::{ensure, Result};
use opencv::{
    core::{self, Mat, Scalar},
    highgui, imgproc,
    prelude::*,
};

use eyelens_core::{control::Command, video::RgbFrame};

pub const WINDOW: &str = "eyelens";

const ESC: u8 = 27;

pub struct Preview {
    bgr: Mat,
}

impl Preview {
    /// Fails when no display is available.
    pub fn open() -> Result<Self> {
        highgui::named_window(WINDOW, highgui::WINDOW_AUTOSIZE)?;
        Ok(Self { bgr: Mat::default() })
    }

    pub fn show(&mut self, frame: &RgbFrame) -> Result<()> {
        ensure!(
            frame.data.len() == frame.byte_len(),
            "frame buffer does not match {}",
            frame.size()
        );
        let mut rgb = Mat::new_rows_cols_with_default(
            frame.height as i32,
            frame.width as i32,
            core::CV_8UC3,
            Scalar::all(0.0),
        )?;
        rgb.data_bytes_mut()?.copy_from_slice(&frame.data);
        imgproc::cvt_color(
            &rgb,
            &mut self.bgr,
            imgproc::COLOR_RGB2BGR,
            0,
            core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;
        highgui::imshow(WINDOW, &self.bgr)?;
        Ok(())
    }

    /// Pump window events for a millisecond and return the command bound to
    /// the key pressed, if any.
    pub fn poll(&self) -> Result<Option<Command>> {
        Ok(command_for_key(highgui::wait_key(1)?))
    }
}

impl Drop for Preview {
    fn drop(&mut self) {
        let _ = highgui::destroy_window(WINDOW);
    }
}

/// `wait_key` returns -1 when nothing was pressed; some backends set
/// modifier bits above the low byte.
pub fn command_for_key(key: i32) -> Option<Command> {
    if key < 0 {
        return None;
    }
    match (key & 0xff) as u8 {
        b'o' | b'O' => Some(Command::ToggleOverlay),
        b'r' | b'R' => Some(Command::ToggleRecording),
        b'q' | b'Q' | ESC => Some(Command::Shutdown),
        _ => None,
    }
}
