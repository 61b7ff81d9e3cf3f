//! video: frames, capture and recording
//!
//! Frames travel through the pipeline as packed RGB24 buffers.  Input comes
//! from an FFmpeg demuxer (camera device or file, see [`capture`]), output goes
//! to an AVI file through [`recorder`].

pub mod capture;
pub mod recorder;

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};

pub use capture::{Capture, CaptureSpec, FrameSource};
pub use recorder::{OutputNaming, RecorderSettings, VideoRecorder};

/// A single video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
#[derive(Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    /// A black frame of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, [0, 0, 0])
    }

    /// A frame where every pixel has `color`.
    pub fn filled(width: u32, height: u32, color: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..width as usize * height as usize {
            data.extend_from_slice(&color);
        }
        Self {
            data,
            width,
            height,
            pts: 0,
        }
    }

    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.width, self.height)
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * 3
    }

    /// Buffer length implied by `width` and `height`.
    pub fn byte_len(&self) -> usize {
        self.stride() * self.height as usize
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = y as usize * self.stride() + x as usize * 3;
        match self.data.get(i..i + 3)? {
            &[r, g, b] => Some([r, g, b]),
            _ => None,
        }
    }
}

impl fmt::Debug for RgbFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RgbFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pts", &self.pts)
            .finish_non_exhaustive()
    }
}

/// Width × height of a frame or of a stream's declared geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Largest size with this size's aspect ratio that fits inside `max`.
    /// Returns `self` unchanged when it already fits.
    pub fn fit_within(self, max: FrameSize) -> FrameSize {
        if self.width <= max.width && self.height <= max.height {
            return self;
        }
        let scale = (max.width as f64 / self.width as f64).min(max.height as f64 / self.height as f64);
        FrameSize::new(
            ((self.width as f64 * scale).round() as u32).max(1),
            ((self.height as f64 * scale).round() as u32).max(1),
        )
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for FrameSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((w, h)) = s.split_once(['x', 'X']) else {
            bail!("expected WIDTHxHEIGHT, got {s:?}");
        };
        let width: u32 = w.trim().parse()?;
        let height: u32 = h.trim().parse()?;
        if width == 0 || height == 0 {
            bail!("frame size must be non-zero, got {s:?}");
        }
        Ok(Self::new(width, height))
    }
}

/// Four-character codec tag, e.g. `MJPG` or `DIVX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    pub const MJPG: FourCc = FourCc(*b"MJPG");
    pub const DIVX: FourCc = FourCc(*b"DIVX");

    pub const fn new(code: [u8; 4]) -> Self {
        Self(code)
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }

    /// Little-endian packing used by container codec tags.
    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

impl FromStr for FourCc {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            bail!("codec tag must be exactly four ASCII characters, got {s:?}");
        }
        Ok(Self([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Destination of recorded frames.
///
/// The pipeline checks [`FrameSink::is_open`] before every write; a sink that
/// failed to open simply never receives frames.
pub trait FrameSink {
    /// The frame size declared when the stream was opened.
    fn frame_size(&self) -> FrameSize;

    fn is_open(&self) -> bool;

    /// Append one frame.  Frames whose size differs from
    /// [`FrameSink::frame_size`] are rejected.
    fn write(&mut self, frame: &RgbFrame) -> Result<()>;

    /// Flush buffered data and close the stream.  Further writes fail.
    fn finish(&mut self) -> Result<()>;
}

/// BT.601 luminance, fixed point.
pub(crate) fn luma_bt601(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + 8192) >> 14) as u8
}
