//! rendering: resize frames and paste the decoration over detections
//!
//! The overlay is a plain paste: the decoration (optionally resized to the
//! detection rectangle) overwrites the frame pixels under it.  No alpha, no
//! feathering.  A placement that would leave the frame is skipped.

use std::collections::HashMap;

use anyhow::{ensure, Context, Result};
use fast_image_resize as fr;
use tracing::debug;

use crate::detection::Rect;
use crate::video::{FrameSize, RgbFrame};

/// Reusable resize context to avoid per-frame allocations.
pub struct FrameResizer {
    resizer: fr::Resizer,
}

impl FrameResizer {
    pub fn new() -> Self {
        Self {
            resizer: fr::Resizer::new(),
        }
    }

    /// Resize `frame` to `size` (bilinear).  The result keeps the source pts.
    pub fn resize(&mut self, frame: &RgbFrame, size: FrameSize) -> Result<RgbFrame> {
        ensure!(size.width > 0 && size.height > 0, "cannot resize to {size}");
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source")?;
        let mut dst = fr::images::Image::new(size.width, size.height, fr::PixelType::U8x3);

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize frame scale failed")?;

        Ok(RgbFrame {
            data: dst.into_vec(),
            width: size.width,
            height: size.height,
            pts: frame.pts,
        })
    }
}

impl Default for FrameResizer {
    fn default() -> Self {
        Self::new()
    }
}

/// The decoration bitmap, decoded once and never modified.
#[derive(Clone)]
pub struct Decoration {
    image: RgbFrame,
}

impl Decoration {
    /// Decode any image format the `image` crate understands.  Alpha is
    /// dropped; the paste never blends.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes)
            .context("failed to decode decoration image")?
            .into_rgb8();
        Self::from_rgb_image(decoded)
    }

    pub fn from_rgb_image(image: image::RgbImage) -> Result<Self> {
        let (width, height) = image.dimensions();
        ensure!(width > 0 && height > 0, "decoration image is empty");
        Ok(Self {
            image: RgbFrame {
                data: image.into_raw(),
                width,
                height,
                pts: 0,
            },
        })
    }

    pub fn solid(width: u32, height: u32, color: [u8; 3]) -> Self {
        Self {
            image: RgbFrame::filled(width.max(1), height.max(1), color),
        }
    }

    pub fn size(&self) -> FrameSize {
        self.image.size()
    }

    pub fn pixels(&self) -> &RgbFrame {
        &self.image
    }
}

/// How the decoration is sized over each detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlayMode {
    /// Resize the decoration to the detection rectangle.
    #[default]
    FitDetection,
    /// Paste at the decoration's own size from the rectangle's top-left
    /// corner, ignoring the rectangle's size.
    Native,
}

/// Counts from one [`Overlay::apply`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Overlay stage.  Keeps resized decorations keyed by size so a steady
/// detection size does not resize every frame.
pub struct Overlay {
    decoration: Decoration,
    mode: OverlayMode,
    resizer: FrameResizer,
    cache: HashMap<FrameSize, RgbFrame>,
}

/// Distinct decoration sizes kept around before the cache is flushed.
const MAX_CACHED_SIZES: usize = 64;

impl Overlay {
    pub fn new(decoration: Decoration, mode: OverlayMode) -> Self {
        Self {
            decoration,
            mode,
            resizer: FrameResizer::new(),
            cache: HashMap::new(),
        }
    }

    /// Paste the decoration over every rectangle, in order.
    pub fn apply(&mut self, frame: &mut RgbFrame, detections: &[Rect]) -> OverlayReport {
        let mut report = OverlayReport::default();
        for rect in detections {
            match self.apply_one(frame, rect) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    debug!(?rect, "overlay skipped: {e:#}");
                    report.skipped += 1;
                }
            }
        }
        report
    }

    fn apply_one(&mut self, frame: &mut RgbFrame, rect: &Rect) -> Result<()> {
        match self.mode {
            OverlayMode::Native => paste(frame, rect.x, rect.y, self.decoration.pixels()),
            OverlayMode::FitDetection => {
                let size = FrameSize::new(rect.width, rect.height);
                // Check before paying for the resize.
                ensure_fits(frame, rect.x, rect.y, size)?;
                if !self.cache.contains_key(&size) {
                    if self.cache.len() >= MAX_CACHED_SIZES {
                        self.cache.clear();
                    }
                    let resized = self.resizer.resize(self.decoration.pixels(), size)?;
                    self.cache.insert(size, resized);
                }
                let scaled = self
                    .cache
                    .get(&size)
                    .context("resized decoration missing from cache")?;
                paste(frame, rect.x, rect.y, scaled)
            }
        }
    }
}

fn ensure_fits(frame: &RgbFrame, x: u32, y: u32, size: FrameSize) -> Result<()> {
    ensure!(
        frame.data.len() == frame.byte_len(),
        "frame buffer does not match {}",
        frame.size()
    );
    ensure!(size.width > 0 && size.height > 0, "empty region {size}");
    ensure!(
        x as u64 + size.width as u64 <= frame.width as u64
            && y as u64 + size.height as u64 <= frame.height as u64,
        "region {size} at ({x}, {y}) exceeds frame {}",
        frame.size()
    );
    Ok(())
}

/// Overwrite the region of `frame` starting at `(x, y)` with `image`.
/// Fails without touching the frame if the region leaves the frame.
pub fn paste(frame: &mut RgbFrame, x: u32, y: u32, image: &RgbFrame) -> Result<()> {
    ensure_fits(frame, x, y, image.size())?;
    ensure!(
        image.data.len() == image.byte_len(),
        "pasted image buffer does not match {}",
        image.size()
    );

    let frame_stride = frame.stride();
    let row_bytes = image.stride();
    for row in 0..image.height as usize {
        let dst = (y as usize + row) * frame_stride + x as usize * 3;
        let src = row * row_bytes;
        frame.data[dst..dst + row_bytes].copy_from_slice(&image.data[src..src + row_bytes]);
    }
    Ok(())
}
