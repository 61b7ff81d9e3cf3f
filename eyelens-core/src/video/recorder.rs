//! Recording: AVI output through FFmpeg, plus the pipeline stage that feeds it.
//!
//! The output stream is opened once with a fixed codec tag, frame rate and
//! frame size.  Every written frame must match that size exactly; anything
//! else is rejected instead of being handed to the encoder.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, ensure, Context, Result};
use ffmpeg_next::{codec, encoder, format, frame, software::scaling, util::rational::Rational};
use tracing::{debug, info, warn};

use super::{FourCc, FrameSink, FrameSize, RgbFrame};
use crate::rendering::FrameResizer;

const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

pub const DEFAULT_FPS: u32 = 15;
pub const DEFAULT_SIZE: FrameSize = FrameSize::new(800, 600);
pub const DEFAULT_BIT_RATE: usize = 8_000_000;

/// How the output file is named inside the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputNaming {
    /// `<unix seconds>.avi`
    Timestamp,
    /// A fixed file name, e.g. `test.avi`.
    Fixed(String),
}

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub codec: FourCc,
    pub fps: u32,
    pub size: FrameSize,
    pub bit_rate: usize,
    pub output_dir: PathBuf,
    pub naming: OutputNaming,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            codec: FourCc::MJPG,
            fps: DEFAULT_FPS,
            size: DEFAULT_SIZE,
            bit_rate: DEFAULT_BIT_RATE,
            output_dir: PathBuf::from("."),
            naming: OutputNaming::Timestamp,
        }
    }
}

impl RecorderSettings {
    pub fn output_path(&self, now: SystemTime) -> PathBuf {
        let name = match &self.naming {
            OutputNaming::Timestamp => {
                let secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
                format!("{secs}.avi")
            }
            OutputNaming::Fixed(name) => name.clone(),
        };
        self.output_dir.join(name)
    }
}

/// Encoder and encoder-side pixel format for a codec tag.
fn encoder_for(tag: FourCc) -> Result<(codec::Id, format::Pixel)> {
    match &tag.bytes() {
        b"MJPG" => Ok((codec::Id::MJPEG, format::Pixel::YUVJ420P)),
        b"DIVX" | b"DX50" | b"XVID" | b"FMP4" | b"MP4V" => {
            Ok((codec::Id::MPEG4, format::Pixel::YUV420P))
        }
        _ => bail!("unsupported codec tag {tag}"),
    }
}

/// FFmpeg-backed AVI writer.
pub struct VideoRecorder {
    path: PathBuf,
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    time_base: Rational,
    size: FrameSize,
    next_pts: i64,
    finished: bool,
}

impl VideoRecorder {
    pub fn open(settings: &RecorderSettings) -> Result<Self> {
        ensure!(settings.fps > 0, "frame rate must be positive");
        let path = settings.output_path(SystemTime::now());
        Self::open_at(&path, settings)
    }

    pub fn open_at(path: &Path, settings: &RecorderSettings) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("could not create output directory {}", dir.display()))?;
        }

        let (codec_id, pixel_format) = encoder_for(settings.codec)?;
        let size = settings.size;

        let mut octx = format::output(&path).context("could not create output context")?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec_id)
            .with_context(|| format!("{codec_id:?} encoder not found in this FFmpeg build"))?;

        let time_base = Rational::new(1, settings.fps as i32);
        let mut out_stream = octx.add_stream(encoder_codec)?;
        let mut builder = codec::context::Context::new_with_codec(encoder_codec)
            .encoder()
            .video()?;
        builder.set_width(size.width);
        builder.set_height(size.height);
        builder.set_format(pixel_format);
        builder.set_time_base(time_base);
        builder.set_frame_rate(Some(Rational::new(settings.fps as i32, 1)));
        builder.set_bit_rate(settings.bit_rate);
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }
        if codec_id == codec::Id::MPEG4 {
            // SAFETY: the context is owned by `builder` and not yet opened;
            // codec_tag is a plain integer field read at open time.
            unsafe {
                (*builder.as_mut_ptr()).codec_tag = settings.codec.as_u32();
            }
        }

        let video_encoder = builder
            .open_as(encoder_codec)
            .with_context(|| format!("failed to open {} encoder", settings.codec))?;
        out_stream.set_parameters(&video_encoder);
        out_stream.set_time_base(time_base);
        let stream_index = out_stream.index();

        octx.write_header()
            .context("failed to write output header")?;

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            size.width,
            size.height,
            pixel_format,
            size.width,
            size.height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        debug!(
            codec = %settings.codec,
            fps = settings.fps,
            size = %size,
            "opened output video"
        );

        Ok(Self {
            path: path.to_path_buf(),
            octx,
            encoder: video_encoder,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, size.width, size.height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            time_base,
            size,
            next_pts: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain all pending packets from the encoder and write them to the muxer.
    fn drain(&mut self) -> Result<()> {
        let stream_time_base = self
            .octx
            .stream(self.stream_index)
            .context("output stream vanished")?
            .time_base();
        let mut encoded = ffmpeg_next::Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.time_base, stream_time_base);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }
}

impl FrameSink for VideoRecorder {
    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn is_open(&self) -> bool {
        !self.finished
    }

    fn write(&mut self, frame: &RgbFrame) -> Result<()> {
        ensure!(!self.finished, "output video already closed");
        ensure!(
            frame.size() == self.size,
            "frame is {} but the stream was opened at {}",
            frame.size(),
            self.size
        );
        ensure!(
            frame.data.len() == frame.byte_len(),
            "frame buffer holds {} bytes, {} expected",
            frame.data.len(),
            frame.byte_len()
        );

        let row_bytes = self.size.width as usize * 3;
        let stride = self.rgb_frame.stride(0);
        let plane = self.rgb_frame.data_mut(0);
        for row in 0..self.size.height as usize {
            let dst = row * stride;
            let src = row * row_bytes;
            plane[dst..dst + row_bytes].copy_from_slice(&frame.data[src..src + row_bytes]);
        }

        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.encoder.send_eof().context("encoder send_eof")?;
        self.drain()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        info!(path = %self.path.display(), frames = self.next_pts, "output video closed");
        Ok(())
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("failed to finalize {}: {e:#}", self.path.display());
        }
    }
}

/// Recording stage: resize to the stream geometry, then write if allowed.
pub struct Recorder {
    sink: Option<Box<dyn FrameSink>>,
    resizer: FrameResizer,
    written: u64,
    failed: u64,
}

impl Recorder {
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self {
            sink: Some(sink),
            resizer: FrameResizer::new(),
            written: 0,
            failed: 0,
        }
    }

    /// A recorder whose stream never opened; every write is dropped.
    pub fn closed() -> Self {
        Self {
            sink: None,
            resizer: FrameResizer::new(),
            written: 0,
            failed: 0,
        }
    }

    /// Open an AVI stream from `settings`.  An open failure is logged and
    /// leaves the recorder closed.
    pub fn open(settings: &RecorderSettings) -> Self {
        match VideoRecorder::open(settings) {
            Ok(recorder) => {
                info!(path = %recorder.path().display(), "recording to file");
                Self::new(Box::new(recorder))
            }
            Err(e) => {
                warn!("could not open output video, recording disabled: {e:#}");
                Self::closed()
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.as_ref().is_some_and(|s| s.is_open())
    }

    pub fn frames_written(&self) -> u64 {
        self.written
    }

    pub fn write_failures(&self) -> u64 {
        self.failed
    }

    /// Record `frame` if the stream is open and `enabled`.  Returns whether a
    /// frame was written.  The resize to the stream size is skipped when
    /// nothing will be written.
    pub fn record(&mut self, frame: &RgbFrame, enabled: bool) -> bool {
        if !enabled || !self.is_open() {
            return false;
        }
        let Some(sink) = self.sink.as_mut() else {
            return false;
        };

        let target = sink.frame_size();
        let result = if frame.data.len() != frame.byte_len() {
            Err(anyhow!("frame buffer does not match {}", frame.size()))
        } else if frame.size() == target {
            sink.write(frame)
        } else {
            self.resizer
                .resize(frame, target)
                .and_then(|resized| sink.write(&resized))
        };

        match result {
            Ok(()) => {
                self.written += 1;
                true
            }
            Err(e) => {
                self.failed += 1;
                warn!("dropping frame {}: {e:#}", frame.pts);
                false
            }
        }
    }

    /// Close the stream.  Safe to call more than once.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            debug!(written = self.written, failed = self.failed, "closing recorder");
            sink.finish()?;
        }
        Ok(())
    }
}
