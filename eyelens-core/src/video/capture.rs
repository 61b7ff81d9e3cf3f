//! Frame sources backed by FFmpeg demuxers.
//!
//! A capture device (`/dev/video0` with the `v4l2` demuxer, `0` with
//! `avfoundation`, ...) and a plain video file go through the same decode path:
//! packets are pulled on demand and every decoded picture is converted to
//! RGB24, downscaled if it exceeds the configured maximum size.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, decoder, format, frame, media, software::scaling, Dictionary, Packet};
use tracing::{debug, info};

use super::{FrameSize, RgbFrame};

/// Scaling flags for the decode → RGB conversion.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// Anything that hands out successive frames.  `Ok(None)` ends the stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<RgbFrame>>;
}

/// Where to read frames from.
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    /// Device path, file path or URL.
    pub input: PathBuf,
    /// FFmpeg input device/demuxer name (`v4l2`, `avfoundation`, `dshow`).
    /// `None` lets FFmpeg detect the input format, which is what files need.
    pub format: Option<String>,
    /// Frames are requested at, and downscaled to fit within, this size.
    pub max_size: FrameSize,
}

/// Decoding frame source.
pub struct Capture {
    ictx: format::context::Input,
    decoder: decoder::Video,
    stream_index: usize,
    to_rgb: scaling::Context,
    decoded: frame::Video,
    rgb: frame::Video,
    out_size: FrameSize,
    eof_sent: bool,
    frames: u64,
}

impl Capture {
    pub fn open(spec: &CaptureSpec) -> Result<Self> {
        let mut options = Dictionary::new();
        let ictx = match spec.format.as_deref() {
            Some(name) => {
                // Devices honour a requested size; files would reject it.
                options.set("video_size", &spec.max_size.to_string());
                let device = find_input_format(name)?;
                format::open_with(&spec.input, &format::Format::Input(device), options)
                    .with_context(|| format!("could not open {} via {name}", spec.input.display()))?
                    .input()
            }
            None => format::input_with_dictionary(&spec.input, options)
                .with_context(|| format!("could not open input {}", spec.input.display()))?,
        };

        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        let stream_index = stream.index();

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let src = FrameSize::new(decoder.width(), decoder.height());
        let out_size = src.fit_within(spec.max_size);

        let to_rgb = scaling::Context::get(
            decoder.format(),
            src.width,
            src.height,
            format::Pixel::RGB24,
            out_size.width,
            out_size.height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        info!(
            input = %spec.input.display(),
            source = %src,
            output = %out_size,
            pixel_format = ?decoder.format(),
            "opened capture stream"
        );

        Ok(Self {
            ictx,
            decoder,
            stream_index,
            to_rgb,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            out_size,
            eof_sent: false,
            frames: 0,
        })
    }

    /// Size of the frames this source produces.
    pub fn frame_size(&self) -> FrameSize {
        self.out_size
    }

    fn convert(&mut self) -> Result<RgbFrame> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let width = self.out_size.width as usize;
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let mut data = Vec::with_capacity(width * self.out_size.height as usize * 3);
        for row in 0..self.out_size.height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + width * 3]);
        }

        let pts = self.decoded.pts().unwrap_or(self.frames as i64);
        self.frames += 1;
        Ok(RgbFrame {
            data,
            width: self.out_size.width,
            height: self.out_size.height,
            pts,
        })
    }
}

impl FrameSource for Capture {
    fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            match self.decoder.receive_frame(&mut self.decoded) {
                Ok(()) => return self.convert().map(Some),
                Err(ffmpeg::Error::Eof) => {
                    debug!(frames = self.frames, "capture stream drained");
                    return Ok(None);
                }
                // The decoder wants more input.
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {}
                Err(e) => return Err(e).context("decoder receive_frame"),
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("decoder send_packet")?;
                    }
                }
                Err(ffmpeg::Error::Eof) if self.eof_sent => return Ok(None),
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().context("decoder send_eof")?;
                    self.eof_sent = true;
                }
                Err(e) => return Err(e).context("failed to read packet"),
            }
        }
    }
}

fn find_input_format(name: &str) -> Result<format::format::Input> {
    ffmpeg::device::input::video()
        .find(|f| f.name().split(',').any(|n| n == name))
        .ok_or_else(|| anyhow!("FFmpeg input device {name:?} is not available"))
}
