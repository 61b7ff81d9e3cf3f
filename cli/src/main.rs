mod preview;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use eyelens_core::{
    control::{self, Command, ControlHandle, Toggles},
    detection::{draw_boxes, ClassifierStore, DetectionParams, DetectionSet, DetectorKind, EyeDetector},
    image,
    pipeline::{FrameOutcome, Pipeline, PipelineConfig, Resources, Session},
    rendering::{Decoration, Overlay, OverlayMode},
    runtime,
    video::{
        recorder::{DEFAULT_FPS, DEFAULT_SIZE},
        Capture, CaptureSpec, FourCc, FrameSize, OutputNaming, RecorderSettings, RgbFrame,
    },
};

const EYES_CASCADE: &str = "eyes_cascade.xml";
const FACE_CASCADE: &str = "frontal_cascade_alt.xml";
const DECORATION: &str = "hypno.png";

/// Stock cascades looked up in OpenCV's data path when none is bundled.
const STOCK_EYES_CASCADE: &str = "haarcascade_eye.xml";
const STOCK_FACE_CASCADE: &str = "haarcascade_frontalface_alt.xml";

/// Fallback when `assets/hypno.png` is not found next to the binary.
const BUILTIN_DECORATION: &[u8] = include_bytes!("../../assets/hypno.png");

/// Spinner message refresh interval, in frames.
const STATUS_EVERY: u64 = 15;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "eyelens",
    version,
    about = "Paste a decoration over detected eyes in a live camera feed and record it",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live pipeline: capture → detect → overlay → record.
    ///
    /// Keys in the preview window (or typed on stdin followed by Enter):
    /// `o` toggles the overlay, `r` toggles recording, `q`/Esc quits.
    Run(RunArgs),

    /// Detect eyes in a single image and save an annotated copy.
    Detect {
        /// Input image path
        #[arg(short, long)]
        input: PathBuf,

        /// Output image path
        #[arg(short, long, default_value = "detected.png")]
        output: PathBuf,

        /// Paste the decoration instead of drawing boxes
        #[arg(long)]
        overlay: bool,

        #[command(flatten)]
        assets: AssetArgs,

        #[command(flatten)]
        tuning: TuningArgs,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Capture device (e.g. /dev/video0) or video file
    #[arg(short, long)]
    input: PathBuf,

    /// FFmpeg input device format (v4l2, avfoundation, dshow); omit for files
    #[arg(short, long)]
    format: Option<String>,

    /// Requested capture size; larger frames are downscaled to fit
    #[arg(long, default_value = "800x600")]
    max_size: FrameSize,

    #[command(flatten)]
    assets: AssetArgs,

    #[command(flatten)]
    tuning: TuningArgs,

    /// Output codec FourCC (MJPG, DIVX, XVID, FMP4, MP4V)
    #[arg(long, default_value = "MJPG")]
    codec: FourCc,

    /// Output frame rate
    #[arg(long, default_value_t = DEFAULT_FPS)]
    fps: u32,

    /// Output frame size
    #[arg(long, default_value_t = DEFAULT_SIZE)]
    out_size: FrameSize,

    /// Directory for the recorded video
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Fixed output file name instead of `<unix seconds>.avi`
    #[arg(long)]
    output_name: Option<String>,

    /// Start with the overlay switched on
    #[arg(long)]
    overlay: bool,

    /// Start with recording switched off
    #[arg(long)]
    no_record: bool,

    /// Run without the preview window; keys are read from stdin only
    #[arg(long)]
    no_preview: bool,
}

#[derive(Args)]
struct AssetArgs {
    /// Eye cascade XML (default: assets/eyes_cascade.xml, then OpenCV's haarcascade_eye.xml)
    #[arg(long)]
    eyes_cascade: Option<PathBuf>,

    /// Also load a frontal-face cascade from this path
    #[arg(long)]
    face_cascade: Option<PathBuf>,

    /// Also load the frontal-face cascade from assets or OpenCV's data path
    #[arg(long, conflicts_with = "face_cascade")]
    with_face: bool,

    /// Decoration image (default: assets/hypno.png, else the built-in spiral)
    #[arg(long)]
    decoration: Option<PathBuf>,

    /// Paste the decoration at its own size instead of fitting each eye
    #[arg(long)]
    native_size: bool,
}

#[derive(Args)]
struct TuningArgs {
    /// Minimum eye size as a fraction of the frame height
    #[arg(long, default_value_t = eyelens_core::detection::DEFAULT_SIZE_FACTOR)]
    size_factor: f64,

    /// Pyramid step between detection scales
    #[arg(long, default_value_t = eyelens_core::detection::DEFAULT_SCALE_FACTOR)]
    scale_factor: f64,

    /// Neighbouring hits needed to keep a detection
    #[arg(long, default_value_t = eyelens_core::detection::DEFAULT_MIN_NEIGHBORS)]
    min_neighbors: u32,
}

impl AssetArgs {
    /// Load every registered cascade.  Missing files leave that detector
    /// unavailable rather than aborting.
    fn classifiers(&self) -> ClassifierStore {
        let mut sources = Vec::new();
        match runtime::read_cascade(self.eyes_cascade.as_deref(), EYES_CASCADE, STOCK_EYES_CASCADE) {
            Ok(bytes) => sources.push((DetectorKind::Eyes, bytes)),
            Err(e) => warn!("eye cascade unavailable: {e:#}"),
        }
        if self.with_face || self.face_cascade.is_some() {
            match runtime::read_cascade(self.face_cascade.as_deref(), FACE_CASCADE, STOCK_FACE_CASCADE) {
                Ok(bytes) => sources.push((DetectorKind::FrontalFace, bytes)),
                Err(e) => warn!("face cascade unavailable: {e:#}"),
            }
        }
        ClassifierStore::load(sources.iter().map(|(kind, bytes)| (*kind, bytes.as_slice())))
    }

    fn decoration(&self) -> Result<Decoration> {
        let bytes = match runtime::read_resource(self.decoration.as_deref(), DECORATION) {
            Ok(bytes) => bytes,
            Err(e) if self.decoration.is_none() => {
                debug!("using built-in decoration: {e:#}");
                BUILTIN_DECORATION.to_vec()
            }
            Err(e) => return Err(e.context("decoration image is required")),
        };
        Decoration::from_bytes(&bytes).context("failed to decode decoration image")
    }

    fn overlay_mode(&self) -> OverlayMode {
        if self.native_size {
            OverlayMode::Native
        } else {
            OverlayMode::FitDetection
        }
    }
}

impl TuningArgs {
    fn params(&self) -> DetectionParams {
        DetectionParams {
            size_factor: self.size_factor,
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Detect {
            input,
            output,
            overlay,
            assets,
            tuning,
        } => cmd_detect(&input, &output, overlay, &assets, &tuning),
    }
}

// ── Live pipeline ─────────────────────────────────────────────────────────────

fn cmd_run(args: RunArgs) -> Result<()> {
    runtime::init()?;

    let config = PipelineConfig {
        detection: args.tuning.params(),
        overlay_mode: args.assets.overlay_mode(),
        recorder: RecorderSettings {
            codec: args.codec,
            fps: args.fps,
            size: args.out_size,
            output_dir: args.output_dir.clone(),
            naming: match &args.output_name {
                Some(name) => OutputNaming::Fixed(name.clone()),
                None => OutputNaming::Timestamp,
            },
            ..RecorderSettings::default()
        },
    };
    let mut pipeline = Pipeline::new(config)?;

    let store = args.assets.classifiers();
    let decoration = args.assets.decoration()?;

    let capture = Capture::open(&CaptureSpec {
        input: args.input.clone(),
        format: args.format.clone(),
        max_size: args.max_size,
    })
    .with_context(|| format!("failed to open input {}", args.input.display()))?;

    info!("eyelens");
    info!("  input  : {}", args.input.display());
    info!("  frames : {}", capture.frame_size());
    info!("  output : {} {} @ {} fps", args.codec, args.out_size, args.fps);

    let resources = Resources::open(store, decoration, pipeline.config());
    pipeline.initialize(resources)?;

    let (handle, queue) = control::channel();
    let keys = handle.clone();
    spawn_key_reader(handle);

    let mut preview = if args.no_preview {
        None
    } else {
        match preview::Preview::open() {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("preview unavailable, running headless: {e:#}");
                None
            }
        }
    };

    let toggles = Toggles::new(args.overlay, !args.no_record);
    let pb = spinner("Starting…")?;
    let pb2 = pb.clone();

    let mut frames = 0u64;
    let stats = Session::new(capture, pipeline, toggles, queue)
        .run(move |frame: &RgbFrame, outcome: &FrameOutcome, toggles: &Toggles| {
            frames += 1;
            pb2.tick();
            if let Some(window) = preview.as_mut() {
                let shown = window.show(frame).and_then(|()| window.poll());
                match shown {
                    Ok(Some(command)) => {
                        keys.send(command);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("closing preview: {e:#}");
                        preview = None;
                    }
                }
            }
            if frames % STATUS_EVERY == 0 {
                let eyes = match outcome {
                    FrameOutcome::Processed { detections, .. } => *detections,
                    FrameOutcome::PassedThrough => 0,
                };
                pb2.set_message(format!(
                    "frame {frames} | eyes {eyes} | overlay {} | rec {}  [o/r/q]",
                    on_off(toggles.overlay),
                    on_off(toggles.recording),
                ));
            }
        })
        .context("capture failed")?;

    pb.finish_with_message(format!(
        "Done: {} frames, {} recorded.",
        stats.frames, stats.recorded
    ));
    Ok(())
}

/// Map stdin lines to control commands.  EOF on stdin leaves the session
/// running until the input ends.
fn spawn_key_reader(handle: ControlHandle) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let command = match line.trim() {
                "o" => Command::ToggleOverlay,
                "r" => Command::ToggleRecording,
                "q" => Command::Shutdown,
                "" => continue,
                other => {
                    warn!("unknown key {other:?}; use o, r or q");
                    continue;
                }
            };
            if !handle.send(command) || command == Command::Shutdown {
                break;
            }
        }
    });
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

// ── Single image ──────────────────────────────────────────────────────────────

fn cmd_detect(
    input: &Path,
    output: &Path,
    overlay: bool,
    assets: &AssetArgs,
    tuning: &TuningArgs,
) -> Result<()> {
    let params = tuning.params();
    params.validate()?;

    let img = image::open(input)
        .with_context(|| format!("failed to open image: {}", input.display()))?
        .into_rgb8();
    let (width, height) = img.dimensions();
    let mut frame = RgbFrame {
        data: img.into_raw(),
        width,
        height,
        pts: 0,
    };

    let store = assets.classifiers();
    let mut detector = EyeDetector::from_store(&store, params);
    if !detector.is_available() {
        anyhow::bail!("no eye cascade could be loaded");
    }
    detector.update_min_size(frame.height);

    let mut eyes = DetectionSet::new();
    detector.detect(&frame, &mut eyes)?;
    info!("found {} eye(s) in {}", eyes.len(), input.display());
    for eye in &eyes {
        info!("  {}x{} at ({}, {})", eye.width, eye.height, eye.x, eye.y);
    }

    if overlay {
        let report = Overlay::new(assets.decoration()?, assets.overlay_mode()).apply(&mut frame, &eyes);
        info!(applied = report.applied, skipped = report.skipped, "overlay");
    } else {
        draw_boxes(&mut frame, &eyes, [0, 255, 0])?;
    }

    let annotated = image::RgbImage::from_raw(frame.width, frame.height, frame.data)
        .context("annotated frame has inconsistent dimensions")?;
    annotated
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!("saved {}", output.display());
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    Ok(pb)
}
