//! pipeline: the per-frame detect → overlay → record sequence
//!
//! The pipeline is an explicit state machine.  Until [`Pipeline::initialize`]
//! hands it the loaded detectors, decoration and recorder, frames pass through
//! untouched; after [`Pipeline::shutdown`] they pass through again and nothing
//! more is written.

use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::control::{ControlQueue, Toggles};
use crate::detection::{ClassifierStore, DetectionParams, DetectionSet, EyeDetector};
use crate::rendering::{Decoration, Overlay, OverlayMode, OverlayReport};
use crate::video::recorder::Recorder;
use crate::video::{FrameSource, RecorderSettings, RgbFrame};

/// Frames between timing reports.
const PROFILE_INTERVAL: u64 = 300;

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub detection: DetectionParams,
    pub overlay_mode: OverlayMode,
    pub recorder: RecorderSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Ready,
    Shutdown,
}

/// Everything that must exist before the first frame is processed.
pub struct Resources {
    pub store: ClassifierStore,
    pub decoration: Decoration,
    pub recorder: Recorder,
}

impl Resources {
    /// Bundle loaded detectors and decoration with a recorder opened from
    /// `config.recorder`.  A recorder that fails to open stays closed.
    pub fn open(store: ClassifierStore, decoration: Decoration, config: &PipelineConfig) -> Self {
        Self {
            store,
            decoration,
            recorder: Recorder::open(&config.recorder),
        }
    }
}

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not initialised yet, or already shut down; the frame is unchanged.
    PassedThrough,
    Processed {
        detections: usize,
        overlay: OverlayReport,
        recorded: bool,
    },
}

struct Stages {
    detector: EyeDetector,
    overlay: Overlay,
    recorder: Recorder,
    detections: DetectionSet,
}

enum Inner {
    Uninitialized,
    Ready(Box<Stages>),
    Shutdown,
}

#[derive(Default)]
struct Profile {
    frames: u64,
    detect: Duration,
    overlay: Duration,
    record: Duration,
}

impl Profile {
    fn report(&self) {
        let per_frame = |d: Duration| format!("{:.2}", d.as_secs_f64() * 1000.0 / self.frames as f64);
        info!(
            frames = self.frames,
            detect_ms_per_frame = per_frame(self.detect),
            overlay_ms_per_frame = per_frame(self.overlay),
            record_ms_per_frame = per_frame(self.record),
            "pipeline timings"
        );
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    inner: Inner,
    profile: Profile,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.detection.validate()?;
        Ok(Self {
            config,
            inner: Inner::Uninitialized,
            profile: Profile::default(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        match self.inner {
            Inner::Uninitialized => PipelineState::Uninitialized,
            Inner::Ready(_) => PipelineState::Ready,
            Inner::Shutdown => PipelineState::Shutdown,
        }
    }

    /// Move from `Uninitialized` to `Ready`.
    pub fn initialize(&mut self, resources: Resources) -> Result<()> {
        match self.inner {
            Inner::Uninitialized => {}
            Inner::Ready(_) => bail!("pipeline is already initialised"),
            Inner::Shutdown => bail!("pipeline has been shut down"),
        }

        let Resources {
            store,
            decoration,
            recorder,
        } = resources;
        let detector = EyeDetector::from_store(&store, self.config.detection);
        info!(
            detector = detector.is_available(),
            decoration = %decoration.size(),
            overlay_mode = ?self.config.overlay_mode,
            recording_open = recorder.is_open(),
            "pipeline ready"
        );
        self.inner = Inner::Ready(Box::new(Stages {
            detector,
            overlay: Overlay::new(decoration, self.config.overlay_mode),
            recorder,
            detections: DetectionSet::new(),
        }));
        Ok(())
    }

    /// Replace the detection stage, e.g. with a non-cascade detector.
    /// Only valid while `Ready`.
    pub fn set_detector(&mut self, detector: EyeDetector) -> Result<()> {
        match &mut self.inner {
            Inner::Ready(stages) => {
                stages.detector = detector;
                Ok(())
            }
            _ => bail!("pipeline is not ready"),
        }
    }

    /// Run one frame through the stages, mutating it in place.
    pub fn process(&mut self, frame: &mut RgbFrame, toggles: &Toggles) -> FrameOutcome {
        let Inner::Ready(stages) = &mut self.inner else {
            return FrameOutcome::PassedThrough;
        };

        stages.detector.update_min_size(frame.height);
        stages.detections.clear();

        let mut overlay = OverlayReport::default();
        if toggles.overlay {
            let detect_start = Instant::now();
            if let Err(e) = stages.detector.detect(frame, &mut stages.detections) {
                warn!("detection error: {e:#}");
                stages.detections.clear();
            }
            self.profile.detect += detect_start.elapsed();

            let overlay_start = Instant::now();
            overlay = stages.overlay.apply(frame, &stages.detections);
            self.profile.overlay += overlay_start.elapsed();
        }

        let record_start = Instant::now();
        let recorded = stages.recorder.record(frame, toggles.recording);
        self.profile.record += record_start.elapsed();

        self.profile.frames += 1;
        if self.profile.frames % PROFILE_INTERVAL == 0 {
            self.profile.report();
        }

        FrameOutcome::Processed {
            detections: stages.detections.len(),
            overlay,
            recorded,
        }
    }

    /// Close the recorder and stop processing.  Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        let previous = std::mem::replace(&mut self.inner, Inner::Shutdown);
        if let Inner::Ready(mut stages) = previous {
            info!(
                frames = self.profile.frames,
                recorded = stages.recorder.frames_written(),
                write_failures = stages.recorder.write_failures(),
                "pipeline shutting down"
            );
            stages.recorder.finish()?;
        }
        Ok(())
    }
}

/// Totals from a [`Session::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames: u64,
    pub recorded: u64,
    pub detections: u64,
}

/// A frame source driven through a pipeline, with toggles fed from a
/// control queue between frames.
pub struct Session<S: FrameSource> {
    source: S,
    pipeline: Pipeline,
    toggles: Toggles,
    controls: ControlQueue,
}

impl<S: FrameSource> Session<S> {
    pub fn new(source: S, pipeline: Pipeline, toggles: Toggles, controls: ControlQueue) -> Self {
        Self {
            source,
            pipeline,
            toggles,
            controls,
        }
    }

    /// Pull frames until the source ends or a shutdown command arrives.
    /// `on_frame` receives every processed frame (the display hook).
    pub fn run<F>(mut self, mut on_frame: F) -> Result<SessionStats>
    where
        F: FnMut(&RgbFrame, &FrameOutcome, &Toggles),
    {
        let result = self.pump(&mut on_frame);
        let closed = self.pipeline.shutdown();
        let stats = result?;
        closed?;
        info!(
            frames = stats.frames,
            recorded = stats.recorded,
            detections = stats.detections,
            "session finished"
        );
        Ok(stats)
    }

    fn pump<F>(&mut self, on_frame: &mut F) -> Result<SessionStats>
    where
        F: FnMut(&RgbFrame, &FrameOutcome, &Toggles),
    {
        let mut stats = SessionStats::default();
        loop {
            if self.controls.apply_pending(&mut self.toggles).shutdown {
                info!("shutdown requested");
                break;
            }
            let Some(mut frame) = self.source.next_frame()? else {
                break;
            };

            let outcome = self.pipeline.process(&mut frame, &self.toggles);
            stats.frames += 1;
            if let FrameOutcome::Processed {
                detections,
                recorded,
                ..
            } = outcome
            {
                stats.detections += detections as u64;
                stats.recorded += recorded as u64;
            }
            on_frame(&frame, &outcome, &self.toggles);
        }
        Ok(stats)
    }
}
