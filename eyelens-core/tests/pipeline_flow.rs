//! Pipeline integration tests
//!
//! Drives full detect → overlay → record cycles with a scripted detector and an
//! in-memory video sink:
//! - toggles gate detection and recording independently
//! - overlay placement, resizing and edge skipping
//! - one written frame per processed frame, in input order

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Result};
use eyelens_core::control::Toggles;
use eyelens_core::detection::{ClassifierStore, DetectionParams, EyeDetector, Rect, RegionDetector, ScanParams};
use eyelens_core::image::GrayImage;
use eyelens_core::pipeline::{FrameOutcome, Pipeline, PipelineConfig, Resources};
use eyelens_core::rendering::{Decoration, OverlayMode};
use eyelens_core::video::recorder::Recorder;
use eyelens_core::video::{FrameSink, FrameSize, RgbFrame};

const BACKGROUND: [u8; 3] = [10, 20, 30];
const DECORATION: [u8; 3] = [250, 0, 120];

/// Returns the same rectangles every call and remembers how it was called.
struct Scripted {
    rects: Vec<Rect>,
    calls: AtomicUsize,
    last_min_size: Mutex<Option<(u32, u32)>>,
}

impl Scripted {
    fn new(rects: Vec<Rect>) -> Arc<Self> {
        Arc::new(Self {
            rects,
            calls: AtomicUsize::new(0),
            last_min_size: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RegionDetector for Scripted {
    fn detect(&self, _gray: &GrayImage, params: &ScanParams) -> Result<Vec<Rect>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_min_size.lock().unwrap() = Some(params.min_size);
        Ok(self.rects.clone())
    }
}

#[derive(Default)]
struct Tape {
    frames: Vec<RgbFrame>,
}

struct MemorySink {
    size: FrameSize,
    tape: Arc<Mutex<Tape>>,
}

impl FrameSink for MemorySink {
    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn is_open(&self) -> bool {
        true
    }

    fn write(&mut self, frame: &RgbFrame) -> Result<()> {
        ensure!(frame.size() == self.size, "size mismatch");
        self.tape.lock().unwrap().frames.push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Rig {
    pipeline: Pipeline,
    detector: Arc<Scripted>,
    tape: Arc<Mutex<Tape>>,
}

fn rig(rects: Vec<Rect>, mode: OverlayMode, sink_size: FrameSize) -> Rig {
    let config = PipelineConfig {
        overlay_mode: mode,
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(config).unwrap();

    let tape = Arc::new(Mutex::new(Tape::default()));
    let sink = MemorySink {
        size: sink_size,
        tape: Arc::clone(&tape),
    };
    pipeline
        .initialize(Resources {
            store: ClassifierStore::empty(),
            decoration: Decoration::solid(20, 20, DECORATION),
            recorder: Recorder::new(Box::new(sink)),
        })
        .unwrap();

    let detector = Scripted::new(rects);
    pipeline
        .set_detector(EyeDetector::new(
            Some(Arc::clone(&detector) as Arc<dyn RegionDetector>),
            DetectionParams::default(),
        ))
        .unwrap();

    Rig {
        pipeline,
        detector,
        tape,
    }
}

fn frame_800x600() -> RgbFrame {
    RgbFrame::filled(800, 600, BACKGROUND)
}

#[test]
fn eye_region_gets_resized_decoration() {
    let eye = Rect::new(50, 50, 40, 40);
    let mut rig = rig(vec![eye], OverlayMode::FitDetection, FrameSize::new(800, 600));
    let mut frame = frame_800x600();

    let outcome = rig.pipeline.process(&mut frame, &Toggles::new(true, false));
    assert!(matches!(outcome, FrameOutcome::Processed { detections: 1, .. }));

    // 600 px * 0.05
    assert_eq!(*rig.detector.last_min_size.lock().unwrap(), Some((30, 30)));

    for y in 0..frame.height {
        for x in 0..frame.width {
            let inside = (50..90).contains(&x) && (50..90).contains(&y);
            let expected = if inside { DECORATION } else { BACKGROUND };
            assert_eq!(frame.pixel(x, y), Some(expected), "pixel ({x}, {y})");
        }
    }
}

#[test]
fn native_mode_pastes_at_decoration_size() {
    let eye = Rect::new(50, 50, 40, 40);
    let mut rig = rig(vec![eye], OverlayMode::Native, FrameSize::new(800, 600));
    let mut frame = frame_800x600();
    rig.pipeline.process(&mut frame, &Toggles::new(true, false));

    assert_eq!(frame.pixel(69, 69), Some(DECORATION));
    assert_eq!(frame.pixel(70, 70), Some(BACKGROUND));
}

#[test]
fn detection_at_frame_edge_is_skipped() {
    let edge = Rect::new(780, 590, 40, 40);
    let mut rig = rig(vec![edge], OverlayMode::FitDetection, FrameSize::new(800, 600));
    let mut frame = frame_800x600();
    let before = frame.clone();

    let outcome = rig.pipeline.process(&mut frame, &Toggles::new(true, false));
    match outcome {
        FrameOutcome::Processed { overlay, .. } => {
            assert_eq!(overlay.applied, 0);
            assert_eq!(overlay.skipped, 1);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(frame, before);
}

#[test]
fn overlay_off_skips_detection_but_keeps_recording() {
    let mut rig = rig(
        vec![Rect::new(10, 10, 20, 20)],
        OverlayMode::FitDetection,
        FrameSize::new(800, 600),
    );

    for _ in 0..3 {
        let mut frame = frame_800x600();
        rig.pipeline.process(&mut frame, &Toggles::new(false, true));
        assert_eq!(frame, frame_800x600());
    }

    assert_eq!(rig.detector.calls(), 0);
    assert_eq!(rig.tape.lock().unwrap().frames.len(), 3);
}

#[test]
fn recording_off_writes_nothing_but_keeps_overlay() {
    let mut rig = rig(
        vec![Rect::new(10, 10, 20, 20)],
        OverlayMode::FitDetection,
        FrameSize::new(800, 600),
    );

    for _ in 0..3 {
        let mut frame = frame_800x600();
        let outcome = rig.pipeline.process(&mut frame, &Toggles::new(true, false));
        assert!(matches!(outcome, FrameOutcome::Processed { recorded: false, .. }));
        assert_eq!(frame.pixel(15, 15), Some(DECORATION));
    }

    assert_eq!(rig.detector.calls(), 3);
    assert!(rig.tape.lock().unwrap().frames.is_empty());
}

#[test]
fn every_processed_frame_is_written_once_in_order() {
    let mut rig = rig(Vec::new(), OverlayMode::FitDetection, FrameSize::new(800, 600));

    for pts in 0..10 {
        let mut frame = RgbFrame {
            pts,
            ..frame_800x600()
        };
        rig.pipeline.process(&mut frame, &Toggles::new(false, true));
    }

    let tape = rig.tape.lock().unwrap();
    let order: Vec<i64> = tape.frames.iter().map(|f| f.pts).collect();
    assert_eq!(order, (0..10).collect::<Vec<_>>());
}

#[test]
fn recorded_frames_are_resized_and_include_the_overlay() {
    let mut rig = rig(
        vec![Rect::new(0, 0, 400, 300)],
        OverlayMode::FitDetection,
        FrameSize::new(400, 300),
    );
    let mut frame = frame_800x600();
    let outcome = rig.pipeline.process(&mut frame, &Toggles::new(true, true));
    assert!(matches!(outcome, FrameOutcome::Processed { recorded: true, .. }));

    // The live frame keeps its size; the recording is scaled to the stream.
    assert_eq!(frame.size(), FrameSize::new(800, 600));
    let tape = rig.tape.lock().unwrap();
    let written = &tape.frames[0];
    assert_eq!(written.size(), FrameSize::new(400, 300));
    assert_eq!(written.pixel(50, 50), Some(DECORATION));
    assert_eq!(written.pixel(350, 250), Some(BACKGROUND));
}

#[test]
fn shutdown_stops_writes() {
    let mut rig = rig(Vec::new(), OverlayMode::FitDetection, FrameSize::new(800, 600));
    let mut frame = frame_800x600();
    rig.pipeline.process(&mut frame, &Toggles::new(false, true));
    rig.pipeline.shutdown().unwrap();
    rig.pipeline.process(&mut frame, &Toggles::new(false, true));

    assert_eq!(rig.tape.lock().unwrap().frames.len(), 1);
}

#[test]
fn malformed_frame_is_skipped_without_panicking() {
    let mut rig = rig(
        vec![Rect::new(10, 10, 20, 20)],
        OverlayMode::FitDetection,
        FrameSize::new(800, 600),
    );
    let mut frame = frame_800x600();
    frame.data.truncate(1000);

    let outcome = rig.pipeline.process(&mut frame, &Toggles::new(true, true));
    assert!(matches!(outcome, FrameOutcome::Processed { recorded: false, .. }));
    assert_eq!(frame.data.len(), 1000);
    assert!(rig.tape.lock().unwrap().frames.is_empty());
}
