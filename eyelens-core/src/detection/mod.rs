//! detection: cascade loading and per-frame eye detection
//!
//! The classifier store loads only the detectors registered as active.  A
//! detector that fails to load is reported once and treated as unavailable:
//! detection then yields nothing instead of failing the frame.
//!
//! Every frame is detected independently; the detection set is cleared at the
//! start of each call, so results never leak from one frame to the next.

pub mod cascade;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::rect::Rect as DrawRect;
use tracing::{debug, info, warn};

pub use cascade::{CascadeClassifier, ScanParams};

use crate::video::{luma_bt601, RgbFrame};

// ── Defaults ─────────────────────────────────────────────────────────────────

/// Fraction of the frame height used as the minimum detection size.
pub const DEFAULT_SIZE_FACTOR: f64 = 0.05;
/// Window growth between pyramid levels.
pub const DEFAULT_SCALE_FACTOR: f64 = 2.0;
/// Raw hits needed to keep a detection.
pub const DEFAULT_MIN_NEIGHBORS: u32 = 1;

// ── Public types ─────────────────────────────────────────────────────────────

/// Axis-aligned rectangle in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }
}

/// Ordered detections of one frame.
pub type DetectionSet = Vec<Rect>;

/// Detection tuning.  Trades sensitivity against frame rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Minimum detection size as a fraction of the frame height.
    pub size_factor: f64,
    pub scale_factor: f64,
    pub min_neighbors: u32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            size_factor: DEFAULT_SIZE_FACTOR,
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
        }
    }
}

impl DetectionParams {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.size_factor.is_finite() && self.size_factor > 0.0,
            "size factor must be positive, got {}",
            self.size_factor
        );
        ensure!(
            self.scale_factor.is_finite() && self.scale_factor > 1.0,
            "scale factor must be greater than 1, got {}",
            self.scale_factor
        );
        Ok(())
    }
}

/// Minimum detection size derived from the frame height.  A height that
/// rounds to zero keeps the last useful value.
#[derive(Debug, Clone, Copy)]
pub struct MinSizeTracker {
    size_factor: f64,
    current: u32,
}

impl MinSizeTracker {
    pub fn new(size_factor: f64) -> Self {
        Self {
            size_factor,
            current: 0,
        }
    }

    pub fn update(&mut self, frame_height: u32) -> u32 {
        let candidate = (frame_height as f64 * self.size_factor).round();
        if candidate > 0.0 {
            self.current = candidate as u32;
        }
        self.current
    }

    pub fn current(&self) -> u32 {
        self.current
    }
}

// ── Classifier store ─────────────────────────────────────────────────────────

/// The cascades the pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorKind {
    Eyes,
    FrontalFace,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorKind::Eyes => "eyes",
            DetectorKind::FrontalFace => "frontal-face",
        })
    }
}

/// Loaded detectors, keyed by kind.  Kinds that were not registered or that
/// failed to load are absent.
#[derive(Debug, Default, Clone)]
pub struct ClassifierStore {
    detectors: HashMap<DetectorKind, Arc<CascadeClassifier>>,
}

impl ClassifierStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every registered `(kind, definition bytes)` pair.  Never fails;
    /// broken definitions are logged and left out.
    pub fn load<'a, I>(sources: I) -> Self
    where
        I: IntoIterator<Item = (DetectorKind, &'a [u8])>,
    {
        let mut store = Self::default();
        for (kind, bytes) in sources {
            store.insert_from_bytes(kind, bytes);
        }
        store
    }

    /// Load one definition.  Returns whether the detector is now available.
    pub fn insert_from_bytes(&mut self, kind: DetectorKind, bytes: &[u8]) -> bool {
        match CascadeClassifier::from_bytes(bytes) {
            Ok(cascade) => {
                info!(%kind, window = ?cascade.window(), "loaded cascade");
                self.detectors.insert(kind, Arc::new(cascade));
                true
            }
            Err(e) => {
                warn!(%kind, "failed to load cascade classifier: {e:#}");
                self.detectors.remove(&kind);
                false
            }
        }
    }

    pub fn get(&self, kind: DetectorKind) -> Option<&Arc<CascadeClassifier>> {
        self.detectors.get(&kind)
    }

    pub fn is_available(&self, kind: DetectorKind) -> bool {
        self.detectors.contains_key(&kind)
    }
}

// ── Detection stage ──────────────────────────────────────────────────────────

/// Anything that can find eyes in a grayscale image.  The pipeline uses a
/// cascade; tests substitute fixed answers.
pub trait RegionDetector: Send + Sync {
    fn detect(&self, gray: &GrayImage, params: &ScanParams) -> Result<Vec<Rect>>;
}

impl RegionDetector for CascadeClassifier {
    fn detect(&self, gray: &GrayImage, params: &ScanParams) -> Result<Vec<Rect>> {
        self.detect_multi_scale(gray, params)
    }
}

/// Detection stage: grayscale conversion, min-size bookkeeping and the scan.
pub struct EyeDetector {
    detector: Option<Arc<dyn RegionDetector>>,
    params: DetectionParams,
    min_size: MinSizeTracker,
}

impl EyeDetector {
    pub fn new(detector: Option<Arc<dyn RegionDetector>>, params: DetectionParams) -> Self {
        if detector.is_none() {
            warn!("eye detector unavailable; overlay will have nothing to draw on");
        }
        Self {
            detector,
            params,
            min_size: MinSizeTracker::new(params.size_factor),
        }
    }

    /// Build from the store's eye cascade, if it loaded.
    pub fn from_store(store: &ClassifierStore, params: DetectionParams) -> Self {
        let detector = store
            .get(DetectorKind::Eyes)
            .map(|c| Arc::clone(c) as Arc<dyn RegionDetector>);
        Self::new(detector, params)
    }

    pub fn is_available(&self) -> bool {
        self.detector.is_some()
    }

    /// Refresh the minimum detection size from the frame height.  Runs every
    /// frame, whether or not detection does.
    pub fn update_min_size(&mut self, frame_height: u32) -> u32 {
        self.min_size.update(frame_height)
    }

    pub fn min_size(&self) -> u32 {
        self.min_size.current()
    }

    /// Replace `out` with this frame's detections.
    pub fn detect(&self, frame: &RgbFrame, out: &mut DetectionSet) -> Result<()> {
        out.clear();
        let Some(detector) = self.detector.as_ref() else {
            return Ok(());
        };

        let gray = to_gray_image(frame)?;
        let min = self.min_size.current();
        let params = ScanParams {
            scale_factor: self.params.scale_factor,
            min_neighbors: self.params.min_neighbors,
            min_size: (min, min),
            max_size: None,
        };
        out.extend(detector.detect(&gray, &params)?);
        debug!(count = out.len(), min_size = min, "eyes detected");
        Ok(())
    }
}

/// Grayscale copy of an RGB frame.
pub fn to_gray_image(frame: &RgbFrame) -> Result<GrayImage> {
    let luma: Vec<u8> = frame
        .data
        .chunks_exact(3)
        .map(|p| luma_bt601(p[0], p[1], p[2]))
        .collect();
    GrayImage::from_raw(frame.width, frame.height, luma)
        .context("frame buffer does not match its dimensions")
}

// ── Debug rendering ──────────────────────────────────────────────────────────

/// Draw rectangle outlines onto a frame in-place.
pub fn draw_boxes(frame: &mut RgbFrame, boxes: &[Rect], color: [u8; 3]) -> Result<()> {
    ensure!(
        frame.data.len() == frame.byte_len(),
        "frame buffer does not match {}x{}",
        frame.width,
        frame.height
    );
    // Borrow the buffer for imageproc and hand it back afterwards.
    let data = std::mem::take(&mut frame.data);
    let mut img = RgbImage::from_raw(frame.width, frame.height, data)
        .context("frame buffer does not match its dimensions")?;

    for rect in boxes.iter().filter(|r| r.width > 0 && r.height > 0) {
        let outline = DrawRect::at(rect.x as i32, rect.y as i32).of_size(rect.width, rect.height);
        imageproc::drawing::draw_hollow_rect_mut(&mut img, outline, Rgb(color));
    }

    frame.data = img.into_raw();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::cascade::tests::EDGE_CASCADE;

    struct Fixed(Vec<Rect>);

    impl RegionDetector for Fixed {
        fn detect(&self, _gray: &GrayImage, _params: &ScanParams) -> Result<Vec<Rect>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn min_size_follows_height_and_never_drops_to_zero() {
        let mut tracker = MinSizeTracker::new(0.05);
        assert_eq!(tracker.update(600), 30);
        assert_eq!(tracker.update(480), 24);
        // 9 * 0.05 = 0.45 rounds to 0: keep the previous value.
        assert_eq!(tracker.update(9), 24);
        assert_eq!(tracker.update(0), 24);
        assert_eq!(tracker.update(10), 1);

        let mut fresh = MinSizeTracker::new(0.1);
        assert_eq!(fresh.update(4), 0);
        assert_eq!(fresh.update(5), 1);
    }

    #[test]
    fn params_are_validated() {
        assert!(DetectionParams::default().validate().is_ok());
        let bad_scale = DetectionParams {
            scale_factor: 1.0,
            ..DetectionParams::default()
        };
        assert!(bad_scale.validate().is_err());
        let bad_size = DetectionParams {
            size_factor: 0.0,
            ..DetectionParams::default()
        };
        assert!(bad_size.validate().is_err());
    }

    #[test]
    fn store_loads_only_valid_registered_detectors() {
        let store = ClassifierStore::load([
            (DetectorKind::Eyes, EDGE_CASCADE.as_bytes()),
            (DetectorKind::FrontalFace, b"".as_slice()),
        ]);
        assert!(store.is_available(DetectorKind::Eyes));
        assert!(!store.is_available(DetectorKind::FrontalFace));

        let eyes_only = ClassifierStore::load([(DetectorKind::Eyes, EDGE_CASCADE.as_bytes())]);
        assert!(eyes_only.get(DetectorKind::FrontalFace).is_none());
    }

    #[test]
    fn unavailable_detector_clears_and_yields_nothing() {
        let detector = EyeDetector::from_store(&ClassifierStore::empty(), DetectionParams::default());
        assert!(!detector.is_available());

        let mut out = vec![Rect::new(1, 2, 3, 4)];
        detector.detect(&RgbFrame::new(32, 32), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn detection_replaces_previous_results() {
        let hit = Rect::new(5, 5, 10, 10);
        let detector = EyeDetector::new(Some(Arc::new(Fixed(vec![hit]))), DetectionParams::default());

        let mut out = vec![Rect::new(0, 0, 1, 1), Rect::new(2, 2, 1, 1)];
        detector.detect(&RgbFrame::new(32, 32), &mut out).unwrap();
        assert_eq!(out, vec![hit]);
    }

    #[test]
    fn draw_boxes_outlines_only() {
        let mut frame = RgbFrame::new(20, 20);
        draw_boxes(&mut frame, &[Rect::new(5, 5, 10, 10)], [0, 255, 0]).unwrap();
        assert_eq!(frame.pixel(5, 5), Some([0, 255, 0]));
        assert_eq!(frame.pixel(14, 10), Some([0, 255, 0]));
        assert_eq!(frame.pixel(10, 10), Some([0, 0, 0]));
    }

    #[test]
    fn draw_boxes_leaves_malformed_frames_intact() {
        let mut frame = RgbFrame::new(20, 20);
        frame.data.truncate(30);
        assert!(draw_boxes(&mut frame, &[Rect::new(1, 1, 4, 4)], [255, 0, 0]).is_err());
        assert_eq!(frame.data.len(), 30);
    }

    #[test]
    fn detector_errors_surface_and_leave_no_detections() {
        struct Broken;
        impl RegionDetector for Broken {
            fn detect(&self, _gray: &GrayImage, _params: &ScanParams) -> Result<Vec<Rect>> {
                anyhow::bail!("scan failed")
            }
        }

        let detector = EyeDetector::new(Some(Arc::new(Broken)), DetectionParams::default());
        let mut out = vec![Rect::new(0, 0, 1, 1)];
        assert!(detector.detect(&RgbFrame::new(8, 8), &mut out).is_err());
        assert!(out.is_empty());
    }
}
