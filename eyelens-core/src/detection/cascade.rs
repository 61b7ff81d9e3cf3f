//! Boosted cascades loaded through OpenCV's object detector.
//!
//! Definitions are read straight from memory with a `FileStorage` in memory
//! mode, so nothing is materialised on disk.  Any cascade OpenCV itself
//! accepts (Haar with upright or tilted features, LBP) loads here.

use std::fmt;
use std::sync::Mutex;

use anyhow::{anyhow, ensure, Context, Result};
use image::GrayImage;
use opencv::{
    core::{self, FileStorage, FileStorage_Mode, Mat, Scalar, Size, Vector},
    objdetect,
    prelude::*,
};

use super::Rect;

/// Scan parameters for [`CascadeClassifier::detect_multi_scale`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanParams {
    /// Growth of the search window between pyramid levels; must be > 1.
    pub scale_factor: f64,
    /// Minimum overlapping raw hits for a detection to survive grouping.
    pub min_neighbors: u32,
    /// Windows smaller than this are not evaluated.
    pub min_size: (u32, u32),
    /// Windows larger than this are not evaluated.  `None` is unbounded.
    pub max_size: Option<(u32, u32)>,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 3,
            min_size: (0, 0),
            max_size: None,
        }
    }
}

/// A loaded cascade.  OpenCV mutates scratch buffers while scanning, so
/// concurrent callers take turns.
pub struct CascadeClassifier {
    inner: Mutex<objdetect::CascadeClassifier>,
    window: (u32, u32),
}

impl fmt::Debug for CascadeClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CascadeClassifier")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl CascadeClassifier {
    /// Parse a cascade definition (OpenCV storage XML).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(!bytes.is_empty(), "cascade definition is empty");
        let text = std::str::from_utf8(bytes).context("cascade definition is not UTF-8 text")?;

        let flags = FileStorage_Mode::READ as i32 | FileStorage_Mode::MEMORY as i32;
        let storage = FileStorage::new(text, flags, "").context("unreadable cascade storage")?;
        ensure!(storage.is_opened()?, "cascade storage could not be opened");
        let root = storage.get_first_top_level_node()?;

        // An empty path leaves the classifier unloaded until `read`.
        let mut cascade = objdetect::CascadeClassifier::new("")?;
        let loaded = cascade.read(&root).context("malformed cascade definition")?;
        ensure!(loaded && !cascade.empty()?, "no usable cascade in definition");

        let window = cascade.get_original_window_size()?;
        ensure!(
            window.width > 0 && window.height > 0,
            "cascade declares an empty detection window"
        );

        Ok(Self {
            inner: Mutex::new(cascade),
            window: (window.width as u32, window.height as u32),
        })
    }

    /// Base detection window, `(width, height)`.
    pub fn window(&self) -> (u32, u32) {
        self.window
    }

    /// Multi-scale scan of a grayscale image.
    pub fn detect_multi_scale(&self, gray: &GrayImage, params: &ScanParams) -> Result<Vec<Rect>> {
        let (width, height) = gray.dimensions();
        if width < self.window.0 || height < self.window.1 {
            return Ok(Vec::new());
        }

        let mut mat = Mat::new_rows_cols_with_default(
            height as i32,
            width as i32,
            core::CV_8UC1,
            Scalar::all(0.0),
        )?;
        mat.data_bytes_mut()?.copy_from_slice(gray.as_raw());

        let size = |(w, h): (u32, u32)| Size::new(w as i32, h as i32);
        let mut hits = Vector::<core::Rect>::new();
        let mut cascade = self
            .inner
            .lock()
            .map_err(|_| anyhow!("cascade classifier lock poisoned"))?;
        cascade.detect_multi_scale(
            &mat,
            &mut hits,
            params.scale_factor,
            params.min_neighbors as i32,
            objdetect::CASCADE_SCALE_IMAGE,
            size(params.min_size),
            params.max_size.map_or(Size::new(0, 0), size),
        )?;

        Ok(hits.iter().filter_map(to_rect).collect())
    }
}

/// OpenCV rectangles are signed; anything not fully on-image is dropped.
fn to_rect(r: core::Rect) -> Option<Rect> {
    if r.x < 0 || r.y < 0 || r.width <= 0 || r.height <= 0 {
        return None;
    }
    Some(Rect::new(r.x as u32, r.y as u32, r.width as u32, r.height as u32))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 4x4 single-stump cascade: a bright right half against a dark left half.
    pub(crate) const EDGE_CASCADE: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>4</height>
  <width>4</width>
  <stageParams><maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams><maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 0.5</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          2 0 2 4 1.</_>
        <_>
          0 0 2 4 -1.</_></rects></_></features></cascade>
</opencv_storage>
"#;

    #[test]
    fn loads_cascade_from_memory() {
        let cascade = CascadeClassifier::from_bytes(EDGE_CASCADE.as_bytes()).unwrap();
        assert_eq!(cascade.window(), (4, 4));
    }

    #[test]
    fn tilted_features_are_accepted() {
        let tilted = EDGE_CASCADE.replace("</rects>", "</rects><tilted>1</tilted>");
        let cascade = CascadeClassifier::from_bytes(tilted.as_bytes()).unwrap();
        assert_eq!(cascade.window(), (4, 4));
    }

    #[test]
    fn rejects_bad_definitions() {
        assert!(CascadeClassifier::from_bytes(b"").is_err());
        assert!(CascadeClassifier::from_bytes(&[0xff, 0xfe, 0x00]).is_err());
        assert!(CascadeClassifier::from_bytes(b"<?xml version=\"1.0\"?>\n<opencv_storage>\n</opencv_storage>\n").is_err());
    }

    #[test]
    fn images_smaller_than_the_window_yield_nothing() {
        let cascade = CascadeClassifier::from_bytes(EDGE_CASCADE.as_bytes()).unwrap();
        let hits = cascade
            .detect_multi_scale(&GrayImage::new(3, 3), &ScanParams::default())
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn scan_returns_on_image_rects() {
        let cascade = CascadeClassifier::from_bytes(EDGE_CASCADE.as_bytes()).unwrap();
        let image = GrayImage::from_fn(32, 32, |x, _| image::Luma([if x < 16 { 0 } else { 255 }]));
        let params = ScanParams {
            min_neighbors: 0,
            ..ScanParams::default()
        };
        for hit in cascade.detect_multi_scale(&image, &params).unwrap() {
            assert!(hit.right() <= 32 && hit.bottom() <= 32, "{hit:?}");
            assert!(hit.width >= 4 && hit.height >= 4, "{hit:?}");
        }
    }

    #[test]
    fn bundled_opencv_eye_cascade_loads_when_installed() {
        let path = core::find_file("haarcascades/haarcascade_eye.xml", false, true).unwrap_or_default();
        if path.is_empty() {
            return;
        }
        let bytes = std::fs::read(&path).unwrap();
        let cascade = CascadeClassifier::from_bytes(&bytes).unwrap();
        assert!(cascade.window().0 > 0);
        assert!(cascade
            .detect_multi_scale(&GrayImage::new(120, 90), &ScanParams::default())
            .is_ok());
    }

    #[test]
    fn negative_rects_are_dropped() {
        assert_eq!(to_rect(core::Rect::new(-1, 0, 4, 4)), None);
        assert_eq!(to_rect(core::Rect::new(0, 0, 0, 4)), None);
        assert_eq!(to_rect(core::Rect::new(2, 3, 4, 5)), Some(Rect::new(2, 3, 4, 5)));
    }
}
