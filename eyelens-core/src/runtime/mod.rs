use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;

/// Directory that holds cascades and the decoration image.
pub const ASSET_DIR: &str = "assets";

/// Bring up FFmpeg (formats, codecs and capture devices).  Nothing can be
/// captured or recorded without it, so failure is fatal to the caller.
pub fn init() -> Result<()> {
    ffmpeg::init().context("failed to initialise FFmpeg")?;
    // FFmpeg logs to stderr on its own; keep it to real errors.
    ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
    tracing::debug!("FFmpeg initialised");
    Ok(())
}

/// Locate a bundled resource by file name.
///
/// Search order:
/// 1) `assets/<name>` under the current directory
/// 2) `assets/<name>` under the executable's directory and its ancestors
pub fn find_resource(name: &str) -> Option<PathBuf> {
    let found = resource_candidates(name).into_iter().find(|p| p.is_file());
    match &found {
        Some(path) => tracing::debug!(path = %path.display(), "resolved resource"),
        None => tracing::debug!(name, "resource not found in any asset directory"),
    }
    found
}

/// Read a resource: an explicit path if given, otherwise the bundled copy.
pub fn read_resource(explicit: Option<&Path>, bundled_name: &str) -> Result<Vec<u8>> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => find_resource(bundled_name)
            .with_context(|| format!("bundled resource {bundled_name} not found"))?,
    };
    std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
}

/// Locate a file shipped with OpenCV itself (`haarcascades/...`), searched
/// through OpenCV's data path (`OPENCV_SAMPLES_DATA_PATH` and friends).
pub fn find_opencv_data(relative: &str) -> Option<PathBuf> {
    match opencv::core::find_file(relative, false, true) {
        Ok(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => None,
    }
}

/// Read a cascade definition: an explicit path, the bundled copy, or the
/// stock cascade of the same kind from OpenCV's data directory.
pub fn read_cascade(explicit: Option<&Path>, bundled_name: &str, stock_name: &str) -> Result<Vec<u8>> {
    if explicit.is_some() || find_resource(bundled_name).is_some() {
        return read_resource(explicit, bundled_name);
    }
    let path = find_opencv_data(&format!("haarcascades/{stock_name}")).with_context(|| {
        format!("{bundled_name} is not bundled and OpenCV has no {stock_name}")
    })?;
    tracing::debug!(path = %path.display(), "using OpenCV stock cascade");
    std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
}

fn resource_candidates(name: &str) -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..7 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    roots.into_iter().map(|root| root.join(ASSET_DIR).join(name)).collect()
}
