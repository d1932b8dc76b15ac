//! Capture Module - Frames from the game window
//!
//! Live capture is disabled by default and requires the `vision` feature:
//! `--features vision`. Without it the loop can still be driven from
//! replayed screenshots (see [`ReplayCapture`]), which is how rule tables
//! and templates are authored offline.

mod window;

pub use window::{list_windows, WindowCapture, XcapProbe};

use chrono::{DateTime, Utc};
use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Where the frame came from, in screen coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub title: String,
    pub app_name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub minimized: bool,
}

impl WindowInfo {
    /// Metadata for frames that do not come from a live window.
    pub fn detached(width: u32, height: u32) -> Self {
        Self {
            title: String::new(),
            app_name: String::new(),
            x: 0,
            y: 0,
            width,
            height,
            minimized: false,
        }
    }

    /// Window-relative point to absolute screen point.
    pub fn to_screen(&self, x: i32, y: i32) -> (i32, i32) {
        (self.x.saturating_add(x), self.y.saturating_add(y))
    }
}

/// One captured image. Immutable once built; the luma plane is derived up
/// front so the matcher and the recognizer can share the frame read-only.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbaImage,
    luma: GrayImage,
    captured_at: DateTime<Utc>,
    window: WindowInfo,
}

impl Frame {
    pub fn new(image: RgbaImage, window: WindowInfo) -> Self {
        Self::with_timestamp(image, window, Utc::now())
    }

    pub fn with_timestamp(image: RgbaImage, window: WindowInfo, captured_at: DateTime<Utc>) -> Self {
        let luma = image::imageops::grayscale(&image);
        Self {
            image,
            luma,
            captured_at,
            window,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn luma(&self) -> &GrayImage {
        &self.luma
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn window(&self) -> &WindowInfo {
        &self.window
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Which window to follow. Matching is a case-insensitive substring test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowTarget {
    pub title: String,
    #[serde(default)]
    pub app_name: Option<String>,
}

impl WindowTarget {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            app_name: None,
        }
    }

    pub fn matches(&self, title: &str, app_name: &str) -> bool {
        let title_ok = title.to_lowercase().contains(&self.title.to_lowercase());
        let app_ok = match &self.app_name {
            Some(app) => app_name.to_lowercase().contains(&app.to_lowercase()),
            None => true,
        };
        title_ok && app_ok
    }
}

impl fmt::Display for WindowTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.app_name {
            Some(app) => write!(f, "\"{}\" ({})", self.title, app),
            None => write!(f, "\"{}\"", self.title),
        }
    }
}

/// Produces one frame per tick.
pub trait CaptureSource: Send {
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Drop any cached window handle and look the target up again.
    fn reacquire(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn describe(&self) -> String;
}

/// Answers "where is the game window right now" for the input side.
pub trait WindowProbe: Send + Sync {
    fn locate(&self) -> Option<WindowInfo>;
}

/// Probe for setups where action coordinates are already absolute.
#[derive(Debug, Clone)]
pub struct FixedWindow(pub WindowInfo);

impl WindowProbe for FixedWindow {
    fn locate(&self) -> Option<WindowInfo> {
        Some(self.0.clone())
    }
}

/// Plays back screenshots from disk, in file-name order.
pub struct ReplayCapture {
    frames: Vec<(PathBuf, RgbaImage)>,
    cursor: usize,
    cycle: bool,
}

impl ReplayCapture {
    pub fn new(frames: Vec<(PathBuf, RgbaImage)>) -> Self {
        Self {
            frames,
            cursor: 0,
            cycle: false,
        }
    }

    /// Restart from the first frame instead of running dry.
    pub fn cycle(mut self, cycle: bool) -> Self {
        self.cycle = cycle;
        self
    }

    /// Load every `.png`/`.jpg` in `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CaptureError::Failed(format!("{}: {}", dir.display(), e)))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_screenshot(path))
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            let image = image::open(&path)
                .map_err(|e| CaptureError::Failed(format!("{}: {}", path.display(), e)))?
                .to_rgba8();
            frames.push((path, image));
        }

        if frames.is_empty() {
            return Err(CaptureError::Failed(format!(
                "no screenshots found in {}",
                dir.display()
            )));
        }

        Ok(Self::new(frames))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn is_screenshot(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "png" | "jpg" | "jpeg")
}

impl CaptureSource for ReplayCapture {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        if self.cursor >= self.frames.len() {
            if !self.cycle || self.frames.is_empty() {
                return Err(CaptureError::Unavailable("replay exhausted".into()));
            }
            self.cursor = 0;
        }

        let (path, image) = &self.frames[self.cursor];
        self.cursor += 1;

        let mut window = WindowInfo::detached(image.width(), image.height());
        window.title = path.display().to_string();
        Ok(Frame::new(image.clone(), window))
    }

    fn describe(&self) -> String {
        format!("replay of {} screenshot(s)", self.frames.len())
    }
}

/// Capture errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture feature not compiled. Rebuild with --features vision")]
    FeatureNotCompiled,

    /// Target window missing, minimized, or otherwise not readable this tick.
    #[error("Capture unavailable: {0}")]
    Unavailable(String),

    #[error("Screen capture failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(w: u32, h: u32, v: u8) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([v, v, v, 255]))
    }

    #[test]
    fn test_window_target_matching() {
        let target = WindowTarget {
            title: "star rail".into(),
            app_name: Some("starrail".into()),
        };
        assert!(target.matches("Honkai: Star Rail", "StarRail.exe"));
        assert!(!target.matches("Honkai: Star Rail", "explorer.exe"));
        assert!(WindowTarget::new("rail").matches("STAR RAIL", ""));
    }

    #[test]
    fn test_frame_derives_luma() {
        let frame = Frame::new(solid(4, 3, 200), WindowInfo::detached(4, 3));
        assert_eq!(frame.luma().dimensions(), (4, 3));
        assert_eq!(frame.luma().get_pixel(0, 0)[0], 200);
    }

    #[test]
    fn test_replay_runs_dry_unless_cycling() {
        let frames = vec![
            (PathBuf::from("a.png"), solid(2, 2, 10)),
            (PathBuf::from("b.png"), solid(2, 2, 20)),
        ];
        let mut replay = ReplayCapture::new(frames.clone());
        assert!(replay.capture().is_ok());
        assert!(replay.capture().is_ok());
        assert!(matches!(replay.capture(), Err(CaptureError::Unavailable(_))));

        let mut cycling = ReplayCapture::new(frames).cycle(true);
        for _ in 0..5 {
            assert!(cycling.capture().is_ok());
        }
    }

    #[test]
    fn test_replay_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        solid(3, 3, 50).save(dir.path().join("002.png")).unwrap();
        solid(3, 3, 90).save(dir.path().join("001.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut replay = ReplayCapture::from_dir(dir.path()).unwrap();
        assert_eq!(replay.len(), 2);
        let first = replay.capture().unwrap();
        assert_eq!(first.luma().get_pixel(0, 0)[0], 90);
    }

    #[test]
    fn test_to_screen_offsets_by_window_origin() {
        let mut info = WindowInfo::detached(100, 100);
        info.x = 40;
        info.y = 30;
        assert_eq!(info.to_screen(5, 6), (45, 36));
    }
}
