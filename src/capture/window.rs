//! Live window capture through xcap.
//!
//! The window is looked up by id each tick and re-matched by title when the
//! id goes stale, so a restarted game client is picked up again after
//! `reacquire`.

#[cfg(feature = "vision")]
use xcap::Window;

use super::{CaptureError, CaptureSource, Frame, WindowInfo, WindowProbe, WindowTarget};

#[cfg(feature = "vision")]
use image::RgbaImage;

/// Capture source bound to the game window.
pub struct WindowCapture {
    target: WindowTarget,
    /// Last window id that matched the target
    window_id: Option<u32>,
}

impl WindowCapture {
    pub fn new(target: WindowTarget) -> Self {
        Self {
            target,
            window_id: None,
        }
    }

    pub fn target(&self) -> &WindowTarget {
        &self.target
    }
}

#[cfg(feature = "vision")]
fn window_info(window: &Window) -> WindowInfo {
    WindowInfo {
        title: window.title().to_string(),
        app_name: window.app_name().to_string(),
        x: window.x(),
        y: window.y(),
        width: window.width(),
        height: window.height(),
        minimized: window.is_minimized(),
    }
}

#[cfg(feature = "vision")]
fn find_window(target: &WindowTarget, preferred_id: Option<u32>) -> Result<Window, CaptureError> {
    let mut windows = Window::all().map_err(|e| CaptureError::Failed(e.to_string()))?;

    if let Some(id) = preferred_id {
        if let Some(pos) = windows.iter().position(|w| w.id() == id) {
            return Ok(windows.swap_remove(pos));
        }
    }

    windows
        .into_iter()
        .find(|w| target.matches(w.title(), w.app_name()))
        .ok_or_else(|| CaptureError::Unavailable(format!("no window matching {}", target)))
}

#[cfg(feature = "vision")]
impl CaptureSource for WindowCapture {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let window = find_window(&self.target, self.window_id)?;
        self.window_id = Some(window.id());

        let info = window_info(&window);
        if info.minimized {
            return Err(CaptureError::Unavailable(format!("{} is minimized", self.target)));
        }

        let captured = window
            .capture_image()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        // xcap hands back an RGBA buffer; rebuild it with our image version
        let (width, height) = (captured.width(), captured.height());
        let image = RgbaImage::from_raw(width, height, captured.into_raw())
            .ok_or_else(|| CaptureError::Failed("capture buffer size mismatch".into()))?;

        Ok(Frame::new(image, info))
    }

    fn reacquire(&mut self) -> Result<(), CaptureError> {
        self.window_id = None;
        let window = find_window(&self.target, None)?;
        self.window_id = Some(window.id());
        tracing::info!(window = %window.title(), "reacquired capture target");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("window {}", self.target)
    }
}

#[cfg(not(feature = "vision"))]
impl CaptureSource for WindowCapture {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let _ = self.window_id;
        Err(CaptureError::FeatureNotCompiled)
    }

    fn reacquire(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::FeatureNotCompiled)
    }

    fn describe(&self) -> String {
        format!("window {} (capture not compiled)", self.target)
    }
}

/// Window probe backed by xcap, for dispatch-time focus checks.
pub struct XcapProbe {
    target: WindowTarget,
}

impl XcapProbe {
    pub fn new(target: WindowTarget) -> Self {
        Self { target }
    }
}

impl WindowProbe for XcapProbe {
    #[cfg(feature = "vision")]
    fn locate(&self) -> Option<WindowInfo> {
        find_window(&self.target, None).ok().map(|w| window_info(&w))
    }

    #[cfg(not(feature = "vision"))]
    fn locate(&self) -> Option<WindowInfo> {
        let _ = &self.target;
        None
    }
}

/// Every capturable window, for picking a `[window]` title.
#[cfg(feature = "vision")]
pub fn list_windows() -> Result<Vec<WindowInfo>, CaptureError> {
    let windows = Window::all().map_err(|e| CaptureError::Failed(e.to_string()))?;
    Ok(windows.iter().map(window_info).collect())
}

#[cfg(not(feature = "vision"))]
pub fn list_windows() -> Result<Vec<WindowInfo>, CaptureError> {
    Err(CaptureError::FeatureNotCompiled)
}
