//! Text recognition.
//!
//! The OCR engine is a pluggable [`OcrBackend`]. The recognizer crops the
//! configured regions, turns rotated text upright, maps boxes back into
//! frame coordinates, drops low-confidence spans and optionally merges
//! spans that sit on the same line.

use chrono::{DateTime, Utc};
use image::{imageops, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};
use std::process::{Child, Command, Stdio};

use super::geometry::Rect;
use crate::capture::Frame;

/// Rotation applied to a region before reading it, to make its text upright.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    #[default]
    None,
    /// Rotate the crop 90 degrees clockwise
    Cw90,
    /// Rotate the crop 90 degrees counter-clockwise
    Ccw90,
    /// Rotate the crop 180 degrees
    Upside,
}

impl Rotation {
    fn apply(self, image: &RgbaImage) -> RgbaImage {
        match self {
            Rotation::None => image.clone(),
            Rotation::Cw90 => imageops::rotate90(image),
            Rotation::Ccw90 => imageops::rotate270(image),
            Rotation::Upside => imageops::rotate180(image),
        }
    }

    /// Map a box found in the rotated crop back to the unrotated crop of
    /// size `w` x `h`.
    fn unrotate(self, b: Rect, w: u32, h: u32) -> Rect {
        let (w, h) = (w as i64, h as i64);
        let (bx, by, bw, bh) = (b.x as i64, b.y as i64, b.width as i64, b.height as i64);
        let (x, y, width, height) = match self {
            Rotation::None => (bx, by, bw, bh),
            Rotation::Cw90 => (by, h - (bx + bw), bh, bw),
            Rotation::Ccw90 => (w - (by + bh), bx, bh, bw),
            Rotation::Upside => (w - (bx + bw), h - (by + bh), bw, bh),
        };
        Rect::new(x as i32, y as i32, width.max(0) as u32, height.max(0) as u32)
    }
}

/// A named area of the screen that carries readable text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    pub name: String,
    pub rect: Rect,
    #[serde(default)]
    pub rotation: Rotation,
    /// Overrides the recognizer-wide confidence floor for this region
    #[serde(default)]
    pub min_confidence: Option<f32>,
}

/// Backend output: coordinates relative to the image handed to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RawText {
    pub text: String,
    pub bbox: Rect,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextSpan {
    pub text: String,
    pub bbox: Rect,
    pub confidence: f32,
    pub frame_timestamp: DateTime<Utc>,
    /// Region the span was read from, when regions are configured
    pub region: Option<String>,
}

/// OCR capability provider.
pub trait OcrBackend: Send + Sync {
    fn name(&self) -> &str;

    fn read(&self, image: &RgbaImage) -> Result<Vec<RawText>, OcrError>;
}

/// Backend for profiles that only use templates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOcr;

impl OcrBackend for NoOcr {
    fn name(&self) -> &str {
        "none"
    }

    fn read(&self, _image: &RgbaImage) -> Result<Vec<RawText>, OcrError> {
        Ok(Vec::new())
    }
}

/// Runs the `tesseract` CLI and parses its TSV output. The crop is piped
/// in as PNG over stdin.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    pub program: String,
    pub lang: String,
    pub psm: u8,
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self {
            program: "tesseract".into(),
            lang: "eng".into(),
            psm: 11,
        }
    }
}

impl OcrBackend for TesseractCli {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn read(&self, image: &RgbaImage) -> Result<Vec<RawText>, OcrError> {
        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, image::ImageFormat::Png)
            .map_err(|e| OcrError::Encoding(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(["stdin", "stdout", "-l", &self.lang, "--psm", &self.psm.to_string(), "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| OcrError::Backend(format!("{}: {}", self.program, e)))?;

        feed_stdin(&mut child, png.get_ref())?;

        let output = child
            .wait_with_output()
            .map_err(|e| OcrError::Backend(e.to_string()))?;
        if !output.status.success() {
            return Err(OcrError::Backend(format!("{} exited with {}", self.program, output.status)));
        }

        parse_tesseract_tsv(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Write `input` to the child's stdin and close it. If the write fails the
/// child is killed and reaped before the error is returned.
fn feed_stdin(child: &mut Child, input: &[u8]) -> Result<(), OcrError> {
    let written = match child.stdin.take() {
        Some(mut stdin) => stdin.write_all(input),
        None => Ok(()),
    };
    if let Err(e) = written {
        let _ = child.kill();
        let _ = child.wait();
        return Err(OcrError::Backend(format!("writing image to OCR process: {}", e)));
    }
    Ok(())
}

/// Word rows of tesseract's TSV (level 5). Confidence is rescaled to [0, 1].
pub fn parse_tesseract_tsv(tsv: &str) -> Result<Vec<RawText>, OcrError> {
    let mut words = Vec::new();
    for line in tsv.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        if text.is_empty() {
            continue;
        }
        let num = |i: usize| -> Result<i64, OcrError> {
            cols[i]
                .trim()
                .parse::<f64>()
                .map(|v| v as i64)
                .map_err(|_| OcrError::Parse(format!("column {} in {:?}", i, line)))
        };
        let conf = num(10)?;
        if conf < 0 {
            continue;
        }
        words.push(RawText {
            text: text.to_string(),
            bbox: Rect::new(num(6)? as i32, num(7)? as i32, num(8)?.max(0) as u32, num(9)?.max(0) as u32),
            confidence: (conf as f32 / 100.0).clamp(0.0, 1.0),
        });
    }
    Ok(words)
}

/// Reads text spans out of frames.
pub struct TextRecognizer {
    backend: Box<dyn OcrBackend>,
    min_confidence: f32,
    merge_line_distance: Option<u32>,
    regions: Vec<TextRegion>,
}

impl TextRecognizer {
    pub fn new(backend: Box<dyn OcrBackend>, min_confidence: f32) -> Self {
        Self {
            backend,
            min_confidence,
            merge_line_distance: None,
            regions: Vec::new(),
        }
    }

    pub fn with_regions(mut self, regions: Vec<TextRegion>) -> Self {
        self.regions = regions;
        self
    }

    /// Merge spans whose vertical centres are within `distance` pixels.
    pub fn with_line_merging(mut self, distance: Option<u32>) -> Self {
        self.merge_line_distance = distance;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn regions(&self) -> &[TextRegion] {
        &self.regions
    }

    /// Read every configured region, or the whole frame when none are set.
    pub fn recognize_all(&self, frame: &Frame) -> Result<Vec<TextSpan>, OcrError> {
        if self.regions.is_empty() {
            return self.recognize(frame, None);
        }
        let mut spans = Vec::new();
        for region in &self.regions {
            spans.extend(self.recognize(frame, Some(region))?);
        }
        Ok(spans)
    }

    /// Read one region (or the full frame). Spans under the confidence
    /// floor are dropped; no text is an empty vector.
    pub fn recognize(&self, frame: &Frame, region: Option<&TextRegion>) -> Result<Vec<TextSpan>, OcrError> {
        let full = Rect::new(0, 0, frame.width(), frame.height());
        let rect = region.map(|r| r.rect).unwrap_or(full);
        let rect = match rect.clamp_to(frame.width(), frame.height()) {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };
        let rotation = region.map(|r| r.rotation).unwrap_or_default();
        let floor = region
            .and_then(|r| r.min_confidence)
            .unwrap_or(self.min_confidence);

        let crop = imageops::crop_imm(frame.image(), rect.x as u32, rect.y as u32, rect.width, rect.height)
            .to_image();
        let upright = rotation.apply(&crop);

        let raw = self.backend.read(&upright)?;
        let mut spans: Vec<TextSpan> = raw
            .into_iter()
            .filter(|r| r.confidence >= floor && !r.text.trim().is_empty())
            .map(|r| TextSpan {
                text: r.text.trim().to_string(),
                bbox: rotation
                    .unrotate(r.bbox, rect.width, rect.height)
                    .translate(rect.x, rect.y),
                confidence: r.confidence,
                frame_timestamp: frame.captured_at(),
                region: region.map(|r| r.name.clone()),
            })
            .collect();

        if let Some(distance) = self.merge_line_distance {
            spans = merge_lines(spans, distance);
        }
        sort_reading_order(&mut spans);
        Ok(spans)
    }
}

fn sort_reading_order(spans: &mut [TextSpan]) {
    spans.sort_by(|a, b| (a.bbox.y, a.bbox.x).cmp(&(b.bbox.y, b.bbox.x)));
}

/// Join spans sharing a line into one span per line, left to right.
/// The merged confidence is the weakest word's.
pub fn merge_lines(mut spans: Vec<TextSpan>, distance: u32) -> Vec<TextSpan> {
    spans.sort_by_key(|s| s.bbox.center().1);

    let mut lines: Vec<Vec<TextSpan>> = Vec::new();
    for span in spans {
        let cy = span.bbox.center().1;
        let joined = lines.iter_mut().find(|line| {
            line.first().map_or(false, |first| {
                first.region == span.region && (first.bbox.center().1 - cy).unsigned_abs() <= distance
            })
        });
        match joined {
            Some(line) => line.push(span),
            None => lines.push(vec![span]),
        }
    }

    lines
        .into_iter()
        .filter_map(|mut line| {
            line.sort_by_key(|s| s.bbox.x);
            let mut iter = line.into_iter();
            let first = iter.next()?;
            Some(iter.fold(first, |mut acc, next| {
                acc.text.push(' ');
                acc.text.push_str(&next.text);
                acc.bbox = acc.bbox.union(&next.bbox);
                acc.confidence = acc.confidence.min(next.confidence);
                acc
            }))
        })
        .collect()
}

/// OCR errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OcrError {
    #[error("OCR backend failed: {0}")]
    Backend(String),

    #[error("Image encoding failed: {0}")]
    Encoding(String),

    #[error("Unreadable OCR output: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::WindowInfo;
    use image::Rgba;
    use std::sync::Mutex;

    #[cfg(unix)]
    #[test]
    fn test_failed_stdin_write_reaps_child() {
        // Closes its stdin straight away, then idles
        let mut child = Command::new("sh")
            .args(["-c", "exec 0<&-; sleep 30"])
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();

        let err = feed_stdin(&mut child, &vec![0u8; 4 << 20]).unwrap_err();
        assert!(matches!(err, OcrError::Backend(_)));
        // Already killed and waited on: the status is available immediately
        let status = child.try_wait().unwrap().expect("child reaped");
        assert!(!status.success());
    }

    /// Returns canned words and remembers the size of what it was shown.
    struct Canned {
        words: Vec<RawText>,
        seen: Mutex<Vec<(u32, u32)>>,
    }

    impl Canned {
        fn new(words: Vec<RawText>) -> Self {
            Self {
                words,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl OcrBackend for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        fn read(&self, image: &RgbaImage) -> Result<Vec<RawText>, OcrError> {
            self.seen.lock().unwrap().push(image.dimensions());
            Ok(self.words.clone())
        }
    }

    fn word(text: &str, bbox: Rect, confidence: f32) -> RawText {
        RawText {
            text: text.into(),
            bbox,
            confidence,
        }
    }

    fn frame(w: u32, h: u32) -> Frame {
        Frame::new(RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 255])), WindowInfo::detached(w, h))
    }

    #[test]
    fn test_low_confidence_spans_dropped() {
        let backend = Canned::new(vec![
            word("Continue", Rect::new(10, 10, 40, 10), 0.9),
            word("~~", Rect::new(60, 10, 10, 10), 0.2),
        ]);
        let recognizer = TextRecognizer::new(Box::new(backend), 0.5);
        let spans = recognizer.recognize(&frame(100, 50), None).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "Continue");
    }

    #[test]
    fn test_region_offsets_and_floor_override() {
        let backend = Canned::new(vec![word("Lv. 60", Rect::new(2, 3, 20, 8), 0.4)]);
        let region = TextRegion {
            name: "level".into(),
            rect: Rect::new(50, 20, 40, 20),
            rotation: Rotation::None,
            min_confidence: Some(0.3),
        };
        let recognizer = TextRecognizer::new(Box::new(backend), 0.8).with_regions(vec![region]);
        let spans = recognizer.recognize_all(&frame(100, 50)).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].bbox, Rect::new(52, 23, 20, 8));
        assert_eq!(spans[0].region.as_deref(), Some("level"));
    }

    #[test]
    fn test_rotated_region_is_read_upright() {
        let backend = Canned::new(vec![word("HP", Rect::new(0, 0, 4, 2), 0.9)]);
        let region = TextRegion {
            name: "side".into(),
            rect: Rect::new(10, 10, 6, 20),
            rotation: Rotation::Cw90,
            min_confidence: None,
        };
        let recognizer = TextRecognizer::new(Box::new(backend), 0.5).with_regions(vec![region]);
        let spans = recognizer.recognize_all(&frame(50, 50)).unwrap();

        // A 6x20 crop becomes 20x6 once turned upright
        // and the backend's top-left box lands at the crop's bottom-left.
        assert_eq!(spans[0].bbox, Rect::new(10, 26, 2, 4));
    }

    #[test]
    fn test_unrotate_round_trips_each_rotation() {
        let b = Rect::new(1, 2, 3, 4);
        assert_eq!(Rotation::None.unrotate(b, 10, 20), b);
        assert_eq!(Rotation::Upside.unrotate(b, 10, 20), Rect::new(6, 14, 3, 4));
        assert_eq!(Rotation::Ccw90.unrotate(b, 10, 20), Rect::new(4, 1, 4, 3));
        assert_eq!(Rotation::Cw90.unrotate(b, 10, 20), Rect::new(2, 16, 4, 3));
    }

    #[test]
    fn test_line_merging_joins_words_left_to_right() {
        let ts = Utc::now();
        let span = |t: &str, x: i32, y: i32, c: f32| TextSpan {
            text: t.into(),
            bbox: Rect::new(x, y, 20, 10),
            confidence: c,
            frame_timestamp: ts,
            region: None,
        };
        let merged = merge_lines(
            vec![span("Hall", 60, 11, 0.8), span("Forgotten", 10, 10, 0.9), span("Exit", 10, 40, 0.7)],
            4,
        );
        assert_eq!(merged.len(), 2);
        let line = merged.iter().find(|s| s.text.starts_with("Forgotten")).unwrap();
        assert_eq!(line.text, "Forgotten Hall");
        assert_eq!(line.confidence, 0.8);
        assert_eq!(line.bbox, Rect::new(10, 10, 70, 11));
    }

    #[test]
    fn test_parse_tesseract_tsv() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t200\t100\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t12\t30\t48\t14\t91.5\tContinue\n\
                   5\t1\t1\t1\t1\t2\t70\t30\t10\t14\t-1\t \n";
        let words = parse_tesseract_tsv(tsv).unwrap();
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].text, "Continue");
        assert_eq!(words[0].bbox, Rect::new(12, 30, 48, 14));
        assert!((words[0].confidence - 0.91).abs() < 1e-6);
    }

    #[test]
    fn test_no_ocr_reads_nothing() {
        let recognizer = TextRecognizer::new(Box::new(NoOcr), 0.5);
        assert!(recognizer.recognize_all(&frame(10, 10)).unwrap().is_empty());
    }
}
