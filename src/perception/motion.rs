//! Coarse frame-to-frame change detection.
//!
//! The frame is cut into a grid; each cell is hashed over a sparse,
//! quantized luma sample so sensor noise and compression shimmer do not
//! register as motion. Comparing two fingerprints gives the fraction of
//! cells that changed.

use image::GrayImage;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const GRID: u32 = 16;
const SAMPLE_STEP: u32 = 4;
/// Luma values are bucketed by this many levels before hashing
const QUANTUM: u8 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    width: u32,
    height: u32,
    cells: Vec<u64>,
}

impl Fingerprint {
    pub fn of(luma: &GrayImage) -> Self {
        let (width, height) = luma.dimensions();
        let mut cells = Vec::with_capacity((GRID * GRID) as usize);
        for gy in 0..GRID {
            for gx in 0..GRID {
                let x0 = gx * width / GRID;
                let x1 = (gx + 1) * width / GRID;
                let y0 = gy * height / GRID;
                let y1 = (gy + 1) * height / GRID;
                cells.push(hash_cell(luma, x0, y0, x1, y1));
            }
        }
        Self { width, height, cells }
    }

    /// Fraction of cells that differ, in [0, 1]. A size change counts as
    /// full motion.
    pub fn diff(&self, other: &Fingerprint) -> f32 {
        if self.width != other.width || self.height != other.height {
            return 1.0;
        }
        let changed = self
            .cells
            .iter()
            .zip(&other.cells)
            .filter(|(a, b)| a != b)
            .count();
        changed as f32 / self.cells.len().max(1) as f32
    }
}

fn hash_cell(luma: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> u64 {
    let mut hasher = DefaultHasher::new();
    for y in (y0..y1).step_by(SAMPLE_STEP as usize) {
        for x in (x0..x1).step_by(SAMPLE_STEP as usize) {
            (luma.get_pixel(x, y)[0] / QUANTUM).hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Motion between the previous fingerprint (if any) and the current one.
pub fn motion_since(previous: Option<&Fingerprint>, current: &Fingerprint) -> Option<f32> {
    previous.map(|prev| prev.diff(current))
}
