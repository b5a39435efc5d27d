use image::Rgba;
use tracing::debug;

use crate::codec::{self, PixelGrid};
use crate::error::ChromaError;

pub const DEFAULT_GREEN_THRESHOLD: u8 = 120;
pub const DEFAULT_DIFF_THRESHOLD: u8 = 30;

/// Green-screen classification thresholds.
///
/// A pixel is background when its green channel is at least
/// `green_threshold` and exceeds the stronger of red and blue by at least
/// `diff_threshold`. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChromaKeyConfig {
    green_threshold: u8,
    diff_threshold: u8,
}

impl Default for ChromaKeyConfig {
    fn default() -> Self {
        Self {
            green_threshold: DEFAULT_GREEN_THRESHOLD,
            diff_threshold: DEFAULT_DIFF_THRESHOLD,
        }
    }
}

impl ChromaKeyConfig {
    /// Builds a config, rejecting thresholds outside `0..=255`.
    ///
    /// Out-of-range values are an error rather than being clamped.
    pub fn new(green_threshold: i64, diff_threshold: i64) -> Result<Self, ChromaError> {
        Ok(Self {
            green_threshold: to_byte("green_threshold", green_threshold)?,
            diff_threshold: to_byte("diff_threshold", diff_threshold)?,
        })
    }

    pub fn green_threshold(&self) -> u8 {
        self.green_threshold
    }

    pub fn diff_threshold(&self) -> u8 {
        self.diff_threshold
    }

    /// Classifies one pixel. Alpha is ignored.
    pub fn is_background(&self, pixel: &Rgba<u8>) -> bool {
        let [r, g, b, _] = pixel.0;
        // Signed: the margin is negative whenever red or blue beats green.
        let margin = i16::from(g) - i16::from(r.max(b));
        g >= self.green_threshold && margin >= i16::from(self.diff_threshold)
    }
}

fn to_byte(name: &str, value: i64) -> Result<u8, ChromaError> {
    u8::try_from(value)
        .map_err(|_| ChromaError::Config(format!("{name} must be within 0..=255, got {value}")))
}

/// Zeroes the alpha of every background pixel in place.
///
/// RGB is never touched and non-background pixels keep their original alpha.
/// Returns the number of pixels classified as background.
pub fn apply(grid: &mut PixelGrid, config: &ChromaKeyConfig) -> usize {
    let mut keyed = 0;
    for pixel in grid.pixels_mut() {
        if config.is_background(pixel) {
            pixel[3] = 0;
            keyed += 1;
        }
    }
    keyed
}

/// Decodes `bytes`, keys out the green background and re-encodes as PNG.
pub fn key_out(bytes: &[u8], config: &ChromaKeyConfig) -> Result<Vec<u8>, ChromaError> {
    let mut grid = codec::decode(bytes)?;
    let keyed = apply(&mut grid, config);
    debug!(
        width = grid.width(),
        height = grid.height(),
        keyed,
        green_threshold = config.green_threshold,
        diff_threshold = config.diff_threshold,
        "chroma key applied"
    );
    codec::encode(&grid)
}
