//! Boundary to the `image` codecs: any supported raster in, RGBA8 PNG out.

use image::{ImageError, ImageFormat, ImageReader, RgbaImage};
use std::io::Cursor;
use tracing::debug;

use crate::error::ChromaError;

/// Row-major RGBA8 pixels, origin top-left.
pub type PixelGrid = RgbaImage;

/// Decodes `bytes` into an RGBA grid, sniffing the format from its content.
///
/// Sources without an alpha channel come back fully opaque.
pub fn decode(bytes: &[u8]) -> Result<PixelGrid, ChromaError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ChromaError::Decode(ImageError::IoError(e)))?;
    let format = reader.format();
    let image = reader.decode().map_err(ChromaError::Decode)?;
    debug!(
        ?format,
        color = ?image.color(),
        width = image.width(),
        height = image.height(),
        "decoded image"
    );
    Ok(image.to_rgba8())
}

/// Encodes `grid` as a lossless RGBA8 PNG.
pub fn encode(grid: &PixelGrid) -> Result<Vec<u8>, ChromaError> {
    let mut out = Cursor::new(Vec::new());
    grid.write_to(&mut out, ImageFormat::Png)
        .map_err(ChromaError::Encode)?;
    Ok(out.into_inner())
}
