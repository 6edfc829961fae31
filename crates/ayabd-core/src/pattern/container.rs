//! A single pattern: one rectangular source of ink values

use std::path::Path;

use image::DynamicImage;
use tracing::{debug, info};

use super::QueueError;

/// Width of a blank spacer
pub const SPACER_WIDTH: usize = 1;

/// Ink amounts from this value up count as color 1
pub const INK_THRESHOLD: u8 = 128;

/// Grayscale pattern with optional placement inside a larger canvas.
///
/// Values are amounts of ink (0 = background). Images are stored turned by a
/// quarter: the image height is the knitted width and the image width the
/// knitted length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternContainer {
    /// Declared size in needles
    width: usize,
    /// Declared size in rows
    length: usize,
    /// Position of the pixel data inside the declared area
    offset_width: i64,
    offset_length: i64,
    /// Extent of the pixel data
    pixel_width: usize,
    pixel_length: usize,
    /// Row-major by length, then width
    pixels: Vec<u8>,
}

impl PatternContainer {
    /// Synthetic blank of `length` rows
    pub fn blank(length: usize) -> Self {
        Self {
            width: SPACER_WIDTH,
            length,
            offset_width: 0,
            offset_length: 0,
            pixel_width: 0,
            pixel_length: 0,
            pixels: Vec::new(),
        }
    }

    /// Pattern from ink values laid out row by row (`length` rows of `width` values)
    pub fn from_ink(width: usize, length: usize, pixels: Vec<u8>) -> Result<Self, QueueError> {
        if pixels.len() != width * length {
            return Err(QueueError::InvalidParameter(format!(
                "{} ink values for a {}x{} pattern",
                pixels.len(),
                width,
                length
            )));
        }
        Ok(Self {
            width,
            length,
            offset_width: 0,
            offset_length: 0,
            pixel_width: width,
            pixel_length: length,
            pixels,
        })
    }

    pub fn from_image(image: &DynamicImage) -> Self {
        let luma = image.to_luma8();
        let (length, width) = luma.dimensions();
        let (length, width) = (length as usize, width as usize);
        let mut pixels = Vec::with_capacity(width * length);
        for l in 0..length {
            for w in 0..width {
                // luminance is the amount of white
                pixels.push(255 - luma.get_pixel(l as u32, w as u32)[0]);
            }
        }
        Self {
            width,
            length,
            offset_width: 0,
            offset_length: 0,
            pixel_width: width,
            pixel_length: length,
            pixels,
        }
    }

    /// Decode an image file
    pub fn load(path: &Path) -> Result<Self, QueueError> {
        let image = image::open(path).map_err(|source| QueueError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        let container = Self::from_image(&image);
        info!(
            "Loaded {}: width {}, length {}",
            path.display(),
            container.width,
            container.length
        );
        debug!("Pattern {}:\n{}", path.display(), container.render_ascii());
        Ok(container)
    }

    /// Place the pixel data at an offset inside a declared area
    #[cfg(test)]
    pub(crate) fn with_canvas(
        mut self,
        width: usize,
        length: usize,
        offset_width: i64,
        offset_length: i64,
    ) -> Self {
        self.width = width;
        self.length = length;
        self.offset_width = offset_width;
        self.offset_length = offset_length;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Ink at a row and needle; background outside the declared area or the pixel data
    pub fn gray_at(&self, at_length: i64, at_width: i64) -> u8 {
        if at_length < 0
            || at_width < 0
            || at_length >= self.length as i64
            || at_width >= self.width as i64
        {
            return 0;
        }
        let l = at_length - self.offset_length;
        let w = at_width - self.offset_width;
        if l < 0 || w < 0 || l >= self.pixel_length as i64 || w >= self.pixel_width as i64 {
            return 0;
        }
        self.pixels[l as usize * self.pixel_width + w as usize]
    }

    /// One text line per row, last needle first as seen from the carriage
    pub fn render_ascii(&self) -> String {
        let mut out = String::with_capacity((self.width + 1) * self.length);
        for l in 0..self.length as i64 {
            for w in (0..self.width as i64).rev() {
                out.push(if self.gray_at(l, w) >= INK_THRESHOLD {
                    'X'
                } else {
                    '.'
                });
            }
            out.push('\n');
        }
        out
    }
}
