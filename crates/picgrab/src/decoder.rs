//! # Decoding
//!
//! Turns raw encoded bytes into a [`DecodedImage`]. The manager always runs
//! decoders on the blocking pool so lookups never wait on CPU-bound work.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};

use crate::error::{ImageError, Result};

/// A decoded image. Cloning is cheap; pixel data is shared.
#[derive(Clone)]
pub struct DecodedImage {
    pixels: Arc<DynamicImage>,
    format: Option<ImageFormat>,
}

impl DecodedImage {
    pub fn new(pixels: DynamicImage, format: Option<ImageFormat>) -> Self {
        Self {
            pixels: Arc::new(pixels),
            format,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.pixels.dimensions().1
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    /// Whether both handles share the same pixel buffer.
    pub fn ptr_eq(&self, other: &DecodedImage) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("format", &self.format)
            .finish()
    }
}

/// Decodes encoded image bytes.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<DecodedImage>;
}

/// Decoder backed by the `image` crate, sniffing the format from the bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardDecoder;

impl ImageDecoder for StandardDecoder {
    fn decode(&self, data: &[u8]) -> Result<DecodedImage> {
        if data.is_empty() {
            return Err(ImageError::Decode("empty image data".into()));
        }

        let reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| ImageError::Decode(e.to_string()))?;
        let format = reader
            .format()
            .ok_or_else(|| ImageError::Decode("unrecognized image format".into()))?;
        let pixels = reader
            .decode()
            .map_err(|e| ImageError::Decode(e.to_string()))?;

        Ok(DecodedImage::new(pixels, Some(format)))
    }
}
