//! Decoded image model and format-aware encoding.
//!
//! [`CachedImage`] is the unit stored in the memory tier and delivered to
//! completion callbacks. It wraps decoded pixels behind an `Arc` so clones
//! are cheap, and carries the display scale factor, alpha-channel presence
//! as observed at decode time, and a multi-frame (animated) marker that
//! survives store/query round-trips.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;

/// First eight bytes of every PNG stream.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Returns true if `data` begins with the PNG signature.
pub fn has_png_signature(data: &[u8]) -> bool {
    data.len() >= PNG_SIGNATURE.len() && data[..PNG_SIGNATURE.len()] == PNG_SIGNATURE
}

/// A decoded image held by the cache and handed to callers.
///
/// Clones share the underlying pixel storage.
#[derive(Clone, Debug)]
pub struct CachedImage {
    pixels: Arc<DynamicImage>,
    scale: u32,
    has_alpha: bool,
    animated: bool,
}

impl CachedImage {
    /// Wrap already-decoded pixels at the given display scale.
    ///
    /// Alpha presence is taken from the pixel storage's color type.
    pub fn from_pixels(pixels: DynamicImage, scale: u32) -> Self {
        let has_alpha = pixels.color().has_alpha();
        Self {
            pixels: Arc::new(pixels),
            scale: scale.max(1),
            has_alpha,
            animated: false,
        }
    }

    /// Mark or clear the multi-frame (animated) marker.
    pub fn with_animated(mut self, animated: bool) -> Self {
        self.animated = animated;
        self
    }

    /// Decode encoded bytes into an image at the given display scale.
    ///
    /// Returns `None` when the bytes are not a decodable image. When
    /// `decompress` is set the pixels are eagerly converted to RGBA8 so
    /// first display does no further work; alpha presence still reflects
    /// the encoded image, not the converted storage.
    pub fn decode(data: &[u8], scale: u32, decompress: bool) -> Option<Self> {
        let format = image::guess_format(data).ok();
        let decoded = image::load_from_memory(data).ok()?;

        let has_alpha = decoded.color().has_alpha();
        let animated = matches!(format, Some(ImageFormat::Gif));

        let pixels = if decompress && !animated {
            DynamicImage::ImageRgba8(decoded.to_rgba8())
        } else {
            decoded
        };

        Some(Self {
            pixels: Arc::new(pixels),
            scale: scale.max(1),
            has_alpha,
            animated,
        })
    }

    /// Pixel width.
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    /// Pixel height.
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Display scale factor (1, 2, or 3 in practice).
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Whether the encoded image carried an alpha channel.
    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    /// Whether the image is multi-frame (animated).
    pub fn is_animated(&self) -> bool {
        self.animated
    }

    /// Access the decoded pixels.
    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    /// Memory-tier weight: pixel count scaled by scale-factor squared.
    pub fn cache_cost(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height()) * u64::from(self.scale * self.scale)
    }

    /// Returns true if `other` shares this image's pixel storage.
    ///
    /// Used to detect whether a transform delegate returned the original
    /// image unchanged.
    pub fn shares_pixels(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }

    /// Encode as PNG.
    pub fn to_png_bytes(&self) -> Result<Bytes, image::ImageError> {
        let mut buf = Vec::new();
        self.pixels
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(Bytes::from(buf))
    }

    /// Encode as JPEG at full quality.
    ///
    /// JPEG has no alpha channel, so pixels are flattened to RGB first.
    pub fn to_jpeg_bytes(&self) -> Result<Bytes, image::ImageError> {
        let rgb = self.pixels.to_rgb8();
        let mut buf = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, 100);
        encoder.encode_image(&rgb)?;
        Ok(Bytes::from(buf))
    }
}
