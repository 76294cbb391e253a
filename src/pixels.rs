//! Decoding of fetched image bytes into model-ready RGB pixels.

use std::fmt;
use std::io::Cursor;

use image::error::{LimitError, LimitErrorKind};
use image::imageops::{self, FilterType};
use image::{ImageError, ImageReader, Limits, RgbImage};

/// Input resolution used by CLIP ViT-B/32 style encoders.
pub const DEFAULT_INPUT_RESOLUTION: u32 = 224;

/// Longest source edge the decoder accepts.
pub const MAX_SOURCE_EDGE: u32 = 16_384;

const MAX_DECODE_ALLOC: u64 = 256 * 1024 * 1024;

/// Square RGB8 image, centre-cropped and resized to the model input size.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelImage {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

impl PixelImage {
    /// Wraps raw interleaved RGB bytes; returns `None` when the length does not match.
    pub fn from_rgb(width: u32, height: u32, rgb: Vec<u8>) -> Option<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        (width > 0 && height > 0 && rgb.len() == expected).then_some(Self { width, height, rgb })
    }

    /// Decodes an encoded image (JPEG, PNG, WebP) and prepares it for `resolution`.
    ///
    /// Images with an edge above [`MAX_SOURCE_EDGE`] are rejected before any pixel buffer is
    /// allocated.
    pub fn decode(bytes: &[u8], resolution: u32) -> Result<Self, ImageError> {
        let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_SOURCE_EDGE);
        limits.max_image_height = Some(MAX_SOURCE_EDGE);
        limits.max_alloc = Some(MAX_DECODE_ALLOC);
        reader.limits(limits);
        let decoded = reader.decode()?;
        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(ImageError::Limits(LimitError::from_kind(
                LimitErrorKind::DimensionError,
            )));
        }
        Ok(Self::prepare(decoded.to_rgb8(), resolution))
    }

    /// Centre-crops the largest square and resizes it to `resolution`.
    ///
    /// Cropping happens in source coordinates, so the working buffer never exceeds the source.
    pub fn prepare(rgb: RgbImage, resolution: u32) -> Self {
        let size = resolution.max(1);
        let (w, h) = rgb.dimensions();
        let side = w.min(h).max(1);
        let square = if (w, h) == (side, side) {
            rgb
        } else {
            imageops::crop_imm(&rgb, (w - side) / 2, (h - side) / 2, side, side).to_image()
        };
        let resized = if side == size {
            square
        } else {
            imageops::resize(&square, size, size, FilterType::Triangle)
        };
        Self {
            width: size,
            height: size,
            rgb: resized.into_raw(),
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Interleaved RGB bytes, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        &self.rgb
    }
}

impl fmt::Debug for PixelImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.rgb.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb};

    fn encode_png(image: RgbImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut out, ImageFormat::Png)
            .expect("encode png");
        out.into_inner()
    }

    #[test]
    fn decodes_and_squares_images() {
        let png = encode_png(RgbImage::from_pixel(40, 20, Rgb([10, 20, 30])));
        let pixels = PixelImage::decode(&png, 16).expect("decode");
        assert_eq!((pixels.width(), pixels.height()), (16, 16));
        assert_eq!(pixels.as_bytes().len(), 16 * 16 * 3);
        assert_eq!(&pixels.as_bytes()[..3], &[10, 20, 30]);
    }

    #[test]
    fn crops_the_centre_of_wide_images() {
        let image = RgbImage::from_fn(30, 10, |x, _| {
            if (10..20).contains(&x) {
                Rgb([0, 255, 0])
            } else {
                Rgb([255, 0, 0])
            }
        });
        let pixels = PixelImage::prepare(image, 10);
        assert!(pixels
            .as_bytes()
            .chunks_exact(3)
            .all(|px| px == [0, 255, 0]));
    }

    #[test]
    fn crops_the_middle_band_of_tall_images() {
        let image = RgbImage::from_fn(2, 40, |_, y| {
            if (19..21).contains(&y) {
                Rgb([0, 255, 0])
            } else {
                Rgb([255, 0, 0])
            }
        });
        let pixels = PixelImage::prepare(image, 4);
        assert_eq!((pixels.width(), pixels.height()), (4, 4));
        assert!(pixels
            .as_bytes()
            .chunks_exact(3)
            .all(|px| px == [0, 255, 0]));
    }

    #[test]
    fn extreme_aspect_ratios_stay_small() {
        let png = encode_png(RgbImage::from_pixel(1, 4000, Rgb([9, 9, 9])));
        let pixels = PixelImage::decode(&png, 224).expect("decode");
        assert_eq!((pixels.width(), pixels.height()), (224, 224));
        assert_eq!(pixels.as_bytes().len(), 224 * 224 * 3);
    }

    #[test]
    fn oversized_sources_are_rejected() {
        let png = encode_png(RgbImage::from_pixel(MAX_SOURCE_EDGE + 1, 1, Rgb([0, 0, 0])));
        assert!(matches!(
            PixelImage::decode(&png, 224),
            Err(ImageError::Limits(_))
        ));
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(PixelImage::decode(b"definitely not an image", 16).is_err());
    }

    #[test]
    fn raw_buffers_must_match_dimensions() {
        assert!(PixelImage::from_rgb(2, 2, vec![0; 12]).is_some());
        assert!(PixelImage::from_rgb(2, 2, vec![0; 11]).is_none());
        assert!(PixelImage::from_rgb(0, 2, Vec::new()).is_none());
    }
}
