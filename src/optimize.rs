//! Lossy/lossless re-encoding of captured screenshots before they hit disk.

use crate::{ImageFormat, LinkPreviewError, JPEG_QUALITY};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, ImageEncoder};
use tracing::debug;

/// Re-encodes preview images and keeps whichever encoding is smaller.
#[derive(Debug, Clone, Copy)]
pub struct ImageOptimizer {
    format: ImageFormat,
}

impl ImageOptimizer {
    pub fn new(format: ImageFormat) -> Self {
        Self { format }
    }

    /// Returns the smaller of `data` and its re-encoding.
    ///
    /// Empty input stays empty and undecodable input is returned unchanged.
    pub fn optimize(&self, data: Vec<u8>) -> Vec<u8> {
        if data.is_empty() {
            return data;
        }

        match self.reencode(&data) {
            Ok(encoded) if encoded.len() < data.len() => {
                debug!(
                    "Optimized {} image from {} to {} bytes",
                    self.format,
                    data.len(),
                    encoded.len()
                );
                encoded
            }
            Ok(_) => data,
            Err(e) => {
                debug!("Keeping original {} image: {}", self.format, e);
                data
            }
        }
    }

    /// [`ImageOptimizer::optimize`] on the blocking thread pool.
    pub async fn optimize_async(&self, data: Vec<u8>) -> Vec<u8> {
        if data.is_empty() {
            return data;
        }

        let optimizer = *self;
        let fallback = data.clone();
        tokio::task::spawn_blocking(move || optimizer.optimize(data))
            .await
            .unwrap_or(fallback)
    }

    fn reencode(&self, data: &[u8]) -> Result<Vec<u8>, LinkPreviewError> {
        let img = image::load_from_memory(data)?;
        let mut encoded = Vec::new();

        match self.format {
            ImageFormat::Jpg => {
                let rgb = img.to_rgb8();
                JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY as u8).encode(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ColorType::Rgb8,
                )?;
            }
            ImageFormat::Png => {
                let rgba = img.to_rgba8();
                PngEncoder::new_with_quality(
                    &mut encoded,
                    CompressionType::Best,
                    FilterType::Adaptive,
                )
                .write_image(rgba.as_raw(), rgba.width(), rgba.height(), ColorType::Rgba8)?;
            }
        }

        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn sample(format: ImageOutputFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
        let mut data = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut data), format)
            .unwrap();
        data
    }

    #[test]
    fn test_empty_input_stays_empty() {
        assert!(ImageOptimizer::new(ImageFormat::Jpg).optimize(Vec::new()).is_empty());
    }

    #[test]
    fn test_undecodable_input_is_kept() {
        let garbage = b"definitely not an image".to_vec();
        assert_eq!(ImageOptimizer::new(ImageFormat::Png).optimize(garbage.clone()), garbage);
    }

    #[test]
    fn test_output_never_grows() {
        for (format, output) in [
            (ImageFormat::Png, ImageOutputFormat::Png),
            (ImageFormat::Jpg, ImageOutputFormat::Jpeg(95)),
        ] {
            let original = sample(output);
            let optimized = ImageOptimizer::new(format).optimize(original.clone());

            assert!(optimized.len() <= original.len());
            let decoded = image::load_from_memory(&optimized).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (64, 48));
        }
    }

    #[tokio::test]
    async fn test_optimize_async_matches_sync() {
        let original = sample(ImageOutputFormat::Png);
        let optimizer = ImageOptimizer::new(ImageFormat::Png);
        assert_eq!(
            optimizer.optimize_async(original.clone()).await,
            optimizer.optimize(original)
        );
    }
}
