use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ImageEncoder, ImageFormat, RgbaImage};
use imagegate_contracts::errors::ClassifiedError;
use thiserror::Error;

const JPEG_QUALITY: u8 = 95;

/// Re-encoding a decoded image for output failed. Never a slot outcome; the
/// caller decides how to report it.
#[derive(Debug, Error)]
#[error("failed to encode {width}x{height} image as {format}: {source}")]
pub struct EncodeError {
    pub width: u32,
    pub height: u32,
    pub format: &'static str,
    #[source]
    pub source: image::ImageError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Png,
    Jpeg,
    Webp,
    Gif,
    Bmp,
    Tiff,
    Other,
}

impl SourceFormat {
    fn from_image_format(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Png => Self::Png,
            ImageFormat::Jpeg => Self::Jpeg,
            ImageFormat::WebP => Self::Webp,
            ImageFormat::Gif => Self::Gif,
            ImageFormat::Bmp => Self::Bmp,
            ImageFormat::Tiff => Self::Tiff,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut lowered = raw.trim().to_ascii_lowercase();
        if let Some(value) = lowered.strip_prefix("image/") {
            lowered = value.to_string();
        }
        match lowered.as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }
}

/// Decoded raster in the canonical RGBA8 layout, whatever the source format.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pixels: RgbaImage,
    source_format: SourceFormat,
}

impl DecodedImage {
    pub fn new(pixels: RgbaImage, source_format: SourceFormat) -> Self {
        Self {
            pixels,
            source_format,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn source_format(&self) -> SourceFormat {
        self.source_format
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn into_pixels(self) -> RgbaImage {
        self.pixels
    }
}

pub struct ImageCodec;

impl ImageCodec {
    pub fn decode(bytes: &[u8]) -> Result<DecodedImage, ClassifiedError> {
        if bytes.is_empty() {
            return Err(ClassifiedError::DecodeFailure(
                "image payload is empty".to_string(),
            ));
        }
        let format = image::guess_format(bytes).map_err(|err| {
            ClassifiedError::DecodeFailure(format!("unrecognized image format: {err}"))
        })?;
        let decoded = image::load_from_memory_with_format(bytes, format).map_err(|err| {
            ClassifiedError::DecodeFailure(format!(
                "{} payload ({} bytes) failed to decode: {err}",
                SourceFormat::from_image_format(format).as_str(),
                bytes.len()
            ))
        })?;
        Ok(DecodedImage::new(
            decoded.to_rgba8(),
            SourceFormat::from_image_format(format),
        ))
    }

    /// JPEG has no alpha channel, so alpha is dropped before encoding; PNG and
    /// WebP keep RGBA losslessly.
    pub fn encode(image: &DecodedImage, format: OutputFormat) -> Result<Vec<u8>, EncodeError> {
        let pixels = image.pixels();
        let (width, height) = pixels.dimensions();
        let mut out = Cursor::new(Vec::new());
        let result = match format {
            OutputFormat::Png => PngEncoder::new(&mut out).write_image(
                pixels.as_raw(),
                width,
                height,
                image::ExtendedColorType::Rgba8,
            ),
            OutputFormat::Webp => WebPEncoder::new_lossless(&mut out).write_image(
                pixels.as_raw(),
                width,
                height,
                image::ExtendedColorType::Rgba8,
            ),
            OutputFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgba8(pixels.clone()).to_rgb8();
                JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).write_image(
                    rgb.as_raw(),
                    width,
                    height,
                    image::ExtendedColorType::Rgb8,
                )
            }
        };
        result.map_err(|source| EncodeError {
            width,
            height,
            format: format.extension(),
            source,
        })?;
        Ok(out.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};
    use imagegate_contracts::errors::ClassifiedError;

    use super::{DecodedImage, ImageCodec, OutputFormat, SourceFormat};

    fn gradient(width: u32, height: u32) -> DecodedImage {
        let mut pixels = RgbaImage::new(width, height);
        for (x, y, pixel) in pixels.enumerate_pixels_mut() {
            *pixel = Rgba([(x * 40) as u8, (y * 60) as u8, 128, if x % 2 == 0 { 255 } else { 90 }]);
        }
        DecodedImage::new(pixels, SourceFormat::Png)
    }

    #[test]
    fn png_round_trip_preserves_dimensions_and_pixels() -> anyhow::Result<()> {
        let original = gradient(5, 3);
        let bytes = ImageCodec::encode(&original, OutputFormat::Png)?;
        let decoded = ImageCodec::decode(&bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (5, 3));
        assert_eq!(decoded.source_format(), SourceFormat::Png);
        assert_eq!(decoded.pixels(), original.pixels());
        Ok(())
    }

    #[test]
    fn webp_round_trip_is_lossless() -> anyhow::Result<()> {
        let original = gradient(4, 4);
        let bytes = ImageCodec::encode(&original, OutputFormat::Webp)?;
        let decoded = ImageCodec::decode(&bytes)?;
        assert_eq!(decoded.source_format(), SourceFormat::Webp);
        assert_eq!(decoded.pixels(), original.pixels());
        Ok(())
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions_and_drops_alpha() -> anyhow::Result<()> {
        let mut pixels = RgbaImage::new(16, 8);
        for pixel in pixels.pixels_mut() {
            *pixel = Rgba([200, 40, 40, 255]);
        }
        let original = DecodedImage::new(pixels, SourceFormat::Png);
        let bytes = ImageCodec::encode(&original, OutputFormat::Jpeg)?;
        let decoded = ImageCodec::decode(&bytes)?;
        assert_eq!(decoded.source_format(), SourceFormat::Jpeg);
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
        let sample = decoded.pixels().get_pixel(3, 3);
        assert_eq!(sample[3], 255);
        assert!((sample[0] as i32 - 200).abs() <= 4);
        assert!((sample[1] as i32 - 40).abs() <= 4);
        Ok(())
    }

    #[test]
    fn empty_and_garbage_payloads_are_decode_failures() {
        assert!(matches!(
            ImageCodec::decode(&[]),
            Err(ClassifiedError::DecodeFailure(_))
        ));
        assert!(matches!(
            ImageCodec::decode(b"<html>not an image</html>"),
            Err(ClassifiedError::DecodeFailure(_))
        ));
        // valid PNG signature, truncated body
        let truncated = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert!(matches!(
            ImageCodec::decode(&truncated),
            Err(ClassifiedError::DecodeFailure(_))
        ));
    }

    #[test]
    fn encode_failures_carry_their_own_error_type() {
        let empty = DecodedImage::new(RgbaImage::new(0, 3), SourceFormat::Png);
        let err = ImageCodec::encode(&empty, OutputFormat::Png).unwrap_err();
        assert_eq!((err.width, err.height, err.format), (0, 3, "png"));
        assert!(err.to_string().starts_with("failed to encode 0x3 image as png"));
    }

    #[test]
    fn output_format_parsing_accepts_mime_and_aliases() {
        assert_eq!(OutputFormat::parse("image/JPEG"), Some(OutputFormat::Jpeg));
        assert_eq!(OutputFormat::parse("jpg"), Some(OutputFormat::Jpeg));
        assert_eq!(OutputFormat::parse("webp"), Some(OutputFormat::Webp));
        assert_eq!(OutputFormat::parse("tga"), None);
        assert_eq!(OutputFormat::Jpeg.extension(), "jpg");
    }
}
