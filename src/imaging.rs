//! Pixel conversion, thumbnails and encoding for captured stills.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};

use crate::error::{CameraError, Result};
use crate::traits::{yuv_to_rgb, FourCC};

/// JPEG quality used when encoding uncompressed captures.
pub const JPEG_QUALITY: u8 = 90;

/// Downscaled preview of a saved image.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    /// Title of the image the thumbnail belongs to.
    pub title: String,
    /// Thumbnail pixels, already rotated upright.
    pub image: RgbImage,
}

/// Display rotation of a capture, clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct Orientation(u16);

impl Orientation {
    /// Snap any angle to the nearest quarter turn.
    pub const fn from_degrees(degrees: i32) -> Self {
        let normalized = degrees.rem_euclid(360);
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let quarter = (((normalized + 45) / 90) % 4) as u16;
        Self(quarter * 90)
    }

    /// Rotation in degrees: 0, 90, 180 or 270.
    pub const fn degrees(self) -> u16 {
        self.0
    }
}

/// Decode raw capture bytes into RGB.
pub fn to_rgb(data: &[u8], width: u32, height: u32, fourcc: FourCC) -> Result<RgbImage> {
    match fourcc {
        FourCC::YUYV => yuyv_to_rgb(data, width, height),
        FourCC::RGB3 => {
            let expected = width as usize * height as usize * 3;
            let pixels = data.get(..expected).ok_or_else(|| short_frame(data, expected))?;
            RgbImage::from_raw(width, height, pixels.to_vec())
                .ok_or_else(|| short_frame(data, expected))
        }
        _ => Ok(image::load_from_memory(data)?.to_rgb8()),
    }
}

fn short_frame(data: &[u8], expected: usize) -> CameraError {
    CameraError::MalformedFrame(format!(
        "{} bytes, expected at least {expected}",
        data.len()
    ))
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let expected = width as usize * height as usize * 2;
    let data = data.get(..expected).ok_or_else(|| short_frame(data, expected))?;

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    // [Y0 U Y1 V] carries two pixels sharing U and V
    for pair in data.chunks_exact(4) {
        if let [y0, u, y1, v] = *pair {
            let (r, g, b) = yuv_to_rgb(y0, u, v);
            rgb.extend_from_slice(&[r, g, b]);
            let (r, g, b) = yuv_to_rgb(y1, u, v);
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    // YUYV widths are even; pad any remainder with black
    rgb.resize(width as usize * height as usize * 3, 0);

    RgbImage::from_raw(width, height, rgb).ok_or_else(|| short_frame(data, expected))
}

/// Rotate `image` clockwise by `orientation`.
pub fn rotate(image: RgbImage, orientation: Orientation) -> RgbImage {
    match orientation.degrees() {
        90 => imageops::rotate90(&image),
        180 => imageops::rotate180(&image),
        270 => imageops::rotate270(&image),
        _ => image,
    }
}

/// Scale `image` to `target_width`, keeping the aspect ratio, then rotate it
/// upright.
pub fn make_thumbnail(image: &RgbImage, target_width: u32, orientation: Orientation) -> RgbImage {
    let width = target_width.clamp(1, image.width().max(1));
    let height = u64::from(image.height()) * u64::from(width) / u64::from(image.width().max(1));
    let height = u32::try_from(height).unwrap_or(u32::MAX).max(1);
    let scaled = imageops::resize(image, width, height, FilterType::Triangle);
    rotate(scaled, orientation)
}

/// Encode `image` as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality).encode_image(image)?;
    Ok(buffer)
}

/// Encode `image` as PNG.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{generate_test_frame, TestPattern};
    use crate::traits::Format;

    #[test]
    fn test_orientation_snaps_to_quarter_turns() {
        assert_eq!(Orientation::from_degrees(0).degrees(), 0);
        assert_eq!(Orientation::from_degrees(80).degrees(), 90);
        assert_eq!(Orientation::from_degrees(-90).degrees(), 270);
        assert_eq!(Orientation::from_degrees(350).degrees(), 0);
        assert_eq!(Orientation::from_degrees(540).degrees(), 180);
    }

    #[test]
    fn test_yuyv_color_bars_to_rgb() {
        let format = Format::new(64, 8, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);
        let rgb = to_rgb(&data, 64, 8, FourCC::YUYV).expect("conversion should succeed");

        assert_eq!(rgb.dimensions(), (64, 8));
        // First bar is white, last bar is black
        assert!(rgb.get_pixel(2, 4).0.iter().all(|c| *c > 200));
        assert!(rgb.get_pixel(62, 4).0.iter().all(|c| *c < 40));
    }

    #[test]
    fn test_short_yuyv_frame_is_rejected() {
        let err = to_rgb(&[0; 10], 64, 8, FourCC::YUYV).expect_err("frame is too short");
        assert!(matches!(err, CameraError::MalformedFrame(_)));
    }

    #[test]
    fn test_thumbnail_keeps_aspect_and_rotates() {
        let image = RgbImage::new(64, 48);
        let thumb = make_thumbnail(&image, 16, Orientation::default());
        assert_eq!(thumb.dimensions(), (16, 12));

        let rotated = make_thumbnail(&image, 16, Orientation::from_degrees(90));
        assert_eq!(rotated.dimensions(), (12, 16));
    }

    #[test]
    fn test_thumbnail_never_upscales() {
        let image = RgbImage::new(8, 4);
        let thumb = make_thumbnail(&image, 160, Orientation::default());
        assert_eq!(thumb.dimensions(), (8, 4));
    }

    #[test]
    fn test_jpeg_decodes_back() {
        let image = RgbImage::from_pixel(16, 8, image::Rgb([200, 40, 40]));
        let jpeg = encode_jpeg(&image, JPEG_QUALITY).expect("encode should succeed");
        let decoded = to_rgb(&jpeg, 16, 8, FourCC::MJPG).expect("decode should succeed");
        assert_eq!(decoded.dimensions(), (16, 8));
    }
}
