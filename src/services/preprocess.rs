//! Image preparation ahead of OCR.

use image::{imageops, DynamicImage, GrayImage, ImageFormat};
use std::io::Cursor;

/// Angles tried by the rotation search, in evaluation order.
pub const ROTATION_ANGLES: [u16; 4] = [0, 90, 180, 270];

/// Pages are downscaled to this longest side before OCR.
const MAX_DIMENSION: u32 = 2400;

/// Rotate clockwise by a multiple of 90 degrees.
pub fn rotate(image: &DynamicImage, angle: u16) -> DynamicImage {
    match angle % 360 {
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        _ => image.clone(),
    }
}

/// Grayscale, stretch contrast to the full range, then sharpen.
pub fn preprocess(image: &DynamicImage) -> GrayImage {
    let image = if image.width().max(image.height()) > MAX_DIMENSION {
        image.resize(MAX_DIMENSION, MAX_DIMENSION, imageops::FilterType::Triangle)
    } else {
        image.clone()
    };

    let mut gray = image.to_luma8();
    normalize_contrast(&mut gray);
    imageops::unsharpen(&gray, 1.0, 4)
}

/// Linear stretch of the luminance histogram to 0..=255.
pub fn normalize_contrast(gray: &mut GrayImage) {
    let (min, max) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if max <= min {
        return;
    }

    let range = (max - min) as f32;
    for pixel in gray.pixels_mut() {
        let stretched = (pixel[0] - min) as f32 * 255.0 / range;
        pixel[0] = stretched.round() as u8;
    }
}

pub fn encode_png(gray: &GrayImage) -> Result<Vec<u8>, image::ImageError> {
    let mut png = Vec::new();
    gray.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, RgbImage};

    #[test]
    fn test_rotate_swaps_dimensions() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(40, 20));
        assert_eq!(rotate(&img, 90).width(), 20);
        assert_eq!(rotate(&img, 180).width(), 40);
        assert_eq!(rotate(&img, 270).height(), 40);
        assert_eq!(rotate(&img, 0).height(), 20);
    }

    #[test]
    fn test_normalize_contrast_stretches_range() {
        let mut gray = GrayImage::from_fn(4, 1, |x, _| Luma([100 + x as u8 * 10]));
        normalize_contrast(&mut gray);
        assert_eq!(gray.get_pixel(0, 0)[0], 0);
        assert_eq!(gray.get_pixel(3, 0)[0], 255);
    }

    #[test]
    fn test_normalize_contrast_flat_image_unchanged() {
        let mut gray = GrayImage::from_pixel(3, 3, Luma([128]));
        normalize_contrast(&mut gray);
        assert!(gray.pixels().all(|p| p[0] == 128));
    }

    #[test]
    fn test_preprocess_outputs_png() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 8, image::Rgb([200, 10, 10])));
        let png = encode_png(&preprocess(&img)).unwrap();
        assert_eq!(image::guess_format(&png).unwrap(), ImageFormat::Png);
    }
}
