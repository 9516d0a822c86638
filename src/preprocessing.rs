use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use imageproc::contrast::{ThresholdType, otsu_level, threshold};
use ndarray::Array3;

use crate::collaborator::DetectorInput;

/// Resize to the detector's square input and scale channel values into [0, 1].
pub fn detector_input(img: &DynamicImage, size: u32) -> DetectorInput {
    let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    Array3::from_shape_fn((size as usize, size as usize, 3), |(y, x, c)| {
        rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

/// Grayscale then binarise with Otsu's threshold; black text on white works best for OCR.
pub fn binarize_for_ocr(img: &DynamicImage) -> GrayImage {
    let gray = img.to_luma8();
    let level = otsu_level(&gray);
    threshold(&gray, level, ThresholdType::Binary)
}
