//! Pure pixel-space refinement steps for extracted slide assets.
//!
//! Every function is a guarded sub-step: on failure the caller keeps the
//! original data and continues. Failures are expressed as [`Skipped`]
//! values, so the extractor can log the reason without aborting the slide.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};

use crate::error::Skipped;
use crate::layout::BBox;

/// Minimum side of a refined bbox in pixels.
const MIN_REFINED_SIDE: i64 = 5;

/// Minimum crop-area share a refined bbox must retain.
const MIN_REFINED_AREA_RATIO: f64 = 0.15;

/// Transparent-ratio window outside which the color key is abandoned.
const MIN_TRANSPARENT_RATIO: f64 = 0.01;
const MAX_TRANSPARENT_RATIO: f64 = 0.95;

// ── Bbox tightening ──────────────────────────────────────────────────────

/// Validate a tightened crop-relative bbox and translate it back to slide
/// coordinates.
///
/// `refined` is in the crop's coordinate space; `origin` is the crop's bbox
/// on the slide. A box that collapses onto a sub-detail (any side shorter
/// than 5px, or covering under 15% of the crop) is rejected and the caller
/// keeps the original.
pub fn accept_refined_bbox(origin: BBox, refined: BBox) -> Result<BBox, Skipped> {
    let crop_w = origin.width();
    let crop_h = origin.height();
    let clamped = refined.clamped(crop_w as u32, crop_h as u32);

    if clamped.width() < MIN_REFINED_SIDE || clamped.height() < MIN_REFINED_SIDE {
        return Err(Skipped::Rejected {
            detail: format!(
                "{}x{}px below {MIN_REFINED_SIDE}px minimum side",
                clamped.width(),
                clamped.height()
            ),
        });
    }

    let area_ratio = clamped.area() as f64 / (crop_w * crop_h).max(1) as f64;
    if area_ratio < MIN_REFINED_AREA_RATIO {
        return Err(Skipped::Rejected {
            detail: format!("covers {:.1}% of the crop", area_ratio * 100.0),
        });
    }

    Ok(clamped.offset(origin.x0, origin.y0))
}

// ── Color-key transparency ───────────────────────────────────────────────

/// Estimated background color and how uniform the border actually is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BorderEstimate {
    pub color: [u8; 3],
    pub avg_diff: f64,
}

/// Per-channel median of border pixels, sampled on a stride.
///
/// Returns `None` when the image is too small to have a border or when the
/// border is so non-uniform (average deviation above `3 * tolerance`) that
/// no single background color exists.
pub fn estimate_border_color(image: &RgbaImage, tolerance: i32) -> Option<BorderEstimate> {
    let (width, height) = image.dimensions();
    if width < 2 || height < 2 {
        return None;
    }

    let stride = (width.min(height) / 50).max(1);
    let mut samples: Vec<[u8; 3]> = Vec::new();
    for x in (0..width).step_by(stride as usize) {
        let top = image.get_pixel(x, 0).0;
        let bottom = image.get_pixel(x, height - 1).0;
        samples.push([top[0], top[1], top[2]]);
        samples.push([bottom[0], bottom[1], bottom[2]]);
    }
    for y in (0..height).step_by(stride as usize) {
        let left = image.get_pixel(0, y).0;
        let right = image.get_pixel(width - 1, y).0;
        samples.push([left[0], left[1], left[2]]);
        samples.push([right[0], right[1], right[2]]);
    }
    if samples.is_empty() {
        return None;
    }

    let mid = samples.len() / 2;
    let channel = |i: usize| {
        let mut values: Vec<u8> = samples.iter().map(|s| s[i]).collect();
        values.sort_unstable();
        values[mid]
    };
    let color = [channel(0), channel(1), channel(2)];

    let avg_diff = samples
        .iter()
        .map(|s| {
            let dr = (s[0] as i32 - color[0] as i32).abs();
            let dg = (s[1] as i32 - color[1] as i32).abs();
            let db = (s[2] as i32 - color[2] as i32).abs();
            dr.max(dg).max(db) as f64
        })
        .sum::<f64>()
        / samples.len() as f64;

    if avg_diff > (tolerance * 3) as f64 {
        return None;
    }
    Some(BorderEstimate { color, avg_diff })
}

/// Key out the border background color: pixels within `tolerance` of the
/// estimated background (max channel difference) get zero alpha.
///
/// Abandoned when the border estimate is unreliable or when the resulting
/// transparent share falls outside `[1%, 95%]`; the caller then keeps the
/// opaque image.
pub fn apply_color_key(image: &RgbaImage, tolerance: i32) -> Result<RgbaImage, Skipped> {
    if tolerance <= 0 {
        return Err(Skipped::Disabled);
    }
    let estimate = estimate_border_color(image, tolerance).ok_or_else(|| Skipped::ColorKey {
        detail: "no uniform border color".into(),
    })?;
    if estimate.avg_diff > (tolerance * 2) as f64 {
        return Err(Skipped::ColorKey {
            detail: format!("border deviation {:.1} above keying limit", estimate.avg_diff),
        });
    }

    let [bg_r, bg_g, bg_b] = estimate.color;
    let mut keyed = image.clone();
    let mut transparent = 0usize;
    for pixel in keyed.pixels_mut() {
        let [r, g, b, _] = pixel.0;
        let diff = (r as i32 - bg_r as i32)
            .abs()
            .max((g as i32 - bg_g as i32).abs())
            .max((b as i32 - bg_b as i32).abs());
        if diff <= tolerance {
            *pixel = Rgba([r, g, b, 0]);
            transparent += 1;
        }
    }

    let total = (keyed.width() * keyed.height()) as usize;
    if total == 0 {
        return Err(Skipped::ColorKey {
            detail: "empty image".into(),
        });
    }
    let ratio = transparent as f64 / total as f64;
    if !(MIN_TRANSPARENT_RATIO..=MAX_TRANSPARENT_RATIO).contains(&ratio) {
        return Err(Skipped::ColorKey {
            detail: format!("transparent ratio {:.3} outside [0.01, 0.95]", ratio),
        });
    }
    Ok(keyed)
}

// ── Sizing helpers ───────────────────────────────────────────────────────

/// Resize a regenerated asset back to the crop's dimensions when the model
/// returned a different size. Lanczos keeps text in charts legible.
pub fn resize_to(image: DynamicImage, width: u32, height: u32) -> DynamicImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        image.resize_exact(width, height, FilterType::Lanczos3)
    }
}

/// Nearest standard aspect ratio within tolerance, for image generation
/// calls that accept one. `None` leaves the call unconstrained.
pub fn infer_aspect_ratio(width: u32, height: u32) -> Option<&'static str> {
    if height == 0 {
        return None;
    }
    let ratio = width as f64 / height as f64;
    for (name, target) in [
        ("16:9", 16.0 / 9.0),
        ("4:3", 4.0 / 3.0),
        ("1:1", 1.0),
    ] {
        if (ratio - target).abs() < 0.03 {
            return Some(name);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(color))
    }

    #[test]
    fn refined_bbox_translates_to_slide_coordinates() {
        let origin = BBox::new(100, 200, 300, 400);
        let refined = BBox::new(10, 20, 150, 180);
        let accepted = accept_refined_bbox(origin, refined).unwrap();
        assert_eq!(accepted, BBox::new(110, 220, 250, 380));
    }

    #[test]
    fn tiny_refined_bbox_is_rejected() {
        let origin = BBox::new(0, 0, 200, 200);
        let err = accept_refined_bbox(origin, BBox::new(10, 10, 13, 180)).unwrap_err();
        assert!(matches!(err, Skipped::Rejected { .. }), "{err}");
    }

    #[test]
    fn low_area_refined_bbox_is_rejected() {
        let origin = BBox::new(0, 0, 200, 200);
        // 40x40 of 200x200 is 4% of the crop.
        let err = accept_refined_bbox(origin, BBox::new(0, 0, 40, 40)).unwrap_err();
        match err {
            Skipped::Rejected { detail } => assert!(detail.contains('%'), "{detail}"),
            other => panic!("unexpected skip: {other}"),
        }
    }

    #[test]
    fn refined_bbox_is_clamped_to_crop() {
        let origin = BBox::new(50, 50, 150, 150);
        // Overshoots the 100x100 crop on all sides.
        let accepted = accept_refined_bbox(origin, BBox::new(-20, -20, 500, 500)).unwrap();
        assert_eq!(accepted, BBox::new(50, 50, 150, 150));
    }

    #[test]
    fn border_color_of_uniform_image() {
        let img = solid(64, 64, [200, 10, 60, 255]);
        let estimate = estimate_border_color(&img, 18).unwrap();
        assert_eq!(estimate.color, [200, 10, 60]);
        assert_eq!(estimate.avg_diff, 0.0);
    }

    #[test]
    fn noisy_border_yields_no_estimate() {
        let mut img = solid(64, 64, [255, 255, 255, 255]);
        for (i, pixel) in img.pixels_mut().enumerate() {
            if i % 2 == 0 {
                *pixel = Rgba([0, 0, 0, 255]);
            }
        }
        assert!(estimate_border_color(&img, 10).is_none());
    }

    #[test]
    fn color_key_clears_background_only() {
        // White background with a centred red square.
        let mut img = solid(50, 50, [255, 255, 255, 255]);
        for y in 15..35 {
            for x in 15..35 {
                img.put_pixel(x, y, Rgba([200, 0, 0, 255]));
            }
        }
        let keyed = apply_color_key(&img, 18).unwrap();
        assert_eq!(keyed.get_pixel(0, 0).0[3], 0);
        assert_eq!(keyed.get_pixel(25, 25).0[3], 255);
    }

    #[test]
    fn fully_keyable_image_is_abandoned() {
        // Keying a uniform image would clear ~100% of pixels.
        let img = solid(40, 40, [240, 240, 240, 255]);
        let err = apply_color_key(&img, 18).unwrap_err();
        assert!(matches!(err, Skipped::ColorKey { .. }), "{err}");
    }

    #[test]
    fn negligible_key_coverage_is_abandoned() {
        // A 1px dark ring on a 500x500 canvas keys under 1% of pixels.
        let mut img = solid(500, 500, [200, 200, 200, 255]);
        for x in 0..500 {
            img.put_pixel(x, 0, Rgba([10, 10, 10, 255]));
            img.put_pixel(x, 499, Rgba([10, 10, 10, 255]));
        }
        for y in 0..500 {
            img.put_pixel(0, y, Rgba([10, 10, 10, 255]));
            img.put_pixel(499, y, Rgba([10, 10, 10, 255]));
        }
        let err = apply_color_key(&img, 18).unwrap_err();
        assert!(matches!(err, Skipped::ColorKey { .. }), "{err}");
    }

    #[test]
    fn zero_tolerance_disables_keying() {
        let img = solid(10, 10, [1, 2, 3, 255]);
        assert!(matches!(
            apply_color_key(&img, 0).unwrap_err(),
            Skipped::Disabled
        ));
    }

    #[test]
    fn resize_is_identity_at_matching_size() {
        let img = DynamicImage::ImageRgba8(solid(30, 20, [9, 9, 9, 255]));
        let out = resize_to(img, 30, 20);
        assert_eq!(out.dimensions(), (30, 20));
        let out = resize_to(out, 60, 40);
        assert_eq!(out.dimensions(), (60, 40));
    }

    #[test]
    fn aspect_ratios_snap_within_tolerance() {
        assert_eq!(infer_aspect_ratio(1920, 1080), Some("16:9"));
        assert_eq!(infer_aspect_ratio(800, 600), Some("4:3"));
        assert_eq!(infer_aspect_ratio(512, 512), Some("1:1"));
        assert_eq!(infer_aspect_ratio(1000, 150), None);
        assert_eq!(infer_aspect_ratio(100, 0), None);
    }
}
