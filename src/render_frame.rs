use crate::backend::FrameSlice;
use crate::overlay::OverlayMarker;
use image::{Rgba, RgbaImage};
use rayon::prelude::*;

/// Maps a raw sample to an 8-bit gray level using the channel's display
/// range. A degenerate range (`max <= min`) thresholds at `min`.
pub fn gray_level(sample: f32, min: f64, max: f64) -> u8 {
    let sample = sample as f64;
    if !sample.is_finite() {
        return 0;
    }
    if max <= min {
        return if sample <= min { 0 } else { 255 };
    }
    let t = ((sample - min) / (max - min)).clamp(0.0, 1.0);
    (t * 255.0).round() as u8
}

pub fn render_grayscale(frame: &FrameSlice, min: f64, max: f64) -> RgbaImage {
    let mut img = RgbaImage::new(frame.width as u32, frame.height as u32);
    if frame.width == 0 {
        return img;
    }
    img.par_chunks_mut(frame.width * 4)
        .zip(frame.samples.par_chunks(frame.width))
        .for_each(|(out_row, in_row)| {
            for (px, &sample) in out_row.chunks_exact_mut(4).zip(in_row) {
                let g = gray_level(sample, min, max);
                px.copy_from_slice(&[g, g, g, 255]);
            }
        });
    img
}

/// Draws each marker as a two-pixel ring. Markers whose ring cannot touch
/// the image are skipped.
pub fn draw_markers(img: &mut RgbaImage, markers: &[OverlayMarker], radius: u32) {
    let r = radius as i64;
    let reach = radius as f64 + 1.0;
    let (w, h) = (img.width() as f64, img.height() as f64);
    for marker in markers {
        let (mx, my) = (marker.x.round(), marker.y.round());
        if !(mx >= -reach && mx <= w + reach && my >= -reach && my <= h + reach) {
            continue;
        }
        let color = Rgba(marker.state.rgba());
        let (cx, cy) = (mx as i64, my as i64);
        draw_ring(img, cx, cy, r, color);
        if r > 1 {
            draw_ring(img, cx, cy, r - 1, color);
        }
    }
}

/// Midpoint circle outline, clipped to the image.
fn draw_ring(img: &mut RgbaImage, cx: i64, cy: i64, r: i64, color: Rgba<u8>) {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let mut put = |dx: i64, dy: i64| {
        let (x, y) = (cx.saturating_add(dx), cy.saturating_add(dy));
        if (0..w).contains(&x) && (0..h).contains(&y) {
            img.put_pixel(x as u32, y as u32, color);
        }
    };
    if r <= 0 {
        put(0, 0);
        return;
    }
    let (mut x, mut y, mut err) = (r, 0i64, 1 - r);
    while x >= y {
        for (dx, dy) in [
            (x, y),
            (y, x),
            (-y, x),
            (-x, y),
            (-x, -y),
            (-y, -x),
            (y, -x),
            (x, -y),
        ] {
            put(dx, dy);
        }
        y += 1;
        if err < 0 {
            err += 2 * y + 1;
        } else {
            x -= 1;
            err += 2 * (y - x) + 1;
        }
    }
}
