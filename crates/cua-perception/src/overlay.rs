//! Set-of-Mark overlay rendering.
//!
//! Draws a numbered bounding box over every grounded element so the executor
//! can answer with `element_id: 7` instead of guessing raw coordinates. The
//! input frame arrives base64-encoded (PNG or JPEG); the overlay is always
//! re-encoded as PNG so box edges stay crisp. Frames in the tag manifest stay
//! in logical points; only the drawing is scaled to image pixels.
//!
//! Rendering failures are never fatal: an undecodable frame is returned
//! untouched with an empty manifest, and the loop simply proceeds without
//! marks for that iteration.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use tracing::debug;

use cua_types::{DisplayInfo, OverlayTag};

/// Box colours, cycled by tag id.
const PALETTE: [[u8; 3]; 6] = [
    [255, 99, 71],
    [52, 152, 219],
    [46, 204, 113],
    [241, 196, 15],
    [155, 89, 182],
    [230, 126, 34],
];

const BOX_BORDER_PX: u32 = 2;
const LABEL_HEIGHT_PX: u32 = 14;

/// 3×5 digit glyphs, one 3-bit row per entry.
const DIGIT_GLYPHS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111], // 0
    [0b010, 0b110, 0b010, 0b010, 0b111], // 1
    [0b111, 0b001, 0b111, 0b100, 0b111], // 2
    [0b111, 0b001, 0b111, 0b001, 0b111], // 3
    [0b101, 0b101, 0b111, 0b001, 0b001], // 4
    [0b111, 0b100, 0b111, 0b001, 0b111], // 5
    [0b111, 0b100, 0b111, 0b101, 0b111], // 6
    [0b111, 0b001, 0b010, 0b010, 0b010], // 7
    [0b111, 0b101, 0b111, 0b101, 0b111], // 8
    [0b111, 0b101, 0b111, 0b001, 0b111], // 9
];

const HASH_GLYPH: [u8; 5] = [0b101, 0b111, 0b101, 0b111, 0b101];

/// Draw numbered bounding boxes for `tags` onto the screenshot.
///
/// Returns `(overlay_base64_png, manifest)`. The manifest echoes the input
/// tags (id, role, label, logical-point frame); it is empty when no tags were
/// supplied or the frame could not be decoded.
pub fn draw_som_overlay(
    base_image_b64: &str,
    tags: &[OverlayTag],
    display: &DisplayInfo,
) -> (String, Vec<OverlayTag>) {
    if tags.is_empty() {
        return (base_image_b64.to_string(), Vec::new());
    }

    let Ok(bytes) = BASE64.decode(base_image_b64) else {
        debug!("overlay skipped: frame is not valid base64");
        return (base_image_b64.to_string(), Vec::new());
    };
    let Ok(decoded) = image::load_from_memory(&bytes) else {
        debug!("overlay skipped: frame is not a decodable image");
        return (base_image_b64.to_string(), Vec::new());
    };
    let mut img = decoded.to_rgb8();

    // The capture may already be logical-sized or may be at physical
    // resolution; derive the drawing scale from the actual image width.
    let scale = if display.logical_width > 0 {
        img.width() as f64 / display.logical_width as f64
    } else {
        1.0
    };

    for tag in tags {
        let color = PALETTE[((tag.id.max(1) - 1) as usize) % PALETTE.len()];
        let x0 = clamp_px(tag.frame.x * scale, img.width());
        let y0 = clamp_px(tag.frame.y * scale, img.height());
        let x1 = clamp_px((tag.frame.x + tag.frame.w) * scale, img.width());
        let y1 = clamp_px((tag.frame.y + tag.frame.h) * scale, img.height());

        draw_rect_outline(&mut img, x0, y0, x1, y1, color);
        draw_label(&mut img, x0, y0, tag.id, color);
    }

    let mut encoded = Vec::new();
    if image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .is_err()
    {
        return (base_image_b64.to_string(), Vec::new());
    }

    (BASE64.encode(&encoded), tags.to_vec())
}

fn clamp_px(value: f64, limit: u32) -> u32 {
    if value <= 0.0 {
        0
    } else {
        (value as u32).min(limit.saturating_sub(1))
    }
}

fn put_pixel(img: &mut RgbImage, x: u32, y: u32, color: [u8; 3]) {
    if x < img.width() && y < img.height() {
        img.put_pixel(x, y, image::Rgb(color));
    }
}

fn draw_rect_outline(img: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, color: [u8; 3]) {
    for thickness in 0..BOX_BORDER_PX {
        for x in x0..=x1 {
            put_pixel(img, x, y0 + thickness, color);
            put_pixel(img, x, y1.saturating_sub(thickness), color);
        }
        for y in y0..=y1 {
            put_pixel(img, x0 + thickness, y, color);
            put_pixel(img, x1.saturating_sub(thickness), y, color);
        }
    }
}

/// Filled label box with `#<id>` just above the top-left box corner.
fn draw_label(img: &mut RgbImage, x0: u32, y0: u32, id: u32, color: [u8; 3]) {
    let digits: Vec<u32> = {
        let mut rest = id;
        let mut out = Vec::new();
        loop {
            out.push(rest % 10);
            rest /= 10;
            if rest == 0 {
                break;
            }
        }
        out.reverse();
        out
    };

    // Each glyph cell is rendered at 2×: 6 px wide + 2 px advance.
    let glyph_advance = 8u32;
    let label_w = 4 + glyph_advance * (digits.len() as u32 + 1);
    let label_y0 = y0.saturating_sub(LABEL_HEIGHT_PX);

    for y in label_y0..y0 {
        for x in x0..x0 + label_w {
            put_pixel(img, x, y, color);
        }
    }

    let ink = [0u8, 0u8, 0u8];
    let mut cursor_x = x0 + 2;
    let glyph_y = label_y0 + 2;
    draw_glyph(img, cursor_x, glyph_y, &HASH_GLYPH, ink);
    cursor_x += glyph_advance;
    for digit in digits {
        draw_glyph(img, cursor_x, glyph_y, &DIGIT_GLYPHS[digit as usize], ink);
        cursor_x += glyph_advance;
    }
}

fn draw_glyph(img: &mut RgbImage, x0: u32, y0: u32, glyph: &[u8; 5], color: [u8; 3]) {
    for (row, bits) in glyph.iter().enumerate() {
        for col in 0..3u32 {
            if bits & (0b100 >> col) != 0 {
                // 2× scale per glyph cell.
                let px = x0 + col * 2;
                let py = y0 + row as u32 * 2;
                put_pixel(img, px, py, color);
                put_pixel(img, px + 1, py, color);
                put_pixel(img, px, py + 1, color);
                put_pixel(img, px + 1, py + 1, color);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
