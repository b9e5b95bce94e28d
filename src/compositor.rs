//! Text compositor: renders one string into a premultiplied ARGB raster
//!
//! Two phases. The text is first drawn as a white coverage mask on a fully
//! transparent canvas, then every covered pixel is recolored to the target
//! color premultiplied by its alpha. The raster covers the whole overlay surface.

use anyhow::{bail, Result};
use fontdue::Font;

use crate::constants::compositor::{BASELINE_FACTOR, REFERENCE_SUFFIX};

/// ARGB pixels (premultiplied alpha), row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u32>,
}

impl Raster {
    pub fn transparent(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    /// Byte layout expected by a little-endian 32-bit ZPixmap (B, G, R, A)
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|px| px.to_le_bytes()).collect()
    }
}

/// Vertical extents of a line of text, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineExtents {
    pub ascent: i32,
    pub descent: i32,
}

impl LineExtents {
    pub fn height(&self) -> i32 {
        self.ascent + self.descent
    }
}

/// Measure `text` plus the reference suffix so strings with and without
/// descenders share one baseline
pub fn measure(font: &Font, size: f32, text: &str) -> LineExtents {
    text.chars()
        .chain(REFERENCE_SUFFIX.chars())
        .map(|ch| font.metrics(ch, size))
        .fold(LineExtents { ascent: 0, descent: 0 }, |acc, m| LineExtents {
            ascent: acc.ascent.max(m.height as i32 + m.ymin),
            descent: acc.descent.max(-m.ymin),
        })
}

/// Top of the text box: `surface_height - 1.5 * text_height`
pub fn text_top(surface_height: u32, text_height: i32) -> i32 {
    (surface_height as f32 - BASELINE_FACTOR * text_height as f32).floor() as i32
}

/// Phase one: white text on a transparent canvas, alpha = glyph coverage
pub fn draw_white(font: &Font, size: f32, text: &str, width: u32, height: u32, x: i32, baseline: i32) -> Raster {
    let mut canvas = Raster::transparent(width, height);
    let mut pen = x as f32;

    for ch in text.chars() {
        let (metrics, bitmap) = font.rasterize(ch, size);
        let left = pen.round() as i32 + metrics.xmin;
        let top = baseline - (metrics.height as i32 + metrics.ymin);

        for gy in 0..metrics.height {
            let py = top + gy as i32;
            if py < 0 || py >= height as i32 {
                continue;
            }
            for gx in 0..metrics.width {
                let px = left + gx as i32;
                if px < 0 || px >= width as i32 {
                    continue;
                }
                let coverage = bitmap[gy * metrics.width + gx] as u32;
                if coverage == 0 {
                    continue;
                }
                let pixel = &mut canvas.data[py as usize * width as usize + px as usize];
                // Overlapping glyphs keep the stronger coverage
                let alpha = coverage.max(*pixel >> 24);
                *pixel = (alpha << 24) | 0x00FF_FFFF;
            }
        }
        pen += metrics.advance_width;
    }
    canvas
}

/// `round(channel * alpha / 255)` in integer arithmetic
fn scale(channel: u8, alpha: u32) -> u32 {
    (channel as u32 * alpha + 127) / 255
}

/// Phase two: recolor covered pixels to `color` premultiplied by their alpha.
/// Fully transparent pixels are left untouched.
pub fn recolor(raster: &mut Raster, color: [u8; 3]) {
    for pixel in raster.data.iter_mut() {
        let alpha = *pixel >> 24;
        if alpha == 0 {
            continue;
        }
        *pixel = (alpha << 24) | (scale(color[0], alpha) << 16) | (scale(color[1], alpha) << 8) | scale(color[2], alpha);
    }
}

/// Turns a text into a full-surface frame
pub trait TextRenderer {
    fn render(&self, width: u32, height: u32, text: &str) -> Result<Raster>;
}

/// Font, size, color and left margin applied to every rendered text
pub struct TextCompositor {
    font: Font,
    size: f32,
    color: [u8; 3],
    anchor_x: i32,
}

impl TextCompositor {
    pub fn new(font: Font, size: f32, color: [u8; 3], anchor_x: i32) -> Self {
        Self { font, size, color, anchor_x }
    }
}

impl TextRenderer for TextCompositor {
    /// Render `text` into a `width` × `height` premultiplied raster
    fn render(&self, width: u32, height: u32, text: &str) -> Result<Raster> {
        if width == 0 || height == 0 {
            bail!("Cannot render into an empty {}x{} surface", width, height);
        }
        let extents = measure(&self.font, self.size, text);
        let top = text_top(height, extents.height());
        let mut raster = draw_white(&self.font, self.size, text, width, height, self.anchor_x, top + extents.ascent);
        recolor(&mut raster, self.color);
        Ok(raster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster_of(pixels: Vec<u32>) -> Raster {
        Raster { width: pixels.len() as u32, height: 1, data: pixels }
    }

    #[test]
    fn test_opaque_pixel_gets_exact_color() {
        let mut raster = raster_of(vec![0xFF_FF_FF_FF]);
        recolor(&mut raster, [12, 200, 77]);
        assert_eq!(raster.data[0], 0xFF_0C_C8_4D);
    }

    #[test]
    fn test_transparent_pixel_untouched() {
        // Non-zero RGB under zero alpha must survive as-is
        let mut raster = raster_of(vec![0x00_12_34_56, 0]);
        recolor(&mut raster, [255, 0, 0]);
        assert_eq!(raster.data, vec![0x00_12_34_56, 0]);
    }

    #[test]
    fn test_partial_alpha_is_rounded_premultiply() {
        let mut raster = raster_of(vec![0x80_FF_FF_FF, 0x01_FF_FF_FF]);
        recolor(&mut raster, [200, 255, 1]);

        for (pixel, alpha) in raster.data.iter().zip([128u32, 1]) {
            assert_eq!(pixel >> 24, alpha);
            let expected = |c: u32| ((c * alpha) as f64 / 255.0).round() as u32;
            assert_eq!((pixel >> 16) & 0xFF, expected(200));
            assert_eq!((pixel >> 8) & 0xFF, expected(255));
            assert_eq!(pixel & 0xFF, expected(1));
        }
    }

    #[test]
    fn test_scale_matches_rounding_for_all_inputs() {
        for c in 0..=255u8 {
            for a in 0..=255u32 {
                let expected = ((c as u32 * a) as f64 / 255.0).round() as u32;
                assert_eq!(scale(c, a), expected, "channel {c} alpha {a}");
            }
        }
    }

    #[test]
    fn test_text_top_layout() {
        assert_eq!(text_top(200, 20), 170);
        assert_eq!(text_top(100, 15), 77);
        // Taller text than the surface places the box above it
        assert_eq!(text_top(10, 20), -20);
    }

    #[test]
    fn test_le_bytes_are_bgra() {
        let raster = raster_of(vec![0x80_11_22_33]);
        assert_eq!(raster.to_le_bytes(), vec![0x33, 0x22, 0x11, 0x80]);
    }
}
