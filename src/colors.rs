//! Block colouring.
//!
//! Meshers take any [`ColorLookup`]; [`PaletteColors`] is the built-in
//! scheme: a fixed table for common materials, a stable hashed hue for
//! everything else, darkened toward the bottom of the world.

/// RGBA, 0..=255 per channel.
pub type Rgba = [u8; 4];

pub const TRANSPARENT: Rgba = [0, 0, 0, 0];

/// Maps a block id to a colour.
///
/// Arguments are `(block_id, palette, y, height)`. An empty palette means
/// no bootstrap has arrived.
pub trait ColorLookup {
    fn color(&self, block: u16, palette: &[String], y: usize, height: usize) -> Rgba;
}

impl<F> ColorLookup for F
where
    F: Fn(u16, &[String], usize, usize) -> Rgba,
{
    fn color(&self, block: u16, palette: &[String], y: usize, height: usize) -> Rgba {
        self(block, palette, y, height)
    }
}

/// Default palette-name colour scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaletteColors;

impl ColorLookup for PaletteColors {
    fn color(&self, block: u16, palette: &[String], y: usize, height: usize) -> Rgba {
        block_rgba(block, palette, y, height)
    }
}

pub fn block_rgba(block: u16, palette: &[String], y: usize, height: usize) -> Rgba {
    let name = palette.get(block as usize).map(String::as_str).unwrap_or("");
    if palette.is_empty() {
        if block == 0 {
            return TRANSPARENT;
        }
    } else if name == "AIR" {
        return TRANSPARENT;
    }

    let (rgb, a) = match name {
        "GRASS" => ([70, 160, 90], 255),
        "DIRT" => ([110, 80, 55], 255),
        "SAND" => ([194, 178, 128], 255),
        "STONE" => ([125, 130, 138], 255),
        "WATER" => ([60, 120, 200], 220),
        "ICE" => ([150, 200, 235], 230),
        "LOG" => ([122, 92, 58], 255),
        "PLANK" => ([168, 130, 80], 255),
        "BRICK" => ([152, 74, 64], 255),
        "GLASS" => ([210, 235, 255], 120),
        "METAL_PLATE" => ([170, 180, 195], 255),
        "TORCH" => ([255, 190, 80], 245),
        _ => {
            let h = if name.is_empty() {
                hash32(&block.to_string())
            } else {
                hash32(name)
            };
            (hsl_to_rgb((h % 360) as f32, 0.55, 0.52), 255)
        }
    };

    let span = height.saturating_sub(1).max(1) as f32;
    let shade = 0.72 + (y as f32 / span).clamp(0.0, 1.0) * 0.28;
    let [r, g, b] = rgb.map(|c: u8| (c as f32 * shade).round() as u8);
    [r, g, b, a]
}

/// FNV-1a over UTF-16 code units.
fn hash32(s: &str) -> u32 {
    s.encode_utf16()
        .fold(2_166_136_261u32, |h, unit| (h ^ unit as u32).wrapping_mul(16_777_619))
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> [u8; 3] {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let hh = (h % 360.0) / 60.0;
    let x = c * (1.0 - ((hh % 2.0) - 1.0).abs());
    let (r, g, b) = match hh {
        v if v < 1.0 => (c, x, 0.0),
        v if v < 2.0 => (x, c, 0.0),
        v if v < 3.0 => (0.0, c, x),
        v if v < 4.0 => (0.0, x, c),
        v if v < 5.0 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = l - c / 2.0;
    [r, g, b].map(|v| ((v + m) * 255.0).round() as u8)
}
