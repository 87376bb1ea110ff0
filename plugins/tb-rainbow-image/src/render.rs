//! Pixel generation and PNG output

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::Path;

pub const BYTES_PER_PIXEL: usize = 4;

/// HSL (all in 0..=1) to opaque RGBA
pub fn hsl_to_rgba(h: f64, s: f64, l: f64) -> [u8; 4] {
    let v = if l <= 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let (r, g, b) = if v > 0.0 {
        let m = l + l - v;
        let sv = (v - m) / v;
        let h = h * 6.0;
        let sextant = h as i32;
        let fract = h - f64::from(sextant);
        let vsf = v * sv * fract;
        let mid1 = m + vsf;
        let mid2 = v - vsf;
        match sextant {
            0 => (v, mid1, m),
            1 => (mid2, v, m),
            2 => (m, v, mid1),
            3 => (m, mid2, v),
            4 => (mid1, m, v),
            5 => (v, m, mid2),
            _ => (l, l, l),
        }
    } else {
        (l, l, l)
    };

    [to_byte(r), to_byte(g), to_byte(b), u8::MAX]
}

fn to_byte(channel: f64) -> u8 {
    (channel * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Fill one RGBA row of a `width` x `height` rainbow arc.
///
/// Pixels outside the arc are left fully transparent.
pub fn render_row(y: u32, width: u32, height: u32, row: &mut [u8]) {
    let centre_x = f64::from(width) * 0.5;
    let dy = 1.2 - f64::from(y) / f64::from(height) * 1.1;

    for (x, pixel) in row.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
        let dx = (centre_x - x as f64).abs() / centre_x * 1.1;
        let band = (dx * dx + dy * dy).sqrt() * 2.0 - 1.0;
        if (0.0..=1.0).contains(&band) {
            pixel.copy_from_slice(&hsl_to_rgba(band, 0.5, 0.5));
        } else {
            pixel.fill(0);
        }
    }
}

/// True if `path` names a `.png` file (any case); the only format written.
pub fn is_png(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("png"))
        .unwrap_or(false)
}

/// Encode `rgba` as an 8-bit RGBA PNG at `path`, creating parent folders.
pub fn write_png(path: &Path, width: u32, height: u32, rgba: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);

    let mut writer = encoder.write_header().map_err(to_io)?;
    writer.write_image_data(rgba).map_err(to_io)?;
    writer.finish().map_err(to_io)
}

fn to_io(err: png::EncodingError) -> io::Error {
    match err {
        png::EncodingError::IoError(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}
