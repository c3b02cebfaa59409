use std::path::Path;

use anyhow::Context;
use image::{ImageBuffer, Rgb, RgbImage};

/// Maps shown side by side in a visualisation row: position, cos, sin, width.
pub struct MapSet<'a> {
    pub position: &'a [f32],
    pub cos: &'a [f32],
    pub sin: &'a [f32],
    pub width: &'a [f32],
}

/// Writes a two-row montage: the input followed by the target maps, then the
/// input followed by the predicted maps.
pub fn save_preview_montage(
    save_path: &Path,
    input_chw: &[f32],
    channels: usize,
    target: &MapSet<'_>,
    pred: &MapSet<'_>,
    h: usize,
    w: usize,
) -> anyhow::Result<()> {
    let pixels = h * w;
    if input_chw.len() != channels * pixels {
        anyhow::bail!("Expected input tensor with {channels} channels for preview");
    }
    for map in [
        target.position,
        target.cos,
        target.sin,
        target.width,
        pred.position,
        pred.cos,
        pred.sin,
        pred.width,
    ] {
        if map.len() != pixels {
            anyhow::bail!("Target/prediction map has invalid shape for preview");
        }
    }

    let input = if channels >= 3 {
        // Depth comes first when both are present; show the colour image.
        let start = (channels - 3) * pixels;
        chw_to_rgb(&input_chw[start..start + 3 * pixels], h, w)
    } else {
        normalize_map_to_rgb(&input_chw[0..pixels], h, w)
    };

    let mut montage: RgbImage = ImageBuffer::new((w * 5) as u32, (h * 2) as u32);
    for (row, maps) in [target, pred].iter().enumerate() {
        let y = row * h;
        blit(&mut montage, &input, 0, y);
        blit(&mut montage, &normalize_map_to_rgb(maps.position, h, w), w, y);
        blit(&mut montage, &normalize_map_to_rgb(maps.cos, h, w), w * 2, y);
        blit(&mut montage, &normalize_map_to_rgb(maps.sin, h, w), w * 3, y);
        blit(&mut montage, &normalize_map_to_rgb(maps.width, h, w), w * 4, y);
    }

    if let Some(parent) = save_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create preview dir: {}", parent.display()))?;
    }
    montage
        .save(save_path)
        .with_context(|| format!("Failed to write preview image: {}", save_path.display()))?;
    Ok(())
}

/// Colour planes are mean-subtracted, so they are rescaled jointly.
fn chw_to_rgb(chw: &[f32], h: usize, w: usize) -> RgbImage {
    let pixels = h * w;
    let (vmin, vmax) = percentile_range(chw);
    let scale = (vmax - vmin).max(1e-6);
    let to_u8 = |v: f32| (((v - vmin) / scale).clamp(0.0, 1.0) * 255.0).round() as u8;

    let mut image: RgbImage = ImageBuffer::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let r = to_u8(chw[idx]);
            let g = to_u8(chw[pixels + idx]);
            let b = to_u8(chw[2 * pixels + idx]);
            image.put_pixel(x as u32, y as u32, Rgb([r, g, b]));
        }
    }
    image
}

fn normalize_map_to_rgb(map: &[f32], h: usize, w: usize) -> RgbImage {
    let (vmin, vmax) = percentile_range(map);
    let scale = (vmax - vmin).max(1e-6);
    let mut image: RgbImage = ImageBuffer::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let value = map[y * w + x];
            let norm = if value.is_finite() {
                ((value - vmin) / scale).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let gray = (norm * 255.0).round() as u8;
            image.put_pixel(x as u32, y as u32, Rgb([gray, gray, gray]));
        }
    }
    image
}

/// 5th and 95th percentiles of the finite values.
fn percentile_range(values: &[f32]) -> (f32, f32) {
    let mut sorted: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return (0.0, 1.0);
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let low_idx = ((sorted.len() as f32) * 0.05).floor() as usize;
    let high_idx = ((sorted.len() as f32) * 0.95).floor() as usize;
    (
        sorted[low_idx.min(sorted.len() - 1)],
        sorted[high_idx.min(sorted.len() - 1)],
    )
}

fn blit(dst: &mut RgbImage, src: &RgbImage, x_offset: usize, y_offset: usize) {
    for (x, y, pixel) in src.enumerate_pixels() {
        dst.put_pixel(x + x_offset as u32, y + y_offset as u32, *pixel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn montage_has_five_columns_and_two_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vis").join("epoch_00.png");
        let (h, w) = (8, 6);
        let map: Vec<f32> = (0..h * w).map(|v| v as f32).collect();
        let maps = MapSet {
            position: &map,
            cos: &map,
            sin: &map,
            width: &map,
        };
        let input = vec![0.1f32; 4 * h * w];
        save_preview_montage(&path, &input, 4, &maps, &maps, h, w).unwrap();

        let saved = image::open(&path).unwrap();
        assert_eq!(saved.width(), (w * 5) as u32);
        assert_eq!(saved.height(), (h * 2) as u32);
    }

    #[test]
    fn misshaped_maps_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let short = vec![0.0f32; 3];
        let full = vec![0.0f32; 16];
        let maps = MapSet {
            position: &short,
            cos: &full,
            sin: &full,
            width: &full,
        };
        let ok = MapSet {
            position: &full,
            cos: &full,
            sin: &full,
            width: &full,
        };
        let result = save_preview_montage(&dir.path().join("x.png"), &full, 1, &maps, &ok, 4, 4);
        assert!(result.is_err());
    }
}
