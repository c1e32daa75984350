use std::path::Path;

use anyhow::Context;
use image::{ImageBuffer, Rgb, RgbImage};

const GAP: usize = 2;

/// Writes mix, target and prediction spectrograms side by side as a PNG.
///
/// Each map is `(bins, frames)` row-major; low frequencies end up at the bottom.
pub fn save_preview_montage(
    save_path: &Path,
    mix: &[f32],
    target: &[f32],
    prediction: &[f32],
    bins: usize,
    frames: usize,
) -> anyhow::Result<()> {
    let pixels = bins * frames;
    if mix.len() != pixels || target.len() != pixels || prediction.len() != pixels {
        anyhow::bail!("Spectrogram maps have invalid shape for preview");
    }

    // Shared scale so the three panels are comparable.
    let scale = log_scale_bounds(mix);
    let panels = [
        spectrogram_to_rgb(mix, bins, frames, scale),
        spectrogram_to_rgb(target, bins, frames, scale),
        spectrogram_to_rgb(prediction, bins, frames, scale),
    ];

    let width = frames * panels.len() + GAP * (panels.len() - 1);
    let mut montage: RgbImage = ImageBuffer::new(width as u32, bins as u32);
    for (idx, panel) in panels.iter().enumerate() {
        blit(&mut montage, panel, idx * (frames + GAP), 0);
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

fn to_db(value: f32) -> f32 {
    20.0 * value.max(1e-6).log10()
}

/// 5th/99th percentile of the log-magnitude, robust against silent frames.
fn log_scale_bounds(map: &[f32]) -> (f32, f32) {
    let mut values: Vec<f32> = map
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .map(to_db)
        .collect();
    if values.is_empty() {
        return (-120.0, 0.0);
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let low_idx = ((values.len() as f32) * 0.05).floor() as usize;
    let high_idx = ((values.len() as f32) * 0.99).floor() as usize;
    (
        values[low_idx.min(values.len() - 1)],
        values[high_idx.min(values.len() - 1)],
    )
}

fn spectrogram_to_rgb(map: &[f32], bins: usize, frames: usize, bounds: (f32, f32)) -> RgbImage {
    let (vmin, vmax) = bounds;
    let range = (vmax - vmin).max(1e-6);
    let mut image: RgbImage = ImageBuffer::new(frames as u32, bins as u32);
    for bin in 0..bins {
        for frame in 0..frames {
            let value = map[bin * frames + frame];
            let norm = if value.is_finite() {
                ((to_db(value) - vmin) / range).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let y = (bins - 1 - bin) as u32;
            image.put_pixel(frame as u32, y, heat(norm));
        }
    }
    image
}

/// Black → red → yellow → white ramp.
fn heat(norm: f32) -> Rgb<u8> {
    let r = (norm * 3.0).clamp(0.0, 1.0);
    let g = (norm * 3.0 - 1.0).clamp(0.0, 1.0);
    let b = (norm * 3.0 - 2.0).clamp(0.0, 1.0);
    Rgb([
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8,
    ])
}

fn blit(dst: &mut RgbImage, src: &RgbImage, x_offset: usize, y_offset: usize) {
    for (x, y, pixel) in src.enumerate_pixels() {
        dst.put_pixel(x + x_offset as u32, y + y_offset as u32, *pixel);
    }
}
