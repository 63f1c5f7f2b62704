use image::{Rgb, RgbImage};
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::report::{FrameSnapshot, SoundEntry};

const CHANNEL_COLORS: &[Rgb<u8>] = &[
    Rgb([255, 0, 0]), // Channel 0 (Red)
    Rgb([0, 160, 0]), // Channel 1 (Green)
    Rgb([0, 0, 255]), // Channel 2 (Blue)
    Rgb([0, 0, 0]),   // Channel 3 (Black)
];
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const SOUND_COLOR: Rgb<u8> = Rgb([30, 60, 220]);

const WAVE_HEIGHT: u32 = 200;
const MAP_HEIGHT: u32 = 400;
const MIN_WIDTH: u32 = 400;
/// Pixels per unit of direction on the top-down map.
const MAP_SCALE: f32 = 150.0;

/// Renders the latest frame's waveforms (each shifted by its lag) above a
/// top-down map of the reported sounds, and saves it as an image.
pub fn render_snapshot(snapshot: &FrameSnapshot, sounds: &[SoundEntry], output_path: &Path) -> Result<()> {
    let frame = &snapshot.frame;
    let n = frame.samples_per_channel() as u32;
    let width = n.max(MIN_WIDTH);
    let height = WAVE_HEIGHT + MAP_HEIGHT;
    let mut imgbuf = RgbImage::from_pixel(width, height, BACKGROUND);

    // --- Waveforms, scaled to the frame's loudness ---
    let loudness = snapshot.loudness.max(1.0);
    let mid = (WAVE_HEIGHT / 2) as f32;
    for ch in 0..frame.channels() {
        let color = *CHANNEL_COLORS.get(ch).unwrap_or(&CHANNEL_COLORS[3]);
        let lag = snapshot.lags.get(ch).copied().unwrap_or(0) as i64;
        let mut previous: Option<(i64, i64)> = None;
        for (i, sample) in frame.channel(ch).enumerate() {
            let x = i as i64 - lag;
            let y = (mid - sample as f32 / (4.0 * loudness) * mid)
                .clamp(0.0, (WAVE_HEIGHT - 1) as f32) as i64;
            if let Some((px, py)) = previous {
                if px == x - 1 {
                    draw_vertical(&mut imgbuf, x, py.min(y), py.max(y), color);
                }
            }
            put(&mut imgbuf, x, y, color);
            previous = Some((x, y));
        }
    }

    // --- Top-down sound map ---
    let cx = (width / 2) as f32;
    let cy = (WAVE_HEIGHT + MAP_HEIGHT / 2) as f32;
    for (dx, dy) in [(0.0, -2.0), (2.0, 1.0), (-2.0, 1.0)] {
        draw_disc(&mut imgbuf, cx + dx, cy + dy, 2.0, Rgb([0, 0, 0]));
    }
    for sound in sounds {
        let x = cx + sound.location[0] * MAP_SCALE;
        let y = cy - sound.location[1] * MAP_SCALE;
        let radius = (sound.loudness / 200.0).clamp(2.0, 30.0);
        draw_disc(&mut imgbuf, x, y, radius, SOUND_COLOR);
    }

    imgbuf.save(output_path)?;
    debug!(path = %output_path.display(), "snapshot saved");
    Ok(())
}

fn put(imgbuf: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < imgbuf.width() && (y as u32) < imgbuf.height() {
        imgbuf.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_vertical(imgbuf: &mut RgbImage, x: i64, y0: i64, y1: i64, color: Rgb<u8>) {
    for y in y0..=y1 {
        put(imgbuf, x, y, color);
    }
}

fn draw_disc(imgbuf: &mut RgbImage, cx: f32, cy: f32, radius: f32, color: Rgb<u8>) {
    let r = radius.ceil() as i64;
    let (x0, y0) = (cx.round() as i64, cy.round() as i64);
    for dy in -r..=r {
        for dx in -r..=r {
            if ((dx * dx + dy * dy) as f32) <= radius * radius {
                put(imgbuf, x0 + dx, y0 + dy, color);
            }
        }
    }
}
