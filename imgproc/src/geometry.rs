use crate::{BorderMode, Interpolation};
use image::{GrayImage, RgbImage};
use rayon::prelude::*;

fn map_coord(coord: isize, len: usize, mode: BorderMode) -> Option<usize> {
    let n = len as isize;
    if n <= 0 {
        return None;
    }
    match mode {
        BorderMode::Constant(_) => {
            if coord < 0 || coord >= n {
                None
            } else {
                Some(coord as usize)
            }
        }
        BorderMode::Replicate => Some(coord.clamp(0, n - 1) as usize),
    }
}

fn sample_channel(
    raw: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    c: usize,
    x: isize,
    y: isize,
    border: BorderMode,
) -> f32 {
    match (map_coord(x, width, border), map_coord(y, height, border)) {
        (Some(ix), Some(iy)) => raw[(iy * width + ix) * channels + c] as f32,
        _ => match border {
            BorderMode::Constant(v) => v as f32,
            BorderMode::Replicate => 0.0,
        },
    }
}

fn interpolate_channel(
    raw: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    c: usize,
    x: f32,
    y: f32,
    interpolation: Interpolation,
    border: BorderMode,
) -> f32 {
    match interpolation {
        Interpolation::Nearest => sample_channel(
            raw,
            width,
            height,
            channels,
            c,
            x.round() as isize,
            y.round() as isize,
            border,
        ),
        Interpolation::Linear => {
            let x0 = x.floor() as isize;
            let y0 = y.floor() as isize;
            let fx = x - x0 as f32;
            let fy = y - y0 as f32;

            let v00 = sample_channel(raw, width, height, channels, c, x0, y0, border);
            let v10 = sample_channel(raw, width, height, channels, c, x0 + 1, y0, border);
            let v01 = sample_channel(raw, width, height, channels, c, x0, y0 + 1, border);
            let v11 = sample_channel(raw, width, height, channels, c, x0 + 1, y0 + 1, border);

            let v0 = v00 * (1.0 - fx) + v10 * fx;
            let v1 = v01 * (1.0 - fx) + v11 * fx;
            v0 * (1.0 - fy) + v1 * fy
        }
    }
}

/// Remap a grayscale image through per-pixel source coordinate lookup tables.
///
/// `map_x`/`map_y` hold one source coordinate per output pixel; out-of-bounds
/// lookups resolve through the border mode.
pub fn remap(
    src: &GrayImage,
    map_x: &[f32],
    map_y: &[f32],
    width: u32,
    height: u32,
    interpolation: Interpolation,
    border: BorderMode,
) -> GrayImage {
    assert_eq!(
        map_x.len(),
        (width * height) as usize,
        "map_x size must equal width*height"
    );
    assert_eq!(
        map_y.len(),
        (width * height) as usize,
        "map_y size must equal width*height"
    );

    let sw = src.width() as usize;
    let sh = src.height() as usize;
    let raw = src.as_raw();
    let mut dst = GrayImage::new(width, height);

    dst.as_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width as usize {
                let idx = y * width as usize + x;
                let val = interpolate_channel(
                    raw,
                    sw,
                    sh,
                    1,
                    0,
                    map_x[idx],
                    map_y[idx],
                    interpolation,
                    border,
                );
                row[x] = val.clamp(0.0, 255.0) as u8;
            }
        });

    dst
}

/// Three-channel variant of [`remap`].
pub fn remap_rgb(
    src: &RgbImage,
    map_x: &[f32],
    map_y: &[f32],
    width: u32,
    height: u32,
    interpolation: Interpolation,
    border: BorderMode,
) -> RgbImage {
    assert_eq!(map_x.len(), (width * height) as usize);
    assert_eq!(map_y.len(), (width * height) as usize);

    let sw = src.width() as usize;
    let sh = src.height() as usize;
    let raw = src.as_raw();
    let mut dst = RgbImage::new(width, height);

    dst.as_mut()
        .par_chunks_mut(width as usize * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width as usize {
                let idx = y * width as usize + x;
                for c in 0..3 {
                    let val = interpolate_channel(
                        raw,
                        sw,
                        sh,
                        3,
                        c,
                        map_x[idx],
                        map_y[idx],
                        interpolation,
                        border,
                    );
                    row[x * 3 + c] = val.clamp(0.0, 255.0) as u8;
                }
            }
        });

    dst
}
