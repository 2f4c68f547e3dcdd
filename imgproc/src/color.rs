//! Conversions from the raw interleaved RGBA camera texture into per-eye
//! matcher input, plus the left-extension copy that gives the disparity
//! search room at the image boundary.

use image::{GrayImage, RgbImage};
use rayon::prelude::*;

/// Pixel rectangle inside the raw camera texture.
#[derive(Debug, Clone, Copy)]
pub struct EyeRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// BT.601 luma of an RGBA pixel.
#[inline]
fn luma(r: u8, g: u8, b: u8) -> u8 {
    let v = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    v.clamp(0.0, 255.0) as u8
}

/// Extract one eye's region of an RGBA texture as grayscale.
pub fn rgba_region_to_gray(rgba: &[u8], stride_px: u32, rect: EyeRect) -> GrayImage {
    let mut out = GrayImage::new(rect.width, rect.height);
    out.as_mut()
        .par_chunks_mut(rect.width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = ((rect.y as usize + y) * stride_px as usize + rect.x as usize) * 4;
            for x in 0..rect.width as usize {
                let p = src_row + x * 4;
                row[x] = luma(rgba[p], rgba[p + 1], rgba[p + 2]);
            }
        });
    out
}

/// Extract one eye's region, reading grayscale from the alpha plane.
pub fn rgba_region_alpha_to_gray(rgba: &[u8], stride_px: u32, rect: EyeRect) -> GrayImage {
    let mut out = GrayImage::new(rect.width, rect.height);
    out.as_mut()
        .par_chunks_mut(rect.width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = ((rect.y as usize + y) * stride_px as usize + rect.x as usize) * 4;
            for x in 0..rect.width as usize {
                row[x] = rgba[src_row + x * 4 + 3];
            }
        });
    out
}

/// Extract one eye's region as RGB for triple-channel matching.
pub fn rgba_region_to_rgb(rgba: &[u8], stride_px: u32, rect: EyeRect) -> RgbImage {
    let mut out = RgbImage::new(rect.width, rect.height);
    out.as_mut()
        .par_chunks_mut(rect.width as usize * 3)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = ((rect.y as usize + y) * stride_px as usize + rect.x as usize) * 4;
            for x in 0..rect.width as usize {
                let p = src_row + x * 4;
                row[x * 3] = rgba[p];
                row[x * 3 + 1] = rgba[p + 1];
                row[x * 3 + 2] = rgba[p + 2];
            }
        });
    out
}

/// Copy `src` into a wider image with `margin` zeroed columns on the left.
pub fn extend_left(src: &GrayImage, margin: u32) -> GrayImage {
    let width = src.width() + margin;
    let mut dst = GrayImage::new(width, src.height());
    let src_raw = src.as_raw();
    dst.as_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = y * src.width() as usize;
            row[margin as usize..]
                .copy_from_slice(&src_raw[src_row..src_row + src.width() as usize]);
        });
    dst
}

/// Three-channel variant of [`extend_left`].
pub fn extend_left_rgb(src: &RgbImage, margin: u32) -> RgbImage {
    let width = src.width() + margin;
    let mut dst = RgbImage::new(width, src.height());
    let src_raw = src.as_raw();
    let src_row_len = src.width() as usize * 3;
    dst.as_mut()
        .par_chunks_mut(width as usize * 3)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = y * src_row_len;
            row[margin as usize * 3..].copy_from_slice(&src_raw[src_row..src_row + src_row_len]);
        });
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba_texture(width: u32, height: u32) -> Vec<u8> {
        let mut buf = vec![0u8; (width * height * 4) as usize];
        for y in 0..height {
            for x in 0..width {
                let p = ((y * width + x) * 4) as usize;
                buf[p] = (x % 256) as u8;
                buf[p + 1] = (y % 256) as u8;
                buf[p + 2] = 32;
                buf[p + 3] = ((x + y) % 256) as u8;
            }
        }
        buf
    }

    #[test]
    fn gray_extraction_respects_region() {
        let tex = rgba_texture(16, 8);
        let rect = EyeRect {
            x: 8,
            y: 0,
            width: 8,
            height: 8,
        };
        let gray = rgba_region_to_gray(&tex, 16, rect);
        assert_eq!(gray.dimensions(), (8, 8));
        // First pixel of the region is texture pixel (8, 0).
        let expected = luma(8, 0, 32);
        assert_eq!(gray.get_pixel(0, 0)[0], expected);
    }

    #[test]
    fn alpha_extraction_reads_alpha_plane() {
        let tex = rgba_texture(8, 8);
        let rect = EyeRect {
            x: 0,
            y: 0,
            width: 8,
            height: 8,
        };
        let gray = rgba_region_alpha_to_gray(&tex, 8, rect);
        assert_eq!(gray.get_pixel(3, 2)[0], 5);
    }

    #[test]
    fn extend_left_pads_with_zeroes() {
        let src = GrayImage::from_pixel(4, 2, image::Luma([200]));
        let out = extend_left(&src, 3);
        assert_eq!(out.dimensions(), (7, 2));
        for y in 0..2 {
            for x in 0..3 {
                assert_eq!(out.get_pixel(x, y)[0], 0);
            }
            for x in 3..7 {
                assert_eq!(out.get_pixel(x, y)[0], 200);
            }
        }
    }
}
