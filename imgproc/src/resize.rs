use image::{GrayImage, RgbImage};
use rayon::prelude::*;

/// Bilinear downscale/upscale of a grayscale image.
pub fn resize_linear(src: &GrayImage, width: u32, height: u32) -> GrayImage {
    if width == 0 || height == 0 {
        return GrayImage::new(0, 0);
    }

    let mut dst = GrayImage::new(width, height);
    let src_width = src.width() as f32 - 1.0;
    let src_height = src.height() as f32 - 1.0;
    let dst_width = (width.max(2) - 1) as f32;
    let dst_height = (height.max(2) - 1) as f32;

    if src_width <= 0.0 || src_height <= 0.0 {
        return dst;
    }

    dst.as_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as u32;
            for x in 0..width {
                let fx = (x as f32 / dst_width) * src_width;
                let fy = (y as f32 / dst_height) * src_height;

                let x0 = fx as u32;
                let y0 = fy as u32;
                let x1 = (x0 + 1).min(src.width() - 1);
                let y1 = (y0 + 1).min(src.height() - 1);

                let dx = fx - x0 as f32;
                let dy = fy - y0 as f32;

                let v00 = src.get_pixel(x0, y0)[0] as f32;
                let v10 = src.get_pixel(x1, y0)[0] as f32;
                let v01 = src.get_pixel(x0, y1)[0] as f32;
                let v11 = src.get_pixel(x1, y1)[0] as f32;

                let v0 = v00 * (1.0 - dx) + v10 * dx;
                let v1 = v01 * (1.0 - dx) + v11 * dx;
                let v = v0 * (1.0 - dy) + v1 * dy;

                row[x as usize] = v.clamp(0.0, 255.0) as u8;
            }
        });

    dst
}

/// Bilinear resize of a three-channel image.
pub fn resize_linear_rgb(src: &RgbImage, width: u32, height: u32) -> RgbImage {
    if width == 0 || height == 0 {
        return RgbImage::new(0, 0);
    }

    let mut dst = RgbImage::new(width, height);
    let src_width = src.width() as f32 - 1.0;
    let src_height = src.height() as f32 - 1.0;
    let dst_width = (width.max(2) - 1) as f32;
    let dst_height = (height.max(2) - 1) as f32;

    if src_width <= 0.0 || src_height <= 0.0 {
        return dst;
    }

    dst.as_mut()
        .par_chunks_mut(width as usize * 3)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as u32;
            for x in 0..width {
                let fx = (x as f32 / dst_width) * src_width;
                let fy = (y as f32 / dst_height) * src_height;

                let x0 = fx as u32;
                let y0 = fy as u32;
                let x1 = (x0 + 1).min(src.width() - 1);
                let y1 = (y0 + 1).min(src.height() - 1);

                let dx = fx - x0 as f32;
                let dy = fy - y0 as f32;

                let p00 = src.get_pixel(x0, y0);
                let p10 = src.get_pixel(x1, y0);
                let p01 = src.get_pixel(x0, y1);
                let p11 = src.get_pixel(x1, y1);

                for c in 0..3 {
                    let v0 = p00[c] as f32 * (1.0 - dx) + p10[c] as f32 * dx;
                    let v1 = p01[c] as f32 * (1.0 - dx) + p11[c] as f32 * dx;
                    let v = v0 * (1.0 - dy) + v1 * dy;
                    row[x as usize * 3 + c] = v.clamp(0.0, 255.0) as u8;
                }
            }
        });

    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn downscale_halves_dimensions() {
        let mut src = GrayImage::new(64, 48);
        for y in 0..48 {
            for x in 0..64 {
                src.put_pixel(x, y, Luma([((x + y) % 256) as u8]));
            }
        }
        let out = resize_linear(&src, 32, 24);
        assert_eq!(out.dimensions(), (32, 24));
    }

    #[test]
    fn resize_of_flat_image_stays_flat() {
        let src = GrayImage::from_pixel(40, 30, Luma([99]));
        let out = resize_linear(&src, 20, 15);
        assert!(out.as_raw().iter().all(|&v| v == 99));
    }
}
