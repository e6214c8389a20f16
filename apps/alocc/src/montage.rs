// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tiling reconstructions into a single grayscale image.

use anyhow::{bail, Context, Result};
use image::{GrayImage, Luma};
use ndarray::prelude::*;
use std::path::Path;

/// `(rows, cols)` of a grid holding `n` images, as square as possible.
pub fn grid_size(n: usize) -> (usize, usize) {
    if n == 0 {
        return (0, 0);
    }
    let rows = (n as f64).sqrt().ceil() as usize;
    (rows, (n + rows - 1) / rows)
}

/// Tile the first channel of `images` row-major into a `rows x cols` grid.
/// Cells beyond the last image stay black; images beyond the grid are
/// dropped.
pub fn montage(images: ArrayView4<f32>, rows: usize, cols: usize) -> Array2<f32> {
    let (h, w) = (images.len_of(Axis(2)), images.len_of(Axis(3)));
    let mut grid = Array2::zeros((rows * h, cols * w));
    for (i, image) in images.outer_iter().take(rows * cols).enumerate() {
        let (r, c) = (i / cols, i % cols);
        grid.slice_mut(s![r * h..(r + 1) * h, c * w..(c + 1) * w])
            .assign(&image.index_axis(Axis(0), 0));
    }
    grid
}

/// Write `image` as an 8-bit grayscale image, mapping `[0, 1]` to
/// `0..=255`. The format follows the file extension, e.g. `.png`.
pub fn save_image(path: &Path, image: &Array2<f32>) -> Result<()> {
    let (h, w) = image.dim();
    if h == 0 || w == 0 {
        bail!("refusing to write an empty image to {}", path.display());
    }
    let mut img = GrayImage::new(w as u32, h as u32);
    for ((y, x), &v) in image.indexed_iter() {
        let intensity = (v.max(0.0).min(1.0) * 255.0).round() as u8;
        img.put_pixel(x as u32, y as u32, Luma([intensity]));
    }
    img.save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_holds_every_image() {
        assert_eq!(grid_size(0), (0, 0));
        assert_eq!(grid_size(1), (1, 1));
        assert_eq!(grid_size(3), (2, 2));
        assert_eq!(grid_size(128), (12, 11));
        for n in 1..200 {
            let (rows, cols) = grid_size(n);
            assert!(rows * cols >= n, "{} images in {}x{}", n, rows, cols);
        }
    }

    #[test]
    fn tiles_row_major() {
        let images = Array4::from_shape_fn((3, 1, 2, 2), |(b, _, _, _)| b as f32 + 1.0);
        let grid = montage(images.view(), 2, 2);
        assert_eq!(grid.dim(), (4, 4));
        assert_eq!(grid[[0, 0]], 1.0);
        assert_eq!(grid[[1, 3]], 2.0);
        assert_eq!(grid[[3, 1]], 3.0);
        assert_eq!(grid[[3, 3]], 0.0);
    }

    #[test]
    fn writes_grayscale_png() -> Result<()> {
        let path = std::env::temp_dir().join(format!("alocc-montage-{}.png", std::process::id()));
        let pixels = arr2(&[[0.0f32, 0.5, 1.0], [1.5, -1.0, 0.25]]);
        save_image(&path, &pixels)?;
        let loaded = image::open(&path)?.to_luma8();
        assert_eq!(loaded.dimensions(), (3, 2));
        assert_eq!(loaded.into_raw(), vec![0u8, 128, 255, 255, 0, 64]);
        std::fs::remove_file(&path)?;
        assert!(save_image(&path, &Array2::zeros((0, 3))).is_err());
        Ok(())
    }
}
