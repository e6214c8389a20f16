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

//! 2D convolution, implemented as im2col followed by a matrix product.

use crate::error::{Error, Result};
use crate::init::glorot_uniform;
use crate::layer::{check_grad_shape, Layer, Param, Phase};

use ndarray::prelude::*;
use ndarray::IxDyn;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Padding {
    /// Output size is `ceil(input / stride)`; padding is split with the
    /// smaller half before the input (TensorFlow convention).
    Same,
    Valid,
}

/// Output size and leading padding along one spatial axis.
pub fn output_size(
    input: usize,
    kernel_size: usize,
    stride: usize,
    padding: Padding,
) -> Result<(usize, usize)> {
    if stride == 0 || kernel_size == 0 {
        return Err(Error::InvalidInput(format!(
            "kernel size {} and stride {} must be positive",
            kernel_size, stride
        )));
    }
    match padding {
        Padding::Same => {
            let out = (input + stride - 1) / stride;
            let total = ((out.max(1) - 1) * stride + kernel_size).saturating_sub(input);
            Ok((out, total / 2))
        }
        Padding::Valid => {
            if input < kernel_size {
                return Err(Error::InvalidInput(format!(
                    "input size {} is smaller than kernel size {}",
                    input, kernel_size
                )));
            }
            Ok(((input - kernel_size) / stride + 1, 0))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Geometry {
    kernel_size: usize,
    stride: usize,
    out_h: usize,
    out_w: usize,
    pad_top: usize,
    pad_left: usize,
}

impl Geometry {
    fn new(h: usize, w: usize, kernel_size: usize, stride: usize, padding: Padding) -> Result<Self> {
        let (out_h, pad_top) = output_size(h, kernel_size, stride, padding)?;
        let (out_w, pad_left) = output_size(w, kernel_size, stride, padding)?;
        Ok(Self {
            kernel_size,
            stride,
            out_h,
            out_w,
            pad_top,
            pad_left,
        })
    }

    /// Input coordinate read by output row `o` at kernel offset `k`, if it
    /// falls inside the (unpadded) input.
    #[inline]
    fn source(&self, o: usize, k: usize, pad: usize, limit: usize) -> Option<usize> {
        (o * self.stride + k).checked_sub(pad).filter(|&i| i < limit)
    }
}

/// Unfold `input` into a `(n * out_h * out_w, c * k * k)` matrix; column
/// `ci * k * k + ky * k + kx` holds the pixel under kernel tap `(ky, kx)`.
fn im2col(input: &Array4<f32>, g: &Geometry) -> Result<Array2<f32>> {
    let (n, c, h, w) = input.dim();
    let k = g.kernel_size;
    let src = input.as_standard_layout();
    let src = src
        .as_slice()
        .ok_or_else(|| Error::InvalidInput("non-contiguous conv input".to_string()))?;
    let cols_per_row = c * k * k;
    let mut cols = vec![0f32; n * g.out_h * g.out_w * cols_per_row];
    for b in 0..n {
        for oy in 0..g.out_h {
            for ox in 0..g.out_w {
                let row = ((b * g.out_h + oy) * g.out_w + ox) * cols_per_row;
                for ci in 0..c {
                    let plane = (b * c + ci) * h * w;
                    for ky in 0..k {
                        let y = match g.source(oy, ky, g.pad_top, h) {
                            Some(y) => y,
                            None => continue,
                        };
                        for kx in 0..k {
                            if let Some(x) = g.source(ox, kx, g.pad_left, w) {
                                cols[row + (ci * k + ky) * k + kx] = src[plane + y * w + x];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(Array2::from_shape_vec((n * g.out_h * g.out_w, cols_per_row), cols)?)
}

/// Inverse of `im2col`: scatter-add the columns back onto the input grid.
fn col2im(cols: &Array2<f32>, dim: (usize, usize, usize, usize), g: &Geometry) -> Result<Array4<f32>> {
    let (n, c, h, w) = dim;
    let k = g.kernel_size;
    let cols = cols.as_standard_layout();
    let src = cols
        .as_slice()
        .ok_or_else(|| Error::InvalidInput("non-contiguous conv gradient".to_string()))?;
    let cols_per_row = c * k * k;
    let mut out = vec![0f32; n * c * h * w];
    for b in 0..n {
        for oy in 0..g.out_h {
            for ox in 0..g.out_w {
                let row = ((b * g.out_h + oy) * g.out_w + ox) * cols_per_row;
                for ci in 0..c {
                    let plane = (b * c + ci) * h * w;
                    for ky in 0..k {
                        let y = match g.source(oy, ky, g.pad_top, h) {
                            Some(y) => y,
                            None => continue,
                        };
                        for kx in 0..k {
                            if let Some(x) = g.source(ox, kx, g.pad_left, w) {
                                out[plane + y * w + x] += src[row + (ci * k + ky) * k + kx];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(Array4::from_shape_vec((n, c, h, w), out)?)
}

struct ConvCache {
    cols: Array2<f32>,
    input_dim: (usize, usize, usize, usize),
    geometry: Geometry,
}

pub struct Conv2d {
    name: String,
    in_channels: usize,
    filters: usize,
    kernel_size: usize,
    stride: usize,
    padding: Padding,
    /// `(in_channels * k * k, filters)`, matching the im2col column order.
    kernel: Param,
    bias: Param,
    cache: Option<ConvCache>,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: Padding,
        rng: &mut R,
    ) -> Self {
        let taps = kernel_size * kernel_size;
        let kernel = glorot_uniform(
            &[in_channels * taps, filters],
            in_channels * taps,
            filters * taps,
            rng,
        );
        Self {
            name: name.to_string(),
            in_channels,
            filters,
            kernel_size,
            stride,
            padding,
            kernel: Param::new(&format!("{}/kernel", name), kernel),
            bias: Param::new(&format!("{}/bias", name), ArrayD::zeros(IxDyn(&[filters]))),
            cache: None,
        }
    }
}

impl Layer for Conv2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>> {
        let (n, c, h, w) = input.dim();
        if c != self.in_channels {
            return Err(Error::shape(
                &self.name,
                &[n, self.in_channels, h, w],
                input.shape(),
            ));
        }
        let geometry = Geometry::new(h, w, self.kernel_size, self.stride, self.padding)?;
        let cols = im2col(input, &geometry)?;
        let kernel = self.kernel.value.view().into_dimensionality::<Ix2>()?;
        let bias = self.bias.value.view().into_dimensionality::<Ix1>()?;
        let out = cols.dot(&kernel) + &bias;
        let out = out
            .into_shape((n, geometry.out_h, geometry.out_w, self.filters))?
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned();

        self.cache = if phase.is_training() {
            Some(ConvCache {
                cols,
                input_dim: (n, c, h, w),
                geometry,
            })
        } else {
            None
        };
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| Error::NoForwardPass(self.name.clone()))?;
        let g = &cache.geometry;
        let n = cache.input_dim.0;
        check_grad_shape(&self.name, &[n, self.filters, g.out_h, g.out_w], grad_output)?;

        let grad = grad_output
            .view()
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape((n * g.out_h * g.out_w, self.filters))?;

        let kernel_grad = cache.cols.t().dot(&grad);
        self.kernel.grad += &kernel_grad.into_dyn();
        self.bias.grad += &grad.sum_axis(Axis(0)).into_dyn();

        let kernel = self.kernel.value.view().into_dimensionality::<Ix2>()?;
        let grad_cols = grad.dot(&kernel.t());
        col2im(&grad_cols, cache.input_dim, g)
    }

    fn output_shape(&self, input: [usize; 3]) -> Result<[usize; 3]> {
        let [c, h, w] = input;
        if c != self.in_channels {
            return Err(Error::shape(&self.name, &[self.in_channels], &[c]));
        }
        let g = Geometry::new(h, w, self.kernel_size, self.stride, self.padding)?;
        Ok([self.filters, g.out_h, g.out_w])
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.kernel, &self.bias]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.kernel, &mut self.bias]
    }
}
