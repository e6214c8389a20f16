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

use crate::error::{Error, Result};
use crate::init::glorot_uniform;
use crate::layer::{check_grad_shape, Layer, Param, Phase};

use ndarray::prelude::*;
use ndarray::IxDyn;
use rand::Rng;

/// `(N, C, H, W)` -> `(N, C * H * W, 1, 1)`.
pub struct Flatten {
    name: String,
    input_dim: Option<(usize, usize, usize, usize)>,
}

impl Flatten {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            input_dim: None,
        }
    }
}

impl Layer for Flatten {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>> {
        let (n, c, h, w) = input.dim();
        self.input_dim = if phase.is_training() {
            Some((n, c, h, w))
        } else {
            None
        };
        Ok(input
            .as_standard_layout()
            .into_owned()
            .into_shape((n, c * h * w, 1, 1))?)
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
        let dim = self
            .input_dim
            .ok_or_else(|| Error::NoForwardPass(self.name.clone()))?;
        let (n, c, h, w) = dim;
        check_grad_shape(&self.name, &[n, c * h * w, 1, 1], grad_output)?;
        Ok(grad_output
            .as_standard_layout()
            .into_owned()
            .into_shape(dim)?)
    }

    fn output_shape(&self, input: [usize; 3]) -> Result<[usize; 3]> {
        Ok([input.iter().product(), 1, 1])
    }
}

/// Fully connected layer on flattened `(N, in_features, 1, 1)` input.
pub struct Dense {
    name: String,
    in_features: usize,
    units: usize,
    kernel: Param,
    bias: Param,
    input: Option<Array2<f32>>,
}

impl Dense {
    pub fn new<R: Rng + ?Sized>(name: &str, in_features: usize, units: usize, rng: &mut R) -> Self {
        Self {
            name: name.to_string(),
            in_features,
            units,
            kernel: Param::new(
                &format!("{}/kernel", name),
                glorot_uniform(&[in_features, units], in_features, units, rng),
            ),
            bias: Param::new(&format!("{}/bias", name), ArrayD::zeros(IxDyn(&[units]))),
            input: None,
        }
    }
}

impl Layer for Dense {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>> {
        let n = input.len_of(Axis(0));
        if input.len() != n * self.in_features {
            return Err(Error::shape(
                &self.name,
                &[n, self.in_features, 1, 1],
                input.shape(),
            ));
        }
        let x = input
            .as_standard_layout()
            .into_owned()
            .into_shape((n, self.in_features))?;
        let kernel = self.kernel.value.view().into_dimensionality::<Ix2>()?;
        let bias = self.bias.value.view().into_dimensionality::<Ix1>()?;
        let out = x.dot(&kernel) + &bias;
        self.input = if phase.is_training() { Some(x) } else { None };
        Ok(out.into_shape((n, self.units, 1, 1))?)
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
        let x = self
            .input
            .as_ref()
            .ok_or_else(|| Error::NoForwardPass(self.name.clone()))?;
        let n = x.nrows();
        check_grad_shape(&self.name, &[n, self.units, 1, 1], grad_output)?;
        let grad = grad_output
            .as_standard_layout()
            .into_owned()
            .into_shape((n, self.units))?;
        self.kernel.grad += &x.t().dot(&grad).into_dyn();
        self.bias.grad += &grad.sum_axis(Axis(0)).into_dyn();
        let kernel = self.kernel.value.view().into_dimensionality::<Ix2>()?;
        Ok(grad.dot(&kernel.t()).into_shape((n, self.in_features, 1, 1))?)
    }

    fn output_shape(&self, input: [usize; 3]) -> Result<[usize; 3]> {
        let features: usize = input.iter().product();
        if features != self.in_features {
            return Err(Error::shape(&self.name, &[self.in_features], &[features]));
        }
        Ok([self.units, 1, 1])
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.kernel, &self.bias]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.kernel, &mut self.bias]
    }
}
