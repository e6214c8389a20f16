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
use crate::layer::{check_grad_shape, Layer, Phase};

use ndarray::prelude::*;
use ndarray::Zip;

pub const DEFAULT_LEAKY_ALPHA: f32 = 0.3;

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Activations are elementwise, so they share the forward caching and the
/// backward plumbing; only the function and its derivative differ.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Activation {
    Relu,
    LeakyRelu { alpha: f32 },
    Sigmoid,
}

impl Activation {
    pub fn leaky_relu() -> Self {
        Activation::LeakyRelu {
            alpha: DEFAULT_LEAKY_ALPHA,
        }
    }

    fn apply(&self, x: f32) -> f32 {
        match *self {
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Sigmoid => sigmoid(x),
        }
    }

    /// Derivative, given the input `x` and the output `y` of the activation.
    fn derivative(&self, x: f32, y: f32) -> f32 {
        match *self {
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu { alpha } => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => y * (1.0 - y),
        }
    }
}

pub struct ActivationLayer {
    name: String,
    activation: Activation,
    /// (input, output) of the last training forward pass.
    cache: Option<(Array4<f32>, Array4<f32>)>,
}

impl ActivationLayer {
    pub fn new(name: &str, activation: Activation) -> Self {
        Self {
            name: name.to_string(),
            activation,
            cache: None,
        }
    }
}

impl Layer for ActivationLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>> {
        let activation = self.activation;
        let out = input.mapv(|x| activation.apply(x));
        self.cache = if phase.is_training() {
            Some((input.clone(), out.clone()))
        } else {
            None
        };
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
        let (input, output) = self
            .cache
            .as_ref()
            .ok_or_else(|| Error::NoForwardPass(self.name.clone()))?;
        check_grad_shape(&self.name, input.shape(), grad_output)?;
        let activation = self.activation;
        let mut grad_input = Array4::zeros(grad_output.raw_dim());
        Zip::from(&mut grad_input)
            .and(grad_output)
            .and(input)
            .and(output)
            .for_each(|gi, &go, &x, &y| *gi = go * activation.derivative(x, y));
        Ok(grad_input)
    }

    fn output_shape(&self, input: [usize; 3]) -> Result<[usize; 3]> {
        Ok(input)
    }
}
