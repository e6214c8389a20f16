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

use ndarray::prelude::*;
use ndarray::IxDyn;
use serde::{Deserialize, Serialize};

/// Whether a forward pass is part of training (and will be followed by a
/// backward pass) or pure inference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Batch statistics are used for normalization. The moving statistics
    /// are only updated when `update_statistics` is set; a network that is
    /// frozen inside a larger model is run with `update_statistics: false`.
    Train { update_statistics: bool },
    Inference,
}

impl Phase {
    pub const TRAIN: Phase = Phase::Train {
        update_statistics: true,
    };
    pub const FROZEN: Phase = Phase::Train {
        update_statistics: false,
    };

    pub fn is_training(&self) -> bool {
        matches!(self, Phase::Train { .. })
    }
}

/// A named tensor with its gradient accumulator.
///
/// Non-trainable params hold state such as batch norm moving statistics:
/// they are checkpointed with the model but never touched by an optimizer.
#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub value: ArrayD<f32>,
    pub grad: ArrayD<f32>,
    pub trainable: bool,
}

impl Param {
    pub fn new(name: &str, value: ArrayD<f32>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Self {
            name: name.to_string(),
            value,
            grad,
            trainable: true,
        }
    }

    pub fn buffer(name: &str, value: ArrayD<f32>) -> Self {
        Self {
            trainable: false,
            ..Self::new(name, value)
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn to_named(&self) -> NamedTensor {
        NamedTensor {
            name: self.name.clone(),
            shape: self.value.shape().to_vec(),
            data: self.value.iter().map(|&v| v as f64).collect(),
        }
    }

    /// The contents of `tensor` as a replacement value for this param. The
    /// shapes must agree and the data must fill the shape exactly.
    pub fn checked_value(&self, tensor: &NamedTensor) -> Result<ArrayD<f32>> {
        if tensor.shape != self.value.shape() {
            return Err(Error::shape(&self.name, self.value.shape(), &tensor.shape));
        }
        tensor.to_array().map_err(|_| {
            Error::InvalidInput(format!(
                "{} holds {} values for shape {:?}",
                tensor.name,
                tensor.data.len(),
                tensor.shape
            ))
        })
    }
}

/// The serialized form of a `Param`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NamedTensor {
    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        Ok(ArrayD::from_shape_vec(
            IxDyn(&self.shape),
            self.data.iter().map(|&v| v as f32).collect(),
        )?)
    }
}

/// A differentiable layer operating on `(batch, channels, height, width)`
/// tensors.
pub trait Layer {
    fn name(&self) -> &str;

    /// Compute the layer output. In a training phase, the layer caches
    /// whatever it needs for the following `backward` call.
    fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>>;

    /// Accumulate parameter gradients for `grad_output` and return the
    /// gradient with respect to the input of the last training forward pass.
    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>>;

    /// Output `[channels, height, width]` for an input of the given shape.
    fn output_shape(&self, input: [usize; 3]) -> Result<[usize; 3]>;

    fn params(&self) -> Vec<&Param> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        Vec::new()
    }
}

pub(crate) fn check_grad_shape(layer: &str, expected: &[usize], grad: &Array4<f32>) -> Result<()> {
    if grad.shape() != expected {
        return Err(Error::shape(layer, expected, grad.shape()));
    }
    Ok(())
}
