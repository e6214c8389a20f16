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
use crate::layer::{Layer, NamedTensor, Param, Phase};

use ndarray::prelude::*;
use std::collections::HashMap;

/// A linear stack of layers.
///
/// Checkpointed tensors are named `<network>/<param>`, so the state of
/// several networks can live in one checkpoint.
pub struct Sequential {
    name: String,
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            layers: Vec::new(),
        }
    }

    pub fn add<L: Layer + 'static>(&mut self, layer: L) -> &mut Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>> {
        let mut x = input.clone();
        for layer in self.layers.iter_mut() {
            x = layer.forward(&x, phase)?;
            log::trace!("{}/{} -> {:?}", self.name, layer.name(), x.shape());
        }
        Ok(x)
    }

    /// Backpropagate through every layer, accumulating parameter gradients,
    /// and return the gradient with respect to the network input.
    pub fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
        let mut grad = grad_output.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }
        Ok(grad)
    }

    pub fn zero_grad(&mut self) {
        for p in self.params_mut() {
            p.zero_grad();
        }
    }

    pub fn params(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.params()).collect()
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }

    pub fn trainable_params_mut(&mut self) -> Vec<&mut Param> {
        self.params_mut().into_iter().filter(|p| p.trainable).collect()
    }

    /// (trainable, non-trainable) scalar counts.
    pub fn param_count(&self) -> (usize, usize) {
        self.params().iter().fold((0, 0), |(t, n), p| {
            if p.trainable {
                (t + p.len(), n)
            } else {
                (t, n + p.len())
            }
        })
    }

    pub fn output_shape(&self, input: [usize; 3]) -> Result<[usize; 3]> {
        self.layers
            .iter()
            .try_fold(input, |shape, layer| layer.output_shape(shape))
    }

    /// One line per layer: name, output shape and parameter count.
    pub fn summary(&self, input: [usize; 3]) -> Result<Vec<String>> {
        let mut shape = input;
        let mut lines = vec![format!("{} (input {:?})", self.name, input)];
        for layer in self.layers.iter() {
            shape = layer.output_shape(shape)?;
            let count: usize = layer.params().iter().map(|p| p.len()).sum();
            let shape_str = format!("{:?}", shape);
            lines.push(format!("  {:<24} {:>16} {:>10}", layer.name(), shape_str, count));
        }
        let (trainable, frozen) = self.param_count();
        lines.push(format!(
            "  trainable params: {}, non-trainable params: {}",
            trainable, frozen
        ));
        Ok(lines)
    }

    pub fn state(&self) -> Vec<NamedTensor> {
        self.params()
            .iter()
            .map(|p| {
                let mut t = p.to_named();
                t.name = format!("{}/{}", self.name, t.name);
                t
            })
            .collect()
    }

    /// Restore every param from `tensors`. Nothing is modified unless all
    /// params are present with matching shapes and data, and no tensor is
    /// left over.
    pub fn load_state(&mut self, tensors: &[NamedTensor]) -> Result<()> {
        let prefix = format!("{}/", self.name);
        let mut by_name = HashMap::new();
        for t in tensors {
            match t.name.strip_prefix(&prefix) {
                Some(name) => {
                    by_name.insert(name.to_string(), t);
                }
                None => return Err(Error::UnexpectedTensor(t.name.clone())),
            }
        }

        let mut values = HashMap::new();
        for p in self.params() {
            let t = by_name
                .get(&p.name)
                .ok_or_else(|| Error::MissingTensor(format!("{}{}", prefix, p.name)))?;
            values.insert(p.name.clone(), p.checked_value(t)?);
        }
        if let Some(extra) = by_name.keys().find(|k| !values.contains_key(*k)) {
            return Err(Error::UnexpectedTensor(format!("{}{}", prefix, extra)));
        }

        // every param has a validated value from here on
        for p in self.params_mut() {
            if let Some(value) = values.remove(&p.name) {
                p.value = value;
            }
        }
        Ok(())
    }
}
