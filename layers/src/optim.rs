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
use crate::layer::Param;

use itertools::Itertools;
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RmsPropConfig {
    pub learning_rate: f32,
    pub rho: f32,
    pub epsilon: f32,
    /// Gradients are clipped elementwise to `[-clip_value, clip_value]`.
    pub clip_value: Option<f32>,
    /// Inverse-time learning rate decay per step.
    pub decay: f32,
}

impl Default for RmsPropConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.002,
            rho: 0.9,
            epsilon: 1e-7,
            clip_value: Some(1.0),
            decay: 1e-8,
        }
    }
}

pub struct RmsProp {
    config: RmsPropConfig,
    iterations: u64,
    accumulators: Vec<ArrayD<f32>>,
}

impl RmsProp {
    pub fn new(config: RmsPropConfig) -> Self {
        Self {
            config,
            iterations: 0,
            accumulators: Vec::new(),
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Learning rate used by the next step.
    pub fn learning_rate(&self) -> f32 {
        self.config.learning_rate / (1.0 + self.config.decay * self.iterations as f32)
    }

    /// Apply one update to the trainable `params`, which must be passed in
    /// the same order on every call.
    pub fn step(&mut self, params: Vec<&mut Param>) -> Result<()> {
        let mut params = params.into_iter().filter(|p| p.trainable).collect::<Vec<_>>();
        if self.accumulators.is_empty() {
            self.accumulators = params
                .iter()
                .map(|p| ArrayD::zeros(p.value.raw_dim()))
                .collect();
        }
        if self.accumulators.len() != params.len() {
            return Err(Error::InvalidInput(format!(
                "optimizer tracks {} params, got {}",
                self.accumulators.len(),
                params.len()
            )));
        }

        let lr = self.learning_rate();
        let RmsPropConfig {
            rho,
            epsilon,
            clip_value,
            ..
        } = self.config;
        for (p, acc) in params.iter_mut().zip_eq(self.accumulators.iter_mut()) {
            if p.value.shape() != acc.shape() {
                return Err(Error::shape(&p.name, acc.shape(), p.value.shape()));
            }
            let Param { value, grad, .. } = &mut **p;
            Zip::from(value)
                .and(acc)
                .and(&*grad)
                .for_each(|v, a, &g| {
                    let g = match clip_value {
                        Some(clip) => g.max(-clip).min(clip),
                        None => g,
                    };
                    *a = rho * *a + (1.0 - rho) * g * g;
                    *v -= lr * g / (a.sqrt() + epsilon);
                });
        }
        self.iterations += 1;
        Ok(())
    }
}
