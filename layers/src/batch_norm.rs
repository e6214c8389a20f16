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
use crate::layer::{check_grad_shape, Layer, Param, Phase};

use ndarray::prelude::*;
use ndarray::IxDyn;

pub const DEFAULT_MOMENTUM: f32 = 0.99;
pub const DEFAULT_EPSILON: f32 = 1e-3;

struct BatchNormCache {
    x_hat: Array4<f32>,
    inv_std: Array1<f32>,
}

/// Per-channel batch normalization of `(N, C, H, W)` activations.
pub struct BatchNorm2d {
    name: String,
    channels: usize,
    momentum: f32,
    epsilon: f32,
    gamma: Param,
    beta: Param,
    moving_mean: Param,
    moving_variance: Param,
    cache: Option<BatchNormCache>,
}

impl BatchNorm2d {
    pub fn new(name: &str, channels: usize) -> Self {
        Self::with_momentum(name, channels, DEFAULT_MOMENTUM, DEFAULT_EPSILON)
    }

    pub fn with_momentum(name: &str, channels: usize, momentum: f32, epsilon: f32) -> Self {
        let param = |suffix: &str| format!("{}/{}", name, suffix);
        Self {
            name: name.to_string(),
            channels,
            momentum,
            epsilon,
            gamma: Param::new(&param("gamma"), ArrayD::ones(IxDyn(&[channels]))),
            beta: Param::new(&param("beta"), ArrayD::zeros(IxDyn(&[channels]))),
            moving_mean: Param::buffer(&param("moving_mean"), ArrayD::zeros(IxDyn(&[channels]))),
            moving_variance: Param::buffer(
                &param("moving_variance"),
                ArrayD::ones(IxDyn(&[channels])),
            ),
            cache: None,
        }
    }

    pub fn moving_mean(&self) -> ArrayViewD<'_, f32> {
        self.moving_mean.value.view()
    }

    pub fn moving_variance(&self) -> ArrayViewD<'_, f32> {
        self.moving_variance.value.view()
    }

    fn normalize(
        &self,
        input: &Array4<f32>,
        mean: &Array1<f32>,
        inv_std: &Array1<f32>,
    ) -> Result<(Array4<f32>, Array4<f32>)> {
        let gamma = self.gamma.value.view().into_dimensionality::<Ix1>()?;
        let beta = self.beta.value.view().into_dimensionality::<Ix1>()?;
        let mut x_hat = input.clone();
        let mut out = input.clone();
        for c in 0..self.channels {
            let (m, s) = (mean[c], inv_std[c]);
            x_hat
                .index_axis_mut(Axis(1), c)
                .mapv_inplace(|v| (v - m) * s);
            let (g, b) = (gamma[c], beta[c]);
            out.index_axis_mut(Axis(1), c)
                .assign(&x_hat.index_axis(Axis(1), c).mapv(|v| g * v + b));
        }
        Ok((x_hat, out))
    }
}

impl Layer for BatchNorm2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>> {
        let (n, c, h, w) = input.dim();
        if c != self.channels {
            return Err(Error::shape(&self.name, &[n, self.channels, h, w], input.shape()));
        }
        match phase {
            Phase::Inference => {
                let mean = self.moving_mean.value.view().into_dimensionality::<Ix1>()?.to_owned();
                let eps = self.epsilon;
                let inv_std = self
                    .moving_variance
                    .value
                    .view()
                    .into_dimensionality::<Ix1>()?
                    .mapv(|v| 1.0 / (v + eps).sqrt());
                self.cache = None;
                Ok(self.normalize(input, &mean, &inv_std)?.1)
            }
            Phase::Train { update_statistics } => {
                let count = n * h * w;
                if count == 0 {
                    return Err(Error::InvalidInput(format!(
                        "{}: empty batch in training phase",
                        self.name
                    )));
                }
                let mut mean = Array1::zeros(c);
                let mut variance = Array1::zeros(c);
                for ch in 0..c {
                    let plane = input.index_axis(Axis(1), ch);
                    let m = plane.sum() / count as f32;
                    mean[ch] = m;
                    variance[ch] = plane.fold(0f32, |acc, &v| acc + (v - m) * (v - m)) / count as f32;
                }
                let eps = self.epsilon;
                let inv_std = variance.mapv(|v: f32| 1.0 / (v + eps).sqrt());
                let (x_hat, out) = self.normalize(input, &mean, &inv_std)?;

                if update_statistics {
                    let momentum = self.momentum;
                    let correction = if count > 1 {
                        count as f32 / (count - 1) as f32
                    } else {
                        1.0
                    };
                    self.moving_mean
                        .value
                        .zip_mut_with(&mean.into_dyn(), |mm, &m| {
                            *mm = *mm * momentum + m * (1.0 - momentum)
                        });
                    self.moving_variance
                        .value
                        .zip_mut_with(&variance.into_dyn(), |mv, &v| {
                            *mv = *mv * momentum + v * correction * (1.0 - momentum)
                        });
                }
                self.cache = Some(BatchNormCache { x_hat, inv_std });
                Ok(out)
            }
        }
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| Error::NoForwardPass(self.name.clone()))?;
        check_grad_shape(&self.name, cache.x_hat.shape(), grad_output)?;
        let (n, _, h, w) = grad_output.dim();
        let count = (n * h * w) as f32;
        let gamma = self.gamma.value.view().into_dimensionality::<Ix1>()?.to_owned();

        let mut grad_input = Array4::zeros(grad_output.raw_dim());
        for c in 0..self.channels {
            let dy = grad_output.index_axis(Axis(1), c);
            let x_hat = cache.x_hat.index_axis(Axis(1), c);
            let sum_dy = dy.sum();
            let sum_dy_xhat = (&dy * &x_hat).sum();
            self.beta.grad[IxDyn(&[c])] += sum_dy;
            self.gamma.grad[IxDyn(&[c])] += sum_dy_xhat;

            // dx = gamma * inv_std / m * (m * dy - sum(dy) - x_hat * sum(dy * x_hat))
            let scale = gamma[c] * cache.inv_std[c] / count;
            let dx = (&dy * count - &x_hat * sum_dy_xhat - sum_dy) * scale;
            grad_input.index_axis_mut(Axis(1), c).assign(&dx);
        }
        Ok(grad_input)
    }

    fn output_shape(&self, input: [usize; 3]) -> Result<[usize; 3]> {
        if input[0] != self.channels {
            return Err(Error::shape(&self.name, &[self.channels], &input[..1]));
        }
        Ok(input)
    }

    fn params(&self) -> Vec<&Param> {
        vec![
            &self.gamma,
            &self.beta,
            &self.moving_mean,
            &self.moving_variance,
        ]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![
            &mut self.gamma,
            &mut self.beta,
            &mut self.moving_mean,
            &mut self.moving_variance,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{check_gradients, random_input};
    use float_cmp::approx_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn training_output_is_normalized() -> Result<()> {
        let mut rng = Pcg64::seed_from_u64(5);
        let input = random_input((4, 3, 3, 3), &mut rng) * 5.0 + 2.0;
        let mut bn = BatchNorm2d::new("bn", 3);
        let out = bn.forward(&input, Phase::TRAIN)?;
        for c in 0..3 {
            let plane = out.index_axis(Axis(1), c);
            let mean = plane.mean().unwrap_or(f32::NAN);
            let var = plane.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(f32::NAN);
            assert!(mean.abs() < 1e-4, "channel {} mean {}", c, mean);
            // epsilon keeps the variance slightly below one
            assert!((var - 1.0).abs() < 1e-2, "channel {} variance {}", c, var);
        }
        Ok(())
    }

    #[test]
    fn moving_statistics_follow_momentum() -> Result<()> {
        let input = Array4::from_shape_fn((2, 1, 1, 2), |(b, _, _, x)| (b * 2 + x) as f32);
        // batch mean 1.5, biased variance 1.25, unbiased 5/3
        let mut bn = BatchNorm2d::new("bn", 1);
        bn.forward(&input, Phase::TRAIN)?;
        assert!(approx_eq!(f32, bn.moving_mean()[IxDyn(&[0])], 0.015, epsilon = 1e-6));
        assert!(approx_eq!(
            f32,
            bn.moving_variance()[IxDyn(&[0])],
            0.99 + 0.01 * 5.0 / 3.0,
            epsilon = 1e-6
        ));
        Ok(())
    }

    #[test]
    fn frozen_training_keeps_statistics() -> Result<()> {
        let mut rng = Pcg64::seed_from_u64(6);
        let input = random_input((3, 2, 2, 2), &mut rng) + 3.0;
        let mut bn = BatchNorm2d::new("bn", 2);
        bn.forward(&input, Phase::FROZEN)?;
        assert!(bn.moving_mean().iter().all(|&v| v == 0.0));
        assert!(bn.moving_variance().iter().all(|&v| v == 1.0));
        Ok(())
    }

    #[test]
    fn inference_uses_moving_statistics() -> Result<()> {
        let mut bn = BatchNorm2d::new("bn", 1);
        let input = Array4::from_elem((1, 1, 2, 2), 2.0f32);
        let out = bn.forward(&input, Phase::Inference)?;
        let expected = 2.0 / (1.0f32 + DEFAULT_EPSILON).sqrt();
        assert!(out.iter().all(|&v| approx_eq!(f32, v, expected, ulps = 4)));
        Ok(())
    }

    #[test]
    fn gradients() {
        let mut rng = Pcg64::seed_from_u64(8);
        let mut bn = BatchNorm2d::new("bn", 2);
        // make gamma and beta non-trivial
        bn.gamma.value = arr1(&[1.5f32, -0.7]).into_dyn();
        bn.beta.value = arr1(&[0.2f32, 0.1]).into_dyn();
        let input = random_input((3, 2, 2, 2), &mut rng);
        check_gradients(&mut bn, &input, 2e-2);
    }
}
