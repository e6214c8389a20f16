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

/// Nearest-neighbour upsampling by an integer factor along both spatial axes.
pub struct UpSampling2d {
    name: String,
    factor: usize,
    input_dim: Option<(usize, usize, usize, usize)>,
}

impl UpSampling2d {
    pub fn new(name: &str, factor: usize) -> Self {
        Self {
            name: name.to_string(),
            factor,
            input_dim: None,
        }
    }
}

impl Layer for UpSampling2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>> {
        let (n, c, h, w) = input.dim();
        let f = self.factor;
        if f == 0 {
            return Err(Error::InvalidInput(format!("{}: zero factor", self.name)));
        }
        self.input_dim = if phase.is_training() {
            Some((n, c, h, w))
        } else {
            None
        };
        Ok(Array4::from_shape_fn((n, c, h * f, w * f), |(b, ch, y, x)| {
            input[[b, ch, y / f, x / f]]
        }))
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, c, h, w) = self
            .input_dim
            .ok_or_else(|| Error::NoForwardPass(self.name.clone()))?;
        let f = self.factor;
        check_grad_shape(&self.name, &[n, c, h * f, w * f], grad_output)?;
        Ok(Array4::from_shape_fn((n, c, h, w), |(b, ch, y, x)| {
            grad_output
                .slice(s![b, ch, y * f..(y + 1) * f, x * f..(x + 1) * f])
                .sum()
        }))
    }

    fn output_shape(&self, input: [usize; 3]) -> Result<[usize; 3]> {
        let [c, h, w] = input;
        Ok([c, h * self.factor, w * self.factor])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{check_gradients, random_input};
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn repeats_pixels() -> Result<()> {
        let mut up = UpSampling2d::new("up", 2);
        let input = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0f32, 2.0, 3.0, 4.0])?;
        let out = up.forward(&input, Phase::Inference)?;
        assert_eq!(out.shape(), &[1, 1, 4, 4]);
        assert_eq!(
            out.slice(s![0, 0, .., ..]),
            arr2(&[
                [1.0f32, 1.0, 2.0, 2.0],
                [1.0, 1.0, 2.0, 2.0],
                [3.0, 3.0, 4.0, 4.0],
                [3.0, 3.0, 4.0, 4.0]
            ])
        );
        Ok(())
    }

    #[test]
    fn backward_sums_blocks() -> Result<()> {
        let mut up = UpSampling2d::new("up", 2);
        up.forward(&Array4::zeros((1, 1, 1, 2)), Phase::TRAIN)?;
        let grad = up.backward(&Array4::ones((1, 1, 2, 4)))?;
        assert_eq!(grad, Array4::from_elem((1, 1, 1, 2), 4.0));
        Ok(())
    }

    #[test]
    fn gradients() {
        let mut rng = Pcg64::seed_from_u64(31);
        let mut up = UpSampling2d::new("up", 2);
        check_gradients(&mut up, &random_input((2, 2, 2, 3), &mut rng), 1e-2);
    }
}
