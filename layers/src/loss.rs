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

use ndarray::{Array, Dimension, Zip};

/// Predictions are clipped to `[EPSILON, 1 - EPSILON]` before taking logs.
pub const EPSILON: f32 = 1e-7;

/// Mean binary cross-entropy over all elements, and its gradient with
/// respect to `pred`. The gradient vanishes where the clip is active.
pub fn binary_cross_entropy<D: Dimension>(
    pred: &Array<f32, D>,
    target: &Array<f32, D>,
) -> Result<(f32, Array<f32, D>)> {
    if pred.shape() != target.shape() {
        return Err(Error::shape(
            "binary_cross_entropy",
            pred.shape(),
            target.shape(),
        ));
    }
    let count = pred.len();
    if count == 0 {
        return Err(Error::InvalidInput(
            "binary_cross_entropy of an empty tensor".to_string(),
        ));
    }

    let mut loss = 0f64;
    let mut grad = Array::zeros(pred.raw_dim());
    Zip::from(&mut grad)
        .and(pred)
        .and(target)
        .for_each(|g, &p, &y| {
            let clipped = p.max(EPSILON).min(1.0 - EPSILON);
            loss -= (y as f64) * (clipped as f64).ln() + (1.0 - y as f64) * (1.0 - clipped as f64).ln();
            if p > EPSILON && p < 1.0 - EPSILON {
                *g = (p - y) / (p * (1.0 - p) * count as f32);
            }
        });
    Ok(((loss / count as f64) as f32, grad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use ndarray::prelude::*;

    #[test]
    fn coin_flip_loss() -> Result<()> {
        let pred = Array2::from_elem((4, 1), 0.5f32);
        let (loss, grad) = binary_cross_entropy(&pred, &Array2::ones((4, 1)))?;
        assert!(approx_eq!(f32, loss, std::f32::consts::LN_2, epsilon = 1e-6));
        // (0.5 - 1) / (0.25 * 4)
        assert!(grad.iter().all(|&g| approx_eq!(f32, g, -0.5, epsilon = 1e-6)));
        Ok(())
    }

    #[test]
    fn clipped_predictions_have_no_gradient() -> Result<()> {
        let pred = arr1(&[0.0f32, 1.0]);
        let target = arr1(&[1.0f32, 0.0]);
        let (loss, grad) = binary_cross_entropy(&pred, &target)?;
        assert!(loss.is_finite());
        // both terms are close to -ln(1e-7)
        assert!(loss > 15.0 && loss < 16.2, "loss {}", loss);
        assert_eq!(grad, arr1(&[0.0, 0.0]));
        Ok(())
    }

    #[test]
    fn gradient_matches_finite_difference() -> Result<()> {
        let pred = arr1(&[0.2f32, 0.7, 0.9]);
        let target = arr1(&[0.0f32, 1.0, 0.3]);
        let (_, grad) = binary_cross_entropy(&pred, &target)?;
        let h = 1e-3f32;
        for i in 0..3 {
            let mut plus = pred.clone();
            plus[i] += h;
            let mut minus = pred.clone();
            minus[i] -= h;
            let numeric = (binary_cross_entropy(&plus, &target)?.0
                - binary_cross_entropy(&minus, &target)?.0)
                / (2.0 * h);
            assert!((numeric - grad[i]).abs() < 1e-2, "{} vs {}", numeric, grad[i]);
        }
        Ok(())
    }

    #[test]
    fn shape_mismatch() {
        let res = binary_cross_entropy(&Array2::<f32>::zeros((2, 1)), &Array2::zeros((1, 2)));
        assert!(matches!(res, Err(Error::ShapeMismatch { .. })));
    }
}
