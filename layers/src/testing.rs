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

//! Finite-difference gradient checks shared by the layer tests.

use crate::layer::{Layer, Phase};

use ndarray::prelude::*;
use rand::Rng;

const EPS: f32 = 1e-2;

/// Uniform values in `[-1, 1]`, kept at least 0.1 away from zero so that
/// finite differences never straddle a ReLU kink.
pub fn random_input<R: Rng>(shape: (usize, usize, usize, usize), rng: &mut R) -> Array4<f32> {
    Array4::from_shape_simple_fn(shape, || {
        let v: f32 = rng.gen_range(-1.0..1.0);
        if v.abs() < 0.1 {
            v.signum() * 0.1 + v
        } else {
            v
        }
    })
}

/// Fixed, non-uniform weights for the scalar probe `sum(output * weights)`.
fn probe_weights(shape: &[usize]) -> Array4<f32> {
    let dim = (shape[0], shape[1], shape[2], shape[3]);
    let mut i = 0usize;
    Array4::from_shape_simple_fn(dim, || {
        i += 1;
        ((i * 7919) % 13) as f32 / 13.0 - 0.4
    })
}

fn probe<L: Layer>(layer: &mut L, input: &Array4<f32>, weights: &Array4<f32>) -> f64 {
    let out = layer
        .forward(input, Phase::FROZEN)
        .expect("forward pass failed");
    out.iter()
        .zip(weights.iter())
        .map(|(&o, &w)| o as f64 * w as f64)
        .sum()
}

fn assert_close(what: &str, analytic: f32, numeric: f64, tolerance: f32) {
    let numeric = numeric as f32;
    let scale = numeric.abs().max(1.0);
    assert!(
        (analytic - numeric).abs() <= tolerance * scale,
        "{}: analytic {} vs numeric {}",
        what,
        analytic,
        numeric
    );
}

/// Compare the layer's backward pass against central differences, for the
/// input and for every trainable parameter.
pub fn check_gradients<L: Layer>(layer: &mut L, input: &Array4<f32>, tolerance: f32) {
    for p in layer.params_mut() {
        p.zero_grad();
    }
    let out = layer
        .forward(input, Phase::FROZEN)
        .expect("forward pass failed");
    let weights = probe_weights(out.shape());
    let grad_input = layer.backward(&weights).expect("backward pass failed");
    assert_eq!(grad_input.shape(), input.shape());

    let mut perturbed = input.clone();
    for (idx, &x) in input.indexed_iter() {
        perturbed[idx] = x + EPS;
        let plus = probe(layer, &perturbed, &weights);
        perturbed[idx] = x - EPS;
        let minus = probe(layer, &perturbed, &weights);
        perturbed[idx] = x;
        let numeric = (plus - minus) / (2.0 * EPS as f64);
        assert_close(
            &format!("{} input {:?}", layer.name(), idx),
            grad_input[idx],
            numeric,
            tolerance,
        );
    }

    let n_params = layer.params().len();
    for p in 0..n_params {
        if !layer.params()[p].trainable {
            continue;
        }
        let analytic = layer.params()[p].grad.clone();
        let len = analytic.len();
        for i in 0..len {
            let original = layer.params()[p].value.as_slice().expect("contiguous")[i];
            set_param(layer, p, i, original + EPS);
            let plus = probe(layer, input, &weights);
            set_param(layer, p, i, original - EPS);
            let minus = probe(layer, input, &weights);
            set_param(layer, p, i, original);
            let numeric = (plus - minus) / (2.0 * EPS as f64);
            assert_close(
                &format!("{}[{}]", layer.params()[p].name, i),
                analytic.as_slice().expect("contiguous")[i],
                numeric,
                tolerance,
            );
        }
    }
}

fn set_param<L: Layer>(layer: &mut L, param: usize, i: usize, value: f32) {
    let mut params = layer.params_mut();
    params[param].value.as_slice_mut().expect("contiguous")[i] = value;
}
