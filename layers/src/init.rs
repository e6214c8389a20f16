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

use ndarray::{ArrayD, IxDyn};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

/// Glorot (Xavier) uniform initialization: samples from
/// `[-limit, limit]` with `limit = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_uniform<R: Rng + ?Sized>(
    shape: &[usize],
    fan_in: usize,
    fan_out: usize,
    rng: &mut R,
) -> ArrayD<f32> {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    let dist = Uniform::new_inclusive(-limit, limit);
    ArrayD::from_shape_simple_fn(IxDyn(shape), || dist.sample(rng))
}
