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

use ndarray::prelude::*;
use rand::Rng;
use rand_distr::StandardNormal;

/// Add zero-mean Gaussian noise with standard deviation `sigma` to every
/// pixel and clip the result back to `[0, 1]`.
pub fn add_gaussian_noise<R: Rng + ?Sized>(
    images: &Array4<f32>,
    sigma: f32,
    rng: &mut R,
) -> Array4<f32> {
    images.mapv(|v| {
        let z: f32 = rng.sample(StandardNormal);
        (v + sigma * z).max(0.0).min(1.0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn stays_in_range() {
        let mut rng = Pcg64::seed_from_u64(1);
        let images = Array4::from_shape_fn((4, 1, 8, 8), |(b, _, y, x)| ((b + y + x) % 2) as f32);
        let noisy = add_gaussian_noise(&images, 0.5, &mut rng);
        assert!(noisy.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_ne!(noisy, images);
    }

    #[test]
    fn zero_sigma_is_identity() {
        let mut rng = Pcg64::seed_from_u64(2);
        let images = Array4::from_elem((2, 1, 3, 3), 0.25f32);
        assert_eq!(add_gaussian_noise(&images, 0.0, &mut rng), images);
    }

    #[test]
    fn noise_has_the_requested_spread() {
        let mut rng = Pcg64::seed_from_u64(3);
        let images = Array4::from_elem((16, 1, 16, 16), 0.5f32);
        let noisy = add_gaussian_noise(&images, 0.155, &mut rng);
        let n = noisy.len() as f32;
        let mean = noisy.sum() / n;
        let std = (noisy.mapv(|v| (v - mean) * (v - mean)).sum() / n).sqrt();
        assert!((mean - 0.5).abs() < 0.01, "mean {}", mean);
        // clipping at 3 sigma away barely matters
        assert!((std - 0.155).abs() < 0.01, "std {}", std);
    }
}
