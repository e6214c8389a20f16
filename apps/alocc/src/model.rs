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

//! The reconstructor (R) and discriminator (D) networks and the coupled
//! losses they are trained with.

use crate::config::AloccConfig;

use anyhow::{bail, Result};
use layers::conv::output_size;
use layers::{
    binary_cross_entropy, Activation, ActivationLayer, BatchNorm2d, Conv2d, Dense, Flatten,
    NamedTensor, Padding, Phase, RmsProp, Sequential, UpSampling2d,
};
use ndarray::prelude::*;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::fmt;

pub const RECONSTRUCTOR: &str = "R";
pub const DISCRIMINATOR: &str = "D";

const KERNEL: usize = 5;
const ENCODER_MULTIPLIERS: [usize; 3] = [2, 4, 8];

/// Side length R produces for an input side of `side`.
pub fn reconstructed_size(side: usize) -> layers::Result<usize> {
    let mut s = side;
    for _ in ENCODER_MULTIPLIERS.iter() {
        s = output_size(s, KERNEL, 2, Padding::Same)?.0;
    }
    s *= 4;
    s = output_size(s, 3, 1, Padding::Valid)?.0;
    Ok(s * 2)
}

/// Build R: a strided conv encoder followed by an upsampling conv decoder
/// with a sigmoid output in `[0, 1]`.
pub fn build_reconstructor<R: Rng + ?Sized>(config: &AloccConfig, rng: &mut R) -> Sequential {
    let (c_dim, gf, df) = (config.c_dim, config.gf_dim, config.df_dim);
    let mut r = Sequential::new(RECONSTRUCTOR);

    let mut channels = c_dim;
    for (i, mult) in ENCODER_MULTIPLIERS.iter().enumerate() {
        let filters = df * mult;
        r.add(Conv2d::new(
            &format!("g_encoder_h{}_conv", i),
            channels,
            filters,
            KERNEL,
            2,
            Padding::Same,
            rng,
        ))
        .add(BatchNorm2d::new(&format!("g_encoder_h{}_bn", i), filters))
        .add(ActivationLayer::new(
            &format!("g_encoder_h{}_lrelu", i),
            Activation::leaky_relu(),
        ));
        channels = filters;
    }

    r.add(Conv2d::new("g_decoder_h0_conv", channels, gf, KERNEL, 1, Padding::Same, rng))
        .add(ActivationLayer::new("g_decoder_h0_relu", Activation::Relu))
        .add(UpSampling2d::new("g_decoder_h0_up", 2))
        .add(Conv2d::new("g_decoder_h1_conv", gf, gf, KERNEL, 1, Padding::Same, rng))
        .add(ActivationLayer::new("g_decoder_h1_relu", Activation::Relu))
        .add(UpSampling2d::new("g_decoder_h1_up", 2))
        .add(Conv2d::new("g_decoder_h2_conv", gf, gf * 2, 3, 1, Padding::Valid, rng))
        .add(ActivationLayer::new("g_decoder_h2_relu", Activation::Relu))
        .add(UpSampling2d::new("g_decoder_h2_up", 2))
        .add(Conv2d::new("g_decoder_h3_conv", gf * 2, c_dim, KERNEL, 1, Padding::Same, rng))
        .add(ActivationLayer::new("g_decoder_h3_sigmoid", Activation::Sigmoid));
    r
}

/// Build D: four strided convs and a single sigmoid unit giving the
/// probability that the input is a real target-class image.
pub fn build_discriminator<R: Rng + ?Sized>(config: &AloccConfig, rng: &mut R) -> Result<Sequential> {
    let (c_dim, df) = (config.c_dim, config.df_dim);
    let mut d = Sequential::new(DISCRIMINATOR);
    d.add(Conv2d::new("d_h0_conv", c_dim, df, KERNEL, 2, Padding::Same, rng))
        .add(ActivationLayer::new("d_h0_lrelu", Activation::leaky_relu()));

    let mut channels = df;
    for (i, mult) in ENCODER_MULTIPLIERS.iter().enumerate() {
        let filters = df * mult;
        let h = i + 1;
        d.add(Conv2d::new(
            &format!("d_h{}_conv", h),
            channels,
            filters,
            KERNEL,
            2,
            Padding::Same,
            rng,
        ))
        .add(BatchNorm2d::new(&format!("d_h{}_bn", h), filters))
        .add(ActivationLayer::new(
            &format!("d_h{}_lrelu", h),
            Activation::leaky_relu(),
        ));
        channels = filters;
    }

    let features: usize = d.output_shape(config.image_shape())?.iter().product();
    d.add(Flatten::new("d_flatten"))
        .add(Dense::new("d_h3_lin", features, 1, rng))
        .add(ActivationLayer::new("d_h3_sigmoid", Activation::Sigmoid));
    Ok(d)
}

/// Losses of one R update, as computed before the update is applied.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GeneratorLoss {
    /// `r_alpha * reconstruction + adversarial`
    pub total: f32,
    pub reconstruction: f32,
    pub adversarial: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoveltyScore {
    /// Mean squared difference between the image and `R(image)`.
    pub reconstruction_error: f32,
    /// `D(R(image))`; low values flag novelties.
    pub validity: f32,
}

impl fmt::Display for NoveltyScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "validity {:.4}, reconstruction error {:.5}",
            self.validity, self.reconstruction_error
        )
    }
}

pub struct AloccModel {
    reconstructor: Sequential,
    discriminator: Sequential,
    d_optimizer: RmsProp,
    r_optimizer: RmsProp,
    r_alpha: f32,
    image_shape: [usize; 3],
}

impl AloccModel {
    pub fn new(config: &AloccConfig) -> Result<Self> {
        Self::with_rng(config, &mut Pcg64::seed_from_u64(config.seed))
    }

    pub fn with_rng<R: Rng + ?Sized>(config: &AloccConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let reconstructor = build_reconstructor(config, rng);
        let discriminator = build_discriminator(config, rng)?;
        Ok(Self {
            reconstructor,
            discriminator,
            d_optimizer: RmsProp::new(config.optimizer.clone()),
            r_optimizer: RmsProp::new(config.optimizer.clone()),
            r_alpha: config.r_alpha,
            image_shape: config.image_shape(),
        })
    }

    pub fn reconstructor(&self) -> &Sequential {
        &self.reconstructor
    }

    pub fn discriminator(&self) -> &Sequential {
        &self.discriminator
    }

    pub fn summary(&self) -> Result<Vec<String>> {
        let mut lines = self.discriminator.summary(self.image_shape)?;
        lines.extend(self.reconstructor.summary(self.image_shape)?);
        Ok(lines)
    }

    fn check_input(&self, images: &Array4<f32>) -> Result<()> {
        let shape = &images.shape()[1..];
        if shape != self.image_shape {
            bail!(
                "expected images of shape {:?}, got {:?}",
                self.image_shape,
                shape
            );
        }
        Ok(())
    }

    /// `R(images)` with batch norm in inference mode.
    pub fn reconstruct(&mut self, images: &Array4<f32>) -> Result<Array4<f32>> {
        self.check_input(images)?;
        Ok(self.reconstructor.forward(images, Phase::Inference)?)
    }

    /// `D(images)`, one probability per image.
    pub fn discriminate(&mut self, images: &Array4<f32>) -> Result<Array1<f32>> {
        self.check_input(images)?;
        let n = images.len_of(Axis(0));
        let out = self.discriminator.forward(images, Phase::Inference)?;
        Ok(out.into_shape(n)?)
    }

    /// `(R(images), D(R(images)))`.
    pub fn predict(&mut self, images: &Array4<f32>) -> Result<(Array4<f32>, Array1<f32>)> {
        let reconstruction = self.reconstruct(images)?;
        let validity = self.discriminate(&reconstruction)?;
        Ok((reconstruction, validity))
    }

    /// One D update towards labelling every image in `images` as `target`
    /// (1 for real, 0 for reconstructed). Returns the loss before the update.
    pub fn train_discriminator(&mut self, images: &Array4<f32>, target: f32) -> Result<f32> {
        self.check_input(images)?;
        self.discriminator.zero_grad();
        let pred = self.discriminator.forward(images, Phase::TRAIN)?;
        let labels = Array4::from_elem(pred.raw_dim(), target);
        let (loss, grad) = binary_cross_entropy(&pred, &labels)?;
        self.discriminator.backward(&grad)?;
        self.d_optimizer
            .step(self.discriminator.trainable_params_mut())?;
        log::debug!("D step {} (target {}): loss {}", self.d_optimizer.iterations(), target, loss);
        Ok(loss)
    }

    /// One R update: reconstruct `noisy` towards `clean` while making D
    /// label the reconstruction as real. D is frozen: its weights and its
    /// batch norm statistics are left untouched.
    pub fn train_adversarial(
        &mut self,
        noisy: &Array4<f32>,
        clean: &Array4<f32>,
    ) -> Result<GeneratorLoss> {
        let loss = self.adversarial_gradients(noisy, clean)?;
        self.r_optimizer
            .step(self.reconstructor.trainable_params_mut())?;
        Ok(loss)
    }

    /// Fill R's gradients with those of `r_alpha * BCE(R(noisy), clean) +
    /// BCE(D(R(noisy)), 1)`. D's gradients are discarded.
    fn adversarial_gradients(
        &mut self,
        noisy: &Array4<f32>,
        clean: &Array4<f32>,
    ) -> Result<GeneratorLoss> {
        self.check_input(noisy)?;
        self.reconstructor.zero_grad();
        self.discriminator.zero_grad();

        let reconstruction = self.reconstructor.forward(noisy, Phase::TRAIN)?;
        let validity = self.discriminator.forward(&reconstruction, Phase::FROZEN)?;

        let (recon_loss, recon_grad) = binary_cross_entropy(&reconstruction, clean)?;
        let real = Array4::ones(validity.raw_dim());
        let (adv_loss, adv_grad) = binary_cross_entropy(&validity, &real)?;

        let grad = self.discriminator.backward(&adv_grad)? + recon_grad * self.r_alpha;
        self.reconstructor.backward(&grad)?;
        self.discriminator.zero_grad();

        Ok(GeneratorLoss {
            total: self.r_alpha * recon_loss + adv_loss,
            reconstruction: recon_loss,
            adversarial: adv_loss,
        })
    }

    /// Novelty scores for every image, evaluated `batch_size` images at a time.
    pub fn novelty_scores(
        &mut self,
        images: &Array4<f32>,
        batch_size: usize,
    ) -> Result<Vec<NoveltyScore>> {
        let n = images.len_of(Axis(0));
        let mut scores = Vec::with_capacity(n);
        for start in (0..n).step_by(batch_size.max(1)) {
            let end = (start + batch_size).min(n);
            let batch = images.slice(s![start..end, .., .., ..]).to_owned();
            let (reconstruction, validity) = self.predict(&batch)?;
            for (i, &v) in validity.iter().enumerate() {
                let diff = &reconstruction.index_axis(Axis(0), i) - &batch.index_axis(Axis(0), i);
                scores.push(NoveltyScore {
                    reconstruction_error: diff.mapv(|d| d * d).mean().unwrap_or(0.0),
                    validity: v,
                });
            }
        }
        Ok(scores)
    }

    /// All tensors of both networks, as stored in a checkpoint.
    pub fn state(&self) -> Vec<NamedTensor> {
        let mut state = self.reconstructor.state();
        state.extend(self.discriminator.state());
        state
    }

    /// Restore both networks; on error neither network is modified.
    pub fn load_state(&mut self, tensors: &[NamedTensor]) -> Result<()> {
        let r_prefix = format!("{}/", RECONSTRUCTOR);
        let (r_state, d_state): (Vec<NamedTensor>, Vec<NamedTensor>) = tensors
            .iter()
            .cloned()
            .partition(|t| t.name.starts_with(&r_prefix));

        let r_backup = self.reconstructor.state();
        let loaded = self
            .reconstructor
            .load_state(&r_state)
            .and_then(|_| self.discriminator.load_state(&d_state));
        if let Err(e) = loaded {
            self.reconstructor.load_state(&r_backup)?;
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::SeedableRng;

    pub(crate) fn small_config() -> AloccConfig {
        AloccConfig {
            gf_dim: 2,
            df_dim: 2,
            batch_size: 4,
            ..Default::default()
        }
    }

    pub(crate) fn random_images(n: usize, seed: u64) -> Array4<f32> {
        let mut rng = Pcg64::seed_from_u64(seed);
        Array4::from_shape_simple_fn((n, 1, 28, 28), || rng.gen_range(0.0..1.0))
    }

    #[test]
    fn reconstructs_the_input_size() -> layers::Result<()> {
        assert_eq!(reconstructed_size(28)?, 28);
        assert_eq!(reconstructed_size(60)?, 60);
        assert_ne!(reconstructed_size(32)?, 32);
        Ok(())
    }

    #[test]
    fn network_shapes() -> Result<()> {
        let config = small_config();
        let mut model = AloccModel::new(&config)?;
        assert_eq!(model.reconstructor().output_shape([1, 28, 28])?, [1, 28, 28]);
        assert_eq!(model.discriminator().output_shape([1, 28, 28])?, [1, 1, 1]);

        let images = random_images(3, 1);
        let (reconstruction, validity) = model.predict(&images)?;
        assert_eq!(reconstruction.shape(), &[3, 1, 28, 28]);
        assert!(reconstruction.iter().all(|&v| v >= 0.0 && v <= 1.0));
        assert_eq!(validity.len(), 3);
        assert!(validity.iter().all(|&v| v > 0.0 && v < 1.0));
        assert!(!model.summary()?.is_empty());
        Ok(())
    }

    #[test]
    fn encoder_sizes() -> Result<()> {
        let config = AloccConfig::default();
        let r = build_reconstructor(&config, &mut Pcg64::seed_from_u64(0));
        let params = r.params();
        // 5x5 kernels over 1, 32 and 64 input channels
        assert_eq!(params[0].value.shape(), &[25, 32]);
        assert!(params.iter().any(|p| p.value.shape() == [25 * 32, 64]));
        assert!(params.iter().any(|p| p.value.shape() == [25 * 64, 128]));
        let d = build_discriminator(&config, &mut Pcg64::seed_from_u64(0))?;
        // 28 -> 14 -> 7 -> 4 -> 2, 128 channels
        assert!(d.params().iter().any(|p| p.value.shape() == [512, 1]));
        Ok(())
    }

    #[test]
    fn rejects_wrong_image_shape() -> Result<()> {
        let mut model = AloccModel::new(&small_config())?;
        assert!(model.reconstruct(&Array4::zeros((1, 1, 27, 28))).is_err());
        assert!(model.train_discriminator(&Array4::zeros((2, 3, 28, 28)), 1.0).is_err());
        Ok(())
    }

    #[test]
    fn discriminator_update_leaves_reconstructor_alone() -> Result<()> {
        let mut model = AloccModel::new(&small_config())?;
        let r_before = model.reconstructor().state();
        let d_before = model.discriminator().state();
        model.train_discriminator(&random_images(4, 2), 1.0)?;
        assert_eq!(model.reconstructor().state(), r_before);
        assert_ne!(model.discriminator().state(), d_before);
        Ok(())
    }

    #[test]
    fn adversarial_update_freezes_discriminator() -> Result<()> {
        let config = small_config();
        let mut model = AloccModel::new(&config)?;
        let clean = random_images(4, 3);
        let noisy = random_images(4, 4);
        let r_before = model.reconstructor().state();
        let d_before = model.discriminator().state();

        let loss = model.train_adversarial(&noisy, &clean)?;
        assert_eq!(model.discriminator().state(), d_before);
        assert_ne!(model.reconstructor().state(), r_before);
        assert!((loss.total - (config.r_alpha * loss.reconstruction + loss.adversarial)).abs() < 1e-5);
        assert!(loss.reconstruction > 0.0 && loss.adversarial > 0.0);
        Ok(())
    }

    /// R's objective after moving its trainable params `step` along
    /// `direction`; the params are restored afterwards.
    fn objective_along(
        model: &mut AloccModel,
        direction: &[ArrayD<f32>],
        step: f32,
        noisy: &Array4<f32>,
        clean: &Array4<f32>,
    ) -> Result<f64> {
        let original = model.reconstructor.state();
        for (p, d) in model.reconstructor.trainable_params_mut().into_iter().zip(direction) {
            p.value.scaled_add(step, d);
        }
        let loss = model.adversarial_gradients(noisy, clean)?;
        model.reconstructor.load_state(&original)?;
        Ok(loss.total as f64)
    }

    #[test]
    fn adversarial_gradient_matches_finite_differences() -> Result<()> {
        let config = AloccConfig {
            r_alpha: 0.4,
            ..small_config()
        };
        let mut model = AloccModel::new(&config)?;
        let clean = random_images(4, 12);
        let noisy = random_images(4, 13);

        model.adversarial_gradients(&noisy, &clean)?;
        let grads = model
            .reconstructor
            .trainable_params_mut()
            .iter()
            .map(|p| p.grad.clone())
            .collect::<Vec<_>>();
        let norm = grads
            .iter()
            .flat_map(|g| g.iter())
            .map(|&g| g as f64 * g as f64)
            .sum::<f64>()
            .sqrt();
        assert!(norm > 0.0);
        let direction = grads
            .iter()
            .map(|g| g.mapv(|v| (v as f64 / norm) as f32))
            .collect::<Vec<_>>();

        // the derivative along the normalized gradient is its norm
        let eps = 1e-2;
        let plus = objective_along(&mut model, &direction, eps, &noisy, &clean)?;
        let minus = objective_along(&mut model, &direction, -eps, &noisy, &clean)?;
        let numeric = (plus - minus) / (2.0 * eps as f64);
        assert!(
            (numeric - norm).abs() <= 0.05 * norm + 1e-4,
            "analytic {} vs numeric {}",
            norm,
            numeric
        );
        Ok(())
    }

    #[test]
    fn discriminator_learns_a_fixed_batch() -> Result<()> {
        let mut model = AloccModel::new(&small_config())?;
        let images = random_images(4, 5);
        let first = model.train_discriminator(&images, 1.0)?;
        let mut last = first;
        for _ in 0..30 {
            last = model.train_discriminator(&images, 1.0)?;
        }
        assert!(last < first, "loss went from {} to {}", first, last);
        Ok(())
    }

    #[test]
    fn novelty_scores_cover_every_image() -> Result<()> {
        let mut model = AloccModel::new(&small_config())?;
        let images = random_images(5, 6);
        let scores = model.novelty_scores(&images, 2)?;
        assert_eq!(scores.len(), 5);
        let (_, validity) = model.predict(&images)?;
        for (score, v) in scores.iter().zip(validity.iter()) {
            assert!((score.validity - v).abs() < 1e-5);
            assert!(score.reconstruction_error > 0.0);
        }
        Ok(())
    }

    #[test]
    fn state_round_trip() -> Result<()> {
        let config = small_config();
        let mut trained = AloccModel::new(&config)?;
        trained.train_discriminator(&random_images(4, 7), 1.0)?;
        trained.train_adversarial(&random_images(4, 8), &random_images(4, 9))?;

        let mut restored = AloccModel::with_rng(&config, &mut Pcg64::seed_from_u64(99))?;
        restored.load_state(&trained.state())?;
        let images = random_images(2, 10);
        assert_eq!(trained.predict(&images)?, restored.predict(&images)?);
        Ok(())
    }

    #[test]
    fn load_state_rejects_other_architectures() -> Result<()> {
        let wide = AloccModel::new(&AloccConfig {
            df_dim: 3,
            ..small_config()
        })?;
        let mut model = AloccModel::new(&small_config())?;
        let before = model.state();
        assert!(model.load_state(&wide.state()).is_err());
        assert_eq!(model.state(), before);
        Ok(())
    }

    #[test]
    fn load_state_rejects_truncated_tensors() -> Result<()> {
        let config = small_config();
        let other = AloccModel::with_rng(&config, &mut Pcg64::seed_from_u64(42))?;
        let mut model = AloccModel::new(&config)?;
        let before = model.state();

        for network in [RECONSTRUCTOR, DISCRIMINATOR].iter() {
            let prefix = format!("{}/", network);
            let mut state = other.state();
            let last = state
                .iter_mut()
                .filter(|t| t.name.starts_with(&prefix))
                .last()
                .map(|t| t.data.pop());
            assert!(last.is_some());
            assert!(model.load_state(&state).is_err());
            assert_eq!(model.state(), before, "{} partially loaded", network);
        }
        Ok(())
    }
}
