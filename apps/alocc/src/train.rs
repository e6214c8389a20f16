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

//! The adversarial training loop: per batch one D update on real images,
//! one on reconstructions, then two R updates against the frozen D.

use crate::checkpoint;
use crate::config::AloccConfig;
use crate::data::{batch, batch_count};
use crate::model::{AloccModel, GeneratorLoss};
use crate::montage::{grid_size, montage, save_image};
use crate::noise::add_gaussian_noise;

use anyhow::{bail, Context, Result};
use ndarray::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const HISTORY_FILE: &str = "plot_g_recon_losses.json";

/// Per-batch losses. `epochs[i]` is the fractional epoch of batch `i`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<f64>,
    pub d_losses: Vec<f32>,
    pub g_losses: Vec<f32>,
    pub g_recon_losses: Vec<f32>,
    pub g_adversarial_losses: Vec<f32>,
}

impl TrainingHistory {
    pub fn record(&mut self, epoch: f64, d_loss: f32, g_loss: &GeneratorLoss) {
        self.epochs.push(epoch);
        self.d_losses.push(d_loss);
        self.g_losses.push(g_loss.total);
        self.g_recon_losses.push(g_loss.reconstruction);
        self.g_adversarial_losses.push(g_loss.adversarial);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

fn save_samples(model: &mut AloccModel, samples: &Array4<f32>, path: &Path) -> Result<()> {
    let reconstruction = model.reconstruct(samples)?;
    let (rows, cols) = grid_size(reconstruction.len_of(Axis(0)));
    save_image(path, &montage(reconstruction.view(), rows, cols))?;
    log::debug!("saved samples to {}", path.display());
    Ok(())
}

/// Train `model` on `images`, all of the target class. Noise is drawn once
/// up front; checkpoints are written at the end of every epoch.
pub fn train<R: Rng + ?Sized>(
    model: &mut AloccModel,
    images: &Array4<f32>,
    config: &AloccConfig,
    rng: &mut R,
) -> Result<TrainingHistory> {
    let batch_size = config.batch_size;
    let batches = batch_count(images.len_of(Axis(0)), batch_size);
    if batches == 0 {
        bail!(
            "{} training images do not fill a single batch of {}",
            images.len_of(Axis(0)),
            batch_size
        );
    }
    for dir in [&config.checkpoint_dir, &config.sample_dir, &config.log_dir].iter() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let samples = images.slice(s![..batch_size, .., .., ..]).to_owned();
    let (rows, cols) = grid_size(batch_size);
    save_image(
        &config.sample_dir.join("train_input_samples.png"),
        &montage(samples.view(), rows, cols),
    )?;

    let noisy_images = add_gaussian_noise(images, config.noise_sigma, rng);
    let mut history = TrainingHistory::default();
    let mut counter = 1;

    for epoch in 0..config.epochs {
        log::info!(
            "Epoch ({}/{})-------------------------------------------------",
            epoch,
            config.epochs
        );
        for idx in 0..batches {
            let clean = batch(images, idx, batch_size).to_owned();
            let noisy = batch(&noisy_images, idx, batch_size).to_owned();

            let fake = model.reconstruct(&noisy)?;
            let d_loss_real = model.train_discriminator(&clean, 1.0)?;
            let d_loss_fake = model.train_discriminator(&fake, 0.0)?;

            model.train_adversarial(&noisy, &clean)?;
            let g_loss = model.train_adversarial(&noisy, &clean)?;

            let d_loss = d_loss_real + d_loss_fake;
            history.record(epoch as f64 + idx as f64 / batches as f64, d_loss, &g_loss);
            counter += 1;
            log::info!(
                "Epoch:[{}]-[{}/{}] --> d_loss: {:.3}, g_loss: {:.3}, g_recon_loss: {:.3}",
                epoch,
                idx,
                batches,
                d_loss,
                g_loss.total,
                g_loss.reconstruction
            );

            if counter % config.sample_interval == 0 {
                let path = config
                    .sample_dir
                    .join(format!("train_{:02}_{:04}.png", epoch, idx));
                save_samples(model, &samples, &path)?;
            }
        }
        checkpoint::save(model, &config.checkpoint_dir, epoch)?;
    }

    history.save_json(&config.log_dir.join(HISTORY_FILE))?;
    Ok(history)
}
