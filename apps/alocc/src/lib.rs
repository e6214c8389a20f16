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

//! Adversarially learned one-class classifier (ALOCC) for MNIST.
//!
//! A reconstructor R learns to denoise images of one digit, the attention
//! label, while a discriminator D learns to tell real images of that digit
//! from R's output. At test time `D(R(x))` is low for digits R never saw.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod evaluate;
pub mod model;
pub mod montage;
pub mod noise;
pub mod train;

pub use config::AloccConfig;
pub use evaluate::Evaluation;
pub use model::{AloccModel, NoveltyScore};
pub use train::TrainingHistory;

use anyhow::Result;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use std::path::{Path, PathBuf};

/// The checkpoint written after the last training epoch.
pub fn default_weights(config: &AloccConfig) -> PathBuf {
    checkpoint::checkpoint_path(&config.checkpoint_dir, config.epochs.saturating_sub(1))
}

/// Train a fresh model on the training images of the attention label.
pub fn run_training(config: &AloccConfig) -> Result<TrainingHistory> {
    let dataset = data::load_dataset(config)?;
    let images = data::filter_label(
        &dataset.train_images,
        &dataset.train_labels,
        config.attention_label,
    )?;
    log::info!(
        "training on {} images of digit {}",
        images.len_of(ndarray::Axis(0)),
        config.attention_label
    );

    let mut rng = Pcg64::seed_from_u64(config.seed);
    let mut model = AloccModel::with_rng(config, &mut rng)?;
    for line in model.summary()? {
        log::info!("{}", line);
    }
    train::train(&mut model, &images, config, &mut rng)
}

fn restore(config: &AloccConfig, weights: &Path) -> Result<AloccModel> {
    let mut model = AloccModel::new(config)?;
    let epoch = checkpoint::load(&mut model, weights)?;
    log::info!("restored {} (epoch {})", weights.display(), epoch);
    Ok(model)
}

/// Novelty scores of the test images of the attention label.
pub fn run_test(config: &AloccConfig, weights: &Path) -> Result<Vec<NoveltyScore>> {
    let mut model = restore(config, weights)?;
    let dataset = data::load_dataset(config)?;
    let images = data::filter_label(
        &dataset.test_images,
        &dataset.test_labels,
        config.attention_label,
    )?;
    model.novelty_scores(&images, config.batch_size)
}

/// Separation of the attention label from every other digit in the test set.
pub fn run_evaluation(config: &AloccConfig, weights: &Path) -> Result<Evaluation> {
    let mut model = restore(config, weights)?;
    let dataset = data::load_dataset(config)?;
    evaluate::evaluate(
        &mut model,
        &dataset.test_images,
        &dataset.test_labels,
        config.attention_label,
        config.batch_size,
    )
}
