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

use crate::model::reconstructed_size;

use anyhow::{bail, Context, Result};
use layers::RmsPropConfig;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Experiment configuration. Every field can be omitted from the YAML file;
/// the defaults reproduce the MNIST experiment.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AloccConfig {
    pub input_height: usize,
    pub input_width: usize,
    /// Image channels; 1 for grayscale.
    pub c_dim: usize,
    /// Filters in the first decoder conv layer of R.
    pub gf_dim: usize,
    /// Filters in the first conv layer of D (R's encoder uses multiples).
    pub df_dim: usize,
    /// Weight of the reconstruction loss in R's objective.
    pub r_alpha: f32,
    /// The target class; every other class is a novelty.
    pub attention_label: u8,
    pub epochs: usize,
    pub batch_size: usize,
    /// Save a montage of reconstructions every this many batches.
    pub sample_interval: usize,
    /// Standard deviation of the Gaussian noise fed to R during training.
    pub noise_sigma: f32,
    pub seed: u64,
    pub optimizer: RmsPropConfig,
    pub log_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub sample_dir: PathBuf,
    /// Directory holding the MNIST IDX files.
    pub data_dir: PathBuf,
    /// Run before loading the data set, e.g. to download it.
    pub download_script: Option<PathBuf>,
}

impl Default for AloccConfig {
    fn default() -> Self {
        Self {
            input_height: 28,
            input_width: 28,
            c_dim: 1,
            gf_dim: 16,
            df_dim: 16,
            r_alpha: 0.2,
            attention_label: 1,
            epochs: 5,
            batch_size: 128,
            sample_interval: 500,
            noise_sigma: 0.155,
            seed: 0,
            optimizer: RmsPropConfig::default(),
            log_dir: PathBuf::from("log"),
            checkpoint_dir: PathBuf::from("checkpoint"),
            sample_dir: PathBuf::from("sample"),
            data_dir: PathBuf::from("data_sets/mnist"),
            download_script: None,
        }
    }
}

impl AloccConfig {
    pub fn from_file(file_name: &Path) -> Result<Self> {
        let file = File::open(file_name)
            .with_context(|| format!("config file {} not found", file_name.display()))?;
        let config: Self = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse {}", file_name.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(config: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(config)?;
        config.validate()?;
        Ok(config)
    }

    /// `[channels, height, width]` of the images the networks consume.
    pub fn image_shape(&self) -> [usize; 3] {
        [self.c_dim, self.input_height, self.input_width]
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 || self.sample_interval == 0 {
            bail!("epochs, batch_size and sample_interval must be positive");
        }
        if self.attention_label > 9 {
            bail!(
                "attention_label {} is not an MNIST digit",
                self.attention_label
            );
        }
        if self.c_dim == 0 || self.gf_dim == 0 || self.df_dim == 0 {
            bail!("c_dim, gf_dim and df_dim must be positive");
        }
        if !(self.r_alpha > 0.0) {
            bail!("r_alpha must be positive, got {}", self.r_alpha);
        }
        if !(self.optimizer.learning_rate > 0.0) {
            bail!(
                "learning rate must be positive, got {}",
                self.optimizer.learning_rate
            );
        }
        if !(self.noise_sigma >= 0.0) {
            bail!("noise_sigma must not be negative, got {}", self.noise_sigma);
        }
        for &side in [self.input_height, self.input_width].iter() {
            match reconstructed_size(side) {
                Ok(out) if out == side => {}
                Ok(out) => bail!(
                    "R maps an input side of {} to {}; choose a size it reconstructs exactly, e.g. 28",
                    side,
                    out
                ),
                Err(e) => bail!("input side {} is too small for R: {}", side, e),
            }
        }
        Ok(())
    }
}
