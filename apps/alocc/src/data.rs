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

use crate::config::AloccConfig;

use anyhow::{bail, Result};
use mnist::*;
use ndarray::prelude::*;
use std::process::Command;

pub const IMAGE_SIDE: usize = 28;
const N_TRAIN: usize = 60_000;
const N_TEST: usize = 10_000;

const IDX_FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

/// MNIST images scaled to `[0, 1]`, as `(n, 1, 28, 28)` arrays.
pub struct MnistDataset {
    pub train_images: Array4<f32>,
    pub train_labels: Array1<u8>,
    pub test_images: Array4<f32>,
    pub test_labels: Array1<u8>,
}

/// Load the mnist data set
/// mnist data formats: http://yann.lecun.com/exdb/mnist/
pub fn load_dataset(config: &AloccConfig) -> Result<MnistDataset> {
    if config.image_shape() != [1, IMAGE_SIDE, IMAGE_SIDE] {
        bail!(
            "MNIST images are 1x{}x{}, but the model expects {:?}",
            IMAGE_SIDE,
            IMAGE_SIDE,
            config.image_shape()
        );
    }

    if let Some(script) = &config.download_script {
        log::info!("running {}", script.display());
        let download = Command::new(script).arg(&config.data_dir).output()?;
        if !download.status.success() {
            bail!(
                "Failed to download data set: {}",
                String::from_utf8_lossy(&download.stderr)
            );
        }
    }
    for file in IDX_FILES.iter() {
        let path = config.data_dir.join(file);
        if !path.exists() {
            bail!(
                "{} does not exist.\nPlease download MNIST, e.g. with scripts/mnist_download.sh {}",
                path.display(),
                config.data_dir.display()
            );
        }
    }

    // the mnist crate panics on missing files, hence the checks above
    let base_path = config.data_dir.to_string_lossy();
    let NormalizedMnist {
        trn_img,
        trn_lbl,
        tst_img,
        tst_lbl,
        ..
    } = MnistBuilder::new()
        .base_path(&base_path)
        .label_format_digit()
        .training_set_length(N_TRAIN as u32)
        .validation_set_length(0)
        .test_set_length(N_TEST as u32)
        .finalize()
        .normalize();
    log::info!(
        "loaded {} training and {} test images from {}",
        trn_lbl.len(),
        tst_lbl.len(),
        base_path
    );

    Ok(MnistDataset {
        train_images: Array4::from_shape_vec((N_TRAIN, 1, IMAGE_SIDE, IMAGE_SIDE), trn_img)?,
        train_labels: Array1::from(trn_lbl),
        test_images: Array4::from_shape_vec((N_TEST, 1, IMAGE_SIDE, IMAGE_SIDE), tst_img)?,
        test_labels: Array1::from(tst_lbl),
    })
}

/// The images whose label is `label`: the training set of a one-class
/// detector.
pub fn filter_label(images: &Array4<f32>, labels: &Array1<u8>, label: u8) -> Result<Array4<f32>> {
    if images.len_of(Axis(0)) != labels.len() {
        bail!(
            "{} images but {} labels",
            images.len_of(Axis(0)),
            labels.len()
        );
    }
    let indices = labels
        .iter()
        .enumerate()
        .filter(|&(_, &l)| l == label)
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    Ok(images.select(Axis(0), &indices))
}

/// Number of full batches; a trailing partial batch is dropped.
pub fn batch_count(len: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        len / batch_size
    }
}

pub fn batch(images: &Array4<f32>, idx: usize, batch_size: usize) -> ArrayView4<f32> {
    images.slice(s![idx * batch_size..(idx + 1) * batch_size, .., .., ..])
}
