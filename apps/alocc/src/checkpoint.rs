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

use crate::model::AloccModel;

use anyhow::{bail, Context, Result};
use layers::NamedTensor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything needed to restore a trained model: the weights, biases and
/// batch norm statistics of R and D.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub tensors: Vec<NamedTensor>,
}

pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("ALOCC_Model_{}.pickle", epoch))
}

/// Pickle the model state to `dir/ALOCC_Model_{epoch}.pickle`.
pub fn save(model: &AloccModel, dir: &Path, epoch: usize) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = checkpoint_path(dir, epoch);
    let checkpoint = Checkpoint {
        epoch,
        tensors: model.state(),
    };
    let payload = serde_pickle::to_vec(&checkpoint, serde_pickle::SerOptions::new())?;
    std::fs::write(&path, payload)
        .with_context(|| format!("failed to write {}", path.display()))?;
    log::info!(
        "saved {} tensors to {}",
        checkpoint.tensors.len(),
        path.display()
    );
    Ok(path)
}

/// Restore a model saved by [`save`] and return the epoch it was saved at.
/// The model is left untouched if the checkpoint doesn't match it.
pub fn load(model: &mut AloccModel, path: &Path) -> Result<usize> {
    if !path.exists() {
        bail!(
            "{} does not exist.\nPlease train a model first, e.g. with `alocc train`",
            path.display()
        );
    }
    let payload = std::fs::read(path)?;
    let checkpoint: Checkpoint = serde_pickle::from_slice(&payload, serde_pickle::DeOptions::new())
        .with_context(|| format!("{} is not an ALOCC checkpoint", path.display()))?;
    log::debug!(
        "checkpoint tensors: {:?}",
        checkpoint
            .tensors
            .iter()
            .map(|t| (&t.name, &t.shape))
            .collect::<Vec<_>>()
    );
    model
        .load_state(&checkpoint.tensors)
        .with_context(|| format!("failed to restore {}", path.display()))?;
    Ok(checkpoint.epoch)
}
