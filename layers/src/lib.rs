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

//! Small convolutional network toolkit with hand-written backward passes.
//!
//! Tensors are `ndarray` arrays in `(batch, channels, height, width)`
//! layout. Each layer caches what it needs during a training forward pass;
//! `Sequential::backward` then walks the stack in reverse.

pub mod activation;
pub mod batch_norm;
pub mod conv;
pub mod dense;
pub mod error;
pub mod init;
pub mod layer;
pub mod loss;
pub mod optim;
pub mod sequential;
pub mod upsample;

#[cfg(test)]
pub(crate) mod testing;

pub use activation::{Activation, ActivationLayer};
pub use batch_norm::BatchNorm2d;
pub use conv::{Conv2d, Padding};
pub use dense::{Dense, Flatten};
pub use error::{Error, Result};
pub use layer::{Layer, NamedTensor, Param, Phase};
pub use loss::binary_cross_entropy;
pub use optim::{RmsProp, RmsPropConfig};
pub use sequential::Sequential;
pub use upsample::UpSampling2d;
