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

use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /// backward() was called on a layer without a cached training forward pass.
    NoForwardPass(String),
    InvalidInput(String),
    MissingTensor(String),
    UnexpectedTensor(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn shape(context: &str, expected: &[usize], found: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.to_string(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ShapeMismatch {
                context,
                expected,
                found,
            } => write!(
                f,
                "ERROR: shape mismatch in {}: expected {:?}, found {:?}",
                context, expected, found
            ),
            Self::NoForwardPass(layer) => {
                write!(f, "ERROR: backward pass on {} before forward pass", layer)
            }
            Self::InvalidInput(msg) => write!(f, "ERROR: invalid input: {}", msg),
            Self::MissingTensor(name) => write!(f, "ERROR: missing tensor {}", name),
            Self::UnexpectedTensor(name) => write!(f, "ERROR: unexpected tensor {}", name),
        }
    }
}

impl std::error::Error for Error {}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::InvalidInput(e.to_string())
    }
}
