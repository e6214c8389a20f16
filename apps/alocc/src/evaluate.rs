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

use anyhow::{bail, Result};
use itertools::Itertools;
use ndarray::prelude::*;
use std::fmt;

/// Area under the ROC curve of `scores`, with higher scores meaning
/// positive. Computed as the Mann-Whitney U statistic; tied scores share
/// their average rank. `None` if either class is empty.
pub fn roc_auc(scores: &[f32], positive: &[bool]) -> Option<f64> {
    if scores.len() != positive.len() {
        return None;
    }
    let n_pos = positive.iter().filter(|&&p| p).count();
    let n_neg = positive.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let order = (0..scores.len())
        .sorted_by(|&a, &b| {
            scores[a]
                .partial_cmp(&scores[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .collect::<Vec<_>>();
    let mut rank_sum = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // ranks start + 1 ..= end share their mean
        let rank = (start + 1 + end) as f64 / 2.0;
        rank_sum += rank * order[start..end].iter().filter(|&&i| positive[i]).count() as f64;
        start = end;
    }
    let (n_pos, n_neg) = (n_pos as f64, n_neg as f64);
    Some((rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub inliers: usize,
    pub outliers: usize,
    /// AUC of `D(R(x))` separating the target class from the rest.
    pub validity_auc: Option<f64>,
    /// AUC of the negated reconstruction error.
    pub reconstruction_auc: Option<f64>,
    pub mean_inlier_validity: f32,
    pub mean_outlier_validity: f32,
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auc = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |v| format!("{:.4}", v));
        writeln!(f, "inliers: {}, outliers: {}", self.inliers, self.outliers)?;
        writeln!(
            f,
            "mean validity: inliers {:.4}, outliers {:.4}",
            self.mean_inlier_validity, self.mean_outlier_validity
        )?;
        write!(
            f,
            "ROC AUC: validity {}, reconstruction error {}",
            auc(self.validity_auc),
            auc(self.reconstruction_auc)
        )
    }
}

fn mean_where(values: &[f32], positive: &[bool], class: bool) -> f32 {
    let (sum, n) = values
        .iter()
        .zip(positive)
        .filter(|&(_, &p)| p == class)
        .fold((0.0, 0), |(s, n), (&v, _)| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f32
    }
}

/// Score every image and measure how well the scores separate images
/// labelled `attention_label` from all others.
pub fn evaluate(
    model: &mut AloccModel,
    images: &Array4<f32>,
    labels: &Array1<u8>,
    attention_label: u8,
    batch_size: usize,
) -> Result<Evaluation> {
    if images.len_of(Axis(0)) != labels.len() {
        bail!(
            "{} images but {} labels",
            images.len_of(Axis(0)),
            labels.len()
        );
    }
    let scores = model.novelty_scores(images, batch_size)?;
    let positive = labels.iter().map(|&l| l == attention_label).collect::<Vec<_>>();
    let validity = scores.iter().map(|s| s.validity).collect::<Vec<_>>();
    let neg_error = scores
        .iter()
        .map(|s| -s.reconstruction_error)
        .collect::<Vec<_>>();

    let inliers = positive.iter().filter(|&&p| p).count();
    let evaluation = Evaluation {
        inliers,
        outliers: positive.len() - inliers,
        validity_auc: roc_auc(&validity, &positive),
        reconstruction_auc: roc_auc(&neg_error, &positive),
        mean_inlier_validity: mean_where(&validity, &positive, true),
        mean_outlier_validity: mean_where(&validity, &positive, false),
    };
    log::info!("{}", evaluation);
    Ok(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{random_images, small_config};
    use float_cmp::approx_eq;

    #[test]
    fn separated_scores() {
        let positive = [true, true, false, false];
        assert_eq!(roc_auc(&[0.9, 0.8, 0.1, 0.2], &positive), Some(1.0));
        assert_eq!(roc_auc(&[0.1, 0.2, 0.9, 0.8], &positive), Some(0.0));
    }

    #[test]
    fn ties_count_half() {
        let positive = [true, false, true, false];
        assert_eq!(roc_auc(&[0.5; 4], &positive), Some(0.5));
        // one of the four pairs is tied, one is ordered correctly
        let auc = roc_auc(&[0.3, 0.3, 0.9, 0.95], &positive);
        assert!(approx_eq!(f64, auc.unwrap_or(-1.0), 0.375, ulps = 4));
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(roc_auc(&[0.1, 0.2], &[true, true]), None);
        assert_eq!(roc_auc(&[], &[]), None);
        assert_eq!(roc_auc(&[0.1], &[true, false]), None);
    }

    #[test]
    fn evaluates_every_image() -> Result<()> {
        let mut model = AloccModel::new(&small_config())?;
        let images = random_images(6, 11);
        let labels = arr1(&[1u8, 0, 1, 7, 1, 3]);
        let evaluation = evaluate(&mut model, &images, &labels, 1, 4)?;
        assert_eq!((evaluation.inliers, evaluation.outliers), (3, 3));
        for auc in [evaluation.validity_auc, evaluation.reconstruction_auc].iter() {
            assert!(auc.map_or(false, |a| (0.0..=1.0).contains(&a)));
        }
        assert!(evaluate(&mut model, &images, &arr1(&[1u8]), 1, 4).is_err());

        let only_inliers = evaluate(&mut model, &images, &Array1::from_elem(6, 1u8), 1, 4)?;
        assert_eq!(only_inliers.validity_auc, None);
        Ok(())
    }
}
