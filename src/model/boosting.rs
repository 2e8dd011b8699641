//! Multinomial gradient boosting.
//!
//! Every stage fits one squared-error regression tree per class to the
//! negative gradient of the softmax log loss, then replaces each leaf value
//! with a single Newton step.

use anyhow::{Result, bail};
use bincode::{Decode, Encode};
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::debug;

use super::tree::{DecisionTree, TreeParams};
use super::{check_fit_inputs, check_width, derive_seed, normalize, softmax_rows};

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct BoostingParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct GradientBoosting {
    pub params: BoostingParams,
    /// Log class priors; the raw score every sample starts from.
    pub init: Vec<f64>,
    /// `stages[m][k]` is the stage-`m` tree for class `k`.
    pub stages: Vec<Vec<DecisionTree>>,
    pub n_classes: usize,
    pub n_features: usize,
}

fn newton_leaves(tree: &mut DecisionTree, x: ArrayView2<f64>, residual: &[f64], n_classes: usize) {
    let mut num = vec![0.0; tree.nodes.len()];
    let mut den = vec![0.0; tree.nodes.len()];
    for (i, row) in x.rows().into_iter().enumerate() {
        let leaf = tree.apply(row);
        let r = residual[i];
        num[leaf] += r;
        den[leaf] += r.abs() * (1.0 - r.abs());
    }
    let k = n_classes as f64;
    for (id, node) in tree.nodes.iter_mut().enumerate() {
        if !node.is_leaf() {
            continue;
        }
        let value = if den[id].abs() < 1e-150 {
            0.0
        } else {
            (k - 1.0) / k * num[id] / den[id]
        };
        node.value = vec![value];
    }
}

fn log_loss(proba: &Array2<f64>, y: &[usize]) -> f64 {
    let total: f64 = y
        .iter()
        .enumerate()
        .map(|(i, &c)| -proba[[i, c]].max(1e-15).ln())
        .sum();
    total / y.len().max(1) as f64
}

impl GradientBoosting {
    pub fn new(params: BoostingParams) -> Self {
        Self {
            params,
            init: Vec::new(),
            stages: Vec::new(),
            n_classes: 0,
            n_features: 0,
        }
    }

    fn raw_scores(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut raw = Array2::<f64>::zeros((x.nrows(), self.n_classes));
        for (i, row) in x.rows().into_iter().enumerate() {
            for k in 0..self.n_classes {
                raw[[i, k]] = self.init[k];
            }
            for stage in &self.stages {
                for (k, tree) in stage.iter().enumerate() {
                    raw[[i, k]] += self.params.learning_rate * tree.leaf_value(row)[0];
                }
            }
        }
        raw
    }

    pub fn fit(&mut self, x: ArrayView2<f64>, y: &[usize], n_classes: usize) -> Result<()> {
        check_fit_inputs(x, y, n_classes)?;
        if self.params.n_estimators == 0 {
            bail!("gradient boosting needs at least one stage");
        }

        let n = x.nrows();
        let mut counts = vec![0.0; n_classes];
        for &c in y {
            counts[c] += 1.0;
        }
        let init: Vec<f64> = counts
            .iter()
            .map(|c| (c / n as f64).max(f64::EPSILON).ln())
            .collect();

        let tree_params = TreeParams::with_depth(self.params.max_depth);
        let all: Vec<usize> = (0..n).collect();
        let lr = self.params.learning_rate;
        let seed = self.params.seed;

        let mut raw = Array2::<f64>::zeros((n, n_classes));
        for mut row in raw.rows_mut() {
            for (k, v) in row.iter_mut().enumerate() {
                *v = init[k];
            }
        }

        let mut stages = Vec::with_capacity(self.params.n_estimators);
        for m in 0..self.params.n_estimators {
            let proba = softmax_rows(&raw);
            if m % 10 == 0 {
                debug!(stage = m, loss = log_loss(&proba, y), "boosting progress");
            }

            let trees = (0..n_classes)
                .into_par_iter()
                .map(|k| {
                    let residual: Vec<f64> = (0..n)
                        .map(|i| f64::from(u8::from(y[i] == k)) - proba[[i, k]])
                        .collect();
                    let mut rng =
                        ChaCha8Rng::seed_from_u64(derive_seed(seed, m * n_classes + k));
                    let mut tree =
                        DecisionTree::fit_regressor(x, &residual, &all, &tree_params, &mut rng)?;
                    newton_leaves(&mut tree, x, &residual, n_classes);
                    Ok(tree)
                })
                .collect::<Result<Vec<_>>>()?;

            for (i, row) in x.rows().into_iter().enumerate() {
                for (k, tree) in trees.iter().enumerate() {
                    raw[[i, k]] += lr * tree.leaf_value(row)[0];
                }
            }
            stages.push(trees);
        }

        debug!(
            stages = stages.len(),
            loss = log_loss(&softmax_rows(&raw), y),
            "gradient boosting fitted"
        );
        self.init = init;
        self.stages = stages;
        self.n_classes = n_classes;
        self.n_features = x.ncols();
        Ok(())
    }

    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if self.stages.is_empty() {
            bail!("gradient boosting model is not fitted");
        }
        check_width(self.n_features, x.ncols())?;
        Ok(softmax_rows(&self.raw_scores(x)))
    }

    pub fn feature_importances(&self) -> Vec<f64> {
        let mut total = vec![0.0; self.n_features];
        for tree in self.stages.iter().flatten() {
            for (t, v) in total.iter_mut().zip(&tree.importances) {
                *t += v;
            }
        }
        normalize(&total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::argmax;

    fn data() -> (Array2<f64>, Vec<usize>) {
        let mut rows = Vec::new();
        let mut y = Vec::new();
        for i in 0..45 {
            let class = i % 3;
            rows.extend_from_slice(&[(i % 5) as f64, class as f64 * 2.0 + (i as f64 * 0.1).cos() * 0.2]);
            y.push(class);
        }
        (Array2::from_shape_vec((45, 2), rows).unwrap(), y)
    }

    fn params() -> BoostingParams {
        BoostingParams {
            n_estimators: 20,
            max_depth: 2,
            learning_rate: 0.1,
            seed: 42,
        }
    }

    #[test]
    fn fits_training_data() {
        let (x, y) = data();
        let mut gb = GradientBoosting::new(params());
        gb.fit(x.view(), &y, 3).unwrap();
        assert_eq!(gb.stages.len(), 20);
        assert!(gb.stages.iter().all(|s| s.len() == 3));

        let proba = gb.predict_proba(x.view()).unwrap();
        for (row, &label) in proba.rows().into_iter().zip(&y) {
            assert!((row.sum() - 1.0).abs() < 1e-9);
            assert_eq!(argmax(row), label);
        }
        let imp = gb.feature_importances();
        assert!(imp[1] > imp[0]);
    }

    #[test]
    fn init_is_log_prior() {
        let (x, _) = data();
        let y: Vec<usize> = (0..45).map(|i| usize::from(i >= 15)).collect();
        let mut gb = GradientBoosting::new(BoostingParams {
            n_estimators: 1,
            ..params()
        });
        gb.fit(x.view(), &y, 2).unwrap();
        assert!((gb.init[0] - (1.0f64 / 3.0).ln()).abs() < 1e-12);
        assert!((gb.init[1] - (2.0f64 / 3.0).ln()).abs() < 1e-12);
    }

    #[test]
    fn loss_decreases_with_stages() {
        let (x, y) = data();
        let mut short = GradientBoosting::new(BoostingParams {
            n_estimators: 2,
            ..params()
        });
        let mut long = GradientBoosting::new(params());
        short.fit(x.view(), &y, 3).unwrap();
        long.fit(x.view(), &y, 3).unwrap();
        let a = log_loss(&short.predict_proba(x.view()).unwrap(), &y);
        let b = log_loss(&long.predict_proba(x.view()).unwrap(), &y);
        assert!(b < a);
    }

    #[test]
    fn deterministic_for_a_seed() {
        let (x, y) = data();
        let mut a = GradientBoosting::new(params());
        let mut b = GradientBoosting::new(params());
        a.fit(x.view(), &y, 3).unwrap();
        b.fit(x.view(), &y, 3).unwrap();
        assert_eq!(a, b);
    }
}
