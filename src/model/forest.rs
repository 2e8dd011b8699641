//! Bagged ensemble of Gini trees with `sqrt(n_features)` candidates per split.

use anyhow::{Result, bail};
use bincode::{Decode, Encode};
use ndarray::{Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::debug;

use super::tree::{DecisionTree, TreeParams};
use super::{check_fit_inputs, check_width, derive_seed, normalize};

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub bootstrap: bool,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct RandomForest {
    pub params: ForestParams,
    pub trees: Vec<DecisionTree>,
    pub n_classes: usize,
    pub n_features: usize,
}

impl RandomForest {
    pub fn new(params: ForestParams) -> Self {
        Self {
            params,
            trees: Vec::new(),
            n_classes: 0,
            n_features: 0,
        }
    }

    pub fn fit(&mut self, x: ArrayView2<f64>, y: &[usize], n_classes: usize) -> Result<()> {
        check_fit_inputs(x, y, n_classes)?;
        if self.params.n_estimators == 0 {
            bail!("random forest needs at least one tree");
        }

        let n = x.nrows();
        let max_features = ((x.ncols() as f64).sqrt() as usize).max(1);
        let tree_params = TreeParams {
            max_features: Some(max_features),
            ..TreeParams::with_depth(self.params.max_depth)
        };
        let bootstrap = self.params.bootstrap;
        let seed = self.params.seed;

        // each tree owns its RNG stream, so the result does not depend on scheduling
        let trees = (0..self.params.n_estimators)
            .into_par_iter()
            .map(|t| {
                let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, t));
                let samples: Vec<usize> = if bootstrap {
                    (0..n).map(|_| rng.gen_range(0..n)).collect()
                } else {
                    (0..n).collect()
                };
                DecisionTree::fit_classifier(x, y, n_classes, &samples, &tree_params, &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            trees = trees.len(),
            max_features,
            max_depth = self.params.max_depth,
            "random forest fitted"
        );
        self.trees = trees;
        self.n_classes = n_classes;
        self.n_features = x.ncols();
        Ok(())
    }

    /// Mean of the per-tree leaf class fractions.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        if self.trees.is_empty() {
            bail!("random forest is not fitted");
        }
        check_width(self.n_features, x.ncols())?;

        let mut proba = Array2::<f64>::zeros((x.nrows(), self.n_classes));
        for (i, row) in x.rows().into_iter().enumerate() {
            for tree in &self.trees {
                for (k, p) in tree.leaf_value(row).iter().enumerate() {
                    proba[[i, k]] += p;
                }
            }
        }
        proba.mapv_inplace(|p| p / self.trees.len() as f64);
        Ok(proba)
    }

    /// Per-tree normalised impurity decrease, averaged over trees.
    pub fn feature_importances(&self) -> Vec<f64> {
        let mut total = vec![0.0; self.n_features];
        for tree in &self.trees {
            for (t, v) in total.iter_mut().zip(normalize(&tree.importances)) {
                *t += v;
            }
        }
        normalize(&total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn blobs() -> (Array2<f64>, Vec<usize>) {
        let mut rows = Vec::new();
        let mut y = Vec::new();
        for i in 0..60 {
            let class = i % 3;
            let jitter = (i as f64 * 0.37).sin() * 0.3;
            rows.extend_from_slice(&[class as f64 * 5.0 + jitter, jitter, (i % 7) as f64]);
            y.push(class);
        }
        (Array2::from_shape_vec((60, 3), rows).unwrap(), y)
    }

    fn params(seed: u64) -> ForestParams {
        ForestParams {
            n_estimators: 15,
            max_depth: 4,
            bootstrap: true,
            seed,
        }
    }

    #[test]
    fn learns_separable_blobs() {
        let (x, y) = blobs();
        let mut rf = RandomForest::new(params(42));
        rf.fit(x.view(), &y, 3).unwrap();
        let proba = rf.predict_proba(x.view()).unwrap();
        for (row, &label) in proba.rows().into_iter().zip(&y) {
            assert!((row.sum() - 1.0).abs() < 1e-9);
            let best = super::super::argmax(row);
            assert_eq!(best, label);
        }
    }

    #[test]
    fn fitting_is_deterministic_for_a_seed() {
        let (x, y) = blobs();
        let mut a = RandomForest::new(params(9));
        let mut b = RandomForest::new(params(9));
        a.fit(x.view(), &y, 3).unwrap();
        b.fit(x.view(), &y, 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn importances_sum_to_one_and_favor_signal() {
        let (x, y) = blobs();
        let mut rf = RandomForest::new(params(1));
        rf.fit(x.view(), &y, 3).unwrap();
        let imp = rf.feature_importances();
        assert!((imp.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(imp[0] > imp[2]);
    }

    #[test]
    fn unfitted_forest_refuses_to_predict() {
        let (x, _) = blobs();
        assert!(RandomForest::new(params(0)).predict_proba(x.view()).is_err());
    }
}
