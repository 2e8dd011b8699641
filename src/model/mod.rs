//! Candidate classifiers behind one interface.
//!
//! # Submodules
//! - [`tree`]    : CART tree used by both ensembles
//! - [`forest`]  : bagged Gini trees
//! - [`boosting`]: multinomial gradient boosting
//!
//! [`ModelSpec`] describes an unfitted candidate; [`TrainedModel`] is the
//! serialisable fitted form and implements [`Classifier`].

pub mod boosting;
pub mod forest;
pub mod tree;

use anyhow::{Context, Result, bail};
use bincode::{Decode, Encode};
use ndarray::{Array2, ArrayView1, ArrayView2};

pub use boosting::{BoostingParams, GradientBoosting};
pub use forest::{ForestParams, RandomForest};

/// Uniform surface the trainer iterates over.
pub trait Classifier {
    /// Short family name, e.g. `RandomForest`.
    fn name(&self) -> &'static str;
    /// Model kind recorded in metadata.
    fn model_type(&self) -> &'static str;
    fn fit(&mut self, x: ArrayView2<f64>, y: &[usize], n_classes: usize) -> Result<()>;
    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>>;
    /// `None` when the family has no notion of feature importance.
    fn feature_importances(&self) -> Option<Vec<f64>>;

    fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<usize>> {
        let proba = self.predict_proba(x)?;
        Ok(proba.rows().into_iter().map(argmax).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum TrainedModel {
    RandomForest(RandomForest),
    GradientBoosting(GradientBoosting),
}

impl Classifier for TrainedModel {
    fn name(&self) -> &'static str {
        match self {
            TrainedModel::RandomForest(_) => "RandomForest",
            TrainedModel::GradientBoosting(_) => "GradientBoosting",
        }
    }

    fn model_type(&self) -> &'static str {
        match self {
            TrainedModel::RandomForest(_) => "RandomForestClassifier",
            TrainedModel::GradientBoosting(_) => "GradientBoostingClassifier",
        }
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: &[usize], n_classes: usize) -> Result<()> {
        match self {
            TrainedModel::RandomForest(m) => m.fit(x, y, n_classes),
            TrainedModel::GradientBoosting(m) => m.fit(x, y, n_classes),
        }
    }

    fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        match self {
            TrainedModel::RandomForest(m) => m.predict_proba(x),
            TrainedModel::GradientBoosting(m) => m.predict_proba(x),
        }
    }

    fn feature_importances(&self) -> Option<Vec<f64>> {
        match self {
            TrainedModel::RandomForest(m) => Some(m.feature_importances()),
            TrainedModel::GradientBoosting(m) => Some(m.feature_importances()),
        }
    }
}

impl TrainedModel {
    pub fn n_features(&self) -> usize {
        match self {
            TrainedModel::RandomForest(m) => m.n_features,
            TrainedModel::GradientBoosting(m) => m.n_features,
        }
    }

    pub fn n_classes(&self) -> usize {
        match self {
            TrainedModel::RandomForest(m) => m.n_classes,
            TrainedModel::GradientBoosting(m) => m.n_classes,
        }
    }

    /// Structural check for a decoded model, so prediction cannot index out
    /// of bounds or loop on a corrupt artifact.
    pub fn validate(&self) -> Result<()> {
        let n_features = self.n_features();
        match self {
            TrainedModel::RandomForest(m) => {
                if m.trees.is_empty() {
                    bail!("random forest has no trees");
                }
                for (t, tree) in m.trees.iter().enumerate() {
                    check_tree(tree, n_features, m.n_classes)
                        .with_context(|| format!("random forest tree {t}"))?;
                }
            }
            TrainedModel::GradientBoosting(m) => {
                if m.stages.is_empty() {
                    bail!("gradient boosting model has no stages");
                }
                if m.init.len() != m.n_classes {
                    bail!(
                        "{} prior scores for {} classes",
                        m.init.len(),
                        m.n_classes
                    );
                }
                for (s, stage) in m.stages.iter().enumerate() {
                    if stage.len() != m.n_classes {
                        bail!("stage {s} has {} trees for {} classes", stage.len(), m.n_classes);
                    }
                    for (k, tree) in stage.iter().enumerate() {
                        check_tree(tree, n_features, 1)
                            .with_context(|| format!("boosting stage {s} class {k}"))?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_tree(tree: &tree::DecisionTree, n_features: usize, value_width: usize) -> Result<()> {
    if tree.n_features != n_features {
        bail!("tree expects {} features, model {}", tree.n_features, n_features);
    }
    tree.validate(value_width)
}

/// Unfitted candidate configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSpec {
    RandomForest(ForestParams),
    GradientBoosting(BoostingParams),
}

impl ModelSpec {
    pub fn build(&self) -> TrainedModel {
        match self {
            ModelSpec::RandomForest(p) => TrainedModel::RandomForest(RandomForest::new(p.clone())),
            ModelSpec::GradientBoosting(p) => {
                TrainedModel::GradientBoosting(GradientBoosting::new(p.clone()))
            }
        }
    }
}

/// The two production candidates, in evaluation order.
pub fn default_candidates(seed: u64) -> Vec<ModelSpec> {
    vec![
        ModelSpec::RandomForest(ForestParams {
            n_estimators: 100,
            max_depth: 10,
            bootstrap: true,
            seed,
        }),
        ModelSpec::GradientBoosting(BoostingParams {
            n_estimators: 100,
            max_depth: 6,
            learning_rate: 0.1,
            seed,
        }),
    ]
}

/// Index of the first maximum.
pub fn argmax(row: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, v) in row.iter().enumerate() {
        if *v > row[best] {
            best = i;
        }
    }
    best
}

pub(crate) fn softmax_rows(raw: &Array2<f64>) -> Array2<f64> {
    let mut out = raw.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

pub(crate) fn normalize(values: &[f64]) -> Vec<f64> {
    let sum: f64 = values.iter().sum();
    if sum > 0.0 {
        values.iter().map(|v| v / sum).collect()
    } else {
        vec![0.0; values.len()]
    }
}

/// Per-tree RNG seed so parallel fitting stays reproducible.
pub(crate) fn derive_seed(seed: u64, stream: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(stream as u64)
}

pub(crate) fn check_fit_inputs(x: ArrayView2<f64>, y: &[usize], n_classes: usize) -> Result<()> {
    if x.nrows() == 0 {
        bail!("cannot fit on an empty matrix");
    }
    if x.nrows() != y.len() {
        bail!("{} rows but {} labels", x.nrows(), y.len());
    }
    if n_classes == 0 {
        bail!("need at least one class");
    }
    if x.iter().any(|v| !v.is_finite()) {
        bail!("input contains non-finite values");
    }
    Ok(())
}

pub(crate) fn check_width(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        bail!("model expects {expected} features, got {got}");
    }
    Ok(())
}
