use anyhow::{Result, anyhow, bail};
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use crate::metrics::{ClassificationReport, accuracy, classification_report};
use crate::model::{Classifier, ModelSpec, TrainedModel};
use crate::plot::{TOP_FEATURES, render_feature_importance, top_features, write_svg};
use crate::preprocess::Preprocessed;
use crate::utils::CandidateScore;

/// Row indices of a train/test partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Stratified shuffle split. The test set holds `ceil(n * test_size)` rows,
/// shared out across classes in proportion to their size (largest remainder
/// first). A class with a single sample always stays in train.
pub fn stratified_split(y: &[usize], test_size: f64, seed: u64) -> Result<Split> {
    if !(0.0..1.0).contains(&test_size) || test_size == 0.0 {
        bail!("test_size must be in (0, 1), got {test_size}");
    }
    let n = y.len();
    if n < 2 {
        bail!("need at least 2 samples to split, got {n}");
    }

    let n_classes = y.iter().max().map_or(0, |m| m + 1);
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); n_classes];
    for (i, &c) in y.iter().enumerate() {
        by_class[c].push(i);
    }

    let n_test = ((n as f64 * test_size).ceil() as usize).clamp(1, n - 1);

    // quota per class, capped so every class keeps one training row
    let mut quota: Vec<usize> = Vec::with_capacity(n_classes);
    let mut remainders: Vec<(usize, f64)> = Vec::new();
    for (c, members) in by_class.iter().enumerate() {
        let exact = members.len() as f64 * n_test as f64 / n as f64;
        let cap = members.len().saturating_sub(1);
        let q = (exact.floor() as usize).min(cap);
        quota.push(q);
        if q < cap {
            remainders.push((c, exact - exact.floor()));
        }
    }
    remainders.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut missing = n_test.saturating_sub(quota.iter().sum());
    for (c, _) in remainders {
        if missing == 0 {
            break;
        }
        quota[c] += 1;
        missing -= 1;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut split = Split {
        train: Vec::with_capacity(n - n_test),
        test: Vec::with_capacity(n_test),
    };
    for (c, members) in by_class.iter_mut().enumerate() {
        if members.len() == 1 {
            warn!(class = c, "class has a single sample; keeping it in the training split");
        }
        members.shuffle(&mut rng);
        split.test.extend_from_slice(&members[..quota[c]]);
        split.train.extend_from_slice(&members[quota[c]..]);
    }
    split.train.shuffle(&mut rng);
    split.test.shuffle(&mut rng);
    Ok(split)
}

/// Held-out results of the selected model.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub model: TrainedModel,
    pub scores: Vec<CandidateScore>,
    pub best_accuracy: f64,
    pub x_test: Array2<f64>,
    pub y_test: Vec<usize>,
    pub y_pred: Vec<usize>,
    pub report: ClassificationReport,
}

impl TrainingOutcome {
    pub fn winner(&self) -> &'static str {
        self.model.name()
    }
}

pub struct Trainer {
    candidates: Vec<ModelSpec>,
    test_size: f64,
    seed: u64,
}

impl Trainer {
    pub fn new(candidates: Vec<ModelSpec>, test_size: f64, seed: u64) -> Self {
        Self {
            candidates,
            test_size,
            seed,
        }
    }

    /// Fit every candidate on the train split and keep the most accurate on
    /// the held-out split. Ties keep the earlier candidate.
    pub fn train(&self, data: &Preprocessed) -> Result<TrainingOutcome> {
        if self.candidates.is_empty() {
            bail!("no candidate models configured");
        }
        info!(candidates = self.candidates.len(), "training threat detection model");

        let split = stratified_split(&data.y, self.test_size, self.seed)?;
        let x_train = data.x.select(Axis(0), &split.train);
        let x_test = data.x.select(Axis(0), &split.test);
        let y_train: Vec<usize> = split.train.iter().map(|&i| data.y[i]).collect();
        let y_test: Vec<usize> = split.test.iter().map(|&i| data.y[i]).collect();
        let n_classes = data.encoder.n_classes();
        info!(train = y_train.len(), test = y_test.len(), "stratified split");

        let mut best: Option<(TrainedModel, f64, Vec<usize>)> = None;
        let mut scores = Vec::with_capacity(self.candidates.len());
        for spec in &self.candidates {
            let mut model = spec.build();
            info!(model = model.name(), "training candidate");
            model.fit(x_train.view(), &y_train, n_classes)?;
            let y_pred = model.predict(x_test.view())?;
            let acc = accuracy(&y_test, &y_pred)?;
            info!(model = model.name(), accuracy = acc, "candidate evaluated");
            scores.push(CandidateScore {
                name: model.name().to_string(),
                accuracy: acc,
            });

            if best.as_ref().is_none_or(|(_, b, _)| acc > *b) {
                best = Some((model, acc, y_pred));
            }
        }

        let (model, best_accuracy, y_pred) =
            best.ok_or_else(|| anyhow!("no candidate produced a model"))?;
        info!(model = model.name(), accuracy = best_accuracy, "selected best model");

        let report = classification_report(&y_test, &y_pred, &data.encoder.class_names())?;
        println!("\nClassification Report:");
        println!("{report}");

        Ok(TrainingOutcome {
            model,
            scores,
            best_accuracy,
            x_test,
            y_test,
            y_pred,
            report,
        })
    }
}

/// Render the top-feature bar chart when the model exposes importances.
/// Returns whether a chart was written.
pub fn plot_feature_importance(
    model: &TrainedModel,
    feature_names: &[String],
    path: &std::path::Path,
) -> Result<bool> {
    let Some(importances) = model.feature_importances() else {
        return Ok(false);
    };
    let ranked = top_features(feature_names, &importances, TOP_FEATURES);
    write_svg(path, &render_feature_importance(&ranked))?;
    info!(path = %path.display(), "feature importance plot saved");
    Ok(true)
}
