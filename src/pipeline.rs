use anyhow::Result;
use tracing::info;

use crate::config::TrainerConfig;
use crate::evaluator::evaluate_and_plot;
use crate::input::load_data;
use crate::model::{ModelSpec, default_candidates};
use crate::persist::{ArtifactSet, save_model};
use crate::preprocess::preprocess;
use crate::trainer::{Trainer, plot_feature_importance};
use crate::utils::PipelineSummary;

pub const FEATURE_IMPORTANCE_PLOT: &str = "feature_importance.svg";
pub const CONFUSION_MATRIX_PLOT: &str = "confusion_matrix.svg";

/// Load or generate → preprocess → train → evaluate → persist, with the
/// production candidate list.
pub fn run(config: &TrainerConfig) -> Result<PipelineSummary> {
    run_with_candidates(config, default_candidates(config.seed))
}

pub fn run_with_candidates(
    config: &TrainerConfig,
    candidates: Vec<ModelSpec>,
) -> Result<PipelineSummary> {
    config.ensure_dirs()?;

    let table = load_data(config)?;
    let data = preprocess(&table)?;

    let outcome = Trainer::new(candidates, config.test_size, config.seed).train(&data)?;

    let mut artifacts = Vec::new();
    let importance_path = config.artifact(FEATURE_IMPORTANCE_PLOT);
    if plot_feature_importance(&outcome.model, &data.feature_names, &importance_path)? {
        artifacts.push(importance_path);
    }

    let heatmap_path = config.artifact(CONFUSION_MATRIX_PLOT);
    evaluate_and_plot(&outcome.y_test, &outcome.y_pred, &data.encoder, &heatmap_path)?;
    artifacts.push(heatmap_path);

    let saved = save_model(
        &config.model_path,
        &ArtifactSet {
            model: &outcome.model,
            scaler: &data.scaler,
            encoder: &data.encoder,
            imputer: &data.imputer,
        },
    )?;
    artifacts.extend(saved.paths);

    info!(path = %config.model_path.display(), "training completed");
    Ok(PipelineSummary {
        samples: table.len(),
        features: data.feature_names.len(),
        candidates: outcome.scores.clone(),
        winner: outcome.winner().to_string(),
        held_out_accuracy: outcome.best_accuracy,
        onnx_exported: saved.onnx_exported,
        artifacts,
        model_dir: config.model_path.clone(),
    })
}
