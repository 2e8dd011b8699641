//! Artifact persistence and reload.
//!
//! The fitted model, scaler, label encoder and imputer are written as
//! independent bincode files next to a JSON metadata document. The ONNX
//! export is best-effort: a failure is logged and the run continues.

pub mod onnx;

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use bincode::{Decode, Encode};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{Classifier, TrainedModel};
use crate::preprocess::{LabelEncoder, MedianImputer, StandardScaler};
use crate::utils::ThreatLabel;

pub const MODEL_FILE: &str = "threat_detector.bin";
pub const SCALER_FILE: &str = "scaler.bin";
pub const ENCODER_FILE: &str = "label_encoder.bin";
pub const IMPUTER_FILE: &str = "imputer.bin";
pub const ONNX_FILE: &str = "threat_detection.onnx";
pub const METADATA_FILE: &str = "model_metadata.json";
pub const MODEL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_type: String,
    /// Column order the scaler was fit on; inference vectors must follow it.
    pub feature_names: Vec<String>,
    pub threat_categories: Vec<String>,
    pub training_date: String,
    pub model_version: String,
}

impl ModelMetadata {
    pub fn new(model: &TrainedModel, scaler: &StandardScaler, encoder: &LabelEncoder) -> Self {
        Self {
            model_type: model.model_type().to_string(),
            feature_names: scaler.feature_names.clone(),
            threat_categories: encoder.class_names(),
            training_date: chrono::Local::now().to_rfc3339(),
            model_version: MODEL_VERSION.to_string(),
        }
    }
}

/// Fitted pieces that make up a deployable pipeline.
pub struct ArtifactSet<'a> {
    pub model: &'a TrainedModel,
    pub scaler: &'a StandardScaler,
    pub encoder: &'a LabelEncoder,
    pub imputer: &'a MedianImputer,
}

#[derive(Debug, Clone)]
pub struct SavedArtifacts {
    pub paths: Vec<PathBuf>,
    pub onnx_exported: bool,
    pub metadata: ModelMetadata,
}

fn write_artifact<T: Encode>(path: &Path, value: &T) -> Result<()> {
    let bytes = bincode::encode_to_vec(value, bincode::config::standard())
        .with_context(|| format!("failed to encode {}", path.display()))?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn read_artifact<T: Decode<()>>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let (value, _) = bincode::decode_from_slice(&bytes, bincode::config::standard())
        .with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(value)
}

fn export_onnx(path: &Path, set: &ArtifactSet<'_>) -> Result<()> {
    let bytes = onnx::encode_model(set.model, &set.scaler.feature_names, MODEL_VERSION)?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

/// Drop an artifact left by an earlier run so it cannot outlive this one.
fn remove_stale(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            warn!(path = %path.display(), "removed stale artifact from a previous run");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Write every artifact under `model_path`, overwriting existing files.
pub fn save_model(model_path: &Path, set: &ArtifactSet<'_>) -> Result<SavedArtifacts> {
    info!(path = %model_path.display(), "saving model");
    let mut paths = Vec::new();

    let model_file = model_path.join(MODEL_FILE);
    write_artifact(&model_file, set.model)?;
    paths.push(model_file);

    let scaler_file = model_path.join(SCALER_FILE);
    write_artifact(&scaler_file, set.scaler)?;
    paths.push(scaler_file);

    let encoder_file = model_path.join(ENCODER_FILE);
    write_artifact(&encoder_file, set.encoder)?;
    paths.push(encoder_file);

    let imputer_file = model_path.join(IMPUTER_FILE);
    write_artifact(&imputer_file, set.imputer)?;
    paths.push(imputer_file);

    let onnx_file = model_path.join(ONNX_FILE);
    let onnx_exported = match export_onnx(&onnx_file, set) {
        Ok(()) => {
            info!(path = %onnx_file.display(), "ONNX model saved");
            paths.push(onnx_file);
            true
        }
        Err(e) => {
            warn!(err = %format!("{e:#}"), "could not save ONNX model");
            remove_stale(&onnx_file)?;
            false
        }
    };

    let metadata = ModelMetadata::new(set.model, set.scaler, set.encoder);
    let metadata_file = model_path.join(METADATA_FILE);
    let file = File::create(&metadata_file)
        .with_context(|| format!("failed to create {}", metadata_file.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &metadata)
        .with_context(|| format!("failed to write {}", metadata_file.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", metadata_file.display()))?;
    paths.push(metadata_file);

    info!(files = paths.len(), onnx_exported, "model saved successfully");
    Ok(SavedArtifacts {
        paths,
        onnx_exported,
        metadata,
    })
}

pub fn read_metadata(model_path: &Path) -> Result<ModelMetadata> {
    let path = model_path.join(METADATA_FILE);
    let text =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: ThreatLabel,
    pub confidence: f64,
    /// Probability per encoder class, in encoder order.
    pub probabilities: Vec<(ThreatLabel, f64)>,
}

/// Reloaded artifacts applying exactly the fit-time transforms.
#[derive(Debug, Clone)]
pub struct InferencePipeline {
    pub model: TrainedModel,
    pub scaler: StandardScaler,
    pub encoder: LabelEncoder,
    pub imputer: MedianImputer,
    pub metadata: ModelMetadata,
}

pub fn load_artifacts(model_path: &Path) -> Result<InferencePipeline> {
    let pipeline = InferencePipeline {
        model: read_artifact(&model_path.join(MODEL_FILE))?,
        scaler: read_artifact(&model_path.join(SCALER_FILE))?,
        encoder: read_artifact(&model_path.join(ENCODER_FILE))?,
        imputer: read_artifact(&model_path.join(IMPUTER_FILE))?,
        metadata: read_metadata(model_path)?,
    };
    if pipeline.metadata.feature_names != pipeline.scaler.feature_names {
        bail!("metadata feature order does not match the fitted scaler");
    }
    pipeline
        .model
        .validate()
        .with_context(|| format!("corrupt model in {}", model_path.join(MODEL_FILE).display()))?;
    let n_features = pipeline.metadata.feature_names.len();
    if pipeline.model.n_features() != n_features || pipeline.imputer.medians.len() != n_features {
        bail!(
            "metadata lists {n_features} features but model expects {} and imputer {}",
            pipeline.model.n_features(),
            pipeline.imputer.medians.len()
        );
    }
    if pipeline.model.n_classes() != pipeline.encoder.n_classes() {
        bail!(
            "model predicts {} classes but encoder knows {}",
            pipeline.model.n_classes(),
            pipeline.encoder.n_classes()
        );
    }
    info!(
        path = %model_path.display(),
        model = pipeline.model.name(),
        features = pipeline.metadata.feature_names.len(),
        "loaded model artifacts"
    );
    Ok(pipeline)
}

impl InferencePipeline {
    /// Classify one raw (unscaled) feature vector in metadata feature order.
    /// Non-finite values are imputed with the fit-time medians.
    pub fn predict(&self, features: &[f64]) -> Result<Prediction> {
        let expected = self.metadata.feature_names.len();
        if features.len() != expected {
            bail!("expected {expected} features, got {}", features.len());
        }
        let mut raw = features.to_vec();
        self.imputer.fill(&mut raw);
        let row = Array2::from_shape_vec((1, expected), raw)?;
        let scaled = self.scaler.transform(row.view())?;
        let proba = self.model.predict_proba(scaled.view())?;
        let proba = proba.row(0);

        let best = crate::model::argmax(proba);
        let probabilities = self
            .encoder
            .classes
            .iter()
            .zip(proba.iter())
            .map(|(label, p)| (*label, *p))
            .collect();
        Ok(Prediction {
            label: self.encoder.decode(best)?,
            confidence: proba[best],
            probabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ForestParams, ModelSpec};
    use crate::preprocess::preprocess;
    use crate::synth::generate_records;
    use crate::utils::{FEATURE_NAMES, FeatureTable};
    use tempfile::TempDir;

    fn fitted_pipeline() -> (TrainedModel, crate::preprocess::Preprocessed) {
        let (records, _) = generate_records(300, 5);
        let data = preprocess(&FeatureTable::from_records(&records)).unwrap();
        let mut model = ModelSpec::RandomForest(ForestParams {
            n_estimators: 5,
            max_depth: 4,
            bootstrap: true,
            seed: 5,
        })
        .build();
        model
            .fit(data.x.view(), &data.y, data.encoder.n_classes())
            .unwrap();
        (model, data)
    }

    #[test]
    fn save_then_reload_predicts_like_the_fitted_model() {
        let dir = TempDir::new().unwrap();
        let (model, data) = fitted_pipeline();
        let saved = save_model(
            dir.path(),
            &ArtifactSet {
                model: &model,
                scaler: &data.scaler,
                encoder: &data.encoder,
                imputer: &data.imputer,
            },
        )
        .unwrap();
        assert!(saved.onnx_exported);
        assert_eq!(saved.paths.len(), 6);
        for path in &saved.paths {
            assert!(path.exists(), "{} missing", path.display());
        }

        let loaded = load_artifacts(dir.path()).unwrap();
        assert_eq!(loaded.model, model);
        assert_eq!(loaded.metadata.feature_names, FEATURE_NAMES.map(String::from).to_vec());
        assert_eq!(loaded.metadata.model_type, "RandomForestClassifier");
        assert_eq!(loaded.metadata.model_version, MODEL_VERSION);

        let (records, _) = generate_records(20, 99);
        let table = FeatureTable::from_records(&records);
        let raw = data.imputer.transform(&table).unwrap();
        let expected = model
            .predict(data.scaler.transform(raw.view()).unwrap().view())
            .unwrap();
        for (i, record) in records.iter().enumerate() {
            let prediction = loaded.predict(&record.features()).unwrap();
            assert_eq!(prediction.label, data.encoder.decode(expected[i]).unwrap());
            let total: f64 = prediction.probabilities.iter().map(|(_, p)| p).sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert!(prediction.confidence > 0.0 && prediction.confidence <= 1.0);
        }
    }

    #[test]
    fn predict_imputes_missing_values() {
        let dir = TempDir::new().unwrap();
        let (model, data) = fitted_pipeline();
        save_model(
            dir.path(),
            &ArtifactSet {
                model: &model,
                scaler: &data.scaler,
                encoder: &data.encoder,
                imputer: &data.imputer,
            },
        )
        .unwrap();
        let loaded = load_artifacts(dir.path()).unwrap();

        let with_nan = loaded.predict(&[f64::NAN; 19]).unwrap();
        let with_medians = loaded.predict(&data.imputer.medians).unwrap();
        assert_eq!(with_nan, with_medians);
        assert!(loaded.predict(&[0.0; 3]).is_err());
    }

    #[test]
    fn onnx_failure_does_not_abort_save() {
        let dir = TempDir::new().unwrap();
        let (_, data) = fitted_pipeline();
        let unfitted = ModelSpec::RandomForest(ForestParams {
            n_estimators: 2,
            max_depth: 2,
            bootstrap: false,
            seed: 0,
        })
        .build();
        let stale = dir.path().join(ONNX_FILE);
        fs::write(&stale, b"graph from an earlier run").unwrap();
        let saved = save_model(
            dir.path(),
            &ArtifactSet {
                model: &unfitted,
                scaler: &data.scaler,
                encoder: &data.encoder,
                imputer: &data.imputer,
            },
        )
        .unwrap();
        assert!(!saved.onnx_exported);
        assert!(!stale.exists(), "stale ONNX graph must not survive a failed export");
        assert!(!saved.paths.contains(&stale));
        assert!(dir.path().join(MODEL_FILE).exists());
        assert!(dir.path().join(METADATA_FILE).exists());
    }

    #[test]
    fn mismatched_metadata_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (model, data) = fitted_pipeline();
        save_model(
            dir.path(),
            &ArtifactSet {
                model: &model,
                scaler: &data.scaler,
                encoder: &data.encoder,
                imputer: &data.imputer,
            },
        )
        .unwrap();

        let mut metadata = read_metadata(dir.path()).unwrap();
        metadata.feature_names.reverse();
        fs::write(
            dir.path().join(METADATA_FILE),
            serde_json::to_string(&metadata).unwrap(),
        )
        .unwrap();
        assert!(load_artifacts(dir.path()).is_err());
    }

    #[test]
    fn metadata_timestamp_is_rfc3339() {
        let (model, data) = fitted_pipeline();
        let metadata = ModelMetadata::new(&model, &data.scaler, &data.encoder);
        assert!(chrono::DateTime::parse_from_rfc3339(&metadata.training_date).is_ok());
        assert_eq!(metadata.threat_categories, data.encoder.class_names());
    }

    #[test]
    fn metadata_file_is_complete_json() {
        let dir = TempDir::new().unwrap();
        let (model, data) = fitted_pipeline();
        let saved = save_model(
            dir.path(),
            &ArtifactSet {
                model: &model,
                scaler: &data.scaler,
                encoder: &data.encoder,
                imputer: &data.imputer,
            },
        )
        .unwrap();
        assert_eq!(read_metadata(dir.path()).unwrap(), saved.metadata);
    }

    #[test]
    fn corrupt_model_is_rejected_on_load() {
        let dir = TempDir::new().unwrap();
        let (model, data) = fitted_pipeline();
        let mut corrupt = model.clone();
        if let TrainedModel::RandomForest(rf) = &mut corrupt {
            for node in &mut rf.trees[0].nodes {
                if let Some(split) = node.split.as_mut() {
                    split.left = 10_000;
                }
            }
            rf.trees[0].nodes[0].value.clear();
        }
        save_model(
            dir.path(),
            &ArtifactSet {
                model: &model,
                scaler: &data.scaler,
                encoder: &data.encoder,
                imputer: &data.imputer,
            },
        )
        .unwrap();
        write_artifact(&dir.path().join(MODEL_FILE), &corrupt).unwrap();

        let err = load_artifacts(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("corrupt model"));
    }
}
