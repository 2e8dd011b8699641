//! Feature preparation: median imputation, standardization and label encoding.
//!
//! All three transforms are fit once on the training table and persisted, so
//! inference applies exactly the statistics seen at fit time.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow, bail};
use bincode::{Decode, Encode};
use ndarray::{Array2, ArrayView2, Axis};
use tracing::info;

use crate::utils::{FeatureTable, ThreatLabel};

/// Per-column median fill for missing cells.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct MedianImputer {
    pub medians: Vec<f64>,
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

impl MedianImputer {
    pub fn fit(table: &FeatureTable) -> Result<Self> {
        let mut medians = Vec::with_capacity(table.columns.len());
        for (j, name) in table.columns.iter().enumerate() {
            let mut observed: Vec<f64> = table.rows.iter().filter_map(|row| row[j]).collect();
            let m = median(&mut observed)
                .ok_or_else(|| anyhow!("column '{name}' has no observed values to impute from"))?;
            medians.push(m);
        }
        Ok(Self { medians })
    }

    pub fn transform(&self, table: &FeatureTable) -> Result<Array2<f64>> {
        let n_features = self.medians.len();
        if table.columns.len() != n_features {
            bail!(
                "imputer fit on {} columns, table has {}",
                n_features,
                table.columns.len()
            );
        }
        let mut x = Array2::<f64>::zeros((table.len(), n_features));
        for (i, row) in table.rows.iter().enumerate() {
            for (j, cell) in row.iter().enumerate() {
                x[[i, j]] = cell.unwrap_or(self.medians[j]);
            }
        }
        Ok(x)
    }

    /// Fill non-finite entries of a raw feature vector in place.
    pub fn fill(&self, features: &mut [f64]) {
        for (v, m) in features.iter_mut().zip(&self.medians) {
            if !v.is_finite() {
                *v = *m;
            }
        }
    }
}

/// Zero-mean, unit-variance scaling with population statistics.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct StandardScaler {
    pub feature_names: Vec<String>,
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(x: ArrayView2<f64>, feature_names: &[String]) -> Result<Self> {
        if x.nrows() == 0 {
            bail!("cannot fit scaler on an empty matrix");
        }
        if x.ncols() != feature_names.len() {
            bail!(
                "scaler got {} columns but {} feature names",
                x.ncols(),
                feature_names.len()
            );
        }
        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow!("cannot compute column means"))?;
        let std = x.std_axis(Axis(0), 0.0);
        Ok(Self {
            feature_names: feature_names.to_vec(),
            mean: mean.to_vec(),
            // constant columns are left unscaled
            scale: std
                .iter()
                .map(|&s| if s > 0.0 && s.is_finite() { s } else { 1.0 })
                .collect(),
        })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.check_width(x.ncols())?;
        let mut out = x.to_owned();
        for mut row in out.rows_mut() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = (*v - self.mean[j]) / self.scale[j];
            }
        }
        Ok(out)
    }

    pub fn inverse_transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.check_width(x.ncols())?;
        let mut out = x.to_owned();
        for mut row in out.rows_mut() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = *v * self.scale[j] + self.mean[j];
            }
        }
        Ok(out)
    }

    fn check_width(&self, ncols: usize) -> Result<()> {
        if ncols != self.n_features() {
            bail!("scaler fit on {} features, got {}", self.n_features(), ncols);
        }
        Ok(())
    }
}

/// Label ↔ dense index mapping. Class order is the alphabetical order of the
/// label strings seen at fit time.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct LabelEncoder {
    pub classes: Vec<ThreatLabel>,
}

impl LabelEncoder {
    pub fn fit(labels: &[ThreatLabel]) -> Result<Self> {
        if labels.is_empty() {
            bail!("cannot fit label encoder on an empty label set");
        }
        let mut classes: Vec<ThreatLabel> = Vec::new();
        for label in labels {
            if !classes.contains(label) {
                classes.push(*label);
            }
        }
        classes.sort_by_key(|c| c.as_str());
        Ok(Self { classes })
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn encode(&self, label: ThreatLabel) -> Result<usize> {
        self.classes
            .iter()
            .position(|c| *c == label)
            .ok_or_else(|| anyhow!("label '{label}' was not seen when the encoder was fit"))
    }

    pub fn transform(&self, labels: &[ThreatLabel]) -> Result<Vec<usize>> {
        labels.iter().map(|l| self.encode(*l)).collect()
    }

    pub fn decode(&self, index: usize) -> Result<ThreatLabel> {
        self.classes
            .get(index)
            .copied()
            .ok_or_else(|| anyhow!("label index {index} out of range ({} classes)", self.n_classes()))
    }

    pub fn inverse_transform(&self, indices: &[usize]) -> Result<Vec<ThreatLabel>> {
        indices.iter().map(|&i| self.decode(i)).collect()
    }

    pub fn class_names(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.as_str().to_string()).collect()
    }
}

/// Model-ready data plus the fitted transforms that produced it.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub x: Array2<f64>,
    pub y: Vec<usize>,
    pub feature_names: Vec<String>,
    pub imputer: MedianImputer,
    pub scaler: StandardScaler,
    pub encoder: LabelEncoder,
}

/// `(label, count, percent)` sorted by descending count, then label.
pub fn label_distribution(labels: &[ThreatLabel]) -> Vec<(ThreatLabel, usize, f64)> {
    let mut counts: BTreeMap<&'static str, (ThreatLabel, usize)> = BTreeMap::new();
    for label in labels {
        counts.entry(label.as_str()).or_insert((*label, 0)).1 += 1;
    }
    let total = labels.len().max(1) as f64;
    let mut rows: Vec<(ThreatLabel, usize, f64)> = counts
        .into_values()
        .map(|(label, count)| (label, count, count as f64 / total * 100.0))
        .collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1));
    rows
}

pub fn preprocess(table: &FeatureTable) -> Result<Preprocessed> {
    info!(rows = table.len(), "preprocessing data");
    if table.is_empty() {
        bail!("no samples to preprocess");
    }

    let imputer = MedianImputer::fit(table)?;
    let raw = imputer.transform(table)?;
    let feature_names = table.columns.clone();
    let scaler = StandardScaler::fit(raw.view(), &feature_names)?;
    let x = scaler.transform(raw.view())?;
    let encoder = LabelEncoder::fit(&table.labels)?;
    let y = encoder.transform(&table.labels)?;

    info!(
        samples = x.nrows(),
        features = x.ncols(),
        imputed = table.missing_cells(),
        "preprocessed data"
    );
    println!("Threat distribution:");
    for (label, count, pct) in label_distribution(&table.labels) {
        println!("   {label}: {count} ({pct:.1}%)");
    }

    Ok(Preprocessed {
        x,
        y,
        feature_names,
        imputer,
        scaler,
        encoder,
    })
}
