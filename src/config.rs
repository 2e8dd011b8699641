use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Default file name for generated training data inside `data_path`.
pub const SYNTHETIC_DATA_FILE: &str = "synthetic_threat_data.csv";

/// Run configuration handed to every pipeline stage.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Where synthetic/input data is read or written.
    pub data_path: PathBuf,
    /// Where all artifacts are written.
    pub model_path: PathBuf,
    /// Explicit input CSV; defaults to the synthetic data file under `data_path`.
    pub input_file: Option<PathBuf>,
    pub n_samples: usize,
    pub seed: u64,
    pub test_size: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data"),
            model_path: PathBuf::from("./models"),
            input_file: None,
            n_samples: 10_000,
            seed: 42,
            test_size: 0.2,
        }
    }
}

impl TrainerConfig {
    pub fn synthetic_data_file(&self) -> PathBuf {
        self.data_path.join(SYNTHETIC_DATA_FILE)
    }

    /// The CSV the loader looks at first.
    pub fn input_path(&self) -> PathBuf {
        self.input_file
            .clone()
            .unwrap_or_else(|| self.synthetic_data_file())
    }

    pub fn artifact(&self, name: &str) -> PathBuf {
        self.model_path.join(name)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        create_dir(&self.data_path)?;
        create_dir(&self.model_path)?;
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create dir {}", path.display()))
}
