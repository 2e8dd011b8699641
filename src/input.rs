use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use csv::{ReaderBuilder, WriterBuilder};
use tracing::info;

use crate::config::TrainerConfig;
use crate::synth::generate_synthetic_data;
use crate::utils::{FeatureTable, ID_COLUMN, LABEL_COLUMN, ThreatLabel};

/// Load the training table, generating synthetic data when the input file is absent.
pub fn load_data(config: &TrainerConfig) -> Result<FeatureTable> {
    let path = config.input_path();
    if !path.exists() {
        info!(path = %path.display(), "no existing data found, generating synthetic data");
        return generate_synthetic_data(config);
    }

    info!(path = %path.display(), "loading data");
    let table = read_csv(&path)?;
    info!(samples = table.len(), "loaded samples");
    Ok(table)
}

fn parse_cell(raw: &str) -> Result<Option<f64>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || matches!(trimmed, "NaN" | "nan" | "NA" | "null") {
        return Ok(None);
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|_| anyhow!("'{trimmed}' is not numeric"))?;
    Ok(if value.is_nan() { None } else { Some(value) })
}

/// Read a labeled table. Every column other than `tx_id` and `threat_type`
/// becomes a numeric feature, in file order.
pub fn read_csv(path: &Path) -> Result<FeatureTable> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let headers = reader
        .headers()
        .with_context(|| format!("failed to read CSV header from {}", path.display()))?
        .clone();

    let label_idx = headers
        .iter()
        .position(|h| h == LABEL_COLUMN)
        .ok_or_else(|| anyhow!("{} is missing required column '{LABEL_COLUMN}'", path.display()))?;
    let id_idx = headers.iter().position(|h| h == ID_COLUMN);
    let feature_idx: Vec<usize> = (0..headers.len())
        .filter(|&i| i != label_idx && Some(i) != id_idx)
        .collect();
    if feature_idx.is_empty() {
        bail!("{} has no feature columns", path.display());
    }

    let mut table = FeatureTable {
        columns: feature_idx.iter().map(|&i| headers[i].to_string()).collect(),
        ..FeatureTable::default()
    };

    for (n, record) in reader.records().enumerate() {
        // header is line 1
        let line = n + 2;
        let record = record.with_context(|| format!("malformed CSV at line {line}"))?;

        let label: ThreatLabel = record
            .get(label_idx)
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("bad label at line {line}"))?;
        let id = match id_idx {
            Some(i) => record.get(i).unwrap_or_default().to_string(),
            None => format!("row_{n}"),
        };

        let mut row = Vec::with_capacity(feature_idx.len());
        for &i in &feature_idx {
            let cell = parse_cell(record.get(i).unwrap_or_default()).with_context(|| {
                format!("bad value in column '{}' at line {line}", &headers[i])
            })?;
            row.push(cell);
        }

        table.ids.push(id);
        table.rows.push(row);
        table.labels.push(label);
    }

    if table.is_empty() {
        bail!("{} contains no data rows", path.display());
    }
    Ok(table)
}

/// Write `tx_id, <features>, threat_type`, overwriting `path`.
pub fn write_csv(path: &Path, table: &FeatureTable) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = WriterBuilder::new().from_writer(BufWriter::new(file));

    let mut header = Vec::with_capacity(table.columns.len() + 2);
    header.push(ID_COLUMN.to_string());
    header.extend(table.columns.iter().cloned());
    header.push(LABEL_COLUMN.to_string());
    writer.write_record(&header)?;

    for ((id, row), label) in table.ids.iter().zip(&table.rows).zip(&table.labels) {
        let mut fields = Vec::with_capacity(row.len() + 2);
        fields.push(id.clone());
        fields.extend(row.iter().map(|cell| match cell {
            Some(v) => v.to_string(),
            None => String::new(),
        }));
        fields.push(label.as_str().to_string());
        writer.write_record(&fields)?;
    }

    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reads_missing_cells_as_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("data.csv");
        fs::write(
            &path,
            "tx_id,gas_price,value,threat_type\ntx_0,1.5,,safe\ntx_1,NaN,2,phishing\n",
        )
        .unwrap();

        let table = read_csv(&path).expect("read");
        assert_eq!(table.columns, vec!["gas_price", "value"]);
        assert_eq!(table.rows[0], vec![Some(1.5), None]);
        assert_eq!(table.rows[1], vec![None, Some(2.0)]);
        assert_eq!(table.labels, vec![ThreatLabel::Safe, ThreatLabel::Phishing]);
        assert_eq!(table.missing_cells(), 2);
    }

    #[test]
    fn label_column_may_sit_anywhere() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("data.csv");
        fs::write(&path, "threat_type,a,b\nrug_pull,1,2\n").unwrap();
        let table = read_csv(&path).expect("read");
        assert_eq!(table.columns, vec!["a", "b"]);
        assert_eq!(table.ids, vec!["row_0"]);
        assert_eq!(table.labels, vec![ThreatLabel::RugPull]);
    }

    #[test]
    fn missing_label_column_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("data.csv");
        fs::write(&path, "tx_id,a\ntx_0,1\n").unwrap();
        let err = read_csv(&path).unwrap_err();
        assert!(err.to_string().contains("threat_type"));
    }

    #[test]
    fn non_numeric_feature_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("data.csv");
        fs::write(&path, "tx_id,a,threat_type\ntx_0,abc,safe\n").unwrap();
        assert!(read_csv(&path).is_err());
    }

    #[test]
    fn written_table_reads_back() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("out.csv");
        let table = FeatureTable {
            columns: vec!["a".into(), "b".into()],
            ids: vec!["tx_0".into(), "tx_1".into()],
            rows: vec![vec![Some(1e25), Some(0.5)], vec![None, Some(3.0)]],
            labels: vec![ThreatLabel::Phishing, ThreatLabel::Safe],
        };
        write_csv(&path, &table).expect("write");
        let back = read_csv(&path).expect("read");
        assert_eq!(back.columns, table.columns);
        assert_eq!(back.ids, table.ids);
        assert_eq!(back.rows, table.rows);
        assert_eq!(back.labels, table.labels);
    }

    #[test]
    fn load_data_generates_when_absent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = TrainerConfig {
            data_path: tmp.path().join("data"),
            model_path: tmp.path().join("models"),
            n_samples: 50,
            ..TrainerConfig::default()
        };
        config.ensure_dirs().unwrap();
        let table = load_data(&config).expect("generate");
        assert_eq!(table.len(), 50);
        assert!(config.synthetic_data_file().exists());

        // second call reads the file it just wrote
        let again = load_data(&config).expect("load");
        assert_eq!(again.len(), 50);
        assert_eq!(again.labels, table.labels);
    }
}
