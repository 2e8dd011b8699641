use std::fmt;

use anyhow::{Result, bail};

fn check_lengths(y_true: &[usize], y_pred: &[usize]) -> Result<()> {
    if y_true.len() != y_pred.len() {
        bail!(
            "{} true labels but {} predictions",
            y_true.len(),
            y_pred.len()
        );
    }
    Ok(())
}

pub fn accuracy(y_true: &[usize], y_pred: &[usize]) -> Result<f64> {
    check_lengths(y_true, y_pred)?;
    if y_true.is_empty() {
        bail!("accuracy of an empty prediction set is undefined");
    }
    let correct = y_true.iter().zip(y_pred).filter(|(a, b)| a == b).count();
    Ok(correct as f64 / y_true.len() as f64)
}

/// `cm[true][pred]` counts over `n_classes` encoded labels.
pub fn confusion_matrix(y_true: &[usize], y_pred: &[usize], n_classes: usize) -> Result<Vec<Vec<usize>>> {
    check_lengths(y_true, y_pred)?;
    let mut cm = vec![vec![0usize; n_classes]; n_classes];
    for (&t, &p) in y_true.iter().zip(y_pred) {
        if t >= n_classes || p >= n_classes {
            bail!("label index out of range for {n_classes} classes");
        }
        cm[t][p] += 1;
    }
    Ok(cm)
}

/// Accuracy restricted to each class's true samples. Classes with no
/// samples are skipped.
pub fn per_class_accuracy(
    y_true: &[usize],
    y_pred: &[usize],
    n_classes: usize,
) -> Result<Vec<(usize, f64)>> {
    let cm = confusion_matrix(y_true, y_pred, n_classes)?;
    Ok(cm
        .iter()
        .enumerate()
        .filter_map(|(k, row)| {
            let support: usize = row.iter().sum();
            (support > 0).then(|| (k, row[k] as f64 / support as f64))
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

fn ratio(num: usize, den: usize) -> f64 {
    // undefined ratios report 0
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

pub fn classification_report(
    y_true: &[usize],
    y_pred: &[usize],
    class_names: &[String],
) -> Result<ClassificationReport> {
    let n_classes = class_names.len();
    let cm = confusion_matrix(y_true, y_pred, n_classes)?;
    let total = y_true.len();

    let classes: Vec<ClassMetrics> = class_names
        .iter()
        .enumerate()
        .map(|(k, name)| {
            let tp = cm[k][k];
            let support: usize = cm[k].iter().sum();
            let predicted: usize = cm.iter().map(|row| row[k]).sum();
            let precision = ratio(tp, predicted);
            let recall = ratio(tp, support);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            ClassMetrics {
                label: name.clone(),
                precision,
                recall,
                f1,
                support,
            }
        })
        .collect();

    let k = n_classes.max(1) as f64;
    let macro_avg = ClassMetrics {
        label: "macro avg".to_string(),
        precision: classes.iter().map(|c| c.precision).sum::<f64>() / k,
        recall: classes.iter().map(|c| c.recall).sum::<f64>() / k,
        f1: classes.iter().map(|c| c.f1).sum::<f64>() / k,
        support: total,
    };
    let w = total.max(1) as f64;
    let weighted_avg = ClassMetrics {
        label: "weighted avg".to_string(),
        precision: classes.iter().map(|c| c.precision * c.support as f64).sum::<f64>() / w,
        recall: classes.iter().map(|c| c.recall * c.support as f64).sum::<f64>() / w,
        f1: classes.iter().map(|c| c.f1 * c.support as f64).sum::<f64>() / w,
        support: total,
    };

    Ok(ClassificationReport {
        accuracy: accuracy(y_true, y_pred)?,
        classes,
        macro_avg,
        weighted_avg,
    })
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|c| c.label.len())
            .chain(["weighted avg".len()])
            .max()
            .unwrap_or(12);
        let row = |f: &mut fmt::Formatter<'_>, c: &ClassMetrics| {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                c.label, c.precision, c.recall, c.f1, c.support
            )
        };

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for c in &self.classes {
            row(f, c)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        row(f, &self.macro_avg)?;
        row(f, &self.weighted_avg)
    }
}
