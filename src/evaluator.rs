use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::metrics::{accuracy, confusion_matrix, per_class_accuracy};
use crate::plot::{render_confusion_matrix, write_svg};
use crate::preprocess::LabelEncoder;

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub confusion: Vec<Vec<usize>>,
    pub accuracy: f64,
    /// Only labels present in the held-out split.
    pub per_class: Vec<(String, f64)>,
}

/// Score held-out predictions. No model is refit here.
pub fn evaluate(y_test: &[usize], y_pred: &[usize], encoder: &LabelEncoder) -> Result<Evaluation> {
    let n_classes = encoder.n_classes();
    let confusion = confusion_matrix(y_test, y_pred, n_classes)?;
    let overall = accuracy(y_test, y_pred)?;

    let mut per_class = Vec::new();
    for (k, acc) in per_class_accuracy(y_test, y_pred, n_classes)? {
        per_class.push((encoder.decode(k)?.as_str().to_string(), acc));
    }

    Ok(Evaluation {
        confusion,
        accuracy: overall,
        per_class,
    })
}

pub fn print_evaluation(eval: &Evaluation) {
    println!("Model Evaluation:");
    println!("Overall Accuracy: {:.4}", eval.accuracy);
    for (label, acc) in &eval.per_class {
        println!("{label} Accuracy: {acc:.4}");
    }
}

/// Evaluate, print the summary and write the confusion-matrix heatmap.
pub fn evaluate_and_plot(
    y_test: &[usize],
    y_pred: &[usize],
    encoder: &LabelEncoder,
    heatmap_path: &Path,
) -> Result<Evaluation> {
    let eval = evaluate(y_test, y_pred, encoder)?;
    print_evaluation(&eval);
    write_svg(
        heatmap_path,
        &render_confusion_matrix(&eval.confusion, &encoder.class_names()),
    )?;
    info!(path = %heatmap_path.display(), "confusion matrix saved");
    Ok(eval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ThreatLabel;

    fn encoder() -> LabelEncoder {
        LabelEncoder::fit(&[
            ThreatLabel::Safe,
            ThreatLabel::Phishing,
            ThreatLabel::FlashLoanAttack,
        ])
        .unwrap()
    }

    #[test]
    fn absent_label_is_skipped() {
        // classes: flash_loan_attack=0, phishing=1, safe=2; phishing never in y_test
        let eval = evaluate(&[0, 0, 2, 2, 2], &[0, 2, 2, 2, 1], &encoder()).unwrap();
        assert_eq!(eval.accuracy, 0.6);
        assert_eq!(
            eval.per_class,
            vec![
                ("flash_loan_attack".to_string(), 0.5),
                ("safe".to_string(), 2.0 / 3.0)
            ]
        );
        assert_eq!(eval.confusion.len(), 3);
        assert_eq!(eval.confusion[1], vec![0, 0, 0]);
    }

    #[test]
    fn writes_heatmap() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("confusion_matrix.svg");
        evaluate_and_plot(&[0, 1, 2], &[0, 1, 2], &encoder(), &path).unwrap();
        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("phishing"));
    }
}
