//! SVG rendering for the diagnostic charts.
//!
//! Renderers are pure and return the document as a `String`; [`write_svg`]
//! persists it.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub const TOP_FEATURES: usize = 20;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// `(name, importance)` sorted by descending importance, at most `limit` long.
pub fn top_features(names: &[String], importances: &[f64], limit: usize) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = names
        .iter()
        .cloned()
        .zip(importances.iter().copied())
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(limit);
    ranked
}

pub fn render_feature_importance(ranked: &[(String, f64)]) -> String {
    let (width, height) = (1200.0, 800.0);
    let (left, right, top, bottom) = (80.0, 40.0, 60.0, 200.0);
    let plot_w = width - left - right;
    let plot_h = height - top - bottom;
    let max = ranked
        .iter()
        .map(|(_, v)| *v)
        .fold(0.0f64, f64::max)
        .max(f64::MIN_POSITIVE);
    let slot = plot_w / ranked.len().max(1) as f64;
    let bar_w = slot * 0.8;

    let mut body = String::new();
    for (i, (name, value)) in ranked.iter().enumerate() {
        let h = value / max * plot_h;
        let x = left + i as f64 * slot + (slot - bar_w) / 2.0;
        let y = top + plot_h - h;
        let cx = x + bar_w / 2.0;
        let ly = top + plot_h + 14.0;
        body.push_str(&format!(
            r##"  <rect x="{x:.1}" y="{y:.1}" width="{bar_w:.1}" height="{h:.1}" fill="#1f77b4"><title>{value:.4}</title></rect>
  <text x="{cx:.1}" y="{ly:.1}" font-size="12" text-anchor="end" transform="rotate(-45 {cx:.1} {ly:.1})">{label}</text>
"##,
            label = escape(name),
        ));
    }

    // y axis ticks at quarters of the max
    for q in 0..=4 {
        let v = max * q as f64 / 4.0;
        let y = top + plot_h - plot_h * q as f64 / 4.0;
        body.push_str(&format!(
            r##"  <line x1="{x0:.1}" y1="{y:.1}" x2="{left:.1}" y2="{y:.1}" stroke="#333"/>
  <text x="{tx:.1}" y="{ty:.1}" font-size="11" text-anchor="end">{v:.3}</text>
"##,
            x0 = left - 5.0,
            tx = left - 8.0,
            ty = y + 4.0,
        ));
    }

    format!(
        r##"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}" font-family="sans-serif">
  <rect width="100%" height="100%" fill="white"/>
  <text x="{tx:.1}" y="32" font-size="20" text-anchor="middle">Top {n} Feature Importance for Threat Detection</text>
  <line x1="{left}" y1="{top}" x2="{left}" y2="{axis_y}" stroke="#333"/>
  <line x1="{left}" y1="{axis_y}" x2="{axis_x}" y2="{axis_y}" stroke="#333"/>
{body}</svg>
"##,
        tx = width / 2.0,
        n = ranked.len(),
        axis_y = top + plot_h,
        axis_x = left + plot_w,
    )
}

/// Linear blend from near-white to dark blue.
fn blues(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let mix = |a: f64, b: f64| (a + (b - a) * t).round() as u8;
    format!(
        "#{:02x}{:02x}{:02x}",
        mix(247.0, 8.0),
        mix(251.0, 48.0),
        mix(255.0, 107.0)
    )
}

/// Annotated heatmap; rows are true labels, columns predicted labels.
pub fn render_confusion_matrix(cm: &[Vec<usize>], labels: &[String]) -> String {
    let n = labels.len();
    let cell = 70.0;
    let (left, top) = (200.0, 70.0);
    let width = left + cell * n as f64 + 40.0;
    let height = top + cell * n as f64 + 190.0;
    let max = cm.iter().flatten().copied().max().unwrap_or(0).max(1) as f64;

    let mut body = String::new();
    for (i, row) in cm.iter().enumerate() {
        for (j, &count) in row.iter().enumerate() {
            let t = count as f64 / max;
            let x = left + j as f64 * cell;
            let y = top + i as f64 * cell;
            let ink = if t > 0.5 { "white" } else { "black" };
            body.push_str(&format!(
                r##"  <rect x="{x:.1}" y="{y:.1}" width="{cell}" height="{cell}" fill="{fill}" stroke="white"/>
  <text x="{cx:.1}" y="{cy:.1}" font-size="14" text-anchor="middle" fill="{ink}">{count}</text>
"##,
                fill = blues(t),
                cx = x + cell / 2.0,
                cy = y + cell / 2.0 + 5.0,
            ));
        }
    }

    for (k, label) in labels.iter().enumerate() {
        let label = escape(label);
        let ry = top + k as f64 * cell + cell / 2.0 + 4.0;
        let cx = left + k as f64 * cell + cell / 2.0;
        let ly = top + n as f64 * cell + 14.0;
        body.push_str(&format!(
            r##"  <text x="{rx:.1}" y="{ry:.1}" font-size="12" text-anchor="end">{label}</text>
  <text x="{cx:.1}" y="{ly:.1}" font-size="12" text-anchor="end" transform="rotate(-45 {cx:.1} {ly:.1})">{label}</text>
"##,
            rx = left - 8.0,
        ));
    }

    format!(
        r##"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}" font-family="sans-serif">
  <rect width="100%" height="100%" fill="white"/>
  <text x="{tx:.1}" y="32" font-size="20" text-anchor="middle">Threat Detection Confusion Matrix</text>
  <text x="{px:.1}" y="{py:.1}" font-size="14" text-anchor="middle">Predicted Label</text>
  <text x="20" y="{vy:.1}" font-size="14" text-anchor="middle" transform="rotate(-90 20 {vy:.1})">True Label</text>
{body}</svg>
"##,
        tx = width / 2.0,
        px = left + cell * n as f64 / 2.0,
        py = height - 16.0,
        vy = top + cell * n as f64 / 2.0,
    )
}

pub fn write_svg(path: &Path, svg: &str) -> Result<()> {
    fs::write(path, svg).with_context(|| format!("failed to write chart {}", path.display()))
}
