// ============================================================================
// MASKED LOSS & METRICS
// ============================================================================

use crate::autodiff::{Graph, TID};

/// Training loss over all decoder steps. `labels` is laid out like the row-wise
/// stack of `outputs`.
pub fn masked_mae_loss(g: &mut Graph, outputs: &[TID], labels: &[f32]) -> TID {
    let pred = g.concat_rows(outputs);
    let (rows, cols) = g.shape(pred);
    debug_assert_eq!(rows * cols, labels.len());
    let target = g.constant(labels.to_vec(), rows, cols);
    g.masked_mae(pred, target)
}

fn null_mask(labels: &[f32], null_val: f32) -> Vec<f64> {
    let mask: Vec<f64> = labels.iter()
        .map(|&l| {
            let valid = if null_val.is_nan() { !l.is_nan() } else { l != null_val };
            if valid { 1.0 } else { 0.0 }
        })
        .collect();
    let mean = mask.iter().sum::<f64>() / mask.len().max(1) as f64;
    mask.into_iter().map(|m| m / mean).collect()
}

fn masked_mean(preds: &[f32], labels: &[f32], null_val: f32, f: impl Fn(f64, f64) -> f64) -> f32 {
    debug_assert_eq!(preds.len(), labels.len());
    if preds.is_empty() { return 0.0; }
    let mask = null_mask(labels, null_val);
    let total: f64 = preds.iter().zip(labels.iter()).zip(mask.iter())
        .map(|((&p, &l), &m)| {
            let v = f(p as f64, l as f64) * m;
            if v.is_nan() { 0.0 } else { v }
        })
        .sum();
    (total / preds.len() as f64) as f32
}

pub fn masked_mae_np(preds: &[f32], labels: &[f32], null_val: f32) -> f32 {
    masked_mean(preds, labels, null_val, |p, l| (p - l).abs())
}

pub fn masked_mse_np(preds: &[f32], labels: &[f32], null_val: f32) -> f32 {
    masked_mean(preds, labels, null_val, |p, l| (p - l) * (p - l))
}

pub fn masked_rmse_np(preds: &[f32], labels: &[f32], null_val: f32) -> f32 {
    masked_mse_np(preds, labels, null_val).sqrt()
}

/// Fraction, not percent.
pub fn masked_mape_np(preds: &[f32], labels: &[f32], null_val: f32) -> f32 {
    masked_mean(preds, labels, null_val, |p, l| ((p - l) / l).abs())
}
