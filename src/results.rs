// ============================================================================
// CROSS-YEAR RESULTS TABLE
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const HORIZONS: [usize; 3] = [3, 6, 12];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "MAE")]
    Mae,
    #[serde(rename = "RMSE")]
    Rmse,
    #[serde(rename = "MAPE")]
    Mape,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Mae, Metric::Rmse, Metric::Mape];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Mae => "MAE",
            Metric::Rmse => "RMSE",
            Metric::Mape => "MAPE",
        }
    }
}

/// `horizon -> metric -> year -> value`. Later writes for the same key replace earlier ones.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct YearlyResults {
    table: BTreeMap<usize, BTreeMap<Metric, BTreeMap<u32, f32>>>,
}

impl YearlyResults {
    pub fn new() -> Self { Self::default() }

    pub fn record(&mut self, horizon: usize, metric: Metric, year: u32, value: f32) {
        self.table.entry(horizon).or_default().entry(metric).or_default().insert(year, value);
    }

    pub fn get(&self, horizon: usize, metric: Metric, year: u32) -> Option<f32> {
        self.table.get(&horizon)?.get(&metric)?.get(&year).copied()
    }

    pub fn is_empty(&self) -> bool { self.table.is_empty() }

    pub fn years(&self) -> Vec<u32> {
        let mut years: Vec<u32> = self.table.values()
            .flat_map(|m| m.values())
            .flat_map(|y| y.keys().copied())
            .collect();
        years.sort_unstable();
        years.dedup();
        years
    }

    pub fn merge(&mut self, other: &YearlyResults) {
        for (&h, metrics) in &other.table {
            for (&m, years) in metrics {
                for (&y, &v) in years { self.record(h, m, y, v); }
            }
        }
    }
}

impl fmt::Display for YearlyResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let years = self.years();
        write!(f, "{:>4} {:>5}", "T", "")?;
        for y in &years { write!(f, " {:>8}", y)?; }
        for (h, metrics) in &self.table {
            for m in Metric::ALL {
                let Some(by_year) = metrics.get(&m) else { continue };
                write!(f, "\n{:>4} {:>5}", h, m.name())?;
                for y in &years {
                    match by_year.get(y) {
                        Some(v) => write!(f, " {:>8.4}", v)?,
                        None => write!(f, " {:>8}", "-")?,
                    }
                }
            }
        }
        Ok(())
    }
}
