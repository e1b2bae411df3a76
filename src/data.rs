// ============================================================================
// DATA PREPARATION: per-year splits and batching
// ============================================================================

use std::fs;
use std::path::Path;

use log::info;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::DataConfig;
use crate::error::{DcrnnError, Result};

/// One split on disk: `x` is `(samples, seq_len, nodes, x_dim)` and `y` is
/// `(samples, horizon, nodes, y_dim)`, both flattened row-major.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub x_shape: [usize; 4],
    pub y_shape: [usize; 4],
}

impl Dataset {
    pub fn new(x: Vec<f32>, y: Vec<f32>, x_shape: [usize; 4], y_shape: [usize; 4]) -> Result<Self> {
        let ds = Dataset { x, y, x_shape, y_shape };
        ds.validate()?;
        Ok(ds)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DcrnnError::io(path, e))?;
        let ds: Dataset = serde_json::from_str(&text).map_err(|e| DcrnnError::json(path, e))?;
        ds.validate()?;
        Ok(ds)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DcrnnError::io(parent, e))?;
        }
        let text = serde_json::to_string(self).map_err(|e| DcrnnError::json(path, e))?;
        fs::write(path, text).map_err(|e| DcrnnError::io(path, e))
    }

    fn validate(&self) -> Result<()> {
        let xs: usize = self.x_shape.iter().product();
        let ys: usize = self.y_shape.iter().product();
        if xs != self.x.len() || ys != self.y.len() {
            return Err(DcrnnError::Data(format!(
                "buffers hold {}/{} values, shapes {:?}/{:?} describe {}/{}",
                self.x.len(), self.y.len(), self.x_shape, self.y_shape, xs, ys)));
        }
        if self.x_shape[0] != self.y_shape[0] || self.x_shape[2] != self.y_shape[2] {
            return Err(DcrnnError::Data(format!(
                "x {:?} and y {:?} disagree on samples or nodes", self.x_shape, self.y_shape)));
        }
        Ok(())
    }

    pub fn num_samples(&self) -> usize { self.x_shape[0] }
    pub fn seq_len(&self) -> usize { self.x_shape[1] }
    pub fn horizon(&self) -> usize { self.y_shape[1] }
    pub fn num_nodes(&self) -> usize { self.x_shape[2] }
    pub fn x_dim(&self) -> usize { self.x_shape[3] }
    pub fn y_dim(&self) -> usize { self.y_shape[3] }

    fn x_sample(&self, i: usize) -> &[f32] {
        let len = self.x_shape[1] * self.x_shape[2] * self.x_shape[3];
        &self.x[i * len..(i + 1) * len]
    }

    fn y_sample(&self, i: usize) -> &[f32] {
        let len = self.y_shape[1] * self.y_shape[2] * self.y_shape[3];
        &self.y[i * len..(i + 1) * len]
    }
}

/// One batch, still in `(batch, time, nodes, dim)` layout.
#[derive(Clone, Debug)]
pub struct Batch {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub batch_size: usize,
    pub x_shape: [usize; 4],
    pub y_shape: [usize; 4],
}

impl Batch {
    /// Per-step `(batch * nodes) x dim` matrices from `(batch, steps, nodes, full_dim)`,
    /// keeping the first `dim` features.
    fn time_major(buf: &[f32], shape: [usize; 4], dim: usize) -> Vec<Vec<f32>> {
        let [b, steps, n, full] = shape;
        (0..steps).map(|t| {
            let mut out = Vec::with_capacity(b * n * dim);
            for bi in 0..b {
                for ni in 0..n {
                    let off = ((bi * steps + t) * n + ni) * full;
                    out.extend_from_slice(&buf[off..off + dim]);
                }
            }
            out
        }).collect()
    }

    pub fn inputs_time_major(&self, input_dim: usize) -> Vec<Vec<f32>> {
        Self::time_major(&self.x, self.x_shape, input_dim)
    }

    pub fn labels_time_major(&self, output_dim: usize) -> Vec<Vec<f32>> {
        Self::time_major(&self.y, self.y_shape, output_dim)
    }
}

pub struct DataLoader {
    data: Dataset,
    batch_size: usize,
    shuffle: bool,
}

impl DataLoader {
    /// With `pad_with_last_sample` the last sample is repeated until the size is
    /// a multiple of `batch_size`.
    pub fn new(mut data: Dataset, batch_size: usize, pad_with_last_sample: bool, shuffle: bool) -> Result<Self> {
        if data.num_samples() == 0 {
            return Err(DcrnnError::Data("split has no samples".into()));
        }
        if pad_with_last_sample {
            let size = data.num_samples();
            let padding = (batch_size - size % batch_size) % batch_size;
            if padding > 0 {
                let last_x = data.x_sample(size - 1).to_vec();
                let last_y = data.y_sample(size - 1).to_vec();
                for _ in 0..padding {
                    data.x.extend_from_slice(&last_x);
                    data.y.extend_from_slice(&last_y);
                }
                data.x_shape[0] += padding;
                data.y_shape[0] += padding;
            }
        }
        Ok(DataLoader { data, batch_size, shuffle })
    }

    pub fn size(&self) -> usize { self.data.num_samples() }

    pub fn num_batch(&self) -> usize { self.size().div_ceil(self.batch_size) }

    pub fn dataset(&self) -> &Dataset { &self.data }

    /// Batches for one pass. The order is reshuffled on every call when the loader shuffles.
    pub fn iter(&self, rng: &mut impl Rng) -> impl Iterator<Item = Batch> + '_ {
        let mut order: Vec<usize> = (0..self.size()).collect();
        if self.shuffle { order.shuffle(rng); }
        let batch_size = self.batch_size;
        (0..self.num_batch()).map(move |bi| {
            let idx = &order[bi * batch_size..((bi + 1) * batch_size).min(order.len())];
            self.gather(idx)
        })
    }

    fn gather(&self, idx: &[usize]) -> Batch {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for &i in idx {
            x.extend_from_slice(self.data.x_sample(i));
            y.extend_from_slice(self.data.y_sample(i));
        }
        let mut x_shape = self.data.x_shape;
        let mut y_shape = self.data.y_shape;
        x_shape[0] = idx.len();
        y_shape[0] = idx.len();
        Batch { x, y, batch_size: idx.len(), x_shape, y_shape }
    }
}

/// Which split a loader serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

pub struct YearData {
    pub train: DataLoader,
    pub val: DataLoader,
    pub test: DataLoader,
}

impl YearData {
    pub fn loader(&self, split: Split) -> &DataLoader {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }

    /// Every split must match the graph's node count and the model's window.
    pub fn check(&self, num_nodes: usize, seq_len: usize, horizon: usize) -> Result<()> {
        for split in [Split::Train, Split::Val, Split::Test] {
            let ds = self.loader(split).dataset();
            if ds.num_nodes() != num_nodes {
                return Err(DcrnnError::Data(format!(
                    "{} split has {} nodes, adjacency has {}", split.name(), ds.num_nodes(), num_nodes)));
            }
            if ds.seq_len() != seq_len || ds.horizon() != horizon {
                return Err(DcrnnError::Data(format!(
                    "{} split has seq_len {} / horizon {}, model expects {} / {}",
                    split.name(), ds.seq_len(), ds.horizon(), seq_len, horizon)));
            }
        }
        Ok(())
    }
}

/// Reads `{dataset_dir}/{year}/{train,val,test}.json` and checks the feature
/// dimensions against the model's.
pub fn load_dataset(cfg: &DataConfig, year: u32, input_dim: usize, output_dim: usize) -> Result<YearData> {
    let dir = cfg.dataset_dir.join(year.to_string());
    let load = |split: Split, batch_size: usize, shuffle: bool| -> Result<DataLoader> {
        let path = dir.join(format!("{}.json", split.name()));
        let ds = Dataset::load(&path)?;
        if ds.x_dim() < input_dim || ds.y_dim() < output_dim {
            return Err(DcrnnError::Data(format!(
                "{}: feature dims x={} y={} smaller than input_dim={} output_dim={}",
                path.display(), ds.x_dim(), ds.y_dim(), input_dim, output_dim)));
        }
        info!("{} x: {:?}, y: {:?}", split.name(), ds.x_shape, ds.y_shape);
        DataLoader::new(ds, batch_size, true, shuffle)
    };
    Ok(YearData {
        train: load(Split::Train, cfg.batch_size, true)?,
        val: load(Split::Val, cfg.val_batch_size, false)?,
        test: load(Split::Test, cfg.test_batch_size, false)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// `samples` samples, 2 steps, 2 nodes, 2 features; value encodes (sample, step, node, feat).
    fn toy(samples: usize) -> Dataset {
        let mut x = Vec::new();
        for s in 0..samples { for t in 0..2 { for n in 0..2 { for f in 0..2 {
            x.push((s * 1000 + t * 100 + n * 10 + f) as f32);
        }}}}
        let y = x.clone();
        Dataset::new(x, y, [samples, 2, 2, 2], [samples, 2, 2, 2]).unwrap()
    }

    #[test]
    fn padding_repeats_the_last_sample() {
        let loader = DataLoader::new(toy(5), 4, true, false).unwrap();
        assert_eq!(loader.size(), 8);
        assert_eq!(loader.num_batch(), 2);
        let mut rng = StdRng::seed_from_u64(0);
        let batches: Vec<Batch> = loader.iter(&mut rng).collect();
        assert_eq!(batches[1].batch_size, 4);
        // samples 5..8 are copies of sample 4
        assert_eq!(batches[1].x[..8], batches[1].x[8 * 3..]);
        assert_eq!(batches[1].x[0], 4000.0);
    }

    #[test]
    fn no_padding_leaves_a_short_last_batch() {
        let loader = DataLoader::new(toy(5), 4, false, false).unwrap();
        assert_eq!(loader.num_batch(), 2);
        let mut rng = StdRng::seed_from_u64(0);
        let sizes: Vec<usize> = loader.iter(&mut rng).map(|b| b.batch_size).collect();
        assert_eq!(sizes, vec![4, 1]);
    }

    #[test]
    fn shuffled_pass_visits_every_sample_once() {
        let loader = DataLoader::new(toy(6), 3, true, true).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut firsts: Vec<f32> = loader.iter(&mut rng)
            .flat_map(|b| b.x.chunks(8).map(|c| c[0]).collect::<Vec<_>>())
            .collect();
        firsts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(firsts, vec![0.0, 1000.0, 2000.0, 3000.0, 4000.0, 5000.0]);
    }

    #[test]
    fn time_major_groups_rows_by_batch_then_node() {
        let loader = DataLoader::new(toy(2), 2, true, false).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let batch = loader.iter(&mut rng).next().unwrap();
        let steps = batch.inputs_time_major(1);
        assert_eq!(steps.len(), 2);
        // step 1: (b0,n0), (b0,n1), (b1,n0), (b1,n1), first feature only
        assert_eq!(steps[1], vec![100.0, 110.0, 1100.0, 1110.0]);
        let labels = batch.labels_time_major(2);
        assert_eq!(labels[0], vec![0.0, 1.0, 10.0, 11.0, 1000.0, 1001.0, 1010.0, 1011.0]);
    }

    fn year_of(train: Dataset, val: Dataset, test: Dataset) -> YearData {
        YearData {
            train: DataLoader::new(train, 2, true, true).unwrap(),
            val: DataLoader::new(val, 2, true, false).unwrap(),
            test: DataLoader::new(test, 2, true, false).unwrap(),
        }
    }

    #[test]
    fn check_covers_every_split() {
        let ok = year_of(toy(2), toy(2), toy(2));
        assert!(ok.check(2, 2, 2).is_ok());

        let wide_val = Dataset::new(vec![0.0; 3 * 2 * 2], vec![0.0; 3 * 2 * 2], [1, 2, 3, 2], [1, 2, 3, 2]).unwrap();
        let err = year_of(toy(2), wide_val, toy(2)).check(2, 2, 2).unwrap_err();
        assert!(matches!(err, DcrnnError::Data(ref m) if m.starts_with("val")));

        let long_test = Dataset::new(vec![0.0; 2 * 2 * 2], vec![0.0; 3 * 2 * 2], [1, 2, 2, 2], [1, 3, 2, 2]).unwrap();
        let err = year_of(toy(2), toy(2), long_test).check(2, 2, 2).unwrap_err();
        assert!(matches!(err, DcrnnError::Data(ref m) if m.starts_with("test")));
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let err = Dataset::new(vec![0.0; 3], vec![0.0; 4], [1, 1, 2, 2], [1, 1, 2, 2]).unwrap_err();
        assert!(matches!(err, DcrnnError::Data(_)));
    }
}
