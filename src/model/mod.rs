// ============================================================================
// DCRNN: sequence-to-sequence model of stacked DCGRU cells
// ============================================================================

mod dcgru;

pub use dcgru::DcgruCell;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::autodiff::{Graph, SupportId, TID};
use crate::config::ModelConfig;
use crate::supports::{build_supports, Adjacency};

/// Name and shape of one parameter tensor, used to check checkpoint compatibility.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub rows: usize,
    pub cols: usize,
}

impl ParamSpec {
    pub fn new(name: String, (rows, cols): (usize, usize)) -> Self {
        ParamSpec { name, rows, cols }
    }

    pub fn len(&self) -> usize { self.rows * self.cols }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

pub fn rand_normal(n: usize, scale: f32, rng: &mut impl Rng) -> Vec<f32> {
    (0..n).map(|_| {
        let u1: f32 = rng.gen::<f32>().max(1e-10);
        let u2: f32 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos() * scale
    }).collect()
}

/// Probability of feeding the ground truth to the decoder after `batches_seen` batches.
pub fn sampling_threshold(cl_decay_steps: f32, batches_seen: usize) -> f32 {
    let ratio = batches_seen as f32 / cl_decay_steps;
    cl_decay_steps / (cl_decay_steps + ratio.exp())
}

pub struct DcrnnModel {
    config: ModelConfig,
    num_nodes: usize,
    supports: Vec<SupportId>,
    encoder: Vec<DcgruCell>,
    decoder: Vec<DcgruCell>,
    proj_w: TID,
    proj_b: TID,
}

impl DcrnnModel {
    /// Registers the graph supports and allocates parameters. The caller freezes
    /// the parameter boundary once every model tensor is created.
    pub fn new(adj: &Adjacency, config: &ModelConfig, g: &mut Graph, rng: &mut impl Rng) -> Self {
        let supports: Vec<SupportId> = build_supports(adj, config.filter_type)
            .into_iter()
            .map(|s| g.add_support(s))
            .collect();
        let units = config.rnn_units;
        let k = config.max_diffusion_step;

        let encoder = (0..config.num_rnn_layers)
            .map(|i| {
                let inp = if i == 0 { config.input_dim } else { units };
                DcgruCell::new(inp, units, k, &supports, config.use_gc_for_ru, g, rng)
            })
            .collect();
        let decoder = (0..config.num_rnn_layers)
            .map(|i| {
                let inp = if i == 0 { config.output_dim } else { units };
                DcgruCell::new(inp, units, k, &supports, config.use_gc_for_ru, g, rng)
            })
            .collect();

        let bound = 1.0 / (units as f32).sqrt();
        let proj_w_data = (0..units * config.output_dim).map(|_| rng.gen_range(-bound..bound)).collect();
        let proj_w = g.param(proj_w_data, units, config.output_dim);
        let proj_b_data = (0..config.output_dim).map(|_| rng.gen_range(-bound..bound)).collect();
        let proj_b = g.param(proj_b_data, 1, config.output_dim);

        DcrnnModel {
            config: config.clone(),
            num_nodes: adj.num_nodes(),
            supports,
            encoder,
            decoder,
            proj_w,
            proj_b,
        }
    }

    pub fn num_nodes(&self) -> usize { self.num_nodes }

    pub fn config(&self) -> &ModelConfig { &self.config }

    pub fn num_supports(&self) -> usize { self.supports.len() }

    pub fn param_ids(&self) -> Vec<TID> {
        let mut ids = Vec::new();
        for c in self.encoder.iter().chain(self.decoder.iter()) { ids.extend(c.param_ids()); }
        ids.push(self.proj_w);
        ids.push(self.proj_b);
        ids
    }

    pub fn param_specs(&self, g: &Graph) -> Vec<ParamSpec> {
        let mut specs = Vec::new();
        for (i, c) in self.encoder.iter().enumerate() {
            specs.extend(c.param_specs(&format!("encoder.{}", i), g));
        }
        for (i, c) in self.decoder.iter().enumerate() {
            specs.extend(c.param_specs(&format!("decoder.{}", i), g));
        }
        specs.push(ParamSpec::new("decoder.proj_w".into(), g.shape(self.proj_w)));
        specs.push(ParamSpec::new("decoder.proj_b".into(), g.shape(self.proj_b)));
        specs
    }

    pub fn total_params(&self, g: &Graph) -> usize {
        self.param_ids().iter().map(|&t| g.data(t).len()).sum()
    }

    /// Runs the encoder over `inputs` (one `(batch * nodes) x input_dim` matrix per
    /// step) and returns the final hidden state of every layer.
    pub fn encode(&self, inputs: &[TID], g: &mut Graph) -> Vec<TID> {
        let rows = g.rows(inputs[0]);
        let units = self.config.rnn_units;
        let mut hidden: Vec<TID> = (0..self.encoder.len()).map(|_| g.zeros(rows, units)).collect();
        for &x in inputs {
            let mut out = x;
            for (layer, cell) in self.encoder.iter().enumerate() {
                let h = cell.forward(out, hidden[layer], g);
                hidden[layer] = h;
                out = h;
            }
        }
        hidden
    }

    /// Unrolls the decoder for `horizon` steps from a zero GO symbol. With `labels`
    /// and curriculum learning enabled, each step feeds the ground truth with
    /// probability `sampling_threshold(batches_seen)`.
    pub fn decode(&self, mut hidden: Vec<TID>, labels: Option<&[TID]>, batches_seen: usize,
                  g: &mut Graph, rng: &mut impl Rng) -> Vec<TID> {
        let rows = g.rows(hidden[0]);
        let mut input = g.zeros(rows, self.config.output_dim);
        let mut outputs = Vec::with_capacity(self.config.horizon);
        let curriculum = self.config.use_curriculum_learning && labels.is_some();
        let threshold = sampling_threshold(self.config.cl_decay_steps, batches_seen);

        for t in 0..self.config.horizon {
            let mut out = input;
            for (layer, cell) in self.decoder.iter().enumerate() {
                let h = cell.forward(out, hidden[layer], g);
                hidden[layer] = h;
                out = h;
            }
            let proj = g.matmul(out, self.proj_w);
            let step = g.broadcast_add(proj, self.proj_b);
            outputs.push(step);

            input = step;
            if curriculum {
                let c: f32 = rng.gen();
                if let Some(l) = labels {
                    if c < threshold { input = l[t]; }
                }
            }
        }
        outputs
    }

    /// `labels` are passed only for training forwards.
    pub fn forward(&self, inputs: &[TID], labels: Option<&[TID]>, batches_seen: usize,
                   g: &mut Graph, rng: &mut impl Rng) -> Vec<TID> {
        let hidden = self.encode(inputs, g);
        self.decode(hidden, labels, batches_seen, g, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> ModelConfig {
        ModelConfig {
            horizon: 3,
            seq_len: 4,
            rnn_units: 5,
            num_rnn_layers: 2,
            max_diffusion_step: 2,
            filter_type: FilterType::DualRandomWalk,
            ..ModelConfig::default()
        }
    }

    fn ring(n: usize) -> Adjacency {
        let mut dense = vec![0.0; n * n];
        for i in 0..n { dense[i * n + (i + 1) % n] = 1.0; }
        Adjacency::from_dense(dense, n).unwrap()
    }

    #[test]
    fn threshold_decays_with_batches_seen() {
        let early = sampling_threshold(2000.0, 0);
        let mid = sampling_threshold(2000.0, 10_000);
        let late = sampling_threshold(2000.0, 40_000);
        assert!(early > 0.99);
        assert!(early > mid && mid > late);
        assert!(late < 0.01);
    }

    #[test]
    fn forward_emits_one_output_per_horizon_step() {
        let cfg = small_config();
        let mut g = Graph::new();
        let mut rng = StdRng::seed_from_u64(1);
        let model = DcrnnModel::new(&ring(4), &cfg, &mut g, &mut rng);
        g.freeze_params();
        let batch = 3;
        let inputs: Vec<TID> = (0..cfg.seq_len)
            .map(|t| g.constant(vec![t as f32 * 0.1; batch * 4], batch * 4, 1))
            .collect();
        let outs = model.forward(&inputs, None, 0, &mut g, &mut rng);
        assert_eq!(outs.len(), 3);
        for o in outs { assert_eq!(g.shape(o), (batch * 4, 1)); }
    }

    #[test]
    fn specs_transfer_across_node_counts() {
        let cfg = small_config();
        let mut rng = StdRng::seed_from_u64(3);
        let mut g4 = Graph::new();
        let m4 = DcrnnModel::new(&ring(4), &cfg, &mut g4, &mut rng);
        let mut g9 = Graph::new();
        let m9 = DcrnnModel::new(&ring(9), &cfg, &mut g9, &mut rng);
        assert_eq!(m4.param_specs(&g4), m9.param_specs(&g9));
        assert_eq!(m4.num_supports(), 2);
        assert_eq!(m4.param_ids().len(), 2 * 2 * 4 + 2);
    }

    #[test]
    fn backward_reaches_every_parameter() {
        let cfg = small_config();
        let mut g = Graph::new();
        let mut rng = StdRng::seed_from_u64(11);
        let model = DcrnnModel::new(&ring(4), &cfg, &mut g, &mut rng);
        g.freeze_params();
        let inputs: Vec<TID> = (0..cfg.seq_len)
            .map(|t| g.constant((0..8).map(|i| 0.1 * (i + t) as f32).collect(), 8, 1))
            .collect();
        let outs = model.forward(&inputs, None, 0, &mut g, &mut rng);
        let labels = vec![1.0; 8 * cfg.horizon];
        let loss = crate::loss::masked_mae_loss(&mut g, &outs, &labels);
        g.backward(loss);
        for t in model.param_ids() {
            assert!(g.grad(t).iter().any(|&v| v != 0.0), "parameter {:?} received no gradient", t);
        }
    }

    #[test]
    fn curriculum_feeds_ground_truth_to_the_decoder() {
        let mut cfg = small_config();
        cfg.use_curriculum_learning = true;
        // threshold rounds to 1.0, so every step takes the label
        cfg.cl_decay_steps = 1e9;
        let mut g = Graph::new();
        let mut rng = StdRng::seed_from_u64(21);
        let model = DcrnnModel::new(&ring(4), &cfg, &mut g, &mut rng);
        g.freeze_params();
        assert_eq!(sampling_threshold(cfg.cl_decay_steps, 0), 1.0);

        let mut run = |label: f32, with_labels: bool| -> Vec<Vec<f32>> {
            g.reset();
            let inputs: Vec<TID> = (0..cfg.seq_len)
                .map(|t| g.constant(vec![0.2 * t as f32; 8], 8, 1))
                .collect();
            let labels: Vec<TID> = (0..cfg.horizon).map(|_| g.constant(vec![label; 8], 8, 1)).collect();
            let given = if with_labels { Some(&labels[..]) } else { None };
            let outs = model.forward(&inputs, given, 0, &mut g, &mut rng);
            outs.iter().map(|&o| g.data(o).to_vec()).collect()
        };

        let low = run(0.0, true);
        let high = run(5.0, true);
        // the first step only sees the GO symbol
        assert_eq!(low[0], high[0]);
        assert_ne!(low[1], high[1]);

        let free_low = run(0.0, false);
        let free_high = run(5.0, false);
        assert_eq!(free_low, free_high);
    }
}
