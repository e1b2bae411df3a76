// ============================================================================
// DIFFUSION-CONVOLUTIONAL GRU CELL
// ============================================================================

use rand::Rng;

use crate::autodiff::{Graph, SupportId, TID};
use crate::model::{rand_normal, ParamSpec};

pub struct DcgruCell {
    input_dim: usize,
    num_units: usize,
    max_diffusion_step: usize,
    supports: Vec<SupportId>,
    use_gc_for_ru: bool,
    gate_w: TID, gate_b: TID,
    cand_w: TID, cand_b: TID,
}

impl DcgruCell {
    pub fn new(input_dim: usize, num_units: usize, max_diffusion_step: usize,
               supports: &[SupportId], use_gc_for_ru: bool,
               g: &mut Graph, rng: &mut impl Rng) -> Self {
        let input_size = input_dim + num_units;
        let num_matrices = supports.len() * max_diffusion_step + 1;
        let gc_rows = input_size * num_matrices;
        let gate_rows = if use_gc_for_ru { gc_rows } else { input_size };

        let sg = (2.0 / (gate_rows + 2 * num_units) as f32).sqrt();
        let sc = (2.0 / (gc_rows + num_units) as f32).sqrt();
        // reset/update gate bias starts at 1.0
        let gate_w = g.param(rand_normal(gate_rows * 2 * num_units, sg, rng), gate_rows, 2 * num_units);
        let gate_b = g.param(vec![1.0; 2 * num_units], 1, 2 * num_units);
        let cand_w = g.param(rand_normal(gc_rows * num_units, sc, rng), gc_rows, num_units);
        let cand_b = g.param(vec![0.0; num_units], 1, num_units);

        DcgruCell {
            input_dim, num_units, max_diffusion_step,
            supports: supports.to_vec(), use_gc_for_ru,
            gate_w, gate_b, cand_w, cand_b,
        }
    }

    /// `inputs` is `(batch * nodes) x input_dim`, `hx` is `(batch * nodes) x num_units`.
    pub fn forward(&self, inputs: TID, hx: TID, g: &mut Graph) -> TID {
        debug_assert_eq!(g.cols(inputs), self.input_dim);
        let units = self.num_units;

        let value = if self.use_gc_for_ru {
            self.gconv(inputs, hx, self.gate_w, self.gate_b, g)
        } else {
            self.fc(inputs, hx, self.gate_w, self.gate_b, g)
        };
        let value = g.sigmoid(value);
        let r = g.col_slice(value, 0, units);
        let u = g.col_slice(value, units, units);

        let rh = g.mul(r, hx);
        let c_pre = self.gconv(inputs, rh, self.cand_w, self.cand_b, g);
        let c = g.tanh_op(c_pre);

        // h = u * h_prev + (1 - u) * c
        let keep = g.mul(u, hx);
        let omu = g.one_minus(u);
        let fresh = g.mul(omu, c);
        g.add(keep, fresh)
    }

    fn fc(&self, inputs: TID, state: TID, w: TID, b: TID, g: &mut Graph) -> TID {
        let x = g.concat_cols(&[inputs, state]);
        let y = g.matmul(x, w);
        g.broadcast_add(y, b)
    }

    /// Diffusion series `x0, S x0, 2 S T_{k-1} - T_{k-2}, ...` up to
    /// `max_diffusion_step` terms per support. Every support starts again from
    /// the undiffused `x0`, so the terms of one support never feed the next.
    fn diffusion_terms(&self, x0: TID, g: &mut Graph) -> Vec<TID> {
        let mut terms = vec![x0];
        if self.max_diffusion_step == 0 { return terms; }
        for &s in &self.supports {
            let x1 = g.diffuse(x0, s);
            terms.push(x1);
            let (mut prev, mut cur) = (x0, x1);
            for _ in 2..=self.max_diffusion_step {
                let sx = g.diffuse(cur, s);
                let sx2 = g.scale(sx, 2.0);
                let next = g.sub(sx2, prev);
                terms.push(next);
                prev = cur;
                cur = next;
            }
        }
        terms
    }

    fn gconv(&self, inputs: TID, state: TID, w: TID, b: TID, g: &mut Graph) -> TID {
        let x0 = g.concat_cols(&[inputs, state]);
        let terms = self.diffusion_terms(x0, g);
        let x = g.concat_cols(&terms);
        let y = g.matmul(x, w);
        g.broadcast_add(y, b)
    }

    pub fn param_ids(&self) -> Vec<TID> {
        vec![self.gate_w, self.gate_b, self.cand_w, self.cand_b]
    }

    pub fn param_specs(&self, prefix: &str, g: &Graph) -> Vec<ParamSpec> {
        ["gate_w", "gate_b", "cand_w", "cand_b"].iter()
            .zip(self.param_ids())
            .map(|(name, t)| ParamSpec::new(format!("{}.{}", prefix, name), g.shape(t)))
            .collect()
    }
}
