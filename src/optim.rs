// ============================================================================
// PARAMETER COLLECTION, ADAM, GRADIENT CLIPPING, LR SCHEDULE
// ============================================================================

use crate::autodiff::{vec_scale_inplace, Graph, TID};

pub struct ParamSet {
    pub ids: Vec<TID>,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl ParamSet {
    pub fn new(ids: Vec<TID>, g: &Graph) -> Self {
        let m: Vec<Vec<f32>> = ids.iter().map(|&t| vec![0.0; g.data(t).len()]).collect();
        let v: Vec<Vec<f32>> = ids.iter().map(|&t| vec![0.0; g.data(t).len()]).collect();
        ParamSet { ids, m, v }
    }

    pub fn total_params(&self, g: &Graph) -> usize {
        self.ids.iter().map(|&t| g.data(t).len()).sum()
    }
}

// ============================================================================
// ADAM: vectorized, bias-corrected moments
// ============================================================================

pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub t: usize,
}

impl Adam {
    pub fn new(lr: f32, eps: f32) -> Self {
        Adam { lr, beta1: 0.9, beta2: 0.999, eps, t: 0 }
    }

    pub fn step(&mut self, g: &mut Graph, ps: &mut ParamSet) {
        self.t += 1;
        let t = self.t as f32;
        let bc1 = 1.0 - self.beta1.powf(t);
        let bc2 = 1.0 - self.beta2.powf(t);

        for (idx, &tid) in ps.ids.iter().enumerate() {
            let (data, grad) = g.param_and_grad(tid);
            let pm = &mut ps.m[idx];
            let pv = &mut ps.v[idx];
            for j in 0..data.len() {
                let gr = grad[j];
                pm[j] = self.beta1 * pm[j] + (1.0 - self.beta1) * gr;
                pv[j] = self.beta2 * pv[j] + (1.0 - self.beta2) * gr * gr;
                let m_hat = pm[j] / bc1;
                let v_hat = pv[j] / bc2;
                data[j] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }
}

/// Rescales gradients in place so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(g: &mut Graph, pids: &[TID], max_norm: f32) -> f32 {
    let mut tn = 0.0f32;
    for &t in pids { for &gv in g.grad(t) { tn += gv * gv; } }
    tn = tn.sqrt();
    if tn > max_norm {
        let s = max_norm / (tn + 1e-6);
        for &t in pids { vec_scale_inplace(g.grad_mut(t), s); }
    }
    tn
}

/// Decays the learning rate by `gamma` each time the epoch counter reaches a milestone.
#[derive(Clone, Debug)]
pub struct MultiStepLr {
    base_lr: f32,
    milestones: Vec<usize>,
    gamma: f32,
    last_epoch: usize,
}

impl MultiStepLr {
    pub fn new(base_lr: f32, milestones: &[usize], gamma: f32) -> Self {
        let mut milestones = milestones.to_vec();
        milestones.sort_unstable();
        MultiStepLr { base_lr, milestones, gamma, last_epoch: 0 }
    }

    /// Starts the schedule as if `epochs` steps had already been taken.
    pub fn fast_forward(&mut self, epochs: usize) { self.last_epoch = epochs; }

    pub fn step(&mut self, opt: &mut Adam) {
        self.last_epoch += 1;
        opt.lr = self.last_lr();
    }

    pub fn last_lr(&self) -> f32 {
        let passed = self.milestones.iter().filter(|&&m| m <= self.last_epoch).count();
        self.base_lr * self.gamma.powi(passed as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multistep_decays_once_per_milestone() {
        let mut opt = Adam::new(0.01, 1e-8);
        let mut sched = MultiStepLr::new(0.01, &[2, 4], 0.1);
        let mut lrs = Vec::new();
        for _ in 0..5 {
            sched.step(&mut opt);
            lrs.push(opt.lr);
        }
        let expected = [0.01, 0.001, 0.001, 0.0001, 0.0001];
        for (got, want) in lrs.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-9, "{:?}", lrs);
        }
    }

    #[test]
    fn repeated_milestones_compound() {
        let mut sched = MultiStepLr::new(1.0, &[1, 1], 0.5);
        let mut opt = Adam::new(1.0, 1e-8);
        sched.step(&mut opt);
        assert!((opt.lr - 0.25).abs() < 1e-9);
    }

    #[test]
    fn clipping_caps_global_norm() {
        let mut g = Graph::new();
        let a = g.param(vec![0.0, 0.0], 1, 2);
        let b = g.param(vec![0.0], 1, 1);
        g.grad_mut(a).copy_from_slice(&[3.0, 0.0]);
        g.grad_mut(b).copy_from_slice(&[4.0]);
        let before = clip_grad_norm(&mut g, &[a, b], 1.0);
        assert!((before - 5.0).abs() < 1e-6);
        let after: f32 = g.grad(a).iter().chain(g.grad(b)).map(|x| x * x).sum::<f32>().sqrt();
        assert!((after - 1.0).abs() < 1e-4);
    }

    #[test]
    fn clipping_leaves_small_gradients_alone() {
        let mut g = Graph::new();
        let a = g.param(vec![0.0, 0.0], 1, 2);
        g.grad_mut(a).copy_from_slice(&[0.3, 0.4]);
        clip_grad_norm(&mut g, &[a], 1.0);
        assert_eq!(g.grad(a), &[0.3, 0.4]);
    }

    #[test]
    fn adam_first_step_moves_by_lr_against_gradient() {
        let mut g = Graph::new();
        let p = g.param(vec![1.0, -1.0], 1, 2);
        g.freeze_params();
        let mut ps = ParamSet::new(vec![p], &g);
        g.grad_mut(p).copy_from_slice(&[2.0, -0.5]);
        let mut opt = Adam::new(0.1, 1e-8);
        opt.step(&mut g, &mut ps);
        let d = g.data(p);
        assert!((d[0] - 0.9).abs() < 1e-5);
        assert!((d[1] + 0.9).abs() < 1e-5);
    }

    #[test]
    fn zero_gradient_leaves_parameters_in_place() {
        let mut g = Graph::new();
        let p = g.param(vec![3.0, -2.0], 1, 2);
        g.freeze_params();
        let mut ps = ParamSet::new(vec![p], &g);
        let mut opt = Adam::new(0.5, 1e-8);
        for _ in 0..3 { opt.step(&mut g, &mut ps); }
        assert_eq!(g.data(p), &[3.0, -2.0]);
    }
}
