// ============================================================================
// VECTORIZED TENSOR AUTODIFF ENGINE
// Each node = dense row-major matrix. Parameters sit below `param_boundary`,
// everything above it is per-batch tape that `reset()` throws away.
// ============================================================================

use rayon::prelude::*;

use crate::supports::SparseMatrix;

// ============================================================================
// SIMD-FRIENDLY VECTOR OPERATIONS
// These tight loops auto-vectorize with rustc -C opt-level=3 + LTO
// ============================================================================

#[inline]
pub fn vec_add(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x + y).collect()
}

#[inline]
pub fn vec_add_inplace(a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len());
    for (x, y) in a.iter_mut().zip(b.iter()) { *x += y; }
}

#[inline]
pub fn vec_sub(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x - y).collect()
}

#[inline]
pub fn vec_mul(a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).collect()
}

#[inline]
pub fn vec_scale(a: &[f32], s: f32) -> Vec<f32> {
    a.iter().map(|x| x * s).collect()
}

#[inline]
pub fn vec_scale_inplace(a: &mut [f32], s: f32) {
    for x in a.iter_mut() { *x *= s; }
}

#[inline]
pub fn vec_sigmoid(a: &[f32]) -> Vec<f32> {
    a.iter().map(|&x| 1.0 / (1.0 + (-x).exp())).collect()
}

#[inline]
pub fn vec_tanh(a: &[f32]) -> Vec<f32> {
    a.iter().map(|&x| x.tanh()).collect()
}

// ============================================================================
// TAPE
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TID(pub usize);

/// Index of a diffusion support registered on the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupportId(pub usize);

#[derive(Clone, Debug)]
enum TensorOp {
    None,
    MatMul { a: TID, b: TID, m: usize, k: usize, n: usize },
    Add { a: TID, b: TID },
    Sub { a: TID, b: TID },
    Mul { a: TID, b: TID },
    Scale { a: TID, s: f32 },
    Sigmoid { a: TID },
    Tanh { a: TID },
    OneMinus { a: TID },
    BroadcastAdd { a: TID, bias: TID, rows: usize, cols: usize },
    ConcatCols { parts: Vec<TID>, rows: usize },
    ColSlice { a: TID, start: usize, width: usize, rows: usize },
    ConcatRows { parts: Vec<TID> },
    Diffuse { a: TID, support: SupportId, cols: usize },
    MaskedMae { pred: TID, target: TID },
}

struct TensorNode {
    data: Vec<f32>,
    grad: Vec<f32>,
    rows: usize,
    cols: usize,
    op: TensorOp,
    is_param: bool,
}

pub struct Graph {
    nodes: Vec<TensorNode>,
    supports: Vec<SparseMatrix>,
    param_boundary: usize,
}

impl Default for Graph {
    fn default() -> Self { Self::new() }
}

impl Graph {
    pub fn new() -> Self {
        Graph { nodes: Vec::with_capacity(4096), supports: Vec::new(), param_boundary: 0 }
    }

    fn push(&mut self, data: Vec<f32>, rows: usize, cols: usize, op: TensorOp, is_param: bool) -> TID {
        let len = rows * cols;
        debug_assert_eq!(data.len(), len);
        let id = self.nodes.len();
        self.nodes.push(TensorNode { data, grad: vec![0.0; len], rows, cols, op, is_param });
        TID(id)
    }

    pub fn param(&mut self, data: Vec<f32>, rows: usize, cols: usize) -> TID {
        self.push(data, rows, cols, TensorOp::None, true)
    }

    pub fn constant(&mut self, data: Vec<f32>, rows: usize, cols: usize) -> TID {
        self.push(data, rows, cols, TensorOp::None, false)
    }

    pub fn zeros(&mut self, rows: usize, cols: usize) -> TID {
        self.constant(vec![0.0; rows * cols], rows, cols)
    }

    pub fn add_support(&mut self, support: SparseMatrix) -> SupportId {
        self.supports.push(support);
        SupportId(self.supports.len() - 1)
    }

    pub fn freeze_params(&mut self) { self.param_boundary = self.nodes.len(); }

    pub fn reset(&mut self) { self.nodes.truncate(self.param_boundary); }

    pub fn tape_len(&self) -> usize { self.nodes.len() - self.param_boundary }

    pub fn zero_grad(&mut self) {
        for node in self.nodes.iter_mut() {
            for g in node.grad.iter_mut() { *g = 0.0; }
        }
    }

    pub fn data(&self, t: TID) -> &[f32] { &self.nodes[t.0].data }
    pub fn grad(&self, t: TID) -> &[f32] { &self.nodes[t.0].grad }
    pub fn grad_mut(&mut self, t: TID) -> &mut [f32] { &mut self.nodes[t.0].grad }
    pub fn rows(&self, t: TID) -> usize { self.nodes[t.0].rows }
    pub fn cols(&self, t: TID) -> usize { self.nodes[t.0].cols }
    pub fn shape(&self, t: TID) -> (usize, usize) { (self.nodes[t.0].rows, self.nodes[t.0].cols) }
    pub fn is_param(&self, t: TID) -> bool { self.nodes[t.0].is_param }

    pub fn set_data(&mut self, t: TID, values: &[f32]) {
        self.nodes[t.0].data.copy_from_slice(values);
    }

    /// Mutable views of a parameter's value and gradient at once, for optimizers.
    pub fn param_and_grad(&mut self, t: TID) -> (&mut [f32], &[f32]) {
        let node = &mut self.nodes[t.0];
        (&mut node.data, &node.grad)
    }

    // ------------------------------------------------------------------
    // Forward ops: each builds one TensorNode
    // ------------------------------------------------------------------

    pub fn matmul(&mut self, a: TID, b: TID) -> TID {
        let m = self.nodes[a.0].rows;
        let k = self.nodes[a.0].cols;
        let n = self.nodes[b.0].cols;
        debug_assert_eq!(k, self.nodes[b.0].rows, "matmul shape [{},{}] @ [{},{}]",
            m, k, self.nodes[b.0].rows, n);

        let a_data = &self.nodes[a.0].data;
        let b_data = &self.nodes[b.0].data;
        let mut out = vec![0.0f32; m * n];

        // SAFETY: buffers are sized m*k, k*n and m*n with row-major strides.
        unsafe {
            matrixmultiply::sgemm(
                m, k, n,
                1.0,
                a_data.as_ptr(), k as isize, 1,
                b_data.as_ptr(), n as isize, 1,
                0.0,
                out.as_mut_ptr(), n as isize, 1,
            );
        }

        self.push(out, m, n, TensorOp::MatMul { a, b, m, k, n }, false)
    }

    pub fn add(&mut self, a: TID, b: TID) -> TID {
        let data = vec_add(&self.nodes[a.0].data, &self.nodes[b.0].data);
        let (r, c) = self.shape(a);
        self.push(data, r, c, TensorOp::Add { a, b }, false)
    }

    pub fn sub(&mut self, a: TID, b: TID) -> TID {
        let data = vec_sub(&self.nodes[a.0].data, &self.nodes[b.0].data);
        let (r, c) = self.shape(a);
        self.push(data, r, c, TensorOp::Sub { a, b }, false)
    }

    pub fn mul(&mut self, a: TID, b: TID) -> TID {
        let data = vec_mul(&self.nodes[a.0].data, &self.nodes[b.0].data);
        let (r, c) = self.shape(a);
        self.push(data, r, c, TensorOp::Mul { a, b }, false)
    }

    pub fn scale(&mut self, a: TID, s: f32) -> TID {
        let data = vec_scale(&self.nodes[a.0].data, s);
        let (r, c) = self.shape(a);
        self.push(data, r, c, TensorOp::Scale { a, s }, false)
    }

    pub fn sigmoid(&mut self, a: TID) -> TID {
        let data = vec_sigmoid(&self.nodes[a.0].data);
        let (r, c) = self.shape(a);
        self.push(data, r, c, TensorOp::Sigmoid { a }, false)
    }

    pub fn tanh_op(&mut self, a: TID) -> TID {
        let data = vec_tanh(&self.nodes[a.0].data);
        let (r, c) = self.shape(a);
        self.push(data, r, c, TensorOp::Tanh { a }, false)
    }

    pub fn one_minus(&mut self, a: TID) -> TID {
        let data: Vec<f32> = self.nodes[a.0].data.iter().map(|x| 1.0 - x).collect();
        let (r, c) = self.shape(a);
        self.push(data, r, c, TensorOp::OneMinus { a }, false)
    }

    /// [m,n] + [1,n] broadcast bias add
    pub fn broadcast_add(&mut self, a: TID, bias: TID) -> TID {
        let (rows, cols) = self.shape(a);
        debug_assert_eq!(self.nodes[bias.0].data.len(), cols);
        let bd = &self.nodes[bias.0].data;
        let mut out = self.nodes[a.0].data.clone();
        for row in out.chunks_mut(cols) {
            for (o, b) in row.iter_mut().zip(bd.iter()) { *o += b; }
        }
        self.push(out, rows, cols, TensorOp::BroadcastAdd { a, bias, rows, cols }, false)
    }

    /// Feature-wise concatenation of matrices with equal row counts.
    pub fn concat_cols(&mut self, parts: &[TID]) -> TID {
        let rows = self.nodes[parts[0].0].rows;
        let widths: Vec<usize> = parts.iter().map(|p| self.nodes[p.0].cols).collect();
        let cols: usize = widths.iter().sum();
        let mut out = vec![0.0f32; rows * cols];
        let mut off = 0;
        for (p, &w) in parts.iter().zip(widths.iter()) {
            debug_assert_eq!(self.nodes[p.0].rows, rows, "concat_cols row mismatch");
            let src = &self.nodes[p.0].data;
            for r in 0..rows {
                out[r * cols + off..r * cols + off + w].copy_from_slice(&src[r * w..(r + 1) * w]);
            }
            off += w;
        }
        self.push(out, rows, cols, TensorOp::ConcatCols { parts: parts.to_vec(), rows }, false)
    }

    pub fn col_slice(&mut self, a: TID, start: usize, width: usize) -> TID {
        let (rows, cols) = self.shape(a);
        debug_assert!(start + width <= cols);
        let src = &self.nodes[a.0].data;
        let mut out = Vec::with_capacity(rows * width);
        for r in 0..rows {
            out.extend_from_slice(&src[r * cols + start..r * cols + start + width]);
        }
        self.push(out, rows, width, TensorOp::ColSlice { a, start, width, rows }, false)
    }

    /// Row-wise stacking of matrices with equal column counts.
    pub fn concat_rows(&mut self, parts: &[TID]) -> TID {
        let cols = self.nodes[parts[0].0].cols;
        let mut out = Vec::new();
        let mut rows = 0;
        for p in parts {
            debug_assert_eq!(self.nodes[p.0].cols, cols, "concat_rows col mismatch");
            out.extend_from_slice(&self.nodes[p.0].data);
            rows += self.nodes[p.0].rows;
        }
        self.push(out, rows, cols, TensorOp::ConcatRows { parts: parts.to_vec() }, false)
    }

    /// Applies support `S` (n x n) to every n-row block of `a`.
    pub fn diffuse(&mut self, a: TID, support: SupportId) -> TID {
        let (rows, cols) = self.shape(a);
        let s = &self.supports[support.0];
        let n = s.dim();
        debug_assert_eq!(rows % n, 0, "diffuse rows {} not a multiple of {}", rows, n);
        let src = &self.nodes[a.0].data;
        let mut out = vec![0.0f32; rows * cols];
        out.par_chunks_mut(n * cols)
            .zip(src.par_chunks(n * cols))
            .for_each(|(o, x)| s.matmul_dense_into(x, cols, o));
        self.push(out, rows, cols, TensorOp::Diffuse { a, support, cols }, false)
    }

    /// Masked mean absolute error against a constant target. Zero targets are
    /// masked out and the mask is renormalized by its mean.
    pub fn masked_mae(&mut self, pred: TID, target: TID) -> TID {
        let p = &self.nodes[pred.0].data;
        let t = &self.nodes[target.0].data;
        debug_assert_eq!(p.len(), t.len());
        let weights = mae_weights(t);
        let len = p.len().max(1) as f32;
        let total: f32 = p.iter().zip(t.iter()).zip(weights.iter())
            .map(|((&pv, &tv), &w)| {
                let l = (pv - tv).abs() * w;
                if l.is_nan() { 0.0 } else { l }
            })
            .sum();
        self.push(vec![total / len], 1, 1, TensorOp::MaskedMae { pred, target }, false)
    }

    // ------------------------------------------------------------------
    // Backward: vectorized gradient propagation
    // ------------------------------------------------------------------

    pub fn backward(&mut self, loss: TID) {
        self.nodes[loss.0].grad = vec![1.0];
        let n = self.nodes.len();

        for i in (0..n).rev() {
            let has_grad = self.nodes[i].grad.iter().any(|&g| g != 0.0);
            if !has_grad { continue; }

            let op = self.nodes[i].op.clone();
            match op {
                TensorOp::None => {}

                TensorOp::MatMul { a, b, m, k, n: nn } => {
                    let og = self.nodes[i].grad.clone();
                    let a_d = self.nodes[a.0].data.clone();
                    let b_d = self.nodes[b.0].data.clone();
                    // dA = dOut @ B^T
                    {
                        let mut da_buf = vec![0.0f32; m * k];
                        // SAFETY: B^T is read from B[k,nn] with swapped strides.
                        unsafe {
                            matrixmultiply::sgemm(
                                m, nn, k,
                                1.0,
                                og.as_ptr(), nn as isize, 1,
                                b_d.as_ptr(), 1, nn as isize,
                                0.0,
                                da_buf.as_mut_ptr(), k as isize, 1,
                            );
                        }
                        vec_add_inplace(&mut self.nodes[a.0].grad, &da_buf);
                    }
                    // dB = A^T @ dOut
                    {
                        let mut db_buf = vec![0.0f32; k * nn];
                        // SAFETY: A^T is read from A[m,k] with swapped strides.
                        unsafe {
                            matrixmultiply::sgemm(
                                k, m, nn,
                                1.0,
                                a_d.as_ptr(), 1, k as isize,
                                og.as_ptr(), nn as isize, 1,
                                0.0,
                                db_buf.as_mut_ptr(), nn as isize, 1,
                            );
                        }
                        vec_add_inplace(&mut self.nodes[b.0].grad, &db_buf);
                    }
                }

                TensorOp::Add { a, b } => {
                    let g = self.nodes[i].grad.clone();
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    vec_add_inplace(&mut self.nodes[b.0].grad, &g);
                }

                TensorOp::Sub { a, b } => {
                    let g = self.nodes[i].grad.clone();
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    for (bg, &og) in self.nodes[b.0].grad.iter_mut().zip(g.iter()) { *bg -= og; }
                }

                TensorOp::Mul { a, b } => {
                    let g = self.nodes[i].grad.clone();
                    let a_d = self.nodes[a.0].data.clone();
                    let b_d = self.nodes[b.0].data.clone();
                    for j in 0..g.len() {
                        self.nodes[a.0].grad[j] += g[j] * b_d[j];
                        self.nodes[b.0].grad[j] += g[j] * a_d[j];
                    }
                }

                TensorOp::Scale { a, s } => {
                    let g = self.nodes[i].grad.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] += g[j] * s; }
                }

                TensorOp::Sigmoid { a } => {
                    let g = self.nodes[i].grad.clone();
                    let od = self.nodes[i].data.clone();
                    for j in 0..g.len() {
                        let s = od[j];
                        self.nodes[a.0].grad[j] += g[j] * s * (1.0 - s);
                    }
                }

                TensorOp::Tanh { a } => {
                    let g = self.nodes[i].grad.clone();
                    let od = self.nodes[i].data.clone();
                    for j in 0..g.len() {
                        let t = od[j];
                        self.nodes[a.0].grad[j] += g[j] * (1.0 - t * t);
                    }
                }

                TensorOp::OneMinus { a } => {
                    let g = self.nodes[i].grad.clone();
                    for j in 0..g.len() { self.nodes[a.0].grad[j] -= g[j]; }
                }

                TensorOp::BroadcastAdd { a, bias, rows: rr, cols: cc } => {
                    let g = self.nodes[i].grad.clone();
                    vec_add_inplace(&mut self.nodes[a.0].grad, &g);
                    for ii in 0..rr {
                        let off = ii * cc;
                        for j in 0..cc { self.nodes[bias.0].grad[j] += g[off + j]; }
                    }
                }

                TensorOp::ConcatCols { parts, rows } => {
                    let g = self.nodes[i].grad.clone();
                    let cols = self.nodes[i].cols;
                    let mut off = 0;
                    for p in parts {
                        let w = self.nodes[p.0].cols;
                        let pg = &mut self.nodes[p.0].grad;
                        for r in 0..rows {
                            vec_add_inplace(&mut pg[r * w..(r + 1) * w], &g[r * cols + off..r * cols + off + w]);
                        }
                        off += w;
                    }
                }

                TensorOp::ColSlice { a, start, width, rows } => {
                    let g = self.nodes[i].grad.clone();
                    let cols = self.nodes[a.0].cols;
                    let ag = &mut self.nodes[a.0].grad;
                    for r in 0..rows {
                        vec_add_inplace(&mut ag[r * cols + start..r * cols + start + width], &g[r * width..(r + 1) * width]);
                    }
                }

                TensorOp::ConcatRows { parts } => {
                    let g = self.nodes[i].grad.clone();
                    let mut off = 0;
                    for p in parts {
                        let len = self.nodes[p.0].grad.len();
                        vec_add_inplace(&mut self.nodes[p.0].grad, &g[off..off + len]);
                        off += len;
                    }
                }

                TensorOp::Diffuse { a, support, cols } => {
                    let g = self.nodes[i].grad.clone();
                    let s = &self.supports[support.0];
                    let n = s.dim();
                    let mut da = vec![0.0f32; g.len()];
                    da.par_chunks_mut(n * cols)
                        .zip(g.par_chunks(n * cols))
                        .for_each(|(o, gb)| s.matmul_transposed_dense_into(gb, cols, o));
                    vec_add_inplace(&mut self.nodes[a.0].grad, &da);
                }

                TensorOp::MaskedMae { pred, target } => {
                    let gv = self.nodes[i].grad[0];
                    let p = self.nodes[pred.0].data.clone();
                    let t = self.nodes[target.0].data.clone();
                    let weights = mae_weights(&t);
                    let inv_len = 1.0 / p.len().max(1) as f32;
                    let pg = &mut self.nodes[pred.0].grad;
                    for j in 0..p.len() {
                        let diff = p[j] - t[j];
                        let w = weights[j];
                        if !(diff * w).is_finite() || diff == 0.0 { continue; }
                        pg[j] += gv * diff.signum() * w * inv_len;
                    }
                }
            }
        }
    }
}

/// `mask / mean(mask)` with `mask = target != 0`. An all-zero target yields NaN
/// weights, which the loss maps to zero.
fn mae_weights(target: &[f32]) -> Vec<f32> {
    let mask: Vec<f32> = target.iter().map(|&t| if t != 0.0 { 1.0 } else { 0.0 }).collect();
    let mean = mask.iter().sum::<f32>() / mask.len().max(1) as f32;
    mask.iter().map(|&m| m / mean).collect()
}
