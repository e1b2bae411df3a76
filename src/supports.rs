// ============================================================================
// SENSOR GRAPH: adjacency loading and diffusion supports
// ============================================================================

use std::fs;
use std::path::Path;

use log::debug;
use serde::Deserialize;

use crate::config::FilterType;
use crate::error::{DcrnnError, Result};

/// Dense square adjacency matrix, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Adjacency {
    n: usize,
    values: Vec<f32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AdjacencyFile {
    Wrapped { x: Vec<Vec<f32>> },
    Bare(Vec<Vec<f32>>),
}

impl Adjacency {
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let n = rows.len();
        if n == 0 {
            return Err(DcrnnError::Shape("adjacency matrix is empty".into()));
        }
        let mut values = Vec::with_capacity(n * n);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != n {
                return Err(DcrnnError::Shape(format!(
                    "adjacency row {} has {} entries, expected {}", i, row.len(), n)));
            }
            values.extend(row);
        }
        Ok(Adjacency { n, values })
    }

    pub fn from_dense(values: Vec<f32>, n: usize) -> Result<Self> {
        if values.len() != n * n || n == 0 {
            return Err(DcrnnError::Shape(format!(
                "adjacency has {} values, expected {}x{}", values.len(), n, n)));
        }
        Ok(Adjacency { n, values })
    }

    /// Loads `{"x": [[...]]}` or a bare `[[...]]` JSON matrix.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| DcrnnError::io(path, e))?;
        let file: AdjacencyFile = serde_json::from_str(&text).map_err(|e| DcrnnError::json(path, e))?;
        let rows = match file {
            AdjacencyFile::Wrapped { x } => x,
            AdjacencyFile::Bare(x) => x,
        };
        let adj = Self::from_rows(rows)?;
        debug!("Loaded {}x{} adjacency from {}", adj.n, adj.n, path.display());
        Ok(adj)
    }

    pub fn num_nodes(&self) -> usize { self.n }

    pub fn get(&self, i: usize, j: usize) -> f32 { self.values[i * self.n + j] }

    pub fn transpose(&self) -> Adjacency {
        let n = self.n;
        let mut out = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n { out[j * n + i] = self.values[i * n + j]; }
        }
        Adjacency { n, values: out }
    }

    fn symmetrized(&self) -> Adjacency {
        let n = self.n;
        let mut out = self.values.clone();
        for i in 0..n {
            for j in 0..n { out[i * n + j] = self.values[i * n + j].max(self.values[j * n + i]); }
        }
        Adjacency { n, values: out }
    }

    fn row_sums(&self) -> Vec<f32> {
        self.values.chunks(self.n).map(|r| r.iter().sum()).collect()
    }
}

/// `D^-1 A`; rows with zero degree stay zero.
pub fn random_walk_matrix(adj: &Adjacency) -> Adjacency {
    let n = adj.n;
    let d_inv: Vec<f32> = adj.row_sums().iter().map(|&d| if d == 0.0 { 0.0 } else { 1.0 / d }).collect();
    let mut out = adj.values.clone();
    for i in 0..n {
        for j in 0..n { out[i * n + j] *= d_inv[i]; }
    }
    Adjacency { n, values: out }
}

pub fn reverse_random_walk_matrix(adj: &Adjacency) -> Adjacency {
    random_walk_matrix(&adj.transpose())
}

/// `I - D^-1/2 A D^-1/2`.
pub fn normalized_laplacian(adj: &Adjacency) -> Adjacency {
    let n = adj.n;
    let d_inv_sqrt: Vec<f32> = adj.row_sums().iter()
        .map(|&d| if d <= 0.0 { 0.0 } else { 1.0 / d.sqrt() })
        .collect();
    let mut out = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            let eye = if i == j { 1.0 } else { 0.0 };
            out[i * n + j] = eye - d_inv_sqrt[i] * adj.values[i * n + j] * d_inv_sqrt[j];
        }
    }
    Adjacency { n, values: out }
}

/// `2 L / lambda_max - I`. When `lambda_max` is `None` it is estimated by power iteration.
pub fn scaled_laplacian(adj: &Adjacency, lambda_max: Option<f32>, undirected: bool) -> Adjacency {
    let base = if undirected { adj.symmetrized() } else { adj.clone() };
    let lap = normalized_laplacian(&base);
    let lambda = lambda_max.unwrap_or_else(|| largest_eigenvalue(&lap, 100)).max(1e-6);
    let n = lap.n;
    let mut out = lap.values;
    for i in 0..n {
        for j in 0..n {
            let eye = if i == j { 1.0 } else { 0.0 };
            out[i * n + j] = 2.0 / lambda * out[i * n + j] - eye;
        }
    }
    Adjacency { n, values: out }
}

/// Largest-magnitude eigenvalue via power iteration.
fn largest_eigenvalue(m: &Adjacency, iters: usize) -> f32 {
    let n = m.n;
    // uneven start so it is never orthogonal to the dominant eigenvector of a regular graph
    let start: Vec<f32> = (0..n).map(|i| (i + 1) as f32).collect();
    let start_norm = start.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mut v: Vec<f32> = start.into_iter().map(|x| x / start_norm).collect();
    let mut lambda = 0.0;
    for _ in 0..iters {
        let w: Vec<f32> = m.values.chunks(n)
            .map(|row| row.iter().zip(v.iter()).map(|(a, b)| a * b).sum())
            .collect();
        let norm = w.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 { return 0.0; }
        lambda = v.iter().zip(w.iter()).map(|(a, b)| a * b).sum();
        v = w.into_iter().map(|x| x / norm).collect();
    }
    lambda.abs()
}

/// Diffusion supports for a filter type, already in the orientation the cell applies them.
pub fn build_supports(adj: &Adjacency, filter_type: FilterType) -> Vec<SparseMatrix> {
    let dense = match filter_type {
        FilterType::Laplacian => vec![scaled_laplacian(adj, None, true)],
        FilterType::RandomWalk => vec![random_walk_matrix(adj).transpose()],
        FilterType::DualRandomWalk => vec![
            random_walk_matrix(adj).transpose(),
            reverse_random_walk_matrix(adj).transpose(),
        ],
    };
    dense.iter().map(|m| SparseMatrix::from_dense(&m.values, m.n)).collect()
}

// ============================================================================
// CSR SPARSE MATRIX
// ============================================================================

#[derive(Clone, Debug)]
pub struct SparseMatrix {
    n: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f32>,
}

impl SparseMatrix {
    pub fn from_dense(dense: &[f32], n: usize) -> Self {
        debug_assert_eq!(dense.len(), n * n);
        let mut indptr = Vec::with_capacity(n + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        indptr.push(0);
        for row in dense.chunks(n) {
            for (j, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    indices.push(j);
                    values.push(v);
                }
            }
            indptr.push(indices.len());
        }
        SparseMatrix { n, indptr, indices, values }
    }

    pub fn dim(&self) -> usize { self.n }

    pub fn nnz(&self) -> usize { self.values.len() }

    /// `out = S @ x` where `x` is `n x cols` row-major. `out` must be zeroed.
    pub fn matmul_dense_into(&self, x: &[f32], cols: usize, out: &mut [f32]) {
        for i in 0..self.n {
            let dst = &mut out[i * cols..(i + 1) * cols];
            for k in self.indptr[i]..self.indptr[i + 1] {
                let (j, v) = (self.indices[k], self.values[k]);
                let src = &x[j * cols..(j + 1) * cols];
                for (o, s) in dst.iter_mut().zip(src.iter()) { *o += v * s; }
            }
        }
    }

    /// `out += S^T @ g` where `g` is `n x cols` row-major.
    pub fn matmul_transposed_dense_into(&self, g: &[f32], cols: usize, out: &mut [f32]) {
        for i in 0..self.n {
            let src = &g[i * cols..(i + 1) * cols];
            for k in self.indptr[i]..self.indptr[i + 1] {
                let (j, v) = (self.indices[k], self.values[k]);
                let dst = &mut out[j * cols..(j + 1) * cols];
                for (o, s) in dst.iter_mut().zip(src.iter()) { *o += v * s; }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_graph() -> Adjacency {
        Adjacency::from_rows(vec![
            vec![0.0, 1.0, 0.0],
            vec![1.0, 0.0, 3.0],
            vec![0.0, 0.0, 0.0],
        ]).unwrap()
    }

    #[test]
    fn random_walk_rows_sum_to_one_or_zero() {
        let rw = random_walk_matrix(&line_graph());
        let sums = rw.row_sums();
        assert!((sums[0] - 1.0).abs() < 1e-6);
        assert!((sums[1] - 1.0).abs() < 1e-6);
        assert_eq!(sums[2], 0.0);
        assert!((rw.get(1, 2) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn scaled_laplacian_with_lambda_two_is_negated_normalized_adjacency() {
        let adj = Adjacency::from_rows(vec![vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
        let l = scaled_laplacian(&adj, Some(2.0), true);
        assert!((l.get(0, 0)).abs() < 1e-6);
        assert!((l.get(0, 1) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn power_iteration_finds_laplacian_spectrum_edge() {
        let adj = Adjacency::from_rows(vec![vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
        // eigenvalues of the normalized Laplacian of K2 are 0 and 2
        let lambda = largest_eigenvalue(&normalized_laplacian(&adj), 200);
        assert!((lambda - 2.0).abs() < 1e-3);
    }

    #[test]
    fn dual_random_walk_has_two_supports() {
        let adj = line_graph();
        assert_eq!(build_supports(&adj, FilterType::DualRandomWalk).len(), 2);
        assert_eq!(build_supports(&adj, FilterType::RandomWalk).len(), 1);
        assert_eq!(build_supports(&adj, FilterType::Laplacian).len(), 1);
    }

    #[test]
    fn sparse_products_match_dense() {
        let dense = [1.0, 0.0, 2.0, 0.0, 0.0, 3.0, 4.0, 0.0, 0.0];
        let s = SparseMatrix::from_dense(&dense, 3);
        assert_eq!(s.nnz(), 4);
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = vec![0.0; 6];
        s.matmul_dense_into(&x, 2, &mut out);
        assert_eq!(out, vec![11.0, 14.0, 15.0, 18.0, 4.0, 8.0]);

        let mut back = vec![0.0; 6];
        s.matmul_transposed_dense_into(&x, 2, &mut back);
        // S^T = [[1,0,4],[0,0,0],[2,3,0]]
        assert_eq!(back, vec![21.0, 26.0, 0.0, 0.0, 11.0, 16.0]);
    }

    #[test]
    fn ragged_adjacency_is_rejected() {
        let err = Adjacency::from_rows(vec![vec![0.0, 1.0], vec![1.0]]).unwrap_err();
        assert!(matches!(err, DcrnnError::Shape(_)));
    }
}
