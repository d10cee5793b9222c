//! Uncompressed column group: a verbatim sub-matrix for columns that do
//! not pay for bitmap compression

use crate::block::{MatrixBlock, SparseRow};
use crate::ops::{AggOp, ScalarOp};

/// Column group holding its columns as a plain `num_rows x cols.len()`
/// sub-matrix, dense or sparse following the source block.
#[derive(Debug, Clone, PartialEq)]
pub struct UncGroup {
    cols: Vec<usize>,
    data: MatrixBlock,
}

impl UncGroup {
    /// Gather `cols` out of a transposed source block (`C x R`).
    pub(crate) fn from_transposed(transposed: &MatrixBlock, mut cols: Vec<usize>) -> UncGroup {
        cols.sort_unstable();
        let num_rows = transposed.cols();
        let n = cols.len();

        let data = if let Some(src) = transposed.sparse_rows() {
            let mut rows = vec![SparseRow::default(); num_rows];
            for (j, &c) in cols.iter().enumerate() {
                let row = &src[c];
                for (p, &r) in row.idx.iter().enumerate() {
                    rows[r as usize].idx.push(j as u32);
                    rows[r as usize].val.push(row.val[p]);
                }
            }
            let mut blk = MatrixBlock::new_sparse(num_rows, n);
            if let Some(dst) = blk.sparse_mut() {
                for (r, row) in rows.into_iter().enumerate() {
                    dst[r] = row;
                }
            }
            blk.sort_sparse_rows(0, num_rows);
            blk.recompute_nonzeros();
            blk
        } else {
            let mut data = vec![0.0; num_rows * n];
            if let Some(src) = transposed.dense_data() {
                for (j, &c) in cols.iter().enumerate() {
                    for r in 0..num_rows {
                        data[r * n + j] = src[c * num_rows + r];
                    }
                }
            }
            MatrixBlock::from_raw_dense(num_rows, n, data)
        };

        UncGroup { cols, data }
    }

    /// Wrap an already-materialized sub-matrix (scalar-op fallback,
    /// deserialization). `cols` must be ascending.
    pub(crate) fn from_parts(cols: Vec<usize>, data: MatrixBlock) -> UncGroup {
        UncGroup { cols, data }
    }

    /// Column indices covered by this group, ascending.
    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    /// Row count of the owning matrix.
    pub fn num_rows(&self) -> usize {
        self.data.rows()
    }

    /// The wrapped sub-matrix.
    pub fn data(&self) -> &MatrixBlock {
        &self.data
    }

    pub(crate) fn nnz(&self) -> usize {
        self.data.nnz()
    }

    pub(crate) fn get(&self, r: usize, c: usize) -> f64 {
        match self.cols.binary_search(&c) {
            Ok(j) => self.data.get(r, j),
            Err(_) => 0.0,
        }
    }

    pub(crate) fn decompress_dense(&self, out: &mut [f64], stride: usize, rl: usize, ru: usize) {
        for r in rl..ru {
            let base = (r - rl) * stride;
            for (j, &c) in self.cols.iter().enumerate() {
                out[base + c] = self.data.get(r, j);
            }
        }
    }

    pub(crate) fn decompress_sparse(&self, rows_out: &mut [SparseRow], rl: usize, ru: usize) {
        if let Some(src) = self.data.sparse_rows() {
            for r in rl..ru {
                let row = &src[r];
                for (p, &j) in row.idx.iter().enumerate() {
                    if row.val[p] != 0.0 {
                        rows_out[r - rl].idx.push(self.cols[j as usize] as u32);
                        rows_out[r - rl].val.push(row.val[p]);
                    }
                }
            }
        } else {
            for r in rl..ru {
                for (j, &c) in self.cols.iter().enumerate() {
                    let v = self.data.get(r, j);
                    if v != 0.0 {
                        rows_out[r - rl].idx.push(c as u32);
                        rows_out[r - rl].val.push(v);
                    }
                }
            }
        }
    }

    pub(crate) fn count_nonzeros_per_row(&self, rnnz: &mut [usize], rl: usize, ru: usize) {
        self.data.count_nonzeros_per_row(rnnz, rl, ru);
    }

    /// Adds this group's dot products into `out[row - rl]`.
    pub(crate) fn right_mult(&self, v: &[f64], out: &mut [f64], rl: usize, ru: usize) {
        let vsub: Vec<f64> = self.cols.iter().map(|&c| v[c]).collect();
        self.data.right_mult(&vsub, out, rl, ru);
    }

    pub(crate) fn left_mult(&self, v: &[f64], out: &mut [f64]) {
        let mut local = vec![0.0; self.cols.len()];
        self.data.left_mult(v, &mut local);
        for (j, &c) in self.cols.iter().enumerate() {
            out[c] += local[j];
        }
    }

    pub(crate) fn agg_all(&self, op: AggOp) -> f64 {
        self.data.unary_aggregate(op, crate::ops::ReduceDir::All)[(0, 0)]
    }

    pub(crate) fn agg_rows(&self, op: AggOp, out: &mut [f64], rl: usize, ru: usize) {
        self.data.row_aggregate(op, out, rl, ru);
    }

    pub(crate) fn agg_cols(&self, op: AggOp, out: &mut [f64]) {
        let mut local = vec![op.init(); self.cols.len()];
        self.data.col_aggregate(op, &mut local);
        for (j, &c) in self.cols.iter().enumerate() {
            out[c] = op.combine(out[c], local[j]);
        }
    }

    pub(crate) fn scalar_op(&self, op: ScalarOp) -> UncGroup {
        UncGroup {
            cols: self.cols.clone(),
            data: self.data.apply_scalar(op),
        }
    }

    pub(crate) fn shift_cols(&mut self, delta: usize) {
        for c in &mut self.cols {
            *c += delta;
        }
    }

    pub(crate) fn decompress_col(&self, j: usize) -> Vec<f64> {
        self.data.col_vector(j)
    }

    pub(crate) fn estimate_in_memory(&self) -> usize {
        64 + 8 * self.cols.capacity() + self.data.estimate_size_in_memory()
    }
}
