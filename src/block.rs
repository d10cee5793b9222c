//! Uncompressed matrix blocks in dense or sparse-row layout
//!
//! `MatrixBlock` is the plain representation that feeds the compressor and
//! receives decompressed output. It also carries the small operator surface
//! the decompress-fallback path delegates to.

use crate::error::{Result, ZipError};
use crate::ops::{AggOp, ReduceDir, ScalarOp};
use ndarray::{Array2, ArrayView2};

/// One sparse row: parallel column-index / value arrays, indices ascending
/// once the row has been sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseRow {
    pub(crate) idx: Vec<u32>,
    pub(crate) val: Vec<f64>,
}

impl SparseRow {
    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.idx.len()
    }

    /// True if the row stores no entries.
    pub fn is_empty(&self) -> bool {
        self.idx.is_empty()
    }

    fn get(&self, c: u32) -> f64 {
        match self.idx.binary_search(&c) {
            Ok(p) => self.val[p],
            Err(_) => 0.0,
        }
    }

    pub(crate) fn sort(&mut self) {
        let mut perm: Vec<usize> = (0..self.idx.len()).collect();
        perm.sort_unstable_by_key(|&p| self.idx[p]);
        self.idx = perm.iter().map(|&p| self.idx[p]).collect();
        self.val = perm.iter().map(|&p| self.val[p]).collect();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BlockData {
    Dense(Vec<f64>),
    Sparse(Vec<SparseRow>),
}

/// An uncompressed matrix block, row-major dense or sparse-row layout.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixBlock {
    pub(crate) rows: usize,
    pub(crate) cols: usize,
    pub(crate) nnz: usize,
    pub(crate) data: BlockData,
}

impl MatrixBlock {
    /// Create an all-zero dense block.
    pub fn new_dense(rows: usize, cols: usize) -> MatrixBlock {
        MatrixBlock {
            rows,
            cols,
            nnz: 0,
            data: BlockData::Dense(vec![0.0; rows * cols]),
        }
    }

    /// Create an empty sparse block.
    pub fn new_sparse(rows: usize, cols: usize) -> MatrixBlock {
        MatrixBlock {
            rows,
            cols,
            nnz: 0,
            data: BlockData::Sparse(vec![SparseRow::default(); rows]),
        }
    }

    /// Build a dense block from a row-major buffer of `rows * cols` cells.
    pub(crate) fn from_raw_dense(rows: usize, cols: usize, data: Vec<f64>) -> MatrixBlock {
        debug_assert_eq!(data.len(), rows * cols);
        let nnz = data.iter().filter(|&&x| x != 0.0).count();
        MatrixBlock {
            rows,
            cols,
            nnz,
            data: BlockData::Dense(data),
        }
    }

    /// Build a dense block from a 2D array view.
    pub fn from_dense(v: ArrayView2<f64>) -> MatrixBlock {
        let (rows, cols) = v.dim();
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(v[(r, c)]);
            }
        }
        let nnz = data.iter().filter(|&&x| x != 0.0).count();
        MatrixBlock {
            rows,
            cols,
            nnz,
            data: BlockData::Dense(data),
        }
    }

    /// Build a sparse block from a `sprs` CSR matrix.
    pub fn from_csmat(m: &sprs::CsMat<f64>) -> MatrixBlock {
        let m = if m.is_csr() { m.clone() } else { m.to_csr() };
        let (rows, cols) = m.shape();
        let mut out = MatrixBlock::new_sparse(rows, cols);
        for (r, row) in m.outer_iterator().enumerate() {
            for (c, &v) in row.iter() {
                if v != 0.0 {
                    out.push_sparse(r, c as u32, v);
                }
            }
        }
        out.nnz = out.recompute_nonzeros();
        out
    }

    /// Convert to a `sprs` CSR matrix.
    pub fn to_csmat(&self) -> sprs::CsMat<f64> {
        let mut tri = sprs::TriMat::with_capacity((self.rows, self.cols), self.nnz);
        for r in 0..self.rows {
            for c in 0..self.cols {
                let v = self.get(r, c);
                if v != 0.0 {
                    tri.add_triplet(r, c, v);
                }
            }
        }
        tri.to_csr()
    }

    /// Convert to a dense 2D array.
    pub fn to_dense(&self) -> Array2<f64> {
        let mut arr = Array2::zeros((self.rows, self.cols));
        match &self.data {
            BlockData::Dense(d) => {
                for r in 0..self.rows {
                    for c in 0..self.cols {
                        arr[(r, c)] = d[r * self.cols + c];
                    }
                }
            }
            BlockData::Sparse(rows) => {
                for (r, row) in rows.iter().enumerate() {
                    for (p, &c) in row.idx.iter().enumerate() {
                        arr[(r, c as usize)] = row.val[p];
                    }
                }
            }
        }
        arr
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Recorded number of non-zero cells.
    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// True if the block is in sparse-row layout.
    pub fn is_sparse(&self) -> bool {
        matches!(self.data, BlockData::Sparse(_))
    }

    /// Fraction of non-zero cells.
    pub fn sparsity(&self) -> f64 {
        if self.rows == 0 || self.cols == 0 {
            return 0.0;
        }
        self.nnz as f64 / (self.rows * self.cols) as f64
    }

    /// Value at `(r, c)`.
    pub fn get(&self, r: usize, c: usize) -> f64 {
        debug_assert!(r < self.rows && c < self.cols);
        match &self.data {
            BlockData::Dense(d) => d[r * self.cols + c],
            BlockData::Sparse(rows) => rows[r].get(c as u32),
        }
    }

    /// Set the value at `(r, c)`. Does not maintain `nnz`; callers run
    /// [`MatrixBlock::recompute_nonzeros`] when done writing.
    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        debug_assert!(r < self.rows && c < self.cols);
        let cols = self.cols;
        match &mut self.data {
            BlockData::Dense(d) => d[r * cols + c] = v,
            BlockData::Sparse(rows) => {
                let row = &mut rows[r];
                match row.idx.binary_search(&(c as u32)) {
                    Ok(p) => row.val[p] = v,
                    Err(p) => {
                        if v != 0.0 {
                            row.idx.insert(p, c as u32);
                            row.val.insert(p, v);
                        }
                    }
                }
            }
        }
    }

    /// Append an entry to a sparse row without keeping it sorted.
    /// Decompression appends group-by-group and sorts once at the end.
    pub(crate) fn push_sparse(&mut self, r: usize, c: u32, v: f64) {
        if let BlockData::Sparse(rows) = &mut self.data {
            rows[r].idx.push(c);
            rows[r].val.push(v);
        }
    }

    /// Reserve sparse-row capacities for rows `[rl, ru)`; `rnnz[i]` is the
    /// expected entry count of row `rl + i`.
    pub(crate) fn allocate_sparse_rows(&mut self, rnnz: &[usize], rl: usize) {
        if let BlockData::Sparse(rows) = &mut self.data {
            for (i, &n) in rnnz.iter().enumerate() {
                rows[rl + i].idx.reserve(n);
                rows[rl + i].val.reserve(n);
            }
        }
    }

    /// Sort sparse rows `[rl, ru)` by column index.
    pub(crate) fn sort_sparse_rows(&mut self, rl: usize, ru: usize) {
        if let BlockData::Sparse(rows) = &mut self.data {
            for row in &mut rows[rl..ru] {
                row.sort();
            }
        }
    }

    /// Recount the non-zero cells and store the result.
    pub fn recompute_nonzeros(&mut self) -> usize {
        let nnz = match &self.data {
            BlockData::Dense(d) => d.iter().filter(|&&x| x != 0.0).count(),
            BlockData::Sparse(rows) => rows
                .iter()
                .map(|row| row.val.iter().filter(|&&x| x != 0.0).count())
                .sum(),
        };
        self.nnz = nnz;
        nnz
    }

    /// Transposed copy, preserving the layout kind.
    pub fn transpose(&self) -> MatrixBlock {
        match &self.data {
            BlockData::Dense(d) => {
                let mut out = vec![0.0; self.rows * self.cols];
                for r in 0..self.rows {
                    for c in 0..self.cols {
                        out[c * self.rows + r] = d[r * self.cols + c];
                    }
                }
                MatrixBlock {
                    rows: self.cols,
                    cols: self.rows,
                    nnz: self.nnz,
                    data: BlockData::Dense(out),
                }
            }
            BlockData::Sparse(rows) => {
                let mut out = vec![SparseRow::default(); self.cols];
                for (r, row) in rows.iter().enumerate() {
                    for (p, &c) in row.idx.iter().enumerate() {
                        out[c as usize].idx.push(r as u32);
                        out[c as usize].val.push(row.val[p]);
                    }
                }
                MatrixBlock {
                    rows: self.cols,
                    cols: self.rows,
                    nnz: self.nnz,
                    data: BlockData::Sparse(out),
                }
            }
        }
    }

    pub(crate) fn dense_data(&self) -> Option<&[f64]> {
        match &self.data {
            BlockData::Dense(d) => Some(d),
            BlockData::Sparse(_) => None,
        }
    }

    pub(crate) fn sparse_rows(&self) -> Option<&[SparseRow]> {
        match &self.data {
            BlockData::Sparse(rows) => Some(rows),
            BlockData::Dense(_) => None,
        }
    }

    pub(crate) fn dense_mut(&mut self) -> Option<&mut [f64]> {
        match &mut self.data {
            BlockData::Dense(d) => Some(d),
            BlockData::Sparse(_) => None,
        }
    }

    pub(crate) fn sparse_mut(&mut self) -> Option<&mut [SparseRow]> {
        match &mut self.data {
            BlockData::Sparse(rows) => Some(rows),
            BlockData::Dense(_) => None,
        }
    }

    /// Dense copy of row `r`.
    pub(crate) fn row_vector(&self, r: usize) -> Vec<f64> {
        match &self.data {
            BlockData::Dense(d) => d[r * self.cols..(r + 1) * self.cols].to_vec(),
            BlockData::Sparse(rows) => {
                let mut out = vec![0.0; self.cols];
                for (p, &c) in rows[r].idx.iter().enumerate() {
                    out[c as usize] = rows[r].val[p];
                }
                out
            }
        }
    }

    /// Apply a scalar operation cell-wise, producing a new block.
    /// Zero-breaking ops densify sparse inputs.
    pub fn apply_scalar(&self, op: ScalarOp) -> MatrixBlock {
        let mut out = match (&self.data, op.preserves_zero()) {
            (BlockData::Dense(d), _) => MatrixBlock {
                rows: self.rows,
                cols: self.cols,
                nnz: 0,
                data: BlockData::Dense(d.iter().map(|&v| op.apply(v)).collect()),
            },
            (BlockData::Sparse(rows), true) => {
                let mapped = rows
                    .iter()
                    .map(|row| SparseRow {
                        idx: row.idx.clone(),
                        val: row.val.iter().map(|&v| op.apply(v)).collect(),
                    })
                    .collect();
                MatrixBlock {
                    rows: self.rows,
                    cols: self.cols,
                    nnz: 0,
                    data: BlockData::Sparse(mapped),
                }
            }
            (BlockData::Sparse(_), false) => {
                let zero = op.apply(0.0);
                let mut d = vec![zero; self.rows * self.cols];
                if let BlockData::Sparse(rows) = &self.data {
                    for (r, row) in rows.iter().enumerate() {
                        for (p, &c) in row.idx.iter().enumerate() {
                            d[r * self.cols + c as usize] = op.apply(row.val[p]);
                        }
                    }
                }
                MatrixBlock {
                    rows: self.rows,
                    cols: self.cols,
                    nnz: 0,
                    data: BlockData::Dense(d),
                }
            }
        };
        out.recompute_nonzeros();
        out
    }

    /// Copy of rows `[rl, ru)`.
    pub fn slice_rows(&self, rl: usize, ru: usize) -> Result<MatrixBlock> {
        if rl > ru || ru > self.rows {
            return Err(ZipError::InvariantViolation(format!(
                "row range [{rl},{ru}) out of bounds for {} rows",
                self.rows
            )));
        }
        let mut out = match &self.data {
            BlockData::Dense(d) => MatrixBlock {
                rows: ru - rl,
                cols: self.cols,
                nnz: 0,
                data: BlockData::Dense(d[rl * self.cols..ru * self.cols].to_vec()),
            },
            BlockData::Sparse(rows) => MatrixBlock {
                rows: ru - rl,
                cols: self.cols,
                nnz: 0,
                data: BlockData::Sparse(rows[rl..ru].to_vec()),
            },
        };
        out.recompute_nonzeros();
        Ok(out)
    }

    /// Stack `other` below this block.
    pub fn rbind(&self, other: &MatrixBlock) -> Result<MatrixBlock> {
        if self.cols != other.cols {
            return Err(ZipError::InvariantViolation(format!(
                "rbind column mismatch: {} vs {}",
                self.cols, other.cols
            )));
        }
        let mut out = MatrixBlock::new_dense(self.rows + other.rows, self.cols);
        for (base, src) in [(0, self), (self.rows, other)] {
            for r in 0..src.rows {
                for c in 0..src.cols {
                    let v = src.get(r, c);
                    if v != 0.0 {
                        out.set(base + r, c, v);
                    }
                }
            }
        }
        out.recompute_nonzeros();
        Ok(out)
    }

    /// Replace every cell equal to `pattern` with `replacement`.
    pub fn replace(&self, pattern: f64, replacement: f64) -> MatrixBlock {
        let mut out = MatrixBlock::new_dense(self.rows, self.cols);
        for r in 0..self.rows {
            for c in 0..self.cols {
                let v = self.get(r, c);
                let v = if v == pattern || (v.is_nan() && pattern.is_nan()) {
                    replacement
                } else {
                    v
                };
                out.set(r, c, v);
            }
        }
        out.recompute_nonzeros();
        out
    }

    /// `out[r - rl] += sum_c A[r, c] * v[c]` for rows `[rl, ru)`. Callers
    /// hand in a zeroed buffer; accumulation keeps column-appended blocks
    /// with several uncompressed groups correct.
    pub(crate) fn right_mult(&self, v: &[f64], out: &mut [f64], rl: usize, ru: usize) {
        debug_assert_eq!(v.len(), self.cols);
        debug_assert_eq!(out.len(), ru - rl);
        match &self.data {
            BlockData::Dense(d) => {
                for r in rl..ru {
                    out[r - rl] += crate::vecmath::dot(&d[r * self.cols..(r + 1) * self.cols], v);
                }
            }
            BlockData::Sparse(rows) => {
                for r in rl..ru {
                    let row = &rows[r];
                    let mut acc = 0.0;
                    for (p, &c) in row.idx.iter().enumerate() {
                        acc += row.val[p] * v[c as usize];
                    }
                    out[r - rl] += acc;
                }
            }
        }
    }

    /// `out[c] += sum_r v[r] * A[r, c]`.
    pub(crate) fn left_mult(&self, v: &[f64], out: &mut [f64]) {
        debug_assert_eq!(v.len(), self.rows);
        debug_assert_eq!(out.len(), self.cols);
        match &self.data {
            BlockData::Dense(d) => {
                for r in 0..self.rows {
                    crate::vecmath::axpy(out, &d[r * self.cols..(r + 1) * self.cols], v[r]);
                }
            }
            BlockData::Sparse(rows) => {
                for (r, row) in rows.iter().enumerate() {
                    let s = v[r];
                    if s == 0.0 {
                        continue;
                    }
                    for (p, &c) in row.idx.iter().enumerate() {
                        out[c as usize] += s * row.val[p];
                    }
                }
            }
        }
    }

    /// Dense copy of column `c`.
    pub(crate) fn col_vector(&self, c: usize) -> Vec<f64> {
        let mut out = vec![0.0; self.rows];
        match &self.data {
            BlockData::Dense(d) => {
                for r in 0..self.rows {
                    out[r] = d[r * self.cols + c];
                }
            }
            BlockData::Sparse(rows) => {
                for (r, row) in rows.iter().enumerate() {
                    out[r] = row.get(c as u32);
                }
            }
        }
        out
    }

    /// Per-row reduction over rows `[rl, ru)`, combined into `out[r - rl]`.
    /// Stored values only; implicit sparse zeros are the caller's business.
    pub(crate) fn row_aggregate(&self, op: AggOp, out: &mut [f64], rl: usize, ru: usize) {
        match &self.data {
            BlockData::Dense(d) => {
                for r in rl..ru {
                    for &v in &d[r * self.cols..(r + 1) * self.cols] {
                        out[r - rl] = op.combine(out[r - rl], op.cell(v));
                    }
                }
            }
            BlockData::Sparse(rows) => {
                for r in rl..ru {
                    for &v in &rows[r].val {
                        out[r - rl] = op.combine(out[r - rl], op.cell(v));
                    }
                }
            }
        }
    }

    /// Per-column reduction into `out`, including implicit zeros for
    /// min/max on sparse layouts.
    pub(crate) fn col_aggregate(&self, op: AggOp, out: &mut [f64]) {
        match &self.data {
            BlockData::Dense(d) => {
                for r in 0..self.rows {
                    for (c, &v) in d[r * self.cols..(r + 1) * self.cols].iter().enumerate() {
                        out[c] = op.combine(out[c], op.cell(v));
                    }
                }
            }
            BlockData::Sparse(rows) => {
                let mut colcnt = vec![0usize; self.cols];
                for row in rows {
                    for (p, &c) in row.idx.iter().enumerate() {
                        out[c as usize] = op.combine(out[c as usize], op.cell(row.val[p]));
                        colcnt[c as usize] += 1;
                    }
                }
                if !op.is_sum() {
                    for (c, &cnt) in colcnt.iter().enumerate() {
                        if cnt < self.rows {
                            out[c] = op.combine(out[c], 0.0);
                        }
                    }
                }
            }
        }
    }

    /// Full unary aggregate in the block engine; used by the
    /// decompress-fallback path and by single-uncompressed-group
    /// short-circuits.
    pub fn unary_aggregate(&self, op: AggOp, dir: ReduceDir) -> Array2<f64> {
        match dir {
            ReduceDir::All => {
                let mut acc = op.init();
                for r in 0..self.rows {
                    for c in 0..self.cols {
                        acc = op.combine(acc, op.cell(self.get(r, c)));
                    }
                }
                let mut out = Array2::zeros((1, 1));
                out[(0, 0)] = acc;
                out
            }
            ReduceDir::Row => {
                let mut acc = vec![op.init(); self.rows];
                self.row_aggregate(op, &mut acc, 0, self.rows);
                if !op.is_sum() && self.is_sparse() {
                    let mut rnnz = vec![0usize; self.rows];
                    self.count_nonzeros_per_row(&mut rnnz, 0, self.rows);
                    for (r, a) in acc.iter_mut().enumerate() {
                        if rnnz[r] < self.cols {
                            *a = op.combine(*a, 0.0);
                        }
                    }
                }
                let mut out = Array2::zeros((self.rows, 1));
                for (r, a) in acc.into_iter().enumerate() {
                    out[(r, 0)] = a;
                }
                out
            }
            ReduceDir::Col => {
                let mut acc = vec![op.init(); self.cols];
                self.col_aggregate(op, &mut acc);
                let mut out = Array2::zeros((1, self.cols));
                for (c, a) in acc.into_iter().enumerate() {
                    out[(0, c)] = a;
                }
                out
            }
        }
    }

    /// Count stored non-zero cells per row over `[rl, ru)` into
    /// `rnnz[r - rl]`.
    pub(crate) fn count_nonzeros_per_row(&self, rnnz: &mut [usize], rl: usize, ru: usize) {
        match &self.data {
            BlockData::Dense(d) => {
                for r in rl..ru {
                    rnnz[r - rl] += d[r * self.cols..(r + 1) * self.cols]
                        .iter()
                        .filter(|&&x| x != 0.0)
                        .count();
                }
            }
            BlockData::Sparse(rows) => {
                for r in rl..ru {
                    rnnz[r - rl] += rows[r].val.iter().filter(|&&x| x != 0.0).count();
                }
            }
        }
    }

    /// Approximate heap bytes held by this block.
    pub fn estimate_size_in_memory(&self) -> usize {
        match &self.data {
            BlockData::Dense(d) => 48 + 8 * d.capacity(),
            BlockData::Sparse(rows) => {
                48 + rows
                    .iter()
                    .map(|row| 48 + 4 * row.idx.capacity() + 8 * row.val.capacity())
                    .sum::<usize>()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn dense_sparse_roundtrip() {
        let arr = array![[1.0, 0.0, 2.0], [0.0, 0.0, 3.0], [4.0, 5.0, 0.0]];
        let dense = MatrixBlock::from_dense(arr.view());
        assert_eq!(dense.nnz(), 5);

        let cs = dense.to_csmat();
        let sparse = MatrixBlock::from_csmat(&cs);
        assert!(sparse.is_sparse());
        assert_eq!(sparse.nnz(), 5);
        assert_eq!(sparse.to_dense(), arr);

        let t = sparse.transpose();
        assert_eq!(t.to_dense(), arr.t().to_owned());
        assert_eq!(dense.transpose().to_dense(), arr.t().to_owned());
    }

    #[test]
    fn block_kernels() {
        let arr = array![[1.0, 0.0, 2.0], [0.0, 0.0, 3.0], [4.0, 5.0, 0.0]];
        for blk in [
            MatrixBlock::from_dense(arr.view()),
            MatrixBlock::from_csmat(&MatrixBlock::from_dense(arr.view()).to_csmat()),
        ] {
            let mut out = vec![0.0; 3];
            blk.right_mult(&[1.0, 1.0, 1.0], &mut out, 0, 3);
            assert_eq!(out, vec![3.0, 3.0, 9.0]);

            let mut out = vec![0.0; 3];
            blk.left_mult(&[1.0, 0.0, 1.0], &mut out);
            assert_eq!(out, vec![5.0, 5.0, 2.0]);

            assert_eq!(blk.unary_aggregate(AggOp::Sum, ReduceDir::All)[(0, 0)], 15.0);
            assert_eq!(blk.unary_aggregate(AggOp::Min, ReduceDir::All)[(0, 0)], 0.0);
            assert_eq!(blk.unary_aggregate(AggOp::Max, ReduceDir::Col)[(0, 2)], 3.0);
            assert_eq!(blk.unary_aggregate(AggOp::SumSq, ReduceDir::Row)[(2, 0)], 41.0);
        }
    }

    #[test]
    fn scalar_and_fallback_helpers() {
        let arr = array![[1.0, 0.0], [0.0, 2.0]];
        let blk = MatrixBlock::from_csmat(&MatrixBlock::from_dense(arr.view()).to_csmat());

        let doubled = blk.apply_scalar(ScalarOp::Mult(2.0));
        assert_eq!(doubled.to_dense(), array![[2.0, 0.0], [0.0, 4.0]]);
        assert!(doubled.is_sparse());

        let shifted = blk.apply_scalar(ScalarOp::Plus(1.0));
        assert_eq!(shifted.to_dense(), array![[2.0, 1.0], [1.0, 3.0]]);
        assert!(!shifted.is_sparse());
        assert_eq!(shifted.nnz(), 4);

        let sliced = blk.slice_rows(1, 2).unwrap();
        assert_eq!(sliced.to_dense(), array![[0.0, 2.0]]);

        let stacked = blk.rbind(&sliced).unwrap();
        assert_eq!(stacked.rows(), 3);
        assert_eq!(stacked.get(2, 1), 2.0);

        let replaced = blk.replace(2.0, 9.0);
        assert_eq!(replaced.get(1, 1), 9.0);
    }
}
