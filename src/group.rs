//! Column groups and the kernels shared by the two bitmap encodings
//!
//! A compressed matrix is a list of column groups with pairwise-disjoint,
//! jointly-exhaustive column sets. Each group is one of three variants:
//! offset-list encoded, run-length encoded, or a verbatim uncompressed
//! sub-matrix. The two encoded variants share their tuple storage and
//! differ only in how row positions are laid out in the stream; every
//! kernel that iterates rows is written once here against that seam.

use crate::bitmap::num_segments;
use crate::block::{MatrixBlock, SparseRow};
use crate::ole::OleGroup;
use crate::ops::{AggOp, ScalarOp};
use crate::rle::RleGroup;
use crate::uncomp::UncGroup;

/// Shared storage of the OLE and RLE variants: the distinct value tuples
/// plus one position stream per tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct BitmapGroup {
    /// Column indices covered by this group, ascending.
    pub(crate) cols: Vec<usize>,
    /// Row count of the owning matrix.
    pub(crate) num_rows: usize,
    /// Tuple values, flattened tuple-major (`num_tuples * cols.len()`).
    pub(crate) values: Vec<f64>,
    /// Stream boundaries per tuple (`num_tuples + 1` entries into `data`).
    pub(crate) ptr: Vec<usize>,
    /// Concatenated per-tuple position streams, in 16-bit units.
    pub(crate) data: Vec<u16>,
    /// Per-tuple skip tables, tuple-major: `num_segments + 1` stream
    /// positions each, relative to the tuple's stream start.
    pub(crate) skip: Vec<u32>,
}

impl BitmapGroup {
    /// Column indices covered by this group.
    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    /// Number of distinct stored tuples.
    pub fn num_tuples(&self) -> usize {
        self.ptr.len().saturating_sub(1)
    }

    pub(crate) fn num_segments(&self) -> usize {
        num_segments(self.num_rows)
    }

    pub(crate) fn tuple_values(&self, t: usize) -> &[f64] {
        let n = self.cols.len();
        &self.values[t * n..(t + 1) * n]
    }

    pub(crate) fn tuple_data(&self, t: usize) -> &[u16] {
        &self.data[self.ptr[t]..self.ptr[t + 1]]
    }

    pub(crate) fn tuple_skip(&self, t: usize) -> &[u32] {
        let w = self.num_segments() + 1;
        &self.skip[t * w..(t + 1) * w]
    }

    /// Count of non-zero components of tuple `t`.
    pub(crate) fn tuple_nnz(&self, t: usize) -> usize {
        self.tuple_values(t).iter().filter(|&&v| v != 0.0).count()
    }

    pub(crate) fn shift_cols(&mut self, delta: usize) {
        for c in &mut self.cols {
            *c += delta;
        }
    }

    /// Clone of this storage with tuple values mapped through `op`.
    pub(crate) fn with_mapped_values(&self, op: ScalarOp) -> BitmapGroup {
        BitmapGroup {
            cols: self.cols.clone(),
            num_rows: self.num_rows,
            values: self.values.iter().map(|&v| op.apply(v)).collect(),
            ptr: self.ptr.clone(),
            data: self.data.clone(),
            skip: self.skip.clone(),
        }
    }

    pub(crate) fn estimate_in_memory(&self) -> usize {
        64 + 8 * self.cols.capacity()
            + 8 * self.values.capacity()
            + 8 * self.ptr.capacity()
            + 2 * self.data.capacity()
            + 4 * self.skip.capacity()
    }
}

/// The seam between the shared bitmap kernels and the two stream layouts.
pub(crate) trait BitmapOps {
    fn bm(&self) -> &BitmapGroup;

    /// Invoke `f` with every occupied row of tuple `t` within `[rl, ru)`,
    /// ascending.
    fn for_each_row(&self, t: usize, rl: usize, ru: usize, f: &mut dyn FnMut(usize));

    /// Number of occupied rows of tuple `t` within `[rl, ru)`.
    fn count_range(&self, t: usize, rl: usize, ru: usize) -> usize;

    /// `out[row - rl] += s` at every occupied row of tuple `t` in `[rl, ru)`.
    fn scatter_add(&self, t: usize, s: f64, out: &mut [f64], rl: usize, ru: usize);

    /// True if tuple `t` occupies row `r`.
    fn contains(&self, t: usize, r: usize) -> bool {
        let mut found = false;
        self.for_each_row(t, r, r + 1, &mut |_| found = true);
        found
    }
}

pub(crate) fn get<G: BitmapOps>(g: &G, r: usize, c: usize) -> f64 {
    let bm = g.bm();
    let j = match bm.cols.binary_search(&c) {
        Ok(j) => j,
        Err(_) => return 0.0,
    };
    for t in 0..bm.num_tuples() {
        if g.contains(t, r) {
            return bm.tuple_values(t)[j];
        }
    }
    0.0
}

/// Write this group's cells of rows `[rl, ru)` into a row-major slice with
/// the given stride; row `r` lands at `(r - rl) * stride`.
pub(crate) fn decompress_dense<G: BitmapOps>(
    g: &G,
    out: &mut [f64],
    stride: usize,
    rl: usize,
    ru: usize,
) {
    let bm = g.bm();
    for t in 0..bm.num_tuples() {
        let vals = bm.tuple_values(t);
        g.for_each_row(t, rl, ru, &mut |row| {
            let base = (row - rl) * stride;
            for (j, &c) in bm.cols.iter().enumerate() {
                out[base + c] = vals[j];
            }
        });
    }
}

/// Append this group's non-zero cells of rows `[rl, ru)` to sparse rows;
/// row `r` maps to `rows_out[r - rl]`. Rows are left unsorted.
pub(crate) fn decompress_sparse<G: BitmapOps>(
    g: &G,
    rows_out: &mut [SparseRow],
    rl: usize,
    ru: usize,
) {
    let bm = g.bm();
    for t in 0..bm.num_tuples() {
        let vals = bm.tuple_values(t);
        g.for_each_row(t, rl, ru, &mut |row| {
            let r = &mut rows_out[row - rl];
            for (j, &c) in bm.cols.iter().enumerate() {
                if vals[j] != 0.0 {
                    r.idx.push(c as u32);
                    r.val.push(vals[j]);
                }
            }
        });
    }
}

pub(crate) fn count_nonzeros_per_row<G: BitmapOps>(
    g: &G,
    rnnz: &mut [usize],
    rl: usize,
    ru: usize,
) {
    let bm = g.bm();
    for t in 0..bm.num_tuples() {
        let nz = bm.tuple_nnz(t);
        if nz == 0 {
            continue;
        }
        g.for_each_row(t, rl, ru, &mut |row| rnnz[row - rl] += nz);
    }
}

/// `out[row - rl] += sum_j tuple[j] * v[cols[j]]` at every occupied row.
/// The per-tuple scalar is computed once and scattered.
pub(crate) fn right_mult<G: BitmapOps>(g: &G, v: &[f64], out: &mut [f64], rl: usize, ru: usize) {
    let bm = g.bm();
    for t in 0..bm.num_tuples() {
        let vals = bm.tuple_values(t);
        let mut s = 0.0;
        for (j, &c) in bm.cols.iter().enumerate() {
            s += vals[j] * v[c];
        }
        if s != 0.0 {
            g.scatter_add(t, s, out, rl, ru);
        }
    }
}

/// `out[cols[j]] += (sum_{rows of t} v[row]) * tuple[j]` for every tuple.
pub(crate) fn left_mult<G: BitmapOps>(g: &G, v: &[f64], out: &mut [f64]) {
    let bm = g.bm();
    for t in 0..bm.num_tuples() {
        let mut s = 0.0;
        g.for_each_row(t, 0, bm.num_rows, &mut |row| s += v[row]);
        if s != 0.0 {
            let vals = bm.tuple_values(t);
            for (j, &c) in bm.cols.iter().enumerate() {
                out[c] += s * vals[j];
            }
        }
    }
}

/// Total occupied rows across tuples; equals `num_rows` exactly when the
/// group has no implicit-zero rows.
pub(crate) fn coverage<G: BitmapOps>(g: &G) -> usize {
    let bm = g.bm();
    (0..bm.num_tuples())
        .map(|t| g.count_range(t, 0, bm.num_rows))
        .sum()
}

pub(crate) fn nnz<G: BitmapOps>(g: &G) -> usize {
    let bm = g.bm();
    (0..bm.num_tuples())
        .map(|t| g.count_range(t, 0, bm.num_rows) * bm.tuple_nnz(t))
        .sum()
}

/// Whole-group reduction. Sum-like aggregates weight each tuple by its
/// occurrence count; min/max fold in an implicit zero when the group does
/// not cover every row.
pub(crate) fn agg_all<G: BitmapOps>(g: &G, op: AggOp) -> f64 {
    let bm = g.bm();
    if op.is_sum() {
        let mut acc = 0.0;
        for t in 0..bm.num_tuples() {
            let cnt = g.count_range(t, 0, bm.num_rows);
            let cellsum: f64 = bm.tuple_values(t).iter().map(|&v| op.cell(v)).sum();
            acc += cnt as f64 * cellsum;
        }
        acc
    } else {
        let mut acc = op.init();
        let mut cov = 0usize;
        for t in 0..bm.num_tuples() {
            let cnt = g.count_range(t, 0, bm.num_rows);
            if cnt == 0 {
                continue;
            }
            cov += cnt;
            for &v in bm.tuple_values(t) {
                acc = op.combine(acc, op.cell(v));
            }
        }
        if cov < bm.num_rows {
            acc = op.combine(acc, 0.0);
        }
        acc
    }
}

/// Per-row reduction over `[rl, ru)` into `out[row - rl]`, stored cells
/// only; short row coverage is patched by the caller, which knows the
/// matrix-wide column count.
pub(crate) fn agg_rows<G: BitmapOps>(g: &G, op: AggOp, out: &mut [f64], rl: usize, ru: usize) {
    let bm = g.bm();
    for t in 0..bm.num_tuples() {
        if op.is_sum() {
            let rowsum: f64 = bm.tuple_values(t).iter().map(|&v| op.cell(v)).sum();
            g.scatter_add(t, rowsum, out, rl, ru);
        } else {
            let mut m = op.init();
            for &v in bm.tuple_values(t) {
                m = op.combine(m, op.cell(v));
            }
            g.for_each_row(t, rl, ru, &mut |row| {
                out[row - rl] = op.combine(out[row - rl], m);
            });
        }
    }
}

/// Per-column reduction into the full-width `out`; this group only touches
/// its own columns, so parallel callers may hand disjoint groups to
/// different tasks.
pub(crate) fn agg_cols<G: BitmapOps>(g: &G, op: AggOp, out: &mut [f64]) {
    let bm = g.bm();
    if op.is_sum() {
        for t in 0..bm.num_tuples() {
            let cnt = g.count_range(t, 0, bm.num_rows) as f64;
            let vals = bm.tuple_values(t);
            for (j, &c) in bm.cols.iter().enumerate() {
                out[c] += cnt * op.cell(vals[j]);
            }
        }
    } else {
        let mut cov = 0usize;
        for t in 0..bm.num_tuples() {
            let cnt = g.count_range(t, 0, bm.num_rows);
            if cnt == 0 {
                continue;
            }
            cov += cnt;
            let vals = bm.tuple_values(t);
            for (j, &c) in bm.cols.iter().enumerate() {
                out[c] = op.combine(out[c], op.cell(vals[j]));
            }
        }
        if cov < bm.num_rows {
            for &c in &bm.cols {
                out[c] = op.combine(out[c], 0.0);
            }
        }
    }
}

/// Dense copy of the group's local column `j` over all rows.
pub(crate) fn decompress_col<G: BitmapOps>(g: &G, j: usize) -> Vec<f64> {
    let bm = g.bm();
    let mut out = vec![0.0; bm.num_rows];
    for t in 0..bm.num_tuples() {
        let v = bm.tuple_values(t)[j];
        if v != 0.0 {
            g.for_each_row(t, 0, bm.num_rows, &mut |row| out[row] = v);
        }
    }
    out
}

/// Materialize the group with `op` applied to every cell, implicit zeros
/// included, as a dense local block (`num_rows x cols.len()`).
pub(crate) fn scalar_to_block<G: BitmapOps>(g: &G, op: ScalarOp) -> MatrixBlock {
    let bm = g.bm();
    let n = bm.cols.len();
    let mut data = vec![op.apply(0.0); bm.num_rows * n];
    for t in 0..bm.num_tuples() {
        let vals = bm.tuple_values(t);
        g.for_each_row(t, 0, bm.num_rows, &mut |row| {
            for (j, &v) in vals.iter().enumerate() {
                data[row * n + j] = op.apply(v);
            }
        });
    }
    MatrixBlock::from_raw_dense(bm.num_rows, n, data)
}

/// One column group of a compressed matrix.
#[derive(Debug, Clone, PartialEq)]
pub enum ColGroup {
    /// Verbatim sub-matrix for columns that do not compress.
    Uncompressed(UncGroup),
    /// Segmented offset-list encoding.
    Ole(OleGroup),
    /// Segmented run-length encoding.
    Rle(RleGroup),
}

impl ColGroup {
    /// Column indices covered by this group, ascending.
    pub fn cols(&self) -> &[usize] {
        match self {
            ColGroup::Uncompressed(g) => g.cols(),
            ColGroup::Ole(g) => g.bm().cols(),
            ColGroup::Rle(g) => g.bm().cols(),
        }
    }

    /// Row count of the owning matrix.
    pub fn num_rows(&self) -> usize {
        match self {
            ColGroup::Uncompressed(g) => g.num_rows(),
            ColGroup::Ole(g) => g.bm().num_rows,
            ColGroup::Rle(g) => g.bm().num_rows,
        }
    }

    /// True for the uncompressed variant.
    pub fn is_uncompressed(&self) -> bool {
        matches!(self, ColGroup::Uncompressed(_))
    }

    /// Non-zero cells stored by this group.
    pub fn nnz(&self) -> usize {
        match self {
            ColGroup::Uncompressed(g) => g.nnz(),
            ColGroup::Ole(g) => nnz(g),
            ColGroup::Rle(g) => nnz(g),
        }
    }

    /// Value at row `r` of matrix column `c`; `c` must belong to this group.
    pub fn get(&self, r: usize, c: usize) -> f64 {
        match self {
            ColGroup::Uncompressed(g) => g.get(r, c),
            ColGroup::Ole(g) => get(g, r, c),
            ColGroup::Rle(g) => get(g, r, c),
        }
    }

    pub(crate) fn decompress_dense(&self, out: &mut [f64], stride: usize, rl: usize, ru: usize) {
        match self {
            ColGroup::Uncompressed(g) => g.decompress_dense(out, stride, rl, ru),
            ColGroup::Ole(g) => decompress_dense(g, out, stride, rl, ru),
            ColGroup::Rle(g) => decompress_dense(g, out, stride, rl, ru),
        }
    }

    pub(crate) fn decompress_sparse(&self, rows_out: &mut [SparseRow], rl: usize, ru: usize) {
        match self {
            ColGroup::Uncompressed(g) => g.decompress_sparse(rows_out, rl, ru),
            ColGroup::Ole(g) => decompress_sparse(g, rows_out, rl, ru),
            ColGroup::Rle(g) => decompress_sparse(g, rows_out, rl, ru),
        }
    }

    pub(crate) fn count_nonzeros_per_row(&self, rnnz: &mut [usize], rl: usize, ru: usize) {
        match self {
            ColGroup::Uncompressed(g) => g.count_nonzeros_per_row(rnnz, rl, ru),
            ColGroup::Ole(g) => count_nonzeros_per_row(g, rnnz, rl, ru),
            ColGroup::Rle(g) => count_nonzeros_per_row(g, rnnz, rl, ru),
        }
    }

    /// Right matrix-vector contribution over rows `[rl, ru)`, added into
    /// `out[row - rl]`. Callers hand in a zeroed buffer and run the
    /// uncompressed groups first so summation order stays reproducible.
    pub(crate) fn right_mult(&self, v: &[f64], out: &mut [f64], rl: usize, ru: usize) {
        match self {
            ColGroup::Uncompressed(g) => g.right_mult(v, out, rl, ru),
            ColGroup::Ole(g) => right_mult(g, v, out, rl, ru),
            ColGroup::Rle(g) => right_mult(g, v, out, rl, ru),
        }
    }

    /// Left row-vector multiply contribution into the full-width `out`.
    pub(crate) fn left_mult(&self, v: &[f64], out: &mut [f64]) {
        match self {
            ColGroup::Uncompressed(g) => g.left_mult(v, out),
            ColGroup::Ole(g) => left_mult(g, v, out),
            ColGroup::Rle(g) => left_mult(g, v, out),
        }
    }

    pub(crate) fn agg_all(&self, op: AggOp) -> f64 {
        match self {
            ColGroup::Uncompressed(g) => g.agg_all(op),
            ColGroup::Ole(g) => agg_all(g, op),
            ColGroup::Rle(g) => agg_all(g, op),
        }
    }

    pub(crate) fn agg_rows(&self, op: AggOp, out: &mut [f64], rl: usize, ru: usize) {
        match self {
            ColGroup::Uncompressed(g) => g.agg_rows(op, out, rl, ru),
            ColGroup::Ole(g) => agg_rows(g, op, out, rl, ru),
            ColGroup::Rle(g) => agg_rows(g, op, out, rl, ru),
        }
    }

    pub(crate) fn agg_cols(&self, op: AggOp, out: &mut [f64]) {
        match self {
            ColGroup::Uncompressed(g) => g.agg_cols(op, out),
            ColGroup::Ole(g) => agg_cols(g, op, out),
            ColGroup::Rle(g) => agg_cols(g, op, out),
        }
    }

    /// Apply a scalar operation. Bitmap groups stay compressed when the op
    /// preserves zero or the group covers every row (metadata-only tuple
    /// rewrite); otherwise the group decompresses into an uncompressed one.
    pub(crate) fn scalar_op(&self, op: ScalarOp) -> ColGroup {
        match self {
            ColGroup::Uncompressed(g) => ColGroup::Uncompressed(g.scalar_op(op)),
            ColGroup::Ole(g) => {
                if op.preserves_zero() || coverage(g) == g.bm().num_rows {
                    ColGroup::Ole(OleGroup::with_storage(g.bm().with_mapped_values(op)))
                } else {
                    ColGroup::Uncompressed(UncGroup::from_parts(
                        g.bm().cols.clone(),
                        scalar_to_block(g, op),
                    ))
                }
            }
            ColGroup::Rle(g) => {
                if op.preserves_zero() || coverage(g) == g.bm().num_rows {
                    ColGroup::Rle(RleGroup::with_storage(g.bm().with_mapped_values(op)))
                } else {
                    ColGroup::Uncompressed(UncGroup::from_parts(
                        g.bm().cols.clone(),
                        scalar_to_block(g, op),
                    ))
                }
            }
        }
    }

    pub(crate) fn shift_cols(&mut self, delta: usize) {
        match self {
            ColGroup::Uncompressed(g) => g.shift_cols(delta),
            ColGroup::Ole(g) => g.bm_mut().shift_cols(delta),
            ColGroup::Rle(g) => g.bm_mut().shift_cols(delta),
        }
    }

    /// Dense copy of the group's local column `j` over all rows.
    pub(crate) fn decompress_col(&self, j: usize) -> Vec<f64> {
        match self {
            ColGroup::Uncompressed(g) => g.decompress_col(j),
            ColGroup::Ole(g) => decompress_col(g, j),
            ColGroup::Rle(g) => decompress_col(g, j),
        }
    }

    /// Approximate heap bytes held by this group.
    pub fn estimate_in_memory(&self) -> usize {
        match self {
            ColGroup::Uncompressed(g) => g.estimate_in_memory(),
            ColGroup::Ole(g) => g.bm().estimate_in_memory(),
            ColGroup::Rle(g) => g.bm().estimate_in_memory(),
        }
    }
}
