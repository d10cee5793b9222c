//! Compressed matrix blocks: the compression pipeline and the kernels that
//! run directly on the compressed form
//!
//! A `CompressedMatrix` starts as a wrapper around an uncompressed
//! [`MatrixBlock`]. `compress` classifies columns by sample-estimated
//! compression ratio, co-codes the amenable ones into groups, encodes each
//! group under the cheaper of OLE and RLE (with iterative refinement when
//! the exact bitmap disappoints), and bundles the rest into one
//! uncompressed group. After that the matrix is read-only; supported
//! kernels run on the compressed form and everything else decompresses and
//! delegates.

use crate::bitmap::{self, BITMAP_BLOCK_SZ};
use crate::block::{MatrixBlock, SparseRow};
use crate::cocode;
use crate::error::{Result, ZipError};
use crate::estim::{uncompressed_size, SizeEstimator};
use crate::group::ColGroup;
use crate::ole::OleGroup;
use crate::ops::{AggOp, ChainType, ReduceDir, ScalarOp, TsmmSide};
use crate::rle::RleGroup;
use crate::uncomp::UncGroup;
use log::{debug, warn};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Instant;

/// Compression works on a transposed copy so per-column scans are
/// contiguous.
pub const TRANSPOSE_INPUT: bool = true;

/// Implicit zeros are never materialized as stored tuples.
pub const MATERIALIZE_ZEROS: bool = false;

/// Unary aggregates split across threads only above this serialized size.
pub const MIN_PAR_AGG_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Sparsity below which decompression targets the sparse-row layout.
pub(crate) const SPARSITY_TURN_POINT: f64 = 0.4;

/// Per-phase timings and sizes recorded by `compress`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompressionStats {
    /// Seconds spent classifying columns.
    pub time_phase1: f64,
    /// Seconds spent co-coding.
    pub time_phase2: f64,
    /// Seconds spent extracting bitmaps and encoding groups.
    pub time_phase3: f64,
    /// Seconds spent bundling leftovers and cleanup.
    pub time_phase4: f64,
    /// Estimated in-memory bytes of the compressed representation.
    pub size: usize,
    /// Uncompressed-to-compressed in-memory ratio.
    pub ratio: f64,
}

/// A matrix block with an optionally compressed internal representation.
#[derive(Debug, Clone)]
pub struct CompressedMatrix {
    rows: usize,
    cols: usize,
    nnz: usize,
    sparse: bool,
    block: Option<MatrixBlock>,
    groups: Option<Vec<ColGroup>>,
    stats: Option<CompressionStats>,
}

/// Heap entry for refinement: pops the column with the worst (smallest)
/// single-column compression ratio first.
#[derive(Debug)]
struct WorstRatio {
    ratio: f64,
    col: usize,
}

impl PartialEq for WorstRatio {
    fn eq(&self, other: &Self) -> bool {
        self.ratio == other.ratio && self.col == other.col
    }
}
impl Eq for WorstRatio {}
impl PartialOrd for WorstRatio {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WorstRatio {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // inverted so the max-heap pops the smallest ratio
        other
            .ratio
            .total_cmp(&self.ratio)
            .then_with(|| other.col.cmp(&self.col))
    }
}

fn make_pool(k: usize) -> Result<Option<rayon::ThreadPool>> {
    if k <= 1 {
        return Ok(None);
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(k)
        .build()
        .map(Some)
        .map_err(|e| ZipError::Worker(e.to_string()))
}

/// Row-block length for `k` tasks, rounded up to a segment multiple so
/// OLE/RLE skip tables stay cheap at block boundaries.
fn row_block_len(rows: usize, k: usize) -> usize {
    let mut b = rows.div_ceil(k.max(1));
    let rem = b % BITMAP_BLOCK_SZ;
    if rem != 0 {
        b += BITMAP_BLOCK_SZ - rem;
    }
    b.max(1)
}

/// Static round-robin distribution of group indices over at most `k` tasks.
fn partition_groups(n_groups: usize, k: usize) -> Vec<Vec<usize>> {
    let tasks = k.min(n_groups).max(1);
    let mut parts = vec![Vec::new(); tasks];
    for i in 0..n_groups {
        parts[i % tasks].push(i);
    }
    parts
}

/// Extract or refine one co-coded group from its exact bitmap. Returns
/// `None` when refinement exhausts the group; its columns then fall back
/// to the shared uncompressed group.
fn compress_col_group(
    transposed: &MatrixBlock,
    num_rows: usize,
    sparsity: f64,
    ratios: &HashMap<usize, f64>,
    mut cols: Vec<usize>,
) -> Option<ColGroup> {
    let mut heap: Option<BinaryHeap<WorstRatio>> = None;
    loop {
        // the exact bitmap both decides the encoding and feeds it
        let bm = bitmap::extract_bitmap(&cols, transposed);
        let info = SizeEstimator::exact_info(&bm, num_rows, cols.len());
        let ratio = uncompressed_size(num_rows, cols.len(), sparsity) / info.min_size() as f64;
        if info.min_size() == 0 || ratio > 1.0 {
            return Some(if info.rle_size < info.ole_size {
                ColGroup::Rle(RleGroup::from_bitmap(cols, num_rows, &bm))
            } else {
                ColGroup::Ole(OleGroup::from_bitmap(cols, num_rows, &bm))
            });
        }

        // drop the column with the worst single-column ratio and re-test
        let h = heap.get_or_insert_with(|| {
            cols.iter()
                .map(|&c| WorstRatio {
                    ratio: ratios.get(&c).copied().unwrap_or(0.0),
                    col: c,
                })
                .collect()
        });
        let worst = h.pop()?;
        cols.retain(|&c| c != worst.col);
        if cols.is_empty() {
            return None;
        }
    }
}

impl CompressedMatrix {
    /// Wrap an uncompressed block; no compression happens yet.
    pub fn from_block(block: MatrixBlock) -> CompressedMatrix {
        CompressedMatrix {
            rows: block.rows(),
            cols: block.cols(),
            nnz: block.nnz(),
            sparse: block.is_sparse(),
            block: Some(block),
            groups: None,
            stats: None,
        }
    }

    pub(crate) fn from_parts(
        rows: usize,
        cols: usize,
        nnz: usize,
        sparse: bool,
        groups: Vec<ColGroup>,
    ) -> CompressedMatrix {
        CompressedMatrix {
            rows,
            cols,
            nnz,
            sparse,
            block: None,
            groups: Some(groups),
            stats: None,
        }
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

    /// True once `compress` has succeeded.
    pub fn is_compressed(&self) -> bool {
        self.groups.is_some()
    }

    /// True if the compressed form degenerated to one uncompressed group.
    pub fn is_single_uncompressed_group(&self) -> bool {
        matches!(self.groups.as_deref(), Some([g]) if g.is_uncompressed())
    }

    /// The column groups; empty slice before compression.
    pub fn col_groups(&self) -> &[ColGroup] {
        self.groups.as_deref().unwrap_or(&[])
    }

    /// Statistics of the last successful `compress` call.
    pub fn compression_stats(&self) -> Option<&CompressionStats> {
        self.stats.as_ref()
    }

    fn groups(&self) -> Result<&[ColGroup]> {
        self.groups.as_deref().ok_or_else(|| {
            ZipError::InvariantViolation("operation requires a compressed block".into())
        })
    }

    /// Value at `(r, c)`, routed to the owning column group.
    pub fn get(&self, r: usize, c: usize) -> f64 {
        if let Some(b) = &self.block {
            return b.get(r, c);
        }
        if let Some(groups) = &self.groups {
            for g in groups {
                if g.cols().binary_search(&c).is_ok() {
                    return g.get(r, c);
                }
            }
        }
        0.0
    }

    /// Upper bound on the heap bytes of the compressed representation.
    pub fn estimate_compressed_size_in_memory(&self) -> usize {
        match &self.groups {
            Some(groups) => {
                80 + 8 * groups.len()
                    + groups.iter().map(ColGroup::estimate_in_memory).sum::<usize>()
            }
            None => 0,
        }
    }

    /// Compress the wrapped block with `k` threads. The uncompressed
    /// payload is released on success; on failure the matrix is unchanged.
    pub fn compress(&mut self, k: usize) -> Result<()> {
        if self.is_compressed() {
            return Err(ZipError::InvariantViolation(
                "redundant compression, block already compressed".into(),
            ));
        }
        let block = self.block.as_ref().ok_or_else(|| {
            ZipError::InvariantViolation("no uncompressed payload to compress".into())
        })?;

        let num_rows = self.rows;
        let num_cols = self.cols;
        let sp = block.sparsity();
        let mut stats = CompressionStats::default();
        let pool = make_pool(k)?;

        // one transposed working copy and one row sample drive every
        // decision in this call
        let transposed = if TRANSPOSE_INPUT {
            block.transpose()
        } else {
            block.clone()
        };
        let estim = SizeEstimator::new(&transposed, num_rows);

        // phase 1: classify columns by estimated compression ratio
        let phase = Instant::now();
        let infos: Vec<_> = match &pool {
            Some(p) => p.install(|| {
                (0..num_cols)
                    .into_par_iter()
                    .map(|c| estim.estimate(&[c]))
                    .collect()
            }),
            None => (0..num_cols).map(|c| estim.estimate(&[c])).collect(),
        };
        let unc_col_size = uncompressed_size(num_rows, 1, sp);
        let mut bitmap_cols: Vec<usize> = Vec::new();
        let mut cards: Vec<usize> = Vec::new();
        let mut sizes: Vec<u64> = Vec::new();
        let mut ratios: HashMap<usize, f64> = HashMap::new();
        for (c, info) in infos.iter().enumerate() {
            let min = info.min_size();
            let ratio = if min == 0 { f64::INFINITY } else { unc_col_size / min as f64 };
            if ratio > 1.0 {
                bitmap_cols.push(c);
                cards.push(info.est_cardinality);
                sizes.push(min);
                ratios.insert(c, ratio);
            }
        }
        stats.time_phase1 = phase.elapsed().as_secs_f64();
        debug!("compression statistics:");
        debug!("--compression phase 1 (classify): {:.3}s", stats.time_phase1);

        // phase 2: co-code the amenable columns
        let phase = Instant::now();
        let plans = cocode::plan_cocoding(
            &estim,
            &bitmap_cols,
            &cards,
            &sizes,
            num_rows,
            if block.is_sparse() { sp } else { 1.0 },
            pool.as_ref(),
        );
        stats.time_phase2 = phase.elapsed().as_secs_f64();
        debug!("--compression phase 2 (co-code): {:.3}s", stats.time_phase2);

        // phase 3: exact bitmaps, refinement, encoding
        let phase = Instant::now();
        let built: Vec<Option<ColGroup>> = match &pool {
            Some(p) => p.install(|| {
                plans
                    .par_iter()
                    .map(|g| compress_col_group(&transposed, num_rows, sp, &ratios, g.clone()))
                    .collect()
            }),
            None => plans
                .iter()
                .map(|g| compress_col_group(&transposed, num_rows, sp, &ratios, g.clone()))
                .collect(),
        };
        let mut remaining: HashSet<usize> = (0..num_cols).collect();
        let mut groups: Vec<ColGroup> = Vec::new();
        for g in built.into_iter().flatten() {
            for c in g.cols() {
                remaining.remove(c);
            }
            groups.push(g);
        }
        stats.time_phase3 = phase.elapsed().as_secs_f64();
        debug!("--compression phase 3 (encode): {:.3}s", stats.time_phase3);

        // phase 4: the rest becomes one uncompressed group
        let phase = Instant::now();
        if !remaining.is_empty() {
            let list: Vec<usize> = remaining.into_iter().collect();
            groups.push(ColGroup::Uncompressed(UncGroup::from_transposed(
                &transposed,
                list,
            )));
        }
        drop(transposed);

        let uncompressed_mem = block.estimate_size_in_memory();
        self.groups = Some(groups);
        self.block = None;
        stats.size = self.estimate_compressed_size_in_memory();
        stats.ratio = uncompressed_mem as f64 / stats.size.max(1) as f64;
        stats.time_phase4 = phase.elapsed().as_secs_f64();
        debug!("--compression phase 4 (cleanup): {:.3}s", stats.time_phase4);
        debug!("--num col groups: {}", self.col_groups().len());
        debug!("--compressed size: {}", stats.size);
        debug!("--compression ratio: {:.2}", stats.ratio);
        self.stats = Some(stats);
        Ok(())
    }

    /// Decompress into a fresh uncompressed block with `k` threads.
    pub fn decompress(&self, k: usize) -> Result<MatrixBlock> {
        let groups = match (&self.groups, &self.block) {
            (Some(g), _) => g,
            (None, Some(b)) => return Ok(b.clone()),
            (None, None) => {
                return Err(ZipError::InvariantViolation("empty matrix state".into()))
            }
        };

        if self.rows == 0 || self.cols == 0 {
            return Ok(if self.sparse {
                MatrixBlock::new_sparse(self.rows, self.cols)
            } else {
                MatrixBlock::new_dense(self.rows, self.cols)
            });
        }

        let timer = Instant::now();
        let blklen = row_block_len(self.rows, k);
        let pool = make_pool(k)?;
        let nblocks = self.rows.div_ceil(blklen.max(1)).max(1);

        let mut ret = if self.sparse {
            let mut ret = MatrixBlock::new_sparse(self.rows, self.cols);
            let row_parts: Vec<Vec<SparseRow>> = {
                let decompress_range = |bi: usize| -> Vec<SparseRow> {
                    let rl = bi * blklen;
                    let ru = (rl + blklen).min(self.rows);
                    let mut rnnz = vec![0usize; ru - rl];
                    for g in groups {
                        g.count_nonzeros_per_row(&mut rnnz, rl, ru);
                    }
                    let mut rows: Vec<SparseRow> = rnnz
                        .iter()
                        .map(|&n| SparseRow {
                            idx: Vec::with_capacity(n),
                            val: Vec::with_capacity(n),
                        })
                        .collect();
                    for g in groups {
                        g.decompress_sparse(&mut rows, rl, ru);
                    }
                    // groups append out of column order
                    for row in &mut rows {
                        row.sort();
                    }
                    rows
                };
                match &pool {
                    Some(p) => p.install(|| {
                        (0..nblocks).into_par_iter().map(decompress_range).collect()
                    }),
                    None => (0..nblocks).map(decompress_range).collect(),
                }
            };
            if let Some(dst) = ret.sparse_mut() {
                let mut r = 0;
                for part in row_parts {
                    for row in part {
                        dst[r] = row;
                        r += 1;
                    }
                }
            }
            ret
        } else {
            let mut data = vec![0.0; self.rows * self.cols];
            let stride = self.cols;
            match &pool {
                Some(p) => p.install(|| {
                    data.par_chunks_mut(blklen * stride)
                        .enumerate()
                        .for_each(|(bi, chunk)| {
                            let rl = bi * blklen;
                            let ru = (rl + blklen).min(self.rows);
                            for g in groups {
                                g.decompress_dense(chunk, stride, rl, ru);
                            }
                        })
                }),
                None => {
                    for g in groups {
                        g.decompress_dense(&mut data, stride, 0, self.rows);
                    }
                }
            }
            MatrixBlock::from_raw_dense(self.rows, self.cols, data)
        };
        ret.nnz = self.nnz;
        debug!(
            "decompressed block w/ k={k} in {:.3}s",
            timer.elapsed().as_secs_f64()
        );
        Ok(ret)
    }

    fn vector_slice<'a>(v: &'a Array1<f64>, buf: &'a mut Vec<f64>) -> &'a [f64] {
        match v.as_slice() {
            Some(s) => s,
            None => {
                *buf = v.to_vec();
                buf
            }
        }
    }

    /// Right matrix-vector multiply `A * v`, `v` of length `C`.
    pub fn right_mult_by_vector(&self, v: &Array1<f64>, k: usize) -> Result<Array1<f64>> {
        if v.len() != self.cols {
            return Err(ZipError::InvariantViolation(format!(
                "vector length {} does not match {} columns",
                v.len(),
                self.cols
            )));
        }
        let mut buf = Vec::new();
        let vs = Self::vector_slice(v, &mut buf);

        if let Some(block) = &self.block {
            let mut out = vec![0.0; self.rows];
            block.right_mult(vs, &mut out, 0, self.rows);
            return Ok(Array1::from(out));
        }
        let groups = self.groups()?;

        let mut out = vec![0.0; self.rows];
        let run_range = |out: &mut [f64], rl: usize, ru: usize| {
            // uncompressed groups first, then the additive bitmap groups
            for g in groups.iter().filter(|g| g.is_uncompressed()) {
                g.right_mult(vs, out, rl, ru);
            }
            for g in groups.iter().filter(|g| !g.is_uncompressed()) {
                g.right_mult(vs, out, rl, ru);
            }
        };
        match make_pool(k)? {
            Some(p) => {
                let blklen = row_block_len(self.rows, k);
                p.install(|| {
                    out.par_chunks_mut(blklen).enumerate().for_each(|(bi, chunk)| {
                        let rl = bi * blklen;
                        let ru = (rl + blklen).min(self.rows);
                        run_range(chunk, rl, ru);
                    })
                });
            }
            None => run_range(&mut out, 0, self.rows),
        }
        Ok(Array1::from(out))
    }

    /// Left transposed matrix-vector multiply `t(v) * A`, `v` of length `R`.
    pub fn left_mult_by_vector_transpose(&self, v: &Array1<f64>, k: usize) -> Result<Array1<f64>> {
        if v.len() != self.rows {
            return Err(ZipError::InvariantViolation(format!(
                "vector length {} does not match {} rows",
                v.len(),
                self.rows
            )));
        }
        let mut buf = Vec::new();
        let vs = Self::vector_slice(v, &mut buf);

        if let Some(block) = &self.block {
            let mut out = vec![0.0; self.cols];
            block.left_mult(vs, &mut out);
            return Ok(Array1::from(out));
        }
        let groups = self.groups()?;

        let mut out = vec![0.0; self.cols];
        match make_pool(k)? {
            Some(p) => {
                // one task per group; groups own disjoint column sets, so
                // summing the per-task buffers is a scatter, not a race
                let partials: Vec<Vec<f64>> = p.install(|| {
                    groups
                        .par_iter()
                        .map(|g| {
                            let mut local = vec![0.0; self.cols];
                            g.left_mult(vs, &mut local);
                            local
                        })
                        .collect()
                });
                for part in partials {
                    for (o, x) in out.iter_mut().zip(part) {
                        *o += x;
                    }
                }
            }
            None => {
                for g in groups {
                    g.left_mult(vs, &mut out);
                }
            }
        }
        Ok(Array1::from(out))
    }

    /// Matrix-multiply chain `t(X) * (w * (X * v))`.
    pub fn chain_mult(
        &self,
        v: &Array1<f64>,
        w: Option<&Array1<f64>>,
        ctype: ChainType,
        k: usize,
    ) -> Result<Array1<f64>> {
        if v.len() != self.cols {
            return Err(ZipError::InvariantViolation(format!(
                "vector length {} does not match {} columns",
                v.len(),
                self.cols
            )));
        }
        if self.is_compressed() && self.nnz == 0 {
            return Ok(Array1::zeros(self.cols));
        }
        let mut t = self.right_mult_by_vector(v, k)?;
        if ctype == ChainType::XtwXv {
            let w = w.ok_or_else(|| {
                ZipError::InvariantViolation("XtwXv chain requires a weight vector".into())
            })?;
            if w.len() != self.rows {
                return Err(ZipError::InvariantViolation(format!(
                    "weight length {} does not match {} rows",
                    w.len(),
                    self.rows
                )));
            }
            t.zip_mut_with(w, |a, &b| *a *= b);
        }
        self.left_mult_by_vector_transpose(&t, k)
    }

    /// Transpose-self matrix multiply `t(X) * X`. The right-side variant is
    /// not supported on the compressed form.
    pub fn transpose_self_mult(&self, side: TsmmSide, k: usize) -> Result<Array2<f64>> {
        if side == TsmmSide::Right {
            return Err(ZipError::Unsupported(
                "right transpose-self multiply on compressed block".into(),
            ));
        }
        if let Some(block) = &self.block {
            let d = block.to_dense();
            return Ok(d.t().dot(&d));
        }
        let groups = self.groups()?;
        if let [ColGroup::Uncompressed(g)] = groups {
            let d = g.data().to_dense();
            return Ok(d.t().dot(&d));
        }
        if self.nnz == 0 {
            return Ok(Array2::zeros((self.cols, self.cols)));
        }

        let timer = Instant::now();
        let n_groups = groups.len();
        let cols = self.cols;
        let rows = self.rows;
        let partials_range = |gl: usize, gu: usize| -> Vec<(usize, usize, Vec<f64>)> {
            let mut out = Vec::new();
            for gi in gl..gu {
                let g = &groups[gi];
                for (j, &col) in g.cols().iter().enumerate() {
                    // decompress one column, multiply against the group tail
                    let lhs = g.decompress_col(j);
                    if lhs.iter().all(|&x| x == 0.0) {
                        continue;
                    }
                    debug_assert_eq!(lhs.len(), rows);
                    let mut partial = vec![0.0; cols];
                    for gg in &groups[gi..] {
                        gg.left_mult(&lhs, &mut partial);
                    }
                    out.push((gi, col, partial));
                }
            }
            out
        };

        let partials: Vec<(usize, usize, Vec<f64>)> = match make_pool(k)? {
            Some(p) => {
                let blklen = n_groups.div_ceil(2 * k).max(1);
                let ranges: Vec<(usize, usize)> = (0..n_groups)
                    .step_by(blklen)
                    .map(|gl| (gl, (gl + blklen).min(n_groups)))
                    .collect();
                p.install(|| {
                    ranges
                        .par_iter()
                        .flat_map_iter(|&(gl, gu)| partials_range(gl, gu))
                        .collect()
                })
            }
            None => partials_range(0, n_groups),
        };

        // scatter with mirroring; each output cell is written exactly once
        let mut out = Array2::zeros((cols, cols));
        for (gi, r, partial) in partials {
            for (gj, g) in groups.iter().enumerate().skip(gi) {
                for &c in g.cols() {
                    if gj == gi && c < r {
                        continue;
                    }
                    let v = partial[c];
                    if v != 0.0 {
                        out[[r, c]] = v;
                        out[[c, r]] = v;
                    }
                }
            }
        }
        debug!("compressed tsmm k={k} in {:.3}s", timer.elapsed().as_secs_f64());
        Ok(out)
    }

    /// Unary aggregate over the compressed form. Output shape is `1 x 1`
    /// for [`ReduceDir::All`], `R x 1` for [`ReduceDir::Row`], and `1 x C`
    /// for [`ReduceDir::Col`].
    pub fn unary_aggregate(&self, op: AggOp, dir: ReduceDir, k: usize) -> Result<Array2<f64>> {
        if let Some(block) = &self.block {
            return Ok(block.unary_aggregate(op, dir));
        }
        let groups = self.groups()?;
        if let [ColGroup::Uncompressed(g)] = groups {
            if g.cols().len() == self.cols {
                return Ok(g.data().unary_aggregate(op, dir));
            }
        }

        let par = k > 1 && self.exact_size_on_disk() > MIN_PAR_AGG_THRESHOLD;
        match dir {
            ReduceDir::All => {
                let acc = if par {
                    let parts = partition_groups(groups.len(), k);
                    let partials: Vec<f64> = match make_pool(k)? {
                        Some(p) => p.install(|| {
                            parts
                                .par_iter()
                                .map(|idxs| {
                                    let mut a = op.init();
                                    for &gi in idxs {
                                        a = op.combine(a, groups[gi].agg_all(op));
                                    }
                                    a
                                })
                                .collect()
                        }),
                        None => Vec::new(),
                    };
                    partials.into_iter().fold(op.init(), |a, b| op.combine(a, b))
                } else {
                    let mut a = op.init();
                    for g in groups.iter().filter(|g| g.is_uncompressed()) {
                        a = op.combine(a, g.agg_all(op));
                    }
                    for g in groups.iter().filter(|g| !g.is_uncompressed()) {
                        a = op.combine(a, g.agg_all(op));
                    }
                    a
                };
                let mut out = Array2::zeros((1, 1));
                out[(0, 0)] = acc;
                Ok(out)
            }
            ReduceDir::Row => {
                let mut acc = vec![op.init(); self.rows];
                let run_range = |acc: &mut [f64], rl: usize, ru: usize| {
                    for g in groups.iter().filter(|g| g.is_uncompressed()) {
                        g.agg_rows(op, acc, rl, ru);
                    }
                    for g in groups.iter().filter(|g| !g.is_uncompressed()) {
                        g.agg_rows(op, acc, rl, ru);
                    }
                };
                if par {
                    if let Some(p) = make_pool(k)? {
                        let blklen = row_block_len(self.rows, k);
                        p.install(|| {
                            acc.par_chunks_mut(blklen).enumerate().for_each(|(bi, chunk)| {
                                let rl = bi * blklen;
                                let ru = (rl + blklen).min(self.rows);
                                run_range(chunk, rl, ru);
                            })
                        });
                    }
                } else {
                    run_range(&mut acc, 0, self.rows);
                }
                // rows not fully covered by stored cells meet an implicit
                // zero in min/max reductions
                if !op.is_sum() {
                    let mut rnnz = vec![0usize; self.rows];
                    for g in groups {
                        g.count_nonzeros_per_row(&mut rnnz, 0, self.rows);
                    }
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
                Ok(out)
            }
            ReduceDir::Col => {
                let mut acc = vec![op.init(); self.cols];
                if par {
                    let parts = partition_groups(groups.len(), k);
                    let partials: Vec<Vec<f64>> = match make_pool(k)? {
                        Some(p) => p.install(|| {
                            parts
                                .par_iter()
                                .map(|idxs| {
                                    let mut local = vec![op.init(); self.cols];
                                    for &gi in idxs {
                                        groups[gi].agg_cols(op, &mut local);
                                    }
                                    local
                                })
                                .collect()
                        }),
                        None => Vec::new(),
                    };
                    for part in partials {
                        for (o, x) in acc.iter_mut().zip(part) {
                            *o = op.combine(*o, x);
                        }
                    }
                } else {
                    for g in groups.iter().filter(|g| g.is_uncompressed()) {
                        g.agg_cols(op, &mut acc);
                    }
                    for g in groups.iter().filter(|g| !g.is_uncompressed()) {
                        g.agg_cols(op, &mut acc);
                    }
                }
                let mut out = Array2::zeros((1, self.cols));
                for (c, a) in acc.into_iter().enumerate() {
                    out[(0, c)] = a;
                }
                Ok(out)
            }
        }
    }

    /// Apply a scalar operation, keeping groups compressed where the op
    /// allows a metadata-only rewrite. `nnz` is conservatively `R * C`
    /// when the op may populate implicit zeros.
    pub fn scalar_op(&self, op: ScalarOp) -> Result<CompressedMatrix> {
        if let Some(block) = &self.block {
            return Ok(CompressedMatrix::from_block(block.apply_scalar(op)));
        }
        let groups = self.groups()?;
        let new_groups: Vec<ColGroup> = groups.iter().map(|g| g.scalar_op(op)).collect();
        let nnz = if op.preserves_zero() {
            self.nnz
        } else {
            self.rows * self.cols
        };
        Ok(CompressedMatrix::from_parts(
            self.rows, self.cols, nnz, self.sparse, new_groups,
        ))
    }

    /// Column-append `other` to the right of this matrix. Groups are
    /// reused with shifted column indices; no re-co-coding happens.
    pub fn cbind(&self, other: &CompressedMatrix, k: usize) -> Result<CompressedMatrix> {
        if self.rows != other.rows {
            return Err(ZipError::InvariantViolation(format!(
                "cbind row mismatch: {} vs {}",
                self.rows, other.rows
            )));
        }
        let mut groups = self.groups()?.to_vec();
        let other_groups: Vec<ColGroup> = match &other.groups {
            Some(gs) => gs.clone(),
            None => {
                let mut tmp = other.clone();
                tmp.compress(k)?;
                tmp.groups.unwrap_or_default()
            }
        };
        for mut g in other_groups {
            g.shift_cols(self.cols);
            groups.push(g);
        }
        Ok(CompressedMatrix::from_parts(
            self.rows,
            self.cols + other.cols,
            self.nnz + other.nnz,
            self.sparse,
            groups,
        ))
    }

    /// Matrix-vector entry point dispatching on operand orientation:
    /// `C x 1` multiplies on the right, `1 x R` on the left. Anything else
    /// is an unsupported matrix-matrix multiply.
    pub fn mult(&self, rhs: &MatrixBlock, k: usize) -> Result<MatrixBlock> {
        if rhs.cols() == 1 && rhs.rows() == self.cols {
            let v = Array1::from(rhs.col_vector(0));
            let out = self.right_mult_by_vector(&v, k)?;
            let data: Vec<f64> = out.to_vec();
            return Ok(MatrixBlock::from_raw_dense(self.rows, 1, data));
        }
        if rhs.rows() == 1 && rhs.cols() == self.rows {
            let v = Array1::from(rhs.row_vector(0));
            let out = self.left_mult_by_vector_transpose(&v, k)?;
            let data: Vec<f64> = out.to_vec();
            return Ok(MatrixBlock::from_raw_dense(1, self.cols, data));
        }
        Err(ZipError::Unsupported(
            "matrix-matrix multiplication over compressed block".into(),
        ))
    }

    fn decompress_for(&self, operation: &str) -> Result<MatrixBlock> {
        if self.is_compressed() {
            warn!("operation '{operation}' not supported on compressed block - decompressing");
        }
        self.decompress(1)
    }

    /// Transpose; decompresses and delegates to the block engine.
    pub fn transpose(&self) -> Result<MatrixBlock> {
        Ok(self.decompress_for("transpose")?.transpose())
    }

    /// Row slice `[rl, ru)`; decompresses and delegates.
    pub fn slice_rows(&self, rl: usize, ru: usize) -> Result<MatrixBlock> {
        self.decompress_for("slice")?.slice_rows(rl, ru)
    }

    /// Row-append; decompresses both sides and delegates.
    pub fn rbind(&self, other: &CompressedMatrix) -> Result<MatrixBlock> {
        let left = self.decompress_for("rbind")?;
        let right = other.decompress(1)?;
        left.rbind(&right)
    }

    /// Replace cells equal to `pattern`; decompresses and delegates.
    pub fn replace(&self, pattern: f64, replacement: f64) -> Result<MatrixBlock> {
        Ok(self.decompress_for("replace")?.replace(pattern, replacement))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gen_rand::{random_low_card_mat, random_sparse_mat, random_uniform_mat};
    use approx::assert_abs_diff_eq;
    use ndarray::{concatenate, Array2, ArrayView, Axis, Dimension};
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    fn assert_close<D: Dimension>(a: ArrayView<f64, D>, b: ArrayView<f64, D>) {
        let rtol = 1e-9;
        let atol = 1e-12;
        for (x, y) in a.iter().zip(b.iter()) {
            let tol = atol + rtol * y.abs();
            assert!(
                (x - y).abs() <= tol,
                "values differ beyond tolerance: {x} vs {y}"
            );
        }
    }

    fn compress_block(blk: MatrixBlock, k: usize) -> CompressedMatrix {
        let mut cm = CompressedMatrix::from_block(blk);
        cm.compress(k).unwrap();
        cm
    }

    fn assert_group_invariants(cm: &CompressedMatrix) {
        let mut cols: Vec<usize> = cm
            .col_groups()
            .iter()
            .flat_map(|g| g.cols().iter().copied())
            .collect();
        cols.sort_unstable();
        assert_eq!(cols, (0..cm.cols()).collect::<Vec<_>>());
        for g in cm.col_groups() {
            assert!(g.cols().windows(2).all(|w| w[0] < w[1]));
        }
        let group_nnz: usize = cm.col_groups().iter().map(ColGroup::nnz).sum();
        assert_eq!(group_nnz, cm.nnz());
    }

    /// Low-cardinality columns compress into a single co-coded group and
    /// decompress bit-identically.
    #[test]
    fn low_cardinality_roundtrip() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 10_000, 5, 3);
        let dense = blk.to_dense();
        let true_nnz = blk.nnz();

        let cm = compress_block(blk, 1);
        assert!(cm.is_compressed());
        assert_eq!(cm.nnz(), true_nnz);
        assert_eq!(cm.col_groups().len(), 1);
        assert!(cm.col_groups().iter().all(|g| !g.is_uncompressed()));
        assert_group_invariants(&cm);

        assert_eq!(cm.decompress(1).unwrap().to_dense(), dense);
        assert!(cm.compression_stats().is_some());
    }

    /// Continuous columns do not pay for compression; everything lands in
    /// one uncompressed group.
    #[test]
    fn dense_continuous_stays_uncompressed() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_uniform_mat(&mut rng, 1000, 10);
        let dense = blk.to_dense();

        let cm = compress_block(blk, 1);
        assert!(cm.is_single_uncompressed_group());
        assert_group_invariants(&cm);
        assert_eq!(cm.decompress(1).unwrap().to_dense(), dense);
    }

    #[test]
    fn sparse_input_roundtrip() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        // low-cardinality sparse block: columns compress
        let blk = random_sparse_mat(&mut rng, 600, 4, 0.1, 4);
        let dense = blk.to_dense();
        let cm = compress_block(blk, 1);
        assert!(cm.col_groups().iter().any(|g| !g.is_uncompressed()));
        assert_group_invariants(&cm);
        let out = cm.decompress(1).unwrap();
        assert!(out.is_sparse());
        assert_eq!(out.to_dense(), dense);

        // continuous sparse block: stays uncompressed, sparse layout kept
        let blk = {
            let mut blk = MatrixBlock::new_sparse(600, 4);
            for r in 0..600 {
                for c in 0..4 {
                    if rng.gen_bool(0.1) {
                        blk.set(r, c, rng.gen_range(0.0..1.0));
                    }
                }
            }
            blk.recompute_nonzeros();
            blk
        };
        let dense = blk.to_dense();
        let cm = compress_block(blk, 1);
        assert!(cm.is_single_uncompressed_group());
        assert_eq!(cm.decompress(1).unwrap().to_dense(), dense);
    }

    /// Right matrix-vector multiply with an all-ones vector is the row-sum
    /// vector; threaded variants agree with the sequential result.
    #[test]
    fn right_mult_matches_row_sums() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 10_000, 5, 3);
        let dense = blk.to_dense();
        let cm = compress_block(blk, 1);

        let v = Array1::from(vec![1.0; 5]);
        let expect = dense.dot(&v);
        let base = cm.right_mult_by_vector(&v, 1).unwrap();
        assert_close(base.view(), expect.view());
        for k in [2, 4, 8] {
            assert_eq!(cm.right_mult_by_vector(&v, k).unwrap(), base);
        }
    }

    /// Left multiply by a one-hot vector picks out a matrix row.
    #[test]
    fn left_mult_one_hot_selects_row() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 10_000, 5, 3);
        let dense = blk.to_dense();
        let cm = compress_block(blk, 1);

        let mut v = Array1::zeros(10_000);
        v[42] = 1.0;
        let expect = dense.row(42).to_owned();
        let base = cm.left_mult_by_vector_transpose(&v, 1).unwrap();
        assert_close(base.view(), expect.view());
        for k in [2, 4, 8] {
            assert_eq!(cm.left_mult_by_vector_transpose(&v, k).unwrap(), base);
        }
    }

    /// Unary aggregates over the compressed form match dense references;
    /// min exercises the implicit-zero handling.
    #[test]
    fn unary_aggregates_match_dense() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 10_000, 5, 3);
        let dense = blk.to_dense();
        let cm = compress_block(blk, 1);

        let sum = cm.unary_aggregate(AggOp::Sum, ReduceDir::All, 1).unwrap();
        assert_abs_diff_eq!(sum[(0, 0)], dense.sum(), epsilon = 1e-6);

        let sumsq = cm.unary_aggregate(AggOp::SumSq, ReduceDir::All, 1).unwrap();
        assert_abs_diff_eq!(
            sumsq[(0, 0)],
            dense.iter().map(|v| v * v).sum::<f64>(),
            epsilon = 1e-6
        );

        let min = cm.unary_aggregate(AggOp::Min, ReduceDir::All, 1).unwrap();
        assert_eq!(min[(0, 0)], 0.0);
        let max = cm.unary_aggregate(AggOp::Max, ReduceDir::All, 1).unwrap();
        assert_eq!(max[(0, 0)], 2.0);

        let row_sums = cm.unary_aggregate(AggOp::Sum, ReduceDir::Row, 1).unwrap();
        let expect = dense.sum_axis(Axis(1));
        for r in 0..dense.nrows() {
            assert_abs_diff_eq!(row_sums[(r, 0)], expect[r], epsilon = 1e-9);
        }

        let col_sums = cm.unary_aggregate(AggOp::Sum, ReduceDir::Col, 1).unwrap();
        let expect = dense.sum_axis(Axis(0));
        for c in 0..dense.ncols() {
            assert_abs_diff_eq!(col_sums[(0, c)], expect[c], epsilon = 1e-9);
        }

        let row_min = cm.unary_aggregate(AggOp::Min, ReduceDir::Row, 1).unwrap();
        let col_max = cm.unary_aggregate(AggOp::Max, ReduceDir::Col, 1).unwrap();
        for r in 0..dense.nrows() {
            assert_eq!(row_min[(r, 0)], dense.row(r).fold(f64::INFINITY, |a, &b| a.min(b)));
        }
        for c in 0..dense.ncols() {
            assert_eq!(
                col_max[(0, c)],
                dense.column(c).fold(f64::NEG_INFINITY, |a, &b| a.max(b))
            );
        }

        // threaded results match the sequential ones
        for k in [2, 4, 8] {
            for op in [AggOp::Sum, AggOp::Min, AggOp::Max] {
                for dir in [ReduceDir::All, ReduceDir::Row, ReduceDir::Col] {
                    assert_eq!(
                        cm.unary_aggregate(op, dir, k).unwrap(),
                        cm.unary_aggregate(op, dir, 1).unwrap()
                    );
                }
            }
        }
    }

    /// Write, read back, and compare both structurally and by behavior.
    #[test]
    fn serialization_roundtrip() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 10_000, 5, 3);
        let dense = blk.to_dense();
        let cm = compress_block(blk, 1);

        let mut buf = Vec::new();
        cm.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, cm.exact_size_on_disk());

        let back = CompressedMatrix::read(&mut buf.as_slice()).unwrap();
        assert_eq!(back.rows(), cm.rows());
        assert_eq!(back.cols(), cm.cols());
        assert_eq!(back.nnz(), cm.nnz());
        assert_eq!(back.col_groups(), cm.col_groups());
        assert_eq!(back.decompress(1).unwrap().to_dense(), dense);

        let v = Array1::from(vec![1.0; 5]);
        assert_eq!(
            back.right_mult_by_vector(&v, 1).unwrap(),
            cm.right_mult_by_vector(&v, 1).unwrap()
        );

        // uncompressed matrices serialize through the block format
        let plain = CompressedMatrix::from_block(MatrixBlock::from_dense(dense.view()));
        let mut buf = Vec::new();
        plain.write(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, plain.exact_size_on_disk());
        let back = CompressedMatrix::read(&mut buf.as_slice()).unwrap();
        assert!(!back.is_compressed());
        assert_eq!(back.decompress(1).unwrap().to_dense(), dense);
    }

    /// A column that ruins the joint bitmap gets dropped by refinement and
    /// ends up in the uncompressed group.
    #[test]
    fn refinement_drops_worst_column() {
        let mut arr = Array2::zeros((2000, 3));
        for r in 0..2000 {
            let v = if r % 2 == 0 { 1.0 } else { 2.0 };
            arr[(r, 0)] = v;
            arr[(r, 1)] = v;
            arr[(r, 2)] = (r + 1) as f64;
        }
        let blk = MatrixBlock::from_dense(arr.view());
        let transposed = blk.transpose();

        let mut ratios = HashMap::new();
        ratios.insert(0usize, 10.0);
        ratios.insert(1usize, 10.0);
        ratios.insert(2usize, 0.1);
        let g = compress_col_group(&transposed, 2000, 1.0, &ratios, vec![0, 1, 2]).unwrap();
        assert_eq!(g.cols(), &[0, 1]);

        // end to end: the hostile column lands uncompressed
        let cm = compress_block(blk, 1);
        assert_group_invariants(&cm);
        let owner = cm
            .col_groups()
            .iter()
            .find(|g| g.cols().contains(&2))
            .unwrap();
        assert!(owner.is_uncompressed());
        let owner01 = cm
            .col_groups()
            .iter()
            .find(|g| g.cols().contains(&0))
            .unwrap();
        assert!(!owner01.is_uncompressed());
        assert_eq!(cm.decompress(1).unwrap().to_dense(), arr);
    }

    /// A refinement chain that empties the group returns its columns to
    /// the uncompressed pool.
    #[test]
    fn refinement_can_exhaust_group() {
        let mut arr = Array2::zeros((500, 2));
        for r in 0..500 {
            arr[(r, 0)] = (r + 1) as f64;
            arr[(r, 1)] = (2 * r + 1) as f64;
        }
        let transposed = MatrixBlock::from_dense(arr.view()).transpose();
        let mut ratios = HashMap::new();
        ratios.insert(0usize, 0.5);
        ratios.insert(1usize, 0.4);
        assert!(compress_col_group(&transposed, 500, 1.0, &ratios, vec![0, 1]).is_none());
    }

    /// Transpose-self multiply against a dense reference, all thread counts.
    #[test]
    fn parallel_tsmm_matches_dense() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 4096, 32, 3);
        let dense = blk.to_dense();
        let cm = compress_block(blk, 1);
        assert_group_invariants(&cm);

        let expect = dense.t().dot(&dense);
        for k in [1, 2, 4, 8] {
            let got = cm.transpose_self_mult(TsmmSide::Left, k).unwrap();
            assert_close(got.view(), expect.view());
        }

        assert!(matches!(
            cm.transpose_self_mult(TsmmSide::Right, 1),
            Err(ZipError::Unsupported(_))
        ));
    }

    /// Matrices wider than one segment exercise the skip tables and the
    /// segment-aligned parallel row partitioning.
    #[test]
    fn multi_segment_matrix() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let rows = BITMAP_BLOCK_SZ + 4096;
        let blk = random_low_card_mat(&mut rng, rows, 2, 3);
        let dense = blk.to_dense();
        let cm = compress_block(blk, 2);
        assert_group_invariants(&cm);

        assert_eq!(cm.decompress(2).unwrap().to_dense(), dense);

        for r in [0, BITMAP_BLOCK_SZ - 1, BITMAP_BLOCK_SZ, rows - 1] {
            assert_eq!(cm.get(r, 0), dense[(r, 0)]);
            assert_eq!(cm.get(r, 1), dense[(r, 1)]);
        }

        let v = Array1::from(vec![1.0, -2.0]);
        let expect = dense.dot(&v);
        let base = cm.right_mult_by_vector(&v, 1).unwrap();
        assert_close(base.view(), expect.view());
        assert_eq!(cm.right_mult_by_vector(&v, 2).unwrap(), base);
        assert_eq!(cm.right_mult_by_vector(&v, 4).unwrap(), base);
    }

    #[test]
    fn chain_mult_matches_dense() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 3000, 6, 4);
        let dense = blk.to_dense();
        let cm = compress_block(blk, 1);

        let v = Array1::from_shape_fn(6, |_| rng.gen_range(-1.0..1.0));
        let w = Array1::from_shape_fn(3000, |_| rng.gen_range(0.0..1.0));

        let t = dense.dot(&v);
        let expect_xtxv = dense.t().dot(&t);
        let got = cm.chain_mult(&v, None, ChainType::XtXv, 1).unwrap();
        assert_close(got.view(), expect_xtxv.view());

        let expect_xtwxv = dense.t().dot(&(&t * &w));
        let base = cm.chain_mult(&v, Some(&w), ChainType::XtwXv, 1).unwrap();
        assert_close(base.view(), expect_xtwxv.view());
        for k in [2, 4] {
            assert_eq!(cm.chain_mult(&v, Some(&w), ChainType::XtwXv, k).unwrap(), base);
        }

        assert!(matches!(
            cm.chain_mult(&v, None, ChainType::XtwXv, 1),
            Err(ZipError::InvariantViolation(_))
        ));
    }

    /// Encoding choice follows the exact bitmap sizes: long runs pick RLE,
    /// scattered offsets pick OLE.
    #[test]
    fn encoding_choice_follows_sizes() {
        // two long runs
        let mut run_heavy = Array2::zeros((1000, 1));
        for r in 0..1000 {
            run_heavy[(r, 0)] = if r < 500 { 1.0 } else { 2.0 };
        }
        let cm = compress_block(MatrixBlock::from_dense(run_heavy.view()), 1);
        assert!(matches!(cm.col_groups(), [ColGroup::Rle(_)]));

        // alternating values: runs of length one, offsets win
        let alternating = Array2::from_shape_fn((1000, 1), |(r, _)| (1 + r % 2) as f64);
        let cm = compress_block(MatrixBlock::from_dense(alternating.view()), 1);
        assert!(matches!(cm.col_groups(), [ColGroup::Ole(_)]));
    }

    #[test]
    fn scalar_ops_on_compressed_form() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 500, 4, 3);
        let dense = blk.to_dense();
        let nnz = blk.nnz();
        let cm = compress_block(blk, 1);

        // zero-preserving op rewrites tuple metadata only
        let doubled = cm.scalar_op(ScalarOp::Mult(2.0)).unwrap();
        assert!(doubled.col_groups().iter().all(|g| !g.is_uncompressed()));
        assert_eq!(doubled.nnz(), nnz);
        assert_eq!(doubled.decompress(1).unwrap().to_dense(), &dense * 2.0);

        // zero-breaking op must materialize implicit zeros
        let shifted = cm.scalar_op(ScalarOp::Plus(1.0)).unwrap();
        assert_eq!(shifted.nnz(), 500 * 4);
        assert_eq!(shifted.decompress(1).unwrap().to_dense(), &dense + 1.0);
        assert!(shifted.col_groups().iter().all(|g| g.is_uncompressed()));

        assert_eq!(
            cm.scalar_op(ScalarOp::Minus(0.5)).unwrap().get(3, 2),
            dense[(3, 2)] - 0.5
        );
    }

    #[test]
    fn cbind_shifts_groups() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let a = random_low_card_mat(&mut rng, 300, 3, 3);
        let b = random_low_card_mat(&mut rng, 300, 2, 4);
        let dense_a = a.to_dense();
        let dense_b = b.to_dense();

        let ca = compress_block(a, 1);
        let cb = compress_block(b, 1);
        let both = ca.cbind(&cb, 1).unwrap();
        assert_eq!(both.cols(), 5);
        assert_eq!(both.nnz(), ca.nnz() + cb.nnz());
        assert_group_invariants(&both);

        let expect = concatenate![Axis(1), dense_a, dense_b];
        assert_eq!(both.decompress(1).unwrap().to_dense(), expect);

        // an uncompressed right-hand side is compressed on the fly
        let plain = CompressedMatrix::from_block(MatrixBlock::from_dense(dense_b.view()));
        let both2 = ca.cbind(&plain, 1).unwrap();
        assert_eq!(both2.decompress(1).unwrap().to_dense(), expect);

        let tall = CompressedMatrix::from_block(MatrixBlock::new_dense(301, 2));
        assert!(matches!(
            ca.cbind(&tall, 1),
            Err(ZipError::InvariantViolation(_))
        ));
    }

    #[test]
    fn get_routes_to_owning_group() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let mut arr = Array2::zeros((800, 4));
        for r in 0..800 {
            arr[(r, 0)] = rng.gen_range(0..3) as f64;
            arr[(r, 1)] = rng.gen_range(0..3) as f64;
            arr[(r, 2)] = rng.gen_range(0.0..1.0);
            arr[(r, 3)] = rng.gen_range(0..2) as f64;
        }
        let cm = compress_block(MatrixBlock::from_dense(arr.view()), 1);
        assert_group_invariants(&cm);
        for _ in 0..200 {
            let r = rng.gen_range(0..800);
            let c = rng.gen_range(0..4);
            assert_eq!(cm.get(r, c), arr[(r, c)]);
        }
    }

    #[test]
    fn mult_dispatches_on_orientation() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 400, 3, 3);
        let dense = blk.to_dense();
        let cm = compress_block(blk, 1);

        let v = Array2::from_shape_fn((3, 1), |_| rng.gen_range(-1.0..1.0));
        let right = cm.mult(&MatrixBlock::from_dense(v.view()), 1).unwrap();
        let expect = dense.dot(&v);
        assert_close(right.to_dense().view(), expect.view());

        let u = Array2::from_shape_fn((1, 400), |_| rng.gen_range(-1.0..1.0));
        let left = cm.mult(&MatrixBlock::from_dense(u.view()), 1).unwrap();
        let expect = u.dot(&dense);
        assert_close(left.to_dense().view(), expect.view());

        let m = MatrixBlock::from_dense(Array2::zeros((3, 3)).view());
        assert!(matches!(cm.mult(&m, 1), Err(ZipError::Unsupported(_))));
    }

    /// Unsupported operations decompress and match the block engine.
    #[test]
    fn fallback_operations_match_dense() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 300, 4, 3);
        let dense = blk.to_dense();
        let cm = compress_block(blk, 1);

        assert_eq!(cm.transpose().unwrap().to_dense(), dense.t().to_owned());
        assert_eq!(
            cm.slice_rows(10, 20).unwrap().to_dense(),
            dense.slice(ndarray::s![10..20, ..]).to_owned()
        );
        assert_eq!(
            cm.replace(2.0, 9.0).unwrap().to_dense(),
            dense.mapv(|v| if v == 2.0 { 9.0 } else { v })
        );
        let stacked = cm.rbind(&cm).unwrap();
        assert_eq!(stacked.rows(), 600);
        assert_eq!(
            stacked.to_dense(),
            concatenate![Axis(0), dense, dense]
        );
    }

    #[test]
    fn double_compression_is_rejected() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let mut cm = compress_block(random_low_card_mat(&mut rng, 100, 2, 3), 1);
        assert!(matches!(
            cm.compress(1),
            Err(ZipError::InvariantViolation(_))
        ));
    }

    #[test]
    fn parallel_compression_matches_sequential() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let blk = random_low_card_mat(&mut rng, 5000, 8, 3);
        let dense = blk.to_dense();

        let seq = compress_block(blk.clone(), 1);
        let par = compress_block(blk, 4);
        assert_group_invariants(&par);
        assert_eq!(seq.decompress(1).unwrap().to_dense(), dense);
        assert_eq!(par.decompress(1).unwrap().to_dense(), dense);
        assert_eq!(seq.nnz(), par.nnz());
    }
}
