//! Transient bitmaps: distinct value tuples with sorted row-offset lists
//!
//! A bitmap is the intermediate form between an uncompressed column set and
//! its encoded group. It exists only during compression.

use crate::block::MatrixBlock;
use std::collections::HashMap;

/// Rows per segment. Offsets within a segment fit a `u16`.
pub const BITMAP_BLOCK_SZ: usize = 65536;

/// Number of segments needed to span `num_rows` rows.
pub(crate) fn num_segments(num_rows: usize) -> usize {
    num_rows.div_ceil(BITMAP_BLOCK_SZ)
}

/// Distinct value tuples of a column set, each with the ascending list of
/// row indices at which the tuple occurs. The all-zero tuple is never
/// materialized; uncovered rows are implicitly zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    num_cols: usize,
    values: Vec<f64>,
    offsets: Vec<Vec<u32>>,
}

impl Bitmap {
    /// Number of distinct (non-zero) tuples.
    pub fn num_tuples(&self) -> usize {
        self.offsets.len()
    }

    /// Number of columns per tuple.
    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    /// Values of tuple `t`.
    pub fn tuple(&self, t: usize) -> &[f64] {
        &self.values[t * self.num_cols..(t + 1) * self.num_cols]
    }

    /// All tuple values, flattened tuple-major.
    pub(crate) fn values(&self) -> &[f64] {
        &self.values
    }

    /// Ascending row offsets of tuple `t`.
    pub fn offsets(&self, t: usize) -> &[u32] {
        &self.offsets[t]
    }

    /// Total number of covered rows across all tuples. Tuples never share
    /// a row, so this is also the number of rows with any non-zero entry.
    pub fn num_offsets(&self) -> usize {
        self.offsets.iter().map(Vec::len).sum()
    }

    /// Number of maximal runs of consecutive offsets across all tuples,
    /// counting a run that crosses a segment boundary once per segment.
    pub fn num_runs(&self) -> usize {
        let mut runs = 0usize;
        for offs in &self.offsets {
            let mut prev = u32::MAX;
            for &off in offs {
                if prev == u32::MAX
                    || off != prev + 1
                    || off as usize % BITMAP_BLOCK_SZ == 0
                {
                    runs += 1;
                }
                prev = off;
            }
        }
        runs
    }

    /// Tuples occurring exactly `n` times; used by the sample estimator.
    pub(crate) fn tuples_with_count(&self, n: usize) -> usize {
        self.offsets.iter().filter(|o| o.len() == n).count()
    }
}

/// Extract the exact bitmap of `cols` from a transposed source block
/// (shape `C x R`; row `c` of the source is column `c` of the matrix).
pub(crate) fn extract_bitmap(cols: &[usize], transposed: &MatrixBlock) -> Bitmap {
    let num_rows = transposed.cols();
    if cols.len() == 1 {
        return extract_single(cols[0], transposed);
    }

    // materialize the needed columns once; sparse sources make random
    // per-cell access expensive
    let colvecs: Vec<Vec<f64>> = cols.iter().map(|&c| transposed.row_vector(c)).collect();

    let mut index: HashMap<Vec<u64>, usize> = HashMap::new();
    let mut values: Vec<f64> = Vec::new();
    let mut offsets: Vec<Vec<u32>> = Vec::new();
    let mut key = vec![0u64; cols.len()];

    for r in 0..num_rows {
        let mut all_zero = true;
        for (j, cv) in colvecs.iter().enumerate() {
            let v = cv[r];
            all_zero &= v == 0.0;
            key[j] = v.to_bits();
        }
        if all_zero {
            continue;
        }
        let t = *index.entry(key.clone()).or_insert_with(|| {
            values.extend(key.iter().map(|&b| f64::from_bits(b)));
            offsets.push(Vec::new());
            offsets.len() - 1
        });
        offsets[t].push(r as u32);
    }

    Bitmap {
        num_cols: cols.len(),
        values,
        offsets,
    }
}

/// Extract a bitmap over a sorted row sample. Offsets are positions within
/// `rows`, not absolute row indices; the sample estimator scales from them.
pub(crate) fn extract_bitmap_sample(
    cols: &[usize],
    transposed: &MatrixBlock,
    rows: &[u32],
) -> Bitmap {
    let colvecs: Vec<Vec<f64>> = cols.iter().map(|&c| transposed.row_vector(c)).collect();

    let mut index: HashMap<Vec<u64>, usize> = HashMap::new();
    let mut values: Vec<f64> = Vec::new();
    let mut offsets: Vec<Vec<u32>> = Vec::new();
    let mut key = vec![0u64; cols.len()];

    for (i, &r) in rows.iter().enumerate() {
        let mut all_zero = true;
        for (j, cv) in colvecs.iter().enumerate() {
            let v = cv[r as usize];
            all_zero &= v == 0.0;
            key[j] = v.to_bits();
        }
        if all_zero {
            continue;
        }
        let t = *index.entry(key.clone()).or_insert_with(|| {
            values.extend(key.iter().map(|&b| f64::from_bits(b)));
            offsets.push(Vec::new());
            offsets.len() - 1
        });
        offsets[t].push(i as u32);
    }

    Bitmap {
        num_cols: cols.len(),
        values,
        offsets,
    }
}

/// Single-column fast path: scans the transposed row directly, sparse or
/// dense, without materializing a dense copy first.
fn extract_single(col: usize, transposed: &MatrixBlock) -> Bitmap {
    let mut index: HashMap<u64, usize> = HashMap::new();
    let mut values: Vec<f64> = Vec::new();
    let mut offsets: Vec<Vec<u32>> = Vec::new();

    let mut visit = |r: u32, v: f64| {
        if v == 0.0 {
            return;
        }
        let t = *index.entry(v.to_bits()).or_insert_with(|| {
            values.push(v);
            offsets.push(Vec::new());
            offsets.len() - 1
        });
        offsets[t].push(r);
    };

    if let Some(rows) = transposed.sparse_rows() {
        let row = &rows[col];
        for (p, &r) in row.idx.iter().enumerate() {
            visit(r, row.val[p]);
        }
    } else if let Some(d) = transposed.dense_data() {
        let num_rows = transposed.cols();
        for (r, &v) in d[col * num_rows..(col + 1) * num_rows].iter().enumerate() {
            visit(r as u32, v);
        }
    }

    Bitmap {
        num_cols: 1,
        values,
        offsets,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn single_column() {
        let arr = array![[1.0], [0.0], [2.0], [1.0], [1.0]];
        let t = MatrixBlock::from_dense(arr.view()).transpose();
        let bm = extract_bitmap(&[0], &t);

        assert_eq!(bm.num_tuples(), 2);
        assert_eq!(bm.num_offsets(), 4);
        let one = (0..2).find(|&t| bm.tuple(t) == [1.0]).unwrap();
        assert_eq!(bm.offsets(one), &[0, 3, 4]);
        assert_eq!(bm.num_runs(), 3);
    }

    #[test]
    fn cocoded_columns_share_rows() {
        let arr = array![[1.0, 2.0], [1.0, 2.0], [0.0, 0.0], [1.0, 3.0]];
        let t = MatrixBlock::from_dense(arr.view()).transpose();
        let bm = extract_bitmap(&[0, 1], &t);

        // (1,2) twice, (1,3) once; the zero row is implicit
        assert_eq!(bm.num_tuples(), 2);
        assert_eq!(bm.tuple(0), &[1.0, 2.0]);
        assert_eq!(bm.offsets(0), &[0, 1]);
        assert_eq!(bm.tuple(1), &[1.0, 3.0]);
        assert_eq!(bm.offsets(1), &[3]);
    }

    #[test]
    fn sampled_offsets_are_sample_positions() {
        let arr = array![[5.0], [5.0], [5.0], [7.0], [5.0], [5.0]];
        let t = MatrixBlock::from_dense(arr.view()).transpose();
        let bm = extract_bitmap_sample(&[0], &t, &[0, 3, 5]);

        assert_eq!(bm.num_tuples(), 2);
        let five = (0..2).find(|&t| bm.tuple(t) == [5.0]).unwrap();
        assert_eq!(bm.offsets(five), &[0, 2]);
    }
}
