//! Run-length encoding: per-tuple (gap, run) pairs, segmented like OLE
//!
//! Runs never cross a segment boundary; within a segment the first gap is
//! relative to the segment start and later gaps count zero rows since the
//! end of the previous run. Runs longer than `u16::MAX` continue with
//! zero-gap pairs. The per-tuple skip table maps a segment index to its
//! first pair.

use crate::bitmap::{num_segments, Bitmap, BITMAP_BLOCK_SZ};
use crate::group::{BitmapGroup, BitmapOps};
use crate::vecmath;

/// Run-length encoded column group.
#[derive(Debug, Clone, PartialEq)]
pub struct RleGroup {
    bm: BitmapGroup,
}

impl RleGroup {
    /// Encode an exact bitmap. `cols` must be ascending.
    pub(crate) fn from_bitmap(cols: Vec<usize>, num_rows: usize, bm: &Bitmap) -> RleGroup {
        let nseg = num_segments(num_rows);
        let mut data: Vec<u16> = Vec::new();
        let mut ptr: Vec<usize> = vec![0];
        let mut skip: Vec<u32> = Vec::new();

        for t in 0..bm.num_tuples() {
            let start = *ptr.last().unwrap_or(&0);
            let offs = bm.offsets(t);
            let mut p = 0usize;
            for s in 0..nseg {
                skip.push((data.len() - start) as u32);
                let seg_base = (s * BITMAP_BLOCK_SZ) as u32;
                let seg_end = ((s + 1) * BITMAP_BLOCK_SZ) as u32;
                let mut cursor = seg_base;
                while p < offs.len() && offs[p] < seg_end {
                    let run_start = offs[p];
                    let mut run_end = run_start + 1;
                    p += 1;
                    while p < offs.len() && offs[p] < seg_end && offs[p] == run_end {
                        run_end += 1;
                        p += 1;
                    }
                    let mut gap = run_start - cursor;
                    let mut run = run_end - run_start;
                    // a run spanning a whole segment exceeds u16; continue
                    // it with zero-gap pairs
                    while run > 0 {
                        let chunk = run.min(u16::MAX as u32);
                        data.push(gap as u16);
                        data.push(chunk as u16);
                        gap = 0;
                        run -= chunk;
                    }
                    cursor = run_end;
                }
            }
            skip.push((data.len() - start) as u32);
            ptr.push(data.len());
        }

        RleGroup {
            bm: BitmapGroup {
                cols,
                num_rows,
                values: bm.values().to_vec(),
                ptr,
                data,
                skip,
            },
        }
    }

    /// Wrap already-encoded storage (scalar ops, deserialization).
    pub(crate) fn with_storage(bm: BitmapGroup) -> RleGroup {
        RleGroup { bm }
    }

    /// The shared tuple storage.
    pub fn bm(&self) -> &BitmapGroup {
        &self.bm
    }

    pub(crate) fn bm_mut(&mut self) -> &mut BitmapGroup {
        &mut self.bm
    }

    fn seg_span(&self, rl: usize, ru: usize) -> (usize, usize) {
        if ru <= rl {
            return (0, 0);
        }
        let nseg = self.bm.num_segments();
        (rl / BITMAP_BLOCK_SZ, ((ru - 1) / BITMAP_BLOCK_SZ + 1).min(nseg))
    }

    /// Invoke `f` with each run of tuple `t`, clipped to `[rl, ru)`.
    fn for_each_run(&self, t: usize, rl: usize, ru: usize, f: &mut dyn FnMut(usize, usize)) {
        let (s0, s1) = self.seg_span(rl, ru);
        let d = self.bm.tuple_data(t);
        let sk = self.bm.tuple_skip(t);
        for s in s0..s1 {
            let mut pos = sk[s] as usize;
            let end = sk[s + 1] as usize;
            let mut row = s * BITMAP_BLOCK_SZ;
            while pos < end {
                let gap = d[pos] as usize;
                let run = d[pos + 1] as usize;
                pos += 2;
                row += gap;
                let run_start = row;
                row += run;
                if row <= rl {
                    continue;
                }
                if run_start >= ru {
                    return;
                }
                f(run_start.max(rl), row.min(ru));
            }
        }
    }
}

impl BitmapOps for RleGroup {
    fn bm(&self) -> &BitmapGroup {
        &self.bm
    }

    fn for_each_row(&self, t: usize, rl: usize, ru: usize, f: &mut dyn FnMut(usize)) {
        self.for_each_run(t, rl, ru, &mut |a, b| {
            for row in a..b {
                f(row);
            }
        });
    }

    fn count_range(&self, t: usize, rl: usize, ru: usize) -> usize {
        let mut cnt = 0usize;
        self.for_each_run(t, rl, ru, &mut |a, b| cnt += b - a);
        cnt
    }

    fn scatter_add(&self, t: usize, s: f64, out: &mut [f64], rl: usize, ru: usize) {
        self.for_each_run(t, rl, ru, &mut |a, b| {
            vecmath::add_scalar(&mut out[a - rl..b - rl], s);
        });
    }

    fn contains(&self, t: usize, r: usize) -> bool {
        if r >= self.bm.num_rows {
            return false;
        }
        let mut found = false;
        self.for_each_run(t, r, r + 1, &mut |_, _| found = true);
        found
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bitmap::extract_bitmap;
    use crate::block::MatrixBlock;
    use crate::group;
    use ndarray::Array2;

    fn encode(col: Vec<f64>) -> (RleGroup, Vec<f64>) {
        let n = col.len();
        let arr = Array2::from_shape_vec((n, 1), col.clone()).unwrap();
        let t = MatrixBlock::from_dense(arr.view()).transpose();
        let bm = extract_bitmap(&[0], &t);
        (RleGroup::from_bitmap(vec![0], n, &bm), col)
    }

    #[test]
    fn runs_and_gaps_roundtrip() {
        let col = vec![0.0, 3.0, 3.0, 3.0, 0.0, 0.0, 5.0, 3.0, 3.0, 0.0];
        let (g, col) = encode(col);
        for (r, &v) in col.iter().enumerate() {
            assert_eq!(group::get(&g, r, 0), v);
        }
        // tuple 3 has runs [1,4) and [7,9)
        let three = (0..2).find(|&t| g.bm().tuple_values(t) == [3.0]).unwrap();
        assert_eq!(g.count_range(three, 0, 10), 5);
        assert_eq!(g.count_range(three, 2, 8), 3);
    }

    #[test]
    fn scatter_add_uses_whole_runs() {
        let col = vec![0.0, 2.0, 2.0, 2.0, 2.0, 0.0, 2.0, 2.0];
        let (g, col) = encode(col);
        let mut out = vec![0.0; 5];
        group::right_mult(&g, &[0.5], &mut out, 2, 7);
        let expect: Vec<f64> = col[2..7].iter().map(|v| v * 0.5).collect();
        assert_eq!(out, expect);
    }

    #[test]
    fn runs_split_at_segment_boundaries() {
        let n = BITMAP_BLOCK_SZ + 64;
        // one long run straddling the boundary
        let mut col = vec![0.0; n];
        for v in col.iter_mut().take(BITMAP_BLOCK_SZ + 32).skip(BITMAP_BLOCK_SZ - 32) {
            *v = 9.0;
        }
        let (g, col) = encode(col);
        assert_eq!(g.bm().num_segments(), 2);
        assert_eq!(g.count_range(0, 0, n), 64);

        for r in [
            BITMAP_BLOCK_SZ - 33,
            BITMAP_BLOCK_SZ - 32,
            BITMAP_BLOCK_SZ - 1,
            BITMAP_BLOCK_SZ,
            BITMAP_BLOCK_SZ + 31,
            BITMAP_BLOCK_SZ + 32,
        ] {
            assert_eq!(group::get(&g, r, 0), col[r]);
        }
    }
}
