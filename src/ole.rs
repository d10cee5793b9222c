//! Offset-list encoding: per-tuple row offsets, segmented with skip tables
//!
//! Each tuple's stream holds, for every segment of `BITMAP_BLOCK_SZ` rows,
//! a 16-bit count followed by that many 16-bit offsets relative to the
//! segment start. The per-tuple skip table maps a segment index straight to
//! its header, so row-range kernels touch only the overlapping segments.

use crate::bitmap::{num_segments, Bitmap, BITMAP_BLOCK_SZ};
use crate::group::{BitmapGroup, BitmapOps};

/// Offset-list encoded column group.
#[derive(Debug, Clone, PartialEq)]
pub struct OleGroup {
    bm: BitmapGroup,
}

impl OleGroup {
    /// Encode an exact bitmap. `cols` must be ascending.
    pub(crate) fn from_bitmap(cols: Vec<usize>, num_rows: usize, bm: &Bitmap) -> OleGroup {
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
                let seg_end = ((s + 1) * BITMAP_BLOCK_SZ) as u32;
                let from = p;
                while p < offs.len() && offs[p] < seg_end {
                    p += 1;
                }
                // the stored count is (count mod 2^16); iteration reads the
                // authoritative count from the skip table, so a segment
                // fully occupied by one tuple stays representable
                data.push((p - from) as u16);
                for &off in &offs[from..p] {
                    data.push((off as usize % BITMAP_BLOCK_SZ) as u16);
                }
            }
            skip.push((data.len() - start) as u32);
            ptr.push(data.len());
        }

        OleGroup {
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
    pub(crate) fn with_storage(bm: BitmapGroup) -> OleGroup {
        OleGroup { bm }
    }

    /// The shared tuple storage.
    pub fn bm(&self) -> &BitmapGroup {
        &self.bm
    }

    pub(crate) fn bm_mut(&mut self) -> &mut BitmapGroup {
        &mut self.bm
    }

    /// Offsets of tuple `t` in segment `s`, relative to the segment start.
    fn seg_offsets(&self, t: usize, s: usize) -> &[u16] {
        let d = self.bm.tuple_data(t);
        let sk = self.bm.tuple_skip(t);
        let lo = sk[s] as usize + 1;
        let hi = sk[s + 1] as usize;
        &d[lo..hi]
    }

    fn seg_span(&self, rl: usize, ru: usize) -> (usize, usize) {
        if ru <= rl {
            return (0, 0);
        }
        let nseg = self.bm.num_segments();
        (rl / BITMAP_BLOCK_SZ, ((ru - 1) / BITMAP_BLOCK_SZ + 1).min(nseg))
    }
}

impl BitmapOps for OleGroup {
    fn bm(&self) -> &BitmapGroup {
        &self.bm
    }

    fn for_each_row(&self, t: usize, rl: usize, ru: usize, f: &mut dyn FnMut(usize)) {
        let (s0, s1) = self.seg_span(rl, ru);
        for s in s0..s1 {
            let base = s * BITMAP_BLOCK_SZ;
            for &off in self.seg_offsets(t, s) {
                let row = base + off as usize;
                if row < rl {
                    continue;
                }
                if row >= ru {
                    return;
                }
                f(row);
            }
        }
    }

    fn count_range(&self, t: usize, rl: usize, ru: usize) -> usize {
        let (s0, s1) = self.seg_span(rl, ru);
        let mut cnt = 0usize;
        for s in s0..s1 {
            let base = s * BITMAP_BLOCK_SZ;
            let offs = self.seg_offsets(t, s);
            if base >= rl && base + BITMAP_BLOCK_SZ <= ru {
                cnt += offs.len();
            } else {
                let lo = offs.partition_point(|&o| (base + o as usize) < rl);
                let hi = offs.partition_point(|&o| (base + o as usize) < ru);
                cnt += hi - lo;
            }
        }
        cnt
    }

    fn scatter_add(&self, t: usize, s: f64, out: &mut [f64], rl: usize, ru: usize) {
        let (s0, s1) = self.seg_span(rl, ru);
        for seg in s0..s1 {
            let base = seg * BITMAP_BLOCK_SZ;
            for &off in self.seg_offsets(t, seg) {
                let row = base + off as usize;
                if row < rl {
                    continue;
                }
                if row >= ru {
                    return;
                }
                out[row - rl] += s;
            }
        }
    }

    fn contains(&self, t: usize, r: usize) -> bool {
        if r >= self.bm.num_rows {
            return false;
        }
        let s = r / BITMAP_BLOCK_SZ;
        let off = (r % BITMAP_BLOCK_SZ) as u16;
        self.seg_offsets(t, s).binary_search(&off).is_ok()
    }
}
